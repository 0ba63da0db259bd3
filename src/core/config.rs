use std::env;
use std::path::PathBuf;

pub const DEFAULT_RUNNER: &str = "/proj/ta/bin/runta";
pub const DEFAULT_RUNTEST: &str = "runtest";
pub const DEFAULT_SUBMISSION: &str = "sbatch --exclusive --partition perf";
pub const DEFAULT_ALLOWED_USERS: [&str; 2] = ["qa", "grco"];

/// Suites the perf schedules are known to carry.
pub const SUPPORTED_SUITES: [&str; 5] = [
    "TSVC_2_Single_Kernel_Binary",
    "Snappy",
    "CoreMark",
    "Folly",
    "RAJAPerf_Base_Seq",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Binary that consumes generated schedules (one invocation per test).
    pub runner: String,
    pub runtest: String,
    /// Appended to every runtime command unless the job already sets them.
    pub trailer_flags: Vec<String>,
    /// Submission used for generated sections whose template carries none.
    pub default_submission: String,
    /// Longest compiler/version string written to a generated schedule.
    pub truncate_limit: usize,
    pub allowed_users: Vec<String>,
    pub output_base: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            runner: DEFAULT_RUNNER.to_string(),
            runtest: DEFAULT_RUNTEST.to_string(),
            trailer_flags: vec![
                "ustack".to_string(),
                "cleanenv".to_string(),
                "keep".to_string(),
            ],
            default_submission: DEFAULT_SUBMISSION.to_string(),
            truncate_limit: 45,
            allowed_users: DEFAULT_ALLOWED_USERS.iter().map(|u| u.to_string()).collect(),
            output_base: PathBuf::from("."),
        }
    }
}

impl EngineConfig {
    /// Defaults adjusted by `SNAPTA_RUNNER`, `SNAPTA_RUNTEST`,
    /// `SNAPTA_ALLOWED_USERS` (comma separated) and `HOME`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = EngineConfig::default();

        if let Some(runner) = lookup("SNAPTA_RUNNER").filter(|v| !v.trim().is_empty()) {
            config.runner = runner;
        }
        if let Some(runtest) = lookup("SNAPTA_RUNTEST").filter(|v| !v.trim().is_empty()) {
            config.runtest = runtest;
        }
        if let Some(users) = lookup("SNAPTA_ALLOWED_USERS") {
            let users: Vec<String> = users
                .split(',')
                .map(|user| user.trim().to_string())
                .filter(|user| !user.is_empty())
                .collect();
            if !users.is_empty() {
                config.allowed_users = users;
            }
        }
        if let Some(home) = lookup("HOME").filter(|v| !v.trim().is_empty()) {
            config.output_base = PathBuf::from(home);
        }

        config
    }
}

/// Login name of the invoking user.
pub fn invoking_user() -> String {
    env::var("USER")
        .or_else(|_| env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_defaults() {
        let config = EngineConfig::from_lookup(|key| match key {
            "SNAPTA_RUNNER" => Some("./runta.py".to_string()),
            "SNAPTA_ALLOWED_USERS" => Some("qa, perfbot,,".to_string()),
            "HOME" => Some("/home/qa".to_string()),
            _ => None,
        });

        assert_eq!(config.runner, "./runta.py");
        assert_eq!(config.runtest, DEFAULT_RUNTEST);
        assert_eq!(config.allowed_users, vec!["qa".to_string(), "perfbot".to_string()]);
        assert_eq!(config.output_base, PathBuf::from("/home/qa"));
    }

    #[test]
    fn blank_values_keep_defaults() {
        let config = EngineConfig::from_lookup(|key| match key {
            "SNAPTA_RUNNER" => Some("  ".to_string()),
            "SNAPTA_ALLOWED_USERS" => Some(",".to_string()),
            _ => None,
        });
        assert_eq!(config, EngineConfig::default());
    }
}
