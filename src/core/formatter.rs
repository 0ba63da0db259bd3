use std::path::{Path, PathBuf};

use tracing::warn;

use crate::core::config::EngineConfig;
use crate::core::job::{ResolvedJobSpec, Utility};
use crate::core::schedule::{Header, JobTemplate, Params};
use crate::util::sanitize_name;

pub const RUNNER_SCRIPT_NAME: &str = "snap_perf.sh";
const TEST_PLACEHOLDER: &str = "$(TEST)";

/// Where one generation run writes its files:
/// `<base>/<suite>_<compiler>_<index>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    pub base: PathBuf,
    pub prefix: String,
    pub index: u32,
}

impl OutputLayout {
    pub fn new(base: impl Into<PathBuf>, suite: &str, compiler: &str, index: u32) -> Self {
        OutputLayout {
            base: base.into(),
            prefix: format!("{suite}_{}", sanitize_name(compiler)),
            index,
        }
    }

    pub fn dir_name(&self) -> String {
        format!("{}_{}", self.prefix, self.index)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.base.join(self.dir_name())
    }

    pub fn version_dir(&self, version: &str) -> PathBuf {
        self.output_dir().join(sanitize_name(version))
    }

    pub fn schedule_path(&self) -> PathBuf {
        self.output_dir().join(format!("{}.cfg", self.prefix))
    }

    pub fn script_path(&self) -> PathBuf {
        self.output_dir().join(RUNNER_SCRIPT_NAME)
    }
}

/// Shorten `value` to `limit` characters, ending in `...`.
pub fn truncate_for_database(value: &str, limit: usize) -> String {
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let kept: String = value.chars().take(limit.saturating_sub(3)).collect();
    let truncated = format!("{kept}...");
    warn!(original = value, truncated = %truncated, "string truncated for database");
    truncated
}

pub fn make_command(utility: Option<Utility>, version_dir: &Path, test: &str, tag: &str) -> String {
    match utility {
        Some(Utility::Perf) => {
            let file = format!("{}_{}.perf.data", sanitize_name(test), sanitize_name(tag));
            let output = version_dir.join(file);
            format!("RUN=\"taskset 0x2 perf record -o {}\"", output.display())
        }
        _ => "RUN=\"taskset 0x2\"".to_string(),
    }
}

fn strip_quotes(value: &str) -> &str {
    value.trim_matches(|c| c == '\'' || c == '"')
}

/// Section for one resolved job. `make` is left for the runner to complete
/// with the test name.
pub fn generated_section(
    spec: &ResolvedJobSpec,
    layout: &OutputLayout,
    config: &EngineConfig,
) -> JobTemplate {
    let mut label = format!("{} {} {}", spec.compiler, spec.version, spec.suite);
    if !spec.tag.is_empty() {
        label.push(' ');
        label.push_str(&spec.tag);
    }
    let submission = if spec.submission.is_empty() {
        config.default_submission.as_str()
    } else {
        spec.submission.as_str()
    };
    let header = Header::compose(&label, spec.template.header.sequence(), submission);

    let mut params = Params::new();
    if spec.is_perf() {
        params.insert("perf", "");
    }
    params.insert("ustack", "");
    params.insert("cleanenv", "");
    params.insert("compiler", truncate_for_database(&spec.compiler, config.truncate_limit));
    params.insert("user", spec.user.as_str());
    params.insert("suite", spec.suite.as_str());
    if let Some(jobs) = spec.template.params.get("jobs") {
        params.insert("jobs", jobs);
    }
    params.insert("osversion", spec.osversion.as_str());
    if !spec.env.is_empty() {
        params.insert("env", format!("'{}'", strip_quotes(&spec.env)));
    }
    if !spec.flags.is_empty() {
        params.insert("f", format!("'{}'", strip_quotes(&spec.flags)));
    }
    let make = spec.make.clone().unwrap_or_else(|| {
        make_command(spec.utility, &layout.version_dir(&spec.version), TEST_PLACEHOLDER, &spec.tag)
    });
    params.insert("make", format!("'{make}'"));
    params.insert("version", truncate_for_database(&spec.version, config.truncate_limit));
    if !spec.tag.is_empty() {
        params.insert("tag", spec.tag.as_str());
    }

    JobTemplate::new(header, params)
}

/// The plain runtest invocation for one job and one test.
pub fn dump_command(
    spec: &ResolvedJobSpec,
    test: &str,
    layout: &OutputLayout,
    config: &EngineConfig,
    nosave: bool,
) -> String {
    let mut parts = vec![
        config.runtest.clone(),
        format!("-compiler {}", spec.compiler),
        format!("-version {}", spec.version),
        format!("-user {}", spec.user),
        format!("-suite {}", spec.suite),
        format!("-test {test}"),
    ];
    if !spec.osversion.is_empty() {
        parts.push(format!("-osversion {}", spec.osversion));
    }
    if !spec.env.is_empty() {
        parts.push(format!("-env '{}'", spec.env));
    }
    if !spec.flags.is_empty() {
        parts.push(format!("-f '{}'", spec.flags));
    }
    let make = make_command(spec.utility, &layout.version_dir(&spec.version), test, &spec.tag);
    parts.push(format!("-make '{make}'"));
    if spec.is_perf() {
        parts.push("-perf".to_string());
    }
    parts.extend(config.trailer_flags.iter().map(|flag| format!("-{flag}")));
    if nosave {
        parts.push("-nosave".to_string());
    }
    parts.join(" ")
}

/// One line per job and test, jobs outermost.
pub fn command_dump(
    specs: &[ResolvedJobSpec],
    tests: &[String],
    layout: &OutputLayout,
    config: &EngineConfig,
    nosave: bool,
) -> Vec<String> {
    specs
        .iter()
        .flat_map(|spec| {
            tests
                .iter()
                .map(move |test| dump_command(spec, test, layout, config, nosave))
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct RunnerScript {
    pub runner: String,
    pub schedule: PathBuf,
    pub no_slurm: bool,
    pub save_log: bool,
    pub dryrun: bool,
    pub tests: Vec<String>,
    pub versions: Vec<String>,
    pub tag: String,
    /// Extra `key=value` overrides passed along with every `test=`.
    pub custom: Option<String>,
    pub invocation: String,
    pub config_count: usize,
}

impl RunnerScript {
    fn base_command(&self) -> Vec<String> {
        let mut parts = vec![self.runner.clone(), self.schedule.display().to_string()];
        if self.no_slurm {
            parts.push("--no-slurm".to_string());
        } else if self.save_log {
            parts.push("--save-log".to_string());
        }
        if self.dryrun {
            parts.push("--dryrun".to_string());
        }
        parts
    }

    fn custom_overrides(&self) -> Vec<String> {
        let Some(custom) = &self.custom else {
            return Vec::new();
        };
        let parts = shell_words::split(custom).unwrap_or_else(|err| {
            warn!(custom = %custom, error = %err, "custom overrides are not valid shell syntax, splitting on whitespace");
            custom.split_whitespace().map(str::to_string).collect()
        });
        parts
            .into_iter()
            .filter(|part| {
                let valid = part.contains('=');
                if !valid {
                    warn!(part = %part, "invalid custom format, expected key=value");
                }
                valid
            })
            .map(|part| shell_words::quote(&part).into_owned())
            .collect()
    }

    pub fn render(&self) -> String {
        let base = self.base_command();
        let custom = self.custom_overrides();
        let tag = sanitize_name(&self.tag);

        let mut out = String::new();
        out.push_str("#!/bin/bash\n");
        out.push_str("# Generated by snapta\n#\n");
        out.push_str("# Command that produced this script:\n");
        out.push_str(&format!("# {}\n#\n", self.invocation));
        out.push_str("# Individual runner commands that will be executed:\n\n");

        for (index, test) in self.tests.iter().enumerate() {
            let files: Vec<String> = self
                .versions
                .iter()
                .map(|version| format!("{}/{test}_{tag}.perf.data", sanitize_name(version)))
                .collect();
            out.push_str(&format!(
                "# Runner command {}: test={test} (processes all {} versions)\n",
                index + 1,
                self.versions.len()
            ));
            out.push_str(&format!(
                "# This will generate {} perf files: {}\n",
                self.versions.len(),
                files.join(", ")
            ));

            let mut command = base.clone();
            command.push("--override".to_string());
            command.push(shell_words::quote(&format!("test={test}")).into_owned());
            command.extend(custom.iter().cloned());
            out.push_str(&command.join(" "));
            out.push_str("\n\n");
        }

        let total = self.tests.len() * self.config_count;
        out.push_str("# Summary:\n");
        out.push_str(&format!("# Total runner commands: {}\n", self.tests.len()));
        out.push_str(&format!("# Total configs in schedule file: {}\n", self.config_count));
        out.push_str(&format!(
            "# Total runtest commands that will be executed: {} tests x {} configs = {total}\n",
            self.tests.len(),
            self.config_count
        ));
        out.push_str(&format!("# Expected perf files: {total}\n\n"));
        out.push_str("# Basic command (without individual test overrides):\n");
        out.push_str(&format!("# {}\n", base.join(" ")));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::{cross_product, ResolveRequest};
    use crate::core::schedule::{parse_schedule, render_schedule};

    const SCHEDULE: &str = "\
[grco-gcc main Snappy O3 (2) | sbatch --exclusive --partition perf -N 1]
suite : Snappy
tag : O3
f : -O3
jobs : 4
osversion : Linux_x86_64

[other]
suite : Snappy
tag : O2
env : 'A=1'
";

    fn specs() -> Vec<ResolvedJobSpec> {
        let request = ResolveRequest {
            compiler: "grco/gcc 14".to_string(),
            versions: vec!["v1".to_string()],
            tests: vec!["s000".to_string(), "s111".to_string()],
            suite: Some("Snappy".to_string()),
            user: "qa".to_string(),
            utility: Some(Utility::Perf),
            schedule: "perf".to_string(),
            ..ResolveRequest::default()
        };
        cross_product(&parse_schedule(SCHEDULE), &request)
    }

    fn layout() -> OutputLayout {
        OutputLayout::new("/home/qa", "Snappy", "grco/gcc 14", 3)
    }

    #[test]
    fn layout_names_follow_suite_and_compiler() {
        let layout = layout();
        assert_eq!(layout.dir_name(), "Snappy_grco_gcc_14_3");
        assert_eq!(
            layout.schedule_path(),
            PathBuf::from("/home/qa/Snappy_grco_gcc_14_3/Snappy_grco_gcc_14.cfg")
        );
        assert_eq!(
            layout.version_dir("main/latest"),
            PathBuf::from("/home/qa/Snappy_grco_gcc_14_3/main_latest")
        );
    }

    #[test]
    fn truncation_keeps_short_values() {
        assert_eq!(truncate_for_database("short", 45), "short");
        let long = "x".repeat(50);
        let truncated = truncate_for_database(&long, 45);
        assert_eq!(truncated.len(), 45);
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn generated_sections_render_expected_text() {
        let config = EngineConfig::default();
        let sections: Vec<JobTemplate> = specs()
            .iter()
            .map(|spec| generated_section(spec, &layout(), &config))
            .collect();
        let text = render_schedule(&sections);

        let expected = "\
[grco/gcc 14 v1 Snappy O3 (2) | sbatch --exclusive --partition perf -N 1]
perf :
ustack :
cleanenv :
compiler : grco/gcc 14
user : qa
suite : Snappy
jobs : 4
osversion : Linux_x86_64
f : '-O3'
make : 'RUN=\"taskset 0x2 perf record -o /home/qa/Snappy_grco_gcc_14_3/v1/$(TEST)_O3.perf.data\"'
version : v1
tag : O3

[grco/gcc 14 v1 Snappy O2 | sbatch --exclusive --partition perf]
perf :
ustack :
cleanenv :
compiler : grco/gcc 14
user : qa
suite : Snappy
osversion :
env : 'A=1'
make : 'RUN=\"taskset 0x2 perf record -o /home/qa/Snappy_grco_gcc_14_3/v1/$(TEST)_O2.perf.data\"'
version : v1
tag : O2";
        let trimmed: Vec<&str> = text.lines().map(str::trim_end).collect();
        assert_eq!(trimmed.join("\n"), expected);

        let reparsed = parse_schedule(&text);
        assert_eq!(reparsed.len(), 2);
        assert_eq!(reparsed[0].header.sequence(), Some(2));
        assert_eq!(reparsed[1].params.get("env"), Some("'A=1'"));
    }

    #[test]
    fn dump_lists_every_job_and_test() {
        let lines = command_dump(
            &specs(),
            &["s000".to_string(), "s111".to_string()],
            &layout(),
            &EngineConfig::default(),
            true,
        );
        assert_eq!(lines.len(), 4);
        assert_eq!(
            lines[0],
            "runtest -compiler grco/gcc 14 -version v1 -user qa -suite Snappy -test s000 -osversion Linux_x86_64 -f '-O3' -make 'RUN=\"taskset 0x2 perf record -o /home/qa/Snappy_grco_gcc_14_3/v1/s000_O3.perf.data\"' -perf -ustack -cleanenv -keep -nosave"
        );
        assert!(lines[3].contains("-test s111 -env 'A=1'"));
    }

    #[test]
    fn nsys_make_command_skips_perf_record() {
        assert_eq!(
            make_command(Some(Utility::Nsys), Path::new("/tmp"), "t", "O3"),
            "RUN=\"taskset 0x2\""
        );
    }

    #[test]
    fn runner_script_runs_each_test() {
        let script = RunnerScript {
            runner: "/proj/ta/bin/runta".to_string(),
            schedule: PathBuf::from("/home/qa/Snappy_gcc_0/Snappy_gcc.cfg"),
            save_log: true,
            tests: vec!["s000".to_string(), "s111".to_string()],
            versions: vec!["v1".to_string(), "v2".to_string()],
            tag: "O3".to_string(),
            custom: Some("jobs=8 bogus".to_string()),
            invocation: "snapta generate".to_string(),
            config_count: 2,
            ..RunnerScript::default()
        };
        let text = script.render();

        assert!(text.starts_with("#!/bin/bash\n"));
        assert!(text.contains(
            "/proj/ta/bin/runta /home/qa/Snappy_gcc_0/Snappy_gcc.cfg --save-log --override 'test=s000' 'jobs=8'\n"
        ));
        assert!(text.contains(
            "# This will generate 2 perf files: v1/s111_O3.perf.data, v2/s111_O3.perf.data\n"
        ));
        assert!(text.contains("2 tests x 2 configs = 4"));
        assert!(!text.contains("bogus"));
    }
}
