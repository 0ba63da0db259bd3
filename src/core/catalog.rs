use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::core::error::SchedError;

pub const DEFAULT_TIMEOUTS: (u64, u64) = (600, 600);

/// Build and execution timeouts, in seconds, for a suite.
pub trait TimeoutLookup {
    fn timeouts(&self, suite: &str) -> (u64, u64);
}

/// Number of tests a suite runs when no explicit test list is given.
pub trait SuiteCountLookup {
    fn test_count(&self, suite: &str) -> Option<u64>;
}

/// Maps a suite type to the suites it contains.
pub trait HostGroupResolver {
    fn suites_of_type(&self, kind: &str) -> Vec<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteInfo {
    pub name: String,
    pub build_timeout: u64,
    pub exec_timeout: u64,
    pub test_count: Option<u64>,
    pub suite_type: Option<String>,
}

/// Suite metadata loaded from a line-oriented file:
///
/// ```text
/// # suite              build  exec  [tests]  [type]
/// Snappy               900    1200  24       perf
/// ```
#[derive(Debug, Clone, Default)]
pub struct SuiteCatalog {
    suites: Vec<SuiteInfo>,
    index: HashMap<String, usize>,
}

impl SuiteCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, info: SuiteInfo) {
        match self.index.get(&info.name) {
            Some(&slot) => self.suites[slot] = info,
            None => {
                self.index.insert(info.name.clone(), self.suites.len());
                self.suites.push(info);
            }
        }
    }

    pub fn get(&self, suite: &str) -> Option<&SuiteInfo> {
        self.index.get(suite).map(|&slot| &self.suites[slot])
    }

    pub fn len(&self) -> usize {
        self.suites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suites.is_empty()
    }

    pub fn parse(path: &Path, content: &str) -> Result<Self, SchedError> {
        let mut catalog = SuiteCatalog::new();

        for (index, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let invalid = |message: String| SchedError::InvalidCatalog {
                path: path.to_path_buf(),
                line: index + 1,
                message,
            };
            let number = |field: &str, what: &str| {
                field
                    .parse::<u64>()
                    .map_err(|_| invalid(format!("{what} '{field}' is not a number")))
            };

            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            if fields.len() < 3 || fields.len() > 5 {
                return Err(invalid(format!(
                    "expected '<suite> <build> <exec> [tests] [type]', found {} fields",
                    fields.len()
                )));
            }

            let test_count = match fields.get(3) {
                Some(field) => Some(number(*field, "test count")?),
                None => None,
            };

            catalog.insert(SuiteInfo {
                name: fields[0].to_string(),
                build_timeout: number(fields[1], "build timeout")?,
                exec_timeout: number(fields[2], "exec timeout")?,
                test_count,
                suite_type: fields.get(4).map(|kind| kind.to_string()),
            });
        }

        debug!(path = %path.display(), suites = catalog.len(), "loaded suite catalog");
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self, SchedError> {
        let content = fs::read_to_string(path).map_err(|err| SchedError::io(path, err))?;
        SuiteCatalog::parse(path, &content)
    }
}

impl TimeoutLookup for SuiteCatalog {
    fn timeouts(&self, suite: &str) -> (u64, u64) {
        self.get(suite)
            .map(|info| (info.build_timeout, info.exec_timeout))
            .unwrap_or(DEFAULT_TIMEOUTS)
    }
}

impl SuiteCountLookup for SuiteCatalog {
    fn test_count(&self, suite: &str) -> Option<u64> {
        self.get(suite).and_then(|info| info.test_count)
    }
}

impl HostGroupResolver for SuiteCatalog {
    fn suites_of_type(&self, kind: &str) -> Vec<String> {
        self.suites
            .iter()
            .filter(|info| info.suite_type.as_deref() == Some(kind))
            .map(|info| info.name.clone())
            .collect()
    }
}
