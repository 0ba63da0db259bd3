use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedError {
    #[error("schedule file not found: {}", path.display())]
    ScheduleNotFound { path: PathBuf },
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no job config found{context} in schedule file {schedule}")]
    NoMatchingConfig { context: String, schedule: String },
    #[error("invalid override '{raw}': {message}")]
    InvalidOverride { raw: String, message: String },
    #[error("invalid filter: {message}")]
    InvalidFilter { message: String },
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid command '{command}': {message}")]
    InvalidCommand { command: String, message: String },
    #[error("command does not survive reconstruction:\n  original: {original}\n  rebuilt:  {rebuilt}")]
    RoundTripMismatch { original: String, rebuilt: String },
    #[error("{}:{line}: {message}", path.display())]
    InvalidCatalog {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("{message}")]
    IncompatibleOptions { message: String },
    #[error("{count} lint issues detected")]
    LintFailed { count: usize },
}

impl SchedError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SchedError::Io {
            path: path.into(),
            source,
        }
    }
}
