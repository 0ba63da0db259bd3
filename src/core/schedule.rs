use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::core::command::{is_flag_text, OptionModel, OptionValue};
use crate::core::error::SchedError;

static RE_SUBMISSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"\|\s*(sbatch.*?)\s*\]$").unwrap());
static RE_SEQUENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\((\d+)\)").unwrap());

/// Section header split into its display label and the submission command
/// embedded after a `|` separator, e.g. `[gcc v1 Snappy (3) | sbatch -N 1]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    raw: String,
    label: String,
    submission: Option<String>,
    sequence: Option<u32>,
}

impl Header {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim().to_string();
        let inner = raw
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(&raw);
        let label = inner.split('|').next().unwrap_or_default().trim().to_string();

        let submission = RE_SUBMISSION
            .captures(&raw)
            .and_then(|cap| cap.get(1))
            .map(|m| m.as_str().trim().to_string());
        let sequence = RE_SEQUENCE
            .captures(&label)
            .and_then(|cap| cap.get(1))
            .and_then(|m| m.as_str().parse::<u32>().ok());

        Header {
            raw,
            label,
            submission,
            sequence,
        }
    }

    pub fn compose(label: &str, sequence: Option<u32>, submission: &str) -> Self {
        let mut text = format!("[{label}");
        if let Some(sequence) = sequence {
            text.push_str(&format!(" ({sequence})"));
        }
        text.push_str(&format!(" | {submission}]"));
        Header::parse(&text)
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn submission(&self) -> Option<&str> {
        self.submission.as_deref()
    }

    pub fn sequence(&self) -> Option<u32> {
        self.sequence
    }
}

/// Section parameters in file order. Keys are unique; a repeated key
/// overwrites the earlier value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    entries: Vec<(String, String)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(name, _)| *name == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTemplate {
    pub header: Header,
    pub params: Params,
}

impl JobTemplate {
    pub fn new(header: Header, params: Params) -> Self {
        JobTemplate { header, params }
    }

    /// Trimmed parameter value; empty when the key is absent.
    pub fn param(&self, key: &str) -> &str {
        self.params.get(key).map(str::trim).unwrap_or_default()
    }

    pub fn suite(&self) -> &str {
        self.param("suite")
    }

    pub fn tag(&self) -> &str {
        self.param("tag")
    }

    pub fn flags(&self) -> &str {
        self.param("f")
    }

    /// Copy of this template with one parameter replaced.
    pub fn with_param(&self, key: &str, value: impl Into<String>) -> JobTemplate {
        let mut copy = self.clone();
        copy.params.insert(key, value);
        copy
    }

    /// Runner options described by this section. Empty values are switches;
    /// quoted values are unquoted; several words form a list, except for
    /// flag text which stays one value.
    pub fn options(&self) -> OptionModel {
        let mut model = OptionModel::new();
        for (key, value) in self.params.iter() {
            model.set(key, param_value(key, value));
        }
        model
    }

    /// The section as a flat runner argument string, values as written.
    pub fn raw_command(&self) -> String {
        self.params
            .iter()
            .map(|(key, value)| {
                let value = value.trim();
                if value.is_empty() {
                    format!("-{key}")
                } else {
                    format!("-{key} {value}")
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(self.header.raw());
        out.push('\n');
        for (key, value) in self.params.iter() {
            out.push_str(&format!("{key} : {value}\n"));
        }
        out
    }
}

fn param_value(key: &str, value: &str) -> OptionValue {
    let value = value.trim();
    if value.is_empty() {
        return OptionValue::Flag;
    }

    match shell_words::split(value) {
        Ok(tokens) if is_flag_text(key) => OptionValue::Scalar(tokens.join(" ")),
        Ok(tokens) => OptionValue::from_values(tokens),
        Err(err) => {
            warn!(key, value, error = %err, "unbalanced quoting in schedule value, keeping it verbatim");
            OptionValue::Scalar(value.to_string())
        }
    }
}

fn is_header(line: &str) -> bool {
    line.starts_with('[') && line.ends_with(']')
}

pub fn parse_schedule(content: &str) -> Vec<JobTemplate> {
    let mut templates = Vec::new();
    let mut current: Option<JobTemplate> = None;

    for (index, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if is_header(trimmed) {
            if let Some(done) = current.take() {
                templates.push(done);
            }
            current = Some(JobTemplate::new(Header::parse(trimmed), Params::new()));
            continue;
        }

        let Some(template) = current.as_mut() else {
            warn!(line = index + 1, text = trimmed, "ignoring line outside of any section");
            continue;
        };

        match trimmed.split_once(':') {
            Some((key, value)) => template.params.insert(key.trim(), value.trim()),
            None => {
                warn!(
                    line = index + 1,
                    section = template.header.raw(),
                    text = trimmed,
                    "ignoring line without ':' separator"
                );
            }
        }
    }

    if let Some(done) = current {
        templates.push(done);
    }

    debug!(sections = templates.len(), "parsed schedule");
    templates
}

pub fn parse_schedule_file(path: &Path) -> Result<Vec<JobTemplate>, SchedError> {
    if !path.exists() {
        return Err(SchedError::ScheduleNotFound {
            path: path.to_path_buf(),
        });
    }
    let content = fs::read_to_string(path).map_err(|err| SchedError::io(path, err))?;
    Ok(parse_schedule(&content))
}

pub fn render_schedule(templates: &[JobTemplate]) -> String {
    templates
        .iter()
        .map(JobTemplate::render)
        .collect::<Vec<_>>()
        .join("\n")
}
