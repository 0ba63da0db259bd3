use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::core::error::SchedError;

/// Options whose value is free-form compiler flag text. The value may itself
/// start with `-`, so it is always bound to the option during deconstruction
/// and always single-quoted on reconstruction.
pub const FLAG_TEXT_OPTIONS: [&str; 6] = ["f", "nvccf", "cflags", "cxxflags", "fcflags", "fflags"];

pub const CANONICAL_ORDER: [&str; 7] = [
    "version",
    "compiler",
    "user",
    "osversion",
    "suite",
    "f",
    "test",
];

pub fn is_flag_text(key: &str) -> bool {
    FLAG_TEXT_OPTIONS.contains(&key)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Flag,
    Scalar(String),
    List(Vec<String>),
}

impl OptionValue {
    pub fn values(&self) -> Vec<&str> {
        match self {
            OptionValue::Flag => Vec::new(),
            OptionValue::Scalar(value) => vec![value.as_str()],
            OptionValue::List(values) => values.iter().map(String::as_str).collect(),
        }
    }

    /// Values joined by a single space; empty for a flag.
    pub fn joined(&self) -> String {
        self.values().join(" ")
    }

    pub fn from_values(mut values: Vec<String>) -> Self {
        match values.len() {
            0 => OptionValue::Flag,
            1 => OptionValue::Scalar(values.remove(0)),
            _ => OptionValue::List(values),
        }
    }

    /// State transition for a key seen again during deconstruction.
    fn promote(self, next: OptionValue) -> OptionValue {
        match (self, next) {
            (current, OptionValue::Flag) => current,
            (OptionValue::Flag, next) => next,
            (OptionValue::Scalar(old), OptionValue::Scalar(new)) => {
                OptionValue::List(vec![old, new])
            }
            (OptionValue::Scalar(old), OptionValue::List(new)) => {
                let mut values = vec![old];
                values.extend(new);
                OptionValue::List(values)
            }
            (OptionValue::List(mut values), OptionValue::Scalar(new)) => {
                values.push(new);
                OptionValue::List(values)
            }
            (OptionValue::List(mut values), OptionValue::List(new)) => {
                values.extend(new);
                OptionValue::List(values)
            }
        }
    }
}

/// Structured form of a flat runner command line. Keys keep the order in
/// which they were first seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionModel {
    entries: Vec<(String, OptionValue)>,
}

impl OptionModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.entries
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Value text of a scalar or list option. Flags and absent keys yield `None`.
    pub fn text(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            OptionValue::Flag => None,
            other => Some(other.joined()),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.entries.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Insert or replace, keeping the original position of an existing key.
    pub fn set(&mut self, key: impl Into<String>, value: OptionValue) {
        let key = key.into();
        match self.entries.iter_mut().find(|(name, _)| *name == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Record another occurrence of `key`, promoting the stored value.
    pub fn push(&mut self, key: impl Into<String>, value: OptionValue) {
        let key = key.into();
        match self.entries.iter_mut().find(|(name, _)| *name == key) {
            Some(entry) => {
                let current = std::mem::replace(&mut entry.1, OptionValue::Flag);
                entry.1 = current.promote(value);
            }
            None => self.entries.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<OptionValue> {
        let index = self.entries.iter().position(|(name, _)| name == key)?;
        Some(self.entries.remove(index).1)
    }

    /// Extend an option instead of replacing it: lists grow, scalars gain a
    /// space-separated suffix, absent keys are inserted.
    pub fn append(&mut self, key: &str, value: OptionValue) {
        let Some(index) = self.entries.iter().position(|(name, _)| name == key) else {
            self.entries.push((key.to_string(), value));
            return;
        };

        let entry = &mut self.entries[index];
        let current = std::mem::replace(&mut entry.1, OptionValue::Flag);
        entry.1 = match current {
            OptionValue::List(mut values) => {
                values.extend(value.values().into_iter().map(str::to_string));
                OptionValue::List(values)
            }
            OptionValue::Scalar(existing) if existing.trim().is_empty() => value,
            OptionValue::Scalar(existing) => {
                let suffix = value.joined();
                if suffix.is_empty() {
                    OptionValue::Scalar(existing)
                } else {
                    OptionValue::Scalar(format!("{existing} {suffix}"))
                }
            }
            OptionValue::Flag => {
                warn!(key, "appending a value to a switch option replaces the switch");
                value
            }
        };
    }

    pub fn apply_override(&mut self, overrides: &KeyValueArgs) {
        for (key, value) in overrides.set.iter() {
            self.set(key, value.clone());
        }
        for key in &overrides.unset {
            self.remove(key);
        }
    }

    pub fn apply_append(&mut self, appends: &KeyValueArgs) {
        for (key, value) in appends.set.iter() {
            self.append(key, value.clone());
        }
        for key in &appends.unset {
            self.remove(key);
        }
    }

    /// Order-insensitive comparison: same keys with the same values.
    pub fn same_options(&self, other: &OptionModel) -> bool {
        self.as_map() == other.as_map()
    }

    fn as_map(&self) -> BTreeMap<&str, &OptionValue> {
        self.iter().collect()
    }
}

/// `key=value` arguments as accepted by `--append` and `--override`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyValueArgs {
    pub set: OptionModel,
    pub unset: Vec<String>,
}

impl KeyValueArgs {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }
}

/// Parse `key=value` tokens. `true` yields a switch, `false` removes the
/// option, and a repeated key accumulates into a list.
pub fn parse_key_values<S: AsRef<str>>(tokens: &[S]) -> Result<KeyValueArgs, SchedError> {
    let mut args = KeyValueArgs::default();

    for token in tokens {
        let token = token.as_ref();
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| SchedError::InvalidOverride {
                raw: token.to_string(),
                message: "expected key=value".to_string(),
            })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(SchedError::InvalidOverride {
                raw: token.to_string(),
                message: "empty key".to_string(),
            });
        }

        match value {
            "true" | "True" => {
                args.unset.retain(|name| name != key);
                args.set.set(key, OptionValue::Flag);
            }
            "false" | "False" => {
                args.set.remove(key);
                if !args.unset.iter().any(|name| name == key) {
                    args.unset.push(key.to_string());
                }
            }
            _ => args.set.push(key, OptionValue::Scalar(value.to_string())),
        }
    }

    Ok(args)
}

fn option_key(token: &str) -> Option<&str> {
    if !token.starts_with('-') {
        return None;
    }
    let key = token.trim_start_matches('-');
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}

pub fn deconstruct(command: &str) -> Result<OptionModel, SchedError> {
    let tokens = shell_words::split(command).map_err(|err| SchedError::InvalidCommand {
        command: command.to_string(),
        message: err.to_string(),
    })?;
    Ok(deconstruct_tokens(&tokens))
}

pub fn deconstruct_tokens(tokens: &[String]) -> OptionModel {
    let mut model = OptionModel::new();
    let mut iter = tokens.iter().peekable();

    while let Some(token) = iter.next() {
        let Some(key) = option_key(token) else {
            debug!(token = %token, "skipping positional token");
            continue;
        };

        let mut values = Vec::new();
        if is_flag_text(key) {
            if let Some(next) = iter.next() {
                values.push(next.clone());
            }
        }
        while let Some(next) = iter.peek() {
            if option_key(next).is_some() {
                break;
            }
            values.push((*next).clone());
            iter.next();
        }

        model.push(key, OptionValue::from_values(values));
    }

    model
}

#[derive(Debug, Clone, Copy)]
pub enum KeyOrder<'a> {
    /// Model order (first occurrence during parsing).
    Parsed,
    /// Fixed priority keys first, then the rest alphabetically.
    Canonical,
    /// The given keys first, then any remaining keys in model order.
    Given(&'a [String]),
}

fn ordered_keys<'m>(model: &'m OptionModel, order: KeyOrder<'_>) -> Vec<&'m str> {
    match order {
        KeyOrder::Parsed => model.keys().collect(),
        KeyOrder::Canonical => {
            let mut keys: Vec<&str> = model.keys().collect();
            keys.sort_by(|a, b| {
                let rank = |key: &str| {
                    CANONICAL_ORDER
                        .iter()
                        .position(|name| *name == key)
                        .unwrap_or(CANONICAL_ORDER.len())
                };
                rank(a).cmp(&rank(b)).then_with(|| a.cmp(b))
            });
            keys
        }
        KeyOrder::Given(given) => {
            let mut keys: Vec<&str> = Vec::new();
            for key in given {
                if let Some(name) = model.keys().find(|name| name == key) {
                    if !keys.contains(&name) {
                        keys.push(name);
                    }
                }
            }
            for key in model.keys() {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
            keys
        }
    }
}

fn single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Flag text is always single-quoted; anything else only when the shell
/// would otherwise split or expand it.
fn quote_value(key: &str, value: &str) -> String {
    if is_flag_text(key) {
        single_quote(value)
    } else {
        shell_words::quote(value).into_owned()
    }
}

pub fn render_option(key: &str, value: &OptionValue) -> String {
    match value {
        OptionValue::Flag => format!("-{key}"),
        OptionValue::Scalar(value) => format!("-{key} {}", quote_value(key, value)),
        OptionValue::List(values) if values.is_empty() => format!("-{key}"),
        // Only the first token after a flag-text key binds to it, so every
        // element repeats the key.
        OptionValue::List(values) if is_flag_text(key) => values
            .iter()
            .map(|value| format!("-{key} {}", single_quote(value)))
            .collect::<Vec<_>>()
            .join(" "),
        OptionValue::List(values) => {
            let rendered: Vec<String> = values
                .iter()
                .map(|value| quote_value(key, value))
                .collect();
            format!("-{key} {}", rendered.join(" "))
        }
    }
}

/// Rebuild command fragments, one `-key [value...]` string per option.
pub fn reconstruct(model: &OptionModel, order: KeyOrder<'_>) -> Vec<String> {
    ordered_keys(model, order)
        .into_iter()
        .filter_map(|key| model.get(key).map(|value| render_option(key, value)))
        .collect()
}

pub fn reconstruct_line(model: &OptionModel, order: KeyOrder<'_>) -> String {
    reconstruct(model, order).join(" ")
}

/// Canonical spelling of a command line.
pub fn normalize(command: &str) -> Result<String, SchedError> {
    let model = deconstruct(command)?;
    Ok(reconstruct_line(&model, KeyOrder::Canonical))
}

pub fn semantically_equal(left: &str, right: &str) -> Result<bool, SchedError> {
    Ok(deconstruct(left)?.same_options(&deconstruct(right)?))
}

/// Verify that a command line denotes the same options after being
/// deconstructed and rebuilt.
pub fn check_round_trip(command: &str) -> Result<(), SchedError> {
    let parsed = deconstruct(command)?;
    let rebuilt = reconstruct_line(&parsed, KeyOrder::Parsed);
    let reparsed = deconstruct(&rebuilt)?;

    if parsed.same_options(&reparsed) {
        Ok(())
    } else {
        Err(SchedError::RoundTripMismatch {
            original: command.to_string(),
            rebuilt,
        })
    }
}
