use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;
use tracing::{debug, warn};

use crate::core::catalog::{SuiteCountLookup, TimeoutLookup};
use crate::core::command::{reconstruct, KeyOrder, KeyValueArgs, OptionModel};
use crate::core::config::EngineConfig;
use crate::core::job::ResolvedJobSpec;

const RUNTIME_PLACEHOLDER: &str = "__rtcmd__";

static RE_ARG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?:^|\s)(?P<flag>-{1,2}[A-Za-z][\w-]*)",
        r#"(?P<value>(?:=|[ \t]+)(?:"[^"]*"|\{[^}]*\}|[^\s"{\-]\S*))?"#,
    ))
    .unwrap()
});
static RE_HOST_SET: Lazy<Regex> = Lazy::new(|| Regex::new(r"-w\s+\{([^}]*)\}").unwrap());
static RE_HOST: Lazy<Regex> = Lazy::new(|| Regex::new(r"-w\s+(\S+)").unwrap());

/// How a submission argument is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    /// `--exclusive`
    Switch,
    /// `--partition perf`
    Spaced(String),
    /// `--export=HOME`
    Equals(String),
}

fn render_arg(flag: &str, value: &ArgValue) -> String {
    match value {
        ArgValue::Switch => flag.to_string(),
        ArgValue::Spaced(value) => format!("{flag} {value}"),
        ArgValue::Equals(value) => format!("{flag}={value}"),
    }
}

/// Byte range of `flag` and its value inside `wrapper`, plus the value text.
fn find_arg<'a>(wrapper: &'a str, flag: &str) -> Option<(usize, usize, Option<&'a str>)> {
    RE_ARG.captures_iter(wrapper).find_map(|cap| {
        let name = cap.name("flag")?;
        if name.as_str() != flag {
            return None;
        }
        let value = cap.name("value");
        let end = value.map(|v| v.end()).unwrap_or(name.end());
        let text = value.map(|v| v.as_str().trim_start_matches('=').trim());
        Some((name.start(), end, text))
    })
}

/// Current value of `flag` in a submission string.
pub fn arg_value(wrapper: &str, flag: &str) -> Option<String> {
    find_arg(wrapper, flag).and_then(|(_, _, value)| value.map(str::to_string))
}

pub fn has_arg(wrapper: &str, flag: &str) -> bool {
    find_arg(wrapper, flag).is_some()
}

/// Set `flag` in a submission string. An existing flag keeps its value
/// unless `allow_override`; an absent flag is appended.
pub fn add_or_replace(wrapper: &str, flag: &str, value: &ArgValue, allow_override: bool) -> String {
    match find_arg(wrapper, flag) {
        Some(_) if matches!(value, ArgValue::Switch) => wrapper.to_string(),
        Some(_) if !allow_override => {
            debug!(flag, "keeping existing submission argument");
            wrapper.to_string()
        }
        Some((start, end, _)) => {
            format!("{}{}{}", &wrapper[..start], render_arg(flag, value), &wrapper[end..])
        }
        None if wrapper.trim().is_empty() => render_arg(flag, value),
        None => format!("{} {}", wrapper.trim_end(), render_arg(flag, value)),
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubmissionOptions {
    pub partition: Option<String>,
    pub force_partition: bool,
    pub nodelist: Option<String>,
    pub jobname: Option<String>,
    pub time_hints: bool,
    pub save_log: bool,
    pub test_only: bool,
    pub invoking_user: String,
    pub slurm: bool,
    pub canonical: bool,
    pub append: KeyValueArgs,
    pub overrides: KeyValueArgs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionDescriptor {
    pub runtime_command: Vec<String>,
    /// Empty when cluster submission is disabled.
    pub submission_wrapper: String,
}

impl SubmissionDescriptor {
    pub fn runtime_line(&self) -> String {
        self.runtime_command.join(" ")
    }

    /// What a user would paste into a shell.
    pub fn command_line(&self) -> String {
        if self.submission_wrapper.is_empty() {
            self.runtime_line()
        } else {
            self.submission_wrapper.clone()
        }
    }
}

/// Options of a job after `--append` and `--override` were applied.
pub fn effective_options(spec: &ResolvedJobSpec, options: &SubmissionOptions) -> OptionModel {
    let mut model = spec.options();
    model.apply_append(&options.append);
    model.apply_override(&options.overrides);
    model
}

pub fn runtime_command(model: &OptionModel, canonical: bool, config: &EngineConfig) -> Vec<String> {
    let order = if canonical {
        KeyOrder::Canonical
    } else {
        KeyOrder::Parsed
    };

    let mut command = vec![config.runtest.clone()];
    command.extend(reconstruct(model, order));
    for flag in &config.trailer_flags {
        if !model.contains(flag) {
            command.push(format!("-{flag}"));
        }
    }
    command
}

/// Wall-clock limit in minutes. The aarch64 multiplier applies to seconds,
/// before rounding up to minutes.
pub fn compute_time_hint(
    test_count: u64,
    build: u64,
    exec: u64,
    threads: u64,
    aarch64: bool,
) -> u64 {
    let mut seconds = test_count.saturating_mul(build.saturating_add(exec)) / threads.max(1);
    if aarch64 {
        seconds = seconds.saturating_mul(4);
    }
    seconds.div_ceil(60).saturating_add(5)
}

fn numeric_option(model: &OptionModel, key: &str) -> Option<u64> {
    let text = model.text(key)?;
    match text.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %text, "ignoring non-numeric option for time hint");
            None
        }
    }
}

pub fn time_hint_for<C>(model: &OptionModel, catalog: &C) -> u64
where
    C: TimeoutLookup + SuiteCountLookup,
{
    let suite = model.text("suite").unwrap_or_default();
    let explicit = model.get("test").map(|v| v.values().len()).unwrap_or(0) as u64;

    let test_count = if explicit > 0 {
        explicit
    } else {
        let removed = model.get("rmtest").map(|v| v.values().len()).unwrap_or(0) as u64;
        catalog.test_count(&suite).unwrap_or(1).saturating_sub(removed)
    }
    .max(1);

    let (build, exec) = catalog.timeouts(&suite);
    let build = numeric_option(model, "ctimeout").unwrap_or(build);
    let exec = numeric_option(model, "etimeout").unwrap_or(exec);
    let threads = numeric_option(model, "threads").unwrap_or(1);
    let aarch64 = model.text("osversion").as_deref() == Some("Linux_aarch64");

    compute_time_hint(test_count, build, exec, threads, aarch64)
}

fn expand_jobname(
    pattern: &str,
    spec: &ResolvedJobSpec,
    host: &str,
    partition: &str,
    model: &OptionModel,
    invoking_user: &str,
) -> String {
    let user = model
        .text("user")
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| invoking_user.to_string());
    pattern
        .replace("%F", &spec.schedule)
        .replace("%N", host)
        .replace("%P", partition)
        .replace("%u", invoking_user)
        .replace("%U", &user)
}

pub fn build_descriptor<C, R>(
    spec: &ResolvedJobSpec,
    options: &SubmissionOptions,
    config: &EngineConfig,
    catalog: &C,
    rng: &mut R,
) -> SubmissionDescriptor
where
    C: TimeoutLookup + SuiteCountLookup,
    R: Rng + ?Sized,
{
    let model = effective_options(spec, options);
    let runtime = runtime_command(&model, options.canonical, config);

    if !options.slurm {
        return SubmissionDescriptor {
            runtime_command: runtime,
            submission_wrapper: String::new(),
        };
    }

    if model.contains("host") {
        warn!("the runtest option '-host' does not control where the job runs, use --nodelist instead");
    }

    let mut wrapper = if spec.submission.trim().is_empty() {
        "sbatch".to_string()
    } else {
        spec.submission.clone()
    };

    let host = if let Some(nodelist) = &options.nodelist {
        wrapper = add_or_replace(&wrapper, "-w", &ArgValue::Spaced(nodelist.clone()), true);
        nodelist.clone()
    } else if let Some(set) = RE_HOST_SET.captures(&wrapper).and_then(|cap| cap.get(1)) {
        let hosts: Vec<String> = set
            .as_str()
            .split(',')
            .map(|host| host.split_whitespace().collect::<String>())
            .filter(|host| !host.is_empty())
            .collect();
        match hosts.choose(rng) {
            Some(host) => {
                let host = host.clone();
                debug!(host = %host, candidates = hosts.len(), "picked host from set");
                wrapper = add_or_replace(&wrapper, "-w", &ArgValue::Spaced(host.clone()), true);
                host
            }
            None => String::new(),
        }
    } else {
        RE_HOST
            .captures(&wrapper)
            .and_then(|cap| cap.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    };

    if options.test_only {
        wrapper = add_or_replace(&wrapper, "--test-only", &ArgValue::Switch, true);
    }

    if let Some(partition) = &options.partition {
        wrapper = add_or_replace(
            &wrapper,
            "--partition",
            &ArgValue::Spaced(partition.clone()),
            options.force_partition,
        );
    }

    if let Some(pattern) = &options.jobname {
        let partition = arg_value(&wrapper, "--partition").unwrap_or_default();
        let name = expand_jobname(pattern, spec, &host, &partition, &model, &options.invoking_user);
        wrapper = add_or_replace(&wrapper, "-J", &ArgValue::Spaced(name), true);
    }

    if options.time_hints {
        let minutes = time_hint_for(&model, catalog);
        wrapper = add_or_replace(&wrapper, "--time", &ArgValue::Spaced(minutes.to_string()), true);
    }

    wrapper = add_or_replace(&wrapper, "--export", &ArgValue::Equals("HOME".to_string()), true);
    wrapper = add_or_replace(&wrapper, "--propagate", &ArgValue::Equals("NONE".to_string()), true);
    wrapper = add_or_replace(
        &wrapper,
        "--wrap",
        &ArgValue::Spaced(format!("\"{RUNTIME_PLACEHOLDER}\"")),
        true,
    );

    if !options.save_log {
        wrapper = add_or_replace(&wrapper, "-o", &ArgValue::Spaced("/dev/null".to_string()), true);
        wrapper = add_or_replace(&wrapper, "-e", &ArgValue::Spaced("/dev/null".to_string()), true);
    }

    let payload = shell_words::quote(&runtime.join(" ")).into_owned();
    let wrapper = wrapper.replace(&format!("\"{RUNTIME_PLACEHOLDER}\""), &payload);
    SubmissionDescriptor {
        runtime_command: runtime,
        submission_wrapper: wrapper,
    }
}
