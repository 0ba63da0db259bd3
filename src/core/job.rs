use std::fmt;

use clap::ValueEnum;
use tracing::debug;

use crate::core::command::{OptionModel, OptionValue};
use crate::core::filter::OverrideDirective;
use crate::core::schedule::JobTemplate;

/// Profiling tool wrapped around each benchmark run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Utility {
    Perf,
    Nsys,
}

impl fmt::Display for Utility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Utility::Perf => write!(f, "perf"),
            Utility::Nsys => write!(f, "nsys"),
        }
    }
}

/// What the user asked for on the command line. `None` means "take the
/// template's value".
#[derive(Debug, Clone, Default)]
pub struct ResolveRequest {
    pub compiler: String,
    pub versions: Vec<String>,
    pub tests: Vec<String>,
    pub suite: Option<String>,
    pub user: String,
    pub osversion: Option<String>,
    pub env: Option<String>,
    pub flags: Option<String>,
    pub utility: Option<Utility>,
    pub append: bool,
    pub directive: OverrideDirective,
    pub schedule: String,
}

/// One concrete job: a template bound to a single compiler version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedJobSpec {
    pub compiler: String,
    pub version: String,
    pub tests: Vec<String>,
    pub suite: String,
    pub user: String,
    pub tag: String,
    pub osversion: String,
    pub env: String,
    pub flags: String,
    pub utility: Option<Utility>,
    pub make: Option<String>,
    /// Stem of the schedule file the template came from.
    pub schedule: String,
    /// Submission wrapper template; empty when the header carries none.
    pub submission: String,
    pub template: JobTemplate,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub compiler: String,
    pub suite: String,
    pub osversion: String,
    pub env: String,
    pub flags: String,
    pub tag: String,
    pub version: String,
}

impl ResolvedJobSpec {
    /// A job exactly as a schedule section describes it.
    pub fn from_template(template: &JobTemplate, schedule: &str) -> Self {
        let options = template.options();
        let text = |key: &str| options.text(key).unwrap_or_default();

        let utility = if options.contains("perf") {
            Some(Utility::Perf)
        } else if options.contains("nsys") {
            Some(Utility::Nsys)
        } else {
            None
        };

        ResolvedJobSpec {
            compiler: text("compiler"),
            version: text("version"),
            tests: options
                .get("test")
                .map(|value| value.values().into_iter().map(str::to_string).collect())
                .unwrap_or_default(),
            suite: text("suite"),
            user: text("user"),
            tag: text("tag"),
            osversion: text("osversion"),
            env: text("env"),
            flags: text("f"),
            utility,
            make: options.text("make"),
            schedule: schedule.to_string(),
            submission: template.header.submission().unwrap_or_default().to_string(),
            template: template.clone(),
        }
    }

    pub fn signature(&self) -> Signature {
        Signature {
            compiler: self.compiler.clone(),
            suite: self.suite.clone(),
            osversion: self.osversion.clone(),
            env: self.env.clone(),
            flags: self.flags.clone(),
            tag: self.tag.clone(),
            version: self.version.clone(),
        }
    }

    /// Runner options: the template's own options with the resolved fields
    /// laid over them. Fields already equal to the template keep its shape.
    pub fn options(&self) -> OptionModel {
        let mut model = self.template.options();

        for (key, value) in [
            ("compiler", &self.compiler),
            ("version", &self.version),
            ("user", &self.user),
            ("suite", &self.suite),
            ("osversion", &self.osversion),
            ("env", &self.env),
            ("f", &self.flags),
            ("tag", &self.tag),
        ] {
            overlay(&mut model, key, value);
        }

        if !self.tests.is_empty() {
            let requested: Vec<&str> = self.tests.iter().map(String::as_str).collect();
            let unchanged = model
                .get("test")
                .map(|value| value.values() == requested)
                .unwrap_or(false);
            if !unchanged {
                model.set("test", OptionValue::from_values(self.tests.clone()));
            }
        }
        if let Some(make) = &self.make {
            overlay(&mut model, "make", make);
        }
        if let Some(utility) = self.utility {
            let key = utility.to_string();
            if !model.contains(&key) {
                model.set(key, OptionValue::Flag);
            }
        }

        model
    }

    pub fn is_perf(&self) -> bool {
        self.utility == Some(Utility::Perf)
    }
}

fn overlay(model: &mut OptionModel, key: &str, value: &str) {
    if value.is_empty() || model.text(key).as_deref() == Some(value) {
        return;
    }
    model.set(key, OptionValue::Scalar(value.to_string()));
}

fn effective(
    key: &str,
    requested: Option<&str>,
    template: &str,
    request: &ResolveRequest,
) -> String {
    if let Some(value) = request.directive.get(key) {
        return value.to_string();
    }

    match requested {
        Some(value) if !request.directive.is_empty() => value.to_string(),
        Some(value) if request.append => match (template.is_empty(), value.is_empty()) {
            (false, false) => format!("{template} {value}"),
            (true, _) => value.to_string(),
            (false, true) => template.to_string(),
        },
        Some(value) => value.to_string(),
        None => template.to_string(),
    }
}

/// Bind a selected template to one version.
pub fn resolve(template: &JobTemplate, version: &str, request: &ResolveRequest) -> ResolvedJobSpec {
    let mut template = template.clone();
    for (key, value) in request.directive.iter() {
        if !matches!(key, "tag" | "f" | "osversion" | "env") {
            template.params.insert(key, value);
        }
    }

    let options = template.options();
    let template_text = |key: &str| options.text(key).unwrap_or_default();

    ResolvedJobSpec {
        compiler: request.compiler.clone(),
        version: version.to_string(),
        tests: request.tests.clone(),
        suite: request
            .suite
            .clone()
            .unwrap_or_else(|| template.suite().to_string()),
        user: request.user.clone(),
        tag: template.tag().to_string(),
        osversion: effective(
            "osversion",
            request.osversion.as_deref(),
            &template_text("osversion"),
            request,
        ),
        // A requested env replaces outright, even in append mode.
        env: match request.env.as_deref() {
            Some(env) if !env.is_empty() => env.to_string(),
            _ => effective("env", None, &template_text("env"), request),
        },
        flags: effective("f", request.flags.as_deref(), &template_text("f"), request),
        utility: request.utility,
        make: None,
        schedule: request.schedule.clone(),
        submission: template.header.submission().unwrap_or_default().to_string(),
        template,
    }
}

/// Every candidate crossed with every requested version, duplicates removed.
pub fn cross_product(candidates: &[JobTemplate], request: &ResolveRequest) -> Vec<ResolvedJobSpec> {
    let mut specs = Vec::with_capacity(candidates.len() * request.versions.len());
    for template in candidates {
        for version in &request.versions {
            specs.push(resolve(template, version, request));
        }
    }
    dedup_specs(specs)
}

/// Keep the first spec of each signature, in order.
pub fn dedup_specs(specs: Vec<ResolvedJobSpec>) -> Vec<ResolvedJobSpec> {
    let before = specs.len();
    let mut seen = std::collections::HashSet::new();
    let unique: Vec<ResolvedJobSpec> = specs
        .into_iter()
        .filter(|spec| seen.insert(spec.signature()))
        .collect();
    if unique.len() != before {
        debug!(removed = before - unique.len(), "dropped duplicate job configs");
    }
    unique
}
