use std::path::{Path, PathBuf};

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info, warn};

pub mod catalog;
pub mod command;
pub mod config;
pub mod error;
pub mod filter;
pub mod formatter;
pub mod job;
pub mod lint;
pub mod schedule;
pub mod submission;

use catalog::{HostGroupResolver, SuiteCountLookup, TimeoutLookup};
use command::{
    check_round_trip, deconstruct, normalize, reconstruct_line, semantically_equal, KeyOrder,
};
use config::{EngineConfig, SUPPORTED_SUITES};
use error::SchedError;
use filter::{
    filter_by_host, filter_by_option, firstrun, pick_default, select, FilterSpec, MatchKind,
    OverrideMode,
};
use formatter::{command_dump, generated_section, OutputLayout, RunnerScript};
use job::{cross_product, ResolveRequest, ResolvedJobSpec};
use lint::{lint, LintPolicy};
use schedule::{parse_schedule_file, render_schedule, JobTemplate};
use submission::{build_descriptor, effective_options, SubmissionDescriptor, SubmissionOptions};

use crate::util::next_directory_index;

fn schedule_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn schedule_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub schedule: PathBuf,
    pub filter: FilterSpec,
    pub mode: OverrideMode,
    pub resolve: ResolveRequest,
    pub output_base: PathBuf,
    pub nosave: bool,
    pub no_slurm: bool,
    pub save_log: bool,
    pub dryrun: bool,
    pub custom: Option<String>,
    pub invocation: String,
}

#[derive(Debug, Clone)]
pub struct Generated {
    pub layout: OutputLayout,
    pub specs: Vec<ResolvedJobSpec>,
    /// Text of the new schedule file.
    pub schedule: String,
    /// Plain runtest commands, one per job and test.
    pub commands: Vec<String>,
    pub script: String,
}

/// Compose a new schedule from the sections of a base schedule. Nothing is
/// written; the caller decides where the results go.
pub fn generate(
    request: &GenerateRequest,
    config: &EngineConfig,
    groups: Option<&dyn HostGroupResolver>,
) -> Result<Generated, SchedError> {
    let templates = parse_schedule_file(&request.schedule)?;
    info!(path = %request.schedule.display(), sections = templates.len(), "loaded schedule");

    let candidates = select(
        &templates,
        &request.filter,
        &request.mode,
        groups,
        &schedule_name(&request.schedule),
    )?;
    let default = pick_default(&candidates).ok_or_else(|| SchedError::NoMatchingConfig {
        context: String::new(),
        schedule: schedule_name(&request.schedule),
    })?;

    let mut resolve = request.resolve.clone();
    if resolve.schedule.is_empty() {
        resolve.schedule = schedule_stem(&request.schedule);
    }
    let suite = resolve
        .suite
        .clone()
        .unwrap_or_else(|| default.suite().to_string());
    if !SUPPORTED_SUITES.contains(&suite.as_str()) {
        warn!(suite = %suite, "suite is not one of the known perf suites");
    }

    let specs = cross_product(&candidates, &resolve);
    info!(
        sections = candidates.len(),
        versions = resolve.versions.len(),
        unique = specs.len(),
        "resolved job configs"
    );

    let prefix = OutputLayout::new(&request.output_base, &suite, &resolve.compiler, 0).prefix;
    let index = next_directory_index(&request.output_base, &prefix);
    let layout = OutputLayout::new(&request.output_base, &suite, &resolve.compiler, index);

    let sections: Vec<JobTemplate> = specs
        .iter()
        .map(|spec| generated_section(spec, &layout, config))
        .collect();
    let schedule = render_schedule(&sections);
    let commands = command_dump(&specs, &resolve.tests, &layout, config, request.nosave);

    let script = RunnerScript {
        runner: config.runner.clone(),
        schedule: layout.schedule_path(),
        no_slurm: request.no_slurm,
        save_log: request.save_log,
        dryrun: request.dryrun,
        tests: resolve.tests.clone(),
        versions: resolve.versions.clone(),
        tag: default.tag().to_string(),
        custom: request.custom.clone(),
        invocation: request.invocation.clone(),
        config_count: specs.len(),
    }
    .render();

    Ok(Generated {
        layout,
        specs,
        schedule,
        commands,
        script,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionFilter {
    pub key: String,
    pub pattern: String,
    pub kind: MatchKind,
}

impl OptionFilter {
    pub fn new(key: &str, pattern: impl Into<String>, kind: MatchKind) -> Self {
        OptionFilter {
            key: key.to_string(),
            pattern: pattern.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub schedules: Vec<PathBuf>,
    pub filters: Vec<OptionFilter>,
    pub suite_type: Option<String>,
    pub host: Option<String>,
    /// Skip sections whose runtest options contain `-host`.
    pub skip_host: bool,
    pub shuffle: bool,
    pub firstrun: bool,
    pub firstrun_only: bool,
    pub submission: SubmissionOptions,
    pub lint: Option<LintPolicy>,
    pub check_reconstruct: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SubmitReport {
    pub jobs: Vec<(ResolvedJobSpec, SubmissionDescriptor)>,
    pub lint_issues: usize,
    pub mismatches: usize,
}

fn load_jobs(
    path: &Path,
    slurm: bool,
    skip_host: bool,
) -> Result<Vec<ResolvedJobSpec>, SchedError> {
    let templates = parse_schedule_file(path)?;
    let stem = schedule_stem(path);
    let mut jobs = Vec::with_capacity(templates.len());

    for template in &templates {
        if slurm && template.header.submission().is_none() {
            warn!(header = template.header.raw(), "section header has no submission command, skipping");
            continue;
        }
        if skip_host && template.params.contains_key("host") {
            warn!(header = template.header.raw(), "-host used in schedule, skipping");
            continue;
        }
        jobs.push(ResolvedJobSpec::from_template(template, &stem));
    }

    info!(path = %path.display(), jobs = jobs.len(), "read schedule");
    Ok(jobs)
}

/// The section as written, its option model, and the command rebuilt from
/// that model must all denote the same options.
fn check_reconstruct(template: &JobTemplate, canonical: bool) -> bool {
    let original = template.raw_command();
    let expected = template.options();
    let order = if canonical {
        KeyOrder::Canonical
    } else {
        KeyOrder::Parsed
    };
    let rebuilt = reconstruct_line(&expected, order);

    let same = match deconstruct(&original).and_then(|parsed| {
        Ok(parsed.same_options(&expected) && semantically_equal(&original, &rebuilt)?)
    }) {
        Ok(same) => same,
        Err(err) => {
            warn!(header = template.header.raw(), error = %err, "cannot compare reconstructed command");
            return false;
        }
    };
    if !same {
        warn!(header = template.header.raw(), "DIFF:\n{original}\n{rebuilt}");
        debug!(
            original = %normalize(&original).unwrap_or_default(),
            rebuilt = %normalize(&rebuilt).unwrap_or_default(),
            "canonical forms"
        );
    }
    same
}

/// Build submission descriptors for every job of the given schedules,
/// after filtering, shuffling and first-run ordering.
pub fn submit<C, R>(
    request: &SubmitRequest,
    config: &EngineConfig,
    catalog: &C,
    rng: &mut R,
) -> Result<SubmitReport, SchedError>
where
    C: TimeoutLookup + SuiteCountLookup + HostGroupResolver,
    R: Rng + ?Sized,
{
    if request.schedules.is_empty() {
        return Err(SchedError::IncompatibleOptions {
            message: "no schedule configuration file given".to_string(),
        });
    }

    let mut jobs = Vec::new();
    for path in &request.schedules {
        jobs.extend(load_jobs(path, request.submission.slurm, request.skip_host)?);
    }

    for filter in &request.filters {
        jobs = filter_by_option(jobs, &filter.key, &filter.pattern, filter.kind)?;
    }
    if let Some(host) = &request.host {
        jobs = filter_by_host(jobs, host)?;
    }
    if let Some(kind) = &request.suite_type {
        let suites = catalog.suites_of_type(kind);
        if suites.is_empty() {
            return Err(SchedError::InvalidFilter {
                message: format!("suite type '{kind}' does not contain any suites"),
            });
        }
        let escaped: Vec<String> = suites.iter().map(|suite| regex::escape(suite)).collect();
        let pattern = format!("^(?:{})$", escaped.join("|"));
        jobs = filter_by_option(jobs, "suite", &pattern, MatchKind::Regex)?;
    }

    if jobs.is_empty() {
        let names: Vec<String> = request.schedules.iter().map(|p| schedule_name(p)).collect();
        return Err(SchedError::NoMatchingConfig {
            context: " after filtering".to_string(),
            schedule: names.join(", "),
        });
    }

    if request.shuffle {
        jobs.shuffle(rng);
    }
    if request.firstrun || request.firstrun_only {
        jobs = firstrun(jobs, request.firstrun_only);
    }

    let mut report = SubmitReport::default();
    for job in jobs {
        let descriptor = build_descriptor(&job, &request.submission, config, catalog, rng);
        debug!(command = %descriptor.command_line(), "built submission");

        if request.check_reconstruct {
            if !check_reconstruct(&job.template, request.submission.canonical) {
                report.mismatches += 1;
            } else if let Err(err) = check_round_trip(&descriptor.runtime_line()) {
                warn!(error = %err, "runtime command does not round-trip");
                report.mismatches += 1;
            }
        } else if let Some(policy) = &request.lint {
            let options = effective_options(&job, &request.submission);
            report.lint_issues += lint(&options, &descriptor, policy);
        }

        report.jobs.push((job, descriptor));
    }

    info!(
        jobs = report.jobs.len(),
        lint_issues = report.lint_issues,
        mismatches = report.mismatches,
        "submission descriptors ready"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::SuiteCatalog;
    use crate::core::filter::OverrideDirective;
    use crate::core::job::Utility;
    use crate::core::schedule::parse_schedule;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::fs;

    const BASE: &str = "\
[grco-gcc main Snappy O3 (1) | sbatch --exclusive --partition perf -N 1]
compiler : grco-gcc
version : main
user : qa
suite : Snappy
tag : O3
f : '-O3'
perf :

[grco-gcc main Snappy O2 (2) | sbatch --exclusive --partition perf -w {n1, n2}]
compiler : grco-gcc
version : main
user : qa
suite : Snappy
tag : O2
f : '-O2'
perf :

[grco-gcc main CoreMark (3) | sbatch --partition perf -N 1]
compiler : grco-gcc
version : main
user : bob
suite : CoreMark
opts : -x
";

    fn write_schedule(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, BASE).unwrap();
        path
    }

    fn generate_request(dir: &Path) -> GenerateRequest {
        GenerateRequest {
            schedule: write_schedule(dir, "perf.cfg"),
            filter: FilterSpec::new(Some("Snappy".to_string()), None, Vec::new(), None).unwrap(),
            resolve: ResolveRequest {
                compiler: "grco/gcc".to_string(),
                versions: vec!["v1".to_string(), "v2".to_string()],
                tests: vec!["s000".to_string()],
                suite: Some("Snappy".to_string()),
                user: "qa".to_string(),
                utility: Some(Utility::Perf),
                ..ResolveRequest::default()
            },
            output_base: dir.to_path_buf(),
            invocation: "snapta generate".to_string(),
            ..GenerateRequest::default()
        }
    }

    #[test]
    fn generate_crosses_sections_and_versions() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("Snappy_grco_gcc_1")).unwrap();

        let request = generate_request(dir.path());
        let generated = generate(&request, &EngineConfig::default(), None).unwrap();
        assert_eq!(generated.specs.len(), 4);
        assert_eq!(generated.layout.dir_name(), "Snappy_grco_gcc_2");
        assert_eq!(generated.commands.len(), 4);

        let sections = parse_schedule(&generated.schedule);
        assert_eq!(sections.len(), 4);
        assert_eq!(sections[0].header.label(), "grco/gcc v1 Snappy O3 (1)");
        assert_eq!(sections[1].header.label(), "grco/gcc v2 Snappy O3 (1)");
        assert_eq!(sections[0].param("perf"), "");
        assert!(sections[0].params.contains_key("perf"));
        assert!(generated.script.contains("--override 'test=s000'"));
    }

    #[test]
    fn generate_with_flag_override_keeps_one_section() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = generate_request(dir.path());
        let directive = OverrideDirective::parse("f='-O1 -g'").unwrap();
        request.mode = OverrideMode::new(false, None, &directive);
        request.resolve.directive = directive;

        let generated = generate(&request, &EngineConfig::default(), None).unwrap();
        assert_eq!(generated.specs.len(), 2);
        assert!(generated.specs.iter().all(|spec| spec.tag == "cpu" && spec.flags == "-O1 -g"));
    }

    #[test]
    fn generate_reports_missing_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = generate_request(dir.path());
        request.schedule = dir.path().join("absent.cfg");
        assert!(matches!(
            generate(&request, &EngineConfig::default(), None),
            Err(SchedError::ScheduleNotFound { .. })
        ));
    }

    fn submit_request(dir: &Path) -> SubmitRequest {
        SubmitRequest {
            schedules: vec![write_schedule(dir, "perf.cfg")],
            submission: SubmissionOptions {
                slurm: true,
                invoking_user: "alice".to_string(),
                ..SubmissionOptions::default()
            },
            ..SubmitRequest::default()
        }
    }

    fn run_submit(request: &SubmitRequest) -> Result<SubmitReport, SchedError> {
        submit(
            request,
            &EngineConfig::default(),
            &SuiteCatalog::new(),
            &mut StdRng::seed_from_u64(3),
        )
    }

    #[test]
    fn submit_builds_descriptor_per_section() {
        let dir = tempfile::tempdir().unwrap();
        let report = run_submit(&submit_request(dir.path())).unwrap();

        assert_eq!(report.jobs.len(), 3);
        let (job, descriptor) = &report.jobs[0];
        assert_eq!(job.schedule, "perf");
        assert!(descriptor
            .submission_wrapper
            .starts_with("sbatch --exclusive --partition perf -N 1 --export=HOME"));
        assert!(descriptor.submission_wrapper.contains("--wrap 'runtest -compiler grco-gcc"));
    }

    #[test]
    fn submit_filters_and_lints() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = submit_request(dir.path());
        request.filters = vec![OptionFilter::new("suite", "Core", MatchKind::Regex)];
        request.lint = Some(LintPolicy::default());

        let report = run_submit(&request).unwrap();
        assert_eq!(report.jobs.len(), 1);
        assert_eq!(report.lint_issues, 1);

        request.filters = vec![OptionFilter::new("tag", "O9", MatchKind::Equal)];
        assert!(matches!(
            run_submit(&request),
            Err(SchedError::NoMatchingConfig { .. })
        ));
    }

    #[test]
    fn submit_host_filter_and_firstrun() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = submit_request(dir.path());
        request.host = Some("n2".to_string());
        let report = run_submit(&request).unwrap();
        assert_eq!(report.jobs.len(), 1);
        assert_eq!(report.jobs[0].0.tag, "O2");

        let mut request = submit_request(dir.path());
        request.firstrun_only = true;
        let report = run_submit(&request).unwrap();
        assert_eq!(report.jobs.len(), 2);
        assert!(report
            .jobs
            .iter()
            .all(|(_, descriptor)| descriptor.submission_wrapper.contains("--partition firstrun")));
    }

    #[test]
    fn check_reconstruct_flags_ambiguous_sections() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = submit_request(dir.path());
        request.check_reconstruct = true;
        request.submission.slurm = false;

        let report = run_submit(&request).unwrap();
        assert_eq!(report.jobs.len(), 3);
        assert_eq!(report.mismatches, 1);
        assert!(report.jobs.iter().all(|(_, d)| d.submission_wrapper.is_empty()));
    }
}
