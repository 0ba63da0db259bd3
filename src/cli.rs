use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use crate::core::catalog::SuiteCatalog;
use crate::core::command::parse_key_values;
use crate::core::config::{invoking_user, EngineConfig};
use crate::core::error::SchedError;
use crate::core::filter::{FilterSpec, MatchKind, OverrideDirective, OverrideMode};
use crate::core::job::{ResolveRequest, Utility};
use crate::core::lint::LintPolicy;
use crate::core::submission::SubmissionOptions;
use crate::core::{generate, submit, GenerateRequest, Generated, OptionFilter, SubmitRequest};

#[derive(Debug, Parser)]
#[command(
    name = "snapta",
    about = "Compose and submit compiler benchmark schedules",
    disable_version_flag = true
)]
pub struct Cli {
    /// Debug logging unless SNAPTA_LOG or LOGLEVEL is set
    #[arg(short = 't', long, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Build a new schedule from the matching sections of a base schedule
    Generate(GenerateArgs),
    /// Turn schedule sections into cluster submission commands
    Submit(SubmitArgs),
}

#[derive(Debug, Args)]
pub struct GenerateArgs {
    /// Base schedule file
    #[arg(long = "ta", value_name = "FILE")]
    pub schedule: PathBuf,
    #[arg(long)]
    pub compiler: String,
    #[arg(long = "version", num_args = 1.., required = true)]
    pub versions: Vec<String>,
    #[arg(long = "test", num_args = 1.., required = true)]
    pub tests: Vec<String>,
    #[arg(long)]
    pub suite: Option<String>,
    #[arg(long = "suitetype")]
    pub suite_type: Option<String>,
    /// Suite catalog: `<suite> <build> <exec> [tests] [type]` per line
    #[arg(long, value_name = "FILE")]
    pub catalog: Option<PathBuf>,
    #[arg(long)]
    pub user: Option<String>,
    /// Keep sections with these tags; `*` keeps all
    #[arg(long = "tag", num_args = 1..)]
    pub tags: Vec<String>,
    /// Keep sections whose flags match this case-insensitive regex
    #[arg(long = "flag", conflicts_with = "tags")]
    pub flag_pattern: Option<String>,
    /// Treat all matching sections as one configuration tagged `cpu`
    #[arg(long)]
    pub override_flag: bool,
    #[arg(long)]
    pub override_tag: Option<String>,
    /// `key=value ...` replacements applied to every section
    #[arg(long = "override")]
    pub directive: Option<String>,
    #[arg(long)]
    pub osversion: Option<String>,
    #[arg(long)]
    pub env: Option<String>,
    #[arg(short = 'f', long = "flags", allow_hyphen_values = true)]
    pub flags: Option<String>,
    /// Append --osversion/--env/--flags to the section values instead of replacing them
    #[arg(long)]
    pub append: bool,
    #[arg(long, value_enum, default_value_t = Utility::Perf)]
    pub utility: Utility,
    /// Output base directory (default: home)
    #[arg(long)]
    pub path: Option<PathBuf>,
    #[arg(long)]
    pub nosave: bool,
    #[arg(long)]
    pub no_slurm: bool,
    #[arg(long)]
    pub save_log: bool,
    /// Print the commands instead of writing any files
    #[arg(long)]
    pub dryrun: bool,
    /// Extra `key=value` overrides for the runner script
    #[arg(long)]
    pub custom: Option<String>,
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    #[arg(value_name = "SCHEDULE", required = true)]
    pub schedules: Vec<PathBuf>,
    #[arg(long)]
    pub compiler: Option<String>,
    #[arg(long = "f", allow_hyphen_values = true)]
    pub flags: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    pub cflags: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    pub cxxflags: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    pub fcflags: Option<String>,
    #[arg(long)]
    pub osversion: Option<String>,
    #[arg(long)]
    pub suite: Option<String>,
    #[arg(long = "suitetype")]
    pub suite_type: Option<String>,
    #[arg(long = "version")]
    pub version_filter: Option<String>,
    /// Only sections pinned to this host
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long, value_name = "FILE")]
    pub catalog: Option<PathBuf>,
    /// `key=value` extensions of runtest options
    #[arg(long, num_args = 1..)]
    pub append: Vec<String>,
    /// `key=value` replacements of runtest options (`false` removes)
    #[arg(long = "override", num_args = 1..)]
    pub overrides: Vec<String>,
    #[arg(long)]
    pub canonical: bool,
    #[arg(long)]
    pub partition: Option<String>,
    #[arg(long)]
    pub force_partition: bool,
    #[arg(long)]
    pub nodelist: Option<String>,
    /// Job name; %F schedule, %N host, %P partition, %u invoking user, %U job user
    #[arg(long)]
    pub jobname: Option<String>,
    #[arg(long = "add-timehints")]
    pub time_hints: bool,
    #[arg(long)]
    pub save_log: bool,
    #[arg(long)]
    pub test_only: bool,
    #[arg(long)]
    pub no_slurm: bool,
    #[arg(long)]
    pub dryrun: bool,
    #[arg(long)]
    pub lint: bool,
    #[arg(long)]
    pub strict: bool,
    #[arg(long)]
    pub check_reconstruct: bool,
    /// Skip sections that use `-host`
    #[arg(long)]
    pub check_host: bool,
    #[arg(long)]
    pub shuffle: bool,
    #[arg(long)]
    pub firstrun: bool,
    #[arg(long)]
    pub firstrun_only: bool,
}

fn load_catalog(path: Option<&Path>) -> Result<SuiteCatalog, SchedError> {
    match path {
        Some(path) => {
            let catalog = SuiteCatalog::load(path)?;
            if catalog.is_empty() {
                warn!(path = %path.display(), "suite catalog lists no suites, using default timeouts");
            }
            Ok(catalog)
        }
        None => Ok(SuiteCatalog::new()),
    }
}

fn incompatible(message: impl Into<String>) -> SchedError {
    SchedError::IncompatibleOptions {
        message: message.into(),
    }
}

pub fn execute(command: Commands) -> Result<(), SchedError> {
    let config = EngineConfig::from_env();
    match command {
        Commands::Generate(args) => run_generate(args, &config),
        Commands::Submit(args) => run_submit(args, &config),
    }
}

fn run_generate(args: GenerateArgs, config: &EngineConfig) -> Result<(), SchedError> {
    if args.no_slurm && args.save_log {
        return Err(incompatible("--save-log is incompatible with --no-slurm"));
    }

    let catalog = load_catalog(args.catalog.as_deref())?;
    let directive = OverrideDirective::parse(args.directive.as_deref().unwrap_or_default())?;
    let mode = OverrideMode::new(args.override_flag, args.override_tag.clone(), &directive);
    let filter = FilterSpec::new(
        args.suite.clone(),
        args.suite_type.clone(),
        args.tags.clone(),
        args.flag_pattern.clone(),
    )?;

    let request = GenerateRequest {
        schedule: args.schedule,
        filter,
        mode,
        resolve: ResolveRequest {
            compiler: args.compiler,
            versions: args.versions,
            tests: args.tests,
            suite: args.suite,
            user: args.user.unwrap_or_else(invoking_user),
            osversion: args.osversion,
            env: args.env,
            flags: args.flags,
            utility: Some(args.utility),
            append: args.append,
            directive,
            schedule: String::new(),
        },
        output_base: args.path.unwrap_or_else(|| config.output_base.clone()),
        nosave: args.nosave,
        no_slurm: args.no_slurm,
        save_log: args.save_log,
        dryrun: args.dryrun,
        custom: args.custom,
        invocation: std::env::args().collect::<Vec<_>>().join(" "),
    };

    let generated = generate(&request, config, Some(&catalog))?;

    if args.dryrun {
        println!("Schedule file: {}", generated.layout.schedule_path().display());
        for (index, command) in generated.commands.iter().enumerate() {
            println!("{:2}. {command}", index + 1);
        }
        return Ok(());
    }

    write_outputs(&generated, &request.resolve.versions)
}

fn write_outputs(generated: &Generated, versions: &[String]) -> Result<(), SchedError> {
    let output_dir = generated.layout.output_dir();
    fs::create_dir_all(&output_dir).map_err(|err| SchedError::io(&output_dir, err))?;
    for version in versions {
        let dir = generated.layout.version_dir(version);
        fs::create_dir_all(&dir).map_err(|err| SchedError::io(&dir, err))?;
    }

    let schedule_path = generated.layout.schedule_path();
    fs::write(&schedule_path, &generated.schedule)
        .map_err(|err| SchedError::io(&schedule_path, err))?;
    info!(path = %schedule_path.display(), configs = generated.specs.len(), "wrote schedule");

    let script_path = generated.layout.script_path();
    fs::write(&script_path, &generated.script).map_err(|err| SchedError::io(&script_path, err))?;
    make_executable(&script_path)?;
    info!(path = %script_path.display(), "wrote runner script");

    println!("{}", schedule_path.display());
    println!("{}", script_path.display());
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), SchedError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .map_err(|err| SchedError::io(path, err))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), SchedError> {
    Ok(())
}

fn submit_filters(args: &SubmitArgs) -> Vec<OptionFilter> {
    let mut filters = Vec::new();
    if let Some(compiler) = &args.compiler {
        filters.push(OptionFilter::new("compiler", compiler.clone(), MatchKind::Equal));
    }
    for (key, pattern) in [
        ("f", &args.flags),
        ("cflags", &args.cflags),
        ("cxxflags", &args.cxxflags),
        ("fcflags", &args.fcflags),
    ] {
        if let Some(pattern) = pattern {
            filters.push(OptionFilter::new(key, pattern.clone(), MatchKind::Regex));
        }
    }
    if let Some(osversion) = &args.osversion {
        filters.push(OptionFilter::new("osversion", osversion.clone(), MatchKind::Equal));
    }
    if let Some(suite) = &args.suite {
        filters.push(OptionFilter::new("suite", suite.clone(), MatchKind::Regex));
    }
    if let Some(version) = &args.version_filter {
        filters.push(OptionFilter::new("version", version.clone(), MatchKind::Equal));
    }
    filters
}

fn run_submit(args: SubmitArgs, config: &EngineConfig) -> Result<(), SchedError> {
    let mut slurm = !args.no_slurm;
    if !slurm {
        for (set, name) in [
            (args.time_hints, "add-timehints"),
            (args.jobname.is_some(), "jobname"),
            (args.nodelist.is_some(), "nodelist"),
            (args.partition.is_some(), "partition"),
            (args.save_log, "save-log"),
            (args.test_only, "test-only"),
        ] {
            if set {
                return Err(incompatible(format!("--{name} is incompatible with --no-slurm")));
            }
        }
    }
    if args.suite.is_some() && args.suite_type.is_some() {
        return Err(incompatible("--suite and --suitetype are mutually exclusive"));
    }
    if args.check_reconstruct && slurm {
        info!("setting --no-slurm in order to use --check-reconstruct");
        slurm = false;
    }
    if args.firstrun_only && !args.firstrun {
        info!("setting --firstrun in order to use --firstrun-only");
    }

    let catalog = load_catalog(args.catalog.as_deref())?;
    let request = SubmitRequest {
        filters: submit_filters(&args),
        schedules: args.schedules,
        suite_type: args.suite_type,
        host: args.host,
        skip_host: args.check_host,
        shuffle: args.shuffle,
        firstrun: args.firstrun || args.firstrun_only,
        firstrun_only: args.firstrun_only,
        submission: SubmissionOptions {
            partition: args.partition,
            force_partition: args.force_partition,
            nodelist: args.nodelist,
            jobname: args.jobname,
            time_hints: args.time_hints,
            save_log: args.save_log,
            test_only: args.test_only,
            invoking_user: invoking_user(),
            slurm,
            canonical: args.canonical,
            append: parse_key_values(&args.append)?,
            overrides: parse_key_values(&args.overrides)?,
        },
        lint: args.lint.then(|| LintPolicy {
            strict: args.strict,
            allowed_users: config.allowed_users.clone(),
        }),
        check_reconstruct: args.check_reconstruct,
    };

    let report = submit(&request, config, &catalog, &mut rand::thread_rng())?;

    if args.check_reconstruct {
        info!(checked = report.jobs.len(), mismatches = report.mismatches, "reconstruction check finished");
        return Ok(());
    }
    if args.lint {
        if report.lint_issues > 0 {
            return Err(SchedError::LintFailed {
                count: report.lint_issues,
            });
        }
        info!(jobs = report.jobs.len(), "no lint issues detected");
        return Ok(());
    }

    for (index, (_, descriptor)) in report.jobs.iter().enumerate() {
        if args.dryrun {
            println!("{:2}. {}", index + 1, descriptor.command_line());
        } else {
            println!("{}", descriptor.command_line());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("snapta").chain(args.iter().copied()))
    }

    #[test]
    fn generate_accepts_multiple_versions_and_tests() {
        let cli = parse(&[
            "generate",
            "--ta",
            "perf.cfg",
            "--compiler",
            "gcc",
            "--version",
            "v1",
            "v2",
            "--test",
            "a",
            "-f",
            "-O3",
        ])
        .unwrap();
        let Commands::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        assert_eq!(args.versions, vec!["v1".to_string(), "v2".to_string()]);
        assert_eq!(args.flags.as_deref(), Some("-O3"));
        assert_eq!(args.utility, Utility::Perf);
    }

    #[test]
    fn generate_rejects_tags_with_flag_pattern() {
        assert!(parse(&[
            "generate",
            "--ta",
            "p.cfg",
            "--compiler",
            "gcc",
            "--version",
            "v1",
            "--test",
            "a",
            "--tag",
            "O3",
            "--flag",
            "O2",
        ])
        .is_err());
    }

    #[test]
    fn submit_rejects_slurm_options_without_slurm() {
        let cli = parse(&["submit", "perf.cfg", "--no-slurm", "--partition", "gpu"]).unwrap();
        let err = execute(cli.command).unwrap_err();
        assert_eq!(err.to_string(), "--partition is incompatible with --no-slurm");
    }

    #[test]
    fn submit_collects_option_filters() {
        let cli = parse(&[
            "submit",
            "a.cfg",
            "b.cfg",
            "--compiler",
            "gcc",
            "--f",
            "-O3",
            "--suite",
            "Snap",
        ])
        .unwrap();
        let Commands::Submit(args) = cli.command else {
            panic!("expected submit");
        };
        assert_eq!(args.schedules.len(), 2);
        assert_eq!(
            submit_filters(&args),
            vec![
                OptionFilter::new("compiler", "gcc", MatchKind::Equal),
                OptionFilter::new("f", "-O3", MatchKind::Regex),
                OptionFilter::new("suite", "Snap", MatchKind::Regex),
            ]
        );
    }

    #[test]
    fn generate_writes_schedule_and_script() {
        let dir = tempfile::tempdir().unwrap();
        let schedule = dir.path().join("base.cfg");
        fs::write(&schedule, "[s | sbatch --exclusive -N 1]\nsuite : Snappy\ntag : O3\n").unwrap();
        let out = dir.path().join("out");

        let cli = parse(&[
            "generate",
            "--ta",
            schedule.to_str().unwrap(),
            "--compiler",
            "gcc",
            "--version",
            "v1",
            "--test",
            "a",
            "--user",
            "qa",
            "--path",
            out.to_str().unwrap(),
        ])
        .unwrap();
        execute(cli.command).unwrap();

        let written = out.join("Snappy_gcc_0");
        assert!(written.join("Snappy_gcc.cfg").is_file());
        assert!(written.join("v1").is_dir());
        let script = written.join("snap_perf.sh");
        assert!(fs::read_to_string(&script).unwrap().contains("--override 'test=a'"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(fs::metadata(&script).unwrap().permissions().mode() & 0o777, 0o755);
        }
    }
}
