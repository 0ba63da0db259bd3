use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::core::command::OptionModel;
use crate::core::config::DEFAULT_ALLOWED_USERS;
use crate::core::submission::SubmissionDescriptor;

static RE_HPCX: Lazy<Regex> = Lazy::new(|| Regex::new(r"--constraint \S*hpcx\S*").unwrap());
static RE_OPENMPI4: Lazy<Regex> = Lazy::new(|| Regex::new(r"--constraint \S*openmpi4\S*").unwrap());
static RE_MULTI_NODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"-N [2-9][0-9]*").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintPolicy {
    pub strict: bool,
    pub allowed_users: Vec<String>,
}

impl Default for LintPolicy {
    fn default() -> Self {
        LintPolicy {
            strict: true,
            allowed_users: DEFAULT_ALLOWED_USERS.iter().map(|u| u.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LintFinding {
    PerfNotExclusive,
    PinnedHost,
    HpcxConstraintMissing,
    OpenMpi4ConstraintMissing,
    MpiNeedsHpcx,
    MpiNeedsOpenMpi4,
    HostOption,
    GpuNotRequested,
    MultiNode,
    NodeCountMissing,
    UserNotAllowed(String),
    Unparseable(String),
}

impl fmt::Display for LintFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LintFinding::PerfNotExclusive => write!(f, "performance job not run exclusively"),
            LintFinding::PinnedHost => {
                write!(f, "tests should not be scheduled to run on specific systems")
            }
            LintFinding::HpcxConstraintMissing => {
                write!(f, "runtest -mpi hpcx used without requiring hpcx node property")
            }
            LintFinding::OpenMpi4ConstraintMissing => {
                write!(f, "runtest -mpi openmpi4 used without requiring openmpi4 node property")
            }
            LintFinding::MpiNeedsHpcx => write!(
                f,
                "runtest -mpi mpi used without requiring hpcx node property on x86_64/aarch64"
            ),
            LintFinding::MpiNeedsOpenMpi4 => write!(
                f,
                "runtest -mpi mpi used without requiring openmpi4 node property on ppc64le"
            ),
            LintFinding::HostOption => write!(f, "runtest -host should not be used"),
            LintFinding::GpuNotRequested => {
                write!(f, "runtest -sim rungpu used without requesting any GPUs")
            }
            LintFinding::MultiNode => write!(f, "more than 1 node requested"),
            LintFinding::NodeCountMissing => write!(f, "the number of nodes is not specified"),
            LintFinding::UserNotAllowed(user) => write!(f, "user '{user}' is not an allowed user"),
            LintFinding::Unparseable(message) => write!(f, "error parsing command line, {message}"),
        }
    }
}

/// Policy checks over a job's options and its submission string.
pub fn lint_findings(
    options: &OptionModel,
    descriptor: &SubmissionDescriptor,
    policy: &LintPolicy,
) -> Vec<LintFinding> {
    let sbatch = descriptor.submission_wrapper.as_str();
    let text = |key: &str| options.text(key).unwrap_or_default();
    let mpi = text("mpi");
    let osversion = text("osversion");
    let mut findings = Vec::new();

    if options.contains("perf") {
        if !sbatch.contains("--exclusive") {
            findings.push(LintFinding::PerfNotExclusive);
        }
    } else {
        if policy.strict && sbatch.contains(" -w") {
            findings.push(LintFinding::PinnedHost);
        }
        if mpi == "hpcx" && !RE_HPCX.is_match(sbatch) {
            findings.push(LintFinding::HpcxConstraintMissing);
        }
        if mpi == "openmpi4" && !RE_OPENMPI4.is_match(sbatch) {
            findings.push(LintFinding::OpenMpi4ConstraintMissing);
        }
        if mpi == "mpi"
            && matches!(osversion.as_str(), "Linux_aarch64" | "Linux_x86_64")
            && !RE_HPCX.is_match(sbatch)
        {
            findings.push(LintFinding::MpiNeedsHpcx);
        }
        if mpi == "mpi" && osversion == "Linux_ppc64le" && !RE_OPENMPI4.is_match(sbatch) {
            findings.push(LintFinding::MpiNeedsOpenMpi4);
        }
    }

    if options.contains("host") {
        findings.push(LintFinding::HostOption);
    }

    if text("sim") == "rungpu"
        && !sbatch.contains("--gpu")
        && !(text("env").contains("OMP_TARGET_OFFLOAD=DISABLED") || sbatch.contains("--exclusive"))
    {
        findings.push(LintFinding::GpuNotRequested);
    }

    if RE_MULTI_NODE.is_match(sbatch) {
        findings.push(LintFinding::MultiNode);
    }

    if policy.strict && !sbatch.contains(" -N") && !sbatch.contains(" -w") {
        findings.push(LintFinding::NodeCountMissing);
    }

    let user = text("user");
    if !policy.allowed_users.iter().any(|allowed| *allowed == user) {
        findings.push(LintFinding::UserNotAllowed(user));
    }

    if let Err(err) = shell_words::split(&descriptor.command_line()) {
        findings.push(LintFinding::Unparseable(err.to_string()));
    }

    findings
}

/// Number of policy violations, each reported as a warning with the command.
pub fn lint(
    options: &OptionModel,
    descriptor: &SubmissionDescriptor,
    policy: &LintPolicy,
) -> usize {
    let findings = lint_findings(options, descriptor, policy);
    let command = descriptor.command_line();
    for finding in &findings {
        warn!(command = %command, "{finding}");
    }
    findings.len()
}
