use regex::{Regex, RegexBuilder};
use tracing::{debug, info, warn};

use crate::core::catalog::HostGroupResolver;
use crate::core::error::SchedError;
use crate::core::job::ResolvedJobSpec;
use crate::core::schedule::{JobTemplate, Params};
use crate::core::submission::{add_or_replace, has_arg, ArgValue};

pub const WILDCARD: &str = "*";
pub const FLAG_OVERRIDE_TAG: &str = "cpu";
pub const FIRSTRUN_PARTITION: &str = "firstrun";

/// Which templates to keep. Tags and a flag pattern are mutually exclusive,
/// as are a suite and a suite type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSpec {
    suite: Option<String>,
    suite_type: Option<String>,
    tags: Vec<String>,
    flag_pattern: Option<String>,
}

impl FilterSpec {
    pub fn new(
        suite: Option<String>,
        suite_type: Option<String>,
        tags: Vec<String>,
        flag_pattern: Option<String>,
    ) -> Result<Self, SchedError> {
        if !tags.is_empty() && flag_pattern.is_some() {
            return Err(SchedError::InvalidFilter {
                message: "tags and a flag pattern cannot be combined".to_string(),
            });
        }
        if suite.is_some() && suite_type.is_some() {
            return Err(SchedError::InvalidFilter {
                message: "suite and suite type are mutually exclusive".to_string(),
            });
        }
        Ok(FilterSpec {
            suite,
            suite_type,
            tags,
            flag_pattern,
        })
    }

    pub fn suite(&self) -> Option<&str> {
        self.suite.as_deref()
    }

    pub fn suite_type(&self) -> Option<&str> {
        self.suite_type.as_deref()
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn flag_pattern(&self) -> Option<&str> {
        self.flag_pattern.as_deref()
    }

    fn suite_context(&self) -> String {
        match (&self.suite, &self.suite_type) {
            (Some(suite), _) => format!(" for suite '{suite}'"),
            (None, Some(kind)) => format!(" for suite type '{kind}'"),
            (None, None) => String::new(),
        }
    }
}

/// `key=value ...` replacements given on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideDirective {
    raw: String,
    params: Params,
}

impl OverrideDirective {
    pub fn parse(raw: &str) -> Result<Self, SchedError> {
        let parts = match shell_words::split(raw) {
            Ok(parts) => parts,
            Err(err) => {
                warn!(raw, error = %err, "override is not valid shell syntax, splitting on whitespace");
                raw.split_whitespace().map(str::to_string).collect()
            }
        };

        let mut params = Params::new();
        for part in parts {
            let Some((key, value)) = part.split_once('=') else {
                warn!(part = %part, raw, "invalid override format, expected key=value");
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(SchedError::InvalidOverride {
                    raw: raw.to_string(),
                    message: format!("'{part}' has an empty key"),
                });
            }
            params.insert(key, value.trim());
        }

        Ok(OverrideDirective {
            raw: raw.to_string(),
            params,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key)
    }

    pub fn tag(&self) -> Option<&str> {
        self.get("tag")
    }

    pub fn has_flag(&self) -> bool {
        self.params.contains_key("f")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideMode {
    pub flag: bool,
    pub tag: Option<String>,
}

impl OverrideMode {
    /// A directive `tag` takes over the tag override; a directive `f` always
    /// switches on the flag override.
    pub fn new(flag: bool, tag: Option<String>, directive: &OverrideDirective) -> Self {
        OverrideMode {
            flag: flag || directive.has_flag(),
            tag: directive.tag().map(str::to_string).or(tag),
        }
    }
}

pub fn filter_by_suite(templates: &[JobTemplate], suite: &str) -> Vec<JobTemplate> {
    templates
        .iter()
        .filter(|template| template.suite() == suite)
        .cloned()
        .collect()
}

pub fn filter_by_suites(templates: &[JobTemplate], suites: &[String]) -> Vec<JobTemplate> {
    templates
        .iter()
        .filter(|template| suites.iter().any(|suite| suite == template.suite()))
        .cloned()
        .collect()
}

/// Every template matching each requested tag, tag by tag. The wildcard
/// matches every template.
pub fn filter_by_tags(templates: &[JobTemplate], tags: &[String]) -> Vec<JobTemplate> {
    let mut kept = Vec::new();
    for tag in tags {
        for template in templates {
            if tag == WILDCARD || template.tag() == tag {
                kept.push(template.clone());
            }
        }
    }
    kept
}

pub fn filter_by_flag(
    templates: &[JobTemplate],
    pattern: &str,
) -> Result<Vec<JobTemplate>, SchedError> {
    if pattern == WILDCARD {
        return Ok(templates.to_vec());
    }
    let regex = RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| SchedError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;
    Ok(templates
        .iter()
        .filter(|template| regex.is_match(template.flags()))
        .cloned()
        .collect())
}

pub fn apply_overrides(candidates: Vec<JobTemplate>, mode: &OverrideMode) -> Vec<JobTemplate> {
    match (mode.flag, mode.tag.as_deref()) {
        (true, None) => candidates
            .first()
            .map(|first| vec![first.with_param("tag", FLAG_OVERRIDE_TAG)])
            .unwrap_or_default(),
        (true, Some(tag)) => candidates
            .first()
            .map(|first| vec![first.with_param("tag", tag)])
            .unwrap_or_default(),
        (false, Some(tag)) => candidates
            .iter()
            .map(|template| {
                let existing = template.tag();
                if existing.is_empty() {
                    template.with_param("tag", tag)
                } else {
                    template.with_param("tag", format!("{existing}_{tag}"))
                }
            })
            .collect(),
        (false, None) => candidates,
    }
}

/// Suite filter, then tag/flag filter, then overrides. An empty result is an
/// error naming the stage that emptied it.
pub fn select(
    templates: &[JobTemplate],
    filter: &FilterSpec,
    mode: &OverrideMode,
    resolver: Option<&dyn HostGroupResolver>,
    schedule: &str,
) -> Result<Vec<JobTemplate>, SchedError> {
    let no_match = |context: String| SchedError::NoMatchingConfig {
        context,
        schedule: schedule.to_string(),
    };

    let suite_filtered = match (filter.suite(), filter.suite_type()) {
        (Some(suite), _) => filter_by_suite(templates, suite),
        (None, Some(kind)) => {
            let suites = resolver.map(|r| r.suites_of_type(kind)).unwrap_or_default();
            if suites.is_empty() {
                return Err(SchedError::InvalidFilter {
                    message: format!("suite type '{kind}' does not contain any suites"),
                });
            }
            filter_by_suites(templates, &suites)
        }
        (None, None) => templates.to_vec(),
    };
    if suite_filtered.is_empty() {
        return Err(no_match(filter.suite_context()));
    }
    debug!(kept = suite_filtered.len(), "suite filter applied");

    let narrowed = if !filter.tags().is_empty() {
        let kept = filter_by_tags(&suite_filtered, filter.tags());
        if kept.is_empty() {
            return Err(no_match(format!(
                " with tags '{}'{}",
                filter.tags().join(", "),
                filter.suite_context()
            )));
        }
        kept
    } else if let Some(pattern) = filter.flag_pattern() {
        let kept = filter_by_flag(&suite_filtered, pattern)?;
        if kept.is_empty() {
            return Err(no_match(format!(
                " with flag '{pattern}'{}",
                filter.suite_context()
            )));
        }
        kept
    } else {
        suite_filtered
    };

    let selected = apply_overrides(narrowed, mode);
    if mode.flag {
        info!(tag = mode.tag.as_deref().unwrap_or(FLAG_OVERRIDE_TAG), "flag override: configs treated as equivalent");
    } else if let Some(tag) = &mode.tag {
        info!(tag = %tag, "tag override: appending to existing tags");
    }
    info!(sections = selected.len(), "matching job configs");
    Ok(selected)
}

/// The template that supplies defaults, if any survived filtering.
pub fn pick_default(candidates: &[JobTemplate]) -> Option<&JobTemplate> {
    candidates.first()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Option text equals the value exactly.
    Equal,
    /// Option text contains a match of the pattern.
    Regex,
    /// The submission template contains a match of the pattern.
    Submission,
}

pub fn filter_by_option(
    jobs: Vec<ResolvedJobSpec>,
    key: &str,
    pattern: &str,
    kind: MatchKind,
) -> Result<Vec<ResolvedJobSpec>, SchedError> {
    let regex = match kind {
        MatchKind::Equal => None,
        MatchKind::Regex | MatchKind::Submission => {
            Some(Regex::new(pattern).map_err(|source| SchedError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?)
        }
    };

    let before = jobs.len();
    let kept: Vec<ResolvedJobSpec> = jobs
        .into_iter()
        .filter(|job| match (kind, &regex) {
            (MatchKind::Submission, Some(regex)) => regex.is_match(&job.submission),
            (_, Some(regex)) => regex.is_match(&job.options().text(key).unwrap_or_default()),
            (_, None) => job.options().text(key).as_deref() == Some(pattern),
        })
        .collect();
    debug!(key, pattern, before, after = kept.len(), "option filter applied");
    Ok(kept)
}

/// Jobs whose submission pins them to `host` via `-w` or `--nodelist`.
pub fn filter_by_host(
    jobs: Vec<ResolvedJobSpec>,
    host: &str,
) -> Result<Vec<ResolvedJobSpec>, SchedError> {
    let pattern =
        format!(r"(?:-w|--nodelist)(?:\s+|=)(?:\{{[^}}]*[{{,]\s*|\{{)?{host}(?:\s|,|\}}|$)");
    let jobs: Vec<ResolvedJobSpec> = jobs
        .into_iter()
        .filter(|job| has_arg(&job.submission, "-w") || has_arg(&job.submission, "--nodelist"))
        .collect();
    filter_by_option(jobs, "", &pattern, MatchKind::Submission)
}

/// Move the first job of every (suite, schedule) pair to the front and send
/// it to the firstrun partition. With `only`, drop the rest.
pub fn firstrun(jobs: Vec<ResolvedJobSpec>, only: bool) -> Vec<ResolvedJobSpec> {
    let mut seen: Vec<(String, String)> = Vec::new();
    let mut first = Vec::new();
    let mut residual = Vec::new();

    for mut job in jobs {
        let token = (job.suite.clone(), job.schedule.clone());
        if seen.contains(&token) {
            residual.push(job);
            continue;
        }
        seen.push(token);
        job.submission = add_or_replace(
            &job.submission,
            "--partition",
            &ArgValue::Spaced(FIRSTRUN_PARTITION.to_string()),
            true,
        );
        first.push(job);
    }

    if !only {
        first.extend(residual);
    }
    first
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schedule::parse_schedule;

    struct Groups;

    impl HostGroupResolver for Groups {
        fn suites_of_type(&self, kind: &str) -> Vec<String> {
            match kind {
                "perf" => vec!["Snappy".to_string(), "Folly".to_string()],
                _ => Vec::new(),
            }
        }
    }

    const SCHEDULE: &str = "\
[one | sbatch -N 1]
suite : Snappy
tag : A
f : -O2

[two | sbatch -N 1]
suite : Snappy
tag : A
f : -O3 -flto

[three | sbatch -N 1]
suite : Snappy
tag : B
f : -Ofast

[four | sbatch -N 1]
suite : CoreMark
tag : A
f : -O3
";

    fn templates() -> Vec<JobTemplate> {
        parse_schedule(SCHEDULE)
    }

    fn labels(templates: &[JobTemplate]) -> Vec<&str> {
        templates.iter().map(|t| t.header.label()).collect()
    }

    fn filter(suite: Option<&str>, tags: &[&str], flag: Option<&str>) -> FilterSpec {
        FilterSpec::new(
            suite.map(str::to_string),
            None,
            tags.iter().map(|t| t.to_string()).collect(),
            flag.map(str::to_string),
        )
        .unwrap()
    }

    #[test]
    fn tag_filter_keeps_matching_sections_in_order() {
        let selected = select(
            &templates(),
            &filter(Some("Snappy"), &["A"], None),
            &OverrideMode::default(),
            None,
            "perf.cfg",
        )
        .unwrap();
        assert_eq!(labels(&selected), vec!["one", "two"]);
    }

    #[test]
    fn wildcard_tag_bypasses_tag_equality() {
        let selected = filter_by_tags(&filter_by_suite(&templates(), "Snappy"), &["*".to_string()]);
        assert_eq!(labels(&selected), vec!["one", "two", "three"]);
    }

    #[test]
    fn flag_pattern_is_case_insensitive_regex() {
        let selected = filter_by_flag(&templates(), "o3").unwrap();
        assert_eq!(labels(&selected), vec!["two", "four"]);
        assert_eq!(filter_by_flag(&templates(), "*").unwrap().len(), 4);
        assert!(matches!(
            filter_by_flag(&templates(), "(").unwrap_err(),
            SchedError::InvalidPattern { .. }
        ));
    }

    #[test]
    fn flag_override_collapses_to_cpu() {
        let mode = OverrideMode {
            flag: true,
            tag: None,
        };
        let spec = filter(Some("Snappy"), &[], None);
        let selected = select(&templates(), &spec, &mode, None, "perf.cfg").unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].tag(), "cpu");
        assert_eq!(selected[0].header.label(), "one");
    }

    #[test]
    fn flag_and_tag_override_uses_tag_verbatim() {
        let directive = OverrideDirective::parse("tag=Run1 f=-O3").unwrap();
        let mode = OverrideMode::new(false, None, &directive);
        assert!(mode.flag);

        let selected = apply_overrides(templates(), &mode);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].tag(), "Run1");
    }

    #[test]
    fn tag_override_appends_to_existing_tag() {
        let mut input = templates();
        input.push(input[0].with_param("tag", ""));
        let mode = OverrideMode {
            flag: false,
            tag: Some("custom".to_string()),
        };

        let selected = apply_overrides(input.clone(), &mode);
        assert_eq!(selected.len(), 5);
        assert_eq!(selected[0].tag(), "A_custom");
        assert_eq!(selected[2].tag(), "B_custom");
        assert_eq!(selected[4].tag(), "custom");
        assert_eq!(input[0].tag(), "A");
    }

    #[test]
    fn empty_result_names_the_filter() {
        let err = select(
            &templates(),
            &filter(Some("Snappy"), &["Z"], None),
            &OverrideMode::default(),
            None,
            "perf.cfg",
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "no job config found with tags 'Z' for suite 'Snappy' in schedule file perf.cfg"
        );

        let err = select(
            &templates(),
            &filter(Some("Folly"), &[], None),
            &OverrideMode::default(),
            None,
            "perf.cfg",
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "no job config found for suite 'Folly' in schedule file perf.cfg"
        );

        let err = select(
            &templates(),
            &filter(None, &[], Some("Og")),
            &OverrideMode::default(),
            None,
            "perf.cfg",
        )
        .unwrap_err();
        assert!(err.to_string().contains("with flag 'Og'"));
    }

    #[test]
    fn suite_type_resolves_through_groups() {
        let spec = FilterSpec::new(None, Some("perf".to_string()), Vec::new(), None).unwrap();
        let mode = OverrideMode::default();
        let selected = select(&templates(), &spec, &mode, Some(&Groups), "perf.cfg").unwrap();
        assert_eq!(selected.len(), 3);

        let spec = FilterSpec::new(None, Some("none".to_string()), Vec::new(), None).unwrap();
        assert!(matches!(
            select(&templates(), &spec, &OverrideMode::default(), Some(&Groups), "perf.cfg"),
            Err(SchedError::InvalidFilter { .. })
        ));
    }

    #[test]
    fn exclusive_filters_are_rejected() {
        let tags = vec!["A".to_string()];
        assert!(FilterSpec::new(None, None, tags, Some("O3".to_string())).is_err());
        let suite = Some("S".to_string());
        assert!(FilterSpec::new(suite, Some("perf".to_string()), Vec::new(), None).is_err());
    }

    #[test]
    fn directive_parsing_is_lenient_per_token() {
        let directive = OverrideDirective::parse("tag=Run1 bogus f='-O3 -g' jobs=4").unwrap();
        assert_eq!(directive.tag(), Some("Run1"));
        assert_eq!(directive.get("f"), Some("-O3 -g"));
        assert_eq!(directive.get("jobs"), Some("4"));
        assert_eq!(directive.get("bogus"), None);

        let fallback = OverrideDirective::parse("tag='open").unwrap();
        assert_eq!(fallback.tag(), Some("'open"));

        assert!(OverrideDirective::parse("=oops").is_err());
    }

    fn job(header: &str, suite: &str) -> ResolvedJobSpec {
        let text = format!("{header}\nsuite : {suite}\n");
        ResolvedJobSpec::from_template(&parse_schedule(&text)[0], "perf")
    }

    #[test]
    fn host_filter_matches_plain_and_brace_sets() {
        let jobs = vec![
            job("[a | sbatch -w n1 -N 1]", "S"),
            job("[b | sbatch -w {n0, n1}]", "S"),
            job("[c | sbatch --nodelist=n10]", "S"),
            job("[d | sbatch -N 1]", "S"),
        ];
        let kept = filter_by_host(jobs, "n1").unwrap();
        let labels: Vec<&str> = kept.iter().map(|j| j.template.header.label()).collect();
        assert_eq!(labels, vec!["a", "b"]);
    }

    #[test]
    fn option_filters_match_by_kind() {
        let jobs = vec![job("[a | sbatch]", "Snappy"), job("[b | sbatch -N 1]", "SnappyX")];
        let count = |key: &str, pattern: &str, kind: MatchKind| {
            filter_by_option(jobs.clone(), key, pattern, kind).unwrap().len()
        };
        assert_eq!(count("suite", "Snappy", MatchKind::Equal), 1);
        assert_eq!(count("suite", "^Snap", MatchKind::Regex), 2);
        assert_eq!(count("", "-N 1", MatchKind::Submission), 1);
    }

    #[test]
    fn firstrun_moves_first_of_each_suite_forward() {
        let jobs = vec![
            job("[a | sbatch --partition perf]", "S"),
            job("[b | sbatch --partition perf]", "S"),
            job("[c | sbatch]", "T"),
        ];
        let ordered = firstrun(jobs.clone(), false);
        let labels: Vec<&str> = ordered.iter().map(|j| j.template.header.label()).collect();
        assert_eq!(labels, vec!["a", "c", "b"]);
        assert_eq!(ordered[0].submission, "sbatch --partition firstrun");
        assert_eq!(ordered[1].submission, "sbatch --partition firstrun");
        assert_eq!(ordered[2].submission, "sbatch --partition perf");

        assert_eq!(firstrun(jobs, true).len(), 2);
    }

    #[test]
    fn pick_default_handles_empty_candidates() {
        assert!(pick_default(&[]).is_none());
        let templates = templates();
        assert_eq!(pick_default(&templates).map(|t| t.header.label()), Some("one"));
    }
}
