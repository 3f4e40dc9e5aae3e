use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use tracing::{debug, warn};

use crate::artifacts::expand_pattern_excluding;
use crate::error::ReportParseError;

static IGNORED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<!--.*?-->|<!\[CDATA\[.*?\]\]>|<\?.*?\?>|<!DOCTYPE[^>]*>")
        .expect("ignored-section pattern is valid")
});

static TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"<(/?)([A-Za-z_][\w:.\-]*)((?:\s+[^\s=/>]+\s*=\s*(?:"[^"]*"|'[^']*'))*)\s*(/?)>"#,
    )
    .expect("tag pattern is valid")
});

static ATTRIBUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([^\s=]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("attribute pattern is valid")
});

static ENTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"&(?:#([0-9]+)|#[xX]([0-9A-Fa-f]+)|(lt|gt|quot|apos|amp));")
        .expect("entity pattern is valid")
});

const MAX_FAILING_CASES: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TestSummary {
    pub files: usize,
    pub passed: u64,
    pub failed: u64,
    pub errored: u64,
    pub skipped: u64,
    pub failing_cases: Vec<String>,
}

impl TestSummary {
    pub fn total(&self) -> u64 {
        self.passed + self.failed + self.errored + self.skipped
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0 || self.errored > 0
    }

    fn absorb(&mut self, other: TestSummary) {
        self.files += other.files;
        self.passed += other.passed;
        self.failed += other.failed;
        self.errored += other.errored;
        self.skipped += other.skipped;
        for case in other.failing_cases {
            if self.failing_cases.len() < MAX_FAILING_CASES {
                self.failing_cases.push(case);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageSummary {
    pub files: usize,
    pub line_rate: f64,
    pub branch_rate: Option<f64>,
    pub lines_covered: Option<u64>,
    pub lines_valid: Option<u64>,
}

impl CoverageSummary {
    pub fn line_percent(&self) -> f64 {
        self.line_rate * 100.0
    }

    fn combine(parts: Vec<CoverageSummary>) -> Option<CoverageSummary> {
        if parts.len() <= 1 {
            return parts.into_iter().next();
        }
        let files = parts.iter().map(|p| p.files).sum();
        let counted: Option<(u64, u64)> = parts.iter().try_fold((0u64, 0u64), |acc, p| {
            Some((acc.0 + p.lines_covered?, acc.1 + p.lines_valid?))
        });
        let branch_rates: Vec<f64> = parts.iter().filter_map(|p| p.branch_rate).collect();
        let branch_rate = (!branch_rates.is_empty())
            .then(|| branch_rates.iter().sum::<f64>() / branch_rates.len() as f64);

        match counted {
            Some((covered, valid)) if valid > 0 => Some(CoverageSummary {
                files,
                line_rate: covered as f64 / valid as f64,
                branch_rate,
                lines_covered: Some(covered),
                lines_valid: Some(valid),
            }),
            _ => Some(CoverageSummary {
                files,
                line_rate: parts.iter().map(|p| p.line_rate).sum::<f64>() / parts.len() as f64,
                branch_rate,
                lines_covered: None,
                lines_valid: None,
            }),
        }
    }
}

/// Outcome of scanning a set of report patterns. Parse failures are kept
/// alongside whatever could be read; they never fail the caller.
#[derive(Debug, Default)]
pub struct Collected<T> {
    pub summary: Option<T>,
    pub errors: Vec<ReportParseError>,
}

pub fn parse_junit(path: &Path) -> Result<TestSummary, ReportParseError> {
    let content = read_report(path)?;
    parse_junit_str(&content, path)
}

pub fn parse_junit_str(content: &str, path: &Path) -> Result<TestSummary, ReportParseError> {
    let malformed = |reason: String| ReportParseError::Malformed {
        path: path.to_path_buf(),
        reason,
    };

    let cleaned = IGNORED.replace_all(content, "");
    let mut summary = TestSummary {
        files: 1,
        ..TestSummary::default()
    };
    let mut stack: Vec<String> = Vec::new();
    let mut saw_suite = false;
    let mut current: Option<OpenCase> = None;

    for caps in TAG.captures_iter(&cleaned) {
        let closing = !caps[1].is_empty();
        let name = caps[2].to_string();
        let attrs = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
        let self_closing = !caps[4].is_empty();

        if closing {
            match stack.pop() {
                Some(open) if open == name => {}
                Some(open) => {
                    return Err(malformed(format!(
                        "expected </{open}> but found </{name}>"
                    )));
                }
                None => return Err(malformed(format!("unexpected </{name}>"))),
            }
            if name == "testcase"
                && let Some(case) = current.take()
            {
                case.finish(&mut summary);
            }
            continue;
        }

        match name.as_str() {
            "testsuite" | "testsuites" => saw_suite = true,
            "testcase" => {
                if current.is_some() {
                    return Err(malformed("nested <testcase> elements".to_string()));
                }
                let case = OpenCase::from_attributes(attrs);
                if self_closing {
                    case.finish(&mut summary);
                } else {
                    current = Some(case);
                }
            }
            "failure" | "error" | "skipped" => {
                if let Some(case) = current.as_mut() {
                    case.mark(&name);
                }
            }
            _ => {}
        }

        if !self_closing {
            stack.push(name);
        }
    }

    if let Some(open) = stack.last() {
        return Err(malformed(format!("unclosed <{open}> element")));
    }
    if !saw_suite {
        return Err(malformed("no <testsuite> element found".to_string()));
    }
    Ok(summary)
}

pub fn parse_coverage(path: &Path) -> Result<CoverageSummary, ReportParseError> {
    let content = read_report(path)?;
    parse_coverage_str(&content, path)
}

pub fn parse_coverage_str(content: &str, path: &Path) -> Result<CoverageSummary, ReportParseError> {
    let malformed = |reason: &str| ReportParseError::Malformed {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let cleaned = IGNORED.replace_all(content, "");
    let root = TAG
        .captures_iter(&cleaned)
        .find(|caps| caps[1].is_empty() && &caps[2] == "coverage")
        .ok_or_else(|| malformed("no <coverage> element found"))?;
    let attrs = root.get(3).map(|m| m.as_str()).unwrap_or_default();

    let line_rate = attribute(attrs, "line-rate")
        .ok_or_else(|| malformed("<coverage> has no line-rate attribute"))?
        .parse::<f64>()
        .map_err(|_| malformed("line-rate is not a number"))?;
    if !(0.0..=1.0).contains(&line_rate) {
        return Err(malformed("line-rate must be between 0 and 1"));
    }

    Ok(CoverageSummary {
        files: 1,
        line_rate,
        branch_rate: attribute(attrs, "branch-rate").and_then(|v| v.parse().ok()),
        lines_covered: attribute(attrs, "lines-covered").and_then(|v| v.parse().ok()),
        lines_valid: attribute(attrs, "lines-valid").and_then(|v| v.parse().ok()),
    })
}

/// Parses every JUnit file matched by `patterns` (relative to `base`) and
/// sums the results. Matches under `excluded` are ignored. Unreadable or
/// malformed files are skipped.
pub fn collect_junit(
    base: &Path,
    patterns: &[String],
    excluded: &[PathBuf],
) -> Collected<TestSummary> {
    let mut collected = Collected::default();
    for path in resolve_reports(base, patterns, excluded, &mut collected.errors) {
        match parse_junit(&path) {
            Ok(summary) => {
                debug!(report = %path.display(), tests = summary.total(), "Parsed JUnit report");
                collected
                    .summary
                    .get_or_insert_with(TestSummary::default)
                    .absorb(summary);
            }
            Err(err) => {
                warn!(error = %err, "Ignoring test report");
                collected.errors.push(err);
            }
        }
    }
    collected
}

pub fn collect_coverage(
    base: &Path,
    patterns: &[String],
    excluded: &[PathBuf],
) -> Collected<CoverageSummary> {
    let mut errors = Vec::new();
    let mut parts = Vec::new();
    for path in resolve_reports(base, patterns, excluded, &mut errors) {
        match parse_coverage(&path) {
            Ok(summary) => parts.push(summary),
            Err(err) => {
                warn!(error = %err, "Ignoring coverage report");
                errors.push(err);
            }
        }
    }
    Collected {
        summary: CoverageSummary::combine(parts),
        errors,
    }
}

fn resolve_reports(
    base: &Path,
    patterns: &[String],
    excluded: &[PathBuf],
    errors: &mut Vec<ReportParseError>,
) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    for pattern in patterns {
        match expand_pattern_excluding(base, pattern, excluded) {
            Ok(matches) => {
                if matches.is_empty() {
                    warn!(pattern = %pattern, "No report files matched");
                }
                paths.extend(matches);
            }
            Err(source) => errors.push(ReportParseError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            }),
        }
    }
    paths.sort();
    paths.dedup();
    paths
}

fn read_report(path: &Path) -> Result<String, ReportParseError> {
    fs::read_to_string(path).map_err(|source| ReportParseError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum CaseStatus {
    Passed,
    Skipped,
    Failed,
    Errored,
}

struct OpenCase {
    label: String,
    status: CaseStatus,
}

impl OpenCase {
    fn from_attributes(attrs: &str) -> Self {
        let name = attribute(attrs, "name").unwrap_or_else(|| "<unnamed>".to_string());
        let label = match attribute(attrs, "classname") {
            Some(class) if !class.is_empty() => format!("{class}.{name}"),
            _ => name,
        };
        Self {
            label,
            status: CaseStatus::Passed,
        }
    }

    fn mark(&mut self, element: &str) {
        let status = match element {
            "error" => CaseStatus::Errored,
            "failure" => CaseStatus::Failed,
            _ => CaseStatus::Skipped,
        };
        self.status = self.status.max(status);
    }

    fn finish(self, summary: &mut TestSummary) {
        match self.status {
            CaseStatus::Passed => summary.passed += 1,
            CaseStatus::Skipped => summary.skipped += 1,
            CaseStatus::Failed => summary.failed += 1,
            CaseStatus::Errored => summary.errored += 1,
        }
        if matches!(self.status, CaseStatus::Failed | CaseStatus::Errored)
            && summary.failing_cases.len() < MAX_FAILING_CASES
        {
            summary.failing_cases.push(self.label);
        }
    }
}

fn attribute(attrs: &str, key: &str) -> Option<String> {
    ATTRIBUTE
        .captures_iter(attrs)
        .find(|caps| &caps[1] == key)
        .map(|caps| {
            let raw = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str())
                .unwrap_or_default();
            unescape(raw)
        })
}

/// Decodes the predefined entities and numeric character references.
/// References to invalid code points are kept as written.
fn unescape(value: &str) -> String {
    ENTITY
        .replace_all(value, |caps: &Captures| {
            let decoded = if let Some(dec) = caps.get(1) {
                dec.as_str().parse::<u32>().ok().and_then(char::from_u32)
            } else if let Some(hex) = caps.get(2) {
                u32::from_str_radix(hex.as_str(), 16)
                    .ok()
                    .and_then(char::from_u32)
            } else {
                match &caps[3] {
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "quot" => Some('"'),
                    "apos" => Some('\''),
                    _ => Some('&'),
                }
            };
            decoded.map_or_else(|| caps[0].to_string(), String::from)
        })
        .into_owned()
}
