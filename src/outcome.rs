use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifacts::ArtifactSet;
use crate::report::{CoverageSummary, TestSummary};
use crate::runner::ProcessOutput;

const OUTPUT_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunResult {
    Success,
    Unstable,
    Failure,
    Aborted,
}

impl RunResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunResult::Success => "success",
            RunResult::Unstable => "unstable",
            RunResult::Failure => "failure",
            RunResult::Aborted => "aborted",
        }
    }

    /// Process exit code the CLI reports for this result.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunResult::Success => 0,
            RunResult::Failure => 1,
            RunResult::Unstable => 2,
            RunResult::Aborted => 130,
        }
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Passed,
    Failed,
    /// Non-zero exit from a best-effort stage.
    TolerantFailure,
    TimedOut,
    Aborted,
    SpawnError,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Passed => "passed",
            StageStatus::Failed => "failed",
            StageStatus::TolerantFailure => "tolerant_failure",
            StageStatus::TimedOut => "timed_out",
            StageStatus::Aborted => "aborted",
            StageStatus::SpawnError => "spawn_error",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, StageStatus::Passed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub name: String,
    pub status: StageStatus,
    pub best_effort: bool,
    pub exit_code: Option<i32>,
    pub duration_ms: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stdout_tail: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stderr_tail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageRecord {
    pub fn from_output(
        name: &str,
        best_effort: bool,
        status: StageStatus,
        output: &ProcessOutput,
    ) -> Self {
        Self {
            name: name.to_string(),
            status,
            best_effort,
            exit_code: output.exit_code,
            duration_ms: millis(output.duration),
            stdout_tail: tail(&output.stdout),
            stderr_tail: tail(&output.stderr),
            error: output.spawn_error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PostActionRecord {
    pub slot: String,
    pub command: String,
    pub exit_code: Option<i32>,
    pub duration_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PostActionRecord {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Everything known about a finished run. `result` is fixed before the post
/// actions run and never changes afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub pipeline: String,
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub result: RunResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub stages: Vec<StageRecord>,
    pub skipped: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tests: Option<TestSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage: Option<CoverageSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub report_errors: Vec<String>,
    pub artifacts: ArtifactSet,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub archive_errors: Vec<String>,
    pub post_actions: Vec<PostActionRecord>,
    pub duration_ms: f64,
}

impl RunReport {
    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|record| record.name == name)
    }

    pub fn executed(&self, name: &str) -> bool {
        self.stage(name).is_some()
    }

    pub fn post_failures(&self) -> impl Iterator<Item = &PostActionRecord> {
        self.post_actions.iter().filter(|record| !record.succeeded())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

pub(crate) fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000.0
}

fn tail(text: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_last_lines() {
        let text = (1..=30).map(|n| n.to_string()).collect::<Vec<_>>().join("\n");
        let kept = tail(&text);
        assert!(kept.starts_with("11\n"));
        assert!(kept.ends_with("30"));
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes: Vec<i32> = [
            RunResult::Success,
            RunResult::Unstable,
            RunResult::Failure,
            RunResult::Aborted,
        ]
        .iter()
        .map(RunResult::exit_code)
        .collect();
        assert_eq!(codes, vec![0, 2, 1, 130]);
    }
}
