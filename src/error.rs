use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("invalid artifact pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
    #[error("no files matched artifact pattern '{pattern}'")]
    NoMatches { pattern: String },
    #[error("failed to archive '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ReportParseError {
    #[error("failed to read report '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed report '{}': {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },
    #[error("invalid report pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("stage '{stage}' exited with code {code}")]
    StageFailure { stage: String, code: i32 },
    #[error("stage '{stage}' was terminated by a signal")]
    StageTerminated { stage: String },
    #[error("stage '{stage}' could not be started: {reason}")]
    SpawnFailure { stage: String, reason: String },
    #[error("pipeline timeout of {budget_secs}s exceeded during stage '{stage}'")]
    TimeoutExceeded { stage: String, budget_secs: u64 },
    #[error("run aborted during stage '{stage}'")]
    AbortRequested { stage: String },
    #[error("post action '{command}' failed: {reason}")]
    PostActionError { command: String, reason: String },
}
