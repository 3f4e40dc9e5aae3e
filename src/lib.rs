pub mod artifacts;
pub mod cancel;
pub mod environment;
pub mod error;
pub mod observability;
pub mod outcome;
pub mod pipeline;
pub mod presets;
pub mod report;
pub mod runner;
pub mod sequencer;
pub mod validation;

pub use cancel::AbortSignal;
pub use outcome::{RunReport, RunResult, StageStatus};
pub use pipeline::{Pipeline, Stage};
pub use sequencer::{RunOptions, StageSequencer};
