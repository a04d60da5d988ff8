//! Task execution: output handling, process spawning, scheduling and summaries

pub mod executor;
pub mod output;
pub mod scheduler;
pub mod summary;

pub use output::OutputMode;
pub use scheduler::{parse_concurrency, Run, RunOptions};
pub use summary::{DryRunSummary, RunSummary, TaskStatus};
