//! Pipeline definition: which tasks exist, how they depend on each other,
//! and how each one is cached.

pub mod definition;
pub mod task_id;

pub use definition::{PipelineConfig, TaskDefinition};
pub use task_id::{TaskDependency, TaskId, TaskName, ROOT_PKG_NAME};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to read pipeline file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid pipeline file {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid task name \"{0}\"")]
    InvalidTaskName(String),

    #[error("Task \"{task}\" depends on \"{dependency}\", which is not defined in the pipeline")]
    UnknownDependency { task: String, dependency: String },

    #[error("Task \"{task}\" depends on persistent task \"{dependency}\"; persistent tasks cannot be dependencies")]
    PersistentDependency { task: String, dependency: String },
}
