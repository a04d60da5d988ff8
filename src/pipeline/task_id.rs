use serde::{Deserialize, Serialize};
use std::fmt;

use super::PipelineError;

/// Separator between package and task in qualified task names (`web#build`)
pub const TASK_DELIMITER: char = '#';

/// Name under which the workspace root package is addressed (`//#lint`)
pub const ROOT_PKG_NAME: &str = "//";

/// A concrete task: one script of one package
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub package: String,
    pub task: String,
}

impl TaskId {
    pub fn new(package: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            task: task.into(),
        }
    }

    /// Parse a fully qualified `package#task` string
    pub fn parse(value: &str) -> Result<Self, PipelineError> {
        match TaskName::parse(value)? {
            TaskName {
                package: Some(package),
                task,
            } => Ok(Self { package, task }),
            _ => Err(PipelineError::InvalidTaskName(value.to_string())),
        }
    }

    /// Name of the log file kept in the package's `.kiln` directory
    pub fn log_file_name(&self) -> String {
        let task = self.task.replace(':', "$colon$").replace(['/', '\\'], "_");
        format!("kiln-{}.log", task)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.package, TASK_DELIMITER, self.task)
    }
}

/// A task reference as written in the pipeline: `build`, `web#build`, or `^build`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskName {
    pub package: Option<String>,
    pub task: String,
}

impl TaskName {
    pub fn parse(value: &str) -> Result<Self, PipelineError> {
        let invalid = || PipelineError::InvalidTaskName(value.to_string());

        match value.split_once(TASK_DELIMITER) {
            Some((package, task)) => {
                if package.is_empty() || task.is_empty() || task.contains(TASK_DELIMITER) {
                    return Err(invalid());
                }
                Ok(Self {
                    package: Some(package.to_string()),
                    task: task.to_string(),
                })
            }
            None if value.is_empty() => Err(invalid()),
            None => Ok(Self {
                package: None,
                task: value.to_string(),
            }),
        }
    }
}

/// A parsed `dependsOn` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskDependency {
    /// `^task`: the same task in every workspace dependency of the package
    Upstream(String),
    /// `task`: another task of the same package
    SamePackage(String),
    /// `pkg#task`: a task of a specific package
    Package(TaskId),
}

impl TaskDependency {
    pub fn parse(value: &str) -> Result<Self, PipelineError> {
        if let Some(task) = value.strip_prefix('^') {
            if task.is_empty() || task.contains(TASK_DELIMITER) {
                return Err(PipelineError::InvalidTaskName(value.to_string()));
            }
            return Ok(Self::Upstream(task.to_string()));
        }

        let name = TaskName::parse(value)?;
        Ok(match name.package {
            Some(package) => Self::Package(TaskId::new(package, name.task)),
            None => Self::SamePackage(name.task),
        })
    }

    /// The task part of the dependency
    pub fn task(&self) -> &str {
        match self {
            Self::Upstream(task) | Self::SamePackage(task) => task,
            Self::Package(id) => &id.task,
        }
    }
}
