/// Terminal output handling for task logs
///
/// Every line a task prints goes to its log file. What reaches the terminal
/// depends on the task's output mode and on whether the task was replayed
/// from the cache.
use serde::{Deserialize, Serialize};
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::pipeline::TaskId;
use crate::workspace::Package;

/// How a task's logs are shown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputMode {
    /// Stream on execution, replay on cache hit
    #[default]
    Full,
    /// Only print the task hash
    HashOnly,
    /// Stream on execution, only the hash on cache hit
    NewOnly,
    /// Only print logs of failed tasks
    ErrorsOnly,
    /// Print nothing
    None,
}

impl OutputMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "full" => Some(Self::Full),
            "hash-only" => Some(Self::HashOnly),
            "new-only" => Some(Self::NewOnly),
            "errors-only" => Some(Self::ErrorsOnly),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::HashOnly => "hash-only",
            Self::NewOnly => "new-only",
            Self::ErrorsOnly => "errors-only",
            Self::None => "none",
        }
    }

    /// Whether lines are streamed while the task executes
    pub fn streams_execution(&self) -> bool {
        matches!(self, Self::Full | Self::NewOnly)
    }

    /// Whether the log is replayed on a cache hit
    pub fn replays_cached(&self) -> bool {
        matches!(self, Self::Full)
    }

    /// Whether the hash line is printed
    pub fn prints_hash(&self) -> bool {
        !matches!(self, Self::None | Self::ErrorsOnly)
    }
}

/// Location of a task's log file: `<package>/.kiln/kiln-<task>.log`
pub fn log_file_path(package: &Package, task: &TaskId) -> PathBuf {
    package.dir.join(".kiln").join(task.log_file_name())
}

/// Workspace-root relative path of a task's log file
pub fn log_file_relative(package: &Package, task: &TaskId) -> String {
    let file = format!(".kiln/{}", task.log_file_name());
    if package.is_root() {
        file
    } else {
        format!("{}/{}", package.relative_dir, file)
    }
}

/// Serializes terminal writes so lines from concurrent tasks never interleave
pub struct OutputSink {
    lock: Mutex<()>,
    color: bool,
}

const PREFIX_COLORS: [&str; 5] = ["\x1b[36m", "\x1b[35m", "\x1b[32m", "\x1b[33m", "\x1b[34m"];

impl Default for OutputSink {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputSink {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            color: std::io::stdout().is_terminal(),
        }
    }

    /// Prefix for a task's lines (`web:build: `), colored per task when stdout is a TTY
    pub fn prefix(&self, task: &TaskId) -> String {
        let plain = format!("{}:{}: ", task.package, task.task);
        if !self.color {
            return plain;
        }

        let index = task
            .to_string()
            .bytes()
            .fold(0usize, |acc, b| acc.wrapping_add(b as usize))
            % PREFIX_COLORS.len();
        format!("{}{}\x1b[0m", PREFIX_COLORS[index], plain)
    }

    /// Write a single prefixed line to stdout
    pub fn line(&self, prefix: &str, line: &str) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut stdout = std::io::stdout().lock();
        let _ = writeln!(stdout, "{}{}", prefix, line);
    }

    /// Write several prefixed lines atomically
    pub fn lines<'a>(&self, prefix: &str, lines: impl IntoIterator<Item = &'a str>) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut stdout = std::io::stdout().lock();
        for line in lines {
            let _ = writeln!(stdout, "{}{}", prefix, line);
        }
    }

    /// Replay a log file from a previous execution
    pub fn replay(&self, prefix: &str, log_file: &Path) -> std::io::Result<()> {
        let content = std::fs::read_to_string(log_file)?;
        self.lines(prefix, content.lines());
        Ok(())
    }
}
