/// Task process execution
///
/// Spawns a task's script through the system shell in its package directory,
/// captures stdout and stderr line by line into the task's log file, and
/// forwards lines to the terminal according to the output mode.
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::output::{OutputMode, OutputSink};
use crate::pipeline::TaskId;

/// Env var exposing the task hash to the script
pub const HASH_ENV_VAR: &str = "KILN_HASH";

/// Result of a task execution
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Everything needed to run one task
pub struct ExecutionRequest<'a> {
    pub task: &'a TaskId,
    pub command: &'a str,
    pub args: &'a [String],
    pub cwd: &'a Path,
    pub hash: &'a str,
    pub log_file: &'a Path,
    pub mode: OutputMode,
}

pub struct TaskExecutor {
    shell: PathBuf,
    shell_flag: &'static str,
    sink: Arc<OutputSink>,
}

impl TaskExecutor {
    pub fn new(sink: Arc<OutputSink>) -> Self {
        let (shell, shell_flag) = if cfg!(windows) {
            ("cmd", "/C")
        } else {
            ("sh", "-c")
        };

        let shell = which::which(shell).unwrap_or_else(|e| {
            tracing::debug!("Could not find '{}' in PATH: {}. Trying as-is.", shell, e);
            PathBuf::from(shell)
        });

        Self {
            shell,
            shell_flag,
            sink,
        }
    }

    pub async fn execute(&self, request: ExecutionRequest<'_>) -> Result<ExecutionResult> {
        let start = Instant::now();
        let script = script_with_args(request.command, request.args);

        if let Some(parent) = request.log_file.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
        }
        let mut log = tokio::fs::File::create(request.log_file)
            .await
            .with_context(|| format!("Failed to create log file: {}", request.log_file.display()))?;

        tracing::debug!(task = %request.task, command = %script, "spawning task");

        let mut child = Command::new(&self.shell)
            .arg(self.shell_flag)
            .arg(&script)
            .current_dir(request.cwd)
            .env(HASH_ENV_VAR, request.hash)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn task {}: {}", request.task, script))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        let prefix = self.sink.prefix(request.task);
        let mut buffered = Vec::new();

        while let Some(line) = rx.recv().await {
            log.write_all(line.as_bytes()).await?;
            log.write_all(b"\n").await?;

            if request.mode.streams_execution() {
                self.sink.line(&prefix, &line);
            } else if request.mode == OutputMode::ErrorsOnly {
                buffered.push(line);
            }
        }
        log.flush().await?;

        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for task {}", request.task))?;

        // Killed by a signal: no exit code
        let exit_code = status.code().unwrap_or(1);

        if exit_code != 0 && !buffered.is_empty() {
            self.sink
                .lines(&prefix, buffered.iter().map(|l| l.as_str()));
        }

        Ok(ExecutionResult {
            exit_code,
            duration: start.elapsed(),
        })
    }
}

/// Forward output line by line; invalid UTF-8 is replaced, never fatal
async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.ends_with(b"\n") {
                    buf.pop();
                    if buf.ends_with(b"\r") {
                        buf.pop();
                    }
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!("Stopped reading task output: {}", e);
                break;
            }
        }
    }
}

/// Append passthrough args to the script, single-quoted for the shell
fn script_with_args(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        return command.to_string();
    }

    let quoted: Vec<String> = args
        .iter()
        .map(|arg| format!("'{}'", arg.replace('\'', "'\\''")))
        .collect();
    format!("{} {}", command, quoted.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_script_with_args() {
        assert_eq!(script_with_args("tsc", &[]), "tsc");
        assert_eq!(
            script_with_args("jest", &["--ci".to_string(), "it's".to_string()]),
            "jest '--ci' 'it'\\''s'"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_captures_log() {
        let temp = TempDir::new().unwrap();
        let executor = TaskExecutor::new(Arc::new(OutputSink::new()));
        let task = TaskId::new("web", "build");
        let log_file = temp.path().join(".kiln/kiln-build.log");

        let result = executor
            .execute(ExecutionRequest {
                task: &task,
                command: "echo out && echo err 1>&2 && echo $KILN_HASH",
                args: &[],
                cwd: temp.path(),
                hash: "0123456789abcdef",
                log_file: &log_file,
                mode: OutputMode::None,
            })
            .await
            .unwrap();

        assert!(result.success());
        let log = std::fs::read_to_string(&log_file).unwrap();
        assert!(log.contains("out"));
        assert!(log.contains("err"));
        assert!(log.contains("0123456789abcdef"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_reports_exit_code() {
        let temp = TempDir::new().unwrap();
        let executor = TaskExecutor::new(Arc::new(OutputSink::new()));
        let task = TaskId::new("web", "test");
        let log_file = temp.path().join("test.log");

        let result = executor
            .execute(ExecutionRequest {
                task: &task,
                command: "exit 3",
                args: &[],
                cwd: temp.path(),
                hash: "abc",
                log_file: &log_file,
                mode: OutputMode::ErrorsOnly,
            })
            .await
            .unwrap();

        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_tolerates_invalid_utf8() {
        let temp = TempDir::new().unwrap();
        let executor = TaskExecutor::new(Arc::new(OutputSink::new()));
        let task = TaskId::new("web", "build");
        let log_file = temp.path().join("build.log");

        let result = executor
            .execute(ExecutionRequest {
                task: &task,
                command: "printf 'caf\\351\\n'; i=0; while [ $i -lt 2000 ]; do echo line; i=$((i+1)); done; echo done",
                args: &[],
                cwd: temp.path(),
                hash: "abc",
                log_file: &log_file,
                mode: OutputMode::None,
            })
            .await
            .unwrap();

        assert!(result.success());
        let log = std::fs::read_to_string(&log_file).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2002);
        assert_eq!(lines[0], "caf\u{FFFD}");
        assert_eq!(lines[2001], "done");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_execute_runs_in_package_dir() {
        let temp = TempDir::new().unwrap();
        let executor = TaskExecutor::new(Arc::new(OutputSink::new()));
        let task = TaskId::new("web", "build");
        let log_file = temp.path().join("build.log");

        executor
            .execute(ExecutionRequest {
                task: &task,
                command: "echo built > marker.txt",
                args: &[],
                cwd: temp.path(),
                hash: "abc",
                log_file: &log_file,
                mode: OutputMode::None,
            })
            .await
            .unwrap();

        assert!(temp.path().join("marker.txt").exists());
    }
}
