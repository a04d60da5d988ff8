/// Run summaries
///
/// Collects the outcome of every task in a run, renders the closing terminal
/// block and, with `--summarize`, persists the run as JSON under
/// `<root>/.kiln/runs/`.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Executed,
    Cached(CacheSource),
    Failed,
    Skipped,
    NoOp,
}

impl TaskStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Executed | Self::Cached(_) | Self::NoOp)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: String,
    pub package: String,
    pub task: String,
    pub hash: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub cache_enabled: bool,
    pub command: Option<String>,
    pub outputs: Vec<String>,
    pub dependencies: Vec<String>,
    pub log_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub exit_code: i32,
    pub tasks: Vec<TaskSummary>,
}

impl RunSummary {
    pub fn new(started_at: DateTime<Utc>, mut tasks: Vec<TaskSummary>) -> Self {
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        let exit_code = run_exit_code(&tasks);

        Self {
            id: run_id(started_at),
            started_at,
            ended_at: Utc::now(),
            exit_code,
            tasks,
        }
    }

    /// Tasks that have a command (no-ops excluded)
    fn executable(&self) -> impl Iterator<Item = &TaskSummary> {
        self.tasks.iter().filter(|t| t.status != TaskStatus::NoOp)
    }

    pub fn total(&self) -> usize {
        self.executable().count()
    }

    pub fn successful(&self) -> usize {
        self.executable().filter(|t| t.status.is_success()).count()
    }

    pub fn cached(&self) -> usize {
        self.executable()
            .filter(|t| matches!(t.status, TaskStatus::Cached(_)))
            .count()
    }

    pub fn failed(&self) -> Vec<&TaskSummary> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .collect()
    }

    /// Every executable task was replayed from the cache
    pub fn is_full_turbo(&self) -> bool {
        let total = self.total();
        total > 0 && self.cached() == total
    }

    pub fn elapsed(&self) -> Duration {
        (self.ended_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    /// Closing terminal block
    pub fn render(&self) -> String {
        let mut out = String::new();
        let total = self.total();

        let _ = writeln!(out);
        let _ = writeln!(out, " Tasks:    {} successful, {} total", self.successful(), total);
        let _ = writeln!(out, "Cached:    {} cached, {} total", self.cached(), total);
        let _ = write!(out, "  Time:    {}", format_duration(self.elapsed()));
        if self.is_full_turbo() {
            let _ = write!(out, " >>> FULL TURBO");
        }
        let _ = writeln!(out);

        let failed = self.failed();
        if !failed.is_empty() {
            let names: Vec<&str> = failed.iter().map(|t| t.task_id.as_str()).collect();
            let _ = writeln!(out, "Failed:    {}", names.join(", "));
        }

        out
    }

    /// Write the summary to `<root>/.kiln/runs/<id>.json`
    pub fn write(&self, root: &Path) -> Result<PathBuf> {
        let dir = root.join(".kiln").join("runs");
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

        let path = dir.join(format!("{}.json", self.id));
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run summary")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write run summary: {}", path.display()))?;

        Ok(path)
    }
}

/// Highest task exit code; failures without one count as 1
fn run_exit_code(tasks: &[TaskSummary]) -> i32 {
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Failed)
        .map(|t| t.exit_code.filter(|c| *c != 0).unwrap_or(1))
        .max()
        .unwrap_or(0)
}

fn run_id(started_at: DateTime<Utc>) -> String {
    format!(
        "{}-{:09}",
        started_at.format("%Y%m%dT%H%M%S"),
        started_at.timestamp_subsec_nanos()
    )
}

/// `850ms`, `1.23s`, `2m5.1s`
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis < 1000 {
        return format!("{}ms", millis);
    }

    let secs = duration.as_secs_f64();
    if secs < 60.0 {
        return format!("{:.3}s", secs);
    }

    let minutes = (secs / 60.0).floor();
    format!("{}m{:.1}s", minutes as u64, secs - minutes * 60.0)
}

/// Cache state reported by a dry run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DryRunCacheState {
    Hit(CacheSource),
    Miss,
    Disabled,
}

impl std::fmt::Display for DryRunCacheState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hit(source) => write!(f, "HIT {}", source),
            Self::Miss => write!(f, "MISS"),
            Self::Disabled => write!(f, "DISABLED"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DryRunTask {
    pub task_id: String,
    pub package: String,
    pub task: String,
    pub hash: String,
    pub cache: DryRunCacheState,
    pub command: Option<String>,
    pub outputs: Vec<String>,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
    pub inputs: BTreeMap<String, String>,
    pub env: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DryRunSummary {
    pub global_hash: String,
    pub tasks: Vec<DryRunTask>,
}

impl DryRunSummary {
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Global Hash: {}", self.global_hash);
        let _ = writeln!(out);
        let _ = writeln!(out, "Tasks to Run");

        for task in &self.tasks {
            let _ = writeln!(out, "{}", task.task_id);
            let _ = writeln!(out, "  Task          = {}", task.task);
            let _ = writeln!(out, "  Package       = {}", task.package);
            let _ = writeln!(out, "  Hash          = {}", task.hash);
            let _ = writeln!(out, "  Cached        = {}", task.cache);
            let _ = writeln!(
                out,
                "  Command       = {}",
                task.command.as_deref().unwrap_or("<NONEXISTENT>")
            );
            let _ = writeln!(out, "  Outputs       = {}", task.outputs.join(", "));
            let _ = writeln!(out, "  Dependencies  = {}", task.dependencies.join(", "));
            let _ = writeln!(out, "  Dependents    = {}", task.dependents.join(", "));
            let _ = writeln!(out, "  Inputs Files  = {}", task.inputs.len());
            let _ = writeln!(out, "  Env Vars      = {}", task.env.join(", "));
        }

        out
    }

    pub fn render_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize dry run")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn task(id: &str, status: TaskStatus, exit_code: Option<i32>) -> TaskSummary {
        let (package, name) = id.split_once('#').unwrap();
        TaskSummary {
            task_id: id.to_string(),
            package: package.to_string(),
            task: name.to_string(),
            hash: "0123456789abcdef".to_string(),
            status,
            exit_code,
            duration_ms: 10,
            cache_enabled: true,
            command: Some("echo".to_string()),
            outputs: Vec::new(),
            dependencies: Vec::new(),
            log_file: format!("{}/.kiln/kiln-{}.log", package, name),
        }
    }

    #[test]
    fn test_full_turbo() {
        let summary = RunSummary::new(
            Utc::now(),
            vec![
                task("ui#build", TaskStatus::Cached(CacheSource::Local), None),
                task("web#build", TaskStatus::Cached(CacheSource::Remote), None),
                task("config#build", TaskStatus::NoOp, None),
            ],
        );

        assert_eq!(summary.total(), 2);
        assert_eq!(summary.cached(), 2);
        assert!(summary.is_full_turbo());
        assert_eq!(summary.exit_code, 0);

        let rendered = summary.render();
        assert!(rendered.contains(" Tasks:    2 successful, 2 total"));
        assert!(rendered.contains("Cached:    2 cached, 2 total"));
        assert!(rendered.contains(">>> FULL TURBO"));
    }

    #[test]
    fn test_partial_cache_is_not_full_turbo() {
        let summary = RunSummary::new(
            Utc::now(),
            vec![
                task("ui#build", TaskStatus::Cached(CacheSource::Local), None),
                task("web#build", TaskStatus::Executed, Some(0)),
            ],
        );

        assert!(!summary.is_full_turbo());
        assert!(!summary.render().contains("FULL TURBO"));
    }

    #[test]
    fn test_no_tasks_is_not_full_turbo() {
        let summary = RunSummary::new(Utc::now(), vec![task("a#b", TaskStatus::NoOp, None)]);
        assert!(!summary.is_full_turbo());
    }

    #[test]
    fn test_exit_code_is_highest_failure() {
        let summary = RunSummary::new(
            Utc::now(),
            vec![
                task("a#test", TaskStatus::Failed, Some(2)),
                task("b#test", TaskStatus::Failed, Some(7)),
                task("c#test", TaskStatus::Skipped, None),
            ],
        );

        assert_eq!(summary.exit_code, 7);
        assert_eq!(summary.successful(), 0);
        assert!(summary.render().contains("Failed:    a#test, b#test"));
    }

    #[test]
    fn test_write_summary() {
        let temp = TempDir::new().unwrap();
        let summary = RunSummary::new(
            Utc::now(),
            vec![task("web#build", TaskStatus::Executed, Some(0))],
        );

        let path = summary.write(temp.path()).unwrap();
        assert!(path.starts_with(temp.path().join(".kiln/runs")));

        let parsed: RunSummary =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.tasks.len(), 1);
        assert_eq!(parsed.tasks[0].status, TaskStatus::Executed);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(850)), "850ms");
        assert_eq!(format_duration(Duration::from_millis(1234)), "1.234s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m5.0s");
    }

    #[test]
    fn test_dry_run_rendering() {
        let summary = DryRunSummary {
            global_hash: "ff".to_string(),
            tasks: vec![DryRunTask {
                task_id: "web#build".to_string(),
                package: "web".to_string(),
                task: "build".to_string(),
                hash: "0123456789abcdef".to_string(),
                cache: DryRunCacheState::Hit(CacheSource::Local),
                command: Some("tsc".to_string()),
                outputs: vec!["dist/**".to_string()],
                dependencies: vec!["ui#build".to_string()],
                dependents: Vec::new(),
                inputs: BTreeMap::new(),
                env: Vec::new(),
            }],
        };

        let text = summary.render_text();
        assert!(text.contains("web#build"));
        assert!(text.contains("Cached        = HIT local"));

        let json: serde_json::Value = serde_json::from_str(&summary.render_json().unwrap()).unwrap();
        assert_eq!(json["tasks"][0]["hash"], "0123456789abcdef");
        assert_eq!(json["tasks"][0]["cache"]["hit"], "local");
    }
}
