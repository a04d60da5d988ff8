/// Task scheduling
///
/// Hashes every task up front in topological order, then runs the graph with
/// bounded concurrency: a task starts once all of its dependencies
/// succeeded. Each task is either replayed from the cache or executed and
/// stored.
use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::executor::{ExecutionRequest, TaskExecutor};
use super::output::{log_file_path, log_file_relative, OutputMode, OutputSink};
use super::summary::{
    DryRunCacheState, DryRunSummary, DryRunTask, RunSummary, TaskStatus, TaskSummary,
};
use crate::cache::archive::expand_outputs;
use crate::cache::TaskCache;
use crate::graph::{TaskGraph, TaskNode};
use crate::hash::{GlobalHash, TaskHash, TaskHasher};
use crate::logging::{operations, status};
use crate::pipeline::{PipelineConfig, TaskId};
use crate::workspace::{Package, Workspace};

/// Parse a concurrency setting: a positive integer or a percentage of CPUs
pub fn parse_concurrency(value: &str) -> Result<usize> {
    let value = value.trim();

    if let Some(percent) = value.strip_suffix('%') {
        let percent: f64 = percent
            .trim()
            .parse()
            .with_context(|| format!("Invalid concurrency percentage: {}", value))?;
        if percent <= 0.0 {
            bail!("Concurrency percentage must be positive, got {}", value);
        }
        let cpus = num_cpus::get() as f64;
        return Ok(((cpus * percent / 100.0).floor() as usize).max(1));
    }

    let count: usize = value
        .parse()
        .with_context(|| format!("Invalid concurrency: {}", value))?;
    if count < 1 {
        bail!("Concurrency must be at least 1, got {}", value);
    }
    Ok(count)
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub concurrency: usize,
    /// Ignore dependency edges when scheduling
    pub parallel: bool,
    pub continue_on_error: bool,
    /// Overrides every task's output mode
    pub output_mode: Option<OutputMode>,
    /// Used when neither the override nor the task definition sets a mode
    pub default_output_mode: OutputMode,
    /// Args appended to the scripts of the requested tasks
    pub passthrough_args: Vec<String>,
    /// Task names the user asked for (passthrough args apply to these)
    pub requested_tasks: BTreeSet<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            parallel: false,
            continue_on_error: false,
            output_mode: None,
            default_output_mode: OutputMode::Full,
            passthrough_args: Vec::new(),
            requested_tasks: BTreeSet::new(),
        }
    }
}

/// Shared state of a run, handed to each task
struct RunContext {
    workspace: Workspace,
    graph: TaskGraph,
    cache: TaskCache,
    hashes: BTreeMap<TaskId, TaskHash>,
    options: RunOptions,
    sink: Arc<OutputSink>,
    executor: TaskExecutor,
    cancelled: AtomicBool,
}

pub struct Run {
    ctx: Arc<RunContext>,
    order: Vec<TaskId>,
    global_hash: String,
}

impl Run {
    /// Prepare a run: order the graph and hash every task
    pub fn new(
        workspace: Workspace,
        pipeline: &PipelineConfig,
        graph: TaskGraph,
        cache: TaskCache,
        options: RunOptions,
    ) -> Result<Self> {
        let order = graph.topological_order()?;

        let env: BTreeMap<String, String> = std::env::vars().collect();
        let global = GlobalHash::compute(&workspace.root, pipeline, &env)
            .context("Failed to compute global hash")?;
        debug!(hash = %global.hash, "computed global hash");

        let package_dirs: Vec<PathBuf> = workspace.packages.values().map(|p| p.dir.clone()).collect();
        let hasher = TaskHasher::new(global.hash.clone(), env, package_dirs);

        let mut hashes: BTreeMap<TaskId, TaskHash> = BTreeMap::new();
        for id in &order {
            let node = graph
                .node(id)
                .with_context(|| format!("Task {} missing from graph", id))?;
            let package = package_of(&workspace, id)?;

            let dependency_hashes: Vec<String> = node
                .dependencies
                .iter()
                .filter_map(|d| hashes.get(d).map(|h| h.hash.clone()))
                .collect();

            let args: &[String] = if options.requested_tasks.contains(&id.task) {
                options.passthrough_args.as_slice()
            } else {
                &[]
            };

            let hash = hasher
                .task_hash(node, package, &dependency_hashes, args)
                .with_context(|| format!("Failed to hash task {}", id))?;
            debug!(task = %id, hash = %hash.hash, "computed task hash");
            hashes.insert(id.clone(), hash);
        }

        let sink = Arc::new(OutputSink::new());
        let executor = TaskExecutor::new(sink.clone());

        Ok(Self {
            ctx: Arc::new(RunContext {
                workspace,
                graph,
                cache,
                hashes,
                options,
                sink,
                executor,
                cancelled: AtomicBool::new(false),
            }),
            order,
            global_hash: global.hash,
        })
    }

    /// Report what would run without executing anything
    pub async fn dry_run(&self) -> Result<DryRunSummary> {
        let ctx = &self.ctx;
        let mut tasks = Vec::with_capacity(self.order.len());

        for id in &self.order {
            let node = ctx.node(id)?;
            let hash = ctx.hash(id)?;

            let cache = if node.is_noop() || !node.definition.cacheable() {
                DryRunCacheState::Disabled
            } else {
                match ctx.cache.exists(&hash.hash).await {
                    Some(source) => DryRunCacheState::Hit(source),
                    None => DryRunCacheState::Miss,
                }
            };

            tasks.push(DryRunTask {
                task_id: id.to_string(),
                package: id.package.clone(),
                task: id.task.clone(),
                hash: hash.hash.clone(),
                cache,
                command: node.command.clone(),
                outputs: effective_outputs(node),
                dependencies: node.dependencies.iter().map(|d| d.to_string()).collect(),
                dependents: ctx.graph.dependents(id).iter().map(|d| d.to_string()).collect(),
                inputs: hash.inputs.clone(),
                env: hash.env.clone(),
            });
        }

        Ok(DryRunSummary {
            global_hash: self.global_hash.clone(),
            tasks,
        })
    }

    /// Execute the graph
    pub async fn execute(self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let ctx = self.ctx;
        let parallel = ctx.options.parallel;
        let semaphore = Arc::new(Semaphore::new(ctx.options.concurrency.max(1)));

        let mut pending: BTreeMap<TaskId, usize> = ctx
            .graph
            .nodes
            .values()
            .map(|n| {
                let blocking = if parallel { 0 } else { n.dependencies.len() };
                (n.id.clone(), blocking)
            })
            .collect();

        let mut ready: BTreeSet<TaskId> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| id.clone())
            .collect();

        let mut results: BTreeMap<TaskId, TaskSummary> = BTreeMap::new();
        let mut running: JoinSet<(TaskId, Result<TaskSummary>)> = JoinSet::new();

        loop {
            while let Some(id) = ready.pop_first() {
                if ctx.cancelled.load(Ordering::SeqCst) {
                    break;
                }
                pending.remove(&id);

                let task_ctx = ctx.clone();
                let semaphore = semaphore.clone();
                running.spawn(async move {
                    let result = match semaphore.acquire_owned().await {
                        Ok(_permit) => {
                            if task_ctx.cancelled.load(Ordering::SeqCst) {
                                task_ctx.skipped(&id)
                            } else {
                                let result = task_ctx.run_task(&id).await;
                                task_ctx.stop_on_failure(&result);
                                result
                            }
                        }
                        Err(e) => Err(e.into()),
                    };
                    (id, result)
                });
            }

            let Some(joined) = running.join_next().await else {
                break;
            };
            let (id, result) = joined.context("Task panicked")?;

            let summary = match result {
                Ok(summary) => summary,
                Err(e) => {
                    warn!(task = %id, "Task failed to run: {:#}", e);
                    ctx.failed(&id, &e)?
                }
            };

            if summary.status.is_success() {
                if !parallel {
                    for dependent in ctx.graph.dependents(&id) {
                        if let Some(count) = pending.get_mut(&dependent) {
                            *count = count.saturating_sub(1);
                            if *count == 0 {
                                ready.insert(dependent);
                            }
                        }
                    }
                }
            } else if summary.status == TaskStatus::Failed && !parallel {
                for dependent in ctx.graph.transitive_dependents(&id) {
                    if pending.remove(&dependent).is_some() {
                        ready.remove(&dependent);
                        results.insert(dependent.clone(), ctx.skipped(&dependent)?);
                    }
                }
            }

            results.insert(id, summary);
        }

        // Everything never started because the run stopped early
        for id in pending.keys().chain(ready.iter()) {
            if !results.contains_key(id) {
                results.insert(id.clone(), ctx.skipped(id)?);
            }
        }

        Ok(RunSummary::new(started_at, results.into_values().collect()))
    }
}

fn package_of<'a>(workspace: &'a Workspace, id: &TaskId) -> Result<&'a Package> {
    workspace
        .package(&id.package)
        .with_context(|| format!("Package {} not found", id.package))
}

/// Outputs that will be cached; none when caching is disabled
fn effective_outputs(node: &TaskNode) -> Vec<String> {
    if node.definition.cacheable() {
        node.definition.outputs.clone()
    } else {
        Vec::new()
    }
}

impl RunContext {
    fn node(&self, id: &TaskId) -> Result<&TaskNode> {
        self.graph
            .node(id)
            .with_context(|| format!("Task {} missing from graph", id))
    }

    fn hash(&self, id: &TaskId) -> Result<&TaskHash> {
        self.hashes
            .get(id)
            .with_context(|| format!("Task {} has no hash", id))
    }

    fn summary(&self, id: &TaskId, status: TaskStatus) -> Result<TaskSummary> {
        let node = self.node(id)?;
        let package = package_of(&self.workspace, id)?;

        Ok(TaskSummary {
            task_id: id.to_string(),
            package: id.package.clone(),
            task: id.task.clone(),
            hash: self.hash(id)?.hash.clone(),
            status,
            exit_code: None,
            duration_ms: 0,
            cache_enabled: node.definition.cacheable(),
            command: node.command.clone(),
            outputs: effective_outputs(node),
            dependencies: node.dependencies.iter().map(|d| d.to_string()).collect(),
            log_file: log_file_relative(package, id),
        })
    }

    fn skipped(&self, id: &TaskId) -> Result<TaskSummary> {
        debug!(task = %id, status = status::SKIPPED, "skipping task");
        self.summary(id, TaskStatus::Skipped)
    }

    fn failed(&self, id: &TaskId, error: &anyhow::Error) -> Result<TaskSummary> {
        let prefix = self.sink.prefix(id);
        self.sink.line(&prefix, &format!("ERROR: {:#}", error));
        let mut summary = self.summary(id, TaskStatus::Failed)?;
        summary.exit_code = Some(1);
        Ok(summary)
    }

    /// Cancel tasks not yet started, before the failed task releases its permit
    fn stop_on_failure(&self, result: &Result<TaskSummary>) {
        let failed = match result {
            Ok(summary) => summary.status == TaskStatus::Failed,
            Err(_) => true,
        };
        if failed && !self.options.continue_on_error {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

        fn output_mode(&self, node: &TaskNode) -> OutputMode {
        self.options
            .output_mode
            .or(node.definition.output_mode)
            .unwrap_or(self.options.default_output_mode)
    }

    async fn run_task(&self, id: &TaskId) -> Result<TaskSummary> {
        let node = self.node(id)?;
        let package = package_of(&self.workspace, id)?;
        let hash = self.hash(id)?.hash.clone();

        let Some(command) = node.command.as_deref() else {
            return self.summary(id, TaskStatus::NoOp);
        };

        let mode = self.output_mode(node);
        let prefix = self.sink.prefix(id);
        let log_file = log_file_path(package, id);
        let cacheable = node.definition.cacheable();

        if cacheable && self.cache.policy().reads() {
            if let Some(hit) = self.cache.fetch(&hash, id).await? {
                if mode.replays_cached() {
                    self.sink
                        .line(&prefix, &format!("cache hit, replaying logs {}", hash));
                    if let Err(e) = self.sink.replay(&prefix, &log_file) {
                        debug!(task = %id, "No log to replay: {}", e);
                    }
                } else if mode.prints_hash() {
                    self.sink
                        .line(&prefix, &format!("cache hit, suppressing logs {}", hash));
                }

                let mut summary = self.summary(id, TaskStatus::Cached(hit.source))?;
                summary.exit_code = Some(0);
                summary.duration_ms = hit.duration_ms;
                return Ok(summary);
            }
        }

        if mode.prints_hash() {
            let message = if !cacheable {
                format!("cache bypass, force executing {}", hash)
            } else {
                format!("cache miss, executing {}", hash)
            };
            self.sink.line(&prefix, &message);
        }

        let args: &[String] = if self.options.requested_tasks.contains(&id.task) {
            self.options.passthrough_args.as_slice()
        } else {
            &[]
        };

        debug!(operation = operations::EXECUTE, task = %id, hash = %hash, "executing task");
        let result = self
            .executor
            .execute(ExecutionRequest {
                task: id,
                command,
                args,
                cwd: &package.dir,
                hash: &hash,
                log_file: &log_file,
                mode,
            })
            .await?;

        let mut summary = if result.success() {
            self.summary(id, TaskStatus::Executed)?
        } else {
            warn!(
                operation = operations::EXECUTE,
                status = status::ERROR,
                task = %id,
                exit_code = result.exit_code,
                "task failed"
            );
            self.sink.line(
                &prefix,
                &format!("ERROR: command finished with error: exit code {}", result.exit_code),
            );
            self.summary(id, TaskStatus::Failed)?
        };
        summary.exit_code = Some(result.exit_code);
        summary.duration_ms = result.duration.as_millis() as u64;

        if result.success() && cacheable {
            let mut files = vec![log_file_relative(package, id)];
            files.extend(expand_outputs(package, &node.definition.outputs)?);

            if let Err(e) = self.cache.put(&hash, id, files, result.duration).await {
                warn!(task = %id, hash = %hash, "Failed to cache task outputs: {:#}", e);
            }
        }

        Ok(summary)
    }
}
