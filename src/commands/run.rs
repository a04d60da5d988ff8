/// `kiln run` command implementation
///
/// Loads the workspace, builds and hashes the task graph, then either
/// reports a dry run or executes it against the configured cache layers.
use anyhow::Result;
use std::path::Path;
use tracing::{info, warn};

use super::Project;
use crate::cache::local::LocalCache;
use crate::cache::remote::RemoteCache;
use crate::cache::{CachePolicy, TaskCache};
use crate::cli::{DryRunFormat, RunArgs};
use crate::cli_utils::kiln_prefix;
use crate::merger::{MergedCacheConfig, MergedRunConfig};
use crate::run::{Run, RunOptions};

/// Run the requested tasks; returns the process exit code
pub async fn run(args: &RunArgs) -> Result<i32> {
    let project = Project::load(args.cache.config.as_deref())?;
    let config = MergedRunConfig::merge(args, project.config.clone(), &project.root)?;

    let graph = project.graph(&args.filter, &args.tasks, args.only)?;
    if graph.is_empty() {
        println!("{} No tasks to run", kiln_prefix());
        return Ok(0);
    }

    info!(
        tasks = graph.len(),
        concurrency = config.concurrency,
        cache_dir = %config.cache.dir.display(),
        remote = config.cache.remote.is_some(),
        "starting run"
    );

    let cache = task_cache(&project.root, &config.cache, config.policy)?;
    let options = RunOptions {
        concurrency: config.concurrency,
        parallel: args.parallel,
        continue_on_error: config.continue_on_error,
        output_mode: config.output_override,
        default_output_mode: config.output_default,
        passthrough_args: args.passthrough.clone(),
        requested_tasks: args
            .tasks
            .iter()
            .map(|t| t.rsplit('#').next().unwrap_or(t).to_string())
            .collect(),
    };

    let Project {
        root,
        workspace,
        pipeline,
        ..
    } = project;
    let run = Run::new(workspace, &pipeline, graph, cache, options)?;

    if let Some(format) = args.dry_run {
        let summary = run.dry_run().await?;
        match format {
            DryRunFormat::Text => print!("{}", summary.render_text()),
            DryRunFormat::Json => println!("{}", summary.render_json()?),
        }
        return Ok(0);
    }

    let summary = run.execute().await?;
    print!("{}", summary.render());

    if args.summarize {
        let path = summary.write(&root)?;
        println!("{} Summary: {}", kiln_prefix(), path.display());
    }

    Ok(summary.exit_code)
}

/// Assemble the cache layers allowed by `policy`
///
/// A remote cache that can't be constructed is reported and left out.
pub fn task_cache(root: &Path, config: &MergedCacheConfig, policy: CachePolicy) -> Result<TaskCache> {
    let local = if policy.read_local || policy.write_local {
        Some(LocalCache::new(config.dir.clone())?)
    } else {
        None
    };

    let remote = match &config.remote {
        Some(options) => match RemoteCache::new(options.clone()) {
            Ok(remote) => Some(remote),
            Err(e) => {
                warn!(url = %options.url, "Remote cache disabled: {}", e);
                None
            }
        },
        None => None,
    };

    Ok(TaskCache::new(root.to_path_buf(), local, remote, policy))
}
