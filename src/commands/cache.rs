/// `kiln cache` command implementation
///
/// Manages local task cache entries (status, list, stats, clean).
use anyhow::{Context, Result};
use std::path::PathBuf;

use super::run::task_cache;
use super::Project;
use crate::cache::local::LocalCache;
use crate::cache::remote::{RemoteCache, RemoteStatus};
use crate::cache::CachePolicy;
use crate::cli::{CacheArgs, CacheCommands, CacheConfigArgs};
use crate::cli_utils::{format_bytes, kiln_prefix};
use crate::config::parse_duration;
use crate::config_discovery::{find_workspace_root, load_config_with_discovery};
use crate::merger::MergedCacheConfig;
use crate::run::summary::DryRunCacheState;
use crate::run::{Run, RunOptions};

pub async fn cache(args: &CacheArgs) -> Result<()> {
    match &args.command {
        CacheCommands::Status { tasks, filter } => status(&args.cache, tasks, filter).await,
        CacheCommands::List { verbose } => list(&local_cache(&args.cache)?.0, *verbose),
        CacheCommands::Stats => stats(&local_cache(&args.cache)?.0),
        CacheCommands::Clean {
            hash,
            all,
            older_than,
        } => {
            let (cache, config) = local_cache(&args.cache)?;
            clean(&cache, &config, hash.as_deref(), *all, older_than.as_deref())
        }
    }
}

/// Open the local cache; outside a workspace relative paths resolve against the cwd
fn local_cache(args: &CacheConfigArgs) -> Result<(LocalCache, MergedCacheConfig)> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let root: PathBuf = find_workspace_root(&cwd).unwrap_or(cwd);

    let file = load_config_with_discovery(args.config.as_deref(), &root)?.unwrap_or_default();
    let config = MergedCacheConfig::merge(args, &file, &root)?;
    let cache = LocalCache::new(config.dir.clone()).context("Failed to open local cache")?;

    Ok((cache, config))
}

/// Show whether each task of the graph would be replayed
async fn status(args: &CacheConfigArgs, tasks: &[String], filter: &[String]) -> Result<()> {
    let project = Project::load(args.config.as_deref())?;
    let file = project.config.clone().unwrap_or_default();
    let config = MergedCacheConfig::merge(args, &file, &project.root)?;

    if let Some(options) = &config.remote {
        let remote = RemoteCache::new(options.clone())?;
        match remote.status().await {
            Ok(RemoteStatus::Enabled) => println!("Remote cache: enabled ({})", remote.base_url()),
            Ok(RemoteStatus::Disabled) => println!("Remote cache: disabled ({})", remote.base_url()),
            Ok(RemoteStatus::Unknown) => println!("Remote cache: unknown ({})", remote.base_url()),
            Err(e) => println!("Remote cache: unreachable ({}): {}", remote.base_url(), e),
        }
    } else {
        println!("Remote cache: not configured");
    }
    println!("Local cache: {}", config.dir.display());
    println!();

    let graph = project.graph(filter, tasks, false)?;
    let policy = CachePolicy::from_flags(false, true, false, true);
    let cache = task_cache(&project.root, &config, policy)?;

    let Project {
        workspace,
        pipeline,
        ..
    } = project;
    let run = Run::new(workspace, &pipeline, graph, cache, RunOptions::default())?;
    let summary = run.dry_run().await?;

    let mut hits = 0;
    for task in &summary.tasks {
        if matches!(task.cache, DryRunCacheState::Hit(_)) {
            hits += 1;
        }
        println!("  {:<30} {}  {}", task.task_id, task.hash, task.cache);
    }

    println!();
    println!("{} of {} tasks cached", hits, summary.tasks.len());

    Ok(())
}

fn list(cache: &LocalCache, verbose: bool) -> Result<()> {
    let entries = cache.list().context("Failed to list cache entries")?;

    if entries.is_empty() {
        println!("No cache entries.");
        return Ok(());
    }

    println!("Cache entries ({} entries):", entries.len());
    println!();

    for entry in entries {
        let metadata = &entry.metadata;
        println!("  {}  {}", metadata.hash, metadata.task);

        if verbose {
            println!(
                "    Created: {}",
                metadata.created_at.format("%Y-%m-%d %H:%M:%S")
            );
            println!("    Source: {}", metadata.source);
            println!(
                "    Duration: {:.2}s",
                metadata.duration_ms as f64 / 1000.0
            );
            println!(
                "    Files: {} ({})",
                metadata.files.len(),
                format_bytes(metadata.size_bytes())
            );
            for file in &metadata.files {
                println!("      {}", file.path);
            }
            println!();
        }
    }

    Ok(())
}

fn stats(cache: &LocalCache) -> Result<()> {
    let stats = cache.stats().context("Failed to get cache statistics")?;

    println!("Task Cache Statistics");
    println!();
    println!("Directory: {}", cache.dir().display());
    println!("Total entries: {}", stats.total_entries);
    println!("Total files: {}", stats.total_files);
    println!("Artifact size: {}", format_bytes(stats.artifact_bytes));
    println!("Content size: {}", format_bytes(stats.content_bytes));

    if stats.total_entries > 0 {
        println!(
            "Average artifact size: {}",
            format_bytes(stats.artifact_bytes / stats.total_entries as u64)
        );
    }

    Ok(())
}

fn clean(
    cache: &LocalCache,
    config: &MergedCacheConfig,
    hash: Option<&str>,
    all: bool,
    older_than: Option<&str>,
) -> Result<()> {
    if all {
        cache.clean_all().context("Failed to clean cache")?;
        println!("{} All cache entries removed.", kiln_prefix());
        return Ok(());
    }

    if let Some(hash) = hash {
        if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            anyhow::bail!("Invalid cache hash: {}", hash);
        }
        if cache.remove(hash)? {
            println!("{} Removed {}", kiln_prefix(), hash);
        } else {
            println!("{} No cache entry for {}", kiln_prefix(), hash);
        }
        return Ok(());
    }

    let max_age = match older_than {
        Some(value) => parse_duration(value).context("Invalid --older-than")?,
        None => config.max_age.context(
            "Specify --all, --older-than <age> or a hash (or set cache.max_age in kiln.toml)",
        )?,
    };

    let removed = cache.prune(max_age)?;
    println!("{} Removed {} cache entries.", kiln_prefix(), removed);

    Ok(())
}
