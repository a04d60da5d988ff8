/// Configuration merger: CLI args > Env vars > Config file > Defaults
///
/// This module handles merging configuration from multiple sources:
/// 1. CLI arguments (highest priority)
/// 2. Environment variables (handled by clap's `env` attributes)
/// 3. Configuration file (`kiln.toml`)
/// 4. Built-in defaults (lowest priority)
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::remote::RemoteCacheOptions;
use crate::cache::CachePolicy;
use crate::cli::{CacheConfigArgs, RunArgs};
use crate::config::{parse_duration, KilnConfig};
use crate::run::output::OutputMode;
use crate::run::scheduler::parse_concurrency;

/// Merged cache settings for `run` and `cache`
#[derive(Debug, Clone)]
pub struct MergedCacheConfig {
    /// Absolute local cache directory
    pub dir: PathBuf,
    /// Remote cache connection, when a URL is configured and remote is enabled
    pub remote: Option<RemoteCacheOptions>,
    pub remote_read_only: bool,
    pub max_age: Option<Duration>,
}

/// Merged configuration for the run command
#[derive(Debug, Clone)]
pub struct MergedRunConfig {
    pub cache: MergedCacheConfig,
    pub policy: CachePolicy,
    pub concurrency: usize,
    /// Output mode forced on every task (`--output-logs`)
    pub output_override: Option<OutputMode>,
    /// Output mode for tasks that don't set one
    pub output_default: OutputMode,
    pub continue_on_error: bool,
}

impl MergedCacheConfig {
    /// Merge cache settings; relative paths resolve against `root`
    pub fn merge(args: &CacheConfigArgs, file: &KilnConfig, root: &Path) -> Result<Self> {
        let dir = args
            .cache_dir
            .clone()
            .unwrap_or_else(|| file.cache.dir.clone());
        let dir = if Path::new(&dir).is_absolute() {
            PathBuf::from(dir)
        } else {
            root.join(dir)
        };

        let url = args.api.clone().or_else(|| {
            file.remote
                .url
                .clone()
                .filter(|_| file.remote.enabled)
        });

        let remote = match url {
            Some(url) => {
                let token = args
                    .token
                    .clone()
                    .or_else(|| file.remote.token.clone())
                    .or_else(|| std::env::var(&file.remote.token_env).ok())
                    .filter(|t| !t.is_empty());
                let timeout =
                    parse_duration(&file.remote.timeout).context("remote.timeout is invalid")?;

                Some(RemoteCacheOptions {
                    url,
                    team: args.team.clone().or_else(|| file.remote.team.clone()),
                    token,
                    timeout,
                })
            }
            None => None,
        };

        let max_age = file
            .cache
            .max_age
            .as_deref()
            .map(parse_duration)
            .transpose()
            .context("cache.max_age is invalid")?;

        Ok(Self {
            dir,
            remote,
            remote_read_only: file.remote.read_only,
            max_age,
        })
    }
}

impl MergedRunConfig {
    /// Merge configuration from CLI args and config file
    /// Precedence: CLI > env (already handled by clap) > config file > defaults
    pub fn merge(args: &RunArgs, file_config: Option<KilnConfig>, root: &Path) -> Result<Self> {
        let file = file_config.unwrap_or_default();
        let cache = MergedCacheConfig::merge(&args.cache, &file, root)?;

        let policy = CachePolicy::from_flags(
            args.force,
            args.no_cache,
            args.remote_only,
            cache.remote_read_only,
        );

        let concurrency = parse_concurrency(
            args.concurrency
                .as_deref()
                .unwrap_or(&file.run.concurrency),
        )?;

        let output_override = args
            .output_logs
            .as_deref()
            .map(|value| {
                OutputMode::parse(value).ok_or_else(|| {
                    anyhow!(
                        "Invalid --output-logs value: {}. Use: full, hash-only, new-only, errors-only, none",
                        value
                    )
                })
            })
            .transpose()?;

        let output_default = OutputMode::parse(&file.run.output_logs)
            .ok_or_else(|| anyhow!("run.output_logs is invalid: {}", file.run.output_logs))?;

        Ok(Self {
            cache,
            policy,
            concurrency,
            output_override,
            output_default,
            continue_on_error: args.continue_on_error || file.run.continue_on_error,
        })
    }
}
