use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::run::output::OutputMode;
use crate::run::scheduler::parse_concurrency;

/// Complete Kiln tool configuration (loaded from `kiln.toml`)
///
/// This is separate from the pipeline file (`turbo.json`): it describes where
/// and how to cache, not what to run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KilnConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub run: RunConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Local cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache directory path (relative paths resolve against the workspace root)
    #[serde(default = "default_cache_dir")]
    pub dir: String,

    /// Entries older than this are removed by `kiln cache clean --older-than`
    /// when no explicit age is given (e.g., "7d")
    #[serde(default)]
    pub max_age: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            max_age: None,
        }
    }
}

/// Remote cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Remote cache base URL (e.g., "https://cache.example.com")
    #[serde(default)]
    pub url: Option<String>,

    /// Team identifier sent as `teamId` (or `slug` when not prefixed with "team_")
    #[serde(default)]
    pub team: Option<String>,

    /// Inline bearer token
    #[serde(default)]
    pub token: Option<String>,

    /// Environment variable holding the bearer token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Never upload artifacts
    #[serde(default)]
    pub read_only: bool,

    /// Request timeout
    #[serde(default = "default_remote_timeout")]
    pub timeout: String,

    /// Use the remote cache at all
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            team: None,
            token: None,
            token_env: default_token_env(),
            read_only: false,
            timeout: default_remote_timeout(),
            enabled: true,
        }
    }
}

/// Run defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Max concurrent tasks: a number or a percentage of CPUs ("50%")
    #[serde(default = "default_concurrency")]
    pub concurrency: String,

    /// Default output mode when the task definition does not set one
    #[serde(default = "default_output_logs")]
    pub output_logs: String,

    /// Keep running independent tasks after a failure
    #[serde(default)]
    pub continue_on_error: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            output_logs: default_output_logs(),
            continue_on_error: false,
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_cache_dir() -> String {
    ".kiln/cache".to_string()
}

fn default_token_env() -> String {
    "KILN_TOKEN".to_string()
}

fn default_remote_timeout() -> String {
    "30s".to_string()
}

fn default_concurrency() -> String {
    "10".to_string()
}

fn default_output_logs() -> String {
    "full".to_string()
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_true() -> bool {
    true
}

impl KilnConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: KilnConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Generate example configuration as TOML string
    pub fn example() -> Result<String> {
        let config = KilnConfig {
            cache: CacheConfig {
                dir: ".kiln/cache".to_string(),
                max_age: Some("7d".to_string()),
            },
            remote: RemoteConfig {
                url: Some("https://cache.example.com".to_string()),
                team: Some("team_example".to_string()),
                token: None,
                token_env: default_token_env(),
                read_only: false,
                timeout: "30s".to_string(),
                enabled: true,
            },
            run: RunConfig {
                concurrency: "50%".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };

        toml::to_string_pretty(&config).context("Failed to serialize example config")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.cache.dir.is_empty() {
            anyhow::bail!("cache.dir must be set");
        }

        if let Some(max_age) = &self.cache.max_age {
            parse_duration(max_age).context("cache.max_age is invalid")?;
        }

        if let Some(url) = &self.remote.url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("remote.url must start with http:// or https://: {}", url);
            }
        }

        parse_duration(&self.remote.timeout).context("remote.timeout is invalid")?;

        parse_concurrency(&self.run.concurrency).context("run.concurrency is invalid")?;

        if OutputMode::parse(&self.run.output_logs).is_none() {
            anyhow::bail!(
                "run.output_logs must be one of: full, hash-only, new-only, errors-only, none"
            );
        }

        if crate::logging::LogFormat::parse(&self.observability.log_format).is_none() {
            anyhow::bail!("observability.log_format must be one of: pretty, compact, json");
        }

        Ok(())
    }
}

/// Parse duration string (e.g., "30s", "10m", "1h", "7d")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(anyhow!("Empty duration string"));
    }

    let (num_str, unit) = s.split_at(s.len() - 1);
    let num: u64 = num_str
        .parse()
        .map_err(|_| anyhow!("Invalid duration: {}", s))?;

    let seconds = match unit {
        "s" => num,
        "m" => num * 60,
        "h" => num * 3600,
        "d" => num * 86400,
        _ => return Err(anyhow!("Invalid duration unit: {}. Use: s, m, h, d", unit)),
    };

    Ok(Duration::from_secs(seconds))
}

/// Parse a byte size ("512MB", "5GB", "100KB", or a plain number of bytes)
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_uppercase();
    let (num_str, multiplier) = if let Some(n) = s.strip_suffix("TB") {
        (n, 1024u64 * 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("GB") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("MB") {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("KB") {
        (n, 1024)
    } else if let Some(n) = s.strip_suffix('B') {
        (n, 1)
    } else {
        (s.as_str(), 1)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid size: {}", s))?;

    Ok(num * multiplier)
}
