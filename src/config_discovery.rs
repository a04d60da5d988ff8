use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::KilnConfig;

/// Name of the pipeline file that marks a workspace root
pub const PIPELINE_FILE: &str = "turbo.json";

/// Name of the tool configuration file
pub const CONFIG_FILE: &str = "kiln.toml";

/// Finds the workspace root by traversing up to the first directory with a pipeline file
pub fn find_workspace_root(start_dir: &Path) -> Result<PathBuf> {
    let mut current = start_dir.to_path_buf();

    loop {
        if current.join(PIPELINE_FILE).is_file() {
            return Ok(current);
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    anyhow::bail!(
        "Could not find {} in {} or any parent directory",
        PIPELINE_FILE,
        start_dir.display()
    )
}

/// Discovers Kiln configuration by traversing up the directory tree
pub fn discover_config(start_dir: &Path) -> Result<Option<PathBuf>> {
    let mut current = start_dir.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_FILE);
        if config_path.exists() {
            return Ok(Some(config_path));
        }

        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    // Fallback to global config
    if let Some(home) = dirs::home_dir() {
        let global_config = home.join(".config/kiln/config.toml");
        if global_config.exists() {
            return Ok(Some(global_config));
        }
    }

    Ok(None)
}

/// Loads configuration with auto-discovery support
///
/// If `explicit_path` is provided, loads config from that path.
/// Otherwise, auto-discovers config by traversing up from `start_dir`.
///
/// Returns Ok(None) if no config is found (neither explicit nor discovered).
pub fn load_config_with_discovery(
    explicit_path: Option<&str>,
    start_dir: &Path,
) -> Result<Option<KilnConfig>> {
    if let Some(config_path) = explicit_path {
        return Ok(Some(KilnConfig::from_file(config_path)?));
    }

    match discover_config(start_dir).context("Failed to discover configuration")? {
        Some(discovered_path) => {
            tracing::debug!(path = %discovered_path.display(), "Using discovered config");
            Ok(Some(KilnConfig::from_file(&discovered_path)?))
        }
        None => Ok(None),
    }
}
