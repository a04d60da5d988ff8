use anyhow::{Context, Result};
use tracing::info;

use crate::cli::ConfigCommands;
use crate::config::KilnConfig;
use crate::config_discovery::load_config_with_discovery;

pub fn run(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Validate { path } => validate(&path),
        ConfigCommands::Example => example(),
        ConfigCommands::Show { config } => show(config.as_deref()),
    }
}

fn validate(path: &str) -> Result<()> {
    info!("Validating config file: {}", path);

    let config = KilnConfig::from_file(path)?;
    config.validate()?;

    println!("✓ Configuration file is valid: {}", path);
    println!("\nSummary:");
    println!("  - Cache directory: {}", config.cache.dir);
    if let Some(max_age) = &config.cache.max_age {
        println!("  - Max entry age: {}", max_age);
    }
    match &config.remote.url {
        Some(url) if config.remote.enabled => {
            println!(
                "  - Remote cache: {} (timeout: {}{})",
                url,
                config.remote.timeout,
                if config.remote.read_only { ", read-only" } else { "" }
            );
        }
        Some(url) => println!("  - Remote cache: {} (disabled)", url),
        None => println!("  - Remote cache: none"),
    }
    println!("  - Concurrency: {}", config.run.concurrency);
    println!("  - Output logs: {}", config.run.output_logs);

    Ok(())
}

fn example() -> Result<()> {
    println!("{}", KilnConfig::example()?);
    Ok(())
}

fn show(config_path: Option<&str>) -> Result<()> {
    info!("Showing effective configuration");

    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let config = load_config_with_discovery(config_path, &cwd)?.unwrap_or_default();

    println!("Effective Configuration:\n");
    println!("{}", toml::to_string_pretty(&config)?);

    Ok(())
}
