use anyhow::Result;
use clap::Parser;

use kiln::cli::{Cli, Commands};
use kiln::config_discovery::load_config_with_discovery;
use kiln::logging::LogFormat;
use kiln::{commands, logging};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Log settings from a discovered kiln.toml, if any
    let observability = std::env::current_dir()
        .ok()
        .and_then(|cwd| load_config_with_discovery(None, &cwd).ok().flatten())
        .map(|config| config.observability);

    let level = cli
        .log_level
        .clone()
        .or_else(|| observability.as_ref().map(|o| o.log_level.clone()))
        .unwrap_or_else(|| "warn".to_string());
    let format = observability
        .as_ref()
        .and_then(|o| LogFormat::parse(&o.log_format));

    // Initialize structured logging
    logging::init(&level, format);

    // Dispatch to appropriate command handler
    match cli.command {
        Commands::Run(args) => {
            let exit_code = commands::run::run(&args).await?;
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
            Ok(())
        }
        Commands::Cache(args) => commands::cache::cache(&args).await,
        Commands::Serve(args) => commands::serve::run(args).await,
        Commands::Config(args) => commands::config::run(args.command),
        Commands::Graph(args) => commands::graph::run(&args),
    }
}
