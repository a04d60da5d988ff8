use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;

use crate::cli::ServeArgs;
use crate::cli_utils::format_bytes;
use crate::config::parse_size;
use crate::config_discovery::load_config_with_discovery;
use crate::server::store::{ArtifactStore, FilesystemStore};
use crate::server::{router, serve, ServerConfig};

pub async fn run(args: ServeArgs) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let file_config = load_config_with_discovery(args.config.as_deref(), &cwd)?.unwrap_or_default();

    let dir = match &args.dir {
        Some(dir) => PathBuf::from(dir),
        None => dirs::data_dir()
            .map(|d| d.join("kiln").join("artifacts"))
            .unwrap_or_else(|| cwd.join(".kiln").join("artifacts")),
    };

    let max_artifact_size =
        parse_size(&args.max_artifact_size).context("Invalid --max-artifact-size")?;

    // Falls back to the client token from kiln.toml
    let token = args.token.clone().or_else(|| file_config.remote.token.clone());

    let store = FilesystemStore::new(&dir)?;
    let stats = store.stats()?;

    info!("Starting remote cache server");
    info!("Configuration:");
    info!("  Storage directory: {}", dir.display());
    info!(
        "  Stored artifacts: {} ({})",
        stats.total_artifacts,
        format_bytes(stats.total_bytes)
    );
    info!("  Max artifact size: {}", format_bytes(max_artifact_size));
    info!("  Authentication: {}", if token.is_some() { "bearer token" } else { "none" });

    let app = router(
        Arc::new(store),
        ServerConfig {
            token,
            max_artifact_size,
        },
    );

    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("Failed to bind {}", args.bind))?;
    println!("Remote cache listening on http://{}", listener.local_addr()?);

    serve(listener, app, shutdown_signal()).await?;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down gracefully...");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down gracefully...");
                    }
                }
            }
            Err(_) => {
                let _ = signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down gracefully...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down gracefully...");
    }
}
