// Library interface for Kiln
// This allows integration tests and external code to use Kiln's modules

pub mod cache;
pub mod cli;
pub mod cli_utils;
pub mod commands;
pub mod config;
pub mod config_discovery;
pub mod graph;
pub mod hash;
pub mod logging;
pub mod merger;
pub mod pipeline;
pub mod run;
pub mod server;
pub mod workspace;

// Re-export commonly used types
pub use config::KilnConfig;
pub use config_discovery::{discover_config, find_workspace_root};
pub use pipeline::PipelineConfig;
pub use workspace::Workspace;
