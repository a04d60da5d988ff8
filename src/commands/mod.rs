pub mod cache;
pub mod config;
pub mod graph;
pub mod run;
pub mod serve;

use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::config::KilnConfig;
use crate::config_discovery::{find_workspace_root, load_config_with_discovery, PIPELINE_FILE};
use crate::graph::TaskGraph;
use crate::pipeline::PipelineConfig;
use crate::workspace::Workspace;

/// A loaded workspace: root, packages, pipeline and tool config
pub struct Project {
    pub root: PathBuf,
    pub workspace: Workspace,
    pub pipeline: PipelineConfig,
    pub config: Option<KilnConfig>,
}

impl Project {
    /// Locate the workspace from the current directory and load it
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to get current directory")?;
        let root = find_workspace_root(&cwd)?;

        let config = load_config_with_discovery(config_path, &root)?;
        if let Some(config) = &config {
            config.validate()?;
        }

        let pipeline = PipelineConfig::from_file(root.join(PIPELINE_FILE))?;
        pipeline.validate()?;

        let workspace = Workspace::discover(&root)?;
        tracing::debug!(
            root = %root.display(),
            packages = workspace.packages.len(),
            "loaded workspace"
        );

        Ok(Self {
            root,
            workspace,
            pipeline,
            config,
        })
    }

    /// Build the task graph for `tasks` over the packages matched by `filter`
    pub fn graph(&self, filter: &[String], tasks: &[String], only: bool) -> Result<TaskGraph> {
        let packages = self.workspace.filter(filter)?;
        let graph = TaskGraph::build(&self.workspace, &self.pipeline, &packages, tasks, only)?;
        Ok(graph)
    }
}
