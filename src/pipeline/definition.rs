/// Pipeline file model (`turbo.json`)
///
/// The pipeline maps task names (`build`) or package-qualified task names
/// (`web#build`) to task definitions describing inputs, outputs, dependencies
/// and whether the task participates in caching.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::task_id::{TaskDependency, TaskName};
use super::PipelineError;
use crate::run::output::OutputMode;

/// Configuration of a single task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TaskDefinition {
    /// Whether results may be restored from and saved to the cache
    #[serde(default = "default_true")]
    pub cache: bool,

    /// Globs (relative to the package) of files produced by the task
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Globs (relative to the package) of files that affect the task; empty means all files
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Tasks that must complete first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Environment variables whose values affect the task
    #[serde(default)]
    pub env: Vec<String>,

    /// How task logs are shown in the terminal
    #[serde(default, alias = "outputLogs", skip_serializing_if = "Option::is_none")]
    pub output_mode: Option<OutputMode>,

    /// Long-running task (dev servers, watchers)
    #[serde(default)]
    pub persistent: bool,
}

impl Default for TaskDefinition {
    fn default() -> Self {
        Self {
            cache: true,
            outputs: Vec::new(),
            inputs: Vec::new(),
            depends_on: Vec::new(),
            env: Vec::new(),
            output_mode: None,
            persistent: false,
        }
    }
}

/// Subset of a task definition that participates in the task hash
///
/// Excludes `cache` and `outputMode`: toggling either keeps existing cache
/// entries valid.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HashableDefinition<'a> {
    outputs: &'a [String],
    inputs: &'a [String],
    depends_on: &'a [String],
    env: &'a [String],
    persistent: bool,
}

impl TaskDefinition {
    /// Whether the cache may be used for this task at all
    pub fn cacheable(&self) -> bool {
        self.cache && !self.persistent
    }

    /// Parsed `dependsOn` entries
    pub fn dependencies(&self) -> Result<Vec<TaskDependency>, PipelineError> {
        self.depends_on
            .iter()
            .map(|d| TaskDependency::parse(d))
            .collect()
    }

    pub fn hashable(&self) -> HashableDefinition<'_> {
        HashableDefinition {
            outputs: &self.outputs,
            inputs: &self.inputs,
            depends_on: &self.depends_on,
            env: &self.env,
            persistent: self.persistent,
        }
    }

    /// Move legacy `$VAR` entries from `dependsOn` to `env`
    fn normalize(&mut self) {
        let (env_deps, task_deps): (Vec<String>, Vec<String>) = self
            .depends_on
            .drain(..)
            .partition(|d| d.starts_with('$'));

        self.depends_on = task_deps;
        for var in env_deps {
            let name = var.trim_start_matches('$').to_string();
            if !self.env.contains(&name) {
                self.env.push(name);
            }
        }
    }
}

/// Complete pipeline file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(rename = "$schema", default, skip_serializing)]
    pub schema: Option<String>,

    /// Files (globs relative to the workspace root) that affect every task
    #[serde(default)]
    pub global_dependencies: Vec<String>,

    /// Environment variables that affect every task
    #[serde(default)]
    pub global_env: Vec<String>,

    #[serde(default, alias = "tasks")]
    pub pipeline: BTreeMap<String, TaskDefinition>,
}

impl PipelineConfig {
    /// Load pipeline from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| PipelineError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content, &path.display().to_string())
    }

    /// Parse pipeline JSON; `origin` names the source in error messages
    pub fn parse(content: &str, origin: &str) -> Result<Self, PipelineError> {
        let mut config: PipelineConfig =
            serde_json::from_str(content).map_err(|source| PipelineError::Parse {
                origin: origin.to_string(),
                source,
            })?;

        for definition in config.pipeline.values_mut() {
            definition.normalize();
        }

        Ok(config)
    }

    /// Resolve the definition for a task of a package
    ///
    /// A package-qualified entry (`web#build`) takes precedence over the
    /// generic entry (`build`).
    pub fn task_definition(&self, package: &str, task: &str) -> Option<&TaskDefinition> {
        let qualified = format!("{}#{}", package, task);
        self.pipeline
            .get(&qualified)
            .or_else(|| self.pipeline.get(task))
    }

    /// Whether any entry (generic or package-qualified) defines the task
    pub fn has_task(&self, task: &str) -> bool {
        self.pipeline.keys().any(|key| match TaskName::parse(key) {
            Ok(name) => name.task == task,
            Err(_) => false,
        })
    }

    /// Validate task names, dependency references and persistent-task usage
    pub fn validate(&self) -> Result<(), PipelineError> {
        for (key, definition) in &self.pipeline {
            TaskName::parse(key)?;

            for dependency in definition.dependencies()? {
                let targets: Vec<&TaskDefinition> = match &dependency {
                    TaskDependency::Package(id) => self
                        .task_definition(&id.package, &id.task)
                        .into_iter()
                        .collect(),
                    TaskDependency::Upstream(task) | TaskDependency::SamePackage(task) => self
                        .pipeline
                        .iter()
                        .filter(|(k, _)| {
                            TaskName::parse(k)
                                .map(|n| n.task == *task)
                                .unwrap_or(false)
                        })
                        .map(|(_, d)| d)
                        .collect(),
                };

                if targets.is_empty() {
                    return Err(PipelineError::UnknownDependency {
                        task: key.clone(),
                        dependency: dependency.task().to_string(),
                    });
                }

                if targets.iter().any(|d| d.persistent) {
                    return Err(PipelineError::PersistentDependency {
                        task: key.clone(),
                        dependency: dependency.task().to_string(),
                    });
                }
            }

            if !definition.cache && !definition.outputs.is_empty() {
                tracing::warn!(
                    task = %key,
                    "Task has caching disabled; its outputs will not be cached"
                );
            }
        }

        Ok(())
    }

    /// Canonical JSON of all task definitions (for the global hash)
    pub fn canonical_json(&self) -> String {
        let hashable: BTreeMap<&String, HashableDefinition<'_>> = self
            .pipeline
            .iter()
            .map(|(k, v)| (k, v.hashable()))
            .collect();
        serde_json::to_string(&hashable).unwrap_or_default()
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE: &str = r#"{
        "$schema": "https://turbo.build/schema.json",
        "globalDependencies": [".env"],
        "globalEnv": ["CI"],
        "pipeline": {
            "build": {
                "dependsOn": ["^build", "$API_URL"],
                "outputs": ["dist/**", "!dist/cache/**"]
            },
            "test": { "dependsOn": ["build"], "outputMode": "errors-only" },
            "dev": { "cache": false, "persistent": true },
            "web#build": { "dependsOn": ["^build"], "outputs": [".next/**"], "env": ["NEXT_PUBLIC_*"] }
        }
    }"#;

    #[test]
    fn test_parse_pipeline() {
        let config = PipelineConfig::parse(PIPELINE, "turbo.json").unwrap();

        assert_eq!(config.global_dependencies, vec![".env"]);
        assert_eq!(config.global_env, vec!["CI"]);
        assert_eq!(config.pipeline.len(), 4);

        let build = &config.pipeline["build"];
        assert!(build.cache);
        assert_eq!(build.outputs, vec!["dist/**", "!dist/cache/**"]);

        let test = &config.pipeline["test"];
        assert_eq!(test.output_mode, Some(OutputMode::ErrorsOnly));

        let dev = &config.pipeline["dev"];
        assert!(!dev.cache);
        assert!(!dev.cacheable());
    }

    #[test]
    fn test_cache_defaults_to_true() {
        let config =
            PipelineConfig::parse(r#"{"pipeline": {"lint": {}}}"#, "turbo.json").unwrap();
        assert!(config.pipeline["lint"].cache);
        assert!(config.pipeline["lint"].cacheable());
    }

    #[test]
    fn test_legacy_env_dependencies_move_to_env() {
        let config = PipelineConfig::parse(PIPELINE, "turbo.json").unwrap();
        let build = &config.pipeline["build"];
        assert_eq!(build.depends_on, vec!["^build"]);
        assert_eq!(build.env, vec!["API_URL"]);
    }

    #[test]
    fn test_package_specific_definition_wins() {
        let config = PipelineConfig::parse(PIPELINE, "turbo.json").unwrap();

        let web = config.task_definition("web", "build").unwrap();
        assert_eq!(web.outputs, vec![".next/**"]);

        let ui = config.task_definition("ui", "build").unwrap();
        assert_eq!(ui.outputs, vec!["dist/**", "!dist/cache/**"]);

        assert!(config.task_definition("ui", "deploy").is_none());
    }

    #[test]
    fn test_validate_ok() {
        let config = PipelineConfig::parse(PIPELINE, "turbo.json").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_unknown_dependency() {
        let config = PipelineConfig::parse(
            r#"{"pipeline": {"test": {"dependsOn": ["compile"]}}}"#,
            "turbo.json",
        )
        .unwrap();

        let err = config.validate().unwrap_err();
        assert!(matches!(err, PipelineError::UnknownDependency { .. }));
    }

    #[test]
    fn test_validate_persistent_dependency() {
        let config = PipelineConfig::parse(
            r#"{"pipeline": {
                "dev": {"persistent": true, "cache": false},
                "e2e": {"dependsOn": ["dev"]}
            }}"#,
            "turbo.json",
        )
        .unwrap();

        let err = config.validate().unwrap_err();
        assert!(matches!(err, PipelineError::PersistentDependency { .. }));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = PipelineConfig::parse(
            r#"{"pipeline": {"build": {"cached": false}}}"#,
            "turbo.json",
        );
        assert!(matches!(result, Err(PipelineError::Parse { .. })));
    }

    #[test]
    fn test_canonical_json_ignores_cache_flag() {
        let a = PipelineConfig::parse(
            r#"{"pipeline": {"build": {"outputs": ["dist/**"]}}}"#,
            "a",
        )
        .unwrap();
        let b = PipelineConfig::parse(
            r#"{"pipeline": {"build": {"outputs": ["dist/**"], "cache": false, "outputMode": "none"}}}"#,
            "b",
        )
        .unwrap();
        assert_eq!(a.canonical_json(), b.canonical_json());
    }

    #[test]
    fn test_tasks_alias() {
        let config =
            PipelineConfig::parse(r#"{"tasks": {"build": {"cache": false}}}"#, "turbo.json")
                .unwrap();
        assert!(!config.pipeline["build"].cache);
    }
}
