//! Content hashing for cache keys
//!
//! A task hash covers everything that can change a task's result: the
//! global hash (shared files, env and pipeline), the package, the command,
//! the hashed part of the task definition, input file contents, env values,
//! dependency hashes and passthrough args.

pub mod inputs;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::graph::TaskNode;
use crate::pipeline::PipelineConfig;
use crate::workspace::Package;

pub use inputs::{collect_package_inputs, expand_globs};

/// Bumped whenever the hash layout changes
const HASH_VERSION: &str = "kiln-hash-v2";

/// Length of task hashes in hex characters
pub const HASH_LENGTH: usize = 16;

/// Marker hashed for env vars that are not set
const UNSET: &str = "<unset>";

/// SHA-256 hex of a file's content
pub fn hash_file(path: &Path) -> Result<String> {
    let content =
        fs::read(path).with_context(|| format!("Failed to read file: {}", path.display()))?;
    Ok(hex::encode(Sha256::digest(&content)))
}

/// Hash of everything shared by all tasks
#[derive(Debug, Clone)]
pub struct GlobalHash {
    pub hash: String,
    /// Global dependency files (root relative) with their content hashes
    pub files: BTreeMap<String, String>,
}

impl GlobalHash {
    pub fn compute(
        root: &Path,
        pipeline: &PipelineConfig,
        env: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut hasher = Sha256::new();
        update_field(&mut hasher, HASH_VERSION);

        let mut files = BTreeMap::new();
        for file in expand_globs(root, &pipeline.global_dependencies)? {
            let hash = hash_file(&root.join(&file))?;
            files.insert(file, hash);
        }
        update_list(&mut hasher, files.iter().flat_map(|(f, h)| [f.as_str(), h.as_str()]));
        update_list(&mut hasher, &env_pairs(&pipeline.global_env, env));
        update_field(&mut hasher, &pipeline.canonical_json());

        Ok(Self {
            hash: hex::encode(hasher.finalize()),
            files,
        })
    }
}

/// Result of hashing one task
#[derive(Debug, Clone)]
pub struct TaskHash {
    pub hash: String,
    /// Input files (package relative) with their content hashes
    pub inputs: BTreeMap<String, String>,
    /// Names of env vars that entered the hash
    pub env: Vec<String>,
}

/// Computes task hashes against a fixed global hash and environment snapshot
pub struct TaskHasher {
    global_hash: String,
    env: BTreeMap<String, String>,
    /// Absolute directories of all packages, for excluding nested packages
    package_dirs: Vec<PathBuf>,
}

impl TaskHasher {
    pub fn new(
        global_hash: impl Into<String>,
        env: BTreeMap<String, String>,
        package_dirs: Vec<PathBuf>,
    ) -> Self {
        Self {
            global_hash: global_hash.into(),
            env,
            package_dirs,
        }
    }

    /// Hash a task; `dependency_hashes` must already be known
    pub fn task_hash(
        &self,
        node: &TaskNode,
        package: &Package,
        dependency_hashes: &[String],
        passthrough_args: &[String],
    ) -> Result<TaskHash> {
        let nested: Vec<PathBuf> = self
            .package_dirs
            .iter()
            .filter(|dir| **dir != package.dir && dir.starts_with(&package.dir))
            .cloned()
            .collect();

        let mut inputs = BTreeMap::new();
        for file in collect_package_inputs(package, &node.definition, &nested)? {
            let hash = hash_file(&package.dir.join(&file))?;
            inputs.insert(file, hash);
        }

        let mut hasher = Sha256::new();
        update_field(&mut hasher, &self.global_hash);
        update_field(&mut hasher, &package.name);
        update_field(&mut hasher, &package.relative_dir);
        update_field(&mut hasher, &node.id.task);
        update_field(&mut hasher, node.command.as_deref().unwrap_or_default());

        let definition = serde_json::to_string(&node.definition.hashable())
            .context("Failed to serialize task definition")?;
        update_field(&mut hasher, &definition);

        update_list(&mut hasher, inputs.iter().flat_map(|(f, h)| [f.as_str(), h.as_str()]));

        let env_pairs = env_pairs(&node.definition.env, &self.env);
        update_list(&mut hasher, &env_pairs);

        let mut dependency_hashes = dependency_hashes.to_vec();
        dependency_hashes.sort();
        update_list(&mut hasher, &dependency_hashes);

        update_list(&mut hasher, passthrough_args);

        update_field(&mut hasher, std::env::consts::OS);

        let hash = hex::encode(hasher.finalize());

        Ok(TaskHash {
            hash: hash[..HASH_LENGTH].to_string(),
            inputs,
            env: env_pairs
                .iter()
                .filter_map(|p| p.split_once('=').map(|(name, _)| name.to_string()))
                .collect(),
        })
    }
}

/// Hash one field followed by a NUL terminator
fn update_field(hasher: &mut Sha256, field: &str) {
    hasher.update(field.as_bytes());
    hasher.update([0u8]);
}

/// Hash a list of fields followed by an end-of-list marker
fn update_list<I>(hasher: &mut Sha256, fields: I)
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    for field in fields {
        update_field(hasher, field.as_ref());
    }
    hasher.update([0xffu8]);
}

/// `NAME=value` pairs for the requested names, sorted
///
/// A trailing `*` matches by prefix; a missing exact name hashes as unset.
fn env_pairs(names: &[String], env: &BTreeMap<String, String>) -> Vec<String> {
    let mut pairs = BTreeMap::new();

    for name in names {
        match name.strip_suffix('*') {
            Some(prefix) => {
                for (key, value) in env.range(prefix.to_string()..) {
                    if !key.starts_with(prefix) {
                        break;
                    }
                    pairs.insert(key.clone(), value.clone());
                }
            }
            None => {
                let value = env.get(name).cloned().unwrap_or_else(|| UNSET.to_string());
                pairs.insert(name.clone(), value);
            }
        }
    }

    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect()
}
