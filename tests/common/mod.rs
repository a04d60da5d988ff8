// Common test utilities shared across acceptance tests
//
// Each test builds its own workspace in a temporary directory. The local
// cache lives under that workspace (`.kiln/cache`) and HOME points into the
// temp dir, so no test reads a developer's global kiln config or cache.

#![allow(dead_code)]

use assert_cmd::Command;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Environment variables that would leak host settings into a test run
const KILN_ENV: &[&str] = &[
    "KILN_API",
    "KILN_CACHE_DIR",
    "KILN_CONCURRENCY",
    "KILN_CONFIG",
    "KILN_FORCE",
    "KILN_LOG_FORMAT",
    "KILN_LOG_LEVEL",
    "KILN_OUTPUT_LOGS",
    "KILN_REMOTE_ONLY",
    "KILN_SUMMARIZE",
    "KILN_TEAM",
    "KILN_TOKEN",
    "RUST_LOG",
];

/// A temporary monorepo with a `turbo.json` at its root
pub struct TestRepo {
    temp_dir: TempDir,
}

impl TestRepo {
    /// Create a workspace with `apps/*` and `packages/*` globs and the given pipeline
    pub fn new(pipeline: serde_json::Value) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let repo = Self { temp_dir };

        repo.write_json(
            "package.json",
            &serde_json::json!({
                "name": "monorepo",
                "private": true,
                "workspaces": ["apps/*", "packages/*"],
            }),
        );
        repo.write_json("turbo.json", &pipeline);
        fs::create_dir_all(repo.path().join("home")).expect("Failed to create home dir");

        repo
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Add a package at `dir` with scripts and (workspace) dependencies
    pub fn package(&self, dir: &str, name: &str, scripts: &[(&str, &str)], deps: &[&str]) -> &Self {
        let scripts: serde_json::Map<String, serde_json::Value> = scripts
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
            .collect();
        let deps: serde_json::Map<String, serde_json::Value> = deps
            .iter()
            .map(|d| (d.to_string(), serde_json::Value::String("*".to_string())))
            .collect();

        self.write_json(
            &format!("{}/package.json", dir),
            &serde_json::json!({
                "name": name,
                "version": "0.0.0",
                "scripts": scripts,
                "dependencies": deps,
            }),
        );
        self
    }

    pub fn write_json(&self, path: &str, value: &serde_json::Value) {
        self.write_file(
            path,
            &serde_json::to_string_pretty(value).expect("Failed to serialize JSON"),
        );
    }

    pub fn write_file(&self, path: &str, content: &str) {
        let file_path = self.path().join(path);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        fs::write(file_path, content).expect("Failed to write file");
    }

    pub fn read_file(&self, path: &str) -> String {
        fs::read_to_string(self.path().join(path))
            .unwrap_or_else(|e| panic!("Failed to read {}: {}", path, e))
    }

    pub fn exists(&self, path: &str) -> bool {
        self.path().join(path).exists()
    }

    pub fn remove(&self, path: &str) {
        let full = self.path().join(path);
        if full.is_dir() {
            fs::remove_dir_all(full).expect("Failed to remove dir");
        } else if full.exists() {
            fs::remove_file(full).expect("Failed to remove file");
        }
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.path().join(".kiln/cache")
    }

    /// `kiln` binary running in the workspace root with an isolated environment
    pub fn kiln(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_kiln"));
        for var in KILN_ENV {
            cmd.env_remove(var);
        }
        cmd.env("HOME", self.path().join("home"));
        cmd.env_remove("CI");
        cmd.current_dir(self.path());
        cmd
    }

    /// Run `kiln run <args>` and return stdout, asserting success
    pub fn run_ok(&self, args: &[&str]) -> String {
        let output = self.kiln().arg("run").args(args).output().expect("Failed to run kiln");
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        assert!(
            output.status.success(),
            "kiln run {:?} failed\nstdout:\n{}\nstderr:\n{}",
            args,
            stdout,
            String::from_utf8_lossy(&output.stderr)
        );
        stdout
    }
}
