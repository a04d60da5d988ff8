#![cfg(unix)]
/// Acceptance tests for the remote cache
///
/// A kiln remote cache server runs in-process on an ephemeral port; two
/// separate checkouts of the same monorepo share results through it.
mod common;

use common::TestRepo;
use kiln::server::store::{ArtifactStore, FilesystemStore};
use kiln::server::{router, serve, ServerConfig};
use serde_json::json;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;
use tokio::sync::oneshot;

/// In-process remote cache server, stopped on drop
struct TestServer {
    url: String,
    store_dir: TempDir,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    fn start(token: Option<&str>) -> Self {
        let store_dir = TempDir::new().expect("Failed to create store dir");
        let store = Arc::new(FilesystemStore::new(store_dir.path()).unwrap());
        let app = router(
            store,
            ServerConfig {
                token: token.map(str::to_string),
                ..Default::default()
            },
        );

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        let (tx, rx) = oneshot::channel::<()>();
        let handle = thread::spawn(move || {
            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime.block_on(async move {
                let listener = tokio::net::TcpListener::from_std(listener).unwrap();
                serve(listener, app, async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
            });
        });

        Self {
            url,
            store_dir,
            shutdown: Some(tx),
            handle: Some(handle),
        }
    }

    fn artifact_count(&self) -> u64 {
        FilesystemStore::new(self.store_dir.path())
            .unwrap()
            .stats()
            .unwrap()
            .total_artifacts
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn checkout() -> TestRepo {
    let repo = TestRepo::new(json!({
        "pipeline": {
            "build": { "dependsOn": ["^build"], "outputs": ["dist/**"] }
        }
    }));
    repo.package(
        "packages/ui",
        "ui",
        &[("build", "mkdir -p dist && echo ui > dist/ui.js && echo building ui")],
        &[],
    );
    repo.write_file("packages/ui/src/index.js", "export {}");
    repo
}

#[test]
fn test_remote_cache_shared_between_checkouts() {
    let server = TestServer::start(None);

    let first = checkout();
    let output = first.run_ok(&["build", "--api", &server.url]);
    assert!(output.contains("ui:build: cache miss, executing"), "{}", output);
    assert_eq!(server.artifact_count(), 1);

    let second = checkout();
    let dry_run = second.run_ok(&["build", "--api", &server.url, "--dry-run=json"]);
    let summary: serde_json::Value = serde_json::from_str(&dry_run).unwrap();
    assert_eq!(summary["tasks"][0]["cache"], json!({ "hit": "remote" }));

    let output = second.run_ok(&["build", "--api", &server.url]);
    assert!(output.contains("ui:build: cache hit, replaying logs"), "{}", output);
    assert!(output.contains("ui:build: building ui"), "{}", output);
    assert!(output.contains(">>> FULL TURBO"), "{}", output);
    assert_eq!(second.read_file("packages/ui/dist/ui.js").trim(), "ui");

    // The remote hit was written back to the local cache
    let output = second.run_ok(&["build"]);
    assert!(output.contains(">>> FULL TURBO"), "{}", output);
}

#[test]
fn test_remote_only_skips_local_cache() {
    let server = TestServer::start(None);

    let repo = checkout();
    repo.run_ok(&["build", "--api", &server.url, "--remote-only"]);
    assert_eq!(server.artifact_count(), 1);

    let local_entries = std::fs::read_dir(repo.cache_dir())
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(local_entries, 0);

    let output = repo.run_ok(&["build", "--api", &server.url, "--remote-only"]);
    assert!(output.contains(">>> FULL TURBO"), "{}", output);
}

#[test]
fn test_token_protected_server() {
    let server = TestServer::start(Some("secret"));

    // Wrong token: remote errors only warn, the run still succeeds
    let repo = checkout();
    let output = repo.run_ok(&["build", "--api", &server.url, "--token", "wrong"]);
    assert!(output.contains(" Tasks:    1 successful, 1 total"), "{}", output);
    assert_eq!(server.artifact_count(), 0);

    let repo = checkout();
    repo.run_ok(&["build", "--api", &server.url, "--token", "secret"]);
    assert_eq!(server.artifact_count(), 1);
}

#[test]
fn test_unreachable_remote_does_not_fail_run() {
    let repo = checkout();
    let output = repo.run_ok(&["build", "--api", "http://127.0.0.1:1"]);
    assert!(output.contains(" Tasks:    1 successful, 1 total"), "{}", output);

    // Local cache still works
    let output = repo.run_ok(&["build", "--api", "http://127.0.0.1:1"]);
    assert!(output.contains(">>> FULL TURBO"), "{}", output);
}
