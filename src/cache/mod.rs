//! Task output cache
//!
//! `TaskCache` multiplexes a local directory cache and an optional remote
//! cache. Lookups go local first, then remote; a remote hit is written back
//! locally. Remote failures are logged and treated as misses so a flaky
//! remote never fails a run.

pub mod archive;
pub mod local;
pub mod remote;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::hash::hash_file;
use crate::logging::{operations, status};
use crate::pipeline::TaskId;
use archive::{archive_outputs, extract_archive, extract_bytes, ArchivedFile};
use local::{CacheMetadata, LocalCache, ARTIFACT_FILE};
use remote::RemoteCache;

pub use local::CacheStats;

/// Cache layer an entry was served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheSource {
    Local,
    Remote,
}

impl fmt::Display for CacheSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// Which cache layers may be read and written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub read_local: bool,
    pub write_local: bool,
    pub read_remote: bool,
    pub write_remote: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            read_local: true,
            write_local: true,
            read_remote: true,
            write_remote: true,
        }
    }
}

impl CachePolicy {
    /// Derive the policy from run flags
    ///
    /// `force` disables reads, `no_cache` disables writes, `remote_only`
    /// disables the local layer and `remote_read_only` disables remote writes.
    pub fn from_flags(force: bool, no_cache: bool, remote_only: bool, remote_read_only: bool) -> Self {
        Self {
            read_local: !force && !remote_only,
            write_local: !no_cache && !remote_only,
            read_remote: !force,
            write_remote: !no_cache && !remote_read_only,
        }
    }

    pub fn reads(&self) -> bool {
        self.read_local || self.read_remote
    }
}

/// A successful cache lookup
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub source: CacheSource,
    /// Duration of the original execution
    pub duration_ms: u64,
    /// Restored files, workspace-root relative
    pub files: Vec<String>,
}

pub struct TaskCache {
    root: PathBuf,
    local: Option<Arc<LocalCache>>,
    remote: Option<RemoteCache>,
    policy: CachePolicy,
}

impl TaskCache {
    pub fn new(
        root: PathBuf,
        local: Option<LocalCache>,
        remote: Option<RemoteCache>,
        policy: CachePolicy,
    ) -> Self {
        Self {
            root,
            local: local.map(Arc::new),
            remote,
            policy,
        }
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    fn readable_local(&self) -> Option<&Arc<LocalCache>> {
        self.local.as_ref().filter(|_| self.policy.read_local)
    }

    fn readable_remote(&self) -> Option<&RemoteCache> {
        self.remote.as_ref().filter(|_| self.policy.read_remote)
    }

    /// Restore the entry for `hash` into the workspace
    pub async fn fetch(&self, hash: &str, task: &TaskId) -> Result<Option<CacheHit>> {
        if let Some(local) = self.readable_local() {
            if let Some(hit) = self.fetch_local(local, hash, task).await {
                return Ok(Some(hit));
            }
        }

        if let Some(remote) = self.readable_remote() {
            return self.fetch_remote(remote, hash, task).await;
        }

        Ok(None)
    }

    async fn fetch_local(&self, local: &Arc<LocalCache>, hash: &str, task: &TaskId) -> Option<CacheHit> {
        let entry = match local.get(hash) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(operation = operations::FETCH, status = status::MISS, task = %task, hash = %hash, "local cache miss");
                return None;
            }
            Err(e) => {
                warn!(task = %task, hash = %hash, "Failed to read local cache entry: {:#}", e);
                return None;
            }
        };

        let root = self.root.clone();
        let archive_path = entry.archive_path.clone();
        let restored =
            tokio::task::spawn_blocking(move || extract_archive(&archive_path, &root)).await;

        match restored {
            Ok(Ok(files)) => {
                info!(
                    operation = operations::RESTORE,
                    status = status::HIT,
                    source = %CacheSource::Local,
                    task = %task,
                    hash = %hash,
                    "restored from local cache"
                );
                Some(CacheHit {
                    source: CacheSource::Local,
                    duration_ms: entry.metadata.duration_ms,
                    files,
                })
            }
            Ok(Err(e)) => {
                warn!(task = %task, hash = %hash, "Discarding corrupt local cache entry: {:#}", e);
                let _ = local.remove(hash);
                None
            }
            Err(e) => {
                warn!(task = %task, hash = %hash, "Local cache restore panicked: {}", e);
                None
            }
        }
    }

    async fn fetch_remote(&self, remote: &RemoteCache, hash: &str, task: &TaskId) -> Result<Option<CacheHit>> {
        let artifact = match remote.fetch(hash).await {
            Ok(Some(artifact)) => artifact,
            Ok(None) => {
                debug!(operation = operations::FETCH, status = status::MISS, task = %task, hash = %hash, "remote cache miss");
                return Ok(None);
            }
            Err(e) => {
                warn!(task = %task, hash = %hash, "Remote cache unavailable: {}", e);
                return Ok(None);
            }
        };

        let duration_ms = artifact.duration_ms.unwrap_or(0);
        let size_bytes = artifact.bytes.len();
        let write_back = self.local.clone().filter(|_| self.policy.write_local);
        let root = self.root.clone();
        let hash_owned = hash.to_string();
        let task_name = task.to_string();

        let restored = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let files = extract_bytes(&artifact.bytes, &root)?;

            if let Some(local) = write_back {
                let stored = files
                    .iter()
                    .map(|f| describe_file(&root, f))
                    .collect::<Result<Vec<_>>>()
                    .and_then(|archived| {
                        let metadata = CacheMetadata::new(
                            &hash_owned,
                            task_name.clone(),
                            duration_ms,
                            archived,
                            CacheSource::Remote,
                        );
                        local.put_bytes(&hash_owned, &metadata, &artifact.bytes)
                    });
                // Files are already restored at this point
                if let Err(e) = stored {
                    warn!(task = %task_name, hash = %hash_owned, "Failed to write remote hit to local cache: {:#}", e);
                }
            }

            Ok(files)
        })
        .await
        .context("Remote cache restore panicked")?;

        match restored {
            Ok(files) => {
                info!(
                    operation = operations::RESTORE,
                    status = status::HIT,
                    source = %CacheSource::Remote,
                    task = %task,
                    hash = %hash,
                    size_bytes,
                    "restored from remote cache"
                );
                Ok(Some(CacheHit {
                    source: CacheSource::Remote,
                    duration_ms,
                    files,
                }))
            }
            Err(e) => {
                warn!(task = %task, hash = %hash, "Failed to restore remote artifact: {:#}", e);
                Ok(None)
            }
        }
    }

    /// Probe without restoring (dry runs)
    pub async fn exists(&self, hash: &str) -> Option<CacheSource> {
        if let Some(local) = self.readable_local() {
            if local.exists(hash) {
                return Some(CacheSource::Local);
            }
        }

        if let Some(remote) = self.readable_remote() {
            match remote.exists(hash).await {
                Ok(true) => return Some(CacheSource::Remote),
                Ok(false) => {}
                Err(e) => {
                    warn!(operation = operations::EXISTS, hash = %hash, "Remote cache unavailable: {}", e)
                }
            }
        }

        None
    }

    /// Archive `files` once and store the artifact in every writable layer
    pub async fn put(&self, hash: &str, task: &TaskId, files: Vec<String>, duration: Duration) -> Result<()> {
        let local = self.local.clone().filter(|_| self.policy.write_local);
        let remote = self.remote.as_ref().filter(|_| self.policy.write_remote);

        if local.is_none() && remote.is_none() {
            return Ok(());
        }

        let duration_ms = duration.as_millis() as u64;
        let root = self.root.clone();
        let hash_owned = hash.to_string();
        let task_name = task.to_string();

        let artifact = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let staging = tempfile::tempdir().context("Failed to create staging directory")?;
            let archive_path = staging.path().join(ARTIFACT_FILE);
            let archived = archive_outputs(&root, &files, &archive_path)?;

            if let Some(local) = local {
                let metadata = CacheMetadata::new(
                    &hash_owned,
                    task_name,
                    duration_ms,
                    archived,
                    CacheSource::Local,
                );
                local.put(&hash_owned, &metadata, &archive_path)?;
            }

            std::fs::read(&archive_path).context("Failed to read staged archive")
        })
        .await
        .context("Cache archive task panicked")??;

        info!(
            operation = operations::PUT,
            status = status::SUCCESS,
            task = %task,
            hash = %hash,
            size_bytes = artifact.len(),
            "stored in cache"
        );

        if let Some(remote) = remote {
            if let Err(e) = remote.put(hash, artifact, duration_ms).await {
                warn!(operation = operations::PUT, task = %task, hash = %hash, "Failed to upload to remote cache: {}", e);
            }
        }

        Ok(())
    }
}

/// Describe a restored file for metadata
fn describe_file(root: &std::path::Path, relative: &str) -> Result<ArchivedFile> {
    let path = root.join(relative);
    let size_bytes = std::fs::metadata(&path)
        .with_context(|| format!("Failed to stat restored file: {}", relative))?
        .len();
    Ok(ArchivedFile {
        path: relative.to_string(),
        size_bytes,
        sha256: hash_file(&path)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_policy_from_flags() {
        let policy = CachePolicy::from_flags(false, false, false, false);
        assert_eq!(policy, CachePolicy::default());

        let force = CachePolicy::from_flags(true, false, false, false);
        assert!(!force.reads());
        assert!(force.write_local && force.write_remote);

        let no_cache = CachePolicy::from_flags(false, true, false, false);
        assert!(no_cache.reads());
        assert!(!no_cache.write_local && !no_cache.write_remote);

        let remote_only = CachePolicy::from_flags(false, false, true, false);
        assert!(!remote_only.read_local && !remote_only.write_local);
        assert!(remote_only.read_remote && remote_only.write_remote);

        let read_only = CachePolicy::from_flags(false, false, false, true);
        assert!(!read_only.write_remote);
        assert!(read_only.write_local);
    }

    fn workspace() -> TempDir {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("apps/web/dist")).unwrap();
        fs::write(temp.path().join("apps/web/dist/app.js"), "app").unwrap();
        temp
    }

    #[tokio::test]
    async fn test_put_then_fetch_restores_files() {
        let temp = workspace();
        let root = temp.path().to_path_buf();
        let local = LocalCache::new(root.join(".kiln/cache")).unwrap();
        let cache = TaskCache::new(root.clone(), Some(local), None, CachePolicy::default());
        let task = TaskId::new("web", "build");

        assert!(cache.fetch("0123456789abcdef", &task).await.unwrap().is_none());

        cache
            .put(
                "0123456789abcdef",
                &task,
                vec!["apps/web/dist/app.js".to_string()],
                Duration::from_millis(1500),
            )
            .await
            .unwrap();

        fs::remove_dir_all(root.join("apps/web/dist")).unwrap();

        let hit = cache.fetch("0123456789abcdef", &task).await.unwrap().unwrap();
        assert_eq!(hit.source, CacheSource::Local);
        assert_eq!(hit.duration_ms, 1500);
        assert_eq!(hit.files, vec!["apps/web/dist/app.js"]);
        assert_eq!(
            fs::read_to_string(root.join("apps/web/dist/app.js")).unwrap(),
            "app"
        );
        assert_eq!(cache.exists("0123456789abcdef").await, Some(CacheSource::Local));
    }

    #[tokio::test]
    async fn test_force_skips_reads() {
        let temp = workspace();
        let root = temp.path().to_path_buf();
        let task = TaskId::new("web", "build");

        let writer = TaskCache::new(
            root.clone(),
            Some(LocalCache::new(root.join(".kiln/cache")).unwrap()),
            None,
            CachePolicy::default(),
        );
        writer
            .put("aaaa", &task, vec!["apps/web/dist/app.js".to_string()], Duration::ZERO)
            .await
            .unwrap();

        let forced = TaskCache::new(
            root.clone(),
            Some(LocalCache::new(root.join(".kiln/cache")).unwrap()),
            None,
            CachePolicy::from_flags(true, false, false, false),
        );
        assert!(forced.fetch("aaaa", &task).await.unwrap().is_none());
        assert!(forced.exists("aaaa").await.is_none());
    }

    #[tokio::test]
    async fn test_no_cache_skips_writes() {
        let temp = workspace();
        let root = temp.path().to_path_buf();
        let task = TaskId::new("web", "build");
        let local = LocalCache::new(root.join(".kiln/cache")).unwrap();

        let cache = TaskCache::new(
            root.clone(),
            Some(local),
            None,
            CachePolicy::from_flags(false, true, false, false),
        );
        cache
            .put("bbbb", &task, vec!["apps/web/dist/app.js".to_string()], Duration::ZERO)
            .await
            .unwrap();

        let check = LocalCache::new(root.join(".kiln/cache")).unwrap();
        assert!(check.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_hit_survives_failed_local_write_back() {
        use crate::server::store::{ArtifactStore, FilesystemStore};
        use crate::server::{router, serve, ServerConfig};
        use remote::RemoteCacheOptions;

        let temp = workspace();
        let root = temp.path().to_path_buf();
        let task = TaskId::new("web", "build");
        let hash = "0123456789abcdef";

        let artifact_path = root.join("artifact.tar.zst");
        archive_outputs(&root, &["apps/web/dist/app.js".to_string()], &artifact_path).unwrap();
        let artifact = fs::read(&artifact_path).unwrap();

        let store_dir = TempDir::new().unwrap();
        let store = Arc::new(FilesystemStore::new(store_dir.path()).unwrap());
        store.put("_", hash, &artifact, Some(250)).unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(serve(
            listener,
            router(store, ServerConfig::default()),
            std::future::pending(),
        ));

        // A file where the entry directory should go makes the write-back fail
        let cache_dir = root.join(".kiln/cache");
        let local = LocalCache::new(cache_dir.clone()).unwrap();
        fs::write(cache_dir.join(hash), "blocked").unwrap();

        let remote = RemoteCache::new(RemoteCacheOptions {
            url,
            team: None,
            token: None,
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        let policy = CachePolicy {
            read_local: false,
            write_local: true,
            read_remote: true,
            write_remote: false,
        };
        let cache = TaskCache::new(root.clone(), Some(local), Some(remote), policy);

        fs::remove_dir_all(root.join("apps/web/dist")).unwrap();

        let hit = cache.fetch(hash, &task).await.unwrap().unwrap();
        assert_eq!(hit.source, CacheSource::Remote);
        assert_eq!(hit.duration_ms, 250);
        assert_eq!(
            fs::read_to_string(root.join("apps/web/dist/app.js")).unwrap(),
            "app"
        );
    }
}
