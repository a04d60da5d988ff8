use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Namespace used when a request names no team
pub const DEFAULT_TEAM: &str = "_";

const META_SUFFIX: &str = ".meta";

/// An artifact as stored by the server
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub data: Vec<u8>,
    /// Duration (ms) of the execution that produced the artifact
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ArtifactMeta {
    duration_ms: Option<u64>,
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total_artifacts: u64,
    pub total_bytes: u64,
}

/// Storage backend for the remote cache server
pub trait ArtifactStore: Send + Sync {
    /// Store an artifact, replacing any previous one with the same hash
    fn put(&self, team: &str, hash: &str, data: &[u8], duration_ms: Option<u64>) -> Result<()>;

    fn get(&self, team: &str, hash: &str) -> Result<Option<StoredArtifact>>;

    fn exists(&self, team: &str, hash: &str) -> Result<bool>;

    /// Size of an artifact in bytes
    fn size(&self, team: &str, hash: &str) -> Result<Option<u64>>;

    /// Hashes stored for a team, sorted
    fn list(&self, team: &str) -> Result<Vec<String>>;

    fn stats(&self) -> Result<StoreStats>;
}

/// Filesystem store
///
/// Layout: `<dir>/<team>/<ab>/<hash>` where `ab` is the first two characters
/// of the hash, plus a `<hash>.meta` JSON sidecar.
pub struct FilesystemStore {
    dir: PathBuf,
}

impl FilesystemStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create store directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn artifact_path(&self, team: &str, hash: &str) -> PathBuf {
        let shard = &hash[..hash.len().min(2)];
        self.dir.join(team).join(shard).join(hash)
    }

    fn meta_path(&self, team: &str, hash: &str) -> PathBuf {
        let mut path = self.artifact_path(team, hash).into_os_string();
        path.push(META_SUFFIX);
        PathBuf::from(path)
    }

    /// Write via a temp file in the target directory, then rename into place
    fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Invalid artifact path: {}", path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;

        let mut temp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
        temp.write_all(data).context("Failed to write artifact")?;
        temp.persist(path)
            .with_context(|| format!("Failed to persist artifact: {}", path.display()))?;
        Ok(())
    }
}

impl ArtifactStore for FilesystemStore {
    fn put(&self, team: &str, hash: &str, data: &[u8], duration_ms: Option<u64>) -> Result<()> {
        let meta = serde_json::to_vec(&ArtifactMeta { duration_ms })
            .context("Failed to serialize artifact metadata")?;
        Self::write_atomic(&self.meta_path(team, hash), &meta)?;
        Self::write_atomic(&self.artifact_path(team, hash), data)?;
        Ok(())
    }

    fn get(&self, team: &str, hash: &str) -> Result<Option<StoredArtifact>> {
        let path = self.artifact_path(team, hash);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read artifact: {}", path.display()))
            }
        };

        let meta = fs::read(self.meta_path(team, hash))
            .ok()
            .and_then(|bytes| serde_json::from_slice::<ArtifactMeta>(&bytes).ok())
            .unwrap_or_default();

        Ok(Some(StoredArtifact {
            data,
            duration_ms: meta.duration_ms,
        }))
    }

    fn exists(&self, team: &str, hash: &str) -> Result<bool> {
        Ok(self.artifact_path(team, hash).is_file())
    }

    fn size(&self, team: &str, hash: &str) -> Result<Option<u64>> {
        match fs::metadata(self.artifact_path(team, hash)) {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, team: &str) -> Result<Vec<String>> {
        let team_dir = self.dir.join(team);
        if !team_dir.exists() {
            return Ok(Vec::new());
        }

        let mut hashes = Vec::new();
        for entry in WalkDir::new(&team_dir).min_depth(2).max_depth(2) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.ends_with(META_SUFFIX) || name.starts_with(".tmp") {
                continue;
            }
            hashes.push(name.into_owned());
        }

        hashes.sort();
        Ok(hashes)
    }

    fn stats(&self) -> Result<StoreStats> {
        let mut stats = StoreStats::default();

        for entry in WalkDir::new(&self.dir).min_depth(3).max_depth(3) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.ends_with(META_SUFFIX) || name.starts_with(".tmp") {
                continue;
            }
            stats.total_artifacts += 1;
            stats.total_bytes += entry.metadata()?.len();
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_roundtrip_with_duration() {
        let temp = TempDir::new().unwrap();
        let store = FilesystemStore::new(temp.path()).unwrap();

        store
            .put(DEFAULT_TEAM, "abcdef0123456789", b"artifact", Some(1500))
            .unwrap();

        let artifact = store.get(DEFAULT_TEAM, "abcdef0123456789").unwrap().unwrap();
        assert_eq!(artifact.data, b"artifact");
        assert_eq!(artifact.duration_ms, Some(1500));

        assert!(temp.path().join("_/ab/abcdef0123456789").is_file());
        assert!(store.exists(DEFAULT_TEAM, "abcdef0123456789").unwrap());
        assert_eq!(store.size(DEFAULT_TEAM, "abcdef0123456789").unwrap(), Some(8));
    }

    #[test]
    fn test_missing_artifact() {
        let temp = TempDir::new().unwrap();
        let store = FilesystemStore::new(temp.path()).unwrap();

        assert!(store.get(DEFAULT_TEAM, "ffff").unwrap().is_none());
        assert!(!store.exists(DEFAULT_TEAM, "ffff").unwrap());
        assert_eq!(store.size(DEFAULT_TEAM, "ffff").unwrap(), None);
    }

    #[test]
    fn test_teams_are_isolated() {
        let temp = TempDir::new().unwrap();
        let store = FilesystemStore::new(temp.path()).unwrap();

        store.put("team_a", "aa11", b"a", None).unwrap();
        store.put("team_b", "bb22", b"bb", None).unwrap();

        assert!(store.get("team_a", "bb22").unwrap().is_none());
        assert_eq!(store.list("team_a").unwrap(), vec!["aa11"]);
        assert_eq!(store.list("team_b").unwrap(), vec!["bb22"]);

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_artifacts, 2);
        assert_eq!(stats.total_bytes, 3);
    }
}
