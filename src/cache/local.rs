/// Local filesystem cache
///
/// Layout: `<dir>/<hash>/metadata.json` next to `<dir>/<hash>/artifact.tar.zst`.
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::archive::ArchivedFile;
use super::CacheSource;

pub const METADATA_FILE: &str = "metadata.json";
pub const ARTIFACT_FILE: &str = "artifact.tar.zst";

const METADATA_VERSION: u32 = 1;

/// Cache entry metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub version: u32,
    pub hash: String,
    pub task: String,
    pub created_at: DateTime<Utc>,
    /// Duration of the execution that produced the entry
    pub duration_ms: u64,
    pub files: Vec<ArchivedFile>,
    /// Where the entry came from
    pub source: CacheSource,
}

impl CacheMetadata {
    pub fn new(
        hash: impl Into<String>,
        task: impl Into<String>,
        duration_ms: u64,
        files: Vec<ArchivedFile>,
        source: CacheSource,
    ) -> Self {
        Self {
            version: METADATA_VERSION,
            hash: hash.into(),
            task: task.into(),
            created_at: Utc::now(),
            duration_ms,
            files,
            source,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size_bytes).sum()
    }
}

/// Cache entry with metadata and archive path
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub metadata: CacheMetadata,
    pub archive_path: PathBuf,
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    /// Size of the compressed artifacts on disk
    pub artifact_bytes: u64,
    /// Uncompressed size of all cached files
    pub content_bytes: u64,
    pub total_files: usize,
}

pub struct LocalCache {
    dir: PathBuf,
}

impl LocalCache {
    pub fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create cache directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_dir(&self, hash: &str) -> PathBuf {
        self.dir.join(hash)
    }

    /// Get a complete entry; incomplete entries are removed and reported as a miss
    pub fn get(&self, hash: &str) -> Result<Option<CacheEntry>> {
        let entry_dir = self.entry_dir(hash);

        if !entry_dir.exists() {
            return Ok(None);
        }

        let metadata_path = entry_dir.join(METADATA_FILE);
        let archive_path = entry_dir.join(ARTIFACT_FILE);

        if !metadata_path.exists() || !archive_path.exists() {
            tracing::debug!(hash = %hash, "Removing incomplete cache entry");
            let _ = fs::remove_dir_all(&entry_dir);
            return Ok(None);
        }

        let metadata_json = fs::read_to_string(&metadata_path)
            .with_context(|| format!("Failed to read metadata: {}", metadata_path.display()))?;

        let metadata: CacheMetadata = match serde_json::from_str(&metadata_json) {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(hash = %hash, "Discarding cache entry with invalid metadata: {}", e);
                let _ = fs::remove_dir_all(&entry_dir);
                return Ok(None);
            }
        };

        Ok(Some(CacheEntry {
            metadata,
            archive_path,
        }))
    }

    /// Whether a complete entry exists, without reading it
    pub fn exists(&self, hash: &str) -> bool {
        let entry_dir = self.entry_dir(hash);
        entry_dir.join(METADATA_FILE).is_file() && entry_dir.join(ARTIFACT_FILE).is_file()
    }

    /// Store an entry, copying the archive into place
    ///
    /// Metadata is written last so a concurrent reader never sees an entry
    /// without its artifact.
    pub fn put(&self, hash: &str, metadata: &CacheMetadata, archive_path: &Path) -> Result<()> {
        let entry_dir = self.entry_dir(hash);
        fs::create_dir_all(&entry_dir).with_context(|| {
            format!("Failed to create entry directory: {}", entry_dir.display())
        })?;

        let dest_archive = entry_dir.join(ARTIFACT_FILE);
        if archive_path != dest_archive {
            fs::copy(archive_path, &dest_archive).with_context(|| {
                format!("Failed to copy archive to: {}", dest_archive.display())
            })?;
        }

        let metadata_path = entry_dir.join(METADATA_FILE);
        let metadata_json =
            serde_json::to_string_pretty(metadata).context("Failed to serialize metadata")?;
        fs::write(&metadata_path, metadata_json)
            .with_context(|| format!("Failed to write metadata: {}", metadata_path.display()))?;

        Ok(())
    }

    /// Store an entry from in-memory artifact bytes
    pub fn put_bytes(&self, hash: &str, metadata: &CacheMetadata, artifact: &[u8]) -> Result<()> {
        let entry_dir = self.entry_dir(hash);
        fs::create_dir_all(&entry_dir).with_context(|| {
            format!("Failed to create entry directory: {}", entry_dir.display())
        })?;

        let dest_archive = entry_dir.join(ARTIFACT_FILE);
        fs::write(&dest_archive, artifact)
            .with_context(|| format!("Failed to write archive: {}", dest_archive.display()))?;

        self.put(hash, metadata, &dest_archive)
    }

    pub fn remove(&self, hash: &str) -> Result<bool> {
        let entry_dir = self.entry_dir(hash);

        if entry_dir.exists() {
            fs::remove_dir_all(&entry_dir).with_context(|| {
                format!("Failed to remove cache entry: {}", entry_dir.display())
            })?;
            return Ok(true);
        }

        Ok(false)
    }

    /// All complete entries, sorted by hash
    pub fn list(&self) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();

        if !self.dir.exists() {
            return Ok(entries);
        }

        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read cache directory: {}", self.dir.display()))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(hash) = entry.file_name().to_str() {
                if let Some(cache_entry) = self.get(hash)? {
                    entries.push(cache_entry);
                }
            }
        }

        entries.sort_by(|a, b| a.metadata.hash.cmp(&b.metadata.hash));
        Ok(entries)
    }

    pub fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats::default();

        for entry in self.list()? {
            stats.total_entries += 1;
            stats.artifact_bytes += fs::metadata(&entry.archive_path)
                .map(|m| m.len())
                .unwrap_or(0);
            stats.content_bytes += entry.metadata.size_bytes();
            stats.total_files += entry.metadata.files.len();
        }

        Ok(stats)
    }

    /// Remove entries created more than `max_age` ago, returning how many were removed
    pub fn prune(&self, max_age: Duration) -> Result<usize> {
        let max_age = chrono::Duration::from_std(max_age).context("Invalid max age")?;
        let cutoff = Utc::now() - max_age;
        let mut removed = 0;

        for entry in self.list()? {
            if entry.metadata.created_at < cutoff {
                self.remove(&entry.metadata.hash)?;
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "Pruned old cache entries");
        }

        Ok(removed)
    }

    pub fn clean_all(&self) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir).with_context(|| {
                format!("Failed to remove cache directory: {}", self.dir.display())
            })?;
        }
        fs::create_dir_all(&self.dir).with_context(|| {
            format!("Failed to recreate cache directory: {}", self.dir.display())
        })?;
        Ok(())
    }
}
