/// Cache artifact archiving and restoration
///
/// Artifacts are tar+zstd archives whose entries are paths relative to the
/// workspace root, so one archive can restore both a package's outputs and
/// its log file.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path};
use tar::{Archive, Builder};
use zstd::{decode_all, encode_all};

use crate::hash::expand_globs;
use crate::workspace::Package;

const ZSTD_LEVEL: i32 = 3;

/// A file stored in an artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedFile {
    /// Workspace-root relative path
    pub path: String,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Output files of a package matched by `globs`, workspace-root relative
pub fn expand_outputs(package: &Package, globs: &[String]) -> Result<Vec<String>> {
    let files = expand_globs(&package.dir, globs)?;
    Ok(files
        .into_iter()
        .map(|f| {
            if package.is_root() {
                f
            } else {
                format!("{}/{}", package.relative_dir, f)
            }
        })
        .collect())
}

/// Archive `files` (relative to `root`) into a tar+zstd file
///
/// Missing files are skipped.
pub fn archive_outputs(root: &Path, files: &[String], archive_path: &Path) -> Result<Vec<ArchivedFile>> {
    let mut tar_data = Vec::new();
    let mut tar = Builder::new(&mut tar_data);
    let mut archived = Vec::new();

    for relative in files {
        let path = root.join(relative);
        if !path.is_file() {
            tracing::debug!(file = %relative, "Skipping missing output file");
            continue;
        }

        let content =
            fs::read(&path).with_context(|| format!("Failed to read output: {}", relative))?;

        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(file_mode(&path));
        header.set_mtime(0);
        header.set_cksum();
        tar.append_data(&mut header, relative, content.as_slice())
            .with_context(|| format!("Failed to archive file: {}", relative))?;

        archived.push(ArchivedFile {
            path: relative.clone(),
            size_bytes: content.len() as u64,
            sha256: hex::encode(Sha256::digest(&content)),
        });
    }

    tar.finish().context("Failed to finalize tar archive")?;
    drop(tar);

    let compressed =
        encode_all(tar_data.as_slice(), ZSTD_LEVEL).context("Failed to compress archive with zstd")?;

    if let Some(parent) = archive_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let mut file = File::create(archive_path)
        .with_context(|| format!("Failed to create archive: {}", archive_path.display()))?;
    file.write_all(&compressed)
        .context("Failed to write compressed archive")?;

    Ok(archived)
}

/// Extract an artifact into `root`, returning the restored paths
///
/// Entries with absolute paths or `..` components are rejected.
pub fn extract_archive(archive_path: &Path, root: &Path) -> Result<Vec<String>> {
    let compressed = fs::read(archive_path)
        .with_context(|| format!("Failed to read archive: {}", archive_path.display()))?;
    extract_bytes(&compressed, root)
}

/// Extract an in-memory artifact into `root`
///
/// Only regular files and directories are restored.
pub fn extract_bytes(compressed: &[u8], root: &Path) -> Result<Vec<String>> {
    let tar_data = decode_all(compressed).context("Failed to decompress archive with zstd")?;

    let mut archive = Archive::new(tar_data.as_slice());
    let mut restored = Vec::new();

    for entry in archive.entries().context("Failed to read archive entries")? {
        let mut entry = entry.context("Failed to read archive entry")?;
        let path = entry.path().context("Invalid path in archive")?.into_owned();

        if path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            anyhow::bail!("Archive entry escapes the workspace: {}", path.display());
        }

        let entry_type = entry.header().entry_type();
        if !entry_type.is_file() && !entry_type.is_dir() {
            anyhow::bail!(
                "Unsupported archive entry type {:?}: {}",
                entry_type,
                path.display()
            );
        }

        let unpacked = entry
            .unpack_in(root)
            .with_context(|| format!("Failed to restore: {}", path.display()))?;
        if !unpacked {
            anyhow::bail!("Archive entry escapes the workspace: {}", path.display());
        }

        restored.push(
            path.components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
        );
    }

    Ok(restored)
}

#[cfg(unix)]
fn file_mode(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.permissions().mode())
        .unwrap_or(0o644)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> u32 {
    0o644
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use tempfile::TempDir;

    #[test]
    fn test_archive_and_extract() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        fs::create_dir_all(root.join("apps/web/dist")).unwrap();
        fs::write(root.join("apps/web/dist/index.js"), "console.log(1)").unwrap();
        fs::create_dir_all(root.join("apps/web/.kiln")).unwrap();
        fs::write(root.join("apps/web/.kiln/kiln-build.log"), "built\n").unwrap();

        let files = vec![
            "apps/web/.kiln/kiln-build.log".to_string(),
            "apps/web/dist/index.js".to_string(),
            "apps/web/dist/missing.js".to_string(),
        ];
        let archive_path = root.join("artifact.tar.zst");

        let archived = archive_outputs(root, &files, &archive_path).unwrap();
        assert_eq!(archived.len(), 2);
        assert_eq!(archived[1].size_bytes, 14);

        fs::remove_dir_all(root.join("apps")).unwrap();

        let restored = extract_archive(&archive_path, root).unwrap();
        assert_eq!(
            restored,
            vec!["apps/web/.kiln/kiln-build.log", "apps/web/dist/index.js"]
        );
        assert_eq!(
            fs::read_to_string(root.join("apps/web/dist/index.js")).unwrap(),
            "console.log(1)"
        );
    }

    #[test]
    fn test_extract_rejects_escaping_paths() {
        let temp = TempDir::new().unwrap();

        let mut tar_data = Vec::new();
        {
            let mut builder = Builder::new(&mut tar_data);
            let mut header = tar::Header::new_gnu();
            let content = b"evil";
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            // set_path refuses `..`, so write the name bytes directly
            let name = b"../escape.txt";
            header.as_old_mut().name[..name.len()].copy_from_slice(name);
            header.set_cksum();
            builder.append(&header, &content[..]).unwrap();
            builder.finish().unwrap();
        }
        let compressed = encode_all(tar_data.as_slice(), ZSTD_LEVEL).unwrap();

        let root = temp.path().join("root");
        fs::create_dir_all(&root).unwrap();
        let result = extract_bytes(&compressed, &root);

        assert!(result.is_err());
        assert!(!temp.path().join("escape.txt").exists());
    }

    #[test]
    fn test_extract_rejects_symlink_entries() {
        let temp = TempDir::new().unwrap();
        let outside = temp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();

        let mut tar_data = Vec::new();
        {
            let mut builder = Builder::new(&mut tar_data);

            let mut link = tar::Header::new_gnu();
            link.set_entry_type(tar::EntryType::Symlink);
            link.set_size(0);
            link.set_mode(0o777);
            link.set_link_name(&outside).unwrap();
            builder.append_data(&mut link, "link", std::io::empty()).unwrap();

            let content = b"evil";
            let mut file = tar::Header::new_gnu();
            file.set_size(content.len() as u64);
            file.set_mode(0o644);
            builder
                .append_data(&mut file, "link/evil.txt", &content[..])
                .unwrap();

            builder.finish().unwrap();
        }
        let compressed = encode_all(tar_data.as_slice(), ZSTD_LEVEL).unwrap();

        let root = temp.path().join("root");
        fs::create_dir_all(&root).unwrap();
        let result = extract_bytes(&compressed, &root);

        assert!(result.is_err());
        assert!(!outside.join("evil.txt").exists());
        assert!(fs::symlink_metadata(root.join("link")).is_err());
    }

    #[test]
    fn test_expand_outputs_root_relative() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("packages/ui");
        fs::create_dir_all(dir.join("dist")).unwrap();
        fs::write(dir.join("dist/ui.js"), "ui").unwrap();

        let package = Package {
            name: "ui".to_string(),
            dir,
            relative_dir: "packages/ui".to_string(),
            scripts: BTreeMap::new(),
            dependencies: BTreeSet::new(),
        };

        let files = expand_outputs(&package, &["dist/**".to_string()]).unwrap();
        assert_eq!(files, vec!["packages/ui/dist/ui.js"]);
    }
}
