/// Input file collection for task hashing
///
/// Files are reported relative to the package directory with `/` separators,
/// sorted, so the resulting hash does not depend on the platform or on walk
/// order.
use anyhow::{Context, Result};
use glob::Pattern;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::pipeline::TaskDefinition;
use crate::workspace::{relative_path, Package};

/// Directories never considered task inputs
const IGNORED_DIRS: &[&str] = &["node_modules", ".git", ".kiln"];

/// Expand globs relative to `base`; `!`-prefixed globs exclude matches
///
/// A glob that matches a directory selects every file below it.
pub fn expand_globs(base: &Path, globs: &[String]) -> Result<Vec<String>> {
    let (exclusions, inclusions): (Vec<&String>, Vec<&String>) =
        globs.iter().partition(|g| g.starts_with('!'));

    let exclusions = exclusions
        .iter()
        .map(|g| compile_pattern(&g[1..]))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();

    let mut files = BTreeSet::new();

    for pattern in inclusions {
        let full_pattern = base.join(pattern.trim_end_matches('/'));
        let full_pattern = full_pattern.to_string_lossy();

        for entry in
            glob::glob(&full_pattern).with_context(|| format!("Invalid glob pattern: {}", pattern))?
        {
            let path =
                entry.with_context(|| format!("Failed to read glob entry for: {}", pattern))?;

            if path.is_dir() {
                for file in WalkDir::new(&path).sort_by_file_name() {
                    let file = file?;
                    if file.file_type().is_file() {
                        files.insert(relative_path(base, file.path()));
                    }
                }
            } else if path.is_file() {
                files.insert(relative_path(base, &path));
            }
        }
    }

    Ok(files
        .into_iter()
        .filter(|f| !exclusions.iter().any(|p| p.matches(f)))
        .collect())
}

/// Files of `package` that feed the hash of a task with `definition`
///
/// Explicit `inputs` globs win. Otherwise every file of the package counts,
/// except ignored directories, directories of `nested_packages` and the
/// task's own outputs.
pub fn collect_package_inputs(
    package: &Package,
    definition: &TaskDefinition,
    nested_packages: &[PathBuf],
) -> Result<Vec<String>> {
    if !definition.inputs.is_empty() {
        return expand_globs(&package.dir, &definition.inputs);
    }

    let outputs = definition
        .outputs
        .iter()
        .filter(|g| !g.starts_with('!'))
        .map(|g| compile_pattern(g))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();

    let mut files = Vec::new();
    let walker = WalkDir::new(&package.dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            !IGNORED_DIRS.contains(&name.as_ref())
                && !nested_packages.iter().any(|p| p == entry.path())
        });

    for entry in walker {
        let entry = entry
            .with_context(|| format!("Failed to walk package {}", package.dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = relative_path(&package.dir, entry.path());
        if outputs.iter().any(|p| p.matches(&relative)) {
            continue;
        }
        files.push(relative);
    }

    Ok(files)
}

/// Compile a glob into patterns matching the path itself or anything below it
///
/// `tsconfig.tsbuildinfo` matches that file; `dist` matches everything under `dist/`.
fn compile_pattern(glob: &str) -> Result<[Pattern; 2]> {
    let glob = glob.trim_end_matches('/');
    let exact = Pattern::new(glob).with_context(|| format!("Invalid glob pattern: {}", glob))?;
    let nested = format!("{}/**", glob);
    let nested =
        Pattern::new(&nested).with_context(|| format!("Invalid glob pattern: {}", nested))?;
    Ok([exact, nested])
}
