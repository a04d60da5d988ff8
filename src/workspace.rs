/// Workspace package discovery
///
/// Packages are found through the `workspaces` globs of the root
/// `package.json`. Dependencies between packages are the entries of the
/// dependency maps that name another workspace package.
use glob::Pattern;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::pipeline::ROOT_PKG_NAME;

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid package.json at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid workspace glob \"{pattern}\": {source}")]
    InvalidGlob {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    #[error("Package at {} has no name", path.display())]
    MissingName { path: PathBuf },

    #[error("Duplicate package name \"{name}\" at {} and {}", first.display(), second.display())]
    DuplicatePackage {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("No package matches filter \"{0}\"")]
    NoMatch(String),
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PackageJson {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    scripts: BTreeMap<String, String>,
    #[serde(default)]
    dependencies: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    dev_dependencies: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    optional_dependencies: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    peer_dependencies: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    workspaces: Option<WorkspaceGlobs>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WorkspaceGlobs {
    List(Vec<String>),
    Object {
        #[serde(default)]
        packages: Vec<String>,
    },
}

impl WorkspaceGlobs {
    fn patterns(&self) -> &[String] {
        match self {
            Self::List(patterns) => patterns,
            Self::Object { packages } => packages,
        }
    }
}

impl PackageJson {
    fn read(path: &Path) -> Result<Self, WorkspaceError> {
        let content = fs::read_to_string(path).map_err(|source| WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| WorkspaceError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn dependency_names(&self) -> impl Iterator<Item = &String> {
        self.dependencies
            .keys()
            .chain(self.dev_dependencies.keys())
            .chain(self.optional_dependencies.keys())
            .chain(self.peer_dependencies.keys())
    }
}

/// A workspace package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub name: String,
    /// Absolute package directory
    pub dir: PathBuf,
    /// Directory relative to the workspace root, `/`-separated, empty for the root
    pub relative_dir: String,
    pub scripts: BTreeMap<String, String>,
    /// Names of workspace packages this package depends on
    pub dependencies: BTreeSet<String>,
}

impl Package {
    pub fn is_root(&self) -> bool {
        self.name == ROOT_PKG_NAME
    }
}

/// All packages of a workspace
#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    pub packages: BTreeMap<String, Package>,
}

impl Workspace {
    /// Discover packages from the root `package.json`
    pub fn discover(root: &Path) -> Result<Self, WorkspaceError> {
        let root_manifest = PackageJson::read(&root.join("package.json"))?;

        let mut manifests: Vec<(PathBuf, PackageJson)> = Vec::new();
        let patterns = root_manifest
            .workspaces
            .as_ref()
            .map(|w| w.patterns().to_vec())
            .unwrap_or_default();

        for dir in expand_workspace_globs(root, &patterns)? {
            let manifest = PackageJson::read(&dir.join("package.json"))?;
            manifests.push((dir, manifest));
        }

        let mut packages: BTreeMap<String, Package> = BTreeMap::new();
        let mut raw_dependencies: BTreeMap<String, Vec<String>> = BTreeMap::new();

        // The root package is always addressed as "//"
        raw_dependencies.insert(
            ROOT_PKG_NAME.to_string(),
            root_manifest.dependency_names().cloned().collect(),
        );
        packages.insert(
            ROOT_PKG_NAME.to_string(),
            Package {
                name: ROOT_PKG_NAME.to_string(),
                dir: root.to_path_buf(),
                relative_dir: String::new(),
                scripts: root_manifest.scripts.clone(),
                dependencies: BTreeSet::new(),
            },
        );

        for (dir, manifest) in manifests {
            let name = manifest
                .name
                .clone()
                .ok_or_else(|| WorkspaceError::MissingName { path: dir.clone() })?;

            if let Some(existing) = packages.get(&name) {
                return Err(WorkspaceError::DuplicatePackage {
                    name,
                    first: existing.dir.clone(),
                    second: dir,
                });
            }

            raw_dependencies.insert(name.clone(), manifest.dependency_names().cloned().collect());
            packages.insert(
                name.clone(),
                Package {
                    name,
                    relative_dir: relative_path(root, &dir),
                    dir,
                    scripts: manifest.scripts,
                    dependencies: BTreeSet::new(),
                },
            );
        }

        let names: BTreeSet<String> = packages.keys().cloned().collect();
        for (name, deps) in raw_dependencies {
            if let Some(package) = packages.get_mut(&name) {
                package.dependencies = deps
                    .into_iter()
                    .filter(|d| names.contains(d) && *d != name)
                    .collect();
            }
        }

        Ok(Self {
            root: root.to_path_buf(),
            packages,
        })
    }

    pub fn package(&self, name: &str) -> Option<&Package> {
        self.packages.get(name)
    }

    /// Packages that depend on `name` directly
    pub fn direct_dependents(&self, name: &str) -> BTreeSet<String> {
        self.packages
            .values()
            .filter(|p| p.dependencies.contains(name))
            .map(|p| p.name.clone())
            .collect()
    }

    /// `name` plus everything it depends on, transitively
    pub fn with_dependencies(&self, name: &str) -> BTreeSet<String> {
        self.closure(name, |pkg| {
            self.package(pkg)
                .map(|p| p.dependencies.clone())
                .unwrap_or_default()
        })
    }

    /// `name` plus everything that depends on it, transitively
    pub fn with_dependents(&self, name: &str) -> BTreeSet<String> {
        self.closure(name, |pkg| self.direct_dependents(pkg))
    }

    fn closure(&self, start: &str, next: impl Fn(&str) -> BTreeSet<String>) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([start.to_string()]);

        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            queue.extend(next(&name));
        }

        seen
    }

    /// Select packages by filter patterns
    ///
    /// Supported forms: `name`, `@scope/*` (glob), `name...` (with its
    /// dependencies), `...name` (with its dependents), `./dir` (by path), and
    /// `!pattern` (exclusion). No inclusion patterns selects every package,
    /// the root included.
    pub fn filter(&self, patterns: &[String]) -> Result<BTreeSet<String>, WorkspaceError> {
        let (exclusions, inclusions): (Vec<&String>, Vec<&String>) =
            patterns.iter().partition(|p| p.starts_with('!'));

        let mut selected: BTreeSet<String> = if inclusions.is_empty() {
            self.packages.keys().cloned().collect()
        } else {
            let mut selected = BTreeSet::new();
            for pattern in inclusions {
                let matched = self.select(pattern)?;
                if matched.is_empty() {
                    return Err(WorkspaceError::NoMatch(pattern.clone()));
                }
                selected.extend(matched);
            }
            selected
        };

        for pattern in exclusions {
            let excluded = self.select(&pattern[1..])?;
            selected.retain(|name| !excluded.contains(name));
        }

        Ok(selected)
    }

    fn select(&self, pattern: &str) -> Result<BTreeSet<String>, WorkspaceError> {
        let (with_dependents, rest) = match pattern.strip_prefix("...") {
            Some(rest) => (true, rest),
            None => (false, pattern),
        };
        let (with_dependencies, core) = match rest.strip_suffix("...") {
            Some(core) => (true, core),
            None => (false, rest),
        };

        let matched = self.match_core(core)?;

        let mut result = BTreeSet::new();
        for name in matched {
            if with_dependencies {
                result.extend(self.with_dependencies(&name));
            }
            if with_dependents {
                result.extend(self.with_dependents(&name));
            }
            result.insert(name);
        }

        Ok(result)
    }

    fn match_core(&self, core: &str) -> Result<BTreeSet<String>, WorkspaceError> {
        if core.starts_with("./") || core == "." {
            let dir = core.trim_start_matches("./").trim_end_matches('/');
            let dir = if dir == "." { "" } else { dir };
            let pattern = Pattern::new(dir).map_err(|source| WorkspaceError::InvalidGlob {
                pattern: core.to_string(),
                source,
            })?;
            return Ok(self
                .packages
                .values()
                .filter(|p| p.relative_dir == dir || pattern.matches(&p.relative_dir))
                .map(|p| p.name.clone())
                .collect());
        }

        let pattern = Pattern::new(core).map_err(|source| WorkspaceError::InvalidGlob {
            pattern: core.to_string(),
            source,
        })?;

        Ok(self
            .packages
            .keys()
            .filter(|name| name.as_str() == core || pattern.matches(name))
            .cloned()
            .collect())
    }
}

/// Expand workspace globs to package directories (those with a package.json)
fn expand_workspace_globs(root: &Path, patterns: &[String]) -> Result<Vec<PathBuf>, WorkspaceError> {
    let mut dirs = BTreeSet::new();
    let mut excluded = BTreeSet::new();

    for raw in patterns {
        let (negated, pattern) = match raw.strip_prefix('!') {
            Some(p) => (true, p),
            None => (false, raw.as_str()),
        };

        let full_pattern = root.join(pattern.trim_end_matches('/'));
        let full_pattern = full_pattern.to_string_lossy();

        let entries = glob::glob(&full_pattern).map_err(|source| WorkspaceError::InvalidGlob {
            pattern: raw.clone(),
            source,
        })?;

        for entry in entries.flatten() {
            if !entry.is_dir() || !entry.join("package.json").is_file() {
                continue;
            }
            if entry.components().any(|c| c.as_os_str() == "node_modules") {
                continue;
            }
            if negated {
                excluded.insert(entry);
            } else {
                dirs.insert(entry);
            }
        }
    }

    Ok(dirs
        .into_iter()
        .filter(|d| !excluded.contains(d) && d != root)
        .collect())
}

/// Path of `path` relative to `root` with `/` separators
pub fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
