//! `package.json` model used for dependency discovery and unit identity.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const PACKAGE_MANIFEST: &str = "package.json";

/// The subset of a package manifest the kernel reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub dev_dependencies: BTreeMap<String, String>,
}

impl PackageManifest {
    /// Parses a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read package manifest {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse package manifest {}", path.display()))
    }

    /// Reads `<dir>/package.json`, falling back to an empty manifest.
    pub fn load_or_default(dir: &Path) -> Self {
        let path = dir.join(PACKAGE_MANIFEST);
        match Self::load(&path) {
            Ok(pkg) => pkg,
            Err(e) => {
                debug!("No usable package manifest in {:?}: {:#}", dir, e);
                Self::default()
            }
        }
    }

    /// Dependency names, dev dependencies first.
    pub fn dependency_names(&self) -> impl Iterator<Item = &str> {
        self.dev_dependencies
            .keys()
            .chain(self.dependencies.keys())
            .map(String::as_str)
    }

    /// The declared main entry, relative to the package root.
    pub fn main_entry(&self) -> &str {
        self.main.as_deref().unwrap_or("index.js")
    }
}

/// Finds the nearest `package.json` at or above `start`.
///
/// `start` may be a file; the search begins at its parent directory.
pub fn find_package_manifest(start: &Path) -> Option<PathBuf> {
    let mut dir = if start.is_dir() {
        Some(start)
    } else {
        start.parent()
    };
    while let Some(current) = dir {
        let candidate = current.join(PACKAGE_MANIFEST);
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = current.parent();
    }
    None
}
