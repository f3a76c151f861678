//! Module loading seam: maps a resolved unit path to its entry function.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use super::types::PluginEntry;

/// Produces the entry function of the unit stored at `path`.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Arc<dyn PluginEntry>>;
}

/// An in-process module table keyed by resolved path.
#[derive(Default)]
pub struct StaticModules {
    modules: RwLock<HashMap<PathBuf, Arc<dyn PluginEntry>>>,
}

impl StaticModules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the entry served for `path`, replacing any previous one.
    pub fn insert(&self, path: impl Into<PathBuf>, entry: Arc<dyn PluginEntry>) {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.into(), entry);
    }

    pub fn with(self, path: impl Into<PathBuf>, entry: Arc<dyn PluginEntry>) -> Self {
        self.insert(path, entry);
        self
    }

    pub fn len(&self) -> usize {
        self.modules.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ModuleLoader for StaticModules {
    fn load(&self, path: &Path) -> Result<Arc<dyn PluginEntry>> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("no module is registered for {}", path.display()))
    }
}
