// src/delivery/installed.rs

//! View of the installed module set
//!
//! The backend owns the real set. This view caches it, adds modules the
//! controller saw finish installing, and masks modules acknowledged for
//! deferred uninstall so a later refresh does not bring them back before
//! the backend actually removes them.

use super::ModuleId;
use parking_lot::RwLock;
use std::collections::BTreeSet;

#[derive(Debug, Default)]
struct InstalledInner {
    /// Whether the backend has been queried at least once
    loaded: bool,
    modules: BTreeSet<ModuleId>,
    /// Uninstalled through us, possibly still reported by the backend
    retired: BTreeSet<ModuleId>,
}

/// Cached installed module set
#[derive(Debug, Default)]
pub struct InstalledModules {
    inner: RwLock<InstalledInner>,
}

impl InstalledModules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the backend set has been loaded yet
    pub fn is_loaded(&self) -> bool {
        self.inner.read().loaded
    }

    /// Replace the cache with a backend report
    pub fn refresh(&self, reported: BTreeSet<ModuleId>) {
        let mut inner = self.inner.write();
        // Once the backend stops reporting a retired module it is truly gone
        inner.retired.retain(|id| reported.contains(id));
        let modules: BTreeSet<ModuleId> = reported
            .into_iter()
            .filter(|id| !inner.retired.contains(id))
            .collect();
        inner.modules = modules;
        inner.loaded = true;
    }

    pub fn contains(&self, module_id: &ModuleId) -> bool {
        self.inner.read().modules.contains(module_id)
    }

    /// Record a completed install
    pub fn mark_installed(&self, module_id: &ModuleId) {
        let mut inner = self.inner.write();
        inner.retired.remove(module_id);
        inner.modules.insert(module_id.clone());
    }

    /// Record an acknowledged uninstall
    pub fn mark_uninstalled(&self, module_id: &ModuleId) {
        let mut inner = self.inner.write();
        inner.modules.remove(module_id);
        inner.retired.insert(module_id.clone());
    }

    pub fn snapshot(&self) -> BTreeSet<ModuleId> {
        self.inner.read().modules.clone()
    }
}
