use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Instance roots currently provisioned, keyed by instance id.
///
/// Shared between the factory and its instances so that a released or
/// dropped instance can deregister itself.
#[derive(Debug, Default)]
pub(crate) struct LiveSet {
    roots: Mutex<HashMap<String, PathBuf>>,
}

impl LiveSet {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, PathBuf>> {
        self.roots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `root`. Returns false if it equals, contains or lies inside
    /// an already registered root.
    pub(crate) fn insert(&self, id: &str, root: &Path) -> bool {
        let mut roots = self.lock();
        if roots.contains_key(id)
            || roots
                .values()
                .any(|live| live.starts_with(root) || root.starts_with(live))
        {
            return false;
        }
        roots.insert(id.to_string(), root.to_path_buf());
        true
    }

    pub(crate) fn remove(&self, id: &str) -> bool {
        self.lock().remove(id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn snapshot(&self) -> Vec<(String, PathBuf)> {
        self.lock()
            .iter()
            .map(|(id, root)| (id.clone(), root.clone()))
            .collect()
    }
}
