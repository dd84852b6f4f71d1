//! Pid to launch request registry.

// ============================================================================
// Imports
// ============================================================================

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::identifiers::{LaunchId, Pid};

// ============================================================================
// ProcessRegistry
// ============================================================================

/// Maps ready worker pids to the launch that owns them.
///
/// A pid is present exactly while its connection is ready.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    entries: FxHashMap<Pid, LaunchId>,
}

impl ProcessRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a ready worker. Returns the previous owner, if any.
    pub fn insert(&mut self, pid: Pid, launch: LaunchId) -> Option<LaunchId> {
        trace!(pid = %pid, launch = %launch, "Registered worker");
        self.entries.insert(pid, launch)
    }

    /// Forgets a worker.
    pub fn remove(&mut self, pid: Pid) -> Option<LaunchId> {
        let removed = self.entries.remove(&pid);
        if removed.is_some() {
            trace!(pid = %pid, "Unregistered worker");
        }
        removed
    }

    /// Returns the launch owning `pid`.
    #[inline]
    #[must_use]
    pub fn get(&self, pid: Pid) -> Option<LaunchId> {
        self.entries.get(&pid).copied()
    }

    /// Returns `true` if `pid` is registered.
    #[inline]
    #[must_use]
    pub fn contains(&self, pid: Pid) -> bool {
        self.entries.contains_key(&pid)
    }

    /// Number of registered workers.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no worker is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_remove() {
        let mut registry = ProcessRegistry::new();
        let pid = Pid::new(100).expect("non-zero");
        let launch = LaunchId::next();

        assert!(registry.insert(pid, launch).is_none());
        assert_eq!(registry.get(pid), Some(launch));
        assert!(registry.contains(pid));
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.remove(pid), Some(launch));
        assert!(registry.remove(pid).is_none());
        assert!(registry.is_empty());
    }
}
