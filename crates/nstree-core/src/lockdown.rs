//! Lockdown protocol types.
//!
//! During an unsafe window (e.g. a leadership race) the replication layer
//! asks the tree to stop mutating a set of paths. The tree marks what it can
//! and reports the rest back so either side can escalate to read-only mode.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Marker spec written on locked-down nodes
pub const LOCKDOWN_SPEC: &str = "lockdown";

/// Thread-safe set of locked-down paths.
pub struct LockDownSet {
    paths: ArcSwap<HashSet<String>>,
    ignore_all: AtomicBool,
}

impl Default for LockDownSet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockDownSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockDownSet")
            .field("paths", &self.paths.load().len())
            .field("ignore_all", &self.ignores_all())
            .finish()
    }
}

impl LockDownSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self {
            paths: ArcSwap::from_pointee(HashSet::new()),
            ignore_all: AtomicBool::new(false),
        }
    }

    /// Atomically replaces the locked-down paths.
    pub fn replace_paths(&self, paths: HashSet<String>) {
        self.paths.store(Arc::new(paths));
    }

    /// Empties the set.
    pub fn clear(&self) {
        self.replace_paths(HashSet::new());
    }

    /// Returns true if `path` is locked down
    pub fn contains(&self, path: &str) -> bool {
        if self.ignore_all.load(Ordering::Acquire) {
            return false;
        }
        self.paths.load().contains(path)
    }

    /// Locked-down paths, sorted
    pub fn paths(&self) -> Vec<String> {
        if self.ignore_all.load(Ordering::Acquire) {
            return Vec::new();
        }
        let mut paths: Vec<String> = self.paths.load().iter().cloned().collect();
        paths.sort();
        paths
    }

    /// Returns true if no path is locked down
    pub fn is_empty(&self) -> bool {
        self.ignore_all.load(Ordering::Acquire) || self.paths.load().is_empty()
    }

    /// When set, the set behaves as empty without forgetting its paths.
    pub fn set_ignore_all(&self, ignore: bool) {
        self.ignore_all.store(ignore, Ordering::Release);
    }

    /// Returns true while the ignore-all switch is on
    pub fn ignores_all(&self) -> bool {
        self.ignore_all.load(Ordering::Acquire)
    }
}

/// A lockdown request from the replication layer
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockdownRequest {
    /// Paths whose mutation must stop
    pub paths_to_lock_down: Vec<String>,
    /// Paths replication already failed to isolate; `None` means total failure
    pub paths_failed: Option<Vec<String>>,
    /// Whether replication avoided the poison pill state
    pub poison_pill_avoided: bool,
}

/// What the tree managed to lock down
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockdownReport {
    /// Paths now locked down, sorted
    pub locked_down: Vec<String>,
    /// Paths the tree could not lock down; `None` when the whole store was locked down
    pub paths_failed: Option<Vec<String>>,
    /// Whether the poison pill state was avoided overall
    pub poison_pill_avoided: bool,
    /// True when the tree fell back to locking down everything
    pub full_lockdown: bool,
}
