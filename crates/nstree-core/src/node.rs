//! In-memory node representation.
//!
//! A node lives inside its owning [`PersistedData`] record as a [`NodeSlot`].
//! The slot holds either nothing (the leaf variant, no children and no
//! watchers) or an `Arc<CompleteNode>` with a children map and a watcher list.
//! Adding a child or watcher to a leaf swaps in a complete node; emptying a
//! complete node swaps it back out. Readers load the slot atomically and never
//! observe a half-linked node. The root slot is always complete.

use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use crate::persisted::PersistedData;
use crate::types::TreeError;
use crate::watch::Watcher;

/// Physical variant currently backing a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeKind {
    /// No children and no watchers
    Leaf,
    /// Has children or watchers
    Complete,
    /// The tree root, always complete
    Root,
}

/// Children map and watcher list of a node that needs them.
#[derive(Default)]
pub struct CompleteNode {
    children: RwLock<BTreeMap<String, Arc<PersistedData>>>,
    watchers: RwLock<Vec<Arc<dyn Watcher>>>,
}

impl CompleteNode {
    /// Looks up a child by name.
    pub fn child(&self, name: &str) -> Option<Arc<PersistedData>> {
        self.children.read().get(name).cloned()
    }

    /// Child names in ordinal order.
    pub fn child_names(&self) -> Vec<String> {
        self.children.read().keys().cloned().collect()
    }

    /// Child records in name order.
    pub fn children(&self) -> Vec<Arc<PersistedData>> {
        self.children.read().values().cloned().collect()
    }

    /// Number of children
    pub fn child_count(&self) -> usize {
        self.children.read().len()
    }

    /// Up to `top` child names ordered after `start`.
    pub fn child_names_after(&self, start: &str, top: usize) -> Vec<String> {
        self.children
            .read()
            .range::<str, _>((Bound::Excluded(start), Bound::Unbounded))
            .take(top)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Ids of registered watchers
    pub fn watcher_ids(&self) -> Vec<u64> {
        self.watchers.read().iter().map(|w| w.id()).collect()
    }

    /// Number of registered watchers
    pub fn watcher_count(&self) -> usize {
        self.watchers.read().len()
    }

    fn is_empty(&self) -> bool {
        self.children.read().is_empty() && self.watchers.read().is_empty()
    }
}

impl std::fmt::Debug for CompleteNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompleteNode")
            .field("children", &self.child_names())
            .field("watchers", &self.watcher_ids())
            .finish()
    }
}

/// The relinkable node slot owned by a persisted record.
pub struct NodeSlot {
    current: ArcSwapOption<CompleteNode>,
    is_root: bool,
    relink: Mutex<()>,
}

impl NodeSlot {
    /// Creates a node, complete when it is the root or children are expected.
    pub fn new(is_root: bool, expect_children: bool) -> Self {
        let current = if is_root || expect_children {
            Some(Arc::new(CompleteNode::default()))
        } else {
            None
        };
        Self {
            current: ArcSwapOption::from(current),
            is_root,
            relink: Mutex::new(()),
        }
    }

    /// Current variant
    pub fn kind(&self) -> NodeKind {
        if self.is_root {
            NodeKind::Root
        } else if self.current.load().is_some() {
            NodeKind::Complete
        } else {
            NodeKind::Leaf
        }
    }

    /// Returns true for the root slot
    pub fn is_root(&self) -> bool {
        self.is_root
    }

    /// Snapshot of the complete variant, if the node has one.
    pub fn complete(&self) -> Option<Arc<CompleteNode>> {
        self.current.load_full()
    }

    /// Looks up a child by name without locking.
    pub fn child(&self, name: &str) -> Option<Arc<PersistedData>> {
        self.loaded().as_deref().and_then(|n| n.child(name))
    }

    /// Child names in ordinal order; empty for a leaf.
    pub fn child_names(&self) -> Vec<String> {
        self.loaded()
            .as_deref()
            .map(|n| n.child_names())
            .unwrap_or_default()
    }

    /// Up to `top` child names after `start` in ordinal order.
    pub fn child_names_after(&self, start: &str, top: usize) -> Vec<String> {
        self.loaded()
            .as_deref()
            .map(|n| n.child_names_after(start, top))
            .unwrap_or_default()
    }

    /// Number of children
    pub fn child_count(&self) -> usize {
        self.loaded().as_deref().map(|n| n.child_count()).unwrap_or(0)
    }

    /// Number of watchers
    pub fn watcher_count(&self) -> usize {
        self.loaded().as_deref().map(|n| n.watcher_count()).unwrap_or(0)
    }

    /// Inserts a child, upgrading a leaf first. The caller must hold the node lock.
    ///
    /// Fails with `NodeExists` and leaves the node untouched when the name is taken.
    pub fn add_child(&self, name: &str, child: Arc<PersistedData>) -> Result<(), TreeError> {
        let guard = self.relink.lock();
        if let Some(node) = self.loaded().as_deref() {
            if node.children.read().contains_key(name) {
                return Err(TreeError::NodeExists(name.to_string()));
            }
        }
        let node = self.upgrade(&guard);
        node.children.write().insert(name.to_string(), child);
        Ok(())
    }

    /// Removes a child, downgrading the node when it becomes empty.
    pub fn remove_child(&self, name: &str) -> Option<Arc<PersistedData>> {
        let guard = self.relink.lock();
        let removed = self
            .loaded()
            .as_deref()
            .and_then(|n| n.children.write().remove(name));
        self.revisit(&guard);
        removed
    }

    /// Removes every child, downgrading the node unless watchers remain.
    pub fn clear_children(&self) -> Vec<Arc<PersistedData>> {
        let guard = self.relink.lock();
        let removed = match self.loaded().as_deref() {
            Some(n) => std::mem::take(&mut *n.children.write())
                .into_values()
                .collect(),
            None => Vec::new(),
        };
        self.revisit(&guard);
        removed
    }

    /// Registers a watcher, upgrading a leaf first. Returns false if a watcher
    /// with the same id is already registered.
    pub fn add_watcher(&self, watcher: Arc<dyn Watcher>) -> bool {
        let guard = self.relink.lock();
        if let Some(node) = self.loaded().as_deref() {
            if node.watchers.read().iter().any(|w| w.id() == watcher.id()) {
                return false;
            }
        }
        let node = self.upgrade(&guard);
        node.watchers.write().push(watcher);
        true
    }

    /// Unregisters a watcher by id, downgrading the node when it becomes empty.
    pub fn remove_watcher(&self, id: u64) -> bool {
        let guard = self.relink.lock();
        let removed = match self.loaded().as_deref() {
            Some(n) => {
                let mut watchers = n.watchers.write();
                let before = watchers.len();
                watchers.retain(|w| w.id() != id);
                before != watchers.len()
            }
            None => false,
        };
        self.revisit(&guard);
        removed
    }

    /// Removes every watcher.
    pub fn clear_watchers(&self) {
        let guard = self.relink.lock();
        if let Some(n) = self.loaded().as_deref() {
            n.watchers.write().clear();
        }
        self.revisit(&guard);
    }

    /// Returns every watcher to notify, removing the single-use ones from the node.
    pub(crate) fn take_watchers_for_trigger(&self) -> Vec<Arc<dyn Watcher>> {
        let guard = self.relink.lock();
        let fired = match self.loaded().as_deref() {
            Some(n) => {
                let mut watchers = n.watchers.write();
                let fired = watchers.clone();
                watchers.retain(|w| !w.is_single_use());
                fired
            }
            None => Vec::new(),
        };
        self.revisit(&guard);
        fired
    }

    /// Puts back single-use watchers taken by an aborted mutation.
    pub(crate) fn restore_watchers(&self, watchers: &[Arc<dyn Watcher>]) {
        for watcher in watchers.iter().filter(|w| w.is_single_use()) {
            self.add_watcher(Arc::clone(watcher));
        }
    }

    fn loaded(&self) -> Option<Arc<CompleteNode>> {
        self.current.load_full()
    }

    fn upgrade(&self, _relink: &MutexGuard<'_, ()>) -> Arc<CompleteNode> {
        if let Some(node) = self.current.load_full() {
            return node;
        }
        let node = Arc::new(CompleteNode::default());
        self.current.store(Some(Arc::clone(&node)));
        node
    }

    fn revisit(&self, _relink: &MutexGuard<'_, ()>) {
        if self.is_root {
            return;
        }
        let empty = self.loaded().as_deref().map(|n| n.is_empty()).unwrap_or(false);
        if empty {
            self.current.store(None);
        }
    }
}

impl std::fmt::Debug for NodeSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSlot")
            .field("kind", &self.kind())
            .field("children", &self.child_count())
            .field("watchers", &self.watcher_count())
            .finish()
    }
}
