//! The tree's only mutation surface.
//!
//! Callers take the locks an edit needs through a [`LockListTransaction`]
//! first. Each call verifies those locks are held, applies the edit in memory,
//! stages the matching [`TreeEdit`] and registers the rollback that undoes it
//! if the transaction aborts. A call either applies completely or leaves the
//! tree untouched.
//!
//! Passing `None` for the transaction applies an edit received from
//! replication: nothing is staged or rolled back, paths in the lockdown set are
//! refused, and watchers fire immediately instead of on commit.

use bytes::Bytes;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::change_list::TreeEdit;
use crate::lock_list::{GateHold, LockListTransaction};
use crate::persisted::{PersistedData, PoisonPill, Record};
use crate::tree::NamespaceTree;
use crate::types::{Acl, SessionId, TreeError, TxStamp};
use crate::watch::{PendingNotification, WatchedEvent, WatchedEventType};

/// Mutations that trust the caller's locking.
///
/// Every edit takes the affected node(s), the transaction's [`TxStamp`], the
/// path of the affected node and the owning transaction.
pub trait UnsafeTreeAccess {
    /// Takes the whole-tree lock after waiting for in-flight commits to drain.
    ///
    /// The transaction must not hold node locks.
    fn lock_root(&self, txn: &mut LockListTransaction) -> Result<(), TreeError>;

    /// Takes the whole-tree lock without the drain barrier.
    fn lock_root_no_sync(&self, txn: &mut LockListTransaction) -> Result<(), TreeError>;

    /// Releases the whole-tree lock.
    fn release_root(&self, txn: &mut LockListTransaction) -> Result<(), TreeError>;

    /// Links a newly persisted record at `path` under the parent the path
    /// names. The parent must be locked.
    fn unsafe_create(
        &self,
        node: &Arc<PersistedData>,
        stamp: TxStamp,
        path: &str,
        txn: Option<&mut LockListTransaction>,
    ) -> Result<(), TreeError>;

    /// Inserts `child` into the children of a locked `parent`.
    fn unsafe_add_child(
        &self,
        parent: &Arc<PersistedData>,
        child: &Arc<PersistedData>,
        stamp: TxStamp,
        path: &str,
        txn: Option<&mut LockListTransaction>,
    ) -> Result<(), TreeError>;

    /// Like [`unsafe_add_child`](Self::unsafe_add_child) for a child owned by a
    /// session; the child is indexed for removal when the session ends.
    fn unsafe_add_ephemeral_child(
        &self,
        parent: &Arc<PersistedData>,
        child: &Arc<PersistedData>,
        stamp: TxStamp,
        path: &str,
        txn: Option<&mut LockListTransaction>,
    ) -> Result<(), TreeError>;

    /// Unlinks and deletes a childless `node`, notifying watchers of both nodes.
    fn unsafe_remove(
        &self,
        parent: &Arc<PersistedData>,
        node: &Arc<PersistedData>,
        stamp: TxStamp,
        path: &str,
        txn: Option<&mut LockListTransaction>,
    ) -> Result<(), TreeError>;

    /// Unlinks `node` from `parent` without deleting its record.
    fn unsafe_remove_child(
        &self,
        parent: &Arc<PersistedData>,
        node: &Arc<PersistedData>,
        stamp: TxStamp,
        path: &str,
        txn: Option<&mut LockListTransaction>,
        trigger_watchers: bool,
    ) -> Result<(), TreeError>;

    /// Marks a childless `node` deleted; lookups by path fail afterwards.
    fn unsafe_delete_node(
        &self,
        node: &Arc<PersistedData>,
        stamp: TxStamp,
        path: &str,
        txn: Option<&mut LockListTransaction>,
        trigger_watchers: bool,
    ) -> Result<(), TreeError>;

    /// Replaces the ACL of a locked node.
    fn unsafe_set_acl(
        &self,
        node: &Arc<PersistedData>,
        acl: Vec<Acl>,
        stamp: TxStamp,
        path: &str,
        txn: Option<&mut LockListTransaction>,
    ) -> Result<(), TreeError>;

    /// Replaces the data of a locked node.
    fn unsafe_set_data(
        &self,
        node: &Arc<PersistedData>,
        data: Bytes,
        stamp: TxStamp,
        path: &str,
        txn: Option<&mut LockListTransaction>,
    ) -> Result<(), TreeError>;

    /// Sets a poison pill marker on `node`. Ignored unless poison pills are
    /// allowed by configuration.
    fn unsafe_set_poison_pill(
        &self,
        node: &Arc<PersistedData>,
        spec: &str,
        stamp: TxStamp,
        path: &str,
        txn: Option<&mut LockListTransaction>,
    ) -> Result<(), TreeError>;

    /// Removes every node below the root. Requires the whole-tree lock.
    fn unsafe_clear_tree(&self, txn: &mut LockListTransaction) -> Result<(), TreeError>;
}

impl UnsafeTreeAccess for NamespaceTree {
    fn lock_root(&self, txn: &mut LockListTransaction) -> Result<(), TreeError> {
        self.take_root_lock(txn, true)
    }

    fn lock_root_no_sync(&self, txn: &mut LockListTransaction) -> Result<(), TreeError> {
        self.take_root_lock(txn, false)
    }

    fn release_root(&self, txn: &mut LockListTransaction) -> Result<(), TreeError> {
        if txn.gate_hold() != GateHold::Exclusive {
            return Err(TreeError::InvalidState {
                op: "release root",
                state: "root lock not held".to_string(),
            });
        }
        txn.locking().gate().leave_exclusive()?;
        txn.set_gate_hold(GateHold::None);
        tracing::info!(xid = %txn.xid(), "root lock released");
        Ok(())
    }

    fn unsafe_create(
        &self,
        node: &Arc<PersistedData>,
        stamp: TxStamp,
        path: &str,
        mut txn: Option<&mut LockListTransaction>,
    ) -> Result<(), TreeError> {
        let (parent_path, name) = split_path(path)?;
        if name != node.name() {
            return Err(TreeError::InvalidArgument(format!(
                "record '{}' cannot be created at '{}'",
                node.name(),
                path
            )));
        }
        let parent = self.get_node(parent_path)?;
        self.check_edit(path, stamp, txn.as_deref(), &[&parent])?;
        check_can_link(&parent, node, path)?;

        node.update(|r| {
            r.stat.czxid = stamp.xid;
            r.stat.mzxid = stamp.xid;
            r.stat.pzxid = stamp.xid;
            r.stat.ctime = stamp.txtime;
            r.stat.mtime = stamp.txtime;
            r.stat.version = 0;
            r.stat.cversion = 0;
            r.stat.aversion = 0;
            r.stat.data_length = r.data.len() as i32;
            r.stat.num_children = 0;
        });
        self.link_child(&parent, node, stamp, path, txn.as_deref_mut())?;
        stage(
            txn.as_deref_mut(),
            TreeEdit::Create {
                path: path.to_string(),
                id: node.id(),
                data: node.data(),
                acl: (*node.acl()).clone(),
                ephemeral_owner: node.ephemeral_owner(),
            },
        )?;
        schedule_watchers(node, WatchedEventType::NodeCreated, path, txn.as_deref_mut());
        schedule_watchers(
            &parent,
            WatchedEventType::NodeChildrenChanged,
            parent_path,
            txn,
        );
        Ok(())
    }

    fn unsafe_add_child(
        &self,
        parent: &Arc<PersistedData>,
        child: &Arc<PersistedData>,
        stamp: TxStamp,
        path: &str,
        mut txn: Option<&mut LockListTransaction>,
    ) -> Result<(), TreeError> {
        let (parent_path, name) = split_path(path)?;
        if name != child.name() {
            return Err(TreeError::InvalidArgument(format!(
                "child '{}' cannot be linked at '{}'",
                child.name(),
                path
            )));
        }
        self.check_edit(path, stamp, txn.as_deref(), &[parent])?;
        check_can_link(parent, child, path)?;

        self.link_child(parent, child, stamp, path, txn.as_deref_mut())?;
        stage(
            txn.as_deref_mut(),
            TreeEdit::AddChild {
                parent: parent_path.to_string(),
                name: name.to_string(),
                id: child.id(),
            },
        )?;
        schedule_watchers(
            parent,
            WatchedEventType::NodeChildrenChanged,
            parent_path,
            txn,
        );
        Ok(())
    }

    fn unsafe_add_ephemeral_child(
        &self,
        parent: &Arc<PersistedData>,
        child: &Arc<PersistedData>,
        stamp: TxStamp,
        path: &str,
        txn: Option<&mut LockListTransaction>,
    ) -> Result<(), TreeError> {
        if child.ephemeral_owner().is_none() {
            return Err(TreeError::InvalidArgument(format!(
                "'{}' has no owning session",
                path
            )));
        }
        self.unsafe_add_child(parent, child, stamp, path, txn)
    }

    fn unsafe_remove(
        &self,
        parent: &Arc<PersistedData>,
        node: &Arc<PersistedData>,
        stamp: TxStamp,
        path: &str,
        mut txn: Option<&mut LockListTransaction>,
    ) -> Result<(), TreeError> {
        let (parent_path, _) = split_path(path)?;
        self.check_edit(path, stamp, txn.as_deref(), &[parent, node])?;
        check_is_child(parent, node, path)?;
        check_can_delete(node, path)?;

        self.unsafe_remove_child(parent, node, stamp, path, txn.as_deref_mut(), false)?;
        self.unsafe_delete_node(node, stamp, path, txn.as_deref_mut(), false)?;
        schedule_watchers(node, WatchedEventType::NodeDeleted, path, txn.as_deref_mut());
        schedule_watchers(
            parent,
            WatchedEventType::NodeChildrenChanged,
            parent_path,
            txn,
        );
        Ok(())
    }

    fn unsafe_remove_child(
        &self,
        parent: &Arc<PersistedData>,
        node: &Arc<PersistedData>,
        stamp: TxStamp,
        path: &str,
        mut txn: Option<&mut LockListTransaction>,
        trigger_watchers: bool,
    ) -> Result<(), TreeError> {
        let (parent_path, name) = split_path(path)?;
        self.check_edit(path, stamp, txn.as_deref(), &[parent, node])?;
        check_is_child(parent, node, path)?;

        parent.node().remove_child(node.name());
        node.clear_parent();
        let before = parent.snapshot();
        parent.update(|r| {
            r.stat.cversion += 1;
            r.stat.pzxid = stamp.xid;
            r.stat.num_children -= 1;
        });
        if let Some(owner) = node.ephemeral_owner() {
            unindex_ephemeral(&self.ephemerals, owner, path);
            let index = Arc::clone(&self.ephemerals);
            let path = path.to_string();
            on_abort(txn.as_deref_mut(), move || {
                index_ephemeral(&index, owner, &path)
            });
        }
        {
            let parent = Arc::clone(parent);
            let node = Arc::clone(node);
            on_abort(txn.as_deref_mut(), move || {
                if let Err(e) = parent.node().add_child(node.name(), Arc::clone(&node)) {
                    tracing::error!(error = %e, "rollback could not relink child");
                }
                node.set_parent(&parent);
                parent.restore(before);
            });
        }
        let (nodes, bytes) = subtree_totals(node);
        self.record_delta(-nodes, -bytes, txn.as_deref_mut());

        stage(
            txn.as_deref_mut(),
            TreeEdit::RemoveChild {
                parent: parent_path.to_string(),
                name: name.to_string(),
            },
        )?;
        if trigger_watchers {
            schedule_watchers(
                parent,
                WatchedEventType::NodeChildrenChanged,
                parent_path,
                txn,
            );
        }
        Ok(())
    }

    fn unsafe_delete_node(
        &self,
        node: &Arc<PersistedData>,
        stamp: TxStamp,
        path: &str,
        mut txn: Option<&mut LockListTransaction>,
        trigger_watchers: bool,
    ) -> Result<(), TreeError> {
        self.check_edit(path, stamp, txn.as_deref(), &[node])?;
        check_can_delete(node, path)?;

        node.set_deleted(true);
        {
            let node = Arc::clone(node);
            on_abort(txn.as_deref_mut(), move || node.set_deleted(false));
        }
        {
            let factory = Arc::clone(self.factory());
            let node = Arc::clone(node);
            on_commit(txn.as_deref_mut(), move || factory.delete(&node));
        }
        stage(
            txn.as_deref_mut(),
            TreeEdit::Delete {
                path: path.to_string(),
                id: node.id(),
            },
        )?;
        if trigger_watchers {
            schedule_watchers(node, WatchedEventType::NodeDeleted, path, txn);
        }
        Ok(())
    }

    fn unsafe_set_acl(
        &self,
        node: &Arc<PersistedData>,
        acl: Vec<Acl>,
        stamp: TxStamp,
        path: &str,
        mut txn: Option<&mut LockListTransaction>,
    ) -> Result<(), TreeError> {
        self.check_edit(path, stamp, txn.as_deref(), &[node])?;

        let before = node.snapshot();
        node.update(|r| {
            r.acl = Arc::new(acl.clone());
            r.stat.aversion += 1;
        });
        restore_on_abort(node, before, txn.as_deref_mut());
        stage(
            txn,
            TreeEdit::SetAcl {
                path: path.to_string(),
                acl,
            },
        )
    }

    fn unsafe_set_data(
        &self,
        node: &Arc<PersistedData>,
        data: Bytes,
        stamp: TxStamp,
        path: &str,
        mut txn: Option<&mut LockListTransaction>,
    ) -> Result<(), TreeError> {
        self.check_edit(path, stamp, txn.as_deref(), &[node])?;

        let before = node.snapshot();
        let delta = data.len() as i64 - before.data.len() as i64;
        node.update(|r| {
            r.data = data.clone();
            r.stat.version += 1;
            r.stat.mzxid = stamp.xid;
            r.stat.mtime = stamp.txtime;
            r.stat.data_length = data.len() as i32;
        });
        restore_on_abort(node, before, txn.as_deref_mut());
        if node.parent().is_some() {
            self.record_delta(0, delta, txn.as_deref_mut());
        }
        stage(
            txn.as_deref_mut(),
            TreeEdit::SetData {
                path: path.to_string(),
                data,
            },
        )?;
        schedule_watchers(node, WatchedEventType::NodeDataChanged, path, txn);
        Ok(())
    }

    fn unsafe_set_poison_pill(
        &self,
        node: &Arc<PersistedData>,
        spec: &str,
        stamp: TxStamp,
        path: &str,
        mut txn: Option<&mut LockListTransaction>,
    ) -> Result<(), TreeError> {
        if !self.config().allow_poison_pills {
            tracing::info!(path, spec, xid = %stamp.xid, "poison pills disabled, ignoring");
            return Ok(());
        }
        self.check_edit(path, stamp, txn.as_deref(), &[])?;

        tracing::warn!(path, spec, xid = %stamp.xid, "executing poison pill");
        let previous = node.set_marker(Some(PoisonPill {
            spec: spec.to_string(),
            xid: stamp.xid,
            txtime: stamp.txtime,
        }));
        {
            let node = Arc::clone(node);
            on_abort(txn.as_deref_mut(), move || {
                node.set_marker(previous);
            });
        }
        stage(
            txn,
            TreeEdit::SetPoisonPill {
                path: path.to_string(),
                spec: spec.to_string(),
            },
        )
    }

    fn unsafe_clear_tree(&self, txn: &mut LockListTransaction) -> Result<(), TreeError> {
        if txn.gate_hold() != GateHold::Exclusive {
            return Err(TreeError::InvalidState {
                op: "clear tree",
                state: "root lock not held".to_string(),
            });
        }
        let stamp = txn.stamp();
        let root = Arc::clone(self.root());
        let children = root.node().clear_children();
        let mut removed = Vec::new();
        for child in &children {
            removed.extend(subtree(child));
        }
        let bytes: i64 = removed.iter().map(|n| n.data().len() as i64).sum();
        for node in &removed {
            node.set_deleted(true);
        }
        let before = root.snapshot();
        root.update(|r| {
            r.stat.cversion += 1;
            r.stat.pzxid = stamp.xid;
            r.stat.num_children = 0;
        });
        let sessions: Vec<(SessionId, BTreeSet<String>)> = self
            .ephemerals
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        self.ephemerals.clear();

        {
            let root = Arc::clone(&root);
            let removed = removed.clone();
            let index = Arc::clone(&self.ephemerals);
            txn.run_on_abort(move || {
                for child in children {
                    let name = child.name().to_string();
                    if let Err(e) = root.node().add_child(&name, child) {
                        tracing::error!(error = %e, "rollback could not relink child");
                    }
                }
                for node in &removed {
                    node.set_deleted(false);
                }
                root.restore(before);
                for (owner, paths) in sessions {
                    index.insert(owner, paths);
                }
            });
        }
        {
            let factory = Arc::clone(self.factory());
            let count = removed.len() as i64;
            txn.run_on_commit(move || {
                for node in &removed {
                    factory.delete(node);
                }
                factory.record_stats_delta(-count, -bytes);
            });
        }
        txn.append(TreeEdit::ClearTree)?;
        schedule_watchers(&root, WatchedEventType::NodeChildrenChanged, "/", Some(txn));
        tracing::info!(xid = %stamp.xid, "tree cleared");
        Ok(())
    }
}

impl NamespaceTree {
    fn take_root_lock(&self, txn: &mut LockListTransaction, sync: bool) -> Result<(), TreeError> {
        match txn.gate_hold() {
            GateHold::Exclusive => return Ok(()),
            _ if txn.lock_count() > 0 => {
                return Err(TreeError::InvalidState {
                    op: "lock root",
                    state: format!("{} node locks held", txn.lock_count()),
                })
            }
            GateHold::Shared => {
                txn.locking().gate().leave_shared();
                txn.set_gate_hold(GateHold::None);
            }
            GateHold::None => {}
        }

        let gate = txn.locking().gate();
        gate.enter_exclusive(txn.locking().lock_timeout())?;
        if sync {
            let timeout = self.config().sync_barrier_timeout();
            if !txn.pipeline().drain().wait_timeout(timeout) {
                gate.leave_exclusive()?;
                return Err(TreeError::LockTimeout {
                    what: "commit drain before root lock".to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
        txn.set_gate_hold(GateHold::Exclusive);
        tracing::info!(xid = %txn.xid(), sync, "root lock taken");
        Ok(())
    }

    /// Checks locks, xid and lockdown before an edit touches anything.
    fn check_edit(
        &self,
        path: &str,
        stamp: TxStamp,
        txn: Option<&LockListTransaction>,
        locked: &[&Arc<PersistedData>],
    ) -> Result<(), TreeError> {
        if let Some(txn) = txn {
            txn.validate_lock_list(locked)?;
            if stamp.xid != txn.xid() {
                return Err(TreeError::InvalidArgument(format!(
                    "{} does not belong to transaction {}",
                    stamp.xid,
                    txn.xid()
                )));
            }
        }
        // holding the parent lock does not cover a locked-down child path
        if self.lockdown().contains(path) {
            return Err(TreeError::PathLockedDown(path.to_string()));
        }
        for node in locked {
            node.ensure_writable()?;
        }
        Ok(())
    }

    /// Links `child` under `parent` and registers its rollback.
    fn link_child(
        &self,
        parent: &Arc<PersistedData>,
        child: &Arc<PersistedData>,
        stamp: TxStamp,
        path: &str,
        mut txn: Option<&mut LockListTransaction>,
    ) -> Result<(), TreeError> {
        parent
            .node()
            .add_child(child.name(), Arc::clone(child))
            .map_err(|_| TreeError::NodeExists(path.to_string()))?;
        child.set_parent(parent);
        let before = parent.snapshot();
        parent.update(|r| {
            r.stat.cversion += 1;
            r.stat.pzxid = stamp.xid;
            r.stat.num_children += 1;
        });
        if let Some(owner) = child.ephemeral_owner() {
            index_ephemeral(&self.ephemerals, owner, path);
            let index = Arc::clone(&self.ephemerals);
            let path = path.to_string();
            on_abort(txn.as_deref_mut(), move || {
                unindex_ephemeral(&index, owner, &path)
            });
        }
        {
            let parent = Arc::clone(parent);
            let child = Arc::clone(child);
            on_abort(txn.as_deref_mut(), move || {
                parent.node().remove_child(child.name());
                child.clear_parent();
                parent.restore(before);
            });
        }
        let (nodes, bytes) = subtree_totals(child);
        self.record_delta(nodes, bytes, txn);
        Ok(())
    }

    fn record_delta(&self, nodes: i64, bytes: i64, txn: Option<&mut LockListTransaction>) {
        if nodes == 0 && bytes == 0 {
            return;
        }
        let factory = Arc::clone(self.factory());
        on_commit(txn, move || factory.record_stats_delta(nodes, bytes));
    }
}

/// Splits an absolute child path into its parent path and last segment.
fn split_path(path: &str) -> Result<(&str, &str), TreeError> {
    let invalid = || TreeError::InvalidArgument(format!("'{}' does not name a child node", path));
    if !path.starts_with('/') {
        return Err(invalid());
    }
    let idx = path.rfind('/').ok_or_else(invalid)?;
    let name = &path[idx + 1..];
    if name.is_empty() {
        return Err(invalid());
    }
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    Ok((parent, name))
}

fn check_can_link(
    parent: &PersistedData,
    child: &PersistedData,
    path: &str,
) -> Result<(), TreeError> {
    if parent.ephemeral_owner().is_some() {
        return Err(TreeError::InvalidArgument(format!(
            "ephemeral parent of '{}' cannot have children",
            path
        )));
    }
    if parent.is_deleted() || child.is_deleted() {
        return Err(TreeError::NodeNotFound(path.to_string()));
    }
    if parent.node().child(child.name()).is_some() {
        return Err(TreeError::NodeExists(path.to_string()));
    }
    Ok(())
}

fn check_is_child(
    parent: &PersistedData,
    node: &Arc<PersistedData>,
    path: &str,
) -> Result<(), TreeError> {
    match parent.node().child(node.name()) {
        Some(linked) if Arc::ptr_eq(&linked, node) => Ok(()),
        _ => Err(TreeError::NodeNotFound(path.to_string())),
    }
}

fn check_can_delete(node: &PersistedData, path: &str) -> Result<(), TreeError> {
    if node.node().is_root() {
        return Err(TreeError::InvalidArgument("the root cannot be deleted".to_string()));
    }
    if node.is_deleted() {
        return Err(TreeError::NodeNotFound(path.to_string()));
    }
    if node.node().child_count() > 0 {
        return Err(TreeError::NotEmpty(path.to_string()));
    }
    Ok(())
}

/// `node` and every record below it.
fn subtree(node: &Arc<PersistedData>) -> Vec<Arc<PersistedData>> {
    let mut found = Vec::new();
    let mut stack = vec![Arc::clone(node)];
    while let Some(next) = stack.pop() {
        if let Some(complete) = next.node().complete() {
            stack.extend(complete.children());
        }
        found.push(next);
    }
    found
}

fn subtree_totals(node: &Arc<PersistedData>) -> (i64, i64) {
    let nodes = subtree(node);
    let bytes = nodes.iter().map(|n| n.data().len() as i64).sum();
    (nodes.len() as i64, bytes)
}

fn stage(txn: Option<&mut LockListTransaction>, edit: TreeEdit) -> Result<(), TreeError> {
    match txn {
        Some(txn) => txn.append(edit),
        None => Ok(()),
    }
}

fn on_abort(txn: Option<&mut LockListTransaction>, action: impl FnOnce() + Send + 'static) {
    if let Some(txn) = txn {
        txn.run_on_abort(action);
    }
}

fn on_commit(txn: Option<&mut LockListTransaction>, action: impl FnOnce() + Send + 'static) {
    match txn {
        Some(txn) => txn.run_on_commit(action),
        None => action(),
    }
}

fn restore_on_abort(
    node: &Arc<PersistedData>,
    before: Record,
    txn: Option<&mut LockListTransaction>,
) {
    let node = Arc::clone(node);
    on_abort(txn, move || node.restore(before));
}

/// Takes the watchers `event_type` fires on `node` and delivers the event on
/// commit, or at once for a replicated edit. Abort puts the watchers back.
fn schedule_watchers(
    node: &Arc<PersistedData>,
    event_type: WatchedEventType,
    path: &str,
    txn: Option<&mut LockListTransaction>,
) {
    let watchers = node.node().take_watchers_for_trigger();
    if watchers.is_empty() {
        return;
    }
    let pending = Arc::new(PendingNotification {
        watchers,
        event: WatchedEvent {
            event_type,
            path: path.to_string(),
            data: Some(node.data()),
            stat: Some(node.stat()),
        },
    });
    match txn {
        Some(txn) => {
            let node = Arc::clone(node);
            let restore = Arc::clone(&pending);
            txn.run_on_abort(move || node.node().restore_watchers(&restore.watchers));
            txn.run_on_commit(move || pending.deliver());
        }
        None => pending.deliver(),
    }
}

fn index_ephemeral(index: &DashMap<SessionId, BTreeSet<String>>, owner: SessionId, path: &str) {
    index.entry(owner).or_default().insert(path.to_string());
}

fn unindex_ephemeral(index: &DashMap<SessionId, BTreeSet<String>>, owner: SessionId, path: &str) {
    if let Some(mut paths) = index.get_mut(&owner) {
        paths.remove(path);
    }
    index.remove_if(&owner, |_, paths| paths.is_empty());
}
