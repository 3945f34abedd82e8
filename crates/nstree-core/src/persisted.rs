//! Persisted node records.
//!
//! A [`PersistedData`] is the stable identity of a tree entry. It owns the
//! node representation, links to its parent by weak reference, and carries
//! the data, ACL and stat that the persistence collaborator makes durable.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::lock_pool::{MultiLevelLockPool, PooledLock};
use crate::node::{NodeKind, NodeSlot};
use crate::sync::LockObject;
use crate::types::{Acl, PersistedId, SessionId, Stat, TreeError, TxTime, Xid};

/// Recovery-blocking marker set on a node by the lockdown protocol
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoisonPill {
    /// Marker specification, e.g. `"lockdown"`
    pub spec: String,
    /// Transaction that set the marker
    pub xid: Xid,
    /// Time the marker was set
    pub txtime: TxTime,
}

#[derive(Clone, Debug)]
pub(crate) struct Record {
    pub(crate) data: Bytes,
    pub(crate) acl: Arc<Vec<Acl>>,
    pub(crate) stat: Stat,
}

struct LockBinding {
    lock: PooledLock,
    users: usize,
}

/// Durable state of one tree entry plus its in-memory node.
pub struct PersistedData {
    id: PersistedId,
    name: String,
    parent: RwLock<Weak<PersistedData>>,
    record: RwLock<Record>,
    node: NodeSlot,
    ephemeral_owner: Option<SessionId>,
    deleted: AtomicBool,
    marker: RwLock<Option<PoisonPill>>,
    lock_binding: Mutex<Option<LockBinding>>,
}

impl PersistedData {
    /// Creates a detached record whose node starts as a leaf.
    pub fn new(
        id: PersistedId,
        name: &str,
        data: Bytes,
        acl: Arc<Vec<Acl>>,
        ephemeral_owner: Option<SessionId>,
    ) -> Self {
        let stat = Stat {
            data_length: data.len() as i32,
            ..Stat::default()
        };
        Self {
            id,
            name: name.to_string(),
            parent: RwLock::new(Weak::new()),
            record: RwLock::new(Record { data, acl, stat }),
            node: NodeSlot::new(false, false),
            ephemeral_owner,
            deleted: AtomicBool::new(false),
            marker: RwLock::new(None),
            lock_binding: Mutex::new(None),
        }
    }

    /// Creates the root record; its node is always complete.
    pub fn new_root(id: PersistedId) -> Self {
        Self {
            id,
            name: String::new(),
            parent: RwLock::new(Weak::new()),
            record: RwLock::new(Record {
                data: Bytes::new(),
                acl: Arc::new(vec![Acl::world_all()]),
                stat: Stat::default(),
            }),
            node: NodeSlot::new(true, true),
            ephemeral_owner: None,
            deleted: AtomicBool::new(false),
            marker: RwLock::new(None),
            lock_binding: Mutex::new(None),
        }
    }

    /// Record id
    pub fn id(&self) -> PersistedId {
        self.id
    }

    /// Last path segment; empty for the root
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The node representation owned by this record
    pub fn node(&self) -> &NodeSlot {
        &self.node
    }

    /// Current node variant
    pub fn node_kind(&self) -> NodeKind {
        self.node.kind()
    }

    /// Parent record, if still linked
    pub fn parent(&self) -> Option<Arc<PersistedData>> {
        self.parent.read().upgrade()
    }

    pub(crate) fn set_parent(&self, parent: &Arc<PersistedData>) {
        *self.parent.write() = Arc::downgrade(parent);
    }

    pub(crate) fn clear_parent(&self) {
        *self.parent.write() = Weak::new();
    }

    /// Node data
    pub fn data(&self) -> Bytes {
        self.record.read().data.clone()
    }

    /// Node ACL
    pub fn acl(&self) -> Arc<Vec<Acl>> {
        Arc::clone(&self.record.read().acl)
    }

    /// Node stat
    pub fn stat(&self) -> Stat {
        self.record.read().stat
    }

    /// Session owning this node when it is ephemeral
    pub fn ephemeral_owner(&self) -> Option<SessionId> {
        self.ephemeral_owner
    }

    /// Returns true once the record has been deleted
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub(crate) fn set_deleted(&self, deleted: bool) {
        self.deleted.store(deleted, Ordering::Release);
    }

    /// Poison pill marker, if set
    pub fn marker(&self) -> Option<PoisonPill> {
        self.marker.read().clone()
    }

    pub(crate) fn set_marker(&self, marker: Option<PoisonPill>) -> Option<PoisonPill> {
        std::mem::replace(&mut *self.marker.write(), marker)
    }

    pub(crate) fn snapshot(&self) -> Record {
        self.record.read().clone()
    }

    pub(crate) fn restore(&self, record: Record) {
        *self.record.write() = record;
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut Record) -> R) -> R {
        f(&mut self.record.write())
    }

    /// Rebuilds the absolute path by walking parent links.
    pub fn build_path(&self) -> String {
        let mut segments = Vec::new();
        if !self.node.is_root() {
            segments.push(self.name.clone());
        }
        let mut cursor = self.parent();
        while let Some(p) = cursor {
            if p.node.is_root() {
                break;
            }
            segments.push(p.name.clone());
            cursor = p.parent();
        }
        if segments.is_empty() {
            return "/".to_string();
        }
        segments.reverse();
        format!("/{}", segments.join("/"))
    }

    /// Fails with `Poisoned` when a marker is set.
    pub fn ensure_writable(&self) -> Result<(), TreeError> {
        match self.marker() {
            Some(pill) => Err(TreeError::Poisoned {
                path: self.build_path(),
                spec: pill.spec,
            }),
            None => Ok(()),
        }
    }

    /// Binds a pooled lock to this record, or joins the existing binding.
    pub(crate) fn bind_lock(&self, pool: &MultiLevelLockPool) -> Result<Arc<LockObject>, TreeError> {
        let mut binding = self.lock_binding.lock();
        match &mut *binding {
            Some(b) => {
                b.users += 1;
                Ok(Arc::clone(b.lock.object()))
            }
            None => {
                let lock = pool.acquire()?;
                let object = Arc::clone(lock.object());
                *binding = Some(LockBinding { lock, users: 1 });
                Ok(object)
            }
        }
    }

    /// Leaves the binding; the last user returns the lock to the pool.
    pub(crate) fn unbind_lock(&self) {
        let mut binding = self.lock_binding.lock();
        let last = match &mut *binding {
            Some(b) => {
                b.users -= 1;
                b.users == 0
            }
            None => {
                tracing::warn!(id = %self.id, "unbind of a record without a lock binding");
                false
            }
        };
        if last {
            binding.take();
        }
    }

    /// Returns true while a pooled lock is bound to this record
    pub fn has_lock_binding(&self) -> bool {
        self.lock_binding.lock().is_some()
    }
}

impl std::fmt::Debug for PersistedData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistedData")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("node", &self.node)
            .field("deleted", &self.is_deleted())
            .finish()
    }
}
