//! Lock-list transactions.
//!
//! A [`LockListTransaction`] records the node locks one logical operation
//! holds, stages its edits in a [`ChangeList`], and on completion either
//! commits them or runs the registered rollback actions. Locks are taken
//! root-first and released in reverse order.

use std::sync::Arc;
use std::time::Duration;

use crate::change_list::{ChangeList, CommitHandle, TreeEdit};
use crate::lock_pool::MultiLevelLockPool;
use crate::lockdown::LockDownSet;
use crate::persisted::PersistedData;
use crate::pipeline::CommitPipeline;
use crate::sync::{CompletionEvent, LockObject, TreeGate};
use crate::types::{TreeError, TxStamp, TxTime, Xid};

/// Lock pool and whole-tree gate shared by every transaction of a tree
#[derive(Debug)]
pub struct LockingContext {
    pool: MultiLevelLockPool,
    gate: TreeGate,
    lockdown: Arc<LockDownSet>,
    lock_timeout: Duration,
}

impl LockingContext {
    /// Creates a context over `pool`, refusing locks on paths in `lockdown`.
    pub fn new(
        pool: MultiLevelLockPool,
        lockdown: Arc<LockDownSet>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            gate: TreeGate::new(),
            lockdown,
            lock_timeout,
        }
    }

    /// The node lock pool
    pub fn pool(&self) -> &MultiLevelLockPool {
        &self.pool
    }

    /// The whole-tree gate
    pub fn gate(&self) -> &TreeGate {
        &self.gate
    }

    /// Paths currently locked down
    pub fn lockdown(&self) -> &Arc<LockDownSet> {
        &self.lockdown
    }

    /// Per-lock acquisition timeout
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }
}

/// How a transaction holds the whole-tree gate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateHold {
    /// Not entered
    None,
    /// Entered shared, alongside other transactions
    Shared,
    /// Root lock held
    Exclusive,
}

type Action = Box<dyn FnOnce() + Send>;

/// Node locks and staged edits of one logical operation.
pub struct LockListTransaction {
    locking: Arc<LockingContext>,
    pipeline: Arc<CommitPipeline>,
    xid: Xid,
    epoch: u64,
    txtime: TxTime,
    held: Vec<(Arc<PersistedData>, Arc<LockObject>)>,
    gate: GateHold,
    change_list: Option<ChangeList>,
    on_commit: Vec<Action>,
    on_abort: Vec<Action>,
    marked_for_abort: bool,
    finish_synchronous: bool,
    sync_timeout: Duration,
    completed: bool,
}

impl LockListTransaction {
    /// Starts a transaction, reserving its xid and fixing its time.
    pub fn new(locking: Arc<LockingContext>, pipeline: Arc<CommitPipeline>) -> Self {
        let (xid, epoch) = pipeline.reserve();
        let sync_timeout = locking.lock_timeout * 4;
        tracing::debug!(%xid, "started transaction");
        Self {
            locking,
            pipeline,
            xid,
            epoch,
            txtime: TxTime::now(),
            held: Vec::new(),
            gate: GateHold::None,
            change_list: None,
            on_commit: Vec::new(),
            on_abort: Vec::new(),
            marked_for_abort: false,
            finish_synchronous: false,
            sync_timeout,
            completed: false,
        }
    }

    /// Transaction id
    pub fn xid(&self) -> Xid {
        self.xid
    }

    /// Returns true while the pipeline still accepts this transaction's xid.
    ///
    /// A role change fences the pipeline and makes every open transaction stale.
    pub fn is_current(&self) -> bool {
        self.pipeline.epoch() == self.epoch
    }

    /// Transaction time
    pub fn txtime(&self) -> TxTime {
        self.txtime
    }

    /// Xid and time to pass to tree edits made under this transaction
    pub fn stamp(&self) -> TxStamp {
        TxStamp::new(self.xid, self.txtime)
    }

    /// How the whole-tree gate is held
    pub fn gate_hold(&self) -> GateHold {
        self.gate
    }

    /// Number of node locks held
    pub fn lock_count(&self) -> usize {
        self.held.len()
    }

    fn ensure_active(&self, op: &'static str) -> Result<(), TreeError> {
        if self.completed {
            return Err(TreeError::InvalidState {
                op,
                state: "completed".to_string(),
            });
        }
        Ok(())
    }

    /// Locks `node`. Re-locking a node already held is a no-op.
    ///
    /// Callers lock parents before children. Locked-down paths are refused.
    pub fn lock_node(&mut self, node: &Arc<PersistedData>) -> Result<(), TreeError> {
        self.ensure_active("lock node")?;
        if self.holds(node) {
            return Ok(());
        }
        if !self.locking.lockdown.is_empty() {
            let path = node.build_path();
            if self.locking.lockdown.contains(&path) {
                return Err(TreeError::PathLockedDown(path));
            }
        }
        if self.gate == GateHold::None {
            self.locking.gate.enter_shared(self.locking.lock_timeout)?;
            self.gate = GateHold::Shared;
        }

        let lock = node.bind_lock(&self.locking.pool)?;
        if let Err(e) = lock.acquire(self.locking.lock_timeout) {
            node.unbind_lock();
            return Err(match e {
                TreeError::LockTimeout { timeout_ms, .. } => TreeError::LockTimeout {
                    what: node.build_path(),
                    timeout_ms,
                },
                other => other,
            });
        }
        if node.is_deleted() {
            lock.release();
            node.unbind_lock();
            return Err(TreeError::NodeNotFound(node.build_path()));
        }
        self.held.push((Arc::clone(node), lock));
        Ok(())
    }

    /// Returns true if this transaction holds the lock of `node`
    pub fn holds(&self, node: &Arc<PersistedData>) -> bool {
        self.held.iter().any(|(n, _)| Arc::ptr_eq(n, node))
    }

    /// Checks that every node in `nodes` is locked by this transaction.
    ///
    /// Holding the root lock covers every node.
    pub fn validate_lock_list(&self, nodes: &[&Arc<PersistedData>]) -> Result<(), TreeError> {
        self.ensure_active("mutate tree")?;
        if self.gate == GateHold::Exclusive {
            return Ok(());
        }
        for node in nodes {
            if !self.holds(node) {
                return Err(TreeError::InvalidArgument(format!(
                    "lock on '{}' not held by {}",
                    node.build_path(),
                    self.xid
                )));
            }
        }
        Ok(())
    }

    /// Stages an edit in the change list.
    pub fn append(&mut self, edit: TreeEdit) -> Result<(), TreeError> {
        self.ensure_active("append edit")?;
        if self.change_list.is_none() {
            let mut list = ChangeList::new(Arc::clone(&self.pipeline));
            list.set_time(self.txtime)?;
            self.change_list = Some(list);
        }
        match self.change_list.as_mut() {
            Some(list) => list.append(edit),
            None => Ok(()),
        }
    }

    /// Staged edits
    pub fn edits(&self) -> &[TreeEdit] {
        self.change_list.as_ref().map(|l| l.edits()).unwrap_or(&[])
    }

    /// Registers an action run after the edits are handed to replication.
    pub fn run_on_commit(&mut self, action: impl FnOnce() + Send + 'static) {
        self.on_commit.push(Box::new(action));
    }

    /// Registers a rollback action; abort runs them in reverse order.
    pub fn run_on_abort(&mut self, action: impl FnOnce() + Send + 'static) {
        self.on_abort.push(Box::new(action));
    }

    /// Makes `complete` abort instead of commit.
    pub fn mark_for_abort(&mut self) {
        self.marked_for_abort = true;
    }

    /// Returns true once `mark_for_abort` was called
    pub fn is_marked_for_abort(&self) -> bool {
        self.marked_for_abort
    }

    /// Makes `complete` wait for replication before returning.
    pub fn set_finish_synchronous(&mut self, synchronous: bool) {
        self.finish_synchronous = synchronous;
    }

    /// Bounds the wait of a synchronous completion.
    pub fn set_sync_timeout(&mut self, timeout: Duration) {
        self.sync_timeout = timeout;
    }

    pub(crate) fn locking(&self) -> &Arc<LockingContext> {
        &self.locking
    }

    pub(crate) fn pipeline(&self) -> &Arc<CommitPipeline> {
        &self.pipeline
    }

    pub(crate) fn set_gate_hold(&mut self, gate: GateHold) {
        self.gate = gate;
    }

    /// Commits the staged edits, or aborts when marked, then releases every lock.
    ///
    /// Returns the commit handle, or `None` when nothing was staged or the
    /// transaction aborted. A transaction that outlived a role change is rolled
    /// back and fails with [`TreeError::NotPrimary`].
    ///
    /// With [`set_finish_synchronous`](Self::set_finish_synchronous) the call
    /// waits up to the sync timeout for replication. The handle is returned
    /// either way; when the wait timed out, `CommitHandle::try_result` yields
    /// `None` until replication answers.
    pub fn complete(mut self) -> Result<Option<CommitHandle>, TreeError> {
        self.ensure_active("complete")?;
        self.completed = true;
        if self.marked_for_abort {
            self.abort_inner();
            self.release_all();
            return Ok(None);
        }
        if !self.is_current() {
            tracing::warn!(xid = %self.xid, "transaction outlived primary status, rolling back");
            self.abort_inner();
            self.release_all();
            return Err(TreeError::NotPrimary);
        }

        let (outcome, signal) = self.commit_inner();
        self.release_all();
        let handle = outcome?;
        if let (Some(signal), Some(handle)) = (signal, handle.as_ref()) {
            if !signal.wait_timeout(self.sync_timeout) {
                tracing::warn!(
                    xid = %handle.xid(),
                    timeout_ms = self.sync_timeout.as_millis() as u64,
                    "synchronous commit not acknowledged in time"
                );
            }
        }
        Ok(handle)
    }

    fn commit_inner(
        &mut self,
    ) -> (
        Result<Option<CommitHandle>, TreeError>,
        Option<Arc<CompletionEvent>>,
    ) {
        let mut list = match self.change_list.take() {
            Some(list) if !list.is_empty() => list,
            _ => {
                self.pipeline.abandon(self.xid);
                self.run_commit_actions();
                return (Ok(None), None);
            }
        };

        let signal = self
            .finish_synchronous
            .then(|| Arc::new(CompletionEvent::new()));
        let result = match &signal {
            Some(s) => list.commit_sync(self.xid, Arc::clone(s)),
            None => list.commit(self.xid),
        };
        match result {
            Ok(handle) => {
                self.on_abort.clear();
                self.run_commit_actions();
                (Ok(Some(handle)), signal)
            }
            Err(e) => {
                tracing::error!(xid = %self.xid, error = %e, "commit rejected, rolling back");
                self.change_list = Some(list);
                self.abort_inner();
                let e = if self.is_current() { e } else { TreeError::NotPrimary };
                (Err(e), None)
            }
        }
    }

    fn run_commit_actions(&mut self) {
        for action in std::mem::take(&mut self.on_commit) {
            action();
        }
    }

    fn abort_inner(&mut self) {
        self.on_commit.clear();
        for action in std::mem::take(&mut self.on_abort).into_iter().rev() {
            action();
        }
        if let Some(mut list) = self.change_list.take() {
            if let Err(e) = list.abort() {
                tracing::debug!(xid = %self.xid, error = %e, "change list already closed");
            }
        }
        if self.pipeline.check_reserved(self.xid).is_ok() {
            self.pipeline.abandon(self.xid);
        }
        tracing::debug!(xid = %self.xid, "aborted transaction");
    }

    fn release_all(&mut self) {
        while let Some((node, lock)) = self.held.pop() {
            lock.release();
            node.unbind_lock();
        }
        match self.gate {
            GateHold::None => {}
            GateHold::Shared => self.locking.gate.leave_shared(),
            GateHold::Exclusive => {
                if let Err(e) = self.locking.gate.leave_exclusive() {
                    tracing::error!(xid = %self.xid, error = %e, "root lock release failed");
                } else {
                    tracing::info!(xid = %self.xid, "root lock released");
                }
            }
        }
        self.gate = GateHold::None;
    }
}

impl Drop for LockListTransaction {
    fn drop(&mut self) {
        if !self.completed {
            self.completed = true;
            self.abort_inner();
            self.release_all();
        }
    }
}

impl std::fmt::Debug for LockListTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockListTransaction")
            .field("xid", &self.xid)
            .field("locks", &self.held.len())
            .field("gate", &self.gate)
            .field("edits", &self.edits().len())
            .field("marked_for_abort", &self.marked_for_abort)
            .finish()
    }
}
