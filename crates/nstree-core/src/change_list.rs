//! Change lists: the batch of tree edits one transaction hands to replication.
//!
//! Lifecycle: `Open` (edits appended) → `Committing` (handed to the pipeline)
//! → `Committed`, or `Open` → `Aborted`. Committed and aborted lists are
//! terminal; any further commit or abort is rejected.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::pipeline::{CommitPipeline, CommitResponder, ReplicatedBatch};
use crate::sync::CompletionEvent;
use crate::types::{Acl, PersistedId, SessionId, TreeError, TxTime, Xid};

/// One replicated tree edit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeEdit {
    /// A new record was persisted for `path`.
    Create {
        /// Absolute path of the new node
        path: String,
        /// Id assigned to the record
        id: PersistedId,
        /// Initial data
        data: Bytes,
        /// Initial ACL
        acl: Vec<Acl>,
        /// Owning session for ephemeral nodes
        ephemeral_owner: Option<SessionId>,
    },
    /// A record was linked under a parent.
    AddChild {
        /// Parent path
        parent: String,
        /// Child name
        name: String,
        /// Child record id
        id: PersistedId,
    },
    /// A child was unlinked from its parent.
    RemoveChild {
        /// Parent path
        parent: String,
        /// Child name
        name: String,
    },
    /// A record was deleted.
    Delete {
        /// Path the record had
        path: String,
        /// Deleted record id
        id: PersistedId,
    },
    /// Data was replaced.
    SetData {
        /// Node path
        path: String,
        /// New data
        data: Bytes,
    },
    /// ACL was replaced.
    SetAcl {
        /// Node path
        path: String,
        /// New ACL
        acl: Vec<Acl>,
    },
    /// A poison pill marker was set.
    SetPoisonPill {
        /// Node path
        path: String,
        /// Marker specification
        spec: String,
    },
    /// The whole tree was emptied.
    ClearTree,
}

impl TreeEdit {
    /// Path the edit applies to; `"/"` for a tree-wide edit
    pub fn path(&self) -> &str {
        match self {
            TreeEdit::Create { path, .. }
            | TreeEdit::Delete { path, .. }
            | TreeEdit::SetData { path, .. }
            | TreeEdit::SetAcl { path, .. }
            | TreeEdit::SetPoisonPill { path, .. } => path,
            TreeEdit::AddChild { parent, .. } | TreeEdit::RemoveChild { parent, .. } => parent,
            TreeEdit::ClearTree => "/",
        }
    }
}

/// State of a change list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeListState {
    /// Accepting edits.
    Open,
    /// Handed to replication, not yet acknowledged.
    Committing,
    /// Replication finished (successfully or not; see the commit handle).
    Committed,
    /// Discarded before commit.
    Aborted,
}

impl fmt::Display for ChangeListState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeListState::Open => write!(f, "Open"),
            ChangeListState::Committing => write!(f, "Committing"),
            ChangeListState::Committed => write!(f, "Committed"),
            ChangeListState::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Outcome of a successfully replicated commit
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitReceipt {
    /// Transaction id
    pub xid: Xid,
    /// Transaction time
    pub txtime: TxTime,
    /// Number of edits replicated
    pub edit_count: usize,
}

/// Completion handle of an asynchronous commit.
///
/// Replication faults are reported here rather than by `commit` itself.
#[derive(Debug)]
pub struct CommitHandle {
    xid: Xid,
    rx: oneshot::Receiver<Result<CommitReceipt, TreeError>>,
}

impl CommitHandle {
    pub(crate) fn new(xid: Xid, rx: oneshot::Receiver<Result<CommitReceipt, TreeError>>) -> Self {
        Self { xid, rx }
    }

    /// Transaction id of the commit
    pub fn xid(&self) -> Xid {
        self.xid
    }

    /// Waits for replication to finish.
    pub async fn wait(self) -> Result<CommitReceipt, TreeError> {
        self.rx.await.unwrap_or_else(|_| {
            Err(TreeError::ReplicationFailed(
                "commit responder dropped".to_string(),
            ))
        })
    }

    /// Blocks the current thread until replication finishes.
    ///
    /// Must not be called from within an async runtime.
    pub fn wait_blocking(self) -> Result<CommitReceipt, TreeError> {
        self.rx.blocking_recv().unwrap_or_else(|_| {
            Err(TreeError::ReplicationFailed(
                "commit responder dropped".to_string(),
            ))
        })
    }

    /// Returns the outcome if replication already finished.
    pub fn try_result(&mut self) -> Option<Result<CommitReceipt, TreeError>> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(TreeError::ReplicationFailed(
                "commit responder dropped".to_string(),
            ))),
        }
    }
}

/// Ordered batch of pending edits for one transaction
pub struct ChangeList {
    pipeline: Arc<CommitPipeline>,
    edits: Vec<TreeEdit>,
    txtime: Option<TxTime>,
    state: Arc<Mutex<ChangeListState>>,
}

impl ChangeList {
    /// Creates an empty, open change list.
    pub fn new(pipeline: Arc<CommitPipeline>) -> Self {
        Self {
            pipeline,
            edits: Vec::new(),
            txtime: None,
            state: Arc::new(Mutex::new(ChangeListState::Open)),
        }
    }

    /// Current state
    pub fn state(&self) -> ChangeListState {
        *self.state.lock()
    }

    /// Staged edits
    pub fn edits(&self) -> &[TreeEdit] {
        &self.edits
    }

    /// Number of staged edits
    pub fn len(&self) -> usize {
        self.edits.len()
    }

    /// Returns true if nothing was staged
    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Transaction time, once set
    pub fn txtime(&self) -> Option<TxTime> {
        self.txtime
    }

    fn ensure_open(&self, op: &'static str) -> Result<(), TreeError> {
        let state = *self.state.lock();
        if state != ChangeListState::Open {
            return Err(TreeError::InvalidState {
                op,
                state: state.to_string(),
            });
        }
        Ok(())
    }

    /// Stages an edit.
    pub fn append(&mut self, edit: TreeEdit) -> Result<(), TreeError> {
        self.ensure_open("append edit")?;
        self.edits.push(edit);
        Ok(())
    }

    /// Fixes the transaction time. Must be called before commit.
    pub fn set_time(&mut self, txtime: TxTime) -> Result<(), TreeError> {
        self.ensure_open("set time")?;
        self.txtime = Some(txtime);
        Ok(())
    }

    /// Hands the edits to replication and returns immediately.
    pub fn commit(&mut self, xid: Xid) -> Result<CommitHandle, TreeError> {
        self.start_commit(xid, None)
    }

    /// Like [`commit`](Self::commit), and also sets `signal` when replication finishes.
    pub fn commit_sync(
        &mut self,
        xid: Xid,
        signal: Arc<CompletionEvent>,
    ) -> Result<CommitHandle, TreeError> {
        self.start_commit(xid, Some(signal))
    }

    fn start_commit(
        &mut self,
        xid: Xid,
        signal: Option<Arc<CompletionEvent>>,
    ) -> Result<CommitHandle, TreeError> {
        self.ensure_open("commit")?;
        let txtime = self.txtime.ok_or_else(|| {
            TreeError::InvalidArgument("transaction time must be set before commit".to_string())
        })?;
        self.pipeline.check_reserved(xid)?;

        *self.state.lock() = ChangeListState::Committing;
        let edits = std::mem::take(&mut self.edits);
        let (tx, rx) = oneshot::channel();
        let responder = CommitResponder::new(
            xid,
            txtime,
            edits.len(),
            tx,
            signal,
            Some(Arc::clone(&self.state)),
        );
        tracing::debug!(%xid, edits = edits.len(), "committing change list");
        self.pipeline
            .submit(ReplicatedBatch { xid, txtime, edits }, responder)?;
        Ok(CommitHandle::new(xid, rx))
    }

    /// Discards every staged edit. Only valid while open.
    pub fn abort(&mut self) -> Result<(), TreeError> {
        self.ensure_open("abort")?;
        *self.state.lock() = ChangeListState::Aborted;
        let discarded = self.edits.len();
        self.edits.clear();
        tracing::debug!(discarded, "change list aborted");
        Ok(())
    }
}

impl fmt::Debug for ChangeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeList")
            .field("state", &self.state())
            .field("edits", &self.edits.len())
            .field("txtime", &self.txtime)
            .finish()
    }
}
