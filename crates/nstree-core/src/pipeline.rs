//! Ordered commit pipeline between change lists and the replication layer.
//!
//! Xids are reserved when a transaction starts. Committed batches are parked
//! until every lower xid has been committed or abandoned, then handed to the
//! [`Replicator`] strictly in xid order. The replicator acknowledges each batch
//! through its [`CommitResponder`], which resolves the caller's commit handle.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::change_list::{ChangeListState, CommitReceipt, TreeEdit};
use crate::sync::CompletionEvent;
use crate::types::{TreeError, TxTime, Xid};

/// A committed change list on its way to replication
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReplicatedBatch {
    /// Transaction id
    pub xid: Xid,
    /// Transaction time
    pub txtime: TxTime,
    /// Edits in application order
    pub edits: Vec<TreeEdit>,
}

/// The replication collaborator.
pub trait Replicator: Send + Sync {
    /// Replicates a batch and reports the outcome through `responder`.
    ///
    /// Batches arrive in strictly increasing xid order. Dropping the responder
    /// without completing it reports a replication failure.
    fn replicate(&self, batch: ReplicatedBatch, responder: CommitResponder);
}

/// One-shot acknowledgement channel for a replicated batch.
pub struct CommitResponder {
    xid: Xid,
    txtime: TxTime,
    edit_count: usize,
    tx: Option<oneshot::Sender<Result<CommitReceipt, TreeError>>>,
    signal: Option<Arc<CompletionEvent>>,
    state: Option<Arc<Mutex<ChangeListState>>>,
    pipeline: Weak<CommitPipeline>,
}

impl CommitResponder {
    pub(crate) fn new(
        xid: Xid,
        txtime: TxTime,
        edit_count: usize,
        tx: oneshot::Sender<Result<CommitReceipt, TreeError>>,
        signal: Option<Arc<CompletionEvent>>,
        state: Option<Arc<Mutex<ChangeListState>>>,
    ) -> Self {
        Self {
            xid,
            txtime,
            edit_count,
            tx: Some(tx),
            signal,
            state,
            pipeline: Weak::new(),
        }
    }

    /// Transaction id being acknowledged
    pub fn xid(&self) -> Xid {
        self.xid
    }

    /// Reports the replication outcome.
    pub fn complete(mut self, result: Result<(), TreeError>) {
        self.finish(result);
    }

    fn finish(&mut self, result: Result<(), TreeError>) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        let outcome = result.map(|()| CommitReceipt {
            xid: self.xid,
            txtime: self.txtime,
            edit_count: self.edit_count,
        });
        if let Err(e) = &outcome {
            tracing::warn!(xid = %self.xid, error = %e, "commit not replicated");
        }
        if let Some(state) = self.state.take() {
            *state.lock() = ChangeListState::Committed;
        }
        // the caller may have stopped waiting
        let _ = tx.send(outcome);
        if let Some(signal) = self.signal.take() {
            signal.set();
        }
        if let Some(pipeline) = self.pipeline.upgrade() {
            pipeline.acknowledge();
        }
    }
}

impl Drop for CommitResponder {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.finish(Err(TreeError::ReplicationFailed(format!(
                "{} dropped without acknowledgement",
                self.xid
            ))));
        }
    }
}

impl std::fmt::Debug for CommitResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitResponder")
            .field("xid", &self.xid)
            .field("edit_count", &self.edit_count)
            .finish()
    }
}

enum Parked {
    Batch(ReplicatedBatch, CommitResponder),
    Abandoned,
}

struct PipelineState {
    epoch: u64,
    last_reserved: u64,
    next_release: u64,
    parked: BTreeMap<u64, Parked>,
    in_flight: usize,
    drain_waiters: Vec<Arc<CompletionEvent>>,
}

/// Reserves xids and releases committed batches in xid order.
pub struct CommitPipeline {
    replicator: Arc<dyn Replicator>,
    state: Mutex<PipelineState>,
    release_order: Mutex<()>,
    this: Weak<CommitPipeline>,
}

impl CommitPipeline {
    /// Creates a pipeline whose next reserved xid follows `last_xid`.
    pub fn new(replicator: Arc<dyn Replicator>, last_xid: Xid) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            replicator,
            state: Mutex::new(PipelineState {
                epoch: 0,
                last_reserved: last_xid.as_u64(),
                next_release: last_xid.as_u64() + 1,
                parked: BTreeMap::new(),
                in_flight: 0,
                drain_waiters: Vec::new(),
            }),
            release_order: Mutex::new(()),
            this: this.clone(),
        })
    }

    /// Reserves the next xid.
    pub fn reserve_xid(&self) -> Xid {
        self.reserve().0
    }

    /// Reserves the next xid together with the epoch it belongs to.
    pub(crate) fn reserve(&self) -> (Xid, u64) {
        let mut state = self.state.lock();
        state.last_reserved += 1;
        (Xid::new(state.last_reserved), state.epoch)
    }

    /// Current epoch. It advances on every fence and reset, so a reservation
    /// from an older epoch can no longer commit.
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Highest xid reserved so far
    pub fn last_reserved(&self) -> Xid {
        Xid::new(self.state.lock().last_reserved)
    }

    /// Fails unless `xid` is reserved and neither committed nor abandoned.
    pub fn check_reserved(&self, xid: Xid) -> Result<(), TreeError> {
        outstanding(&self.state.lock(), xid)
    }

    /// Parks a committed batch and releases everything that is now in order.
    ///
    /// A batch whose xid is not an outstanding reservation is refused and its
    /// responder reports the failure.
    pub fn submit(
        &self,
        batch: ReplicatedBatch,
        responder: CommitResponder,
    ) -> Result<(), TreeError> {
        let xid = batch.xid;
        {
            let mut state = self.state.lock();
            if let Err(e) = outstanding(&state, xid) {
                drop(state);
                tracing::error!(%xid, error = %e, "rejecting out-of-order commit");
                drop(responder);
                return Err(e);
            }
            state
                .parked
                .insert(xid.as_u64(), Parked::Batch(batch, responder));
        }
        self.release_ready();
        Ok(())
    }

    /// Gives up a reservation so later xids are not held back.
    pub fn abandon(&self, xid: Xid) {
        {
            let mut state = self.state.lock();
            if let Err(e) = outstanding(&state, xid) {
                drop(state);
                tracing::warn!(%xid, error = %e, "ignoring abandon");
                return;
            }
            state.parked.insert(xid.as_u64(), Parked::Abandoned);
        }
        self.release_ready();
    }

    /// Returns true while `xid` has not yet been released to replication
    pub fn is_pending(&self, xid: Xid) -> bool {
        xid.as_u64() >= self.state.lock().next_release
    }

    fn release_ready(&self) {
        let _order = self.release_order.lock();
        loop {
            let next = {
                let mut state = self.state.lock();
                let key = state.next_release;
                match state.parked.remove(&key) {
                    Some(parked) => {
                        state.next_release += 1;
                        if matches!(parked, Parked::Batch(..)) {
                            state.in_flight += 1;
                        }
                        parked
                    }
                    None => break,
                }
            };
            if let Parked::Batch(batch, mut responder) = next {
                responder.pipeline = self.this.clone();
                self.replicator.replicate(batch, responder);
            }
        }
        self.notify_if_drained();
    }

    fn acknowledge(&self) {
        {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.notify_if_drained();
    }

    fn notify_if_drained(&self) {
        let waiters = {
            let mut state = self.state.lock();
            if state.in_flight > 0 {
                return;
            }
            std::mem::take(&mut state.drain_waiters)
        };
        for waiter in waiters {
            waiter.set();
        }
    }

    /// Returns an event set once every released commit has been acknowledged.
    ///
    /// Batches still parked behind an unreleased xid are not waited for.
    pub fn drain(&self) -> Arc<CompletionEvent> {
        let mut state = self.state.lock();
        if state.in_flight == 0 {
            return Arc::new(CompletionEvent::new_set());
        }
        let event = Arc::new(CompletionEvent::new());
        state.drain_waiters.push(Arc::clone(&event));
        event
    }

    /// Number of batches handed to replication and not yet acknowledged
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Invalidates every outstanding reservation and drops parked batches.
    ///
    /// Later commits or abandons of those xids are refused, and the responders
    /// of dropped batches report a replication failure. Released batches stay
    /// in flight. Used when primary status is lost.
    pub fn fence(&self) {
        self.advance_epoch(None, "fence");
    }

    /// Re-seeds the xid counter after a role change.
    ///
    /// The counter never moves backwards: the next xid follows the higher of
    /// `last_xid` and the last reservation. Outstanding reservations are
    /// invalidated as by [`fence`](Self::fence).
    pub fn reset(&self, last_xid: Xid) {
        self.advance_epoch(Some(last_xid), "reset");
    }

    fn advance_epoch(&self, floor: Option<Xid>, op: &'static str) {
        let (dropped, epoch, last_reserved) = {
            let mut state = self.state.lock();
            if let Some(floor) = floor {
                state.last_reserved = state.last_reserved.max(floor.as_u64());
            }
            state.epoch += 1;
            state.next_release = state.last_reserved + 1;
            (
                std::mem::take(&mut state.parked),
                state.epoch,
                state.last_reserved,
            )
        };
        if !dropped.is_empty() {
            tracing::warn!(op, count = dropped.len(), "dropping parked commits");
        }
        tracing::debug!(op, epoch, last_reserved, "commit pipeline epoch advanced");
        drop(dropped);
        self.notify_if_drained();
    }
}

fn outstanding(state: &PipelineState, xid: Xid) -> Result<(), TreeError> {
    let raw = xid.as_u64();
    if raw < state.next_release || raw > state.last_reserved || state.parked.contains_key(&raw) {
        return Err(TreeError::InvalidArgument(format!(
            "{} is not an outstanding reservation",
            xid
        )));
    }
    Ok(())
}

impl std::fmt::Debug for CommitPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CommitPipeline")
            .field("epoch", &state.epoch)
            .field("last_reserved", &state.last_reserved)
            .field("next_release", &state.next_release)
            .field("parked", &state.parked.len())
            .field("in_flight", &state.in_flight)
            .finish()
    }
}

/// Replicator that acknowledges every batch immediately and keeps a log.
#[derive(Debug, Default)]
pub struct InMemoryReplicator {
    log: Mutex<Vec<ReplicatedBatch>>,
    unavailable: AtomicBool,
    last_xid: AtomicU64,
}

impl InMemoryReplicator {
    /// Creates an empty replicator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following batch fail with a retriable error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Batches replicated so far, in order
    pub fn log(&self) -> Vec<ReplicatedBatch> {
        self.log.lock().clone()
    }

    /// Highest replicated xid
    pub fn last_xid(&self) -> Xid {
        Xid::new(self.last_xid.load(Ordering::Acquire))
    }
}

impl Replicator for InMemoryReplicator {
    fn replicate(&self, batch: ReplicatedBatch, responder: CommitResponder) {
        if self.unavailable.load(Ordering::Acquire) {
            responder.complete(Err(TreeError::ReplicationUnavailable(
                "in-memory replicator disabled".to_string(),
            )));
            return;
        }
        self.last_xid.store(batch.xid.as_u64(), Ordering::Release);
        self.log.lock().push(batch);
        responder.complete(Ok(()));
    }
}

/// A batch together with its acknowledgement channel
pub type PendingBatch = (ReplicatedBatch, CommitResponder);

/// Replicator that forwards batches to an async consumer over a channel.
#[derive(Debug, Clone)]
pub struct ChannelReplicator {
    tx: mpsc::UnboundedSender<PendingBatch>,
}

impl ChannelReplicator {
    /// Creates the replicator and the receiving end the consumer drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PendingBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Spawns a task that acknowledges every batch and returns their xids when
    /// the channel closes.
    pub fn spawn_acknowledger(mut rx: mpsc::UnboundedReceiver<PendingBatch>) -> JoinHandle<Vec<Xid>> {
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some((batch, responder)) = rx.recv().await {
                seen.push(batch.xid);
                responder.complete(Ok(()));
            }
            seen
        })
    }
}

impl Replicator for ChannelReplicator {
    fn replicate(&self, batch: ReplicatedBatch, responder: CommitResponder) {
        if let Err(mpsc::error::SendError((_, responder))) = self.tx.send((batch, responder)) {
            responder.complete(Err(TreeError::ReplicationUnavailable(
                "replication channel closed".to_string(),
            )));
        }
    }
}
