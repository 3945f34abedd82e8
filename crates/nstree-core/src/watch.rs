//! Watch notifications for node changes
//!
//! Watchers are stored on complete nodes. A mutation takes the node's watchers,
//! builds a [`WatchedEvent`] and delivers it when the transaction commits.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::types::Stat;

/// Type of node event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchedEventType {
    /// A node was created.
    NodeCreated,
    /// A node was deleted.
    NodeDeleted,
    /// A node's data was replaced.
    NodeDataChanged,
    /// A child was added to or removed from a node.
    NodeChildrenChanged,
}

/// A notification delivered to a watcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchedEvent {
    /// What happened
    pub event_type: WatchedEventType,
    /// Path of the watched node
    pub path: String,
    /// Node data, present only for watchers that asked for it
    pub data: Option<Bytes>,
    /// Node stat after the change, present only for watchers that asked for data
    pub stat: Option<Stat>,
}

/// A registered observer of node changes.
pub trait Watcher: Send + Sync + std::fmt::Debug {
    /// Unique watcher id; a node keeps at most one watcher per id.
    fn id(&self) -> u64;

    /// Single-use watchers are removed from the node when they fire.
    fn is_single_use(&self) -> bool {
        true
    }

    /// Whether events carry the node's data and stat.
    fn include_data(&self) -> bool {
        false
    }

    /// Delivers an event. Must not block.
    fn process(&self, event: &WatchedEvent);
}

static NEXT_WATCHER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique watcher id.
pub fn next_watcher_id() -> u64 {
    NEXT_WATCHER_ID.fetch_add(1, Ordering::Relaxed)
}

/// A watcher that forwards events into a tokio channel.
#[derive(Debug)]
pub struct ChannelWatcher {
    id: u64,
    single_use: bool,
    include_data: bool,
    tx: mpsc::UnboundedSender<WatchedEvent>,
}

impl ChannelWatcher {
    /// Creates a watcher and the receiver its events arrive on.
    pub fn new(
        single_use: bool,
        include_data: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<WatchedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = Arc::new(Self {
            id: next_watcher_id(),
            single_use,
            include_data,
            tx,
        });
        (watcher, rx)
    }
}

impl Watcher for ChannelWatcher {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_single_use(&self) -> bool {
        self.single_use
    }

    fn include_data(&self) -> bool {
        self.include_data
    }

    fn process(&self, event: &WatchedEvent) {
        if self.tx.send(event.clone()).is_err() {
            tracing::debug!(watcher = self.id, path = %event.path, "watch receiver dropped");
        }
    }
}

/// Event delivery pending the outcome of a transaction
#[derive(Debug)]
pub(crate) struct PendingNotification {
    pub(crate) watchers: Vec<Arc<dyn Watcher>>,
    pub(crate) event: WatchedEvent,
}

impl PendingNotification {
    pub(crate) fn deliver(&self) {
        let bare = WatchedEvent {
            data: None,
            stat: None,
            ..self.event.clone()
        };
        for watcher in &self.watchers {
            if watcher.include_data() {
                watcher.process(&self.event);
            } else {
                watcher.process(&bare);
            }
        }
    }
}
