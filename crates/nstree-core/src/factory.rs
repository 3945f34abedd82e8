//! Persisted-data factory and replica role protocol.
//!
//! The factory is the tree's only channel to the persistence and replication
//! layer. It creates persisted records, tracks totals, and drives role
//! transitions and lockdown requests into the tree through
//! [`PersistedDataFactoryClient`].

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::cluster::{ClusterMember, HealthDefinition};
use crate::lockdown::{LockdownReport, LockdownRequest};
use crate::persisted::PersistedData;
use crate::pipeline::{InMemoryReplicator, Replicator};
use crate::sync::CompletionEvent;
use crate::types::{Acl, PersistedId, SessionId, TreeError, Xid};

/// Role of this replica
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaRole {
    /// Follows the primary; the tree only applies replicated edits.
    Secondary,
    /// Accepts transactions.
    Primary,
}

impl fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaRole::Secondary => write!(f, "secondary"),
            ReplicaRole::Primary => write!(f, "primary"),
        }
    }
}

/// Notifications the factory delivers to the tree.
pub trait PersistedDataFactoryClient: Send + Sync {
    /// This replica just became primary.
    fn on_become_primary(&self);

    /// This replica lost primary status. The returned event is set once
    /// in-flight commits have drained.
    fn on_primary_status_lost(&self) -> Arc<CompletionEvent>;

    /// Guard queried before promotion; `false` blocks promotion.
    fn can_become_primary(&self) -> bool;

    /// Replication asks to stop mutation on the request's paths.
    ///
    /// `replication_is_in_read_only` is in/out: the client sets it when it
    /// cannot isolate the requested paths.
    fn on_paths_lockdown_requested(
        &self,
        request: &LockdownRequest,
        replication_is_in_read_only: &mut bool,
    ) -> LockdownReport;
}

/// The persistence and replication collaborator.
pub trait PersistedDataFactory: Send + Sync {
    /// Factory name, used in logs
    fn name(&self) -> &str;

    /// Creates the root record.
    fn create_root(&self) -> Arc<PersistedData>;

    /// Creates a new detached record.
    fn create_new(
        &self,
        name: &str,
        data: Bytes,
        acl: Arc<Vec<Acl>>,
        ephemeral_owner: Option<SessionId>,
    ) -> Arc<PersistedData>;

    /// Forgets a deleted record.
    fn delete(&self, node: &PersistedData);

    /// Adjusts the node and data totals.
    fn record_stats_delta(&self, nodes: i64, data_bytes: i64);

    /// Number of live nodes
    fn total_nodes(&self) -> u64;

    /// Bytes of node data
    fn total_data(&self) -> u64;

    /// Highest xid known to be replicated
    fn last_xid(&self) -> Xid;

    /// Replicator that receives committed batches
    fn replicator(&self) -> Arc<dyn Replicator>;

    /// Current role of this replica
    fn role(&self) -> ReplicaRole;

    /// Members the replication layer agrees on
    fn get_agreed_members(&self) -> Vec<ClusterMember>;

    /// Health per member id
    fn get_health(&self) -> HashMap<String, HealthDefinition>;

    /// Starts delivering notifications to `client`.
    fn activate(&self, client: Weak<dyn PersistedDataFactoryClient>) -> Result<(), TreeError>;

    /// Stops delivering notifications.
    fn deactivate(&self);
}

/// Single-process factory backed by an [`InMemoryReplicator`].
pub struct InMemoryFactory {
    name: String,
    next_id: AtomicU64,
    total_nodes: AtomicI64,
    total_data: AtomicI64,
    replicator: Arc<InMemoryReplicator>,
    role: RwLock<ReplicaRole>,
    client: RwLock<Option<Weak<dyn PersistedDataFactoryClient>>>,
    members: RwLock<Vec<ClusterMember>>,
}

impl InMemoryFactory {
    /// Creates a secondary factory with no members.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            next_id: AtomicU64::new(PersistedId::ROOT.as_u64() + 1),
            total_nodes: AtomicI64::new(0),
            total_data: AtomicI64::new(0),
            replicator: Arc::new(InMemoryReplicator::new()),
            role: RwLock::new(ReplicaRole::Secondary),
            client: RwLock::new(None),
            members: RwLock::new(Vec::new()),
        }
    }

    /// The replicator and its log
    pub fn in_memory_replicator(&self) -> &Arc<InMemoryReplicator> {
        &self.replicator
    }

    /// Replaces the agreed member list.
    pub fn set_members(&self, members: Vec<ClusterMember>) {
        *self.members.write() = members;
    }

    fn client(&self) -> Result<Arc<dyn PersistedDataFactoryClient>, TreeError> {
        let client = self.client.read().clone();
        client
            .and_then(|c| c.upgrade())
            .ok_or_else(|| TreeError::InvalidState {
                op: "notify client",
                state: "not activated".to_string(),
            })
    }

    /// Promotes this replica. Returns `Ok(false)` when the client's guard
    /// declines.
    pub fn promote(&self) -> Result<bool, TreeError> {
        let client = self.client()?;
        if *self.role.read() == ReplicaRole::Primary {
            return Ok(true);
        }
        if !client.can_become_primary() {
            tracing::info!(factory = %self.name, "promotion declined by client");
            return Ok(false);
        }
        *self.role.write() = ReplicaRole::Primary;
        tracing::info!(factory = %self.name, "became primary");
        client.on_become_primary();
        Ok(true)
    }

    /// Demotes this replica. Returns the client's drain event when it was primary.
    pub fn demote(&self) -> Result<Option<Arc<CompletionEvent>>, TreeError> {
        let client = self.client()?;
        {
            let mut role = self.role.write();
            if *role != ReplicaRole::Primary {
                return Ok(None);
            }
            *role = ReplicaRole::Secondary;
        }
        tracing::info!(factory = %self.name, "lost primary status");
        Ok(Some(client.on_primary_status_lost()))
    }

    /// Forwards a lockdown request; returns the report and the final read-only flag.
    pub fn request_lockdown(
        &self,
        request: &LockdownRequest,
    ) -> Result<(LockdownReport, bool), TreeError> {
        let client = self.client()?;
        let mut read_only = false;
        let report = client.on_paths_lockdown_requested(request, &mut read_only);
        Ok((report, read_only))
    }
}

impl PersistedDataFactory for InMemoryFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_root(&self) -> Arc<PersistedData> {
        Arc::new(PersistedData::new_root(PersistedId::ROOT))
    }

    fn create_new(
        &self,
        name: &str,
        data: Bytes,
        acl: Arc<Vec<Acl>>,
        ephemeral_owner: Option<SessionId>,
    ) -> Arc<PersistedData> {
        let id = PersistedId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        Arc::new(PersistedData::new(id, name, data, acl, ephemeral_owner))
    }

    fn delete(&self, node: &PersistedData) {
        tracing::trace!(id = %node.id(), name = node.name(), "record deleted");
    }

    fn record_stats_delta(&self, nodes: i64, data_bytes: i64) {
        self.total_nodes.fetch_add(nodes, Ordering::Relaxed);
        self.total_data.fetch_add(data_bytes, Ordering::Relaxed);
    }

    fn total_nodes(&self) -> u64 {
        self.total_nodes.load(Ordering::Relaxed).max(0) as u64
    }

    fn total_data(&self) -> u64 {
        self.total_data.load(Ordering::Relaxed).max(0) as u64
    }

    fn last_xid(&self) -> Xid {
        self.replicator.last_xid()
    }

    fn replicator(&self) -> Arc<dyn Replicator> {
        self.replicator.clone()
    }

    fn role(&self) -> ReplicaRole {
        *self.role.read()
    }

    fn get_agreed_members(&self) -> Vec<ClusterMember> {
        self.members.read().clone()
    }

    fn get_health(&self) -> HashMap<String, HealthDefinition> {
        let primary = self.role() == ReplicaRole::Primary;
        self.members
            .read()
            .iter()
            .map(|m| {
                let local = m.member_id == self.name;
                (
                    m.member_id.clone(),
                    HealthDefinition {
                        is_primary: local && primary,
                        health_ratio: 1.0,
                        description: if local {
                            format!("local {}", self.role())
                        } else {
                            "remote".to_string()
                        },
                    },
                )
            })
            .collect()
    }

    fn activate(&self, client: Weak<dyn PersistedDataFactoryClient>) -> Result<(), TreeError> {
        let mut slot = self.client.write();
        if let Some(active) = &*slot {
            if active.upgrade().is_some() {
                return Err(TreeError::InvalidState {
                    op: "activate factory",
                    state: "already active".to_string(),
                });
            }
        }
        *slot = Some(client);
        tracing::info!(factory = %self.name, "factory activated");
        Ok(())
    }

    fn deactivate(&self) {
        self.client.write().take();
        *self.role.write() = ReplicaRole::Secondary;
        tracing::info!(factory = %self.name, "factory deactivated");
    }
}

impl fmt::Debug for InMemoryFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryFactory")
            .field("name", &self.name)
            .field("role", &self.role())
            .field("total_nodes", &self.total_nodes())
            .finish()
    }
}
