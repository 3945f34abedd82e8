//! Cluster membership and health snapshot.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

use crate::factory::PersistedDataFactory;
use crate::types::TxTime;

/// Identity of a cluster member.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterMember {
    /// Unique member identifier.
    pub member_id: String,
    /// Network address of the member.
    pub address: SocketAddr,
}

impl ClusterMember {
    /// Creates a member entry.
    pub fn new(member_id: impl Into<String>, address: SocketAddr) -> Self {
        Self {
            member_id: member_id.into(),
            address,
        }
    }
}

/// Health of one member as reported by the replication layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthDefinition {
    /// Whether the member is the primary.
    pub is_primary: bool,
    /// Fraction of healthy replication links, 0.0 to 1.0.
    pub health_ratio: f64,
    /// Free-form status text.
    pub description: String,
}

/// Read-only snapshot of members and their health
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterState {
    members: Vec<ClusterMember>,
    health: HashMap<String, HealthDefinition>,
    taken_at: TxTime,
}

impl ClusterState {
    /// Builds a snapshot from the factory's agreed members and health.
    pub fn from_factory(factory: &dyn PersistedDataFactory) -> Self {
        Self::new(factory.get_agreed_members(), factory.get_health())
    }

    /// Builds a snapshot from explicit data.
    pub fn new(members: Vec<ClusterMember>, health: HashMap<String, HealthDefinition>) -> Self {
        Self {
            members,
            health,
            taken_at: TxTime::now(),
        }
    }

    /// Agreed members
    pub fn members(&self) -> &[ClusterMember] {
        &self.members
    }

    /// Looks up a member by id.
    pub fn member(&self, member_id: &str) -> Option<&ClusterMember> {
        self.members.iter().find(|m| m.member_id == member_id)
    }

    /// Health of a member, if reported
    pub fn health(&self, member_id: &str) -> Option<&HealthDefinition> {
        self.health.get(member_id)
    }

    /// The member reported as primary, if any.
    pub fn primary(&self) -> Option<&ClusterMember> {
        self.members
            .iter()
            .find(|m| self.health(&m.member_id).map(|h| h.is_primary).unwrap_or(false))
    }

    /// Members whose health ratio is at least `threshold`.
    pub fn healthy_members(&self, threshold: f64) -> Vec<&ClusterMember> {
        self.members
            .iter()
            .filter(|m| {
                self.health(&m.member_id)
                    .map(|h| h.health_ratio >= threshold)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// When the snapshot was taken
    pub fn taken_at(&self) -> TxTime {
        self.taken_at
    }
}
