#![warn(missing_docs)]

//! nstree core: In-memory replicated namespace tree with pooled node locks, ordered commit and a lockdown protocol

pub mod audit;
pub mod change_list;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod factory;
pub mod lock_list;
pub mod lock_pool;
pub mod lockdown;
pub mod node;
pub mod persisted;
pub mod pipeline;
pub mod sync;
pub mod tree;
pub mod types;
pub mod unsafe_access;
pub mod watch;

pub use audit::{AuditEvent, AuditSink, SessionIdentity, TracingAuditSink};
pub use change_list::{ChangeList, ChangeListState, CommitHandle, CommitReceipt, TreeEdit};
pub use cluster::{ClusterMember, ClusterState, HealthDefinition};
pub use config::{CoreConfig, LockPoolConfig};
pub use connection::{ConnectionString, ConnectionStringBuilder};
pub use factory::{InMemoryFactory, PersistedDataFactory, PersistedDataFactoryClient, ReplicaRole};
pub use lock_list::{GateHold, LockListTransaction, LockingContext};
pub use lock_pool::{MultiLevelLockPool, PooledLock};
pub use lockdown::{LockDownSet, LockdownReport, LockdownRequest};
pub use node::{NodeKind, NodeSlot};
pub use persisted::{PersistedData, PoisonPill};
pub use pipeline::{ChannelReplicator, CommitPipeline, CommitResponder, InMemoryReplicator, Replicator};
pub use sync::{CompletionEvent, LockObject, TreeGate};
pub use tree::NamespaceTree;
pub use types::{Acl, AclScheme, PersistedId, SessionId, Stat, TreeError, TxStamp, TxTime, Xid};
pub use unsafe_access::UnsafeTreeAccess;
pub use watch::{ChannelWatcher, WatchedEvent, WatchedEventType, Watcher};
