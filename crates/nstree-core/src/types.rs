use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a persisted node record, stable for the lifetime of the record
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PersistedId(u64);

impl PersistedId {
    /// The id always assigned to the root record
    pub const ROOT: PersistedId = PersistedId(1);

    /// Creates a new PersistedId from a raw u64 value
    pub fn new(id: u64) -> Self {
        PersistedId(id)
    }

    /// Returns the raw u64 value of this id
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PersistedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier, strictly increasing per replica
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Xid(u64);

impl Xid {
    /// The xid of an empty store
    pub const ZERO: Xid = Xid(0);

    /// Creates a new Xid from a raw u64 value
    pub fn new(xid: u64) -> Self {
        Xid(xid)
    }

    /// Returns the raw u64 value of this xid
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xid-{}", self.0)
    }
}

/// Wall-clock transaction time, in milliseconds since the Unix epoch
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxTime(i64);

impl TxTime {
    /// Returns the current wall-clock time
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        TxTime(now)
    }

    /// Creates a TxTime from milliseconds since the Unix epoch
    pub fn from_millis(ms: i64) -> Self {
        TxTime(ms)
    }

    /// Returns milliseconds since the Unix epoch
    pub fn as_millis(&self) -> i64 {
        self.0
    }
}

/// Xid and time of the transaction an edit belongs to
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxStamp {
    /// Transaction id
    pub xid: Xid,
    /// Transaction time
    pub txtime: TxTime,
}

impl TxStamp {
    /// Creates a stamp
    pub fn new(xid: Xid, txtime: TxTime) -> Self {
        Self { xid, txtime }
    }
}

/// Identifier of a client session owning ephemeral nodes
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    /// Creates a new SessionId from a raw u64 value
    pub fn new(id: u64) -> Self {
        SessionId(id)
    }

    /// Returns the raw u64 value of this session id
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Permission bits carried by an ACL entry
pub mod perm {
    /// Read data and list children
    pub const READ: u32 = 1;
    /// Replace data
    pub const WRITE: u32 = 2;
    /// Create children
    pub const CREATE: u32 = 4;
    /// Delete children
    pub const DELETE: u32 = 8;
    /// Replace the ACL
    pub const ADMIN: u32 = 16;
    /// Every permission
    pub const ALL: u32 = READ | WRITE | CREATE | DELETE | ADMIN;
}

/// Identity scheme an ACL entry applies to
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AclScheme {
    /// Anyone
    World,
    /// Any authenticated session
    Authenticated,
    /// Sessions from a given host identity
    Host,
    /// Sessions from a given IP address
    Ip,
    /// Sessions presenting a given digest
    Digest,
}

/// A single access-control entry attached to a node.
///
/// The core stores ACLs verbatim; evaluating them is left to the request layer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Acl {
    /// Granted permission bits (see [`perm`])
    pub perms: u32,
    /// Identity scheme
    pub scheme: AclScheme,
    /// Scheme-specific identifier
    pub identifier: String,
}

impl Acl {
    /// Creates an ACL entry
    pub fn new(perms: u32, scheme: AclScheme, identifier: impl Into<String>) -> Self {
        Self {
            perms,
            scheme,
            identifier: identifier.into(),
        }
    }

    /// The open ACL: every permission for anyone
    pub fn world_all() -> Self {
        Self::new(perm::ALL, AclScheme::World, "anyone")
    }
}

/// Version and transaction metadata of a persisted node
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Xid of the transaction that created the node
    pub czxid: Xid,
    /// Xid of the last transaction that modified the node data
    pub mzxid: Xid,
    /// Xid of the last transaction that modified the children
    pub pzxid: Xid,
    /// Creation time
    pub ctime: TxTime,
    /// Last modification time
    pub mtime: TxTime,
    /// Number of data changes
    pub version: i32,
    /// Number of children changes
    pub cversion: i32,
    /// Number of ACL changes
    pub aversion: i32,
    /// Length of the data in bytes
    pub data_length: i32,
    /// Number of children
    pub num_children: i32,
}

impl Default for Xid {
    fn default() -> Self {
        Xid::ZERO
    }
}

impl Default for TxTime {
    fn default() -> Self {
        TxTime(0)
    }
}

/// Error types for namespace tree operations
#[derive(Debug, thiserror::Error)]
pub enum TreeError {
    /// A caller violated an API contract (malformed path, endpoint, count, missing lock).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No node exists at the given path.
    #[error("node '{0}' not found")]
    NodeNotFound(String),

    /// A node already exists at the given path.
    #[error("node '{0}' already exists")]
    NodeExists(String),

    /// The node still has children and cannot be deleted.
    #[error("node '{0}' has children")]
    NotEmpty(String),

    /// A lock could not be obtained before the timeout expired.
    #[error("lock on {what} not acquired within {timeout_ms} ms")]
    LockTimeout {
        /// What was being locked
        what: String,
        /// Timeout that expired
        timeout_ms: u64,
    },

    /// Every level of the lock pool is exhausted and no overflow level is configured.
    #[error("lock pool exhausted across {levels} levels")]
    PoolExhausted {
        /// Number of configured levels
        levels: usize,
    },

    /// The replication layer is temporarily unable to accept writes.
    #[error("replication unavailable: {0}")]
    ReplicationUnavailable(String),

    /// The replication layer rejected or lost a commit.
    #[error("replication failed: {0}")]
    ReplicationFailed(String),

    /// The object was used after being disposed.
    #[error("{0} used after disposal")]
    Disposed(&'static str),

    /// An operation is not valid in the current lifecycle state.
    #[error("cannot {op} in state {state}")]
    InvalidState {
        /// Operation attempted
        op: &'static str,
        /// State the object was in
        state: String,
    },

    /// This replica is not the primary.
    #[error("replica is not primary")]
    NotPrimary,

    /// The store has been forced read-only.
    #[error("store is read-only")]
    ReadOnly,

    /// The path is locked down by the replication layer.
    #[error("path '{0}' is locked down")]
    PathLockedDown(String),

    /// The node carries a poison pill marker and refuses mutation.
    #[error("node '{path}' is poisoned ({spec})")]
    Poisoned {
        /// Path of the poisoned node
        path: String,
        /// Marker specification
        spec: String,
    },

    /// A configuration value is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// A lower-level I/O error occurred.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl TreeError {
    /// Returns true if the failure is transient and the operation may succeed when retried.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            TreeError::LockTimeout { .. }
                | TreeError::PoolExhausted { .. }
                | TreeError::ReplicationUnavailable(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persisted_id_root() {
        assert_eq!(PersistedId::ROOT.as_u64(), 1);
        assert_eq!(format!("{}", PersistedId::new(42)), "42");
    }

    #[test]
    fn test_xid_ordering() {
        assert!(Xid::new(1) < Xid::new(2));
        assert_eq!(Xid::default(), Xid::ZERO);
        assert_eq!(format!("{}", Xid::new(7)), "xid-7");
    }

    #[test]
    fn test_txtime_now_reasonable() {
        let now = TxTime::now();
        assert!(now.as_millis() > 1_700_000_000_000);
    }

    #[test]
    fn test_acl_world_all() {
        let acl = Acl::world_all();
        assert_eq!(acl.perms, perm::ALL);
        assert_eq!(acl.scheme, AclScheme::World);
    }

    #[test]
    fn test_stat_default_zeroed() {
        let stat = Stat::default();
        assert_eq!(stat.czxid, Xid::ZERO);
        assert_eq!(stat.version, 0);
        assert_eq!(stat.num_children, 0);
    }

    #[test]
    fn test_retriable_classification() {
        assert!(TreeError::LockTimeout {
            what: "node".into(),
            timeout_ms: 5
        }
        .is_retriable());
        assert!(TreeError::PoolExhausted { levels: 2 }.is_retriable());
        assert!(TreeError::ReplicationUnavailable("down".into()).is_retriable());
        assert!(!TreeError::NotPrimary.is_retriable());
        assert!(!TreeError::InvalidArgument("x".into()).is_retriable());
        assert!(!TreeError::ReplicationFailed("lost".into()).is_retriable());
    }

    #[test]
    fn test_error_display() {
        let err = TreeError::NodeExists("/a".into());
        assert_eq!(format!("{}", err), "node '/a' already exists");
        let err = TreeError::InvalidState {
            op: "commit",
            state: "Aborted".into(),
        };
        assert_eq!(format!("{}", err), "cannot commit in state Aborted");
    }
}
