//! Session identity and the audit sink boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::SessionId;

/// Identity of a client session as handed over by session management.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    /// Numeric session id
    pub id: SessionId,
    /// Human-readable name, e.g. the client host
    pub friendly_name: String,
    /// Opaque authentication data
    pub auth: Option<String>,
}

impl SessionIdentity {
    /// Creates an unauthenticated session identity.
    pub fn new(id: SessionId, friendly_name: impl Into<String>) -> Self {
        Self {
            id,
            friendly_name: friendly_name.into(),
            auth: None,
        }
    }
}

/// An audit-worthy event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEvent {
    /// A session was registered with the tree.
    SessionInit {
        /// Session id
        session: SessionId,
        /// Friendly name
        friendly_name: String,
    },
    /// A session's authentication data changed.
    AuthChanged {
        /// Session id
        session: SessionId,
        /// New authentication data
        auth: Option<String>,
    },
    /// A command arrived for a path.
    CommandReceived {
        /// Issuing session, if any
        session: Option<SessionId>,
        /// Command name
        command: String,
        /// Target path
        path: String,
    },
    /// A command finished.
    CommandExecuted {
        /// Issuing session, if any
        session: Option<SessionId>,
        /// Command name
        command: String,
        /// Target path
        path: String,
        /// Whether it succeeded
        success: bool,
    },
    /// A session ended and its ephemeral nodes were collected.
    SessionEnded {
        /// Session id
        session: SessionId,
        /// Ephemeral paths owned at session end
        ephemerals: usize,
    },
}

/// Error reported by an audit sink
#[derive(Debug, thiserror::Error)]
#[error("audit sink failure: {0}")]
pub struct AuditError(pub String);

/// Receiver of audit events. Failures never block tree mutation.
pub trait AuditSink: Send + Sync + fmt::Debug {
    /// Records an event.
    fn emit(&self, event: &AuditEvent) -> Result<(), AuditError>;
}

/// Audit sink that writes events to `tracing` at info level.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let json = serde_json::to_string(event).map_err(|e| AuditError(e.to_string()))?;
        tracing::info!(target: "nstree::audit", event = %json, "audit");
        Ok(())
    }
}

/// Emits through `sink`, logging rather than propagating failures.
pub(crate) fn emit_logged(sink: Option<&dyn AuditSink>, event: AuditEvent) {
    if let Some(sink) = sink {
        if let Err(e) = sink.emit(&event) {
            tracing::warn!(error = %e, ?event, "audit event dropped");
        }
    }
}
