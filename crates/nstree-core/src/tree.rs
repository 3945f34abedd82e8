//! The namespace tree.
//!
//! [`NamespaceTree`] owns the root record, the lock pool and the commit
//! pipeline, answers lock-free path lookups, and reacts to role changes and
//! lockdown requests from its [`PersistedDataFactory`]. Mutation goes through
//! [`UnsafeTreeAccess`](crate::unsafe_access::UnsafeTreeAccess) under a
//! [`LockListTransaction`].

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::audit::{emit_logged, AuditEvent, AuditSink, SessionIdentity};
use crate::cluster::ClusterState;
use crate::config::CoreConfig;
use crate::factory::{PersistedDataFactory, PersistedDataFactoryClient, ReplicaRole};
use crate::lock_list::{LockListTransaction, LockingContext};
use crate::lock_pool::MultiLevelLockPool;
use crate::lockdown::{LockDownSet, LockdownReport, LockdownRequest, LOCKDOWN_SPEC};
use crate::persisted::{PersistedData, PoisonPill};
use crate::pipeline::CommitPipeline;
use crate::sync::CompletionEvent;
use crate::types::{Acl, SessionId, TreeError, TxTime};
use crate::unsafe_access::UnsafeTreeAccess;

/// In-memory replicated namespace tree.
pub struct NamespaceTree {
    config: CoreConfig,
    factory: Arc<dyn PersistedDataFactory>,
    root: Arc<PersistedData>,
    locking: Arc<LockingContext>,
    pipeline: Arc<CommitPipeline>,
    role: RwLock<ReplicaRole>,
    read_only: AtomicBool,
    loaded: AtomicBool,
    sessions: DashMap<SessionId, SessionIdentity>,
    pub(crate) ephemerals: Arc<DashMap<SessionId, BTreeSet<String>>>,
    audit: Option<Arc<dyn AuditSink>>,
}

impl NamespaceTree {
    /// Builds a tree over `factory`. The tree starts unloaded; call
    /// [`activate`](Self::activate) to start receiving factory notifications.
    pub fn new(config: CoreConfig, factory: Arc<dyn PersistedDataFactory>) -> Result<Self, TreeError> {
        config.validate()?;
        let pool = MultiLevelLockPool::new(&config.lock_pool)?;
        let locking = Arc::new(LockingContext::new(
            pool,
            Arc::new(LockDownSet::new()),
            config.lock_timeout(),
        ));
        let pipeline = CommitPipeline::new(factory.replicator(), factory.last_xid());
        let root = factory.create_root();
        let role = factory.role();
        tracing::info!(
            tree = config.display_name(),
            factory = factory.name(),
            %role,
            "namespace tree created"
        );
        Ok(Self {
            config,
            factory,
            root,
            locking,
            pipeline,
            role: RwLock::new(role),
            read_only: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
            sessions: DashMap::new(),
            ephemerals: Arc::new(DashMap::new()),
            audit: None,
        })
    }

    /// Routes audit events to `sink`.
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Marks the tree loaded and registers it with the factory.
    pub fn activate(self: &Arc<Self>) -> Result<(), TreeError> {
        self.loaded.store(true, Ordering::Release);
        let weak: Weak<NamespaceTree> = Arc::downgrade(self);
        let client: Weak<dyn PersistedDataFactoryClient> = weak;
        if let Err(e) = self.factory.activate(client) {
            self.loaded.store(false, Ordering::Release);
            return Err(e);
        }
        tracing::info!(tree = self.config.display_name(), "namespace tree activated");
        Ok(())
    }

    /// Stops factory notifications and disposes the lock pool.
    pub fn dispose(&self) {
        self.loaded.store(false, Ordering::Release);
        self.factory.deactivate();
        self.locking.pool().dispose();
        tracing::info!(tree = self.config.display_name(), "namespace tree disposed");
    }

    /// The root record
    pub fn root(&self) -> &Arc<PersistedData> {
        &self.root
    }

    /// Current replica role
    pub fn role(&self) -> ReplicaRole {
        *self.role.read()
    }

    /// Returns true while the store is forced read-only
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Returns true between activation and disposal
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Paths currently locked down
    pub fn lockdown(&self) -> &Arc<LockDownSet> {
        self.locking.lockdown()
    }

    /// The commit pipeline
    pub fn pipeline(&self) -> &Arc<CommitPipeline> {
        &self.pipeline
    }

    /// Lock pool and tree gate
    pub fn locking(&self) -> &Arc<LockingContext> {
        &self.locking
    }

    /// Active configuration
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// The persistence collaborator
    pub fn factory(&self) -> &Arc<dyn PersistedDataFactory> {
        &self.factory
    }

    /// Resolves an absolute path without taking locks.
    ///
    /// Deleted records are reported as missing.
    pub fn get_node(&self, path: &str) -> Result<Arc<PersistedData>, TreeError> {
        let rest = path
            .strip_prefix('/')
            .ok_or_else(|| TreeError::InvalidArgument(format!("path '{}' is not absolute", path)))?;
        let mut current = Arc::clone(&self.root);
        if rest.is_empty() {
            return Ok(current);
        }
        for segment in rest.split('/') {
            if segment.is_empty() {
                return Err(TreeError::InvalidArgument(format!(
                    "path '{}' has an empty segment",
                    path
                )));
            }
            current = current
                .node()
                .child(segment)
                .ok_or_else(|| TreeError::NodeNotFound(path.to_string()))?;
        }
        if current.is_deleted() {
            return Err(TreeError::NodeNotFound(path.to_string()));
        }
        Ok(current)
    }

    /// Rebuilds the path of `node` from its parent links.
    pub fn build_path(&self, node: &PersistedData) -> String {
        node.build_path()
    }

    /// Child names of `node` in ordinal order.
    ///
    /// `condition` of the form `>:<top>:<start>` limits the listing to at most
    /// `top` names strictly after `start`.
    pub fn children(
        &self,
        node: &PersistedData,
        condition: Option<&str>,
    ) -> Result<Vec<String>, TreeError> {
        match condition {
            None => Ok(node.node().child_names()),
            Some(condition) => {
                let (top, start) = parse_retrieval_condition(condition)?;
                Ok(node.node().child_names_after(start, top))
            }
        }
    }

    /// Snapshot of cluster members and health.
    pub fn cluster_state(&self) -> ClusterState {
        ClusterState::from_factory(self.factory.as_ref())
    }

    /// Starts a transaction. Only a loaded, writable primary accepts them.
    pub fn begin_transaction(&self) -> Result<LockListTransaction, TreeError> {
        if !self.is_loaded() {
            return Err(TreeError::InvalidState {
                op: "begin transaction",
                state: "not loaded".to_string(),
            });
        }
        if self.role() != ReplicaRole::Primary {
            return Err(TreeError::NotPrimary);
        }
        if self.is_read_only() {
            return Err(TreeError::ReadOnly);
        }
        let txn = LockListTransaction::new(Arc::clone(&self.locking), Arc::clone(&self.pipeline));
        // a demotion may have fenced the pipeline after the role check
        if self.role() != ReplicaRole::Primary || !txn.is_current() {
            return Err(TreeError::NotPrimary);
        }
        Ok(txn)
    }

    /// Persists a new detached record for a child named `name`.
    pub fn create_persisted(
        &self,
        name: &str,
        data: Bytes,
        acl: Vec<Acl>,
        ephemeral_owner: Option<SessionId>,
    ) -> Result<Arc<PersistedData>, TreeError> {
        if name.is_empty() || name.contains('/') {
            return Err(TreeError::InvalidArgument(format!(
                "invalid node name '{}'",
                name
            )));
        }
        Ok(self
            .factory
            .create_new(name, data, Arc::new(acl), ephemeral_owner))
    }

    /// Records a session handed over by session management.
    pub fn register_session(&self, identity: SessionIdentity) {
        let event = AuditEvent::SessionInit {
            session: identity.id,
            friendly_name: identity.friendly_name.clone(),
        };
        tracing::debug!(session = %identity.id, name = %identity.friendly_name, "session registered");
        self.sessions.insert(identity.id, identity);
        self.audit(event);
    }

    /// Replaces a session's authentication data.
    pub fn update_session_auth(
        &self,
        session: SessionId,
        auth: Option<String>,
    ) -> Result<(), TreeError> {
        match self.sessions.get_mut(&session) {
            Some(mut identity) => identity.auth = auth.clone(),
            None => {
                return Err(TreeError::InvalidArgument(format!(
                    "unknown session {}",
                    session
                )))
            }
        }
        self.audit(AuditEvent::AuthChanged { session, auth });
        Ok(())
    }

    /// Identity of a registered session
    pub fn session(&self, session: SessionId) -> Option<SessionIdentity> {
        self.sessions.get(&session).map(|s| s.value().clone())
    }

    /// Emits an audit event; sink failures are only logged.
    pub fn audit(&self, event: AuditEvent) {
        emit_logged(self.audit.as_deref(), event);
    }

    /// Paths of the ephemeral nodes owned by `session`, sorted.
    pub fn ephemeral_paths(&self, session: SessionId) -> Vec<String> {
        self.ephemerals
            .get(&session)
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Deletes every ephemeral node of `session` in one transaction and
    /// forgets the session. Returns the deleted paths.
    pub fn end_session(&self, session: SessionId) -> Result<Vec<String>, TreeError> {
        let paths = self.ephemeral_paths(session);
        if !paths.is_empty() {
            let mut txn = self.begin_transaction()?;
            let stamp = txn.stamp();
            for path in &paths {
                let node = match self.get_node(path) {
                    Ok(node) => node,
                    Err(TreeError::NodeNotFound(_)) => continue,
                    Err(e) => return Err(e),
                };
                let parent = node
                    .parent()
                    .ok_or_else(|| TreeError::NodeNotFound(path.clone()))?;
                txn.lock_node(&parent)?;
                txn.lock_node(&node)?;
                self.unsafe_remove(&parent, &node, stamp, path, Some(&mut txn))?;
            }
            txn.complete()?;
        }
        self.sessions.remove(&session);
        tracing::info!(%session, ephemerals = paths.len(), "session ended");
        self.audit(AuditEvent::SessionEnded {
            session,
            ephemerals: paths.len(),
        });
        Ok(paths)
    }

    /// Lifts a lockdown: clears lockdown markers, empties the set and leaves
    /// read-only mode.
    pub fn release_lockdown(&self) {
        let paths = self.lockdown().paths();
        for path in &paths {
            if let Ok(node) = self.get_node(path) {
                if node.marker().is_some_and(|m| m.spec == LOCKDOWN_SPEC) {
                    node.set_marker(None);
                }
            }
        }
        self.lockdown().clear();
        self.read_only.store(false, Ordering::Release);
        tracing::info!(paths = paths.len(), "lockdown released");
    }

    fn enter_read_only(&self, reason: &str) {
        if !self.read_only.swap(true, Ordering::AcqRel) {
            tracing::warn!(tree = self.config.display_name(), reason, "store forced read-only");
        }
    }

    /// Marks the node at `path` with the lockdown marker, waiting at most the
    /// lock timeout for in-progress writers. Returns false if the path could
    /// not be isolated.
    ///
    /// The path is already in the lockdown set, so no transaction can lock,
    /// create or edit it afterwards. The parent lock is taken once first to
    /// wait out a create or unlink that is already past that check.
    fn lock_down_path(&self, path: &str) -> bool {
        if path != "/" {
            let parent_path = match path.rfind('/') {
                Some(0) => "/",
                Some(idx) => &path[..idx],
                None => return false,
            };
            match self.get_node(parent_path) {
                Ok(parent) => {
                    if !self.with_node_lock(parent_path, &parent, |_| ()) {
                        return false;
                    }
                }
                // the child can only appear through a later create, which checks the set
                Err(TreeError::NodeNotFound(_)) => return true,
                Err(e) => {
                    tracing::warn!(path, error = %e, "cannot resolve parent for lockdown");
                    return false;
                }
            }
        }
        match self.get_node(path) {
            Ok(node) => self.with_node_lock(path, &node, |node| self.mark_locked_down(node)),
            Err(TreeError::NodeNotFound(_)) => true,
            Err(e) => {
                tracing::warn!(path, error = %e, "cannot resolve path for lockdown");
                false
            }
        }
    }

    /// Runs `f` while holding the pooled lock of `node`.
    fn with_node_lock(
        &self,
        path: &str,
        node: &Arc<PersistedData>,
        f: impl FnOnce(&Arc<PersistedData>),
    ) -> bool {
        let lock = match node.bind_lock(self.locking.pool()) {
            Ok(lock) => lock,
            Err(e) => {
                tracing::warn!(path, error = %e, "no lock available for lockdown");
                return false;
            }
        };
        let locked = match lock.acquire(self.locking.lock_timeout()) {
            Ok(()) => {
                f(node);
                lock.release();
                true
            }
            Err(e) => {
                tracing::warn!(path, error = %e, "node busy, lockdown failed");
                false
            }
        };
        node.unbind_lock();
        locked
    }

    fn mark_locked_down(&self, node: &PersistedData) {
        let previous = node.set_marker(Some(PoisonPill {
            spec: LOCKDOWN_SPEC.to_string(),
            xid: self.pipeline.last_reserved(),
            txtime: TxTime::now(),
        }));
        if let Some(previous) = previous {
            if previous.spec != LOCKDOWN_SPEC {
                node.set_marker(Some(previous));
            }
        }
    }
}

fn parse_retrieval_condition(condition: &str) -> Result<(usize, &str), TreeError> {
    let invalid = || TreeError::InvalidArgument(format!("invalid retrieval condition '{}'", condition));
    let mut parts = condition.splitn(3, ':');
    if parts.next() != Some(">") {
        return Err(invalid());
    }
    let top = parts
        .next()
        .and_then(|t| t.parse::<usize>().ok())
        .ok_or_else(invalid)?;
    let start = parts.next().ok_or_else(invalid)?;
    Ok((top, start))
}

impl PersistedDataFactoryClient for NamespaceTree {
    fn on_become_primary(&self) {
        self.pipeline.reset(self.factory.last_xid());
        *self.role.write() = ReplicaRole::Primary;
        tracing::info!(
            tree = self.config.display_name(),
            last_xid = %self.factory.last_xid(),
            "became primary"
        );
    }

    fn on_primary_status_lost(&self) -> Arc<CompletionEvent> {
        *self.role.write() = ReplicaRole::Secondary;
        self.pipeline.fence();
        tracing::warn!(
            tree = self.config.display_name(),
            in_flight = self.pipeline.in_flight(),
            last_reserved = %self.pipeline.last_reserved(),
            "lost primary status"
        );
        self.pipeline.drain()
    }

    fn can_become_primary(&self) -> bool {
        self.is_loaded() && !self.is_read_only()
    }

    fn on_paths_lockdown_requested(
        &self,
        request: &LockdownRequest,
        replication_is_in_read_only: &mut bool,
    ) -> LockdownReport {
        if *replication_is_in_read_only {
            self.enter_read_only("replication is read-only");
        }
        let requested: HashSet<String> = request.paths_to_lock_down.iter().cloned().collect();
        let mut locked_down: Vec<String> = requested.iter().cloned().collect();
        locked_down.sort();

        let Some(replication_failed) = &request.paths_failed else {
            self.lockdown().replace_paths(requested);
            *replication_is_in_read_only = true;
            self.enter_read_only("replication could not isolate any path");
            return LockdownReport {
                locked_down,
                paths_failed: None,
                poison_pill_avoided: false,
                full_lockdown: true,
            };
        };

        // block new transactions first, then wait out the ones in progress
        self.lockdown().replace_paths(requested);
        let mut failed = Vec::new();
        for path in &locked_down {
            if replication_failed.contains(path) || !self.lock_down_path(path) {
                failed.push(path.clone());
            }
        }
        failed.sort();
        for path in self.lockdown().paths() {
            tracing::debug!(path = %path, "path locked down");
        }

        let avoided = request.poison_pill_avoided && failed.is_empty();
        if !avoided {
            *replication_is_in_read_only = true;
            self.enter_read_only("lockdown incomplete");
        }
        tracing::warn!(
            requested = locked_down.len(),
            failed = failed.len(),
            poison_pill_avoided = avoided,
            "lockdown requested"
        );
        LockdownReport {
            locked_down,
            paths_failed: Some(failed),
            poison_pill_avoided: avoided,
            full_lockdown: false,
        }
    }
}

impl std::fmt::Debug for NamespaceTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceTree")
            .field("name", &self.config.display_name())
            .field("role", &self.role())
            .field("read_only", &self.is_read_only())
            .field("loaded", &self.is_loaded())
            .field("root", &self.root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::InMemoryFactory;
    use crate::node::NodeKind;
    use crate::types::Xid;

    fn tree() -> (Arc<NamespaceTree>, Arc<InMemoryFactory>) {
        let factory = Arc::new(InMemoryFactory::new("test"));
        let config = CoreConfig {
            lock_timeout_ms: 50,
            ..CoreConfig::default()
        };
        let tree = Arc::new(NamespaceTree::new(config, factory.clone()).unwrap());
        tree.activate().unwrap();
        assert!(factory.promote().unwrap());
        (tree, factory)
    }

    fn create(tree: &NamespaceTree, parent_path: &str, name: &str) -> Arc<PersistedData> {
        let mut txn = tree.begin_transaction().unwrap();
        let parent = tree.get_node(parent_path).unwrap();
        txn.lock_node(&parent).unwrap();
        let node = tree
            .create_persisted(name, Bytes::from_static(b"d"), vec![Acl::world_all()], None)
            .unwrap();
        let path = if parent_path == "/" {
            format!("/{}", name)
        } else {
            format!("{}/{}", parent_path, name)
        };
        let stamp = txn.stamp();
        tree.unsafe_create(&node, stamp, &path, Some(&mut txn)).unwrap();
        txn.complete().unwrap();
        node
    }

    #[test]
    fn test_get_node_paths() {
        let (tree, _) = tree();
        assert!(Arc::ptr_eq(&tree.get_node("/").unwrap(), tree.root()));
        create(&tree, "/", "a");
        create(&tree, "/a", "b");
        assert_eq!(tree.get_node("/a/b").unwrap().name(), "b");
        assert!(matches!(tree.get_node("a"), Err(TreeError::InvalidArgument(_))));
        assert!(matches!(tree.get_node("/a//b"), Err(TreeError::InvalidArgument(_))));
        assert!(matches!(tree.get_node("/a/"), Err(TreeError::InvalidArgument(_))));
        assert!(matches!(tree.get_node("/zz"), Err(TreeError::NodeNotFound(_))));
        assert_eq!(tree.build_path(&tree.get_node("/a/b").unwrap()), "/a/b");
    }

    #[test]
    fn test_children_with_condition() {
        let (tree, _) = tree();
        for name in ["d", "b", "a", "c"] {
            create(&tree, "/", name);
        }
        let root = tree.root();
        assert_eq!(tree.children(root, None).unwrap(), vec!["a", "b", "c", "d"]);
        assert_eq!(tree.children(root, Some(">:2:a")).unwrap(), vec!["b", "c"]);
        assert_eq!(tree.children(root, Some(">:10:")).unwrap().len(), 4);
        assert!(tree.children(root, Some(">:x:a")).is_err());
        assert!(tree.children(root, Some("<:1:a")).is_err());
        assert!(tree.children(root, Some(">:1")).is_err());
    }

    #[test]
    fn test_begin_transaction_requires_primary() {
        let (tree, factory) = tree();
        factory.demote().unwrap();
        assert_eq!(tree.role(), ReplicaRole::Secondary);
        assert!(matches!(tree.begin_transaction(), Err(TreeError::NotPrimary)));
    }

    #[test]
    fn test_unloaded_tree_rejects_transactions() {
        let factory = Arc::new(InMemoryFactory::new("cold"));
        let tree = NamespaceTree::new(CoreConfig::default(), factory).unwrap();
        assert!(matches!(
            tree.begin_transaction(),
            Err(TreeError::InvalidState { .. })
        ));
        assert!(!tree.can_become_primary());
    }

    #[test]
    fn test_create_persisted_rejects_bad_names() {
        let (tree, _) = tree();
        assert!(tree.create_persisted("", Bytes::new(), vec![], None).is_err());
        assert!(tree.create_persisted("a/b", Bytes::new(), vec![], None).is_err());
    }

    #[test]
    fn test_become_primary_reseeds_xids() {
        let (tree, factory) = tree();
        create(&tree, "/", "a");
        let last = factory.last_xid();
        assert_eq!(last, Xid::new(1));
        factory.demote().unwrap().unwrap().wait();
        factory.promote().unwrap();
        let txn = tree.begin_transaction().unwrap();
        assert_eq!(txn.xid(), Xid::new(2));
    }

    #[test]
    fn test_full_lockdown_forces_read_only() {
        let (tree, factory) = tree();
        create(&tree, "/", "x");
        let request = LockdownRequest {
            paths_to_lock_down: vec!["/x".to_string()],
            paths_failed: None,
            poison_pill_avoided: false,
        };
        let (report, read_only) = factory.request_lockdown(&request).unwrap();
        assert!(report.full_lockdown);
        assert!(report.paths_failed.is_none());
        assert!(read_only);
        assert!(tree.is_read_only());
        assert!(matches!(tree.begin_transaction(), Err(TreeError::ReadOnly)));
        assert!(!tree.can_become_primary());

        tree.release_lockdown();
        assert!(!tree.is_read_only());
        assert!(tree.lockdown().is_empty());
        assert!(tree.begin_transaction().is_ok());
    }

    #[test]
    fn test_clean_lockdown_keeps_store_writable() {
        let (tree, factory) = tree();
        let x = create(&tree, "/", "x");
        let request = LockdownRequest {
            paths_to_lock_down: vec!["/x".to_string(), "/missing".to_string()],
            paths_failed: Some(Vec::new()),
            poison_pill_avoided: true,
        };
        let (report, read_only) = factory.request_lockdown(&request).unwrap();
        assert_eq!(report.locked_down, vec!["/missing", "/x"]);
        assert_eq!(report.paths_failed, Some(Vec::new()));
        assert!(report.poison_pill_avoided);
        assert!(!read_only);
        assert!(!tree.is_read_only());
        assert_eq!(x.marker().unwrap().spec, LOCKDOWN_SPEC);
        assert!(!x.has_lock_binding());

        tree.release_lockdown();
        assert!(x.marker().is_none());
    }

    #[test]
    fn test_ephemeral_cleanup_on_session_end() {
        let (tree, _) = tree();
        let session = SessionId::new(0xabc);
        tree.register_session(SessionIdentity::new(session, "client"));
        create(&tree, "/", "svc");

        let mut txn = tree.begin_transaction().unwrap();
        let parent = tree.get_node("/svc").unwrap();
        txn.lock_node(&parent).unwrap();
        let eph = tree
            .create_persisted("e1", Bytes::new(), vec![Acl::world_all()], Some(session))
            .unwrap();
        let stamp = txn.stamp();
        tree.unsafe_add_ephemeral_child(&parent, &eph, stamp, "/svc/e1", Some(&mut txn))
            .unwrap();
        txn.complete().unwrap();
        assert_eq!(tree.ephemeral_paths(session), vec!["/svc/e1"]);

        let removed = tree.end_session(session).unwrap();
        assert_eq!(removed, vec!["/svc/e1"]);
        assert!(tree.get_node("/svc/e1").is_err());
        assert!(tree.ephemeral_paths(session).is_empty());
        assert!(tree.session(session).is_none());
        assert_eq!(parent.node_kind(), NodeKind::Leaf);
    }

    #[test]
    fn test_update_unknown_session_auth() {
        let (tree, _) = tree();
        assert!(tree
            .update_session_auth(SessionId::new(9), Some("token".to_string()))
            .is_err());
        tree.register_session(SessionIdentity::new(SessionId::new(9), "c"));
        tree.update_session_auth(SessionId::new(9), Some("token".to_string()))
            .unwrap();
        assert_eq!(
            tree.session(SessionId::new(9)).unwrap().auth.as_deref(),
            Some("token")
        );
    }

    #[test]
    fn test_dispose_deactivates_factory() {
        let (tree, factory) = tree();
        tree.dispose();
        assert!(!tree.is_loaded());
        assert!(tree.locking().pool().is_disposed());
        assert!(factory.promote().is_err());
    }
}
