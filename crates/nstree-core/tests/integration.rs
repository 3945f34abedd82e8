//! Integration tests for the namespace tree.
//!
//! These tests drive the public API end to end: transactions over the unsafe
//! edit surface, ordered replication, role changes, lockdown and sessions.

mod common;

use bytes::Bytes;
use common::{test_config, TestTree};
use nstree_core::audit::AuditError;
use nstree_core::{
    Acl, AuditEvent, AuditSink, ChangeList, ChangeListState, ChannelWatcher, ClusterMember,
    ConnectionStringBuilder, CoreConfig, InMemoryFactory, LockdownRequest, NamespaceTree,
    NodeKind, PersistedDataFactory, ReplicaRole, SessionId, SessionIdentity, TreeEdit, TreeError,
    TxStamp, TxTime, UnsafeTreeAccess, WatchedEventType, Xid,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn test_leaf_complete_leaf_scenario() {
    let t = TestTree::new();
    let a = t.create("/a", b"");
    assert_eq!(a.node_kind(), NodeKind::Leaf);

    t.create("/a/b", b"");
    assert_eq!(a.node_kind(), NodeKind::Complete);
    assert_eq!(t.tree.children(&a, None).unwrap(), vec!["b"]);

    let b = t.tree.get_node("/a/b").unwrap();
    let mut txn = t.tree.begin_transaction().unwrap();
    txn.lock_node(&a).unwrap();
    txn.lock_node(&b).unwrap();
    let stamp = txn.stamp();
    t.tree
        .unsafe_remove_child(&a, &b, stamp, "/a/b", Some(&mut txn), true)
        .unwrap();
    txn.complete().unwrap();

    assert_eq!(a.node_kind(), NodeKind::Leaf);
    assert!(t.tree.children(&a, None).unwrap().is_empty());
}

#[test]
fn test_root_never_downgrades() {
    let t = TestTree::new();
    assert_eq!(t.tree.root().node_kind(), NodeKind::Root);
    t.create("/only", b"");
    t.remove("/only").unwrap();
    assert_eq!(t.tree.root().node_kind(), NodeKind::Root);
    assert!(t.tree.root().node().complete().is_some());
}

#[test]
fn test_connection_string_scenario() {
    let mut builder = ConnectionStringBuilder::new();
    assert!(matches!(builder.build(), Err(TreeError::InvalidArgument(_))));
    builder.add_endpoint("h1:1").unwrap();
    builder.add_endpoint("h2:2").unwrap();
    builder.set_num_connections(3).unwrap();
    let built = builder.build().unwrap();
    assert!(built.starts_with("numconnections=3|"));
    let endpoints: Vec<&str> = built["numconnections=3|".len()..].split(';').collect();
    assert_eq!(endpoints.len(), 2);
    assert!(endpoints.contains(&"h1:1"));
    assert!(endpoints.contains(&"h2:2"));
}

#[test]
fn test_partial_lockdown_forces_read_only() {
    let t = TestTree::new();
    let x = t.create("/x", b"x");
    let y = t.create("/y", b"y");

    let mut holder = t.tree.begin_transaction().unwrap();
    holder.lock_node(&y).unwrap();

    let request = LockdownRequest {
        paths_to_lock_down: vec!["/x".to_string(), "/y".to_string()],
        paths_failed: Some(Vec::new()),
        poison_pill_avoided: true,
    };
    let (report, read_only) = t.factory.request_lockdown(&request).unwrap();
    assert_eq!(report.paths_failed, Some(vec!["/y".to_string()]));
    assert!(!report.poison_pill_avoided);
    assert!(!report.full_lockdown);
    assert!(read_only);
    assert!(t.tree.is_read_only());
    assert!(x.marker().is_some());
    assert!(y.marker().is_none());
    assert!(t.tree.lockdown().contains("/y"));

    holder.complete().unwrap();
    assert!(matches!(t.tree.begin_transaction(), Err(TreeError::ReadOnly)));
    assert_eq!(t.tree.get_node("/x").unwrap().data(), Bytes::from_static(b"x"));
}

#[test]
fn test_lockdown_reported_failures_are_kept() {
    let t = TestTree::new();
    t.create("/p", b"");
    t.create("/q", b"");
    let request = LockdownRequest {
        paths_to_lock_down: vec!["/p".to_string(), "/q".to_string()],
        paths_failed: Some(vec!["/q".to_string()]),
        poison_pill_avoided: true,
    };
    let (report, read_only) = t.factory.request_lockdown(&request).unwrap();
    assert_eq!(report.paths_failed, Some(vec!["/q".to_string()]));
    assert!(read_only);

    t.tree.release_lockdown();
    assert!(!t.tree.is_read_only());
    t.set_data("/p", b"writable again").unwrap();
}

#[test]
fn test_locked_down_path_refuses_transactions() {
    let t = TestTree::new();
    let x = t.create("/x", b"");
    let request = LockdownRequest {
        paths_to_lock_down: vec!["/x".to_string()],
        paths_failed: Some(Vec::new()),
        poison_pill_avoided: true,
    };
    let (_, read_only) = t.factory.request_lockdown(&request).unwrap();
    assert!(!read_only);

    let mut txn = t.tree.begin_transaction().unwrap();
    assert!(matches!(
        txn.lock_node(&x),
        Err(TreeError::PathLockedDown(p)) if p == "/x"
    ));
    t.create("/other", b"");
}

#[test]
fn test_missing_locked_down_path_cannot_be_created() {
    let t = TestTree::new();
    t.create("/x", b"x");
    let request = LockdownRequest {
        paths_to_lock_down: vec!["/x".to_string(), "/y".to_string()],
        paths_failed: Some(Vec::new()),
        poison_pill_avoided: true,
    };
    let (report, read_only) = t.factory.request_lockdown(&request).unwrap();
    assert_eq!(report.paths_failed, Some(Vec::new()));
    assert!(report.poison_pill_avoided);
    assert!(!read_only);

    assert!(matches!(
        t.try_create("/y", b"bypass"),
        Err(TreeError::PathLockedDown(p)) if p == "/y"
    ));
    assert!(matches!(t.tree.get_node("/y"), Err(TreeError::NodeNotFound(_))));
    assert_eq!(t.tree.root().stat().num_children, 1);

    let replayed = t
        .tree
        .create_persisted("y", Bytes::new(), vec![Acl::world_all()], None)
        .unwrap();
    let stamp = TxStamp::new(Xid::new(100), TxTime::now());
    assert!(matches!(
        t.tree.unsafe_create(&replayed, stamp, "/y", None),
        Err(TreeError::PathLockedDown(_))
    ));

    t.create("/z", b"");
}

#[test]
fn test_lockdown_waits_for_create_in_progress() {
    let t = TestTree::new();
    let root = Arc::clone(t.tree.root());
    let mut holder = t.tree.begin_transaction().unwrap();
    holder.lock_node(&root).unwrap();
    let node = t
        .tree
        .create_persisted("y", Bytes::from_static(b"y"), vec![Acl::world_all()], None)
        .unwrap();
    let stamp = holder.stamp();
    t.tree
        .unsafe_create(&node, stamp, "/y", Some(&mut holder))
        .unwrap();

    let request = LockdownRequest {
        paths_to_lock_down: vec!["/y".to_string()],
        paths_failed: Some(Vec::new()),
        poison_pill_avoided: true,
    };
    let (report, read_only) = t.factory.request_lockdown(&request).unwrap();
    assert_eq!(report.paths_failed, Some(vec!["/y".to_string()]));
    assert!(!report.poison_pill_avoided);
    assert!(read_only);
    holder.complete().unwrap();
}

#[test]
fn test_commit_abort_exclusivity() {
    let t = TestTree::new();
    let pipeline = t.tree.pipeline().clone();

    let mut aborted = ChangeList::new(pipeline.clone());
    let xid = pipeline.reserve_xid();
    aborted.set_time(TxTime::now()).unwrap();
    aborted
        .append(TreeEdit::SetData {
            path: "/a".to_string(),
            data: Bytes::new(),
        })
        .unwrap();
    aborted.abort().unwrap();
    assert_eq!(aborted.state(), ChangeListState::Aborted);
    assert!(aborted.commit(xid).is_err());
    assert!(aborted.abort().is_err());
    pipeline.abandon(xid);

    let mut committed = ChangeList::new(pipeline.clone());
    let xid = pipeline.reserve_xid();
    committed.set_time(TxTime::now()).unwrap();
    committed.append(TreeEdit::ClearTree).unwrap();
    let handle = committed.commit(xid).unwrap();
    assert!(committed.abort().is_err());
    assert!(committed.commit(xid).is_err());
    assert_eq!(handle.wait_blocking().unwrap().xid, xid);
    assert_eq!(committed.state(), ChangeListState::Committed);
}

#[test]
fn test_concurrent_commits_replicate_in_xid_order() {
    let t = TestTree::new();
    for i in 0..4 {
        t.create(&format!("/n{}", i), b"");
    }
    let mut workers = Vec::new();
    for i in 0..4 {
        let tree = t.tree.clone();
        workers.push(thread::spawn(move || {
            let path = format!("/n{}", i);
            for round in 0..10u8 {
                let node = tree.get_node(&path).unwrap();
                let mut txn = tree.begin_transaction().unwrap();
                txn.lock_node(&node).unwrap();
                let stamp = txn.stamp();
                tree.unsafe_set_data(&node, Bytes::from(vec![round]), stamp, &path, Some(&mut txn))
                    .unwrap();
                txn.complete().unwrap();
            }
        }));
    }
    for w in workers {
        w.join().unwrap();
    }

    let log = t.factory.in_memory_replicator().log();
    assert_eq!(log.len(), 44);
    for pair in log.windows(2) {
        assert!(pair[0].xid < pair[1].xid);
    }
    for i in 0..4 {
        let node = t.tree.get_node(&format!("/n{}", i)).unwrap();
        assert_eq!(node.stat().version, 10);
        assert_eq!(node.data(), Bytes::from(vec![9u8]));
    }
}

#[test]
fn test_watchers_fire_on_commit_and_survive_abort() {
    let t = TestTree::new();
    let w = t.create("/w", b"v1");
    let (watcher, mut rx) = ChannelWatcher::new(true, true);
    assert!(w.node().add_watcher(watcher));
    assert_eq!(w.node_kind(), NodeKind::Complete);

    let mut txn = t.tree.begin_transaction().unwrap();
    txn.lock_node(&w).unwrap();
    let stamp = txn.stamp();
    t.tree
        .unsafe_set_data(&w, Bytes::from_static(b"lost"), stamp, "/w", Some(&mut txn))
        .unwrap();
    txn.mark_for_abort();
    txn.complete().unwrap();
    assert!(rx.try_recv().is_err());
    assert_eq!(w.node().watcher_count(), 1);
    assert_eq!(w.data(), Bytes::from_static(b"v1"));

    t.set_data("/w", b"v2").unwrap();
    let event = rx.try_recv().unwrap();
    assert_eq!(event.event_type, WatchedEventType::NodeDataChanged);
    assert_eq!(event.path, "/w");
    assert_eq!(event.data, Some(Bytes::from_static(b"v2")));
    assert_eq!(event.stat.unwrap().version, 1);
    assert_eq!(w.node_kind(), NodeKind::Leaf);
}

#[test]
fn test_persistent_watcher_keeps_firing() {
    let t = TestTree::new();
    let w = t.create("/p", b"");
    let (watcher, mut rx) = ChannelWatcher::new(false, false);
    w.node().add_watcher(watcher);
    t.set_data("/p", b"1").unwrap();
    t.set_data("/p", b"2").unwrap();
    assert!(rx.try_recv().unwrap().data.is_none());
    assert!(rx.try_recv().is_ok());
    assert_eq!(w.node().watcher_count(), 1);
}

#[test]
fn test_replication_failure_is_reported_by_handle() {
    let t = TestTree::new();
    let node = t.create("/r", b"");
    t.factory.in_memory_replicator().set_unavailable(true);

    let mut txn = t.tree.begin_transaction().unwrap();
    txn.lock_node(&node).unwrap();
    let stamp = txn.stamp();
    t.tree
        .unsafe_set_data(&node, Bytes::from_static(b"x"), stamp, "/r", Some(&mut txn))
        .unwrap();
    let handle = txn.complete().unwrap().unwrap();
    let err = handle.wait_blocking().unwrap_err();
    assert!(err.is_retriable());

    t.factory.in_memory_replicator().set_unavailable(false);
    t.set_data("/r", b"y").unwrap();
}

#[test]
fn test_demotion_stops_transactions_but_not_replay() {
    let t = TestTree::new();
    let node = t.create("/s", b"");
    let drained = t.factory.demote().unwrap().unwrap();
    assert!(drained.wait_timeout(Duration::from_secs(1)));
    assert_eq!(t.tree.role(), ReplicaRole::Secondary);
    assert!(matches!(t.tree.begin_transaction(), Err(TreeError::NotPrimary)));

    let stamp = TxStamp::new(Xid::new(100), TxTime::now());
    t.tree
        .unsafe_set_data(&node, Bytes::from_static(b"replayed"), stamp, "/s", None)
        .unwrap();
    assert_eq!(node.data(), Bytes::from_static(b"replayed"));

    assert!(t.factory.promote().unwrap());
    assert_eq!(t.tree.role(), ReplicaRole::Primary);
}

#[test]
fn test_demotion_rolls_back_transaction_in_flight() {
    let t = TestTree::new();
    let a = t.create("/a", b"old");
    let replicated = t.factory.in_memory_replicator().log().len();

    let mut stale = t.tree.begin_transaction().unwrap();
    stale.lock_node(&a).unwrap();
    let stamp = stale.stamp();
    t.tree
        .unsafe_set_data(&a, Bytes::from_static(b"stale"), stamp, "/a", Some(&mut stale))
        .unwrap();

    let drained = t.factory.demote().unwrap().unwrap();
    assert!(drained.wait_timeout(Duration::from_secs(1)));
    assert!(!stale.is_current());
    assert!(matches!(stale.complete(), Err(TreeError::NotPrimary)));
    assert_eq!(a.data(), Bytes::from_static(b"old"));
    assert_eq!(a.stat().version, 0);
    assert_eq!(t.factory.in_memory_replicator().log().len(), replicated);
    assert!(!a.has_lock_binding());
}

#[test]
fn test_xids_stay_unique_across_role_changes() {
    let t = TestTree::new();
    t.create("/a", b"");
    let held = t.tree.begin_transaction().unwrap();

    t.factory.demote().unwrap();
    assert!(t.factory.promote().unwrap());
    let after = t.tree.begin_transaction().unwrap();
    assert!(after.xid() > held.xid());
    assert!(!held.is_current());
    assert!(after.is_current());
    drop(held);
    drop(after);

    for round in 0..3 {
        t.set_data("/a", format!("v{}", round).as_bytes()).unwrap();
        t.factory.demote().unwrap();
        assert!(t.factory.promote().unwrap());
    }
    t.set_data("/a", b"last").unwrap();

    let log = t.factory.in_memory_replicator().log();
    assert_eq!(log.len(), 5);
    for pair in log.windows(2) {
        assert!(pair[0].xid < pair[1].xid);
    }
}

#[test]
fn test_lock_root_waits_for_node_locks() {
    let t = TestTree::new();
    let a = t.create("/a", b"");
    let mut holder = t.tree.begin_transaction().unwrap();
    holder.lock_node(&a).unwrap();

    let mut root_txn = t.tree.begin_transaction().unwrap();
    let err = t.tree.lock_root(&mut root_txn).unwrap_err();
    assert!(err.is_retriable());

    holder.complete().unwrap();
    t.tree.lock_root(&mut root_txn).unwrap();
    assert!(t.tree.locking().gate().is_exclusive());
    root_txn.complete().unwrap();
    assert!(!t.tree.locking().gate().is_exclusive());
}

#[test]
fn test_lock_pool_returns_to_full_capacity() {
    let t = TestTree::new();
    for i in 0..20 {
        t.create(&format!("/c{}", i), b"");
    }
    let pool = t.tree.locking().pool();
    assert_eq!(pool.available(), pool.capacity());
    assert_eq!(pool.overflow_outstanding(), 0);
}

#[derive(Debug, Default)]
struct RecordingSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl AuditSink for RecordingSink {
    fn emit(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

#[test]
fn test_session_end_removes_ephemerals_and_audits() {
    let factory = Arc::new(InMemoryFactory::new("audited"));
    let sink = Arc::new(RecordingSink::default());
    let tree = Arc::new(
        NamespaceTree::new(test_config(), factory.clone())
            .unwrap()
            .with_audit_sink(sink.clone()),
    );
    tree.activate().unwrap();
    factory.promote().unwrap();

    let session = SessionId::new(0x51);
    tree.register_session(SessionIdentity::new(session, "client-1"));
    let mut txn = tree.begin_transaction().unwrap();
    let root = tree.root().clone();
    txn.lock_node(&root).unwrap();
    let stamp = txn.stamp();
    for name in ["e1", "e2"] {
        let eph = tree
            .create_persisted(name, Bytes::new(), vec![Acl::world_all()], Some(session))
            .unwrap();
        tree.unsafe_create(&eph, stamp, &format!("/{}", name), Some(&mut txn))
            .unwrap();
    }
    txn.complete().unwrap();
    assert_eq!(tree.ephemeral_paths(session), vec!["/e1", "/e2"]);
    assert_eq!(factory.total_nodes(), 2);

    let removed = tree.end_session(session).unwrap();
    assert_eq!(removed.len(), 2);
    assert!(tree.get_node("/e1").is_err());
    assert_eq!(factory.total_nodes(), 0);

    let events = sink.events.lock();
    assert!(matches!(events.first(), Some(AuditEvent::SessionInit { .. })));
    assert!(matches!(
        events.last(),
        Some(AuditEvent::SessionEnded { ephemerals: 2, .. })
    ));
}

#[test]
fn test_cluster_state_from_factory() {
    let t = TestTree::new();
    t.factory.set_members(vec![
        ClusterMember::new("test-replica", "127.0.0.1:7001".parse().unwrap()),
        ClusterMember::new("peer", "127.0.0.1:7002".parse().unwrap()),
    ]);
    let state = t.tree.cluster_state();
    assert_eq!(state.members().len(), 2);
    assert_eq!(state.primary().unwrap().member_id, "test-replica");
}

#[test]
fn test_invalid_config_rejected() {
    let config = CoreConfig {
        lock_timeout_ms: 0,
        ..CoreConfig::default()
    };
    let factory = Arc::new(InMemoryFactory::new("bad"));
    assert!(matches!(
        NamespaceTree::new(config, factory),
        Err(TreeError::Config(_))
    ));
}
