//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use nstree_core::{
    Acl, CoreConfig, InMemoryFactory, LockPoolConfig, NamespaceTree, PersistedData, TreeError,
    UnsafeTreeAccess,
};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// A primary tree over an in-memory factory, tuned for fast tests
pub struct TestTree {
    pub tree: Arc<NamespaceTree>,
    pub factory: Arc<InMemoryFactory>,
}

impl TestTree {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: CoreConfig) -> Self {
        init_tracing();
        let factory = Arc::new(InMemoryFactory::new("test-replica"));
        let tree = Arc::new(NamespaceTree::new(config, factory.clone()).unwrap());
        tree.activate().unwrap();
        assert!(factory.promote().unwrap());
        Self { tree, factory }
    }

    /// Creates `path` with `data`; the parent must exist.
    pub fn create(&self, path: &str, data: &[u8]) -> Arc<PersistedData> {
        self.try_create(path, data).unwrap()
    }

    pub fn try_create(&self, path: &str, data: &[u8]) -> Result<Arc<PersistedData>, TreeError> {
        let (parent_path, name) = split(path);
        let mut txn = self.tree.begin_transaction()?;
        let parent = self.tree.get_node(parent_path)?;
        txn.lock_node(&parent)?;
        let node = self.tree.create_persisted(
            name,
            Bytes::copy_from_slice(data),
            vec![Acl::world_all()],
            None,
        )?;
        let stamp = txn.stamp();
        self.tree.unsafe_create(&node, stamp, path, Some(&mut txn))?;
        txn.complete()?;
        Ok(node)
    }

    /// Replaces the data at `path`.
    pub fn set_data(&self, path: &str, data: &[u8]) -> Result<(), TreeError> {
        let mut txn = self.tree.begin_transaction()?;
        let node = self.tree.get_node(path)?;
        txn.lock_node(&node)?;
        let stamp = txn.stamp();
        self.tree.unsafe_set_data(
            &node,
            Bytes::copy_from_slice(data),
            stamp,
            path,
            Some(&mut txn),
        )?;
        txn.complete()?;
        Ok(())
    }

    /// Unlinks and deletes the node at `path`.
    pub fn remove(&self, path: &str) -> Result<(), TreeError> {
        let mut txn = self.tree.begin_transaction()?;
        let node = self.tree.get_node(path)?;
        let parent = node
            .parent()
            .ok_or_else(|| TreeError::NodeNotFound(path.to_string()))?;
        txn.lock_node(&parent)?;
        txn.lock_node(&node)?;
        let stamp = txn.stamp();
        self.tree
            .unsafe_remove(&parent, &node, stamp, path, Some(&mut txn))?;
        txn.complete()?;
        Ok(())
    }
}

/// Routes tree logs to the test harness; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer())
        .with(EnvFilter::from_default_env())
        .try_init();
}

pub fn test_config() -> CoreConfig {
    CoreConfig {
        lock_pool: LockPoolConfig {
            level_sizes: vec![8, 32],
            last_level_is_overflow: true,
        },
        lock_timeout_ms: 50,
        sync_barrier_timeout_ms: 200,
        ..CoreConfig::default()
    }
}

fn split(path: &str) -> (&str, &str) {
    let idx = path.rfind('/').unwrap();
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    (parent, &path[idx + 1..])
}
