//! Multi-level pool of reusable lock objects.
//!
//! Each level owns a fixed array of [`LockObject`]s and a free list of slot
//! indices. `acquire` hands out a slot from the lowest level that still has one;
//! when every level is exhausted and the last level is configured as overflow,
//! a lock is allocated on the fly and dropped when returned.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::LockPoolConfig;
use crate::sync::LockObject;
use crate::types::TreeError;

struct LevelPool {
    locks: Vec<Arc<LockObject>>,
    free: Mutex<Vec<usize>>,
}

impl LevelPool {
    fn new(size: usize) -> Self {
        Self {
            locks: (0..size).map(|_| Arc::new(LockObject::new())).collect(),
            // popped from the back, so slot 0 goes out first
            free: Mutex::new((0..size).rev().collect()),
        }
    }
}

struct PoolShared {
    levels: Vec<LevelPool>,
    overflow: bool,
    disposed: AtomicBool,
    overflow_outstanding: AtomicUsize,
}

/// Where a pooled lock came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOrigin {
    /// A fixed slot of a level
    Level {
        /// Level index, 0 is the lowest
        level: usize,
        /// Slot index within the level
        slot: usize,
    },
    /// Allocated dynamically because every level was exhausted
    Overflow,
}

/// A lock object checked out of a [`MultiLevelLockPool`].
///
/// Dropping it returns the slot to its level's free list, so every lock is
/// returned exactly once.
pub struct PooledLock {
    shared: Arc<PoolShared>,
    origin: LockOrigin,
    object: Arc<LockObject>,
}

impl PooledLock {
    /// The underlying lock object
    pub fn object(&self) -> &Arc<LockObject> {
        &self.object
    }

    /// Where this lock was taken from
    pub fn origin(&self) -> LockOrigin {
        self.origin
    }
}

impl std::fmt::Debug for PooledLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledLock")
            .field("origin", &self.origin)
            .finish()
    }
}

impl Drop for PooledLock {
    fn drop(&mut self) {
        match self.origin {
            LockOrigin::Level { level, slot } => {
                if self.shared.disposed.load(Ordering::Acquire) {
                    return;
                }
                if let Some(pool) = self.shared.levels.get(level) {
                    pool.free.lock().push(slot);
                }
            }
            LockOrigin::Overflow => {
                self.shared.overflow_outstanding.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

/// Tiered pool of reusable lock objects
#[derive(Clone)]
pub struct MultiLevelLockPool {
    shared: Arc<PoolShared>,
}

impl MultiLevelLockPool {
    /// Creates a pool with the given level sizes.
    pub fn new(config: &LockPoolConfig) -> Result<Self, TreeError> {
        if config.level_sizes.is_empty() {
            return Err(TreeError::InvalidArgument(
                "lock pool needs at least one level".to_string(),
            ));
        }
        if config.level_sizes.contains(&0) {
            return Err(TreeError::InvalidArgument(
                "lock pool levels must not be empty".to_string(),
            ));
        }
        let levels = config.level_sizes.iter().map(|&n| LevelPool::new(n)).collect();
        Ok(Self {
            shared: Arc::new(PoolShared {
                levels,
                overflow: config.last_level_is_overflow,
                disposed: AtomicBool::new(false),
                overflow_outstanding: AtomicUsize::new(0),
            }),
        })
    }

    /// Takes a lock from the lowest level with a free slot.
    pub fn acquire(&self) -> Result<PooledLock, TreeError> {
        if self.shared.disposed.load(Ordering::Acquire) {
            return Err(TreeError::Disposed("lock pool"));
        }
        for (level, pool) in self.shared.levels.iter().enumerate() {
            if let Some(slot) = pool.free.lock().pop() {
                return Ok(PooledLock {
                    shared: Arc::clone(&self.shared),
                    origin: LockOrigin::Level { level, slot },
                    object: Arc::clone(&pool.locks[slot]),
                });
            }
        }
        if !self.shared.overflow {
            return Err(TreeError::PoolExhausted {
                levels: self.shared.levels.len(),
            });
        }
        let outstanding = self.shared.overflow_outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(outstanding, "lock pool exhausted, allocating overflow lock");
        Ok(PooledLock {
            shared: Arc::clone(&self.shared),
            origin: LockOrigin::Overflow,
            object: Arc::new(LockObject::new()),
        })
    }

    /// Returns a lock to the pool.
    pub fn release(&self, lock: PooledLock) {
        drop(lock);
    }

    /// Free slots across every fixed level
    pub fn available(&self) -> usize {
        self.shared.levels.iter().map(|p| p.free.lock().len()).sum()
    }

    /// Free slots in one level
    pub fn level_available(&self, level: usize) -> Option<usize> {
        self.shared.levels.get(level).map(|p| p.free.lock().len())
    }

    /// Total number of fixed slots
    pub fn capacity(&self) -> usize {
        self.shared.levels.iter().map(|p| p.locks.len()).sum()
    }

    /// Number of configured levels
    pub fn level_count(&self) -> usize {
        self.shared.levels.len()
    }

    /// Overflow locks currently checked out
    pub fn overflow_outstanding(&self) -> usize {
        self.shared.overflow_outstanding.load(Ordering::Acquire)
    }

    /// Returns true once the pool has been disposed
    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Disposes every pooled lock on every level. Later acquisitions fail.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut disposed = 0usize;
        for pool in &self.shared.levels {
            pool.free.lock().clear();
            for lock in &pool.locks {
                lock.dispose();
                disposed += 1;
            }
        }
        tracing::info!(disposed, levels = self.shared.levels.len(), "lock pool disposed");
    }
}

impl std::fmt::Debug for MultiLevelLockPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiLevelLockPool")
            .field("levels", &self.shared.levels.len())
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .field("overflow", &self.shared.overflow)
            .finish()
    }
}
