//! Synchronization primitives: pooled exclusive locks, the whole-tree gate and
//! manual-reset completion events.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::types::TreeError;

#[derive(Debug, Default)]
struct LockState {
    held: bool,
    disposed: bool,
}

/// An exclusive, non-reentrant lock that can be handed between nodes.
///
/// Unlike a `Mutex<T>` it guards no data and is released explicitly, so a
/// transaction can hold it across calls and release it in a chosen order.
#[derive(Debug, Default)]
pub struct LockObject {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl LockObject {
    /// Creates an unheld lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock, waiting up to `timeout`.
    pub fn acquire(&self, timeout: Duration) -> Result<(), TreeError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.disposed {
                return Err(TreeError::Disposed("lock object"));
            }
            if !state.held {
                state.held = true;
                return Ok(());
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                if state.disposed {
                    return Err(TreeError::Disposed("lock object"));
                }
                if !state.held {
                    state.held = true;
                    return Ok(());
                }
                return Err(TreeError::LockTimeout {
                    what: "node lock".to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
    }

    /// Acquires the lock only if it is free.
    pub fn try_acquire(&self) -> Result<bool, TreeError> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(TreeError::Disposed("lock object"));
        }
        if state.held {
            return Ok(false);
        }
        state.held = true;
        Ok(true)
    }

    /// Releases the lock and wakes one waiter.
    pub fn release(&self) {
        let mut state = self.state.lock();
        if !state.held {
            tracing::warn!("release of a lock object that is not held");
            return;
        }
        state.held = false;
        drop(state);
        self.cond.notify_one();
    }

    /// Returns true if some caller holds the lock
    pub fn is_held(&self) -> bool {
        self.state.lock().held
    }

    /// Marks the lock unusable and fails every waiter.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        state.disposed = true;
        state.held = false;
        drop(state);
        self.cond.notify_all();
    }

    /// Returns true once `dispose` has run
    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }
}

#[derive(Debug, Default)]
struct GateState {
    shared: usize,
    exclusive: bool,
    exclusive_waiting: usize,
}

/// Whole-tree reader/writer gate.
///
/// Transactions hold it shared while they hold node locks; the root lock holds
/// it exclusively. Waiting exclusive callers block new shared entries.
#[derive(Debug, Default)]
pub struct TreeGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

impl TreeGate {
    /// Creates an open gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters shared mode, waiting up to `timeout` for an exclusive holder to leave.
    pub fn enter_shared(&self, timeout: Duration) -> Result<(), TreeError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.exclusive || state.exclusive_waiting > 0 {
            if self.cond.wait_until(&mut state, deadline).timed_out()
                && (state.exclusive || state.exclusive_waiting > 0)
            {
                return Err(TreeError::LockTimeout {
                    what: "tree gate (shared)".to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
        state.shared += 1;
        Ok(())
    }

    /// Leaves shared mode.
    pub fn leave_shared(&self) {
        let mut state = self.state.lock();
        if state.shared == 0 {
            tracing::warn!("tree gate left in shared mode without being entered");
            return;
        }
        state.shared -= 1;
        let wake = state.shared == 0;
        drop(state);
        if wake {
            self.cond.notify_all();
        }
    }

    /// Enters exclusive mode, waiting up to `timeout` for every holder to leave.
    pub fn enter_exclusive(&self, timeout: Duration) -> Result<(), TreeError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.exclusive_waiting += 1;
        while state.exclusive || state.shared > 0 {
            if self.cond.wait_until(&mut state, deadline).timed_out()
                && (state.exclusive || state.shared > 0)
            {
                state.exclusive_waiting -= 1;
                drop(state);
                self.cond.notify_all();
                return Err(TreeError::LockTimeout {
                    what: "tree gate (exclusive)".to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
        state.exclusive_waiting -= 1;
        state.exclusive = true;
        Ok(())
    }

    /// Leaves exclusive mode. Fails if the gate is not held exclusively.
    pub fn leave_exclusive(&self) -> Result<(), TreeError> {
        let mut state = self.state.lock();
        if !state.exclusive {
            return Err(TreeError::InvalidState {
                op: "release root lock",
                state: "not held".to_string(),
            });
        }
        state.exclusive = false;
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    /// Returns true while some caller holds the gate exclusively
    pub fn is_exclusive(&self) -> bool {
        self.state.lock().exclusive
    }

    /// Number of shared holders
    pub fn shared_count(&self) -> usize {
        self.state.lock().shared
    }
}

/// Manual-reset event: once set, every current and future waiter returns until reset.
#[derive(Debug, Default)]
pub struct CompletionEvent {
    set: Mutex<bool>,
    cond: Condvar,
}

impl CompletionEvent {
    /// Creates an unset event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an event that is already set.
    pub fn new_set() -> Self {
        Self {
            set: Mutex::new(true),
            cond: Condvar::new(),
        }
    }

    /// Sets the event and wakes every waiter.
    pub fn set(&self) {
        *self.set.lock() = true;
        self.cond.notify_all();
    }

    /// Clears the event.
    pub fn reset(&self) {
        *self.set.lock() = false;
    }

    /// Returns true if the event is set
    pub fn is_set(&self) -> bool {
        *self.set.lock()
    }

    /// Blocks until the event is set.
    pub fn wait(&self) {
        let mut set = self.set.lock();
        while !*set {
            self.cond.wait(&mut set);
        }
    }

    /// Blocks until the event is set or `timeout` expires; returns whether it was set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = self.set.lock();
        while !*set {
            if self.cond.wait_until(&mut set, deadline).timed_out() {
                return *set;
            }
        }
        true
    }
}
