//! Bounded-wait mutual exclusion for structural index mutation.
//!
//! The index layer performs no internal locking. Callers acquire an
//! exclusive lock around structural mutation (insert/delete/save) and may
//! run read-only traversals under a shared lock. Waiting is bounded: an
//! acquisition that cannot be granted within its ceiling fails with
//! [`SpatialError::LockTimeout`] instead of blocking forever, so a steady
//! stream of short-lived shared holders can starve a pending writer only
//! until the writer's ceiling is hit.
//!
//! Timeout applies to acquisition only; a granted lock carries no expiry.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::errors::{SpatialError, SpatialResult};

/// Polling interval between predicate re-checks.
pub const WAIT_INTERVAL: Duration = Duration::from_millis(500);

/// Number of intervals an exclusive acquisition waits (~10 s ceiling).
pub const EXCLUSIVE_WAIT_ROUNDS: u32 = 20;

/// Number of intervals a shared acquisition waits (~5 s ceiling).
pub const SHARED_WAIT_ROUNDS: u32 = 10;

/// The kind of access a granted lock permits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    /// Excludes all other holders.
    Exclusive,
    /// Coexists with any number of other shared holders.
    Shared,
}

/// An opaque capability returned by [`LockManager`] and presented back to
/// [`LockManager::release`]. Not cloneable: consuming it on release enforces
/// release-exactly-once.
#[derive(Debug)]
pub struct Lock {
    kind: LockKind,
    id: u64,
}

impl Lock {
    pub fn kind(&self) -> LockKind {
        self.kind
    }
}

struct LockState {
    /// The single exclusive holder, if any. Non-`None` implies
    /// `leases == 0`.
    exclusive: Option<u64>,
    /// Count of active shared holders.
    leases: usize,
    next_id: u64,
}

struct LockManagerInner {
    state: Mutex<LockState>,
    available: Condvar,
    interval: Duration,
    exclusive_rounds: u32,
    shared_rounds: u32,
}

/// Coordinates exclusive vs. shared access to one spatial index.
///
/// One explicit shared instance, guarded by a single mutex plus a condition
/// variable. Cloning yields a handle to the same manager.
///
/// # Examples
///
/// ```
/// use spatial_store::LockManager;
///
/// let manager = LockManager::new();
/// let lock = manager.acquire_exclusive().unwrap();
/// // ... structural mutation ...
/// manager.release(lock);
/// ```
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<LockManagerInner>,
}

impl LockManager {
    /// Creates a lock manager with the default wait ceilings
    /// (20 × 500 ms exclusive, 10 × 500 ms shared).
    pub fn new() -> LockManager {
        Self::with_timing(WAIT_INTERVAL, EXCLUSIVE_WAIT_ROUNDS, SHARED_WAIT_ROUNDS)
    }

    /// Creates a lock manager with custom wait timing. Shortened timings
    /// keep contention tests fast.
    pub fn with_timing(
        interval: Duration,
        exclusive_rounds: u32,
        shared_rounds: u32,
    ) -> LockManager {
        LockManager {
            inner: Arc::new(LockManagerInner {
                state: Mutex::new(LockState {
                    exclusive: None,
                    leases: 0,
                    next_id: 1,
                }),
                available: Condvar::new(),
                interval,
                exclusive_rounds,
                shared_rounds,
            }),
        }
    }

    /// Acquires the exclusive lock, waiting while any holder (exclusive or
    /// shared) is active. Fails with [`SpatialError::LockTimeout`] once the
    /// wait ceiling is exhausted.
    pub fn acquire_exclusive(&self) -> SpatialResult<Lock> {
        let mut state = self.inner.state.lock();
        let mut rounds = 0;

        while state.exclusive.is_some() || state.leases > 0 {
            if rounds >= self.inner.exclusive_rounds {
                let waited = self.inner.interval * rounds;
                log::warn!("exclusive lock acquisition timed out after {waited:?}");
                return Err(SpatialError::LockTimeout { waited });
            }
            let _ = self
                .inner
                .available
                .wait_for(&mut state, self.inner.interval);
            rounds += 1;
        }

        let id = state.next_id;
        state.next_id += 1;
        state.exclusive = Some(id);
        Ok(Lock {
            kind: LockKind::Exclusive,
            id,
        })
    }

    /// Acquires a shared lock, waiting only while the exclusive lock is
    /// held. Any number of shared leases may coexist.
    pub fn acquire_shared(&self) -> SpatialResult<Lock> {
        let mut state = self.inner.state.lock();
        let mut rounds = 0;

        while state.exclusive.is_some() {
            if rounds >= self.inner.shared_rounds {
                let waited = self.inner.interval * rounds;
                log::warn!("shared lock acquisition timed out after {waited:?}");
                return Err(SpatialError::LockTimeout { waited });
            }
            let _ = self
                .inner
                .available
                .wait_for(&mut state, self.inner.interval);
            rounds += 1;
        }

        let id = state.next_id;
        state.next_id += 1;
        state.leases += 1;
        Ok(Lock {
            kind: LockKind::Shared,
            id,
        })
    }

    /// Releases a previously granted lock and wakes all waiters, so every
    /// blocked acquirer re-checks the predicate.
    pub fn release(&self, lock: Lock) {
        let mut state = self.inner.state.lock();
        match lock.kind {
            LockKind::Exclusive => {
                if state.exclusive == Some(lock.id) {
                    state.exclusive = None;
                }
            }
            LockKind::Shared => {
                state.leases = state.leases.saturating_sub(1);
            }
        }
        drop(state);
        self.inner.available.notify_all();
    }

    /// Whether the exclusive lock is currently held.
    pub fn is_exclusive_held(&self) -> bool {
        self.inner.state.lock().exclusive.is_some()
    }

    /// Number of active shared leases.
    pub fn lease_count(&self) -> usize {
        self.inner.state.lock().leases
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
