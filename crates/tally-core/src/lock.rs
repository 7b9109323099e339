//! Cooperative per-group mutual exclusion.
//!
//! The reduce engine serializes work per group identifier: acquisition
//! suspends the caller until the current holder releases, and release is
//! guaranteed on every exit path because the guard releases on drop.
//!
//! Locks are process-local. Cross-process isolation comes from the
//! deployment shape: one app instance owns each input partition, so two
//! instances never process the same group.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Registry of per-group async locks.
///
/// Entries are created on first acquisition and pruned once no task holds
/// or waits on them.
#[derive(Debug, Default)]
pub struct GroupLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl GroupLocks {
    /// Creates an empty lock registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for a group, suspending until it is free.
    ///
    /// The returned guard releases the lock when dropped.
    pub async fn acquire(&self, group: &str) -> GroupGuard {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            // Prune entries nobody holds or waits on.
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            Arc::clone(
                locks
                    .entry(group.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let guard = lock.lock_owned().await;
        GroupGuard {
            group: group.to_string(),
            _guard: guard,
        }
    }

    /// Returns the number of live lock entries (held or awaited).
    ///
    /// # Panics
    ///
    /// Never panics; a poisoned registry lock is recovered.
    #[must_use]
    pub fn len(&self) -> usize {
        let locks = self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        locks.values().filter(|l| Arc::strong_count(l) > 1).count()
    }

    /// Returns true when no group lock is held or awaited.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// RAII guard for a held group lock.
///
/// The lock is released when the guard is dropped.
#[derive(Debug)]
pub struct GroupGuard {
    group: String,
    _guard: OwnedMutexGuard<()>,
}

impl GroupGuard {
    /// Returns the group this guard holds the lock for.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }
}
