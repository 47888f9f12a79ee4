//! In-process lock table serializing work on overlapping contact clusters.
//!
//! # Responsibility
//! - Grant a set of cluster keys all-or-nothing to one caller at a time.
//! - Release keys when the returned guard drops.
//!
//! # Invariants
//! - A key is held by at most one guard.
//! - Acquisition never holds a partial key set, so lock order cannot deadlock.
//! - Disjoint key sets are granted concurrently.

use crate::model::contact::ContactId;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Identity of something a resolve call reads and may rewrite.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClusterKey {
    /// Cluster rooted at this primary contact.
    Primary(ContactId),
    /// Exact email identifier, covering clusters that do not exist yet.
    Email(String),
    /// Exact phone identifier, covering clusters that do not exist yet.
    Phone(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("timed out after {waited_ms} ms waiting for {key_count} cluster key(s)")]
    Timeout { waited_ms: u128, key_count: usize },
}

/// Shared lock table. Wrap in `Arc` and hand the same instance to every
/// service that writes to the same database.
#[derive(Debug, Default)]
pub struct ClusterLocks {
    held: Mutex<HashSet<ClusterKey>>,
    released: Condvar,
}

/// Holds a key set until dropped.
#[derive(Debug)]
pub struct ClusterLockGuard<'a> {
    locks: &'a ClusterLocks,
    keys: BTreeSet<ClusterKey>,
}

impl ClusterLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until no key in `keys` is held, then takes all of them.
    ///
    /// # Errors
    /// - `LockError::Timeout` when the set is not free within `timeout`.
    pub fn acquire(
        &self,
        keys: BTreeSet<ClusterKey>,
        timeout: Duration,
    ) -> Result<ClusterLockGuard<'_>, LockError> {
        let started_at = Instant::now();
        let mut held = self.lock_held();

        while keys.iter().any(|key| held.contains(key)) {
            let elapsed = started_at.elapsed();
            let Some(remaining) = timeout.checked_sub(elapsed).filter(|left| !left.is_zero())
            else {
                return Err(LockError::Timeout {
                    waited_ms: elapsed.as_millis(),
                    key_count: keys.len(),
                });
            };
            held = self
                .released
                .wait_timeout(held, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        held.extend(keys.iter().cloned());
        Ok(ClusterLockGuard { locks: self, keys })
    }

    /// Returns whether `key` is currently held by any guard.
    pub fn is_held(&self, key: &ClusterKey) -> bool {
        self.lock_held().contains(key)
    }

    // The table only records key ownership; a panic while it was locked
    // cannot leave it half-updated, so poisoning is ignored.
    fn lock_held(&self) -> MutexGuard<'_, HashSet<ClusterKey>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ClusterLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.lock_held();
        for key in &self.keys {
            held.remove(key);
        }
        drop(held);
        self.locks.released.notify_all();
    }
}
