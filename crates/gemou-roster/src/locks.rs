//! Per-event exclusive locks.
//!
//! Operations on the same event serialize here for the whole
//! read-check-commit sequence; different events never contend.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

/// Idle entries are pruned once the table grows past this size.
const PRUNE_THRESHOLD: usize = 1024;

/// Held for the duration of one event's critical section.
pub type EventGuard = OwnedMutexGuard<()>;

/// Lock table keyed by event id.
#[derive(Debug, Default)]
pub struct EventLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl EventLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, event_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.len() > PRUNE_THRESHOLD {
            // An entry nobody else references has no holder and no waiter.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Arc::clone(locks.entry(event_id.to_string()).or_default())
    }

    /// Enter the critical section for `event_id`.
    ///
    /// Fails with [`Error::Cancelled`] if `cancel` fires first, or
    /// [`Error::TimedOut`] if the lock is not acquired within `timeout`.
    pub async fn acquire(
        &self,
        event_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<EventGuard> {
        let lock = self.slot(event_id);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            acquired = tokio::time::timeout(timeout, lock.lock_owned()) => {
                acquired.map_err(|_| Error::TimedOut(event_id.to_string()))
            }
        }
    }

    /// Number of tracked events.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
