//! Participation ledger.
//!
//! The authoritative set of (event, user) membership rows. Every mutation runs
//! inside the event's critical section:
//!
//! 1. take the per-event lock
//! 2. read the event and the user's current row
//! 3. decide the next row from the transition rules
//! 4. commit the row and the recounted counter in one batch ([`crate::sync`])
//!
//! Revision conflicts (a writer outside this process, or another `Ledger` on
//! the same storage) are retried with [`RetryPolicy`]; everything else is
//! returned to the caller as-is.
//!
//! Duplicate joins are rejected with [`Error::AlreadyActive`]; leaving a
//! membership that is not active is rejected with [`Error::NotActive`].

use crate::auditor::Auditor;
use crate::error::{Error, Result};
use crate::locks::EventLocks;
use crate::models::{now_millis, Event, Participation, ParticipationStatus};
use crate::retry::RetryPolicy;
use crate::storage::Storage;
use crate::sync;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Ledger tuning.
#[derive(Debug, Clone, Copy)]
pub struct LedgerConfig {
    /// Max wait to enter an event's critical section
    pub lock_timeout: Duration,
    /// Retry policy for concurrency conflicts
    pub retry: RetryPolicy,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of a committed membership change.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Membership {
    /// The row as written
    pub participation: Participation,
    /// The event as written, with its synchronized counter
    pub event: Event,
}

/// Membership transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Join,
    Leave,
    Request,
    Approve,
}

impl Transition {
    fn name(self) -> &'static str {
        match self {
            Transition::Join => "join",
            Transition::Leave => "leave",
            Transition::Request => "request",
            Transition::Approve => "approve",
        }
    }

    /// The row this transition produces from the current one.
    fn apply(
        self,
        current: Option<&Participation>,
        event_id: &str,
        user_id: &str,
        now: u64,
    ) -> Result<Participation> {
        use ParticipationStatus::*;

        let status = current.map(|row| row.status);
        let target = match (self, status) {
            (Transition::Join, Some(Active)) | (Transition::Request, Some(Active)) => {
                return Err(Error::AlreadyActive {
                    event_id: event_id.to_string(),
                    user_id: user_id.to_string(),
                })
            }
            (Transition::Join, None | Some(Left) | Some(Pending)) => Active,

            (Transition::Leave, Some(Active)) => Left,
            (Transition::Leave, _) => {
                return Err(Error::NotActive {
                    event_id: event_id.to_string(),
                    user_id: user_id.to_string(),
                })
            }

            (Transition::Request, Some(Pending)) => {
                return Err(Error::AlreadyPending {
                    event_id: event_id.to_string(),
                    user_id: user_id.to_string(),
                })
            }
            (Transition::Request, None | Some(Left)) => Pending,

            (Transition::Approve, Some(Pending)) => Active,
            (Transition::Approve, _) => {
                return Err(Error::NotPending {
                    event_id: event_id.to_string(),
                    user_id: user_id.to_string(),
                })
            }
        };

        Ok(match current {
            Some(row) => row.transition(target, now),
            None => Participation::new(event_id.to_string(), user_id.to_string(), target, now),
        })
    }
}

/// The participation ledger.
#[derive(Clone)]
pub struct Ledger {
    storage: Arc<Storage>,
    locks: Arc<EventLocks>,
    config: LedgerConfig,
}

impl Ledger {
    /// Create a ledger with its own lock table.
    pub fn new(storage: Arc<Storage>, config: LedgerConfig) -> Self {
        Self::with_locks(storage, Arc::new(EventLocks::new()), config)
    }

    /// Create a ledger sharing an existing lock table.
    pub fn with_locks(storage: Arc<Storage>, locks: Arc<EventLocks>, config: LedgerConfig) -> Self {
        Self {
            storage,
            locks,
            config,
        }
    }

    /// An auditor over the same storage and lock table.
    pub fn auditor(&self) -> Auditor {
        Auditor::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.locks),
            self.config.lock_timeout,
        )
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    // --- Events ---

    /// Create an event with an empty counter.
    pub fn create_event(&self, id: &str, title: &str, capacity: u32) -> Result<Event> {
        let event = Event::new(id.to_string(), title.to_string(), capacity);
        self.storage.create_event(&event)?;
        tracing::info!(event_id = %event.id, capacity, "Created event");
        Ok(event)
    }

    /// Look up an event.
    pub fn event(&self, event_id: &str) -> Result<Event> {
        self.storage
            .get_event(event_id)?
            .ok_or_else(|| Error::EventNotFound(event_id.to_string()))
    }

    // --- Membership ---

    /// Join an event. Creates an active row, or reactivates a left or pending one.
    pub async fn join(
        &self,
        event_id: &str,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Membership> {
        self.mutate(Transition::Join, event_id, user_id, cancel).await
    }

    /// Leave an event. Only an active row can leave.
    pub async fn leave(
        &self,
        event_id: &str,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Membership> {
        self.mutate(Transition::Leave, event_id, user_id, cancel).await
    }

    /// Ask to join an event that requires approval. The row stays pending and
    /// does not count.
    pub async fn request(
        &self,
        event_id: &str,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Membership> {
        self.mutate(Transition::Request, event_id, user_id, cancel).await
    }

    /// Approve a pending request, subject to capacity.
    pub async fn approve(
        &self,
        event_id: &str,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Membership> {
        self.mutate(Transition::Approve, event_id, user_id, cancel).await
    }

    /// User ids with an active row for the event. This is the ground truth the
    /// counter is checked against.
    pub fn list_active(&self, event_id: &str) -> Result<BTreeSet<String>> {
        self.event(event_id)?;
        Ok(self
            .storage
            .list_participations(event_id)?
            .into_iter()
            .filter(Participation::is_active)
            .map(|row| row.user_id)
            .collect())
    }

    /// Every row of the event, whatever its status.
    pub fn participations(&self, event_id: &str) -> Result<Vec<Participation>> {
        self.event(event_id)?;
        self.storage.list_participations(event_id)
    }

    async fn mutate(
        &self,
        transition: Transition,
        event_id: &str,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Membership> {
        if user_id.is_empty() {
            return Err(Error::InvalidInput("user id must not be empty".into()));
        }
        Event::validate_id(event_id)?;

        let retry = self.config.retry;
        let mut attempt = 1;
        loop {
            match self.try_mutate(transition, event_id, user_id, cancel).await {
                Err(err) if retry.should_retry(attempt, &err) => {
                    tracing::warn!(
                        event_id,
                        user_id,
                        op = transition.name(),
                        attempt,
                        "Concurrent update, retrying"
                    );
                    retry.pause(attempt, cancel).await?;
                    attempt += 1;
                }
                Err(Error::ConcurrencyConflict { event_id, .. }) => {
                    return Err(Error::ConcurrencyConflict {
                        event_id,
                        attempts: attempt,
                    });
                }
                other => return other,
            }
        }
    }

    async fn try_mutate(
        &self,
        transition: Transition,
        event_id: &str,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Membership> {
        let _guard = self
            .locks
            .acquire(event_id, self.config.lock_timeout, cancel)
            .await?;

        let event = self.event(event_id)?;
        let current = self.storage.get_participation(event_id, user_id)?;
        let row = transition.apply(current.as_ref(), event_id, user_id, now_millis())?;

        // Last point at which cancellation leaves no trace.
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let event = sync::commit(&self.storage, &event, &row)?;
        tracing::info!(
            event_id,
            user_id,
            op = transition.name(),
            status = %row.status,
            count = event.participant_count,
            capacity = event.capacity,
            "Membership updated"
        );

        Ok(Membership {
            participation: row,
            event,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup(capacity: u32) -> (tempfile::TempDir, Ledger) {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let ledger = Ledger::new(storage, LedgerConfig::default());
        ledger.create_event("e", "Board game night", capacity).unwrap();
        (dir, ledger)
    }

    fn count(ledger: &Ledger) -> i64 {
        ledger.event("e").unwrap().participant_count
    }

    #[tokio::test]
    async fn capacity_two_scenario() {
        let (_dir, ledger) = setup(2);
        let cancel = CancellationToken::new();

        let m = ledger.join("e", "alice", &cancel).await.unwrap();
        assert_eq!(m.event.participant_count, 1);
        let m = ledger.join("e", "bob", &cancel).await.unwrap();
        assert_eq!(m.event.participant_count, 2);

        let rejected = ledger.join("e", "carol", &cancel).await;
        assert!(matches!(
            rejected,
            Err(Error::CapacityExceeded { capacity: 2, .. })
        ));
        assert_eq!(count(&ledger), 2);

        let m = ledger.leave("e", "alice", &cancel).await.unwrap();
        assert_eq!(m.event.participant_count, 1);
        let m = ledger.join("e", "carol", &cancel).await.unwrap();
        assert_eq!(m.event.participant_count, 2);

        let active: Vec<_> = ledger.list_active("e").unwrap().into_iter().collect();
        assert_eq!(active, vec!["bob".to_string(), "carol".to_string()]);
    }

    #[tokio::test]
    async fn rejected_join_leaves_no_row() {
        let (_dir, ledger) = setup(1);
        let cancel = CancellationToken::new();

        ledger.join("e", "alice", &cancel).await.unwrap();
        let before = ledger.event("e").unwrap();
        assert!(ledger.join("e", "bob", &cancel).await.is_err());
        assert!(ledger.storage().get_participation("e", "bob").unwrap().is_none());
        assert_eq!(ledger.event("e").unwrap(), before);
    }

    #[tokio::test]
    async fn duplicate_join_rejected() {
        let (_dir, ledger) = setup(3);
        let cancel = CancellationToken::new();

        ledger.join("e", "alice", &cancel).await.unwrap();
        let again = ledger.join("e", "alice", &cancel).await;
        assert!(matches!(again, Err(Error::AlreadyActive { .. })));
        assert_eq!(count(&ledger), 1);
    }

    #[tokio::test]
    async fn leave_twice_does_not_double_decrement() {
        let (_dir, ledger) = setup(3);
        let cancel = CancellationToken::new();

        ledger.join("e", "alice", &cancel).await.unwrap();
        ledger.join("e", "bob", &cancel).await.unwrap();
        ledger.leave("e", "alice", &cancel).await.unwrap();
        let after_first = ledger.event("e").unwrap();

        let second = ledger.leave("e", "alice", &cancel).await;
        assert!(matches!(second, Err(Error::NotActive { .. })));
        assert_eq!(ledger.event("e").unwrap(), after_first);
        assert_eq!(after_first.participant_count, 1);
    }

    #[tokio::test]
    async fn leave_without_row_rejected() {
        let (_dir, ledger) = setup(3);
        let cancel = CancellationToken::new();

        let result = ledger.leave("e", "nobody", &cancel).await;
        assert!(matches!(result, Err(Error::NotActive { .. })));
        assert_eq!(count(&ledger), 0);
    }

    #[tokio::test]
    async fn rejoin_keeps_history() {
        let (_dir, ledger) = setup(3);
        let cancel = CancellationToken::new();

        let first = ledger.join("e", "alice", &cancel).await.unwrap();
        ledger.leave("e", "alice", &cancel).await.unwrap();
        let again = ledger.join("e", "alice", &cancel).await.unwrap();

        assert_eq!(again.participation.joined_at, first.participation.joined_at);
        assert_eq!(again.participation.status, ParticipationStatus::Active);
        assert_eq!(ledger.participations("e").unwrap().len(), 1);
        assert_eq!(count(&ledger), 1);
    }

    #[tokio::test]
    async fn pending_does_not_count_until_approved() {
        let (_dir, ledger) = setup(1);
        let cancel = CancellationToken::new();

        let m = ledger.request("e", "alice", &cancel).await.unwrap();
        assert_eq!(m.participation.status, ParticipationStatus::Pending);
        assert_eq!(m.event.participant_count, 0);
        assert!(ledger.list_active("e").unwrap().is_empty());

        ledger.request("e", "bob", &cancel).await.unwrap();
        assert!(matches!(
            ledger.request("e", "bob", &cancel).await,
            Err(Error::AlreadyPending { .. })
        ));

        let m = ledger.approve("e", "alice", &cancel).await.unwrap();
        assert_eq!(m.event.participant_count, 1);

        // Full: approval obeys capacity like a join.
        assert!(matches!(
            ledger.approve("e", "bob", &cancel).await,
            Err(Error::CapacityExceeded { .. })
        ));
        assert_eq!(
            ledger
                .storage()
                .get_participation("e", "bob")
                .unwrap()
                .unwrap()
                .status,
            ParticipationStatus::Pending
        );
    }

    #[tokio::test]
    async fn approve_requires_pending() {
        let (_dir, ledger) = setup(2);
        let cancel = CancellationToken::new();

        assert!(matches!(
            ledger.approve("e", "alice", &cancel).await,
            Err(Error::NotPending { .. })
        ));
        ledger.join("e", "alice", &cancel).await.unwrap();
        assert!(matches!(
            ledger.approve("e", "alice", &cancel).await,
            Err(Error::NotPending { .. })
        ));
        assert!(matches!(
            ledger.request("e", "alice", &cancel).await,
            Err(Error::AlreadyActive { .. })
        ));
    }

    #[tokio::test]
    async fn join_promotes_pending() {
        let (_dir, ledger) = setup(2);
        let cancel = CancellationToken::new();

        ledger.request("e", "alice", &cancel).await.unwrap();
        let m = ledger.join("e", "alice", &cancel).await.unwrap();
        assert_eq!(m.participation.status, ParticipationStatus::Active);
        assert_eq!(m.event.participant_count, 1);
    }

    #[tokio::test]
    async fn unknown_event() {
        let (_dir, ledger) = setup(2);
        let cancel = CancellationToken::new();

        assert!(matches!(
            ledger.join("missing", "alice", &cancel).await,
            Err(Error::EventNotFound(id)) if id == "missing"
        ));
        assert!(matches!(
            ledger.list_active("missing"),
            Err(Error::EventNotFound(_))
        ));
    }

    #[tokio::test]
    async fn invalid_ids_rejected() {
        let (_dir, ledger) = setup(2);
        let cancel = CancellationToken::new();

        assert!(matches!(
            ledger.join("e", "", &cancel).await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            ledger.join("a:b", "alice", &cancel).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn cancelled_join_writes_nothing() {
        let (_dir, ledger) = setup(2);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = ledger.join("e", "alice", &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(ledger.storage().get_participation("e", "alice").unwrap().is_none());
        assert_eq!(ledger.event("e").unwrap().revision, 0);
    }

    #[tokio::test]
    async fn lock_timeout_surfaces() {
        let dir = tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let locks = Arc::new(EventLocks::new());
        let config = LedgerConfig {
            lock_timeout: Duration::from_millis(20),
            ..LedgerConfig::default()
        };
        let ledger = Ledger::with_locks(storage, Arc::clone(&locks), config);
        ledger.create_event("e", "E", 2).unwrap();

        let cancel = CancellationToken::new();
        let _held = locks
            .acquire("e", Duration::from_secs(1), &cancel)
            .await
            .unwrap();
        assert!(matches!(
            ledger.join("e", "alice", &cancel).await,
            Err(Error::TimedOut(_))
        ));
        assert_eq!(count(&ledger), 0);
    }

    #[tokio::test]
    async fn join_repairs_prior_drift() {
        let (_dir, ledger) = setup(3);
        let cancel = CancellationToken::new();

        let mut drifted = ledger.event("e").unwrap();
        drifted.participant_count = 7;
        ledger.storage().put_event_unsynced(&drifted).unwrap();

        let m = ledger.join("e", "alice", &cancel).await.unwrap();
        assert_eq!(m.event.participant_count, 1);
    }

    #[test]
    fn transition_table() {
        use ParticipationStatus::*;
        let row = |status| Participation::new("e".into(), "u".into(), status, 1);

        assert_eq!(
            Transition::Join.apply(None, "e", "u", 5).unwrap().status,
            Active
        );
        assert_eq!(
            Transition::Join.apply(Some(&row(Left)), "e", "u", 5).unwrap().status,
            Active
        );
        assert_eq!(
            Transition::Leave.apply(Some(&row(Active)), "e", "u", 5).unwrap().status,
            Left
        );
        assert!(Transition::Leave.apply(Some(&row(Pending)), "e", "u", 5).is_err());
        assert_eq!(
            Transition::Request.apply(Some(&row(Left)), "e", "u", 5).unwrap().status,
            Pending
        );
        assert!(Transition::Approve.apply(None, "e", "u", 5).is_err());
    }
}
