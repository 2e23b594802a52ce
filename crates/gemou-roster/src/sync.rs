//! Participant counter synchronization.
//!
//! This is the only writer of `Event::participant_count`. Every commit is a
//! full recount of the event's active rows (never a +1/-1 delta), applied in
//! the same write batch as the membership row that caused it.
//!
//! Callers must hold the event's lock from [`crate::locks::EventLocks`] and
//! pass the event as read inside that critical section; the commit fails with
//! [`Error::ConcurrencyConflict`] if another writer moved the revision since.

use crate::error::{Error, Result};
use crate::models::{Event, Participation};
use crate::storage::Storage;

/// Count the rows that contribute to the counter.
pub fn active_count<'a, I>(rows: I) -> usize
where
    I: IntoIterator<Item = &'a Participation>,
{
    rows.into_iter().filter(|row| row.is_active()).count()
}

/// Recompute the true active count of an event from the ledger.
pub fn recount(storage: &Storage, event_id: &str) -> Result<usize> {
    Ok(active_count(&storage.list_participations(event_id)?))
}

/// Commit one membership row together with the recounted counter.
///
/// Rejects the write with [`Error::CapacityExceeded`] when it would raise the
/// active count above capacity. Returns the committed event.
pub(crate) fn commit(storage: &Storage, event: &Event, row: &Participation) -> Result<Event> {
    let rows = storage.list_participations(&event.id)?;
    let before = active_count(&rows);
    let after = active_count(
        rows.iter()
            .filter(|existing| existing.user_id != row.user_id)
            .chain(std::iter::once(row)),
    );

    if after > before && after > event.capacity as usize {
        return Err(Error::CapacityExceeded {
            event_id: event.id.clone(),
            capacity: event.capacity,
        });
    }

    let next = counted(event, after);
    storage.compare_and_commit(event.revision, &next, Some(row))?;
    tracing::debug!(
        event_id = %event.id,
        user_id = %row.user_id,
        status = %row.status,
        count = after,
        revision = next.revision,
        "Counter synchronized"
    );
    Ok(next)
}

/// Recount and commit the counter with no membership change.
pub(crate) fn resync(storage: &Storage, event: &Event) -> Result<Event> {
    let actual = recount(storage, &event.id)?;
    let next = counted(event, actual);
    storage.compare_and_commit(event.revision, &next, None)?;
    tracing::debug!(
        event_id = %event.id,
        previous = event.participant_count,
        count = actual,
        revision = next.revision,
        "Counter resynchronized"
    );
    Ok(next)
}

fn counted(event: &Event, count: usize) -> Event {
    Event {
        participant_count: count as i64,
        revision: event.revision + 1,
        ..event.clone()
    }
}
