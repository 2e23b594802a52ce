//! Persistent storage using RocksDB.
//!
//! Keys:
//! - `event:{id}` -> [`Event`]
//! - `participation:{event_id}:{user_id}` -> [`Participation`]
//!
//! Counter writes go through [`Storage::compare_and_commit`], which applies the
//! participation row and the event record as one write batch, guarded by the
//! event revision.

use crate::error::{Error, Result};
use crate::models::{Event, Participation};
use rocksdb::{Options, WriteBatch, DB};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const EVENT_PREFIX: &str = "event:";
const PARTICIPATION_PREFIX: &str = "participation:";

/// Re-reads allowed when an event moves while its rows are being read.
const SNAPSHOT_READ_ATTEMPTS: usize = 3;

fn event_key(id: &str) -> String {
    format!("{}{}", EVENT_PREFIX, id)
}

fn participation_prefix(event_id: &str) -> String {
    format!("{}{}:", PARTICIPATION_PREFIX, event_id)
}

fn participation_key(event_id: &str, user_id: &str) -> String {
    format!("{}{}", participation_prefix(event_id), user_id)
}

/// Storage backend for events and the participation ledger.
pub struct Storage {
    db: DB,
    /// Serializes compare-and-commit so the revision check and the batch write are atomic.
    write_lock: Mutex<()>,
}

impl Storage {
    /// Open or create storage at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        // The guarded section holds no data, so a poisoned lock is still usable.
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- Events ---

    /// Insert a new event. Fails if the id is taken.
    pub fn create_event(&self, event: &Event) -> Result<()> {
        event.validate_new()?;
        let key = event_key(&event.id);
        let _guard = self.lock_writes();
        if self.db.get(key.as_bytes())?.is_some() {
            return Err(Error::InvalidInput(format!(
                "event already exists: {}",
                event.id
            )));
        }
        self.db.put(key.as_bytes(), serde_json::to_vec(event)?)?;
        Ok(())
    }

    /// Get an event by ID.
    pub fn get_event(&self, id: &str) -> Result<Option<Event>> {
        match self.db.get(event_key(id).as_bytes())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Lazily iterate over all events in key order.
    pub fn events(&self) -> impl Iterator<Item = Result<Event>> + '_ {
        let prefix = EVENT_PREFIX.as_bytes();
        self.db
            .prefix_iterator(prefix)
            .map_while(move |item| match item {
                Ok((key, value)) if key.starts_with(prefix) => {
                    Some(serde_json::from_slice(&value).map_err(Error::from))
                }
                Ok(_) => None,
                Err(e) => Some(Err(e.into())),
            })
    }

    /// List all events.
    pub fn list_events(&self) -> Result<Vec<Event>> {
        self.events().collect()
    }

    // --- Participations ---

    /// Get one participation row.
    pub fn get_participation(&self, event_id: &str, user_id: &str) -> Result<Option<Participation>> {
        match self.db.get(participation_key(event_id, user_id).as_bytes())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// List every participation row of an event, whatever its status.
    pub fn list_participations(&self, event_id: &str) -> Result<Vec<Participation>> {
        let prefix = participation_prefix(event_id);
        let prefix = prefix.as_bytes();
        let mut rows = Vec::new();

        let iter = self.db.prefix_iterator(prefix);
        for item in iter {
            let (key, value) = item?;
            if key.starts_with(prefix) {
                rows.push(serde_json::from_slice(&value)?);
            } else {
                break;
            }
        }

        Ok(rows)
    }

    /// Read an event together with its rows as of one revision.
    ///
    /// The event is read before and after the rows; if the revision moved the
    /// read is retried. After the last attempt the latest read is returned as-is.
    pub fn event_with_participations(
        &self,
        event_id: &str,
    ) -> Result<Option<(Event, Vec<Participation>)>> {
        let mut last = None;
        for _ in 0..SNAPSHOT_READ_ATTEMPTS {
            let Some(before) = self.get_event(event_id)? else {
                return Ok(None);
            };
            let rows = self.list_participations(event_id)?;
            let after = self.get_event(event_id)?;
            match after {
                Some(after) if after.revision == before.revision => {
                    return Ok(Some((after, rows)));
                }
                Some(after) => last = Some((after, rows)),
                None => return Ok(None),
            }
        }
        Ok(last)
    }

    // --- Counter commits ---

    /// Atomically write `event` (and optionally one participation row) if the
    /// stored revision still equals `expected_revision`.
    ///
    /// Only the counter synchronization routine calls this.
    pub(crate) fn compare_and_commit(
        &self,
        expected_revision: u64,
        event: &Event,
        participation: Option<&Participation>,
    ) -> Result<()> {
        let key = event_key(&event.id);
        let _guard = self.lock_writes();

        let current: Event = match self.db.get(key.as_bytes())? {
            Some(data) => serde_json::from_slice(&data)?,
            None => return Err(Error::EventNotFound(event.id.clone())),
        };
        if current.revision != expected_revision {
            return Err(Error::ConcurrencyConflict {
                event_id: event.id.clone(),
                attempts: 1,
            });
        }

        let mut batch = WriteBatch::default();
        if let Some(row) = participation {
            batch.put(
                participation_key(&row.event_id, &row.user_id).as_bytes(),
                serde_json::to_vec(row)?,
            );
        }
        batch.put(key.as_bytes(), serde_json::to_vec(event)?);
        self.db.write(batch)?;
        Ok(())
    }

    // --- Raw writes bypassing synchronization (drift simulation) ---

    #[cfg(test)]
    pub(crate) fn put_event_unsynced(&self, event: &Event) -> Result<()> {
        self.db
            .put(event_key(&event.id).as_bytes(), serde_json::to_vec(event)?)?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn put_participation_unsynced(&self, row: &Participation) -> Result<()> {
        self.db.put(
            participation_key(&row.event_id, &row.user_id).as_bytes(),
            serde_json::to_vec(row)?,
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn put_participation_raw(
        &self,
        event_id: &str,
        user_id: &str,
        value: &[u8],
    ) -> Result<()> {
        self.db
            .put(participation_key(event_id, user_id).as_bytes(), value)?;
        Ok(())
    }
}
