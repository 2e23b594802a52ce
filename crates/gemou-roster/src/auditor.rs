//! Consistency auditor.
//!
//! Compares each event's stored `participant_count` against the active rows
//! of the ledger and repairs drift. The scan is lazy, holds no state between
//! calls, and never takes locks; repairs do, one event at a time.

use crate::error::{Error, Result};
use crate::locks::EventLocks;
use crate::models::Event;
use crate::storage::Storage;
use crate::sync;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What is wrong with an event's counter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Violation {
    /// Stored count differs from the active row count
    CountMismatch,
    /// Stored count is negative
    NegativeCount,
    /// Stored count is above capacity
    OverCapacity,
}

/// One inconsistent event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Inconsistency {
    pub event_id: String,
    pub stored_count: i64,
    pub actual_count: usize,
    pub capacity: u32,
    /// Event revision the report was taken at
    pub revision: u64,
    pub violations: Vec<Violation>,
}

impl Inconsistency {
    /// Evaluate an event against its true active count; `None` if consistent.
    pub fn evaluate(event: &Event, actual_count: usize) -> Option<Self> {
        let mut violations = Vec::new();
        if event.participant_count != actual_count as i64 {
            violations.push(Violation::CountMismatch);
        }
        if event.participant_count < 0 {
            violations.push(Violation::NegativeCount);
        }
        if event.participant_count > i64::from(event.capacity) {
            violations.push(Violation::OverCapacity);
        }

        if violations.is_empty() {
            return None;
        }
        Some(Self {
            event_id: event.id.clone(),
            stored_count: event.participant_count,
            actual_count,
            capacity: event.capacity,
            revision: event.revision,
            violations,
        })
    }

    /// Whether a recount would change the stored value.
    pub fn is_drift(&self) -> bool {
        self.violations.contains(&Violation::CountMismatch)
    }
}

/// An event the reconcile pass could not check or repair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepairFailure {
    /// Empty only when the event record itself could not be decoded
    pub event_id: String,
    pub reason: String,
}

/// Outcome of [`Auditor::reconcile_all`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReconcileSummary {
    /// Events whose counters were checked
    pub scanned: usize,
    /// Events reported inconsistent
    pub inconsistent: usize,
    /// Events whose counters were rewritten
    pub repaired: usize,
    /// Events that could not be checked or repaired; safe to retry
    pub failures: Vec<RepairFailure>,
    /// Whether the pass stopped early on cancellation
    pub cancelled: bool,
}

impl ReconcileSummary {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Lazy pass over all events yielding the inconsistent ones.
pub struct AuditScan<'a> {
    storage: &'a Storage,
    events: Box<dyn Iterator<Item = Result<Event>> + 'a>,
    scanned: usize,
    current: Option<String>,
}

impl AuditScan<'_> {
    /// Events examined so far.
    pub fn scanned(&self) -> usize {
        self.scanned
    }

    /// Event the most recently yielded item belongs to, if it is known.
    pub fn current_event(&self) -> Option<&str> {
        self.current.as_deref()
    }

    fn check(&self, event: &Event) -> Result<Option<Inconsistency>> {
        let Some((event, rows)) = self.storage.event_with_participations(&event.id)? else {
            // Listed but gone by the time we looked.
            return Ok(None);
        };
        Ok(Inconsistency::evaluate(&event, sync::active_count(&rows)))
    }
}

impl Iterator for AuditScan<'_> {
    type Item = Result<Inconsistency>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.current = None;
            let event = match self.events.next()? {
                Ok(event) => event,
                Err(e) => return Some(Err(e)),
            };
            self.scanned += 1;
            self.current = Some(event.id.clone());
            match self.check(&event) {
                Ok(Some(report)) => return Some(Ok(report)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Consistency auditor over a storage and lock table.
#[derive(Clone)]
pub struct Auditor {
    storage: Arc<Storage>,
    locks: Arc<EventLocks>,
    lock_timeout: Duration,
}

impl Auditor {
    /// Create an auditor. Share `locks` with the ledger so repairs serialize
    /// against membership changes.
    pub fn new(storage: Arc<Storage>, locks: Arc<EventLocks>, lock_timeout: Duration) -> Self {
        Self {
            storage,
            locks,
            lock_timeout,
        }
    }

    /// Scan all events for counter inconsistencies.
    pub fn check_consistency(&self) -> AuditScan<'_> {
        AuditScan {
            storage: self.storage.as_ref(),
            events: Box::new(self.storage.events()),
            scanned: 0,
            current: None,
        }
    }

    /// Check a single event.
    pub fn check_event(&self, event_id: &str) -> Result<Option<Inconsistency>> {
        let (event, rows) = self
            .storage
            .event_with_participations(event_id)?
            .ok_or_else(|| Error::EventNotFound(event_id.to_string()))?;
        Ok(Inconsistency::evaluate(&event, sync::active_count(&rows)))
    }

    /// Rewrite one reported event's counter from the ledger.
    ///
    /// Fails with [`Error::ConcurrencyConflict`] if the event changed since the
    /// report was taken; re-check and retry in that case.
    pub async fn repair(&self, report: &Inconsistency, cancel: &CancellationToken) -> Result<Event> {
        let _guard = self
            .locks
            .acquire(&report.event_id, self.lock_timeout, cancel)
            .await?;

        let event = self
            .storage
            .get_event(&report.event_id)?
            .ok_or_else(|| Error::EventNotFound(report.event_id.clone()))?;
        if event.revision != report.revision {
            return Err(Error::ConcurrencyConflict {
                event_id: report.event_id.clone(),
                attempts: 1,
            });
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let repaired = sync::resync(&self.storage, &event)?;
        tracing::info!(
            event_id = %report.event_id,
            stored = report.stored_count,
            actual = repaired.participant_count,
            "Repaired participant counter"
        );
        if repaired.participant_count > i64::from(repaired.capacity) {
            tracing::warn!(
                event_id = %report.event_id,
                count = repaired.participant_count,
                capacity = repaired.capacity,
                "Ledger holds more active participants than capacity"
            );
        }
        Ok(repaired)
    }

    /// Repair every inconsistent event.
    ///
    /// Per-event errors are collected, never propagated, so one pass always
    /// covers every event. Cancellation stops the pass between events.
    pub async fn reconcile_all(&self, cancel: &CancellationToken) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        // Collect first: the scan borrows a RocksDB iterator that must not be
        // held across awaits.
        let mut reports = Vec::new();
        {
            let mut scan = self.check_consistency();
            while let Some(item) = scan.next() {
                if cancel.is_cancelled() {
                    summary.cancelled = true;
                    break;
                }
                match item {
                    Ok(report) => reports.push(report),
                    Err(e) => {
                        let event_id = scan.current_event().unwrap_or_default().to_string();
                        tracing::warn!(event_id = %event_id, error = %e, "Consistency check failed");
                        summary.failures.push(RepairFailure {
                            event_id,
                            reason: e.to_string(),
                        });
                    }
                }
            }
            summary.scanned = scan.scanned();
        }
        summary.inconsistent = reports.len();

        for report in &reports {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            if !report.is_drift() {
                // Counter already mirrors the ledger; nothing a recount can fix.
                continue;
            }
            match self.repair(report, cancel).await {
                Ok(_) => summary.repaired += 1,
                Err(Error::Cancelled) => {
                    summary.cancelled = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(event_id = %report.event_id, error = %e, "Repair failed");
                    summary.failures.push(RepairFailure {
                        event_id: report.event_id.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            scanned = summary.scanned,
            inconsistent = summary.inconsistent,
            repaired = summary.repaired,
            failed = summary.failed(),
            cancelled = summary.cancelled,
            "Reconcile pass finished"
        );
        summary
    }
}
