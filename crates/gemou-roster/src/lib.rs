//! Gemou Roster - event participation ledger
//!
//! Keeps each event's denormalized participant counter equal to the number of
//! active participation rows, bounded by the event's capacity, and audits and
//! repairs drift between the two.
//!
//! # Architecture
//!
//! - **Models**: `Event`, `Participation`, `ParticipationStatus`
//! - **Storage**: RocksDB-backed store with revision-checked atomic commits
//! - **Ledger**: join/leave/request/approve under a per-event critical section
//! - **Sync**: the single writer of `participant_count` (full recount)
//! - **Auditor**: lazy consistency scan and reconcile pass
//! - **API**: HTTP endpoints for clients
//! - **Admin Socket**: Unix socket for local diagnostics (roster-admin CLI)
//!
//! # Example
//!
//! ```no_run
//! use gemou_roster::{Ledger, LedgerConfig, Storage};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = Arc::new(Storage::open("./roster-data/db")?);
//!     let ledger = Ledger::new(storage, LedgerConfig::default());
//!     ledger.create_event("catan-friday", "Catan Friday", 4)?;
//!
//!     let cancel = CancellationToken::new();
//!     let joined = ledger.join("catan-friday", "alice", &cancel).await?;
//!     assert_eq!(joined.event.participant_count, 1);
//!
//!     let summary = ledger.auditor().reconcile_all(&cancel).await;
//!     assert_eq!(summary.inconsistent, 0);
//!     Ok(())
//! }
//! ```

pub mod admin_socket;
pub mod api;
pub mod auditor;
pub mod error;
pub mod ledger;
pub mod locks;
pub mod models;
pub mod node;
pub mod retry;
pub mod storage;
pub mod sync;


pub use auditor::{AuditScan, Auditor, Inconsistency, ReconcileSummary, RepairFailure, Violation};
pub use error::{Error, Result};
pub use ledger::{Ledger, LedgerConfig, Membership};
pub use locks::EventLocks;
pub use models::{Event, Participation, ParticipationStatus};
pub use node::{RosterConfig, RosterNode};
pub use retry::RetryPolicy;
pub use storage::Storage;
