//! Data model for the roster.
//!
//! # Core Types
//!
//! - [`Event`] - An event with a capacity and its denormalized participant counter
//! - [`Participation`] - One (event, user) membership row in the ledger
//! - [`ParticipationStatus`] - Tagged membership state; only `Active` counts

mod event;
mod participation;

pub use event::Event;
pub use participation::{Participation, ParticipationStatus};

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
