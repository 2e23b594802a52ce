//! Participation model - one membership row of the ledger.

use serde::{Deserialize, Serialize};

/// Membership state. Rows are never deleted; history is kept by transitions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ParticipationStatus {
    /// Counts toward the participant counter
    Active,
    /// Left the event
    Left,
    /// Waiting for approval
    Pending,
}

impl ParticipationStatus {
    /// Whether this state counts toward `participant_count`.
    pub fn counts(self) -> bool {
        matches!(self, ParticipationStatus::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ParticipationStatus::Active => "active",
            ParticipationStatus::Left => "left",
            ParticipationStatus::Pending => "pending",
        }
    }
}

impl std::fmt::Display for ParticipationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user's membership in an event. Unique per (event_id, user_id).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participation {
    pub event_id: String,
    pub user_id: String,
    pub status: ParticipationStatus,

    /// When the row was first created (Unix millis); kept across transitions
    pub joined_at: u64,

    /// Last status transition (Unix millis)
    pub updated_at: u64,
}

impl Participation {
    /// Create a fresh row.
    pub fn new(event_id: String, user_id: String, status: ParticipationStatus, now: u64) -> Self {
        Self {
            event_id,
            user_id,
            status,
            joined_at: now,
            updated_at: now,
        }
    }

    /// The same row moved to another status.
    pub fn transition(&self, status: ParticipationStatus, now: u64) -> Self {
        Self {
            status,
            updated_at: now,
            ..self.clone()
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.counts()
    }
}
