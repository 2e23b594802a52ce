//! Error types for the roster.

use thiserror::Error;

/// Result type for roster operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in roster operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Join rejected: the active count would exceed the event capacity
    #[error("Event {event_id} is full (capacity {capacity})")]
    CapacityExceeded { event_id: String, capacity: u32 },

    /// The user already holds an active participation
    #[error("User {user_id} is already active in event {event_id}")]
    AlreadyActive { event_id: String, user_id: String },

    /// The user already has a pending request
    #[error("User {user_id} already has a pending request for event {event_id}")]
    AlreadyPending { event_id: String, user_id: String },

    /// Leave on a membership that is not active
    #[error("User {user_id} is not active in event {event_id}")]
    NotActive { event_id: String, user_id: String },

    /// Approve on a membership that is not pending
    #[error("User {user_id} has no pending request for event {event_id}")]
    NotPending { event_id: String, user_id: String },

    /// Unknown event
    #[error("Event not found: {0}")]
    EventNotFound(String),

    /// The event revision moved under the critical section
    #[error("Concurrent update on event {event_id} (after {attempts} attempt(s))")]
    ConcurrencyConflict { event_id: String, attempts: u32 },

    /// Underlying store failure
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Caller cancelled before the write committed
    #[error("Operation cancelled")]
    Cancelled,

    /// Could not enter the critical section in time
    #[error("Timed out waiting for event {0}")]
    TimedOut(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the whole operation may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ConcurrencyConflict { .. })
    }
}

impl From<rocksdb::Error> for Error {
    fn from(e: rocksdb::Error) -> Self {
        Error::StoreUnavailable(e.to_string())
    }
}
