//! Event model.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// An event that users participate in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Unique identifier
    pub id: String,

    /// Human-readable title
    pub title: String,

    /// Maximum number of active participants
    pub capacity: u32,

    /// Denormalized count of active participations.
    ///
    /// Signed so that a corrupted value can be read back and reported.
    pub participant_count: i64,

    /// Optimistic concurrency token, bumped on every counter commit
    #[serde(default)]
    pub revision: u64,

    /// Creation time (Unix millis)
    pub created_at: u64,
}

impl Event {
    /// Create a new event with an empty counter.
    pub fn new(id: String, title: String, capacity: u32) -> Self {
        Self {
            id,
            title,
            capacity,
            participant_count: 0,
            revision: 0,
            created_at: super::now_millis(),
        }
    }

    /// Generate an ID from arbitrary content.
    pub fn generate_id(content: &[u8]) -> String {
        let hash = blake3::hash(content);
        hex::encode(hash.as_bytes())
    }

    /// Check an id is usable as a storage key component.
    pub fn validate_id(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::InvalidInput("event id must not be empty".into()));
        }
        if id.contains(':') {
            return Err(Error::InvalidInput(format!(
                "event id must not contain ':': {}",
                id
            )));
        }
        Ok(())
    }

    /// Check the fields a fresh event must satisfy.
    pub fn validate_new(&self) -> Result<()> {
        Self::validate_id(&self.id)?;
        if self.capacity == 0 {
            return Err(Error::InvalidInput("capacity must be at least 1".into()));
        }
        if self.participant_count != 0 || self.revision != 0 {
            return Err(Error::InvalidInput(
                "new events start with an empty counter".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_event_starts_empty() {
        let event = Event::new("e1".to_string(), "Catan night".to_string(), 4);
        assert_eq!(event.participant_count, 0);
        assert_eq!(event.revision, 0);
        assert!(event.validate_new().is_ok());
    }

    #[test]
    fn zero_capacity_rejected() {
        let event = Event::new("e1".to_string(), "Empty".to_string(), 0);
        assert!(matches!(event.validate_new(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn id_with_separator_rejected() {
        assert!(Event::validate_id("a:b").is_err());
        assert!(Event::validate_id("").is_err());
        assert!(Event::validate_id("abc").is_ok());
    }

    #[test]
    fn generate_id_deterministic() {
        let id1 = Event::generate_id(b"Catan:1700000000000");
        let id2 = Event::generate_id(b"Catan:1700000000000");
        assert_eq!(id1, id2);
        assert_eq!(id1.len(), 64);
    }

    #[test]
    fn missing_revision_defaults_to_zero() {
        let json = r#"{"id":"e","title":"t","capacity":2,"participant_count":1,"created_at":0}"#;
        let event: Event = serde_json::from_str(json).unwrap();
        assert_eq!(event.revision, 0);
        assert_eq!(event.participant_count, 1);
    }
}
