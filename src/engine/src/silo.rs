//! The status-publication protocol to an external key-value silo.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// TTL, in seconds, applied to every status write.
pub const STATUS_TTL_SECONDS: u64 = 3600;

/// A single status-publication record, written under key
/// `task:<parent-id>:<chain-id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub id: String,
    pub parent: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub agent: Option<String>,
    pub position: Option<usize>,
    pub total: Option<usize>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl StatusRecord {
    /// Builds the silo key this record is written under.
    pub fn key(parent: &str, chain_id: &str) -> String {
        format!("task:{}:{}", parent, chain_id)
    }
}

/// Narrow contract the chain engine needs from an external key-value silo.
///
/// Concrete backends (Redis, Mongo) are out of scope for the engine itself;
/// they implement this trait. Non-scalar mapping values are expected to be
/// serialized to a compact text form by the implementation before being
/// written to the underlying hash-field API, and best-effort deserialized
/// by readers.
pub trait StatusSilo: Send + Sync {
    /// Publishes a status record, applying [`STATUS_TTL_SECONDS`].
    ///
    /// # Errors
    ///
    /// Returns an error describing why the write could not be completed.
    fn publish(&self, key: &str, record: &StatusRecord) -> Result<(), String>;

    /// Publishes the chain's final result mapping under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error describing why the write could not be completed.
    fn publish_result(&self, key: &str, result: &Value) -> Result<(), String>;
}

/// An in-memory reference [`StatusSilo`], used by tests and as the default
/// when no external silo is configured, so the engine is fully exercisable
/// without a live Redis/Mongo deployment.
#[derive(Debug, Default)]
pub struct MemorySilo {
    records: Mutex<HashMap<String, StatusRecord>>,
    results: Mutex<HashMap<String, Value>>,
}

impl MemorySilo {
    /// Creates an empty in-memory silo.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the last record published under `key`, if any.
    pub fn get(&self, key: &str) -> Option<StatusRecord> {
        self.records.lock().expect("lock poisoned").get(key).cloned()
    }

    /// Returns the last result published under `key`, if any.
    pub fn get_result(&self, key: &str) -> Option<Value> {
        self.results.lock().expect("lock poisoned").get(key).cloned()
    }
}

impl StatusSilo for MemorySilo {
    fn publish(&self, key: &str, record: &StatusRecord) -> Result<(), String> {
        self.records
            .lock()
            .map_err(|_| "status silo lock poisoned".to_owned())?
            .insert(key.to_owned(), record.clone());
        Ok(())
    }

    fn publish_result(&self, key: &str, result: &Value) -> Result<(), String> {
        self.results
            .lock()
            .map_err(|_| "status silo lock poisoned".to_owned())?
            .insert(key.to_owned(), result.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_then_get_round_trips() {
        let silo = MemorySilo::new();
        let record = StatusRecord {
            id: "t1".to_owned(),
            parent: Some("c1".to_owned()),
            name: "task".to_owned(),
            kind: "dummy".to_owned(),
            status: "running".to_owned(),
            agent: None,
            position: Some(0),
            total: Some(1),
            start: None,
            end: None,
        };
        let key = StatusRecord::key("c1", "t1");
        silo.publish(&key, &record).unwrap();
        assert_eq!(silo.get(&key).unwrap().status, "running");
    }
}
