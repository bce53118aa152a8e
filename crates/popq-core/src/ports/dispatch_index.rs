//! DispatchIndex port
//!
//! Per job name: an ordered set of `(score, identifier)` under `queue:{name}`
//! and a side store of serialized records under `queue:{name}:{identifier}`.
//! Lower scores pop first. Ties are broken by the backend and are not part of
//! the contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One dispatch entry to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchEntry {
    pub name: String,
    pub identifier: String,
    pub score: i64,
    /// Serialized `JobRecord`.
    pub payload: String,
}

/// An `(identifier, score)` pair as listed by `snapshot`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedJob {
    pub identifier: String,
    pub score: i64,
}

pub fn queue_key(name: &str) -> String {
    format!("queue:{name}")
}

pub fn payload_key(name: &str, identifier: &str) -> String {
    format!("queue:{name}:{identifier}")
}

pub fn lock_key(name: &str) -> String {
    format!("locks:queue:{name}")
}

#[async_trait]
pub trait DispatchIndex: Send + Sync {
    /// Write score and payload for every entry in one round trip. Re-pushing
    /// an identifier replaces its score and payload.
    async fn push(&self, entries: &[DispatchEntry]) -> Result<()>;

    /// Atomically remove and return up to `count` identifiers with
    /// `score <= max_score`, lowest score first. Payloads are left in place.
    async fn pop_due(&self, name: &str, max_score: i64, count: usize) -> Result<Vec<String>>;

    /// Fetch payloads for identifiers; `None` where the side store has none.
    async fn payloads(&self, name: &str, identifiers: &[String]) -> Result<Vec<Option<String>>>;

    async fn remove_payload(&self, name: &str, identifier: &str) -> Result<()>;

    /// Number of entries in the ordered set.
    async fn len(&self, name: &str) -> Result<u64>;

    /// Ordered listing of all current entries, nothing removed.
    async fn snapshot(&self, name: &str) -> Result<Vec<IndexedJob>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_scheme() {
        assert_eq!(queue_key("email"), "queue:email");
        assert_eq!(payload_key("email", "e1"), "queue:email:e1");
        assert_eq!(lock_key("email"), "locks:queue:email");
    }
}
