//! State store abstraction
//!
//! The store is the only shared mutable resource between scheduler
//! processes. Everything that needs cross-process agreement (message status,
//! leases, rate-limit buckets) goes through two primitives: a versioned
//! compare-and-swap on single keys, and ordered sets scanned by score.
//!
//! Backends:
//! - [`MemoryStore`] - in-process, for tests and dry runs
//! - [`SqliteStore`] - durable, actor-owned rusqlite connection

pub mod keys;
mod memory;
mod messages;
mod sqlite;
mod typed;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryStore;
pub use messages::StoreCommand;
pub use sqlite::SqliteStore;
pub use typed::{load, save};

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ref code, _)
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                StoreError::Unavailable(err.to_string())
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Result of store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// A stored value with its write version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned {
    pub value: String,
    pub version: u64,
}

/// Outcome of a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// Write applied; `version` is the new version (0 for deletes)
    Written { version: u64 },
    /// Current version didn't match `expected`
    Conflict { current: Option<u64> },
}

impl CasOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, CasOutcome::Written { .. })
    }
}

/// Member of an ordered index, sorted by `(score, seq)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexEntry {
    pub score: i64,
    pub seq: u64,
    pub member: String,
}

impl IndexEntry {
    pub fn new(score: i64, seq: u64, member: impl Into<String>) -> Self {
        Self {
            score,
            seq,
            member: member.into(),
        }
    }
}

/// Minimal conditional-update + ordered-scan contract
///
/// Versions are unique across the whole store, so a key that is deleted and
/// re-created never reuses a version a stale writer could still hold.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read a key
    async fn get(&self, key: &str) -> StoreResult<Option<Versioned>>;

    /// Write `new` (or delete when `None`) only if the key's current version
    /// equals `expected` (`None` = key must not exist)
    async fn cas_write(&self, key: &str, expected: Option<u64>, new: Option<String>) -> StoreResult<CasOutcome>;

    /// Insert or reposition a member in an ordered index
    async fn index_put(&self, index: &str, entry: IndexEntry) -> StoreResult<()>;

    /// Remove a member from an ordered index; returns whether it was present
    async fn index_remove(&self, index: &str, member: &str) -> StoreResult<bool>;

    /// Entries with `score <= up_to`, ascending by `(score, seq)`
    async fn ordered_read(&self, index: &str, up_to: i64, limit: usize) -> StoreResult<Vec<IndexEntry>>;

    /// Number of members in an index
    async fn index_len(&self, index: &str) -> StoreResult<usize>;

    /// Next value of a monotonically increasing counter (starts at 1)
    async fn next_seq(&self, counter: &str) -> StoreResult<u64>;
}
