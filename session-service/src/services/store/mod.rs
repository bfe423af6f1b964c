//! Credential store: the only shared mutable state of the session core.
//!
//! The trait speaks in raw strings and keys. Typed, versioned records and the
//! timeout/retry/breaker policy live one layer up in
//! [`crate::services::credentials`].

mod memory;
mod redis;

pub use self::memory::InMemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    Connection(String),

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Circuit open for {0}")]
    CircuitOpen(String),

    #[error("Store command failed: {0}")]
    Command(String),

    #[error("Corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl StoreError {
    /// Failures that say something about the health of the dependency.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Connection(_) | StoreError::Timeout(_))
    }
}

/// One sliding-window hit.
#[derive(Debug, Clone)]
pub struct HitRequest {
    pub now_ms: i64,
    pub window_ms: i64,
    pub max_count: u64,
    pub cost: u64,
    pub cooldown_ms: i64,
    /// Unique per attempt; window entries are `<member>:<n>` for n in 1..=cost.
    pub member: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HitOutcome {
    pub allowed: bool,
    /// Entries in the window after this hit.
    pub count: u64,
    /// Timestamp (ms) of the oldest entry still inside the window.
    pub oldest_ms: Option<i64>,
    /// End (ms) of an active block, if any.
    pub blocked_until_ms: Option<i64>,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Unconditional write. `None` keeps the value until deleted.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Conditional write; `true` if this call created the key. `None` keeps
    /// the value until deleted.
    async fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Read and delete in one step.
    async fn take(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn exists_any(&self, keys: &[String]) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Returns the number of members newly added.
    async fn set_add(&self, key: &str, members: &[String]) -> Result<u64, StoreError>;

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Atomically move `member` from one set to another; `false` if it was not
    /// in the source set.
    async fn set_move(&self, from: &str, to: &str, member: &str) -> Result<bool, StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn set_len(&self, key: &str) -> Result<u64, StoreError>;

    /// Prune, count and conditionally append to a sliding window in one atomic
    /// step, setting the block marker when the hit is denied.
    async fn record_hit(
        &self,
        window_key: &str,
        block_key: &str,
        hit: &HitRequest,
    ) -> Result<HitOutcome, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}
