//! Shared key-value store for device records, users and port reservations
//!
//! All cross-instance coordination goes through the atomic primitives of
//! [`KvStore`]. No caller holds an in-process lock around a read-then-write.

pub mod memory;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use thiserror::Error;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend unreachable or the connection dropped mid-command
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Connection-level failures may succeed on retry
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

/// Result of a [`KvStore::compare_and_swap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Swapped,
    /// Key holds a different value than expected
    Mismatch,
    Missing,
}

/// Atomic key-value and set primitives
///
/// Every method is atomic at single-key (or single set member) granularity.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store `value` only if `key` is absent. Returns `true` if written.
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, StoreError>;

    /// Replace the value of `key` only if it currently equals `expected`
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
    ) -> Result<CasOutcome, StoreError>;

    /// Delete `key` only if it currently equals `expected`
    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<CasOutcome, StoreError>;

    /// Returns `true` if the key existed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Returns `true` if `member` was not in the set before
    async fn set_add(&self, set: &str, member: &str) -> Result<bool, StoreError>;

    /// Returns `true` if `member` was in the set
    async fn set_remove(&self, set: &str, member: &str) -> Result<bool, StoreError>;

    async fn set_is_member(&self, set: &str, member: &str) -> Result<bool, StoreError>;

    async fn set_len(&self, set: &str) -> Result<usize, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
