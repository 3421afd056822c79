//! Keyed-counter store backing the rate limiter.
//!
//! The limiter only needs a handful of primitives: plain get/set/expire and
//! a sorted set with add, trim-by-score and cardinality. [`RateLimitStore`]
//! exposes exactly those. Two implementations exist:
//!
//! - [`RedisStore`]: shared across replicas, built on the singleton
//!   [`ConnectionManager`]
//! - [`MemoryStore`]: in-process, same semantics, for tests and
//!   single-replica deployments

mod connection;
mod memory;
mod redis_store;

pub use connection::{ConnectionManager, Connector, RedisConnector, RetryPolicy, backoff_delay};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::GatewayError;

/// Store failures.
///
/// `Clone` so that a single connect outcome can be handed to every caller
/// waiting on the same attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Could not open or re-open the connection.
    #[error("store connection failed: {message}")]
    Connection { message: String },

    /// Gave up connecting after the retry ceiling.
    #[error("store connection failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// A command was sent but failed.
    #[error("store command {command} failed: {message}")]
    Command { command: &'static str, message: String },

    /// The connection broke underneath a command.
    #[error("store connection lost during {command}: {message}")]
    ConnectionLost { command: &'static str, message: String },
}

impl StoreError {
    /// True when the connection itself is unusable and must be redialed.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. })
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        GatewayError::internal(err.to_string())
    }
}

/// Primitives the rate limiter needs from a key-value store.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Backend name for logs and status output.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Set a string value, optionally with an expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Set the expiry of an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Add `member` to the sorted set at `key` with `score`.
    async fn zadd(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError>;

    /// Remove members scored within `[min, max]`. Returns how many were removed.
    async fn zremrangebyscore(&self, key: &str, min: i64, max: i64) -> Result<u64, StoreError>;

    /// Number of members in the sorted set at `key` (0 if absent).
    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;

    /// Liveness check.
    async fn ping(&self) -> Result<(), StoreError>;
}
