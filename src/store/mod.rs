//! Remote key/value store used for session records.
//!
//! The store is the single source of truth shared by every node. Values are
//! opaque bytes; callers own serialization.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use self::memory::MemorySessionStore;
pub use self::redis::RedisSessionStore;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection, timeout or server-side failure.
    #[error("Session store unavailable: {0}")]
    Unavailable(String),

    #[error("Session record serialization failed: {0}")]
    Serialization(String),
}

impl From<::redis::RedisError> for StoreError {
    fn from(e: ::redis::RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// get/set/delete/expire over string keys.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write `value`, replacing any previous value and its expiry. `None`
    /// persists without expiry.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Delete `key`. Returns whether a value existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Reset the expiry of an existing key. Returns `false` if the key is gone.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;
}
