//! Distributed mutex primitives.
//!
//! A lock is held by exactly one owner token at a time. Release is
//! compare-and-delete on that token, so a holder whose lease already expired can
//! never free a lock that someone else has since acquired.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub use self::memory::MemoryLockClient;
pub use self::redis::RedisLockClient;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock server unavailable: {0}")]
    Unavailable(String),

    #[error("Unknown lock kind: {0}")]
    UnknownKind(String),
}

impl From<::redis::RedisError> for LockError {
    fn from(e: ::redis::RedisError) -> Self {
        LockError::Unavailable(e.to_string())
    }
}

/// Acquisition policy for blocking acquires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LockKind {
    /// Mutual exclusion only; waiters are admitted in no particular order.
    #[default]
    Exclusive,
    /// Waiters are admitted in arrival order.
    Fair,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKind::Exclusive => write!(f, "exclusive"),
            LockKind::Fair => write!(f, "fair"),
        }
    }
}

impl FromStr for LockKind {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exclusive" => Ok(LockKind::Exclusive),
            "fair" => Ok(LockKind::Fair),
            other => Err(LockError::UnknownKind(other.to_string())),
        }
    }
}

/// Proof of ownership for one acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    owner: String,
}

impl LockToken {
    pub(crate) fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            owner: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }
}

#[async_trait]
pub trait LockClient: Send + Sync {
    /// Acquire without waiting. `None` means the lock is held by someone else.
    async fn try_acquire(
        &self,
        key: &str,
        lease: Option<Duration>,
    ) -> Result<Option<LockToken>, LockError>;

    /// Wait up to `wait` for the lock. `None` means the wait elapsed.
    async fn acquire(
        &self,
        key: &str,
        kind: LockKind,
        wait: Duration,
        lease: Option<Duration>,
    ) -> Result<Option<LockToken>, LockError>;

    /// Release if `token` still owns the lock. Returns whether it did.
    async fn release(&self, token: &LockToken) -> Result<bool, LockError>;

    /// Drop the lock regardless of owner. Operator use only.
    async fn force_release(&self, key: &str) -> Result<bool, LockError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_kind_parsing() {
        assert_eq!("FAIR".parse::<LockKind>().unwrap(), LockKind::Fair);
        assert_eq!(" exclusive ".parse::<LockKind>().unwrap(), LockKind::Exclusive);
        assert!("queued".parse::<LockKind>().is_err());
        assert_eq!(LockKind::default(), LockKind::Exclusive);
    }

    #[test]
    fn test_tokens_are_unique_per_acquisition() {
        let a = LockToken::new("k");
        let b = LockToken::new("k");
        assert_eq!(a.key(), b.key());
        assert_ne!(a.owner(), b.owner());
    }
}
