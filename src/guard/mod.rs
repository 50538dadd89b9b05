//! Mutual-exclusion interceptor.
//!
//! A [`GuardSpec`] is registered once per guarded operation. At call time the
//! [`MutexInterceptor`] derives the lock key from the arguments, acquires the
//! lock in the registered mode, runs the operation and releases on every exit.

pub mod error;
pub mod interceptor;

use log::debug;
use std::fmt;
use std::time::Duration;

use crate::keys::{KeyError, KeyExpression};
use crate::lock::LockKind;

pub use self::error::GuardError;
pub use self::interceptor::{GuardDefaults, HeldLock, MutexInterceptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardMode {
    /// Reject immediately when the key is held.
    Idempotent,
    /// Wait for the key, up to the configured wait.
    Concurrent,
}

/// Per-call lock lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPhase {
    Idle,
    Acquiring,
    Held,
    Releasing,
    Rejected,
    TimedOut,
}

impl fmt::Display for LockPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockPhase::Idle => "idle",
            LockPhase::Acquiring => "acquiring",
            LockPhase::Held => "held",
            LockPhase::Releasing => "releasing",
            LockPhase::Rejected => "rejected",
            LockPhase::TimedOut => "timed-out",
        };
        f.write_str(name)
    }
}

pub(crate) fn transition(key: &str, from: LockPhase, to: LockPhase) {
    debug!("Lock {}: {} -> {}", key, from, to);
}

/// Registration for one guarded operation.
#[derive(Debug, Clone)]
pub struct GuardSpec {
    operation: String,
    mode: GuardMode,
    kind: Option<LockKind>,
    expression: Option<KeyExpression>,
    wait: Option<Duration>,
    lease: Option<Option<Duration>>,
}

impl GuardSpec {
    pub fn idempotent(operation: &str) -> Self {
        Self::with_mode(operation, GuardMode::Idempotent, None)
    }

    pub fn concurrent(operation: &str, kind: LockKind) -> Self {
        Self::with_mode(operation, GuardMode::Concurrent, Some(kind))
    }

    /// Concurrent mode using the interceptor's default lock kind.
    pub fn blocking(operation: &str) -> Self {
        Self::with_mode(operation, GuardMode::Concurrent, None)
    }

    fn with_mode(operation: &str, mode: GuardMode, kind: Option<LockKind>) -> Self {
        Self {
            operation: operation.to_string(),
            mode,
            kind,
            expression: None,
            wait: None,
            lease: None,
        }
    }

    /// Key the lock with `expression` instead of the default argument key.
    /// The expression is parsed here so a bad one fails at registration.
    pub fn with_expression(mut self, expression: &str) -> Result<Self, KeyError> {
        self.expression = Some(KeyExpression::parse(expression)?);
        Ok(self)
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = Some(Some(lease));
        self
    }

    /// Hold the lock until released, with no server-side expiry.
    pub fn without_lease(mut self) -> Self {
        self.lease = Some(None);
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn mode(&self) -> GuardMode {
        self.mode
    }

    pub fn expression(&self) -> Option<&KeyExpression> {
        self.expression.as_ref()
    }

    pub(crate) fn kind_or(&self, default: LockKind) -> LockKind {
        self.kind.unwrap_or(default)
    }

    pub(crate) fn wait_or(&self, default: Duration) -> Duration {
        self.wait.unwrap_or(default)
    }

    pub(crate) fn lease_or(&self, default: Option<Duration>) -> Option<Duration> {
        self.lease.unwrap_or(default)
    }
}
