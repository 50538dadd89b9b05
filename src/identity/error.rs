use thiserror::Error;

use crate::modules::crypto::CryptoError;
use crate::store::StoreError;

/// Why a presented token did not resolve to a live identity.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Token could not be opened: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Unknown caller type {0}")]
    UnknownCallerType(String),

    #[error("Device-bound token carries no device id")]
    MissingDevice,

    #[error("No session for the token's binding key")]
    SessionNotFound,

    #[error("Stored session record is unreadable: {0}")]
    CorruptRecord(String),

    #[error("Token is no longer the current token for its session")]
    TokenSuperseded,

    #[error("Device id does not match the session's device")]
    DeviceMismatch,

    #[error("Identity is disabled, locked or expired")]
    Inactive,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ResolveError {
    /// True for every outcome the request pipeline treats as anonymous.
    pub fn is_unauthenticated(&self) -> bool {
        !matches!(self, ResolveError::Store(_))
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Session store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Unknown caller type {0}")]
    UnknownCallerType(String),

    #[error("Binding key {binding_key} does not match the context for caller type {caller_type}")]
    BindingMismatch {
        caller_type: String,
        binding_key: String,
    },

    #[error("Caller type {0} is not device-bound")]
    NotDeviceBound(String),

    #[error("Device {0} already has a session owned by another principal")]
    DeviceSessionConflict(String),

    #[error("No session exists for device {0} and the request is not a login")]
    NoDeviceSession(String),

    #[error("Token minting failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Session record serialization failed: {0}")]
    Serialization(String),
}

impl IdentityError {
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, IdentityError::StoreUnavailable(_))
    }
}

impl From<StoreError> for IdentityError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(reason) => IdentityError::StoreUnavailable(reason),
            StoreError::Serialization(reason) => IdentityError::Serialization(reason),
        }
    }
}

impl From<serde_json::Error> for IdentityError {
    fn from(e: serde_json::Error) -> Self {
        IdentityError::Serialization(e.to_string())
    }
}
