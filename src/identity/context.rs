use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// Metadata key holding the currently valid token.
pub const TOKEN_METADATA_KEY: &str = "token";

/// Metadata key holding the bound device identifier.
pub const DEVICE_METADATA_KEY: &str = "device_id";

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityContext {
    pub principal_id: String,
    pub display_name: String,
    /// Identity domain, e.g. "mobile" or "console".
    pub caller_type: String,
    #[serde(default)]
    pub authorities: BTreeSet<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub expired: bool,
}

fn default_enabled() -> bool {
    true
}

impl IdentityContext {
    pub fn new(principal_id: &str, display_name: &str, caller_type: &str) -> Self {
        Self {
            principal_id: principal_id.to_string(),
            display_name: display_name.to_string(),
            caller_type: caller_type.to_string(),
            authorities: BTreeSet::new(),
            metadata: BTreeMap::new(),
            enabled: true,
            locked: false,
            expired: false,
        }
    }

    pub fn with_authority(mut self, authority: &str) -> Self {
        self.authorities.insert(authority.to_string());
        self
    }

    pub fn with_device(mut self, device_id: &str) -> Self {
        self.set_device(device_id);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.metadata.get(TOKEN_METADATA_KEY).and_then(Value::as_str)
    }

    pub fn device_id(&self) -> Option<&str> {
        self.metadata.get(DEVICE_METADATA_KEY).and_then(Value::as_str)
    }

    pub fn has_authority(&self, authority: &str) -> bool {
        self.authorities.contains(authority)
    }

    /// Enabled, not locked and not expired.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.locked && !self.expired
    }

    pub(crate) fn set_token(&mut self, token: String) {
        self.metadata
            .insert(TOKEN_METADATA_KEY.to_string(), Value::String(token));
    }

    pub(crate) fn clear_token(&mut self) {
        self.metadata.remove(TOKEN_METADATA_KEY);
    }

    pub(crate) fn set_device(&mut self, device_id: &str) {
        self.metadata.insert(
            DEVICE_METADATA_KEY.to_string(),
            Value::String(device_id.to_string()),
        );
    }
}

/// The value persisted in the session store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub context: IdentityContext,
    /// Unix milliseconds; informational, the store enforces the TTL.
    pub expires_at_ms: Option<i64>,
}

impl SessionRecord {
    pub fn new(context: IdentityContext, ttl: Option<Duration>) -> Self {
        let expires_at_ms =
            ttl.map(|ttl| Utc::now().timestamp_millis() + ttl.as_millis() as i64);
        Self {
            context,
            expires_at_ms,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
