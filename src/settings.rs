//! Configuration surface.
//!
//! Settings come from environment variables with defaults, in the same shape as
//! a server `load_config()`. [`Settings::from_lookup`] takes any lookup
//! function so tests do not have to mutate the process environment.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::keys::{self, KeyDeriver, DEFAULT_SESSION_TEMPLATE};
use crate::lock::LockKind;
use crate::modules::crypto::{CipherAlgorithm, CryptoError, TokenCipher};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Missing required setting {0}")]
    Missing(String),

    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: String, reason: String },
}

/// How a caller type locates its session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BindingStrategy {
    /// Keyed by principal id.
    #[default]
    Principal,
    /// Keyed by the client-supplied device identifier.
    Device,
}

impl FromStr for BindingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "principal" => Ok(BindingStrategy::Principal),
            "device" => Ok(BindingStrategy::Device),
            other => Err(format!("unknown binding strategy {:?}", other)),
        }
    }
}

/// Per caller type session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallerTypeSettings {
    pub name: String,
    #[serde(default)]
    pub binding: BindingStrategy,
    /// `None` or `0` persists without expiry.
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default = "default_session_template")]
    pub key_template: String,
    /// Re-apply the TTL on every successful resolve.
    #[serde(default)]
    pub sliding: bool,
}

fn default_session_template() -> String {
    DEFAULT_SESSION_TEMPLATE.to_string()
}

impl CallerTypeSettings {
    pub fn new(name: &str, binding: BindingStrategy) -> Self {
        Self {
            name: name.to_string(),
            binding,
            ttl_secs: None,
            key_template: default_session_template(),
            sliding: false,
        }
    }

    /// TTLs are kept in whole seconds; a fractional second rounds up so a
    /// short TTL never turns into "no expiry".
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_secs = Some(ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0));
        self
    }

    pub fn with_key_template(mut self, template: &str) -> Self {
        self.key_template = template.to_string();
        self
    }

    pub fn with_sliding(mut self, sliding: bool) -> Self {
        self.sliding = sliding;
        self
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_secs.filter(|secs| *secs > 0).map(Duration::from_secs)
    }

    pub fn session_key(&self, binding_key: &str) -> String {
        keys::session_key(&self.key_template, &self.name, binding_key)
    }
}

/// Where inbound requests carry their credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarrierSettings {
    pub token_header: String,
    pub token_param: String,
    pub device_header: String,
    pub user_id_header: String,
    pub login_path: String,
}

impl Default for CarrierSettings {
    fn default() -> Self {
        Self {
            token_header: "Authorization".to_string(),
            token_param: "access_token".to_string(),
            device_header: "X-Device-Id".to_string(),
            user_id_header: "X-User-Id".to_string(),
            login_path: "/login".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockSettings {
    pub wait_ms: u64,
    /// `0` disables the lease.
    pub lease_ms: u64,
    #[serde(default)]
    pub kind: LockKind,
    pub key_prefix: String,
    #[serde(default)]
    pub ignored_types: Vec<String>,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            wait_ms: 3_000,
            lease_ms: 30_000,
            kind: LockKind::Exclusive,
            key_prefix: "lock:".to_string(),
            ignored_types: Vec::new(),
        }
    }
}

impl LockSettings {
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }

    pub fn lease(&self) -> Option<Duration> {
        (self.lease_ms > 0).then(|| Duration::from_millis(self.lease_ms))
    }

    pub fn key_deriver(&self) -> KeyDeriver {
        KeyDeriver::new(self.ignored_types.iter().cloned())
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CipherSettings {
    #[serde(default)]
    pub algorithm: CipherAlgorithm,
    pub key: String,
}

impl fmt::Debug for CipherSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherSettings")
            .field("algorithm", &self.algorithm)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub redis_url: String,
    pub cipher: CipherSettings,
    #[serde(default)]
    pub carrier: CarrierSettings,
    pub caller_types: Vec<CallerTypeSettings>,
    #[serde(default)]
    pub lock: LockSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let carrier_defaults = CarrierSettings::default();
        let lock_defaults = LockSettings::default();

        let cipher = CipherSettings {
            algorithm: parse_or(&lookup, "GUARD_CIPHER_ALGORITHM", CipherAlgorithm::Aes256Gcm)?,
            key: lookup("GUARD_CIPHER_KEY")
                .filter(|key| !key.is_empty())
                .ok_or_else(|| SettingsError::Missing("GUARD_CIPHER_KEY".to_string()))?,
        };

        let carrier = CarrierSettings {
            token_header: string_or(&lookup, "GUARD_TOKEN_HEADER", &carrier_defaults.token_header),
            token_param: string_or(&lookup, "GUARD_TOKEN_PARAM", &carrier_defaults.token_param),
            device_header: string_or(&lookup, "GUARD_DEVICE_HEADER", &carrier_defaults.device_header),
            user_id_header: string_or(
                &lookup,
                "GUARD_USER_ID_HEADER",
                &carrier_defaults.user_id_header,
            ),
            login_path: string_or(&lookup, "GUARD_LOGIN_PATH", &carrier_defaults.login_path),
        };

        let lock = LockSettings {
            wait_ms: parse_or(&lookup, "GUARD_LOCK_WAIT_MS", lock_defaults.wait_ms)?,
            lease_ms: parse_or(&lookup, "GUARD_LOCK_LEASE_MS", lock_defaults.lease_ms)?,
            kind: parse_or(&lookup, "GUARD_LOCK_KIND", lock_defaults.kind)?,
            key_prefix: string_or(&lookup, "GUARD_LOCK_KEY_PREFIX", &lock_defaults.key_prefix),
            ignored_types: lookup("GUARD_LOCK_IGNORED_TYPES")
                .map(|list| split_list(&list))
                .unwrap_or_default(),
        };

        let caller_types = parse_caller_types(&lookup)?;

        Ok(Settings {
            redis_url: string_or(&lookup, "REDIS_URL", "redis://localhost:6379"),
            cipher,
            carrier,
            caller_types,
            lock,
        })
    }

    pub fn build_cipher(&self) -> Result<TokenCipher, CryptoError> {
        TokenCipher::new(self.cipher.algorithm, self.cipher.key.as_bytes())
    }

    pub fn caller_type(&self, name: &str) -> Option<&CallerTypeSettings> {
        self.caller_types.iter().find(|caller| caller.name == name)
    }
}

fn parse_caller_types<F>(lookup: &F) -> Result<Vec<CallerTypeSettings>, SettingsError>
where
    F: Fn(&str) -> Option<String>,
{
    let declared = string_or(lookup, "GUARD_CALLER_TYPES", "console:principal");
    let mut seen = HashSet::new();
    let mut caller_types = Vec::new();

    for entry in split_list(&declared) {
        let (name, binding) = match entry.split_once(':') {
            Some((name, binding)) => (name.trim().to_string(), binding.trim()),
            None => (entry.clone(), "principal"),
        };
        let binding = binding.parse::<BindingStrategy>().map_err(|reason| SettingsError::Invalid {
            name: "GUARD_CALLER_TYPES".to_string(),
            reason,
        })?;
        if name.is_empty() || !seen.insert(name.clone()) {
            return Err(SettingsError::Invalid {
                name: "GUARD_CALLER_TYPES".to_string(),
                reason: format!("empty or duplicate caller type {:?}", name),
            });
        }

        let suffix = name.to_ascii_uppercase().replace('-', "_");
        let template_var = format!("GUARD_SESSION_{}_KEY_TEMPLATE", suffix);
        let key_template = string_or(lookup, &template_var, DEFAULT_SESSION_TEMPLATE);
        keys::validate_session_template(&key_template).map_err(|e| SettingsError::Invalid {
            name: template_var.clone(),
            reason: e.to_string(),
        })?;

        let ttl_var = format!("GUARD_SESSION_{}_TTL_SECS", suffix);
        let ttl_secs = match lookup(&ttl_var) {
            Some(raw) => Some(parse_value::<u64>(&ttl_var, &raw)?),
            None => None,
        };
        let sliding = parse_or(lookup, &format!("GUARD_SESSION_{}_SLIDING", suffix), false)?;

        caller_types.push(CallerTypeSettings {
            name,
            binding,
            ttl_secs,
            key_template,
            sliding,
        });
    }

    if caller_types.is_empty() {
        return Err(SettingsError::Invalid {
            name: "GUARD_CALLER_TYPES".to_string(),
            reason: "at least one caller type is required".to_string(),
        });
    }
    Ok(caller_types)
}

fn string_or<F>(lookup: &F, name: &str, default: &str) -> String
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T, SettingsError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => parse_value(name, &raw),
        _ => Ok(default),
    }
}

fn parse_value<T>(name: &str, raw: &str) -> Result<T, SettingsError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| SettingsError::Invalid {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
