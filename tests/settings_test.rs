use std::env;
use std::time::Duration;

use shared_guard::lock::LockKind;
use shared_guard::modules::crypto::CipherAlgorithm;
use shared_guard::settings::{BindingStrategy, Settings, SettingsError};

#[test]
fn test_settings_from_environment() {
    // Save original environment variables
    let original_key = env::var("GUARD_CIPHER_KEY").ok();
    let original_types = env::var("GUARD_CALLER_TYPES").ok();

    env::remove_var("GUARD_CIPHER_KEY");
    assert!(matches!(Settings::from_env(), Err(SettingsError::Missing(_))));

    env::set_var("GUARD_CIPHER_KEY", "env-test-key");
    env::set_var("GUARD_CALLER_TYPES", "console:principal,mobile:device");
    let settings = Settings::from_env().unwrap();
    assert_eq!(settings.caller_types.len(), 2);
    assert_eq!(
        settings.caller_type("mobile").unwrap().binding,
        BindingStrategy::Device
    );
    assert!(settings.build_cipher().is_ok());

    // Restore original environment variables
    match original_key {
        Some(val) => env::set_var("GUARD_CIPHER_KEY", val),
        None => env::remove_var("GUARD_CIPHER_KEY"),
    }
    match original_types {
        Some(val) => env::set_var("GUARD_CALLER_TYPES", val),
        None => env::remove_var("GUARD_CALLER_TYPES"),
    }
}

#[test]
fn test_settings_from_lookup_overrides() {
    let settings = Settings::from_lookup(|name: &str| match name {
        "GUARD_CIPHER_KEY" => Some("k".to_string()),
        "GUARD_CIPHER_ALGORITHM" => Some("aes_128_gcm".to_string()),
        "GUARD_TOKEN_HEADER" => Some("X-Auth-Token".to_string()),
        "GUARD_LOCK_WAIT_MS" => Some("250".to_string()),
        "REDIS_URL" => Some("redis://cache:6380".to_string()),
        _ => None,
    })
    .unwrap();

    assert_eq!(settings.cipher.algorithm, CipherAlgorithm::Aes128Gcm);
    assert_eq!(settings.carrier.token_header, "X-Auth-Token");
    assert_eq!(settings.carrier.token_param, "access_token");
    assert_eq!(settings.lock.wait(), Duration::from_millis(250));
    assert_eq!(settings.redis_url, "redis://cache:6380");
}

#[test]
fn test_settings_from_json_file_contents() {
    let raw = r#"{
        "redis_url": "redis://localhost:6379",
        "cipher": { "algorithm": "AES-256-GCM", "key": "from-file" },
        "caller_types": [
            { "name": "mobile", "binding": "device", "ttl_secs": 900, "sliding": true }
        ],
        "lock": { "wait_ms": 500, "lease_ms": 0, "kind": "fair", "key_prefix": "mx:" }
    }"#;
    let settings: Settings = serde_json::from_str(raw).unwrap();

    let mobile = settings.caller_type("mobile").unwrap();
    assert_eq!(mobile.ttl(), Some(Duration::from_secs(900)));
    assert_eq!(mobile.session_key("dev-1"), "session:mobile:dev-1");
    assert_eq!(settings.lock.kind, LockKind::Fair);
    assert_eq!(settings.lock.lease(), None);
    assert_eq!(settings.carrier.login_path, "/login");
}
