//! Symmetric token codec.
//!
//! Claims are serialized to JSON and sealed with AES-GCM under a key stretched
//! from the configured key material with HKDF-SHA256. The wire form is
//! `base64url(nonce || ciphertext || tag)` without padding, so the token is safe
//! to carry in headers and query strings.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// HKDF info parameter for token keys.
const TOKEN_KDF_INFO: &[u8] = b"shared-guard token v1";

/// Errors raised while sealing or opening a token.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Unsupported cipher algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Key material must not be empty")]
    InvalidKeyMaterial,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Failed to encode claims: {0}")]
    Encoding(String),

    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Token failed authentication (wrong key or tampered ciphertext)")]
    Authentication,

    #[error("Encryption failed")]
    Encryption,
}

/// Supported AEAD algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherAlgorithm {
    #[serde(rename = "AES-256-GCM")]
    Aes256Gcm,
    #[serde(rename = "AES-128-GCM")]
    Aes128Gcm,
}

impl CipherAlgorithm {
    pub fn key_len(&self) -> usize {
        match self {
            CipherAlgorithm::Aes256Gcm => 32,
            CipherAlgorithm::Aes128Gcm => 16,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CipherAlgorithm::Aes256Gcm => "AES-256-GCM",
            CipherAlgorithm::Aes128Gcm => "AES-128-GCM",
        }
    }
}

impl Default for CipherAlgorithm {
    fn default() -> Self {
        CipherAlgorithm::Aes256Gcm
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CipherAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('_', "-").as_str() {
            "AES-256-GCM" | "AES256GCM" => Ok(CipherAlgorithm::Aes256Gcm),
            "AES-128-GCM" | "AES128GCM" => Ok(CipherAlgorithm::Aes128Gcm),
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

enum SealingKey {
    Aes256(Box<Aes256Gcm>),
    Aes128(Box<Aes128Gcm>),
}

/// Encrypts and decrypts claim payloads into opaque token strings.
pub struct TokenCipher {
    algorithm: CipherAlgorithm,
    key: SealingKey,
}

impl fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCipher")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl TokenCipher {
    /// Build a cipher from raw key material of any length.
    ///
    /// The material is stretched to the algorithm's key size with HKDF-SHA256,
    /// so a passphrase and a 32-byte random key are both acceptable inputs.
    pub fn new(algorithm: CipherAlgorithm, key_material: &[u8]) -> Result<Self, CryptoError> {
        let derived = derive_token_key(algorithm, key_material)?;
        let key = match algorithm {
            CipherAlgorithm::Aes256Gcm => SealingKey::Aes256(Box::new(
                Aes256Gcm::new_from_slice(&derived)
                    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?,
            )),
            CipherAlgorithm::Aes128Gcm => SealingKey::Aes128(Box::new(
                Aes128Gcm::new_from_slice(&derived)
                    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?,
            )),
        };
        Ok(Self { algorithm, key })
    }

    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    /// Seal `claims` into a token. Every call draws a fresh nonce, so identical
    /// claims never produce identical tokens.
    pub fn encrypt<T: Serialize + ?Sized>(&self, claims: &T) -> Result<String, CryptoError> {
        let plaintext =
            serde_json::to_vec(claims).map_err(|e| CryptoError::Encoding(e.to_string()))?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let nonce_ga = Nonce::from_slice(&nonce);

        let ciphertext = match &self.key {
            SealingKey::Aes256(cipher) => cipher.encrypt(nonce_ga, plaintext.as_slice()),
            SealingKey::Aes128(cipher) => cipher.encrypt(nonce_ga, plaintext.as_slice()),
        }
        .map_err(|_| CryptoError::Encryption)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    /// Open a token produced by [`TokenCipher::encrypt`].
    pub fn decrypt<T: DeserializeOwned>(&self, token: &str) -> Result<T, CryptoError> {
        let sealed = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|e| CryptoError::Malformed(format!("not base64url: {}", e)))?;

        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Malformed(format!(
                "token too short: {} bytes",
                sealed.len()
            )));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce_ga = Nonce::from_slice(nonce);
        let plaintext = match &self.key {
            SealingKey::Aes256(cipher) => cipher.decrypt(nonce_ga, ciphertext),
            SealingKey::Aes128(cipher) => cipher.decrypt(nonce_ga, ciphertext),
        }
        .map_err(|_| CryptoError::Authentication)?;

        serde_json::from_slice(&plaintext)
            .map_err(|e| CryptoError::Malformed(format!("claims payload: {}", e)))
    }
}

/// One-shot form of [`TokenCipher::encrypt`].
pub fn encrypt_claims<T: Serialize + ?Sized>(
    claims: &T,
    key: &[u8],
    algorithm: CipherAlgorithm,
) -> Result<String, CryptoError> {
    TokenCipher::new(algorithm, key)?.encrypt(claims)
}

/// One-shot form of [`TokenCipher::decrypt`].
pub fn decrypt_claims<T: DeserializeOwned>(
    token: &str,
    key: &[u8],
    algorithm: CipherAlgorithm,
) -> Result<T, CryptoError> {
    TokenCipher::new(algorithm, key)?.decrypt(token)
}

/// Per-algorithm HKDF salt: SHA256("shared-guard" || algorithm name).
pub fn compute_token_salt(algorithm: CipherAlgorithm) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"shared-guard");
    hasher.update(algorithm.name().as_bytes());
    hasher.finalize().into()
}

fn derive_token_key(algorithm: CipherAlgorithm, material: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if material.is_empty() {
        return Err(CryptoError::InvalidKeyMaterial);
    }
    let salt = compute_token_salt(algorithm);
    let hkdf = Hkdf::<Sha256>::new(Some(&salt), material);
    let mut derived = vec![0u8; algorithm.key_len()];
    hkdf.expand(TOKEN_KDF_INFO, &mut derived)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(derived)
}

/// Constant-time byte comparison to prevent timing attacks.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Short, non-reversible token label for log lines.
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn claims() -> BTreeMap<String, serde_json::Value> {
        let mut claims = BTreeMap::new();
        claims.insert("principal_id".to_string(), serde_json::json!("u-1"));
        claims.insert("caller_type".to_string(), serde_json::json!("mobile"));
        claims.insert("issued_at_ms".to_string(), serde_json::json!(1_700_000_000_000i64));
        claims
    }

    #[test]
    fn test_round_trip() {
        let cipher = TokenCipher::new(CipherAlgorithm::Aes256Gcm, b"server-secret").unwrap();
        let token = cipher.encrypt(&claims()).unwrap();
        let opened: BTreeMap<String, serde_json::Value> = cipher.decrypt(&token).unwrap();
        assert_eq!(opened, claims());
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let cipher = TokenCipher::new(CipherAlgorithm::Aes256Gcm, b"server-secret").unwrap();
        let first = cipher.encrypt(&claims()).unwrap();
        let second = cipher.encrypt(&claims()).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let token = encrypt_claims(&claims(), b"key-a", CipherAlgorithm::Aes128Gcm).unwrap();
        let result: Result<BTreeMap<String, serde_json::Value>, _> =
            decrypt_claims(&token, b"key-b", CipherAlgorithm::Aes128Gcm);
        assert!(matches!(result, Err(CryptoError::Authentication)));
    }

    #[test]
    fn test_tampered_token_rejected() {
        let cipher = TokenCipher::new(CipherAlgorithm::Aes256Gcm, b"server-secret").unwrap();
        let token = cipher.encrypt(&claims()).unwrap();
        let mut raw = URL_SAFE_NO_PAD.decode(&token).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(raw);

        let result: Result<serde_json::Value, _> = cipher.decrypt(&tampered);
        assert!(matches!(result, Err(CryptoError::Authentication)));
    }

    #[test]
    fn test_malformed_input() {
        let cipher = TokenCipher::new(CipherAlgorithm::Aes256Gcm, b"server-secret").unwrap();
        let not_base64: Result<serde_json::Value, _> = cipher.decrypt("%%%");
        assert!(matches!(not_base64, Err(CryptoError::Malformed(_))));

        let too_short: Result<serde_json::Value, _> = cipher.decrypt("AAAA");
        assert!(matches!(too_short, Err(CryptoError::Malformed(_))));
    }

    #[test]
    fn test_empty_key_material_rejected() {
        assert!(matches!(
            TokenCipher::new(CipherAlgorithm::Aes256Gcm, b""),
            Err(CryptoError::InvalidKeyMaterial)
        ));
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!(
            "aes-256-gcm".parse::<CipherAlgorithm>().unwrap(),
            CipherAlgorithm::Aes256Gcm
        );
        assert_eq!(
            "AES_128_GCM".parse::<CipherAlgorithm>().unwrap(),
            CipherAlgorithm::Aes128Gcm
        );
        assert!("DES".parse::<CipherAlgorithm>().is_err());
    }

    #[test]
    fn test_salt_differs_per_algorithm() {
        assert_ne!(
            compute_token_salt(CipherAlgorithm::Aes256Gcm),
            compute_token_salt(CipherAlgorithm::Aes128Gcm)
        );
    }

    #[test]
    fn test_constant_time_eq() {
        let a = [1u8, 2, 3, 4];
        let b = [1u8, 2, 3, 4];
        let c = [1u8, 2, 3, 5];

        assert!(constant_time_eq(&a, &b));
        assert!(!constant_time_eq(&a, &c));
        assert!(!constant_time_eq(&a, &[1u8, 2, 3]));
    }

    #[test]
    fn test_fingerprint_is_short_hex() {
        let label = fingerprint("some-token");
        assert_eq!(label.len(), 8);
        assert!(label.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
