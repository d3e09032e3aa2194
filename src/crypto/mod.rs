//! Cryptographic primitives for veiltun
//!
//! This module provides:
//! - The pre-shared-secret keyring used to mask frame headers
//! - ChaCha20-Poly1305 payload sealing under per-frame keys
//! - SHA-256 and secure random number generation

mod cipher;
mod keyring;

pub use cipher::{Direction, PayloadCipher};
pub use keyring::Keyring;

use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of AEAD nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Length of a SHA-256 digest in bytes
pub const DIGEST_LEN: usize = 32;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Random number generation failed")]
    Random,
}

/// SHA-256 of `data`
pub fn sha256(data: &[u8]) -> [u8; DIGEST_LEN] {
    let digest = ring::digest::digest(&ring::digest::SHA256, data);
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(digest.as_ref());
    out
}

/// Fill `buf` with cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).map_err(|_| CryptoError::Random)
}

/// Generate a random pre-shared key, base64 encoded
pub fn generate_key() -> Result<String, CryptoError> {
    use base64::Engine;
    let mut key = [0u8; KEY_LEN];
    random_bytes(&mut key)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(key))
}
