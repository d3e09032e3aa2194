//! Pre-shared secret keyring
//!
//! Derives keystream fragments as `SHA256(nonce || secret || label)`.

use super::{sha256, DIGEST_LEN};
use std::fmt;
use std::sync::Arc;

/// Shared-secret keyring. Cloning is cheap and the keyring is immutable,
/// so one instance can serve every frame of every session.
#[derive(Clone)]
pub struct Keyring {
    secret: Arc<[u8]>,
}

impl Keyring {
    /// Create a keyring from the pre-shared secret
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: Arc::from(secret.as_ref()),
        }
    }

    /// Derive 32 bytes of keystream for `label` under `nonce`
    pub fn extract(&self, nonce: &[u8], label: &str) -> [u8; DIGEST_LEN] {
        let mut material =
            Vec::with_capacity(nonce.len() + self.secret.len() + label.len());
        material.extend_from_slice(nonce);
        material.extend_from_slice(&self.secret);
        material.extend_from_slice(label.as_bytes());
        sha256(&material)
    }
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Keyring([REDACTED])")
    }
}
