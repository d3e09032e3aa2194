//! Payload sealing
//!
//! ChaCha20-Poly1305 over frame payloads. Every frame is sealed under its own
//! key, derived from the shared secret, the frame's clear header nonce and the
//! direction of travel. The masked header is bound in as associated data.
//!
//! The AEAD nonce is a per-direction counter; frames on one physical
//! connection are strictly ordered, so sender and receiver counters advance in
//! lockstep and a frame replayed within the session fails to open.

use super::{sha256, CryptoError, Keyring, KEY_LEN, NONCE_LEN, TAG_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};

/// Direction of travel of a sealed payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Initiator -> Responder
    InitiatorToResponder,
    /// Responder -> Initiator
    ResponderToInitiator,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::InitiatorToResponder => "payload-i2r",
            Direction::ResponderToInitiator => "payload-r2i",
        }
    }
}

/// AEAD cipher for one direction of a session
pub struct PayloadCipher {
    keyring: Keyring,
    direction: Direction,
    nonce_counter: u64,
}

impl PayloadCipher {
    /// Cipher for `direction` under the shared keyring
    pub fn new(keyring: &Keyring, direction: Direction) -> Self {
        Self {
            keyring: keyring.clone(),
            direction,
            nonce_counter: 0,
        }
    }

    /// Seal `plaintext` for the frame whose clear nonce is `frame_nonce` and
    /// whose wire header is `header`, returning ciphertext with the tag appended
    pub fn seal(
        &mut self,
        frame_nonce: &[u8],
        header: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let key = self.frame_key(frame_nonce)?;
        let nonce = Nonce::assume_unique_for_key(self.next_nonce());
        let mut buffer = Vec::with_capacity(plaintext.len() + TAG_LEN);
        buffer.extend_from_slice(plaintext);

        key.seal_in_place_append_tag(nonce, Aad::from(header), &mut buffer)
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;

        Ok(buffer)
    }

    /// Open a sealed payload, verifying the tag against the frame header
    pub fn open(
        &mut self,
        frame_nonce: &[u8],
        header: &[u8],
        sealed: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let key = self.frame_key(frame_nonce)?;
        let nonce = Nonce::assume_unique_for_key(self.next_nonce());
        let mut buffer = sealed.to_vec();

        let len = key
            .open_in_place(nonce, Aad::from(header), &mut buffer)
            .map_err(|_| CryptoError::Decryption("open failed".to_string()))?
            .len();
        buffer.truncate(len);

        Ok(buffer)
    }

    /// Key for a single frame
    fn frame_key(&self, frame_nonce: &[u8]) -> Result<LessSafeKey, CryptoError> {
        let key: [u8; KEY_LEN] = self
            .keyring
            .extract(&sha256(frame_nonce), self.direction.label());
        let unbound_key = UnboundKey::new(&CHACHA20_POLY1305, &key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(LessSafeKey::new(unbound_key))
    }

    /// Generate the next nonce (monotonic counter)
    fn next_nonce(&mut self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        // Counter in little-endian in the last 8 bytes
        nonce[4..12].copy_from_slice(&self.nonce_counter.to_le_bytes());
        self.nonce_counter += 1;
        nonce
    }

    /// Number of payloads processed so far
    pub fn nonce_counter(&self) -> u64 {
        self.nonce_counter
    }
}
