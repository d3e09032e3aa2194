//! Frame encoding/decoding for the tunnel protocol
//!
//! Header format (20 bytes, multi-byte fields little-endian):
//! ```text
//! +--------+--------+--------+--------+--------+--------+
//! |                 Nonce (6B, clear)                   |
//! +--------+--------+--------+--------+--------+--------+
//! |        Timestamp (4B)             |  Ver   |  Cmd   |
//! +--------+--------+--------+--------+--------+--------+
//! |        Stream ID (4B)             |   Length (2B)   |
//! +--------+--------+--------+--------+--------+--------+
//! |  Checksum (2B)  |
//! +--------+--------+
//! ```
//!
//! Every field after the nonce is XOR-masked with
//! `keyring.extract(SHA256(nonce), label)`, one label per field. The checksum
//! is taken over the masked header and then masked itself, so it can only be
//! verified by a holder of the shared secret.

use super::TunnelError;
use crate::crypto::{random_bytes, sha256, Keyring, DIGEST_LEN};
use crate::protocol::{ProtocolError, PROTOCOL_VERSION, TIMESTAMP_TOLERANCE_SECS};
use bytes::{BufMut, Bytes, BytesMut};
use std::ops::Range;
use std::time::{SystemTime, UNIX_EPOCH};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 20;

/// Size of the clear per-frame nonce
pub const NONCE_SIZE: usize = 6;

const TIMESTAMP: Range<usize> = 6..10;
const VERSION: Range<usize> = 10..11;
const COMMAND: Range<usize> = 11..12;
const STREAM_ID: Range<usize> = 12..16;
const LENGTH: Range<usize> = 16..18;
const CHECKSUM: Range<usize> = 18..20;

/// Masked fields and their keystream labels
const MASKED_FIELDS: [(Range<usize>, &str); 5] = [
    (TIMESTAMP, "timestamp"),
    (VERSION, "version"),
    (COMMAND, "cmd"),
    (STREAM_ID, "sid"),
    (LENGTH, "len"),
];

const CHECKSUM_LABEL: &str = "chksum";

/// Frame commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Stream open
    Syn = 0x00,
    /// Stream half-close
    Fin = 0x01,
    /// Stream data
    Psh = 0x02,
    /// Keepalive
    Nop = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Command::Syn),
            0x01 => Ok(Command::Fin),
            0x02 => Ok(Command::Psh),
            0x03 => Ok(Command::Nop),
            _ => Err(ProtocolError::UnknownCommand(value)),
        }
    }
}

/// Decoded header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub command: Command,
    pub stream_id: u32,
    /// Length of the payload following the header on the wire
    pub length: u16,
}

/// A protocol frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub command: Command,
    /// Stream ID (0 for session-level frames)
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    /// Create a stream open frame
    pub fn syn(stream_id: u32) -> Self {
        Self {
            command: Command::Syn,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// Create a data frame
    pub fn psh(stream_id: u32, payload: Bytes) -> Self {
        Self {
            command: Command::Psh,
            stream_id,
            payload,
        }
    }

    /// Create a stream close frame
    pub fn fin(stream_id: u32) -> Self {
        Self {
            command: Command::Fin,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// Create a keepalive frame
    pub fn nop() -> Self {
        Self {
            command: Command::Nop,
            stream_id: 0,
            payload: Bytes::new(),
        }
    }
}

/// Masks, checksums and validates frame headers with a shared keyring
#[derive(Debug, Clone)]
pub struct FrameCodec {
    keyring: Keyring,
}

impl FrameCodec {
    pub fn new(keyring: Keyring) -> Self {
        Self { keyring }
    }

    /// Encode a frame: masked header followed by the payload as given
    pub fn encode(&self, frame: &Frame) -> Result<BytesMut, TunnelError> {
        let header = self.encode_header(frame.command, frame.stream_id, frame.payload.len())?;

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + frame.payload.len());
        buf.put_slice(&header);
        buf.put_slice(&frame.payload);
        Ok(buf)
    }

    /// Encode a header stamped with the current time
    pub fn encode_header(
        &self,
        command: Command,
        stream_id: u32,
        length: usize,
    ) -> Result<[u8; FRAME_HEADER_SIZE], TunnelError> {
        self.encode_header_at(command, stream_id, length, unix_now() as u32)
    }

    /// Encode a header with an explicit timestamp
    pub fn encode_header_at(
        &self,
        command: Command,
        stream_id: u32,
        length: usize,
        timestamp: u32,
    ) -> Result<[u8; FRAME_HEADER_SIZE], TunnelError> {
        let length =
            u16::try_from(length).map_err(|_| ProtocolError::PayloadTooLarge(length))?;

        let mut nonce = [0u8; NONCE_SIZE];
        random_bytes(&mut nonce)?;

        Ok(self.seal_header(nonce, command, stream_id, length, timestamp))
    }

    /// Decode a complete frame (header and payload) from `buf`
    pub fn decode(&self, buf: &[u8]) -> Result<Frame, ProtocolError> {
        let header = self.decode_header(buf)?;
        let end = FRAME_HEADER_SIZE + header.length as usize;
        if buf.len() < end {
            return Err(ProtocolError::InvalidHeader);
        }

        Ok(Frame {
            command: header.command,
            stream_id: header.stream_id,
            payload: Bytes::copy_from_slice(&buf[FRAME_HEADER_SIZE..end]),
        })
    }

    /// Validate and unmask a header against the current time
    pub fn decode_header(&self, buf: &[u8]) -> Result<FrameHeader, ProtocolError> {
        self.decode_header_at(buf, unix_now())
    }

    /// Validate and unmask a header against `now` (Unix seconds)
    pub fn decode_header_at(&self, buf: &[u8], now: i64) -> Result<FrameHeader, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::InvalidHeader);
        }
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header.copy_from_slice(&buf[..FRAME_HEADER_SIZE]);

        let iv = sha256(&header[..NONCE_SIZE]);

        // Integrity first: nothing else is trustworthy before this passes
        let checksum_mask = self.keyring.extract(&iv, CHECKSUM_LABEL);
        let received = [
            header[CHECKSUM.start] ^ checksum_mask[0],
            header[CHECKSUM.start + 1] ^ checksum_mask[1],
        ];
        header[CHECKSUM].copy_from_slice(&checksum_mask[..2]);
        let expected = sha256(&header);
        if received != expected[..2] {
            return Err(ProtocolError::DecryptFailed);
        }

        self.apply_field_masks(&mut header, &iv);

        let version = header[VERSION.start];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: version,
            });
        }

        let timestamp = u32::from_le_bytes([header[6], header[7], header[8], header[9]]);
        let skew = now - timestamp as i64;
        if skew.abs() > TIMESTAMP_TOLERANCE_SECS {
            return Err(ProtocolError::StaleTimestamp { skew });
        }

        let command = Command::try_from(header[COMMAND.start])?;
        let stream_id = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);
        let length = u16::from_le_bytes([header[16], header[17]]);

        Ok(FrameHeader {
            command,
            stream_id,
            length,
        })
    }

    fn seal_header(
        &self,
        nonce: [u8; NONCE_SIZE],
        command: Command,
        stream_id: u32,
        length: u16,
        timestamp: u32,
    ) -> [u8; FRAME_HEADER_SIZE] {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header[..NONCE_SIZE].copy_from_slice(&nonce);
        header[TIMESTAMP].copy_from_slice(&timestamp.to_le_bytes());
        header[VERSION.start] = PROTOCOL_VERSION;
        header[COMMAND.start] = command as u8;
        header[STREAM_ID].copy_from_slice(&stream_id.to_le_bytes());
        header[LENGTH].copy_from_slice(&length.to_le_bytes());

        let iv = sha256(&nonce);
        self.apply_field_masks(&mut header, &iv);

        let checksum_mask = self.keyring.extract(&iv, CHECKSUM_LABEL);
        header[CHECKSUM].copy_from_slice(&checksum_mask[..2]);
        let checksum = sha256(&header);
        header[CHECKSUM.start] = checksum[0] ^ checksum_mask[0];
        header[CHECKSUM.start + 1] = checksum[1] ^ checksum_mask[1];

        header
    }

    /// XOR every masked field with its keystream (self-inverse)
    fn apply_field_masks(&self, header: &mut [u8; FRAME_HEADER_SIZE], iv: &[u8; DIGEST_LEN]) {
        for (range, label) in MASKED_FIELDS {
            let keystream = self.keyring.extract(iv, label);
            for (byte, mask) in header[range].iter_mut().zip(keystream.iter()) {
                *byte ^= mask;
            }
        }
    }
}

/// Current Unix time in seconds
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}
