//! K-line frame codec.
//!
//! A frame on the wire is `2 + n` bytes: a header byte whose high nibble is
//! the frame identifier and whose low nibble is the payload length `n`,
//! followed by `n` payload bytes and a trailing checksum. The checksum is
//! the byte-sum of everything before it, modulo 256.

use std::fmt;

use crate::error::FrameError;

/// Highest encodable frame identifier (the id occupies one nibble).
pub const MAX_ID: u8 = 15;

/// Longest encodable payload (the length occupies one nibble).
pub const MAX_PAYLOAD_LEN: usize = 15;

/// Frame identifiers with fixed meaning on the ISM bus.
///
/// The set is not closed: the module may emit other identifiers, and the
/// dispatcher passes every well-formed frame through regardless of id.
pub mod ids {
    /// Init/handshake frame, always carried with an empty payload.
    pub const INIT: u8 = 0;
    /// RF transponder command channel (field on/off, identifier read).
    pub const RF: u8 = 2;
    /// Periodic keep-alive carrying the rolling code.
    pub const KEEP_ALIVE: u8 = 10;
    /// ISM state vector, a 3-byte snapshot of key position and flags.
    pub const STATE: u8 = 14;
}

/// A single K-line frame: an identifier in `0..=15` and up to 15 payload
/// bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    id: u8,
    payload: Vec<u8>,
}

impl Frame {
    /// Create a frame from an identifier and payload.
    ///
    /// # Panics
    ///
    /// Panics if `id > 15` or the payload exceeds 15 bytes. Both are
    /// programmer errors; frames read off the wire can never violate the
    /// bounds because each field is a single nibble.
    #[must_use]
    pub fn new(id: u8, payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();
        assert!(id <= MAX_ID, "frame id {id} out of range");
        assert!(
            payload.len() <= MAX_PAYLOAD_LEN,
            "payload of {} bytes exceeds the {MAX_PAYLOAD_LEN}-byte limit",
            payload.len()
        );
        Self { id, payload }
    }

    /// The frame identifier.
    #[must_use]
    pub fn id(&self) -> u8 {
        self.id
    }

    /// The payload bytes (checksum and header excluded).
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Total on-wire length of a frame whose first byte is `first`.
    #[must_use]
    pub const fn expected_len(first: u8) -> usize {
        2 + (first & 0x0F) as usize
    }

    /// On-wire length of this frame (header + payload + checksum).
    #[must_use]
    pub fn wire_len(&self) -> usize {
        self.payload.len() + 2
    }

    /// Encode the frame into its on-wire byte sequence.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        out.push((self.id << 4) | self.payload.len() as u8);
        out.extend_from_slice(&self.payload);
        out.push(byte_sum(&out));
        out
    }

    /// Decode an on-wire byte sequence into a frame.
    ///
    /// `bytes` must be exactly one frame: the header-declared length is
    /// checked against the slice length before the checksum is verified.
    /// Frames with id 0 are canonicalized to an empty payload whatever the
    /// wire carried between header and checksum.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < 2 {
            return Err(FrameError::Truncated(bytes.len()));
        }
        let expected = Self::expected_len(bytes[0]);
        if bytes.len() != expected {
            return Err(FrameError::Length {
                expected,
                actual: bytes.len(),
            });
        }
        let computed = byte_sum(&bytes[..expected - 1]);
        let trailing = bytes[expected - 1];
        if computed != trailing {
            return Err(FrameError::Checksum {
                expected: computed,
                actual: trailing,
                bytes: bytes.to_vec(),
            });
        }
        let id = bytes[0] >> 4;
        if id == ids::INIT {
            return Ok(Self::new(id, Vec::new()));
        }
        Ok(Self::new(id, &bytes[1..expected - 1]))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:", self.id)?;
        for byte in &self.payload {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

fn byte_sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

// =============================================================================
// Tests
// =============================================================================
