//! The frame header that precedes every packet body on the wire.
//!
//! ```text
//! +------------------+-----------------+--------------------+-----------+
//! | opcode (4 bytes) | encrypted (1 B) | body_len (4 bytes) | body      |
//! | i32 LE           | 0 or 1          | i32 LE             | body_len  |
//! +------------------+-----------------+--------------------+-----------+
//! ```
//!
//! `body_len` counts the body bytes exactly as they appear on the wire,
//! i.e. after encryption when the flag is set.

use crate::{CodecError, Opcode, PacketReader, PacketWriter};

/// Size of the encoded header.
pub const HEADER_LEN: usize = 9;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Packet opcode.
    pub opcode: Opcode,
    /// Whether the body went through the encryption provider.
    pub encrypted: bool,
    /// Length of the body that follows. Never exceeds `i32::MAX`.
    pub body_len: u32,
}

impl FrameHeader {
    /// Encodes the header into its fixed 9-byte form.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut w = PacketWriter::with_capacity(HEADER_LEN);
        w.write_i32(self.opcode);
        w.write_bool(self.encrypted);
        w.write_i32(self.body_len as i32);

        let mut out = [0u8; HEADER_LEN];
        out.copy_from_slice(w.as_bytes());
        out
    }

    /// Decodes a header.
    ///
    /// # Errors
    /// [`CodecError::InvalidBool`] for an encrypted flag other than 0/1 and
    /// [`CodecError::InvalidLength`] for a negative body length.
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Result<Self, CodecError> {
        let mut r = PacketReader::new(bytes);
        let opcode = r.read_i32()?;
        let encrypted = r.read_bool()?;
        let body_len = r.read_i32()?;
        let body_len = u32::try_from(body_len).map_err(|_| CodecError::InvalidLength(body_len))?;
        Ok(Self {
            opcode,
            encrypted,
            body_len,
        })
    }
}

/// A complete frame read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Packet opcode.
    pub opcode: Opcode,
    /// Whether the body is encrypted.
    pub encrypted: bool,
    /// Body bytes, still encrypted if `encrypted` is set.
    pub body: Vec<u8>,
}
