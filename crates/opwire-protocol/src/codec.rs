//! Pluggable packet body codec.
//!
//! The connection pipeline never calls `Readable`/`Writeable` directly; it
//! goes through a [`Codec`] chosen on the server or client builder. The
//! default [`BinaryCodec`] drives the packet's own read/write methods over
//! a [`PacketWriter`]/[`PacketReader`] pair.

use crate::{CodecError, Packet, PacketReader, PacketWriter};

/// Turns packets into body bytes and back.
///
/// Implementations must be `Send + Sync + 'static` because a single codec
/// is shared by every connection pump through an `Arc`.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a packet body.
    ///
    /// # Errors
    /// Returns a [`CodecError`] if the packet cannot be represented.
    fn encode(&self, packet: &dyn Packet) -> Result<Vec<u8>, CodecError>;

    /// Fills `packet` (a fresh default instance) from `body`.
    ///
    /// # Errors
    /// Returns a [`CodecError`] if the body is truncated or malformed.
    fn decode(&self, packet: &mut dyn Packet, body: &[u8]) -> Result<(), CodecError>;
}

/// The built-in little-endian binary codec.
///
/// Trailing bytes after the packet's last field are ignored, so a peer
/// that appends fields to a packet stays readable by an older build.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

impl Codec for BinaryCodec {
    fn encode(&self, packet: &dyn Packet) -> Result<Vec<u8>, CodecError> {
        let mut writer = PacketWriter::new();
        packet.write(&mut writer);
        Ok(writer.into_bytes())
    }

    fn decode(&self, packet: &mut dyn Packet, body: &[u8]) -> Result<(), CodecError> {
        let mut reader = PacketReader::new(body);
        packet.read(&mut reader)
    }
}
