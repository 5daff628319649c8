//! Wire protocol for opwire.
//!
//! This crate defines what travels over a socket and nothing about how it
//! gets there:
//!
//! - **Values**: [`PacketWriter`] and [`PacketReader`] encode primitives,
//!   strings, decimals, timestamps, enums, nested packets and sequences in
//!   a fixed little-endian layout. [`Encode`]/[`Decode`] make those values
//!   usable from generic code.
//! - **Packets**: user messages implement [`Readable`] and [`Writeable`];
//!   the blanket [`Packet`] impl makes them routable as `Box<dyn Packet>`.
//!   [`Direction`] and [`Role`] decide which side sends and which receives.
//! - **Codec**: the [`Codec`] trait and its default [`BinaryCodec`].
//! - **Frames**: the 9-byte [`FrameHeader`] and the [`Frame`] it prefixes.
//! - **Encryption**: the [`EncryptionProvider`] capability.
//!
//! ```text
//! Packet --Codec--> body --EncryptionProvider?--> Frame --> transport
//! ```

// ---------------------------------------------------------------------------
// Module declarations
// ---------------------------------------------------------------------------

mod codec;
mod crypto;
mod decimal;
mod error;
mod frame;
mod packet;
mod reader;
mod wire;
mod writer;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use codec::{BinaryCodec, Codec};
pub use crypto::EncryptionProvider;
pub use decimal::Decimal;
pub use error::{CodecError, EncryptionError};
pub use frame::{Frame, FrameHeader, HEADER_LEN};
pub use packet::{Direction, Opcode, Packet, Readable, Role, Writeable};
pub use reader::PacketReader;
pub use wire::{Decode, Encode};
pub use writer::PacketWriter;
