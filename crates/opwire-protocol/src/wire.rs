//! `Encode`/`Decode`: value-level codec traits.
//!
//! These let generic code (sequences, helper functions) write and read any
//! supported value without naming the specific `write_*`/`read_*` method.
//! Packets themselves use [`Readable`](crate::Readable) and
//! [`Writeable`](crate::Writeable) instead, because the registry builds
//! them from a default instance.

use std::time::{Duration, SystemTime};

use crate::{CodecError, Decimal, PacketReader, PacketWriter};

/// A value that can append itself to a [`PacketWriter`].
pub trait Encode {
    /// Writes `self` to `writer`.
    fn encode(&self, writer: &mut PacketWriter);
}

/// A value that can be read from a [`PacketReader`].
pub trait Decode: Sized {
    /// Reads one value.
    ///
    /// # Errors
    /// Returns a [`CodecError`] if the input is truncated or malformed.
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError>;
}

macro_rules! impl_wire {
    ($($ty:ty => $write:ident, $read:ident;)*) => {
        $(
            impl Encode for $ty {
                fn encode(&self, writer: &mut PacketWriter) {
                    writer.$write(*self);
                }
            }

            impl Decode for $ty {
                fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
                    reader.$read()
                }
            }
        )*
    };
}

impl_wire! {
    bool => write_bool, read_bool;
    i8 => write_i8, read_i8;
    u8 => write_u8, read_u8;
    i16 => write_i16, read_i16;
    u16 => write_u16, read_u16;
    i32 => write_i32, read_i32;
    u32 => write_u32, read_u32;
    i64 => write_i64, read_i64;
    u64 => write_u64, read_u64;
    f32 => write_f32, read_f32;
    f64 => write_f64, read_f64;
    char => write_char, read_char;
    Decimal => write_decimal, read_decimal;
    Duration => write_duration, read_duration;
    SystemTime => write_timestamp, read_timestamp;
}

impl Encode for str {
    fn encode(&self, writer: &mut PacketWriter) {
        writer.write_str(self);
    }
}

impl Encode for String {
    fn encode(&self, writer: &mut PacketWriter) {
        writer.write_str(self);
    }
}

impl Decode for String {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        reader.read_string()
    }
}

impl Encode for [u8; 16] {
    fn encode(&self, writer: &mut PacketWriter) {
        writer.write_guid(self);
    }
}

impl Decode for [u8; 16] {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        reader.read_guid()
    }
}

impl<T: Encode> Encode for [T] {
    fn encode(&self, writer: &mut PacketWriter) {
        writer.write_seq(self);
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, writer: &mut PacketWriter) {
        writer.write_seq(self);
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(reader: &mut PacketReader<'_>) -> Result<Self, CodecError> {
        reader.read_seq()
    }
}
