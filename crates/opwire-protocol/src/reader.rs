//! Bounds-checked cursor over a packet body.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{CodecError, Decimal, Decode, Readable};

/// Generates one fixed-width little-endian reader per numeric type.
macro_rules! read_le {
    ($($name:ident: $ty:ty),* $(,)?) => {
        $(
            #[doc = concat!("Reads a little-endian `", stringify!($ty), "`.")]
            pub fn $name(&mut self) -> Result<$ty, CodecError> {
                Ok(<$ty>::from_le_bytes(self.array()?))
            }
        )*
    };
}

/// Reads values back out of a body produced by
/// [`PacketWriter`](crate::PacketWriter).
///
/// The reader borrows the buffer and advances a position. Every read
/// checks the remaining length first, and length prefixes are validated
/// before anything is allocated, so arbitrary input produces a
/// [`CodecError`] rather than a panic or a huge allocation.
#[derive(Debug, Clone)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    /// Creates a reader positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Returns `true` once every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    read_le! {
        read_i8: i8,
        read_u8: u8,
        read_i16: i16,
        read_u16: u16,
        read_i32: i32,
        read_u32: u32,
        read_i64: i64,
        read_u64: u64,
        read_f32: f32,
        read_f64: f64,
    }

    /// Reads a boolean byte, rejecting anything other than 0 or 1.
    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidBool(other)),
        }
    }

    /// Reads a `char` stored as a `u32` scalar value.
    pub fn read_char(&mut self) -> Result<char, CodecError> {
        let raw = self.read_u32()?;
        char::from_u32(raw).ok_or(CodecError::InvalidChar(raw))
    }

    /// Reads a 16-byte decimal.
    pub fn read_decimal(&mut self) -> Result<Decimal, CodecError> {
        Decimal::from_le_bytes(self.array()?)
    }

    /// Reads a 16-byte identifier.
    pub fn read_guid(&mut self) -> Result<[u8; 16], CodecError> {
        self.array()
    }

    /// Reads a duration stored as `i64` milliseconds.
    pub fn read_duration(&mut self) -> Result<Duration, CodecError> {
        let millis = self.read_i64()?;
        u64::try_from(millis)
            .map(Duration::from_millis)
            .map_err(|_| CodecError::InvalidDuration(millis))
    }

    /// Reads a wall-clock time stored as signed milliseconds from the epoch.
    pub fn read_timestamp(&mut self) -> Result<SystemTime, CodecError> {
        let millis = self.read_i64()?;
        let offset = Duration::from_millis(millis.unsigned_abs());
        let time = if millis >= 0 {
            UNIX_EPOCH.checked_add(offset)
        } else {
            UNIX_EPOCH.checked_sub(offset)
        };
        time.ok_or(CodecError::InvalidTimestamp(millis))
    }

    /// Reads an `i32` byte-length-prefixed UTF-8 string.
    ///
    /// A zero length yields the empty string.
    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_len()?;
        if len == 0 {
            return Ok(String::new());
        }
        let bytes = self.take(len)?;
        Ok(std::str::from_utf8(bytes)?.to_owned())
    }

    /// Reads an `i32` length-prefixed byte blob.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_len()?;
        Ok(self.take(len)?.to_vec())
    }

    /// Reads an `i32` discriminant and converts it with `TryFrom<i32>`.
    pub fn read_enum<E: TryFrom<i32>>(&mut self) -> Result<E, CodecError> {
        let value = self.read_i32()?;
        E::try_from(value).map_err(|_| CodecError::InvalidEnum {
            value,
            type_name: std::any::type_name::<E>(),
        })
    }

    /// Reads a nested packet written with
    /// [`write_packet`](crate::PacketWriter::write_packet).
    pub fn read_packet<P: Readable + Default>(&mut self) -> Result<P, CodecError> {
        let mut packet = P::default();
        packet.read(self)?;
        Ok(packet)
    }

    /// Reads any value implementing [`Decode`].
    pub fn read<T: Decode>(&mut self) -> Result<T, CodecError> {
        T::decode(self)
    }

    /// Reads an `i32` count followed by that many `T`s.
    pub fn read_seq<T: Decode>(&mut self) -> Result<Vec<T>, CodecError> {
        self.read_seq_with(T::decode)
    }

    /// Reads an `i32` count followed by that many elements decoded by `f`.
    pub fn read_seq_with<T, F>(&mut self, mut f: F) -> Result<Vec<T>, CodecError>
    where
        F: FnMut(&mut Self) -> Result<T, CodecError>,
    {
        let count = self.read_len()?;
        // Every element takes at least one byte, so the remaining length
        // bounds the allocation no matter what the count claims.
        let mut items = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            items.push(f(self)?);
        }
        Ok(items)
    }

    fn read_len(&mut self) -> Result<usize, CodecError> {
        let len = self.read_i32()?;
        usize::try_from(len).map_err(|_| CodecError::InvalidLength(len))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(CodecError::UnexpectedEof {
                needed: len,
                remaining,
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}
