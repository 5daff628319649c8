//! Append-only packet body encoder.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{Decimal, Encode, Writeable};

/// Generates one fixed-width little-endian writer per numeric type.
macro_rules! write_le {
    ($($name:ident: $ty:ty),* $(,)?) => {
        $(
            #[doc = concat!("Writes a little-endian `", stringify!($ty), "`.")]
            pub fn $name(&mut self, value: $ty) {
                self.buf.extend_from_slice(&value.to_le_bytes());
            }
        )*
    };
}

/// Builds a packet body.
///
/// Every value is written in a fixed-width little-endian layout and
/// variable-size values (strings, byte blobs, sequences) carry an `i32`
/// length prefix. Writing never fails; validation happens on the reading
/// side in [`PacketReader`](crate::PacketReader).
///
/// ```rust
/// use opwire_protocol::{PacketReader, PacketWriter};
///
/// let mut w = PacketWriter::new();
/// w.write_i64(100);
/// w.write_str("hello");
///
/// let bytes = w.into_bytes();
/// let mut r = PacketReader::new(&bytes);
/// assert_eq!(r.read_i64().unwrap(), 100);
/// assert_eq!(r.read_string().unwrap(), "hello");
/// ```
#[derive(Debug, Clone, Default)]
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty writer with room for `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Borrows the encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the writer and returns the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    write_le! {
        write_i8: i8,
        write_u8: u8,
        write_i16: i16,
        write_u16: u16,
        write_i32: i32,
        write_u32: u32,
        write_i64: i64,
        write_u64: u64,
        write_f32: f32,
        write_f64: f64,
    }

    /// Writes a boolean as a single `0` or `1` byte.
    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    /// Writes a `char` as its `u32` scalar value.
    pub fn write_char(&mut self, value: char) {
        self.write_u32(u32::from(value));
    }

    /// Writes a 16-byte decimal.
    pub fn write_decimal(&mut self, value: Decimal) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a 16-byte identifier (GUID/UUID bytes) without a prefix.
    pub fn write_guid(&mut self, value: &[u8; 16]) {
        self.buf.extend_from_slice(value);
    }

    /// Writes a duration as whole milliseconds in an `i64`.
    ///
    /// Durations longer than `i64::MAX` milliseconds saturate.
    pub fn write_duration(&mut self, value: Duration) {
        let millis = i64::try_from(value.as_millis()).unwrap_or(i64::MAX);
        self.write_i64(millis);
    }

    /// Writes a wall-clock time as signed milliseconds from the Unix epoch.
    pub fn write_timestamp(&mut self, value: SystemTime) {
        let millis = match value.duration_since(UNIX_EPOCH) {
            Ok(after) => i64::try_from(after.as_millis()).unwrap_or(i64::MAX),
            Err(before) => {
                i64::try_from(before.duration().as_millis()).map_or(i64::MIN, |m| -m)
            }
        };
        self.write_i64(millis);
    }

    /// Writes a string as an `i32` UTF-8 byte length followed by the bytes.
    ///
    /// The empty string is written as a zero length, so it stays
    /// self-delimiting when more fields follow it.
    pub fn write_str(&mut self, value: &str) {
        self.write_len(value.len());
        self.buf.extend_from_slice(value.as_bytes());
    }

    /// Writes a byte blob as an `i32` length followed by the raw bytes.
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.write_len(value.len());
        self.buf.extend_from_slice(value);
    }

    /// Writes a C-like enum as its `i32` discriminant.
    pub fn write_enum<E: Into<i32>>(&mut self, value: E) {
        self.write_i32(value.into());
    }

    /// Writes a nested packet inline, with no header or length of its own.
    pub fn write_packet<P: Writeable + ?Sized>(&mut self, packet: &P) {
        packet.write(self);
    }

    /// Writes any value implementing [`Encode`].
    pub fn write<T: Encode + ?Sized>(&mut self, value: &T) {
        value.encode(self);
    }

    /// Writes an `i32` element count followed by every element.
    pub fn write_seq<T: Encode>(&mut self, items: &[T]) {
        self.write_seq_with(items, |w, item| item.encode(w));
    }

    /// Writes an `i32` element count followed by each element using `f`.
    ///
    /// Handy for sequences of nested packets:
    ///
    /// ```rust,ignore
    /// w.write_seq_with(&self.players, |w, p| w.write_packet(p));
    /// ```
    pub fn write_seq_with<T, F>(&mut self, items: &[T], mut f: F)
    where
        F: FnMut(&mut Self, &T),
    {
        self.write_len(items.len());
        for item in items {
            f(self, item);
        }
    }

    fn write_len(&mut self, len: usize) {
        // Frames are capped well below i32::MAX, so anything longer could
        // never be sent anyway.
        debug_assert!(len <= i32::MAX as usize, "length {len} overflows i32");
        self.write_i32(len as i32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers_are_little_endian() {
        let mut w = PacketWriter::new();
        w.write_i32(0x0102_0304);
        w.write_u16(0xAABB);
        assert_eq!(w.as_bytes(), &[0x04, 0x03, 0x02, 0x01, 0xBB, 0xAA]);
    }

    #[test]
    fn test_string_prefix_is_byte_length() {
        let mut w = PacketWriter::new();
        w.write_str("héllo");
        let bytes = w.into_bytes();
        // "é" takes two bytes in UTF-8.
        assert_eq!(&bytes[..4], &6i32.to_le_bytes());
        assert_eq!(bytes.len(), 4 + 6);
    }

    #[test]
    fn test_empty_string_writes_zero_prefix() {
        let mut w = PacketWriter::new();
        w.write_str("");
        assert_eq!(w.as_bytes(), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_bool_is_one_byte() {
        let mut w = PacketWriter::new();
        w.write_bool(true);
        w.write_bool(false);
        assert_eq!(w.as_bytes(), &[1, 0]);
    }

    #[test]
    fn test_timestamp_before_epoch_is_negative() {
        let mut w = PacketWriter::new();
        w.write_timestamp(UNIX_EPOCH - Duration::from_millis(1500));
        assert_eq!(w.as_bytes(), &(-1500i64).to_le_bytes());
    }
}
