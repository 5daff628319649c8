//! Error types for the protocol layer.
//!
//! Everything that can go wrong while turning bytes into packets (or the
//! frame header into numbers) lands in [`CodecError`]. Encryption has its
//! own small error type because providers are supplied by the application.

/// Errors produced while decoding packet bodies or frame headers.
///
/// Encoding is infallible: a [`PacketWriter`](crate::PacketWriter) only
/// appends to a growable buffer. Every variant here therefore describes
/// input that came off the wire and did not make sense.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The buffer ended before the value was complete.
    ///
    /// Length fields are checked against the remaining buffer *before*
    /// anything is allocated, so a hostile length of `i32::MAX` ends up
    /// here instead of in a 2 GiB allocation.
    #[error("unexpected end of buffer: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof {
        /// Bytes the reader tried to consume.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// A length or count prefix was negative.
    #[error("invalid length prefix: {0}")]
    InvalidLength(i32),

    /// A string body was not valid UTF-8.
    #[error("invalid utf-8 in string: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// A boolean byte was neither 0 nor 1.
    #[error("invalid boolean byte: {0:#04x}")]
    InvalidBool(u8),

    /// A `char` was not a valid Unicode scalar value.
    #[error("invalid unicode scalar value: {0:#x}")]
    InvalidChar(u32),

    /// An `i32` did not map to any variant of the target enum.
    #[error("invalid value {value} for enum {type_name}")]
    InvalidEnum {
        /// The raw discriminant read from the wire.
        value: i32,
        /// The Rust type that rejected it.
        type_name: &'static str,
    },

    /// A duration was negative.
    #[error("negative duration: {0} ms")]
    InvalidDuration(i64),

    /// A timestamp does not fit in the platform clock.
    #[error("timestamp out of range: {0} ms from the unix epoch")]
    InvalidTimestamp(i64),

    /// A decimal had reserved flag bits set, a scale above 28, or a
    /// mantissa outside 96 bits.
    #[error("invalid decimal: {0}")]
    InvalidDecimal(String),
}

/// Error returned by an [`EncryptionProvider`](crate::EncryptionProvider).
#[derive(Debug, thiserror::Error)]
#[error("encryption failed: {0}")]
pub struct EncryptionError(pub String);

impl EncryptionError {
    /// Creates an error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}
