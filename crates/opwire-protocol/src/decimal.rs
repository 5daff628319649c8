//! A 128-bit decimal value with a 96-bit mantissa.

use std::fmt;

use crate::CodecError;

/// Fixed-point decimal number: `mantissa / 10^scale`.
///
/// The mantissa is limited to 96 bits plus a sign and the scale to 0..=28,
/// the range used by financial decimals on most platforms. On the wire it
/// takes 16 bytes: three little-endian `u32` words holding the mantissa
/// magnitude (low, mid, high) and a flags word holding the scale in bits
/// 16..24 and the sign in bit 31.
///
/// ```rust
/// use opwire_protocol::Decimal;
///
/// let price = Decimal::new(-12_345, 2).unwrap();
/// assert_eq!(price.to_string(), "-123.45");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Decimal {
    mantissa: i128,
    scale: u8,
}

const SCALE_MASK: u32 = 0x00FF_0000;
const SIGN_MASK: u32 = 0x8000_0000;

impl Decimal {
    /// Largest supported scale.
    pub const MAX_SCALE: u8 = 28;

    /// Largest magnitude the 96-bit mantissa can hold.
    pub const MAX_MANTISSA: i128 = (1 << 96) - 1;

    /// Creates a decimal from a raw mantissa and scale.
    ///
    /// # Errors
    /// Returns [`CodecError::InvalidDecimal`] if the mantissa does not fit
    /// in 96 bits or the scale exceeds [`Self::MAX_SCALE`].
    pub fn new(mantissa: i128, scale: u8) -> Result<Self, CodecError> {
        if scale > Self::MAX_SCALE {
            return Err(CodecError::InvalidDecimal(format!(
                "scale {scale} exceeds {}",
                Self::MAX_SCALE
            )));
        }
        if mantissa.unsigned_abs() > Self::MAX_MANTISSA as u128 {
            return Err(CodecError::InvalidDecimal(format!(
                "mantissa {mantissa} exceeds 96 bits"
            )));
        }
        Ok(Self { mantissa, scale })
    }

    /// The signed mantissa.
    pub fn mantissa(&self) -> i128 {
        self.mantissa
    }

    /// Number of digits after the decimal point.
    pub fn scale(&self) -> u8 {
        self.scale
    }

    pub(crate) fn to_le_bytes(self) -> [u8; 16] {
        let magnitude = self.mantissa.unsigned_abs();
        let mut flags = u32::from(self.scale) << 16;
        if self.mantissa < 0 {
            flags |= SIGN_MASK;
        }

        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&(magnitude as u32).to_le_bytes());
        out[4..8].copy_from_slice(&((magnitude >> 32) as u32).to_le_bytes());
        out[8..12].copy_from_slice(&((magnitude >> 64) as u32).to_le_bytes());
        out[12..16].copy_from_slice(&flags.to_le_bytes());
        out
    }

    pub(crate) fn from_le_bytes(bytes: [u8; 16]) -> Result<Self, CodecError> {
        let word = |i: usize| {
            u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]])
        };
        let (lo, mid, hi, flags) = (word(0), word(4), word(8), word(12));

        if flags & !(SCALE_MASK | SIGN_MASK) != 0 {
            return Err(CodecError::InvalidDecimal(format!(
                "reserved flag bits set: {flags:#010x}"
            )));
        }

        let magnitude =
            i128::from(lo) | (i128::from(mid) << 32) | (i128::from(hi) << 64);
        let mantissa = if flags & SIGN_MASK != 0 {
            -magnitude
        } else {
            magnitude
        };
        Self::new(mantissa, ((flags & SCALE_MASK) >> 16) as u8)
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.mantissa < 0 { "-" } else { "" };
        let digits = self.mantissa.unsigned_abs().to_string();
        let scale = usize::from(self.scale);
        if scale == 0 {
            return write!(f, "{sign}{digits}");
        }

        let padded = if digits.len() <= scale {
            format!("{}{digits}", "0".repeat(scale + 1 - digits.len()))
        } else {
            digits
        };
        let (int, frac) = padded.split_at(padded.len() - scale);
        write!(f, "{sign}{int}.{frac}")
    }
}
