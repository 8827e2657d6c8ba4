//! A very simple u4/nibble implementation.
//!
//! HID++2.0 packs the function ID and the software ID into a single byte, so
//! nibbles show up in every 2.0 report header.

use std::fmt;

/// Represents an unsigned 4-bit value (nibble) encoded as a byte.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct U4(u8);

impl U4 {
    /// Constructs a nibble from the 4 low/rightmost bits of a byte.
    pub const fn from_lo(raw: u8) -> Self {
        Self(raw & 0x0f)
    }

    /// Constructs a nibble from the 4 high/leftmost bits of a byte.
    pub const fn from_hi(raw: u8) -> Self {
        Self(raw >> 4)
    }

    /// Returns the nibble as the 4 low/rightmost bits of a byte.
    pub const fn to_lo(self) -> u8 {
        self.0
    }

    /// Returns the nibble as the 4 high/leftmost bits of a byte.
    pub const fn to_hi(self) -> u8 {
        self.0 << 4
    }

    /// Combines two nibbles into a byte, `hi` becoming the 4 leftmost and `lo`
    /// the 4 rightmost bits.
    pub const fn combine(hi: U4, lo: U4) -> u8 {
        hi.to_hi() | lo.to_lo()
    }

    /// Splits a byte into its high and low nibbles.
    pub const fn split(raw: u8) -> (U4, U4) {
        (Self::from_hi(raw), Self::from_lo(raw))
    }
}

impl fmt::Debug for U4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "U4({:#x})", self.0)
    }
}

impl fmt::Display for U4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl From<U4> for u8 {
    fn from(value: U4) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_out_of_range_bits() {
        assert_eq!(U4::from_lo(0xab).to_lo(), 0x0b);
        assert_eq!(U4::from_hi(0xab).to_lo(), 0x0a);
    }

    #[test]
    fn combine_and_split_are_inverse() {
        for raw in 0..=u8::MAX {
            let (hi, lo) = U4::split(raw);
            assert_eq!(U4::combine(hi, lo), raw);
        }
    }
}
