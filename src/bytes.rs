//! # Byte Order Handling
//!
//! Word/byte order for values spanning several 16-bit registers.
//! Uses ABCD notation where A is the most significant byte.
//!
//! For 32-bit value `0x12345678`:
//! - `BigEndian (ABCD)`: \[0x1234, 0x5678\]
//! - `LittleEndian (DCBA)`: \[0x7856, 0x3412\]
//! - `BigEndianSwap (CDAB)`: \[0x5678, 0x1234\]
//! - `LittleEndianSwap (BADC)`: \[0x3412, 0x7856\]

use std::fmt;

use serde::Deserialize;

/// Register word/byte order for multi-register values.
///
/// Deserializes from the usual PLC spellings (`"ABCD"`, `"cdab"`, `"big_endian"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum ByteOrder {
    /// ABCD, network order
    #[default]
    BigEndian,
    /// DCBA
    LittleEndian,
    /// CDAB, words swapped; very common on Modbus meters
    BigEndianSwap,
    /// BADC, bytes swapped within each word
    LittleEndianSwap,
}

impl ByteOrder {
    /// Parse a byte order from its configuration spelling.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        match normalized.as_str() {
            "ABCD" | "AB" | "BE" | "BIGENDIAN" | "ABCDEFGH" => Some(Self::BigEndian),
            "DCBA" | "BA" | "LE" | "LITTLEENDIAN" | "HGFEDCBA" => Some(Self::LittleEndian),
            "CDAB" | "BIGENDIANSWAP" | "GHEFCDAB" => Some(Self::BigEndianSwap),
            "BADC" | "LITTLEENDIANSWAP" | "BADCFEHG" => Some(Self::LittleEndianSwap),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BigEndian => "ABCD",
            Self::LittleEndian => "DCBA",
            Self::BigEndianSwap => "CDAB",
            Self::LittleEndianSwap => "BADC",
        }
    }

    #[inline]
    fn swaps_bytes(&self) -> bool {
        matches!(self, Self::LittleEndian | Self::LittleEndianSwap)
    }

    #[inline]
    fn reverses_words(&self) -> bool {
        matches!(self, Self::LittleEndian | Self::BigEndianSwap)
    }
}

impl TryFrom<String> for ByteOrder {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(&value).ok_or_else(|| format!("unknown byte order '{}'", value))
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize device registers into big-endian (ABCD...) word order.
///
/// The operation is an involution, so the same function converts
/// ABCD words back into device order for writes.
pub fn reorder_words(regs: &[u16], order: ByteOrder) -> Vec<u16> {
    let mut out: Vec<u16> = if order.reverses_words() {
        regs.iter().rev().copied().collect()
    } else {
        regs.to_vec()
    };
    if order.swaps_bytes() {
        for word in &mut out {
            *word = word.swap_bytes();
        }
    }
    out
}

/// Pack big-endian-ordered words into a `u64`, most significant first.
#[inline]
pub fn words_to_u64(words: &[u16]) -> u64 {
    words
        .iter()
        .fold(0u64, |acc, &w| (acc << 16) | u64::from(w))
}

/// Split the low `count` words of `value` into big-endian order.
#[inline]
pub fn u64_to_words(value: u64, count: usize) -> Vec<u16> {
    (0..count)
        .rev()
        .map(|i| (value >> (16 * i)) as u16)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str_aliases() {
        assert_eq!(ByteOrder::from_str("ABCD"), Some(ByteOrder::BigEndian));
        assert_eq!(ByteOrder::from_str("cdab"), Some(ByteOrder::BigEndianSwap));
        assert_eq!(
            ByteOrder::from_str("little_endian"),
            Some(ByteOrder::LittleEndian)
        );
        assert_eq!(ByteOrder::from_str("BADC"), Some(ByteOrder::LittleEndianSwap));
        assert_eq!(ByteOrder::from_str("XYZW"), None);
    }

    #[test]
    fn test_reorder_words_32bit() {
        // 0x12345678 as the device sends it under each order
        assert_eq!(
            reorder_words(&[0x1234, 0x5678], ByteOrder::BigEndian),
            vec![0x1234, 0x5678]
        );
        assert_eq!(
            reorder_words(&[0x5678, 0x1234], ByteOrder::BigEndianSwap),
            vec![0x1234, 0x5678]
        );
        assert_eq!(
            reorder_words(&[0x7856, 0x3412], ByteOrder::LittleEndian),
            vec![0x1234, 0x5678]
        );
        assert_eq!(
            reorder_words(&[0x3412, 0x7856], ByteOrder::LittleEndianSwap),
            vec![0x1234, 0x5678]
        );
    }

    #[test]
    fn test_reorder_is_involution() {
        let device = [0x0102, 0x0304, 0x0506, 0x0708];
        for order in [
            ByteOrder::BigEndian,
            ByteOrder::LittleEndian,
            ByteOrder::BigEndianSwap,
            ByteOrder::LittleEndianSwap,
        ] {
            let normalized = reorder_words(&device, order);
            assert_eq!(reorder_words(&normalized, order), device.to_vec());
        }
    }

    #[test]
    fn test_words_u64_packing() {
        assert_eq!(words_to_u64(&[0x1234, 0x5678]), 0x1234_5678);
        assert_eq!(u64_to_words(0x1234_5678, 2), vec![0x1234, 0x5678]);
        assert_eq!(
            u64_to_words(0x0001_0002_0003_0004, 4),
            vec![1, 2, 3, 4]
        );
    }

    #[test]
    fn test_deserialize_from_yaml() {
        let order: ByteOrder = serde_yaml::from_str("\"CDAB\"").unwrap();
        assert_eq!(order, ByteOrder::BigEndianSwap);
        assert!(serde_yaml::from_str::<ByteOrder>("\"QQQQ\"").is_err());
    }
}
