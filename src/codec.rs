//! # Register Codec
//!
//! Conversion between raw register words and engineering values.
//!
//! ## Supported Data Types
//!
//! | Type | Registers | Aliases |
//! |------|-----------|---------|
//! | bool | 1 (or 1 bit) | boolean, coil, bit |
//! | u16 | 1 | uint16, word |
//! | i16 | 1 | int16, short |
//! | u32 | 2 | uint32, dword |
//! | i32 | 2 | int32, long |
//! | f32 | 2 | float32, float, real |
//! | u64 | 4 | uint64, qword |
//! | i64 | 4 | int64, longlong |
//! | f64 | 4 | float64, double, lreal |

use std::fmt;

use serde::Deserialize;

use crate::bytes::{reorder_words, u64_to_words, words_to_u64, ByteOrder};
use crate::error::{ModbusError, ModbusResult};

/// Data type of a point; determines its width and decode rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum DataType {
    Bool,
    UInt16,
    Int16,
    UInt32,
    Int32,
    Float32,
    UInt64,
    Int64,
    Float64,
}

impl DataType {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "bool" | "boolean" | "coil" | "bit" => Some(Self::Bool),
            "uint16" | "u16" | "word" => Some(Self::UInt16),
            "int16" | "i16" | "short" => Some(Self::Int16),
            "uint32" | "u32" | "dword" => Some(Self::UInt32),
            "int32" | "i32" | "long" => Some(Self::Int32),
            "float32" | "f32" | "float" | "real" => Some(Self::Float32),
            "uint64" | "u64" | "qword" => Some(Self::UInt64),
            "int64" | "i64" | "longlong" => Some(Self::Int64),
            "float64" | "f64" | "double" | "lreal" => Some(Self::Float64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::UInt16 => "uint16",
            Self::Int16 => "int16",
            Self::UInt32 => "uint32",
            Self::Int32 => "int32",
            Self::Float32 => "float32",
            Self::UInt64 => "uint64",
            Self::Int64 => "int64",
            Self::Float64 => "float64",
        }
    }

    /// Number of consecutive 16-bit registers the value occupies.
    #[inline]
    pub fn register_count(&self) -> u16 {
        match self {
            Self::Bool | Self::UInt16 | Self::Int16 => 1,
            Self::UInt32 | Self::Int32 | Self::Float32 => 2,
            Self::UInt64 | Self::Int64 | Self::Float64 => 4,
        }
    }

    /// Valid numeric range used to clamp outgoing writes.
    fn range(&self) -> (f64, f64) {
        match self {
            Self::Bool => (0.0, 1.0),
            Self::UInt16 => (0.0, f64::from(u16::MAX)),
            Self::Int16 => (f64::from(i16::MIN), f64::from(i16::MAX)),
            Self::UInt32 => (0.0, f64::from(u32::MAX)),
            Self::Int32 => (f64::from(i32::MIN), f64::from(i32::MAX)),
            Self::Float32 => (f64::from(f32::MIN), f64::from(f32::MAX)),
            Self::UInt64 => (0.0, u64::MAX as f64),
            Self::Int64 => (i64::MIN as f64, i64::MAX as f64),
            Self::Float64 => (f64::MIN, f64::MAX),
        }
    }

    /// Decode raw device words into a numeric value.
    ///
    /// `bit_position` only applies to `Bool` read from a register; a `Bool`
    /// without a bit position treats any non-zero word as `true`.
    pub fn decode(
        &self,
        words: &[u16],
        order: ByteOrder,
        bit_position: Option<u8>,
    ) -> ModbusResult<f64> {
        let needed = self.register_count() as usize;
        if words.len() < needed {
            return Err(ModbusError::invalid_data(format!(
                "Not enough registers for {}: need {}, got {}",
                self.as_str(),
                needed,
                words.len()
            )));
        }
        let words = &words[..needed];

        if let Self::Bool = self {
            let bit = match bit_position {
                Some(pos) if pos > 15 => {
                    return Err(ModbusError::invalid_data(format!(
                        "Invalid bit position: {} (must be 0-15)",
                        pos
                    )))
                }
                Some(pos) => (words[0] >> pos) & 0x01 != 0,
                None => words[0] != 0,
            };
            return Ok(if bit { 1.0 } else { 0.0 });
        }

        let normalized = reorder_words(words, order);
        let raw = words_to_u64(&normalized);
        let value = match self {
            Self::UInt16 => f64::from(raw as u16),
            Self::Int16 => f64::from(raw as u16 as i16),
            Self::UInt32 => f64::from(raw as u32),
            Self::Int32 => f64::from(raw as u32 as i32),
            Self::Float32 => f64::from(f32::from_bits(raw as u32)),
            Self::UInt64 => raw as f64,
            Self::Int64 => raw as i64 as f64,
            Self::Float64 => f64::from_bits(raw),
            Self::Bool => unreachable!("handled above"),
        };
        Ok(value)
    }

    /// Encode a value into device-ordered words, clamping to the type range.
    pub fn encode(&self, value: f64, order: ByteOrder) -> ModbusResult<Vec<u16>> {
        if value.is_nan() {
            return Err(ModbusError::invalid_data("Cannot encode NaN"));
        }
        let (min, max) = self.range();
        let clamped = value.clamp(min, max);

        let raw: u64 = match self {
            Self::Bool => return Ok(vec![u16::from(clamped != 0.0)]),
            Self::UInt16 => u64::from(clamped as u16),
            Self::Int16 => u64::from(clamped as i16 as u16),
            Self::UInt32 => u64::from(clamped as u32),
            Self::Int32 => u64::from(clamped as i32 as u32),
            Self::Float32 => u64::from((clamped as f32).to_bits()),
            Self::UInt64 => clamped as u64,
            Self::Int64 => clamped as i64 as u64,
            Self::Float64 => clamped.to_bits(),
        };
        let words = u64_to_words(raw, self.register_count() as usize);
        Ok(reorder_words(&words, order))
    }
}

impl TryFrom<String> for DataType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(&value).ok_or_else(|| format!("unsupported data type '{}'", value))
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Tests
// ============================================================================
