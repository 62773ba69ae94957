//! Protocol limits, function codes and exception codes
//!
//! Everything is sized from the 253-byte PDU ceiling (a 256-byte serial
//! ADU minus slave address and CRC). Per-channel limits are clamped to
//! these before the planner sees them.

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Modbus MBAP header length for TCP, without the unit id
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2) = 6 bytes
pub const MBAP_HEADER_LEN: usize = 6;

/// Largest PDU: 256 - slave(1) - CRC(2)
pub const MAX_PDU_SIZE: usize = 253;

/// Largest value of the MBAP length field (unit id + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Maximum RTU ADU size: slave address + PDU + CRC
pub const MAX_RTU_FRAME_SIZE: usize = 1 + MAX_PDU_SIZE + 2;

/// Smallest RTU frame worth parsing: slave + FC + exception code + CRC(2)
pub const MIN_RTU_FRAME_SIZE: usize = 5;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Register ceiling for one FC03/FC04 read.
///
/// Response PDU: FC(1) + Byte Count(1) + N × 2 ≤ 253 → N ≤ 125
pub const MAX_READ_REGISTERS: u16 = 125;

/// Register ceiling for one FC16 write.
///
/// Request PDU: FC(1) + Addr(2) + Qty(2) + Byte Count(1) + N × 2 ≤ 253 → N ≤ 123
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Bit ceiling for one FC01/FC02 read.
///
/// Response PDU: FC(1) + Byte Count(1) + ceil(N / 8) ≤ 253.
/// The Modbus standard rounds this down to 2000.
pub const MAX_READ_COILS: u16 = 2000;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Coils (FC01)
pub const FC_READ_COILS: u8 = 0x01;

/// Read Discrete Inputs (FC02)
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;

/// Read Holding Registers (FC03)
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;

/// Read Input Registers (FC04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Write Single Coil (FC05)
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// True for the bit-addressed read tables (FC01/FC02).
#[inline]
pub fn is_bit_function(fc: u8) -> bool {
    matches!(fc, FC_READ_COILS | FC_READ_DISCRETE_INPUTS)
}

/// Protocol ceiling on quantity for one read request of `fc`.
#[inline]
pub fn read_ceiling(fc: u8) -> u16 {
    if is_bit_function(fc) {
        MAX_READ_COILS
    } else {
        MAX_READ_REGISTERS
    }
}

// ============================================================================
// Exception codes (see also `error::exception_description`)
// ============================================================================

/// Illegal Function
pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;

/// Illegal Data Address
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// Illegal Data Value
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Server Device Failure
pub const EXCEPTION_SERVER_DEVICE_FAILURE: u8 = 0x04;

/// Acknowledge
pub const EXCEPTION_ACKNOWLEDGE: u8 = 0x05;

/// Server Device Busy
pub const EXCEPTION_SERVER_DEVICE_BUSY: u8 = 0x06;

/// Memory Parity Error
pub const EXCEPTION_MEMORY_PARITY_ERROR: u8 = 0x08;

/// Gateway Path Unavailable
pub const EXCEPTION_GATEWAY_PATH_UNAVAILABLE: u8 = 0x0A;

/// Gateway Target Device Failed to Respond
pub const EXCEPTION_GATEWAY_TARGET_FAILED: u8 = 0x0B;
