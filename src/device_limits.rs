//! # Device Limits Configuration
//!
//! Per-channel request limits used by the batch planner and the poll loop.
//! Every channel limit is clamped to the Modbus ceiling for its table:
//!
//! - **Read Holding/Input Registers (FC03/04)**: max 125 registers per request
//! - **Read Coils/Discrete Inputs (FC01/02)**: max 2000 bits per request

use std::time::Duration;

use crate::constants::{is_bit_function, read_ceiling};

/// Default register span per read request.
pub const DEFAULT_MAX_READ_REGISTERS: u16 = 125;

/// Default bit span per coil/discrete input read.
pub const DEFAULT_MAX_READ_COILS: u16 = 2000;

/// Default tolerated hole (unused units) between two points in one batch.
pub const DEFAULT_MAX_GAP: u16 = 5;

/// Default inter-request delay in milliseconds.
pub const DEFAULT_INTER_REQUEST_DELAY_MS: u64 = 0;

/// Device-specific limits for one channel.
///
/// # Example
///
/// ```rust
/// use voltage_acquisition::DeviceLimits;
///
/// let limits = DeviceLimits::new()
///     .with_max_read_registers(20)
///     .with_max_gap(0);
///
/// assert_eq!(limits.read_limit(0x03), 20);
/// assert_eq!(limits.read_limit(0x01), 2000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Maximum register span per FC03/04 read.
    pub max_read_registers: u16,
    /// Maximum bit span per FC01/02 read.
    pub max_read_coils: u16,
    /// Maximum unused units bridged when merging points into one batch.
    pub max_gap: u16,
    /// Minimum delay between consecutive batch requests (milliseconds).
    pub inter_request_delay_ms: u64,
}

impl DeviceLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits for slow devices: 50 registers, 500 bits, no gap bridging, 10ms pacing.
    pub fn conservative() -> Self {
        Self {
            max_read_registers: 50,
            max_read_coils: 500,
            max_gap: 0,
            inter_request_delay_ms: 10,
        }
    }

    pub fn with_max_read_registers(mut self, count: u16) -> Self {
        self.max_read_registers = count;
        self
    }

    pub fn with_max_read_coils(mut self, count: u16) -> Self {
        self.max_read_coils = count;
        self
    }

    pub fn with_max_gap(mut self, gap: u16) -> Self {
        self.max_gap = gap;
        self
    }

    pub fn with_inter_request_delay_ms(mut self, delay_ms: u64) -> Self {
        self.inter_request_delay_ms = delay_ms;
        self
    }

    /// Effective span limit for one read of `fc`: channel limit clamped to
    /// the protocol ceiling.
    #[inline]
    pub fn read_limit(&self, fc: u8) -> u16 {
        let configured = if is_bit_function(fc) {
            self.max_read_coils
        } else {
            self.max_read_registers
        };
        configured.min(read_ceiling(fc))
    }

    #[inline]
    pub fn inter_request_delay(&self) -> Duration {
        Duration::from_millis(self.inter_request_delay_ms)
    }
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            max_read_registers: DEFAULT_MAX_READ_REGISTERS,
            max_read_coils: DEFAULT_MAX_READ_COILS,
            max_gap: DEFAULT_MAX_GAP,
            inter_request_delay_ms: DEFAULT_INTER_REQUEST_DELAY_MS,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = DeviceLimits::default();
        assert_eq!(limits.read_limit(0x03), 125);
        assert_eq!(limits.read_limit(0x04), 125);
        assert_eq!(limits.read_limit(0x02), 2000);
        assert_eq!(limits.max_gap, DEFAULT_MAX_GAP);
    }

    #[test]
    fn test_limits_clamp_to_protocol_ceiling() {
        let limits = DeviceLimits::new()
            .with_max_read_registers(500)
            .with_max_read_coils(4000);
        assert_eq!(limits.read_limit(0x03), 125);
        assert_eq!(limits.read_limit(0x01), 2000);
    }

    #[test]
    fn test_conservative_limits() {
        let limits = DeviceLimits::conservative();
        assert_eq!(limits.read_limit(0x03), 50);
        assert_eq!(limits.read_limit(0x01), 500);
        assert_eq!(limits.inter_request_delay(), Duration::from_millis(10));
    }
}
