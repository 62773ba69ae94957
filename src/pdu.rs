//! Modbus PDU construction and response parsing
//!
//! Requests are built into a fixed-size stack buffer. Responses are parsed
//! strictly: a byte count that disagrees with the requested quantity is a
//! decode failure for the whole batch, never a partial result.

use tracing::debug;

use crate::constants::{
    is_bit_function, FC_READ_COILS, FC_READ_INPUT_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER, MAX_PDU_SIZE, MAX_WRITE_REGISTERS,
};
use crate::error::{ModbusError, ModbusResult};

/// PDU backed by a stack array
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Copy a received PDU out of a frame.
    pub fn from_slice(data: &[u8]) -> ModbusResult<Self> {
        if data.is_empty() {
            return Err(ModbusError::frame("Empty PDU"));
        }
        if data.len() > MAX_PDU_SIZE {
            return Err(ModbusError::frame(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }

        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();
        Ok(pdu)
    }

    #[inline]
    pub fn push(&mut self, byte: u8) -> ModbusResult<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(ModbusError::protocol("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    #[inline]
    pub fn push_u16(&mut self, value: u16) -> ModbusResult<()> {
        self.push((value >> 8) as u8)?;
        self.push((value & 0xFF) as u8)
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        if self.len > 0 {
            Some(self.data[0])
        } else {
            None
        }
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & 0x80 != 0)
            .unwrap_or(false)
    }

    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() && self.len > 1 {
            Some(self.data[1])
        } else {
            None
        }
    }

    fn u16_at(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.data[offset], self.data[offset + 1]])
    }

    /// Check function code and turn exception responses into errors.
    fn expect_function(&self, fc: u8) -> ModbusResult<()> {
        let actual = self
            .function_code()
            .ok_or_else(|| ModbusError::frame("Empty PDU"))?;
        if actual == (fc | 0x80) {
            let code = self.exception_code().ok_or_else(|| {
                ModbusError::frame("Exception response without exception code")
            })?;
            return Err(ModbusError::exception(actual, code));
        }
        if actual != fc {
            return Err(ModbusError::protocol(format!(
                "Function code mismatch: expected 0x{:02X}, got 0x{:02X}",
                fc, actual
            )));
        }
        Ok(())
    }

    /// Parse a FC01-04 response into one word per requested unit.
    ///
    /// Register tables yield raw registers; bit tables yield `0`/`1` per bit.
    pub fn parse_read_response(&self, fc: u8, quantity: u16) -> ModbusResult<Vec<u16>> {
        self.expect_function(fc)?;
        if self.len < 2 {
            return Err(ModbusError::frame("Read response missing byte count"));
        }

        let byte_count = self.data[1] as usize;
        let expected = if is_bit_function(fc) {
            (quantity as usize + 7) / 8
        } else {
            quantity as usize * 2
        };
        if byte_count != expected || self.len != 2 + byte_count {
            return Err(ModbusError::invalid_data(format!(
                "Unexpected byte count for FC{:02X} qty {}: header {}, payload {}, expected {}",
                fc,
                quantity,
                byte_count,
                self.len.saturating_sub(2),
                expected
            )));
        }

        let payload = &self.data[2..2 + byte_count];
        let words = if is_bit_function(fc) {
            (0..quantity as usize)
                .map(|i| u16::from((payload[i / 8] >> (i % 8)) & 0x01))
                .collect()
        } else {
            payload
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect()
        };
        debug!(fc, quantity, byte_count, "Parsed read response");
        Ok(words)
    }

    /// Validate a write echo (FC05/06/16) against the request fields.
    ///
    /// FC05/06 echo address and value; FC16 echoes address and quantity.
    pub fn parse_write_response(&self, fc: u8, address: u16, value: u16) -> ModbusResult<()> {
        self.expect_function(fc)?;
        if self.len != 5 {
            return Err(ModbusError::invalid_data(format!(
                "Write response must be 5 bytes, got {}",
                self.len
            )));
        }
        let echoed_address = self.u16_at(1);
        let echoed_value = self.u16_at(3);
        if echoed_address != address || echoed_value != value {
            return Err(ModbusError::protocol(format!(
                "Write echo mismatch: sent {}/{}, got {}/{}",
                address, value, echoed_address, echoed_value
            )));
        }
        Ok(())
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable description of a function code.
pub fn function_code_description(fc: u8) -> &'static str {
    match fc & 0x7F {
        0x01 => "Read Coils",
        0x02 => "Read Discrete Inputs",
        0x03 => "Read Holding Registers",
        0x04 => "Read Input Registers",
        0x05 => "Write Single Coil",
        0x06 => "Write Single Register",
        0x10 => "Write Multiple Registers",
        _ => "Unknown Function",
    }
}

/// Fluent request builder
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PduBuilder {
    #[inline]
    pub fn new() -> Self {
        Self {
            pdu: ModbusPdu::new(),
        }
    }

    #[inline]
    pub fn function_code(mut self, fc: u8) -> ModbusResult<Self> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    #[inline]
    pub fn word(mut self, value: u16) -> ModbusResult<Self> {
        self.pdu.push_u16(value)?;
        Ok(self)
    }

    #[inline]
    pub fn byte(mut self, b: u8) -> ModbusResult<Self> {
        self.pdu.push(b)?;
        Ok(self)
    }

    #[inline]
    pub fn build(self) -> ModbusPdu {
        self.pdu
    }

    /// Read request for FC01-04.
    pub fn read_request(fc: u8, start_address: u16, quantity: u16) -> ModbusResult<ModbusPdu> {
        if !(FC_READ_COILS..=FC_READ_INPUT_REGISTERS).contains(&fc) {
            return Err(ModbusError::invalid_function(fc));
        }
        if quantity == 0 || quantity > crate::constants::read_ceiling(fc) {
            return Err(ModbusError::invalid_data(format!(
                "Read quantity {} out of range for FC{:02X}",
                quantity, fc
            )));
        }
        Ok(PduBuilder::new()
            .function_code(fc)?
            .word(start_address)?
            .word(quantity)?
            .build())
    }

    /// FC05, coil forced ON (0xFF00) or OFF (0x0000).
    pub fn write_single_coil(address: u16, on: bool) -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_SINGLE_COIL)?
            .word(address)?
            .word(coil_value(on))?
            .build())
    }

    /// FC06
    pub fn write_single_register(address: u16, value: u16) -> ModbusResult<ModbusPdu> {
        Ok(PduBuilder::new()
            .function_code(FC_WRITE_SINGLE_REGISTER)?
            .word(address)?
            .word(value)?
            .build())
    }

    /// FC16
    pub fn write_multiple_registers(address: u16, values: &[u16]) -> ModbusResult<ModbusPdu> {
        if values.is_empty() || values.len() > MAX_WRITE_REGISTERS as usize {
            return Err(ModbusError::invalid_data(format!(
                "Write quantity {} out of range (1-{})",
                values.len(),
                MAX_WRITE_REGISTERS
            )));
        }

        let mut builder = PduBuilder::new()
            .function_code(FC_WRITE_MULTIPLE_REGISTERS)?
            .word(address)?
            .word(values.len() as u16)?
            .byte((values.len() * 2) as u8)?;
        for &value in values {
            builder = builder.word(value)?;
        }
        Ok(builder.build())
    }
}

/// Wire value of a FC05 coil state.
#[inline]
pub fn coil_value(on: bool) -> u16 {
    if on {
        0xFF00
    } else {
        0x0000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{FC_READ_COILS, FC_READ_HOLDING_REGISTERS};

    #[test]
    fn test_build_read_request() {
        let pdu = PduBuilder::read_request(FC_READ_HOLDING_REGISTERS, 0x006B, 3).unwrap();
        assert_eq!(pdu.as_slice(), &[0x03, 0x00, 0x6B, 0x00, 0x03]);
    }

    #[test]
    fn test_read_request_rejects_bad_input() {
        assert!(PduBuilder::read_request(0x07, 0, 1).is_err());
        assert!(PduBuilder::read_request(FC_READ_HOLDING_REGISTERS, 0, 126).is_err());
        assert!(PduBuilder::read_request(FC_READ_COILS, 0, 2000).is_ok());
        assert!(PduBuilder::read_request(FC_READ_COILS, 0, 0).is_err());
    }

    #[test]
    fn test_build_write_single_coil() {
        let pdu = PduBuilder::write_single_coil(0x00AC, true).unwrap();
        assert_eq!(pdu.as_slice(), &[0x05, 0x00, 0xAC, 0xFF, 0x00]);
    }

    #[test]
    fn test_build_write_multiple_registers() {
        let pdu = PduBuilder::write_multiple_registers(0x0001, &[0x000A, 0x0102]).unwrap();
        assert_eq!(
            pdu.as_slice(),
            &[0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]
        );
        assert!(PduBuilder::write_multiple_registers(0, &[0; 124]).is_err());
    }

    #[test]
    fn test_parse_register_response() {
        let pdu = ModbusPdu::from_slice(&[0x03, 0x04, 0x12, 0x34, 0x56, 0x78]).unwrap();
        let words = pdu
            .parse_read_response(FC_READ_HOLDING_REGISTERS, 2)
            .unwrap();
        assert_eq!(words, vec![0x1234, 0x5678]);
    }

    #[test]
    fn test_parse_coil_response_unpacks_bits() {
        // 10 coils: 0b1100_1101, 0b0000_0001
        let pdu = ModbusPdu::from_slice(&[0x01, 0x02, 0xCD, 0x01]).unwrap();
        let bits = pdu.parse_read_response(FC_READ_COILS, 10).unwrap();
        assert_eq!(bits, vec![1, 0, 1, 1, 0, 0, 1, 1, 1, 0]);
    }

    #[test]
    fn test_parse_short_response_is_decode_error() {
        let pdu = ModbusPdu::from_slice(&[0x03, 0x04, 0x12, 0x34]).unwrap();
        let err = pdu
            .parse_read_response(FC_READ_HOLDING_REGISTERS, 2)
            .unwrap_err();
        assert_eq!(err.kind(), "decode");
    }

    #[test]
    fn test_parse_exception_response() {
        let pdu = ModbusPdu::from_slice(&[0x83, 0x02]).unwrap();
        assert!(pdu.is_exception());
        let err = pdu
            .parse_read_response(FC_READ_HOLDING_REGISTERS, 1)
            .unwrap_err();
        assert!(matches!(
            err,
            ModbusError::Exception {
                function: 0x03,
                code: 0x02,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_write_echo() {
        let pdu = ModbusPdu::from_slice(&[0x06, 0x00, 0x01, 0x00, 0x03]).unwrap();
        assert!(pdu
            .parse_write_response(FC_WRITE_SINGLE_REGISTER, 1, 3)
            .is_ok());
        assert!(pdu
            .parse_write_response(FC_WRITE_SINGLE_REGISTER, 1, 4)
            .is_err());
    }
}
