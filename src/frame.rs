//! ADU framing for Modbus TCP (MBAP) and Modbus RTU (CRC-16)

use std::time::Duration;

use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_16_MODBUS};
use tracing::debug;

use crate::constants::{
    FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER,
    MAX_MBAP_LENGTH, MAX_RTU_FRAME_SIZE, MBAP_HEADER_LEN, MIN_RTU_FRAME_SIZE,
};
use crate::error::{ModbusError, ModbusResult};
use crate::pdu::ModbusPdu;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

// ============================================================================
// TCP / MBAP
// ============================================================================

/// Decoded MBAP header plus unit id (first 7 bytes of a TCP ADU).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Byte count following the length field: unit id + PDU
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    /// Bytes still to read after the 7-byte header.
    #[inline]
    pub fn pdu_len(&self) -> usize {
        self.length as usize - 1
    }

    pub fn parse(raw: &[u8; MBAP_HEADER_LEN + 1]) -> ModbusResult<Self> {
        let header = Self {
            transaction_id: u16::from_be_bytes([raw[0], raw[1]]),
            protocol_id: u16::from_be_bytes([raw[2], raw[3]]),
            length: u16::from_be_bytes([raw[4], raw[5]]),
            unit_id: raw[6],
        };

        if header.protocol_id != 0 {
            return Err(ModbusError::frame(format!(
                "Invalid protocol ID: expected 0, got {}",
                header.protocol_id
            )));
        }
        if header.length < 2 || header.length as usize > MAX_MBAP_LENGTH {
            return Err(ModbusError::frame(format!(
                "Invalid MBAP length field: {}",
                header.length
            )));
        }
        Ok(header)
    }
}

/// Build a TCP ADU: MBAP header, unit id, PDU.
pub fn encode_tcp(transaction_id: u16, unit_id: u8, pdu: &ModbusPdu) -> BytesMut {
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
    frame.put_u16(transaction_id);
    frame.put_u16(0);
    frame.put_u16((pdu.len() + 1) as u16);
    frame.put_u8(unit_id);
    frame.put_slice(pdu.as_slice());
    debug!(
        transaction_id,
        unit_id,
        len = frame.len(),
        "Built TCP frame"
    );
    frame
}

/// Wrapping MBAP transaction id source; one per connection.
#[derive(Debug, Default)]
pub struct TransactionIds {
    next: u16,
}

impl TransactionIds {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    #[inline]
    pub fn next_id(&mut self) -> u16 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }
}

// ============================================================================
// RTU
// ============================================================================

#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// Build an RTU ADU: slave address, PDU, CRC (low byte first).
pub fn encode_rtu(slave: u8, pdu: &ModbusPdu) -> BytesMut {
    let mut frame = BytesMut::with_capacity(1 + pdu.len() + 2);
    frame.put_u8(slave);
    frame.put_slice(pdu.as_slice());
    let crc = crc16(&frame);
    frame.put_u16_le(crc);
    frame
}

/// Verify an RTU ADU and return its slave address and PDU.
pub fn decode_rtu(frame: &[u8]) -> ModbusResult<(u8, ModbusPdu)> {
    if frame.len() < MIN_RTU_FRAME_SIZE {
        return Err(ModbusError::frame(format!(
            "RTU frame too short: {} bytes",
            frame.len()
        )));
    }
    if frame.len() > MAX_RTU_FRAME_SIZE {
        return Err(ModbusError::frame(format!(
            "RTU frame too long: {} bytes",
            frame.len()
        )));
    }

    let body_len = frame.len() - 2;
    let received = u16::from_le_bytes([frame[body_len], frame[body_len + 1]]);
    let calculated = crc16(&frame[..body_len]);
    if received != calculated {
        return Err(ModbusError::Crc {
            expected: calculated,
            actual: received,
        });
    }

    Ok((frame[0], ModbusPdu::from_slice(&frame[1..body_len])?))
}

/// Total RTU response length, derived from the first three bytes
/// (slave, function code, byte count or address high byte).
pub fn expected_rtu_response_len(head: &[u8; 3]) -> ModbusResult<usize> {
    let fc = head[1];
    if fc & 0x80 != 0 {
        return Ok(MIN_RTU_FRAME_SIZE);
    }
    match fc {
        0x01..=0x04 => Ok(3 + head[2] as usize + 2),
        FC_WRITE_SINGLE_COIL | FC_WRITE_SINGLE_REGISTER | FC_WRITE_MULTIPLE_REGISTERS => Ok(8),
        other => Err(ModbusError::invalid_function(other)),
    }
}

/// Minimum silence between RTU frames: 3.5 character times at 11 bits per
/// character, fixed at 1750µs above 19200 baud.
pub fn rtu_frame_silence(baud_rate: u32) -> Duration {
    if baud_rate == 0 || baud_rate > 19_200 {
        return Duration::from_micros(1_750);
    }
    let micros = 3.5 * 11.0 * 1_000_000.0 / f64::from(baud_rate);
    Duration::from_micros(micros.ceil() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::PduBuilder;

    #[test]
    fn test_encode_tcp_frame() {
        let pdu = PduBuilder::read_request(0x03, 0x0000, 10).unwrap();
        let frame = encode_tcp(0x1234, 0x01, &pdu);
        assert_eq!(
            &frame[..],
            &[0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]
        );
    }

    #[test]
    fn test_parse_mbap_header() {
        let header = MbapHeader::parse(&[0x00, 0x07, 0x00, 0x00, 0x00, 0x05, 0x02]).unwrap();
        assert_eq!(header.transaction_id, 7);
        assert_eq!(header.unit_id, 2);
        assert_eq!(header.pdu_len(), 4);

        assert!(MbapHeader::parse(&[0, 1, 0, 1, 0, 5, 1]).is_err());
        assert!(MbapHeader::parse(&[0, 1, 0, 0, 0, 1, 1]).is_err());
    }

    #[test]
    fn test_transaction_ids_wrap() {
        let mut ids = TransactionIds { next: u16::MAX };
        assert_eq!(ids.next_id(), u16::MAX);
        assert_eq!(ids.next_id(), 0);
        assert_eq!(ids.next_id(), 1);
    }

    #[test]
    fn test_crc16_known_vector() {
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
    }

    #[test]
    fn test_rtu_roundtrip_and_crc_failure() {
        let pdu = PduBuilder::read_request(0x03, 0x0000, 1).unwrap();
        let frame = encode_rtu(0x01, &pdu);
        assert_eq!(
            &frame[..],
            &[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]
        );

        let (slave, parsed) = decode_rtu(&frame).unwrap();
        assert_eq!(slave, 1);
        assert_eq!(parsed.as_slice(), pdu.as_slice());

        let mut corrupted = frame.to_vec();
        corrupted[3] ^= 0xFF;
        assert!(matches!(
            decode_rtu(&corrupted),
            Err(ModbusError::Crc { .. })
        ));
    }

    #[test]
    fn test_expected_rtu_len() {
        assert_eq!(expected_rtu_response_len(&[1, 0x03, 4]).unwrap(), 9);
        assert_eq!(expected_rtu_response_len(&[1, 0x83, 2]).unwrap(), 5);
        assert_eq!(expected_rtu_response_len(&[1, 0x06, 0]).unwrap(), 8);
        assert!(expected_rtu_response_len(&[1, 0x2B, 0]).is_err());
    }

    #[test]
    fn test_frame_silence() {
        // 9600 baud: 3.5 * 11 / 9600 s ≈ 4011µs
        assert_eq!(rtu_frame_silence(9_600), Duration::from_micros(4_011));
        assert_eq!(rtu_frame_silence(115_200), Duration::from_micros(1_750));
    }
}
