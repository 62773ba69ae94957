//! # Transport Adapter
//!
//! One request/response exchange per call, with connection lifecycle and
//! per-request timeouts. The poll scheduler and command executor only see
//! [`ModbusTransport`]; [`ChannelTransport`] picks TCP or RTU from the
//! channel configuration at load time.
//!
//! PDU construction and parsing live here and are shared by both
//! variants; each variant only adds its own framing.

use std::future::Future;

use crate::constants::{
    FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER,
};
use crate::error::{ModbusError, ModbusResult};
use crate::model::{Channel, Point, TransportConfig};
use crate::pdu::{coil_value, ModbusPdu, PduBuilder};
use crate::planner::ReadBatch;

pub mod tcp;

#[cfg(feature = "rtu")]
pub mod rtu;

pub use tcp::TcpTransport;

#[cfg(feature = "rtu")]
pub use rtu::RtuTransport;

/// Counters kept by every transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub connects: u64,
    pub connect_failures: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl TransportStats {
    /// Count an error outcome.
    pub(crate) fn record_error(&mut self, err: &ModbusError) {
        self.errors += 1;
        if err.is_timeout() {
            self.timeouts += 1;
        }
    }
}

/// Capability set shared by the TCP and RTU transports.
pub trait ModbusTransport: Send {
    /// Establish the link if it is down. Honors the reconnect backoff and
    /// fails with [`ModbusError::Backoff`] while it is in effect.
    fn connect(&mut self) -> impl Future<Output = ModbusResult<()>> + Send;

    /// Read one batch. Returns one word per register, or one `0`/`1` word
    /// per bit for FC01/02.
    fn execute_read(
        &mut self,
        batch: &ReadBatch,
    ) -> impl Future<Output = ModbusResult<Vec<u16>>> + Send;

    /// Write already-encoded device words to a point.
    fn execute_write(
        &mut self,
        point: &Point,
        words: &[u16],
    ) -> impl Future<Output = ModbusResult<()>> + Send;

    fn close(&mut self) -> impl Future<Output = ModbusResult<()>> + Send;

    fn is_connected(&self) -> bool;

    fn stats(&self) -> TransportStats;

    /// Raw request and response ADUs of the most recent exchange.
    fn last_frames(&self) -> (&[u8], &[u8]) {
        (&[], &[])
    }
}

// ============================================================================
// Shared request construction
// ============================================================================

/// A write PDU plus the echo the device must return.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub function_code: u8,
    pub address: u16,
    /// Value (FC05/06) or quantity (FC16) echoed by the device
    pub echo: u16,
    pub pdu: ModbusPdu,
}

impl WriteRequest {
    pub fn for_point(point: &Point, words: &[u16]) -> ModbusResult<Self> {
        let function_code = point.write_function().ok_or_else(|| {
            ModbusError::configuration(format!("Point {} is not writable", point.id))
        })?;
        if words.is_empty() {
            return Err(ModbusError::invalid_data("No data to write"));
        }

        let (pdu, echo) = match function_code {
            FC_WRITE_SINGLE_COIL => {
                let on = words[0] != 0;
                (
                    PduBuilder::write_single_coil(point.address, on)?,
                    coil_value(on),
                )
            }
            FC_WRITE_SINGLE_REGISTER => (
                PduBuilder::write_single_register(point.address, words[0])?,
                words[0],
            ),
            FC_WRITE_MULTIPLE_REGISTERS => (
                PduBuilder::write_multiple_registers(point.address, words)?,
                words.len() as u16,
            ),
            other => return Err(ModbusError::invalid_function(other)),
        };

        Ok(Self {
            function_code,
            address: point.address,
            echo,
            pdu,
        })
    }

    pub fn check_response(&self, response: &ModbusPdu) -> ModbusResult<()> {
        response.parse_write_response(self.function_code, self.address, self.echo)
    }
}

/// Read PDU for a planned batch.
#[inline]
pub fn read_request(batch: &ReadBatch) -> ModbusResult<ModbusPdu> {
    PduBuilder::read_request(batch.function_code, batch.start, batch.quantity)
}

/// Parse a batch read response into words.
#[inline]
pub fn parse_read(batch: &ReadBatch, response: &ModbusPdu) -> ModbusResult<Vec<u16>> {
    response.parse_read_response(batch.function_code, batch.quantity)
}

// ============================================================================
// Channel transport
// ============================================================================

/// Transport selected per channel.
pub enum ChannelTransport {
    Tcp(TcpTransport),
    #[cfg(feature = "rtu")]
    Rtu(RtuTransport),
}

impl ChannelTransport {
    /// Build the (not yet connected) transport for a channel.
    pub fn for_channel(channel: &Channel) -> ModbusResult<Self> {
        match &channel.transport {
            TransportConfig::Tcp { host, port } => Ok(Self::Tcp(TcpTransport::new(
                format!("{}:{}", host, port),
                channel.connect_timeout,
                channel.request_timeout,
                channel.retry.reconnect_initial,
                channel.retry.reconnect_max,
            ))),
            #[cfg(feature = "rtu")]
            TransportConfig::Rtu { .. } => Ok(Self::Rtu(RtuTransport::for_channel(channel)?)),
            #[cfg(not(feature = "rtu"))]
            TransportConfig::Rtu { .. } => Err(ModbusError::configuration(
                "RTU transport requires the `rtu` feature",
            )),
        }
    }
}

impl ModbusTransport for ChannelTransport {
    async fn connect(&mut self) -> ModbusResult<()> {
        match self {
            Self::Tcp(t) => t.connect().await,
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.connect().await,
        }
    }

    async fn execute_read(&mut self, batch: &ReadBatch) -> ModbusResult<Vec<u16>> {
        match self {
            Self::Tcp(t) => t.execute_read(batch).await,
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.execute_read(batch).await,
        }
    }

    async fn execute_write(&mut self, point: &Point, words: &[u16]) -> ModbusResult<()> {
        match self {
            Self::Tcp(t) => t.execute_write(point, words).await,
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.execute_write(point, words).await,
        }
    }

    async fn close(&mut self) -> ModbusResult<()> {
        match self {
            Self::Tcp(t) => t.close().await,
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.close().await,
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            Self::Tcp(t) => t.is_connected(),
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.is_connected(),
        }
    }

    fn stats(&self) -> TransportStats {
        match self {
            Self::Tcp(t) => t.stats(),
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.stats(),
        }
    }

    fn last_frames(&self) -> (&[u8], &[u8]) {
        match self {
            Self::Tcp(t) => t.last_frames(),
            #[cfg(feature = "rtu")]
            Self::Rtu(t) => t.last_frames(),
        }
    }
}
