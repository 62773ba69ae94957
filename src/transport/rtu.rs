//! Modbus RTU transport over a serial line
//!
//! The bus is half-duplex and multi-drop: one outstanding request per
//! channel, and at least 3.5 character times of silence between frames.
//! Response length is derived from the function code and byte count, and
//! every frame is CRC-checked. A malformed or CRC-failed response fails
//! only the request it answered.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, timeout, Instant};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

use super::{parse_read, read_request, ModbusTransport, TransportStats, WriteRequest};
use crate::backoff::ReconnectBackoff;
use crate::constants::MAX_RTU_FRAME_SIZE;
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{decode_rtu, encode_rtu, expected_rtu_response_len, rtu_frame_silence};
use crate::model::{Channel, Parity, Point, TransportConfig};
use crate::pdu::ModbusPdu;
use crate::planner::ReadBatch;

/// Serial line parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub device: String,
    pub baud_rate: u32,
    pub data_bits: tokio_serial::DataBits,
    pub stop_bits: tokio_serial::StopBits,
    pub parity: tokio_serial::Parity,
}

pub struct RtuTransport {
    settings: SerialSettings,
    request_timeout: Duration,
    silence: Duration,
    port: Option<SerialStream>,
    last_activity: Option<Instant>,
    reconnect: ReconnectBackoff,
    stats: TransportStats,
    last_request: Vec<u8>,
    last_response: Vec<u8>,
}

impl RtuTransport {
    pub fn new(
        settings: SerialSettings,
        request_timeout: Duration,
        reconnect_initial: Duration,
        reconnect_max: Duration,
    ) -> Self {
        Self {
            silence: rtu_frame_silence(settings.baud_rate),
            settings,
            request_timeout,
            port: None,
            last_activity: None,
            reconnect: ReconnectBackoff::new(reconnect_initial, reconnect_max),
            stats: TransportStats::default(),
            last_request: Vec::new(),
            last_response: Vec::new(),
        }
    }

    pub fn for_channel(channel: &Channel) -> ModbusResult<Self> {
        let TransportConfig::Rtu {
            device,
            baud_rate,
            data_bits,
            stop_bits,
            parity,
        } = &channel.transport
        else {
            return Err(ModbusError::configuration(format!(
                "Channel {} is not an RTU channel",
                channel.id
            )));
        };

        let data_bits = match data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            8 => tokio_serial::DataBits::Eight,
            other => {
                return Err(ModbusError::configuration(format!(
                    "Unsupported data bits: {}",
                    other
                )))
            }
        };
        let stop_bits = match stop_bits {
            1 => tokio_serial::StopBits::One,
            2 => tokio_serial::StopBits::Two,
            other => {
                return Err(ModbusError::configuration(format!(
                    "Unsupported stop bits: {}",
                    other
                )))
            }
        };
        let parity = match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };

        Ok(Self::new(
            SerialSettings {
                device: device.clone(),
                baud_rate: *baud_rate,
                data_bits,
                stop_bits,
                parity,
            },
            channel.request_timeout,
            channel.retry.reconnect_initial,
            channel.retry.reconnect_max,
        ))
    }

    async fn wait_for_silence(&self) {
        if let Some(last) = self.last_activity {
            let elapsed = last.elapsed();
            if elapsed < self.silence {
                sleep(self.silence - elapsed).await;
            }
        }
    }

    async fn exchange(&mut self, slave: u8, pdu: &ModbusPdu) -> ModbusResult<ModbusPdu> {
        self.connect().await?;
        self.wait_for_silence().await;

        let frame = encode_rtu(slave, pdu);
        self.last_request.clear();
        self.last_request.extend_from_slice(&frame);
        self.last_response.clear();

        let port = self
            .port
            .as_mut()
            .ok_or_else(|| ModbusError::connection("Serial port not open"))?;
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;

        let result = match timeout(
            self.request_timeout,
            transact(port, &frame, slave, &mut self.last_response),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ModbusError::timeout(
                format!("slave {} on {}", slave, self.settings.device),
                self.request_timeout.as_millis() as u64,
            )),
        };
        self.last_activity = Some(Instant::now());

        match &result {
            Ok(_) => {
                self.stats.responses_received += 1;
                self.stats.bytes_received += self.last_response.len() as u64;
            }
            Err(err) if err.is_connection_error() => {
                self.stats.record_error(err);
                warn!("RTU port {} dropped: {}", self.settings.device, err);
                self.port = None;
            }
            Err(err) => {
                self.stats.record_error(err);
                // Leftover bytes of a bad frame would corrupt the next response
                if let Some(port) = self.port.as_mut() {
                    if let Err(e) = port.clear(tokio_serial::ClearBuffer::Input) {
                        debug!("RTU clear input: {}", e);
                    }
                }
            }
        }
        result
    }
}

/// Write one RTU frame and read back exactly one response frame.
pub(crate) async fn transact<S>(
    port: &mut S,
    frame: &[u8],
    slave: u8,
    raw_response: &mut Vec<u8>,
) -> ModbusResult<ModbusPdu>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    port.write_all(frame).await?;
    port.flush().await?;

    let mut head = [0u8; 3];
    port.read_exact(&mut head).await?;
    let total = expected_rtu_response_len(&head)?;
    if total > MAX_RTU_FRAME_SIZE {
        return Err(ModbusError::frame(format!(
            "RTU response length {} exceeds {}",
            total, MAX_RTU_FRAME_SIZE
        )));
    }

    raw_response.clear();
    raw_response.extend_from_slice(&head);
    raw_response.resize(total, 0);
    port.read_exact(&mut raw_response[3..]).await?;

    let (address, pdu) = decode_rtu(raw_response)?;
    if address != slave {
        return Err(ModbusError::protocol(format!(
            "Response from slave {}, expected {}",
            address, slave
        )));
    }
    Ok(pdu)
}

impl ModbusTransport for RtuTransport {
    async fn connect(&mut self) -> ModbusResult<()> {
        if self.port.is_some() {
            return Ok(());
        }
        if let Some(wait) = self.reconnect.remaining(Instant::now()) {
            return Err(ModbusError::Backoff {
                retry_in_ms: wait.as_millis() as u64,
            });
        }

        debug!("RTU: {} @{}baud", self.settings.device, self.settings.baud_rate);
        let opened = tokio_serial::new(&self.settings.device, self.settings.baud_rate)
            .data_bits(self.settings.data_bits)
            .stop_bits(self.settings.stop_bits)
            .parity(self.settings.parity)
            .timeout(self.request_timeout)
            .open_native_async();

        match opened {
            Ok(port) => {
                self.port = Some(port);
                self.last_activity = None;
                self.reconnect.record_success();
                self.stats.connects += 1;
                info!("RTU opened: {}", self.settings.device);
                Ok(())
            }
            Err(e) => {
                let delay = self.reconnect.record_failure(Instant::now());
                self.stats.connect_failures += 1;
                warn!(
                    "RTU open {} failed ({}), next attempt in {}ms",
                    self.settings.device,
                    e,
                    delay.as_millis()
                );
                Err(ModbusError::connection(format!(
                    "Failed to open serial port {}: {}",
                    self.settings.device, e
                )))
            }
        }
    }

    async fn execute_read(&mut self, batch: &ReadBatch) -> ModbusResult<Vec<u16>> {
        let request = read_request(batch)?;
        let response = self.exchange(batch.slave_id, &request).await?;
        parse_read(batch, &response).inspect_err(|e| self.stats.record_error(e))
    }

    async fn execute_write(&mut self, point: &Point, words: &[u16]) -> ModbusResult<()> {
        let request = WriteRequest::for_point(point, words)?;
        let response = self.exchange(point.slave_id, &request.pdu).await?;
        request
            .check_response(&response)
            .inspect_err(|e| self.stats.record_error(e))
    }

    async fn close(&mut self) -> ModbusResult<()> {
        if self.port.take().is_some() {
            info!("RTU closed: {}", self.settings.device);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn stats(&self) -> TransportStats {
        self.stats
    }

    fn last_frames(&self) -> (&[u8], &[u8]) {
        (&self.last_request, &self.last_response)
    }
}
