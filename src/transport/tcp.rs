//! Modbus TCP transport
//!
//! One persistent connection per channel. Every request carries the next
//! MBAP transaction id; responses with any other id are read and dropped
//! until the matching one arrives or the request timeout fires. A timeout
//! leaves the connection open: bytes already received stay in the read
//! buffer, so a reply cut short by the timeout is completed and discarded
//! by the next request. Connection and framing errors drop the link, and
//! the next request reconnects subject to the reconnect backoff.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::{parse_read, read_request, ModbusTransport, TransportStats, WriteRequest};
use crate::backoff::ReconnectBackoff;
use crate::constants::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN};
use crate::error::{ModbusError, ModbusResult};
use crate::frame::{encode_tcp, MbapHeader, TransactionIds};
use crate::model::Point;
use crate::pdu::ModbusPdu;
use crate::planner::ReadBatch;

pub struct TcpTransport {
    address: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    stream: Option<TcpStream>,
    read_buffer: BytesMut,
    transaction_ids: TransactionIds,
    reconnect: ReconnectBackoff,
    stats: TransportStats,
    last_request: Vec<u8>,
    last_response: Vec<u8>,
}

impl TcpTransport {
    /// Create a disconnected transport for `host:port`.
    pub fn new(
        address: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
        reconnect_initial: Duration,
        reconnect_max: Duration,
    ) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
            request_timeout,
            stream: None,
            read_buffer: BytesMut::with_capacity(MBAP_HEADER_LEN + MAX_MBAP_LENGTH),
            transaction_ids: TransactionIds::new(),
            reconnect: ReconnectBackoff::new(reconnect_initial, reconnect_max),
            stats: TransportStats::default(),
            last_request: Vec::new(),
            last_response: Vec::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    fn connect_failed(&mut self, err: ModbusError) -> ModbusError {
        let delay = self.reconnect.record_failure(Instant::now());
        self.stats.connect_failures += 1;
        warn!(
            "TCP connect to {} failed ({}), next attempt in {}ms",
            self.address,
            err,
            delay.as_millis()
        );
        err
    }

    /// Send one PDU and wait for the response carrying the same transaction id.
    async fn exchange(&mut self, unit_id: u8, pdu: &ModbusPdu) -> ModbusResult<ModbusPdu> {
        self.connect().await?;

        let transaction_id = self.transaction_ids.next_id();
        let frame = encode_tcp(transaction_id, unit_id, pdu);
        self.last_request.clear();
        self.last_request.extend_from_slice(&frame);
        self.last_response.clear();

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ModbusError::connection("Not connected"))?;
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;

        let result = match timeout(
            self.request_timeout,
            transact(
                stream,
                &frame,
                transaction_id,
                &mut self.read_buffer,
                &mut self.last_response,
            ),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ModbusError::timeout(
                format!("transaction {} to {}", transaction_id, self.address),
                self.request_timeout.as_millis() as u64,
            )),
        };

        match &result {
            Ok(_) => {
                self.stats.responses_received += 1;
                self.stats.bytes_received += self.last_response.len() as u64;
            }
            Err(err) => {
                self.stats.record_error(err);
                if err.is_connection_error() || matches!(err, ModbusError::Frame { .. }) {
                    warn!("TCP link to {} dropped: {}", self.address, err);
                    self.stream = None;
                    self.read_buffer.clear();
                }
            }
        }
        result
    }
}

/// Write `frame`, then read MBAP frames until one matches `transaction_id`.
///
/// Reads go through `buffer`, which outlives the call: cancelling this
/// future never loses bytes that were already received.
pub(crate) async fn transact<S>(
    stream: &mut S,
    frame: &[u8],
    transaction_id: u16,
    buffer: &mut BytesMut,
    raw_response: &mut Vec<u8>,
) -> ModbusResult<ModbusPdu>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(frame).await?;

    loop {
        while let Some(len) = complete_frame_len(buffer)? {
            let adu = buffer.split_to(len);
            let header = MbapHeader::parse(&head_of(&adu))?;
            if header.transaction_id != transaction_id {
                debug!(
                    "Discarding response for transaction {} (waiting for {})",
                    header.transaction_id, transaction_id
                );
                continue;
            }

            raw_response.clear();
            raw_response.extend_from_slice(&adu);
            return ModbusPdu::from_slice(&adu[MBAP_HEADER_LEN + 1..]);
        }

        if stream.read_buf(buffer).await? == 0 {
            return Err(ModbusError::connection("Connection closed by peer"));
        }
    }
}

/// Length of the first whole ADU in `buffer`, if it has arrived.
fn complete_frame_len(buffer: &BytesMut) -> ModbusResult<Option<usize>> {
    if buffer.len() < MBAP_HEADER_LEN + 1 {
        return Ok(None);
    }
    let header = MbapHeader::parse(&head_of(buffer))?;
    let len = MBAP_HEADER_LEN + 1 + header.pdu_len();
    Ok((buffer.len() >= len).then_some(len))
}

fn head_of(bytes: &[u8]) -> [u8; MBAP_HEADER_LEN + 1] {
    let mut head = [0u8; MBAP_HEADER_LEN + 1];
    head.copy_from_slice(&bytes[..MBAP_HEADER_LEN + 1]);
    head
}

impl ModbusTransport for TcpTransport {
    async fn connect(&mut self) -> ModbusResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        if let Some(wait) = self.reconnect.remaining(Instant::now()) {
            return Err(ModbusError::Backoff {
                retry_in_ms: wait.as_millis() as u64,
            });
        }

        debug!("TCP connecting: {}", self.address);
        let attempt = timeout(self.connect_timeout, TcpStream::connect(&self.address)).await;
        match attempt {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {}", e);
                }
                self.stream = Some(stream);
                self.read_buffer.clear();
                self.reconnect.record_success();
                self.stats.connects += 1;
                info!("TCP connected: {}", self.address);
                Ok(())
            }
            Ok(Err(e)) => Err(self.connect_failed(ModbusError::connection(format!(
                "Failed to connect to {}: {}",
                self.address, e
            )))),
            Err(_) => Err(self.connect_failed(ModbusError::timeout(
                format!("connect to {}", self.address),
                self.connect_timeout.as_millis() as u64,
            ))),
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
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("TCP shutdown {}: {}", self.address, e);
            }
            self.read_buffer.clear();
            info!("TCP closed: {}", self.address);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn stats(&self) -> TransportStats {
        self.stats
    }

    fn last_frames(&self) -> (&[u8], &[u8]) {
        (&self.last_request, &self.last_response)
    }
}
