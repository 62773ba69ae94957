//! Static description of channels, transports and points
//!
//! Everything here is immutable once built. A configuration reload produces
//! fresh [`Channel`] records that replace the old ones as a whole.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::bytes::ByteOrder;
use crate::codec::DataType;
use crate::constants::{
    is_bit_function, FC_READ_COILS, FC_READ_HOLDING_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER,
};
use crate::device_limits::DeviceLimits;

// ============================================================================
// Four-remote category
// ============================================================================

/// Classification of a point: telemetry, signal, control or adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FourRemote {
    /// Measurement (T)
    #[serde(alias = "T", alias = "measurement")]
    Telemetry,
    /// Status (S)
    #[serde(alias = "S", alias = "status")]
    Signal,
    /// Remote control (C)
    #[serde(alias = "C")]
    Control,
    /// Remote adjustment (A)
    #[serde(alias = "A", alias = "setpoint")]
    Adjustment,
}

impl FourRemote {
    pub const ALL: [FourRemote; 4] = [
        Self::Telemetry,
        Self::Signal,
        Self::Control,
        Self::Adjustment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Telemetry => "T",
            Self::Signal => "S",
            Self::Control => "C",
            Self::Adjustment => "A",
        }
    }

    /// Control and adjustment points accept commands.
    #[inline]
    pub fn is_command(&self) -> bool {
        matches!(self, Self::Control | Self::Adjustment)
    }
}

impl fmt::Display for FourRemote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Transform
// ============================================================================

/// Linear transform `raw * scale + offset`, or inversion for booleans.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Transform {
    pub scale: f64,
    pub offset: f64,
    pub reverse: bool,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            scale: 1.0,
            offset: 0.0,
            reverse: false,
        }
    }
}

impl Transform {
    pub fn new(scale: f64, offset: f64) -> Self {
        Self {
            scale,
            offset,
            reverse: false,
        }
    }

    pub fn reversed() -> Self {
        Self {
            reverse: true,
            ..Self::default()
        }
    }

    #[inline]
    pub fn is_identity(&self) -> bool {
        self.scale == 1.0 && self.offset == 0.0 && !self.reverse
    }

    /// Raw device value to engineering value.
    #[inline]
    pub fn apply(&self, raw: f64, data_type: DataType) -> f64 {
        if data_type == DataType::Bool {
            let on = raw != 0.0;
            return if on != self.reverse { 1.0 } else { 0.0 };
        }
        raw * self.scale + self.offset
    }
}

// ============================================================================
// Point
// ============================================================================

/// One addressable data item on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    /// Unique within its channel
    pub id: u32,
    pub slave_id: u8,
    /// Register table: 1 coils, 2 discrete inputs, 3 holding, 4 input
    pub function_code: u8,
    pub address: u16,
    pub category: FourRemote,
    pub data_type: DataType,
    pub byte_order: ByteOrder,
    /// Bit inside a register, for `bool` points on FC03/04
    pub bit_position: Option<u8>,
    pub transform: Transform,
}

impl Point {
    /// Holding-register telemetry point with defaults for everything else.
    pub fn new(id: u32, slave_id: u8, address: u16, data_type: DataType) -> Self {
        Self {
            id,
            slave_id,
            function_code: FC_READ_HOLDING_REGISTERS,
            address,
            category: FourRemote::Telemetry,
            data_type,
            byte_order: ByteOrder::default(),
            bit_position: None,
            transform: Transform::default(),
        }
    }

    pub fn with_function_code(mut self, fc: u8) -> Self {
        self.function_code = fc;
        self
    }

    pub fn with_category(mut self, category: FourRemote) -> Self {
        self.category = category;
        self
    }

    pub fn with_byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    pub fn with_bit_position(mut self, bit: u8) -> Self {
        self.bit_position = Some(bit);
        self
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    /// Units (registers, or bits for FC01/02) this point occupies.
    #[inline]
    pub fn width(&self) -> u16 {
        if is_bit_function(self.function_code) {
            1
        } else {
            self.data_type.register_count()
        }
    }

    /// One past the last occupied unit. Computed in `u32` so that
    /// overflow past 0xFFFF is detectable.
    #[inline]
    pub fn end(&self) -> u32 {
        u32::from(self.address) + u32::from(self.width())
    }

    /// Write function for this point, if it accepts commands.
    ///
    /// A `bool` packed into a register bit is not writable: a single-bit
    /// write would have to rewrite its neighbours.
    pub fn write_function(&self) -> Option<u8> {
        if !self.category.is_command() {
            return None;
        }
        match self.function_code {
            FC_READ_COILS if self.data_type == DataType::Bool => Some(FC_WRITE_SINGLE_COIL),
            FC_READ_HOLDING_REGISTERS if self.bit_position.is_some() => None,
            FC_READ_HOLDING_REGISTERS if self.width() == 1 => Some(FC_WRITE_SINGLE_REGISTER),
            FC_READ_HOLDING_REGISTERS => Some(FC_WRITE_MULTIPLE_REGISTERS),
            _ => None,
        }
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.write_function().is_some()
    }
}

// ============================================================================
// Transport parameters
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Transport kind and its parameters, selected per channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    Tcp {
        host: String,
        #[serde(default = "default_tcp_port")]
        port: u16,
    },
    Rtu {
        device: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
        #[serde(default)]
        parity: Parity,
    },
}

fn default_tcp_port() -> u16 {
    crate::DEFAULT_TCP_PORT
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

impl TransportConfig {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Tcp { .. } => "tcp",
            Self::Rtu { .. } => "rtu",
        }
    }
}

impl fmt::Display for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Self::Rtu {
                device, baud_rate, ..
            } => write!(f, "rtu://{}@{}", device, baud_rate),
        }
    }
}

// ============================================================================
// Policies
// ============================================================================

/// Per-channel message log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Outcome, latency and hex payloads
    Debug,
    /// Outcome and latency only
    #[default]
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPolicy {
    pub level: LogLevel,
    /// Segments whose UTC day is older than this are deleted
    pub retention_days: u32,
    /// Size ceiling of one segment before rotation
    pub max_segment_bytes: u64,
    /// Closed segments at least this old are gzip-compressed
    pub compress_after_days: Option<u32>,
}

impl Default for LogPolicy {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            retention_days: 30,
            max_segment_bytes: 50 * 1024 * 1024,
            compress_after_days: Some(1),
        }
    }
}

/// Batch retry bound and whole-cycle backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per batch, first try included
    pub attempts: u32,
    pub delay: Duration,
    /// Interval multiplier applied per consecutive fully failed cycle
    pub backoff_multiplier: f64,
    pub backoff_cap: Duration,
    /// Reconnect backoff bounds
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            backoff_cap: Duration::from_secs(60),
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// Channel
// ============================================================================

/// One logical communication path with its transport and points.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub id: u16,
    pub name: String,
    pub transport: TransportConfig,
    pub polling_interval: Duration,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub limits: DeviceLimits,
    pub retry: RetryPolicy,
    pub log: LogPolicy,
    points: Vec<Point>,
    index: HashMap<u32, usize>,
}

impl Channel {
    pub fn new(id: u16, name: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            id,
            name: name.into(),
            transport,
            polling_interval: Duration::from_secs(1),
            request_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(3),
            limits: DeviceLimits::default(),
            retry: RetryPolicy::default(),
            log: LogPolicy::default(),
            points: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_limits(mut self, limits: DeviceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_log_policy(mut self, log: LogPolicy) -> Self {
        self.log = log;
        self
    }

    /// Replace the point list. Later duplicates of an id shadow earlier
    /// ones in lookups; configuration loading rejects duplicates first.
    pub fn with_points(mut self, points: Vec<Point>) -> Self {
        self.index = points
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id, i))
            .collect();
        self.points = points;
        self
    }

    #[inline]
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    #[inline]
    pub fn point(&self, id: u32) -> Option<&Point> {
        self.index.get(&id).map(|&i| &self.points[i])
    }

    /// True when only the point list differs, so the running poller can
    /// take a new plan without restarting.
    pub fn same_runtime_settings(&self, other: &Channel) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.transport == other.transport
            && self.polling_interval == other.polling_interval
            && self.request_timeout == other.request_timeout
            && self.connect_timeout == other.connect_timeout
            && self.limits == other.limits
            && self.retry == other.retry
            && self.log == other.log
    }
}
