//! # Configuration Loading
//!
//! YAML configuration for the engine and its channels. Each channel entry
//! is deserialized and validated on its own, so a malformed channel is
//! rejected with a [`ConfigError`] while every other channel stays usable.
//!
//! ```yaml
//! log_dir: /var/log/voltage/modbus
//! channels:
//!   - id: 1001
//!     name: pcs
//!     transport: { kind: tcp, host: 10.0.0.5, port: 502 }
//!     polling_interval_ms: 1000
//!     max_batch_size: 20
//!     retry: { attempts: 3, delay_ms: 100 }
//!     logging: { level: debug, retention_days: 7 }
//!     points:
//!       - { id: 1, address: 0, category: telemetry, data_type: float32, scale: 0.1 }
//!       - { id: 2, address: 10, category: adjustment, data_type: uint16 }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{error, info};

use crate::bytes::ByteOrder;
use crate::codec::DataType;
use crate::constants::{is_bit_function, FC_READ_COILS, FC_READ_INPUT_REGISTERS};
use crate::device_limits::{
    DeviceLimits, DEFAULT_INTER_REQUEST_DELAY_MS, DEFAULT_MAX_GAP, DEFAULT_MAX_READ_COILS,
    DEFAULT_MAX_READ_REGISTERS,
};
use crate::error::{ConfigError, ConfigResult};
use crate::model::{
    Channel, FourRemote, LogLevel, LogPolicy, Point, RetryPolicy, Transform, TransportConfig,
};
use crate::planner::BatchPlanner;

// ============================================================================
// Defaults
// ============================================================================

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs/modbus")
}

fn default_log_queue_capacity() -> usize {
    10_000
}

fn default_retention_sweep_secs() -> u64 {
    3_600
}

fn default_command_queue_capacity() -> usize {
    1_024
}

fn default_command_status_ttl_secs() -> u64 {
    3_600
}

fn default_polling_interval_ms() -> u64 {
    1_000
}

fn default_request_timeout_ms() -> u64 {
    1_000
}

fn default_connect_timeout_ms() -> u64 {
    3_000
}

fn default_max_batch_size() -> u16 {
    DEFAULT_MAX_READ_REGISTERS
}

fn default_max_batch_coils() -> u16 {
    DEFAULT_MAX_READ_COILS
}

fn default_max_gap() -> u16 {
    DEFAULT_MAX_GAP
}

fn default_inter_request_delay_ms() -> u64 {
    DEFAULT_INTER_REQUEST_DELAY_MS
}

fn default_slave_id() -> u8 {
    1
}

fn default_function_code() -> u8 {
    0x03
}

// ============================================================================
// Engine
// ============================================================================

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Root directory of the per-channel message logs
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Records buffered before the message logger starts dropping
    #[serde(default = "default_log_queue_capacity")]
    pub log_queue_capacity: usize,

    /// How often log retention runs
    #[serde(default = "default_retention_sweep_secs")]
    pub retention_sweep_secs: u64,

    /// Pending commands buffered before submitters wait
    #[serde(default = "default_command_queue_capacity")]
    pub command_queue_capacity: usize,

    /// How long finished command outcomes stay queryable
    #[serde(default = "default_command_status_ttl_secs")]
    pub command_status_ttl_secs: u64,

    /// Channel entries, kept raw until validated one by one
    #[serde(default)]
    pub channels: Vec<serde_yaml::Value>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            log_queue_capacity: default_log_queue_capacity(),
            retention_sweep_secs: default_retention_sweep_secs(),
            command_queue_capacity: default_command_queue_capacity(),
            command_status_ttl_secs: default_command_status_ttl_secs(),
            channels: Vec::new(),
        }
    }
}

/// Outcome of validating every channel entry.
#[derive(Debug, Default)]
pub struct LoadedChannels {
    pub channels: Vec<Channel>,
    pub rejected: Vec<ConfigError>,
}

impl EngineConfig {
    pub fn from_yaml(text: &str) -> ConfigResult<Self> {
        serde_yaml::from_str(text).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_yaml(&text)
    }

    #[inline]
    pub fn retention_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention_sweep_secs.max(1))
    }

    #[inline]
    pub fn command_status_ttl(&self) -> Duration {
        Duration::from_secs(self.command_status_ttl_secs)
    }

    /// Validate every channel entry. Invalid entries are logged and
    /// collected in `rejected`; the first entry of a duplicated id wins.
    pub fn load_channels(&self) -> LoadedChannels {
        let mut loaded = LoadedChannels::default();
        let mut seen = HashSet::new();

        for (index, raw) in self.channels.iter().enumerate() {
            let result = ChannelConfig::from_value(raw, index).and_then(|cfg| cfg.into_channel());
            match result {
                Ok(channel) if !seen.insert(channel.id) => {
                    let err = ConfigError::DuplicateChannel {
                        channel_id: channel.id,
                    };
                    error!("Channel rejected: {}", err);
                    loaded.rejected.push(err);
                }
                Ok(channel) => {
                    info!(
                        "Channel {} ({}) loaded: {} points over {}",
                        channel.id,
                        channel.name,
                        channel.points().len(),
                        channel.transport
                    );
                    loaded.channels.push(channel);
                }
                Err(err) => {
                    error!("Channel rejected: {}", err);
                    loaded.rejected.push(err);
                }
            }
        }
        loaded
    }
}

// ============================================================================
// Channel entries
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub delay_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_cap_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            attempts: policy.attempts,
            delay_ms: policy.delay.as_millis() as u64,
            backoff_multiplier: policy.backoff_multiplier,
            backoff_cap_ms: policy.backoff_cap.as_millis() as u64,
            reconnect_initial_ms: policy.reconnect_initial.as_millis() as u64,
            reconnect_max_ms: policy.reconnect_max.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub retention_days: u32,
    pub max_segment_mb: u64,
    /// `null` disables compression
    pub compress_after_days: Option<u32>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        let policy = LogPolicy::default();
        Self {
            level: policy.level,
            retention_days: policy.retention_days,
            max_segment_mb: policy.max_segment_bytes / (1024 * 1024),
            compress_after_days: policy.compress_after_days,
        }
    }
}

/// One point entry.
#[derive(Debug, Clone, Deserialize)]
pub struct PointConfig {
    pub id: u32,
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,
    #[serde(default = "default_function_code")]
    pub function_code: u8,
    pub address: u16,
    pub category: FourRemote,
    pub data_type: DataType,
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default)]
    pub bit_position: Option<u8>,
    #[serde(flatten)]
    pub transform: Transform,
}

/// One channel entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub id: u16,
    pub name: String,
    pub transport: TransportConfig,
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Register span per FC03/04 batch
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u16,
    /// Bit span per FC01/02 batch
    #[serde(default = "default_max_batch_coils")]
    pub max_batch_coils: u16,
    #[serde(default = "default_max_gap")]
    pub max_gap: u16,
    #[serde(default = "default_inter_request_delay_ms")]
    pub inter_request_delay_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub points: Vec<PointConfig>,
}

impl ChannelConfig {
    /// Deserialize one raw entry. On failure the error names the channel
    /// id when the entry carries a readable one.
    pub fn from_value(raw: &serde_yaml::Value, index: usize) -> ConfigResult<Self> {
        serde_yaml::from_value(raw.clone()).map_err(|e| {
            match raw.get("id").and_then(|v| v.as_u64()).and_then(|v| u16::try_from(v).ok()) {
                Some(channel_id) => ConfigError::invalid_channel(channel_id, e.to_string()),
                None => ConfigError::Parse {
                    message: format!("channel entry #{}: {}", index, e),
                },
            }
        })
    }

    /// Validate and convert into an immutable [`Channel`].
    pub fn into_channel(self) -> ConfigResult<Channel> {
        let id = self.id;
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid_channel(id, "name must not be empty"));
        }
        if self.polling_interval_ms == 0 {
            return Err(ConfigError::invalid_channel(
                id,
                "polling_interval_ms must be greater than 0",
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::invalid_channel(
                id,
                "request_timeout_ms must be greater than 0",
            ));
        }
        if self.max_batch_size == 0 || self.max_batch_coils == 0 {
            return Err(ConfigError::invalid_channel(
                id,
                "batch size limits must be greater than 0",
            ));
        }
        if self.retry.backoff_multiplier < 1.0 || !self.retry.backoff_multiplier.is_finite() {
            return Err(ConfigError::invalid_channel(
                id,
                format!(
                    "backoff_multiplier must be >= 1.0, got {}",
                    self.retry.backoff_multiplier
                ),
            ));
        }
        match &self.transport {
            TransportConfig::Tcp { host, .. } if host.trim().is_empty() => {
                return Err(ConfigError::invalid_channel(id, "tcp host must not be empty"))
            }
            TransportConfig::Rtu {
                device, baud_rate, ..
            } if device.trim().is_empty() || *baud_rate == 0 => {
                return Err(ConfigError::invalid_channel(
                    id,
                    "rtu device and baud_rate are required",
                ))
            }
            _ => {}
        }

        let mut ids = HashSet::with_capacity(self.points.len());
        let mut points = Vec::with_capacity(self.points.len());
        for cfg in self.points {
            if !ids.insert(cfg.id) {
                return Err(ConfigError::DuplicatePoint {
                    channel_id: id,
                    point_id: cfg.id,
                });
            }
            points.push(cfg.into_point(id)?);
        }

        let limits = DeviceLimits::new()
            .with_max_read_registers(self.max_batch_size)
            .with_max_read_coils(self.max_batch_coils)
            .with_max_gap(self.max_gap)
            .with_inter_request_delay_ms(self.inter_request_delay_ms);
        // Rejects points wider than the batch limit or past 0xFFFF
        BatchPlanner::new(limits).plan(id, &points)?;

        let retry = RetryPolicy {
            attempts: self.retry.attempts.max(1),
            delay: Duration::from_millis(self.retry.delay_ms),
            backoff_multiplier: self.retry.backoff_multiplier,
            backoff_cap: Duration::from_millis(self.retry.backoff_cap_ms),
            reconnect_initial: Duration::from_millis(self.retry.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(self.retry.reconnect_max_ms),
        };
        let log = LogPolicy {
            level: self.logging.level,
            retention_days: self.logging.retention_days,
            max_segment_bytes: self.logging.max_segment_mb.max(1) * 1024 * 1024,
            compress_after_days: self.logging.compress_after_days,
        };

        let mut channel = Channel::new(id, self.name, self.transport)
            .with_polling_interval(Duration::from_millis(self.polling_interval_ms))
            .with_request_timeout(Duration::from_millis(self.request_timeout_ms))
            .with_limits(limits)
            .with_retry(retry)
            .with_log_policy(log)
            .with_points(points);
        channel.connect_timeout = Duration::from_millis(self.connect_timeout_ms.max(1));
        Ok(channel)
    }
}

impl PointConfig {
    fn into_point(self, channel_id: u16) -> ConfigResult<Point> {
        if !(FC_READ_COILS..=FC_READ_INPUT_REGISTERS).contains(&self.function_code) {
            return Err(ConfigError::invalid_point(
                channel_id,
                self.id,
                format!("unsupported function code {}", self.function_code),
            ));
        }
        if is_bit_function(self.function_code) && self.data_type != DataType::Bool {
            return Err(ConfigError::invalid_point(
                channel_id,
                self.id,
                format!(
                    "function code {} only carries bool points, got {}",
                    self.function_code, self.data_type
                ),
            ));
        }
        if let Some(bit) = self.bit_position {
            if bit > 15 {
                return Err(ConfigError::invalid_point(
                    channel_id,
                    self.id,
                    format!("bit position {} out of range 0-15", bit),
                ));
            }
            if self.data_type != DataType::Bool || is_bit_function(self.function_code) {
                return Err(ConfigError::invalid_point(
                    channel_id,
                    self.id,
                    "bit_position only applies to bool points in a register table",
                ));
            }
        }
        if !self.transform.scale.is_finite() || !self.transform.offset.is_finite() {
            return Err(ConfigError::invalid_point(
                channel_id,
                self.id,
                "scale and offset must be finite",
            ));
        }

        let mut point = Point::new(self.id, self.slave_id, self.address, self.data_type)
            .with_function_code(self.function_code)
            .with_category(self.category)
            .with_byte_order(self.byte_order)
            .with_transform(self.transform);
        if let Some(bit) = self.bit_position {
            point = point.with_bit_position(bit);
        }
        Ok(point)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
log_dir: /tmp/modbus-logs
channels:
  - id: 1001
    name: pcs
    transport: { kind: tcp, host: 10.0.0.5 }
    polling_interval_ms: 500
    max_batch_size: 20
    max_gap: 2
    retry: { attempts: 3, delay_ms: 50 }
    logging: { level: debug, retention_days: 7, compress_after_days: null }
    points:
      - { id: 1, address: 0, category: telemetry, data_type: float32, byte_order: CDAB, scale: 0.1 }
      - { id: 2, address: 2, category: S, data_type: bool, bit_position: 4 }
      - { id: 3, address: 10, category: adjustment, data_type: uint16 }
  - id: 1002
    name: meters
    transport: { kind: serial, device: /dev/ttyS0 }
  - id: 1003
    name: bms
    transport: { kind: rtu, device: /dev/ttyUSB0, baud_rate: 19200, parity: even }
    max_batch_size: 2
    points:
      - { id: 1, address: 0, category: telemetry, data_type: float64 }
  - id: 1004
    name: dup
    transport: { kind: tcp, host: 10.0.0.6 }
    points:
      - { id: 1, address: 0, category: telemetry, data_type: uint16 }
      - { id: 1, address: 1, category: telemetry, data_type: uint16 }
  - name: anonymous
"#;

    #[test]
    fn test_bad_channels_rejected_individually() {
        let config = EngineConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.log_dir, PathBuf::from("/tmp/modbus-logs"));
        assert_eq!(config.log_queue_capacity, 10_000);

        let loaded = config.load_channels();
        assert_eq!(loaded.channels.len(), 1);
        assert_eq!(loaded.rejected.len(), 4);

        assert!(matches!(
            loaded.rejected[0],
            ConfigError::InvalidChannel {
                channel_id: 1002,
                ..
            }
        ));
        assert_eq!(
            loaded.rejected[1],
            ConfigError::PointTooWide {
                channel_id: 1003,
                point_id: 1,
                width: 4,
                limit: 2
            }
        );
        assert_eq!(
            loaded.rejected[2],
            ConfigError::DuplicatePoint {
                channel_id: 1004,
                point_id: 1
            }
        );
        assert!(matches!(loaded.rejected[3], ConfigError::Parse { .. }));
    }

    #[test]
    fn test_channel_fields_mapped() {
        let loaded = EngineConfig::from_yaml(SAMPLE).unwrap().load_channels();
        let channel = &loaded.channels[0];

        assert_eq!(channel.id, 1001);
        assert_eq!(channel.transport, TransportConfig::tcp("10.0.0.5", 502));
        assert_eq!(channel.polling_interval, Duration::from_millis(500));
        assert_eq!(channel.limits.read_limit(0x03), 20);
        assert_eq!(channel.limits.max_gap, 2);
        assert_eq!(channel.retry.attempts, 3);
        assert_eq!(channel.retry.delay, Duration::from_millis(50));
        assert_eq!(channel.log.level, LogLevel::Debug);
        assert_eq!(channel.log.retention_days, 7);
        assert_eq!(channel.log.compress_after_days, None);

        let temp = channel.point(1).unwrap();
        assert_eq!(temp.byte_order, ByteOrder::BigEndianSwap);
        assert_eq!(temp.transform.scale, 0.1);
        assert_eq!(channel.point(2).unwrap().bit_position, Some(4));
        assert_eq!(channel.point(2).unwrap().category, FourRemote::Signal);
        assert!(channel.point(3).unwrap().is_writable());
    }

    #[test]
    fn test_duplicate_channel_id() {
        let yaml = r#"
channels:
  - { id: 1, name: a, transport: { kind: tcp, host: h } }
  - { id: 1, name: b, transport: { kind: tcp, host: h } }
"#;
        let loaded = EngineConfig::from_yaml(yaml).unwrap().load_channels();
        assert_eq!(loaded.channels.len(), 1);
        assert_eq!(loaded.channels[0].name, "a");
        assert_eq!(
            loaded.rejected,
            vec![ConfigError::DuplicateChannel { channel_id: 1 }]
        );
    }

    #[test]
    fn test_point_validation() {
        let yaml = r#"
channels:
  - id: 1
    name: a
    transport: { kind: tcp, host: h }
    points:
      - { id: 1, address: 0, function_code: 1, category: signal, data_type: uint16 }
  - id: 2
    name: b
    transport: { kind: tcp, host: h }
    points:
      - { id: 1, address: 0, category: signal, data_type: bool, bit_position: 16 }
  - id: 3
    name: c
    transport: { kind: tcp, host: h }
    points:
      - { id: 1, address: 65535, category: telemetry, data_type: uint32 }
  - id: 4
    name: d
    transport: { kind: tcp, host: h }
    polling_interval_ms: 0
"#;
        let loaded = EngineConfig::from_yaml(yaml).unwrap().load_channels();
        assert!(loaded.channels.is_empty());
        let ids: Vec<u16> = loaded
            .rejected
            .iter()
            .map(|e| match e {
                ConfigError::InvalidPoint { channel_id, .. }
                | ConfigError::InvalidChannel { channel_id, .. } => *channel_id,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_unparseable_document() {
        assert!(matches!(
            EngineConfig::from_yaml("channels: [unterminated"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_from_missing_file() {
        let err = EngineConfig::from_file("/nonexistent/voltage.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
