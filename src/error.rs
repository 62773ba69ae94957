//! Error types for the acquisition engine
//!
//! Two families, handled in different places:
//!
//! - [`ModbusError`]: anything that can go wrong during a single exchange
//!   with a device (connection, timeout, framing, CRC, exception, decoding).
//!   These are recovered locally by retry/backoff and never escape a channel.
//! - [`ConfigError`]: an invalid channel or point definition. These exclude
//!   the affected channel at load time and leave the rest usable.
//!
//! [`EngineError`] wraps both for the few engine operations that can fail
//! as a whole.

use thiserror::Error;

/// Result type for transport and protocol operations.
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Result type for configuration loading and validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors produced while exchanging frames with a Modbus device.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModbusError {
    /// Connection could not be established or was lost
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Connect is suppressed until the reconnect backoff elapses
    #[error("Reconnect suppressed, next attempt in {retry_in_ms}ms")]
    Backoff { retry_in_ms: u64 },

    /// No (matching) response within the request timeout
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Response violates the Modbus application protocol
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Malformed ADU (length, header, truncated frame)
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// RTU checksum mismatch
    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    Crc { expected: u16, actual: u16 },

    /// Device answered with an exception response
    #[error("Modbus exception: function 0x{function:02X}, code 0x{code:02X} ({message})")]
    Exception {
        function: u8,
        code: u8,
        message: String,
    },

    /// Function code outside the supported set
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Register data could not be encoded or decoded
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Underlying socket or serial I/O failure
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Transport parameters are unusable
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl ModbusError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn frame(message: impl Into<String>) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Build an exception error from the raw exception code.
    pub fn exception(function: u8, code: u8) -> Self {
        Self::Exception {
            function: function & 0x7F,
            code,
            message: format!(
                "{} on {}",
                exception_description(code),
                crate::pdu::function_code_description(function)
            ),
        }
    }

    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// True when the link itself is gone and must be re-established.
    #[inline]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Io { .. } | Self::Backoff { .. }
        )
    }

    /// Short tag used in message log records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::Backoff { .. } => "backoff",
            Self::Timeout { .. } => "timeout",
            Self::Protocol { .. } => "protocol",
            Self::Frame { .. } => "frame",
            Self::Crc { .. } => "crc",
            Self::Exception { .. } => "exception",
            Self::InvalidFunction { .. } => "invalid_function",
            Self::InvalidData { .. } => "decode",
            Self::Io { .. } => "io",
            Self::Configuration { .. } => "configuration",
        }
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof => Self::connection(err.to_string()),
            _ => Self::io(err.to_string()),
        }
    }
}

/// Human-readable description of a Modbus exception code.
pub fn exception_description(code: u8) -> &'static str {
    use crate::constants::*;
    match code {
        EXCEPTION_ILLEGAL_FUNCTION => "Illegal Function",
        EXCEPTION_ILLEGAL_DATA_ADDRESS => "Illegal Data Address",
        EXCEPTION_ILLEGAL_DATA_VALUE => "Illegal Data Value",
        EXCEPTION_SERVER_DEVICE_FAILURE => "Server Device Failure",
        EXCEPTION_ACKNOWLEDGE => "Acknowledge",
        EXCEPTION_SERVER_DEVICE_BUSY => "Server Device Busy",
        EXCEPTION_MEMORY_PARITY_ERROR => "Memory Parity Error",
        EXCEPTION_GATEWAY_PATH_UNAVAILABLE => "Gateway Path Unavailable",
        EXCEPTION_GATEWAY_TARGET_FAILED => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}

/// Errors that reject a channel (or the whole file) at load time.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The document could not be parsed at all
    #[error("Failed to parse configuration: {message}")]
    Parse { message: String },

    /// Configuration file could not be read
    #[error("Failed to read configuration {path}: {message}")]
    Io { path: String, message: String },

    /// A channel entry is structurally invalid
    #[error("Channel {channel_id}: {message}")]
    InvalidChannel { channel_id: u16, message: String },

    /// Two channels share an id
    #[error("Duplicate channel id {channel_id}")]
    DuplicateChannel { channel_id: u16 },

    /// Two points in one channel share an id
    #[error("Channel {channel_id}: duplicate point id {point_id}")]
    DuplicatePoint { channel_id: u16, point_id: u32 },

    /// A single point cannot fit into one request
    #[error(
        "Channel {channel_id}: point {point_id} spans {width} units, exceeding batch limit {limit}"
    )]
    PointTooWide {
        channel_id: u16,
        point_id: u32,
        width: u16,
        limit: u16,
    },

    /// A point definition is invalid
    #[error("Channel {channel_id}: point {point_id}: {message}")]
    InvalidPoint {
        channel_id: u16,
        point_id: u32,
        message: String,
    },
}

impl ConfigError {
    pub fn invalid_channel(channel_id: u16, message: impl Into<String>) -> Self {
        Self::InvalidChannel {
            channel_id,
            message: message.into(),
        }
    }

    pub fn invalid_point(channel_id: u16, point_id: u32, message: impl Into<String>) -> Self {
        Self::InvalidPoint {
            channel_id,
            point_id,
            message: message.into(),
        }
    }
}

/// Failures of engine-level operations.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The command executor is no longer accepting requests
    #[error("Command queue closed, request {correlation_id} not accepted")]
    CommandQueueClosed { correlation_id: String },

    /// A background task panicked or was aborted
    #[error("Task {task} failed: {message}")]
    Task { task: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_classification() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(ModbusError::from(refused).is_connection_error());

        let other = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = ModbusError::from(other);
        assert_eq!(err.kind(), "io");
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_exception_strips_error_bit() {
        let err = ModbusError::exception(0x83, 0x02);
        match err {
            ModbusError::Exception {
                function,
                code,
                ref message,
            } => {
                assert_eq!(function, 0x03);
                assert_eq!(code, 0x02);
                assert_eq!(message, "Illegal Data Address on Read Holding Registers");
            }
            _ => panic!("Expected exception"),
        }
    }

    #[test]
    fn test_timeout_display() {
        let err = ModbusError::timeout("read batch 2", 1000);
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "Timeout after 1000ms: read batch 2");
    }
}
