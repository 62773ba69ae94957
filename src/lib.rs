//! # Voltage Acquisition - Multi-Channel Modbus Batch Acquisition Engine
//!
//! **Author:** Evan Liu <liuyifanz.1996@gmail.com>
//! **License:** MIT
//!
//! Turns thousands of individually addressed Modbus points, spread over
//! independent TCP and RTU channels, into a small fixed set of batched
//! read requests. Every channel polls on its own schedule, publishes into
//! a shared telemetry store and keeps its failures to itself.
//!
//! ## Features
//!
//! - **Batch Planning**: greedy, deterministic packing under channel and protocol limits
//! - **TCP and RTU**: MBAP transaction matching, CRC-16 framing, reconnect backoff
//! - **Failure Isolation**: per-batch retries, stale-on-failure, per-channel backoff
//! - **Commands**: control/adjustment writes serialized with the poll cycle
//! - **Message Log**: per-channel, per-day exchange records with rotation and retention
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Used for |
//! |------|----------|----------|
//! | 0x01 | Read Coils | polling |
//! | 0x02 | Read Discrete Inputs | polling |
//! | 0x03 | Read Holding Registers | polling |
//! | 0x04 | Read Input Registers | polling |
//! | 0x05 | Write Single Coil | commands |
//! | 0x06 | Write Single Register | commands |
//! | 0x10 | Write Multiple Registers | commands |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_acquisition::{Engine, EngineConfig, EngineSettings, MemoryTelemetryStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::from_file("channels.yaml")?;
//!     let loaded = config.load_channels();
//!
//!     let store = Arc::new(MemoryTelemetryStore::new());
//!     let mut engine = Engine::start(EngineSettings::from(&config), store);
//!     engine.reload(loaded.channels).await;
//!
//!     tokio::signal::ctrl_c().await?;
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

// ============================================================================
// Protocol modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Protocol limits, function codes and exception codes
pub mod constants;

/// Stack-allocated PDU construction and response parsing
pub mod pdu;

/// MBAP and RTU framing
pub mod frame;

/// Byte order handling for multi-register data types
pub mod bytes;

/// Encoding and decoding of register values
pub mod codec;

/// Device-specific protocol limits configuration
pub mod device_limits;

// ============================================================================
// Acquisition modules
// ============================================================================

/// Channels, points and their policies
pub mod model;

/// YAML configuration and per-channel validation
pub mod config;

/// Read batch planning
pub mod planner;

/// Reconnect and cycle backoff state machines
pub mod backoff;

/// TCP and RTU transports behind one capability trait
pub mod transport;

/// Per-channel poll loop
pub mod scheduler;

/// Control and adjustment writes
pub mod command;

/// Telemetry store and publisher
pub mod publisher;

/// Per-channel exchange log
pub mod message_log;

/// Engine wiring, reload and shutdown
pub mod engine;

// ============================================================================
// Re-exports for convenience
// ============================================================================

pub use tokio;

// === Error handling ===
pub use error::{ConfigError, ConfigResult, EngineError, ModbusError, ModbusResult};

// === Model and configuration ===
pub use bytes::ByteOrder;
pub use codec::DataType;
pub use config::{ChannelConfig, EngineConfig, LoadedChannels, PointConfig};
pub use device_limits::DeviceLimits;
pub use model::{
    Channel, FourRemote, LogLevel, LogPolicy, Parity, Point, RetryPolicy, Transform,
    TransportConfig,
};

// === Acquisition ===
pub use backoff::{CycleBackoff, CycleOutcome, ReconnectBackoff};
pub use planner::{BatchPlan, BatchPlanner, DecodedValue, ReadBatch};
pub use scheduler::{ChannelPoller, ChannelState, CycleReport};
pub use transport::{ChannelTransport, ModbusTransport, TcpTransport, TransportStats};

#[cfg(feature = "rtu")]
pub use transport::RtuTransport;

// === Commands ===
pub use command::{
    ChannelHandle, ChannelRegistry, CommandExecutor, CommandOutcome, CommandQueue,
    CommandRequest, CommandStatus, CommandStatusBoard,
};

// === Publishing and logging ===
pub use message_log::{LogRecord, LogWriter, MessageLogger};
pub use publisher::{DataPublisher, MemoryTelemetryStore, PointValue, TelemetryStore};

// === Engine ===
pub use engine::{ChannelStatus, Engine, EngineSettings, ReloadReport};

// === Protocol limits (commonly needed constants) ===
pub use constants::{MAX_PDU_SIZE, MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_REGISTERS};

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!(
        "Voltage Acquisition v{} - multi-channel Modbus acquisition engine by Evan Liu",
        VERSION
    )
}
