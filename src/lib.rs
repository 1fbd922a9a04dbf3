//! # Triplex Modbus - Protocol Engine for Three Framings
//!
//! A Modbus implementation in pure Rust speaking both sides of the protocol
//! (client and server) over serial RTU, serial ASCII and TCP, with the
//! composite RTU-over-TCP and RTU-over-USB-HID backends on top.
//!
//! ## Features
//!
//! - **Three framings, one engine**: the application layer is written once;
//!   CRC-16, LRC and MBAP framing are interchangeable codecs
//! - **Client and server**: request/confirmation exchange with strict
//!   validation, and a reply dispatcher over pluggable storage backends
//! - **Length inference**: the receive engine derives frame lengths from the
//!   function code when they cannot be predicted
//! - **Per-session state**: transaction ids, timeouts, quirks and recovery
//!   modes live in the session, never in globals
//! - **Memory safe**: pure Rust, no unsafe code
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Client | Server |
//! |------|----------|--------|--------|
//! | 0x01 | Read Coils | yes | yes |
//! | 0x02 | Read Discrete Inputs | yes | yes |
//! | 0x03 | Read Holding Registers | yes | yes |
//! | 0x04 | Read Input Registers | yes | yes |
//! | 0x05 | Write Single Coil | yes | yes |
//! | 0x06 | Write Single Register | yes | yes |
//! | 0x07 | Read Exception Status | yes | yes |
//! | 0x0F | Write Multiple Coils | yes | yes |
//! | 0x10 | Write Multiple Registers | yes | yes |
//! | 0x11 | Report Server ID | yes | yes |
//! | 0x16 | Mask Write Register | yes | yes |
//! | 0x17 | Write And Read Registers | yes | yes |
//! | 0x2B/0x0E | Read Device Identification | yes | yes |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use triplex_modbus::{ModbusClient, ModbusTcpClient, ModbusResult};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let mut client = ModbusTcpClient::connect("127.0.0.1:502", Duration::from_secs(5)).await?;
//!
//!     // Read holding registers
//!     let values = client.read_03(1, 0, 10).await?;
//!     println!("Read registers: {:?}", values);
//!
//!     // Write single register
//!     client.write_06(1, 100, 0x1234).await?;
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Modbus protocol constants based on the official specification
pub mod constants;

/// PDU with stack-allocated fixed array
pub mod pdu;

/// Modbus protocol definitions and message handling
pub mod protocol;

/// Frame codecs: RTU (CRC-16), ASCII (LRC), TCP (MBAP)
pub mod frame;

/// Transport adapters for TCP, serial and in-memory streams
pub mod transport;

/// Receive engine: timeouts and frame-length inference
pub mod engine;

/// Per-session configuration: timeouts, quirks, server id
pub mod config;

/// Logging hooks
pub mod logging;

/// Modbus client implementations
pub mod client;

/// Modbus server: indication receive and reply dispatch
pub mod server;

/// Storage backends for the server role
pub mod storage;

/// Error-recovery policy
pub mod recovery;

/// Read device identification objects (FC43/0x0E)
pub mod identification;

/// RTU over USB-HID report framing
pub mod hid;

// ============================================================================
// Re-exports for convenience
// ============================================================================

pub use client::{GenericModbusClient, ModbusClient, ModbusRtuOverTcpClient, ModbusTcpClient, ServerIdReport};
pub use config::{ByteTimeout, Quirks, SessionConfig, TimeoutSpec};
pub use constants::*;
pub use engine::MsgType;
pub use error::{errno, ExceptionCode, ModbusError, ModbusResult};
pub use frame::{crc16, lrc8, AduParts, FrameFormat, Framing};
pub use identification::{DeviceIdResponse, DeviceIdentification, ReadDeviceIdCode};
pub use logging::{CallbackLogger, TraceFn};
pub use pdu::{ModbusPdu, PduBuilder};
pub use protocol::{ExpectedLength, ModbusFunction, ModbusRequest, ModbusResponse, SlaveId};
pub use recovery::ErrorRecovery;
pub use server::{Indication, ServerSession};
pub use storage::{pack_bits, unpack_bits, ModbusMapping, StorageBackend};
pub use transport::{ModbusTransport, StreamTransport, TcpTransport, TransportStats};

#[cfg(feature = "serial")]
pub use client::{ModbusAsciiClient, ModbusRtuClient};

#[cfg(feature = "serial")]
pub use transport::{RtsMode, SerialConfig, SerialTransport};

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("Triplex Modbus v{} - Modbus RTU/ASCII/TCP protocol engine", VERSION)
}
