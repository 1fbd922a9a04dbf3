//! Error types and result handling
//!
//! The error taxonomy separates the ways an exchange can fail:
//!
//! | Class | Variants | Origin |
//! |-------|----------|--------|
//! | Argument | `InvalidArgument` | caught before any byte is sent |
//! | Transport | `Connection`, `Io`, `Timeout` | the transport adapter |
//! | Frame | `BadChecksum`, `BadData`, `Protocol` | frame verification |
//! | Slave | `BadSlave` | reply from an unexpected server |
//! | Size | `TooManyData` | request/response would exceed the ADU maximum |
//! | Exception | `Exception` | the peer refused the request |
//!
//! A Modbus exception reply is an ordinary, expected response and never
//! triggers error recovery; everything else may, depending on the configured
//! recovery mode.

use std::fmt;

use thiserror::Error;

/// Result type for all Modbus operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Modbus exception codes as defined by the application protocol.
///
/// An exception response carries the request function code ORed with 0x80
/// followed by exactly one of these codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExceptionCode {
    /// The function code is not supported by the server
    IllegalFunction = 0x01,
    /// The requested address range is outside the server's address space
    IllegalDataAddress = 0x02,
    /// A value in the request is not allowed (bad quantity, bad coil value)
    IllegalDataValue = 0x03,
    /// The server failed while performing the requested action
    ServerDeviceFailure = 0x04,
    /// Long-running request accepted; poll later
    Acknowledge = 0x05,
    /// The server is busy processing another command
    ServerDeviceBusy = 0x06,
    /// The server cannot perform the program function
    NegativeAcknowledge = 0x07,
    /// Extended-memory parity check failed
    MemoryParityError = 0x08,
    /// The gateway has no path to the target device
    GatewayPathUnavailable = 0x0A,
    /// The target device behind the gateway did not respond
    GatewayTargetFailed = 0x0B,
}

impl ExceptionCode {
    /// Decode a wire byte into an exception code.
    ///
    /// Returns `None` for values outside the defined taxonomy so that the
    /// caller can reject malformed exception replies.
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::IllegalFunction),
            0x02 => Some(Self::IllegalDataAddress),
            0x03 => Some(Self::IllegalDataValue),
            0x04 => Some(Self::ServerDeviceFailure),
            0x05 => Some(Self::Acknowledge),
            0x06 => Some(Self::ServerDeviceBusy),
            0x07 => Some(Self::NegativeAcknowledge),
            0x08 => Some(Self::MemoryParityError),
            0x0A => Some(Self::GatewayPathUnavailable),
            0x0B => Some(Self::GatewayTargetFailed),
            _ => None,
        }
    }

    /// Wire representation of the code
    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable description used by `Display` and the trace output
    pub fn description(self) -> &'static str {
        match self {
            Self::IllegalFunction => "Illegal function",
            Self::IllegalDataAddress => "Illegal data address",
            Self::IllegalDataValue => "Illegal data value",
            Self::ServerDeviceFailure => "Server device failure",
            Self::Acknowledge => "Acknowledge",
            Self::ServerDeviceBusy => "Server device busy",
            Self::NegativeAcknowledge => "Negative acknowledge",
            Self::MemoryParityError => "Memory parity error",
            Self::GatewayPathUnavailable => "Gateway path unavailable",
            Self::GatewayTargetFailed => "Gateway target device failed to respond",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.description(), self.to_u8())
    }
}

/// Core error type covering the whole taxonomy
#[derive(Debug, Error)]
pub enum ModbusError {
    /// Bad caller argument; nothing was sent
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong with the argument
        message: String,
    },

    /// The transport could not be established or was lost
    #[error("Connection error: {message}")]
    Connection {
        /// Connection failure details
        message: String,
    },

    /// An I/O operation on the transport failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A receive phase elapsed without the expected bytes arriving
    #[error("Timeout after {elapsed_ms} ms: {message}")]
    Timeout {
        /// Which phase timed out
        message: String,
        /// Budget that elapsed, in milliseconds
        elapsed_ms: u64,
    },

    /// RTU CRC-16 or ASCII LRC mismatch
    #[error("Checksum mismatch: computed {computed:#06X}, received {received:#06X}")]
    BadChecksum {
        /// Value recomputed over the received frame
        computed: u16,
        /// Value carried in the frame trailer
        received: u16,
    },

    /// The confirmation contradicts the request (TID, function, quantity)
    #[error("Invalid response data: {message}")]
    BadData {
        /// Which cross-check failed
        message: String,
    },

    /// A reply arrived from a server other than the one addressed
    #[error("Response from server {actual} (expected {expected})")]
    BadSlave {
        /// Server id the request was addressed to
        expected: u8,
        /// Server id carried by the reply
        actual: u8,
    },

    /// The request or predicted response exceeds the backend ADU maximum
    #[error("Too many data: {message}")]
    TooManyData {
        /// Which length check failed
        message: String,
    },

    /// Malformed frame that cannot be attributed to a finer class
    #[error("Protocol error: {message}")]
    Protocol {
        /// What was malformed
        message: String,
    },

    /// The peer answered with a Modbus exception
    #[error("Modbus exception for function 0x{function:02X}: {code}")]
    Exception {
        /// Request function code (without the 0x80 flag)
        function: u8,
        /// Exception code reported by the peer
        code: ExceptionCode,
    },
}

impl ModbusError {
    /// Create an invalid-argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(message: S, elapsed_ms: u64) -> Self {
        Self::Timeout {
            message: message.into(),
            elapsed_ms,
        }
    }

    /// Create a bad-data error
    pub fn bad_data<S: Into<String>>(message: S) -> Self {
        Self::BadData {
            message: message.into(),
        }
    }

    /// Create a too-many-data error
    pub fn too_many_data<S: Into<String>>(message: S) -> Self {
        Self::TooManyData {
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create an exception error from a peer reply
    pub fn exception(function: u8, code: ExceptionCode) -> Self {
        Self::Exception { function, code }
    }

    /// True for link-level failures that the `LINK` recovery mode reacts to
    pub fn is_link_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Io(_) | Self::Timeout { .. }
        )
    }

    /// True for integrity failures that the `PROTOCOL` recovery mode reacts to
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::BadChecksum { .. }
                | Self::BadData { .. }
                | Self::BadSlave { .. }
                | Self::Protocol { .. }
        )
    }

    /// Flatten to the legacy negative-integer convention.
    ///
    /// Modbus exceptions map to `-(code)`; library errors map to negative
    /// values starting at `-0x10` so the two ranges cannot collide. Useful
    /// for callers porting from C APIs that multiplex both into one `int`.
    pub fn to_errno(&self) -> i32 {
        match self {
            Self::Exception { code, .. } => -(code.to_u8() as i32),
            Self::InvalidArgument { .. } => errno::EINVAL,
            Self::Timeout { .. } => errno::ETIMEDOUT,
            Self::Connection { .. } => errno::ECONN,
            Self::Io(_) => errno::EIO,
            Self::BadChecksum { .. } => errno::EBADCRC,
            Self::BadData { .. } => errno::EBADDATA,
            Self::BadSlave { .. } => errno::EBADSLAVE,
            Self::TooManyData { .. } => errno::EMDATA,
            Self::Protocol { .. } => errno::EPROTO,
        }
    }
}

/// Legacy integer error codes produced by [`ModbusError::to_errno`].
///
/// Values `-1..=-11` are reserved for Modbus exception codes.
pub mod errno {
    /// Invalid argument
    pub const EINVAL: i32 = -0x10;
    /// Receive phase timed out
    pub const ETIMEDOUT: i32 = -0x11;
    /// Connection failed or was lost
    pub const ECONN: i32 = -0x12;
    /// Transport I/O failure
    pub const EIO: i32 = -0x13;
    /// CRC-16/LRC mismatch
    pub const EBADCRC: i32 = -0x14;
    /// Response contradicts the request
    pub const EBADDATA: i32 = -0x15;
    /// Reply from an unexpected server
    pub const EBADSLAVE: i32 = -0x16;
    /// ADU length budget exceeded
    pub const EMDATA: i32 = -0x17;
    /// Malformed frame
    pub const EPROTO: i32 = -0x18;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_code_round_trip() {
        for code in 0x01..=0x0B {
            match ExceptionCode::from_u8(code) {
                Some(exc) => assert_eq!(exc.to_u8(), code),
                None => assert!(code == 0x09, "only 0x09 is undefined in range"),
            }
        }
        assert_eq!(ExceptionCode::from_u8(0x00), None);
        assert_eq!(ExceptionCode::from_u8(0x0C), None);
    }

    #[test]
    fn test_errno_shim_exceptions() {
        let err = ModbusError::exception(0x03, ExceptionCode::IllegalDataAddress);
        assert_eq!(err.to_errno(), -2);

        let err = ModbusError::exception(0x01, ExceptionCode::GatewayTargetFailed);
        assert_eq!(err.to_errno(), -0x0B);
    }

    #[test]
    fn test_errno_shim_library_errors_distinct_from_exceptions() {
        let errors = [
            ModbusError::invalid_argument("x"),
            ModbusError::timeout("x", 500),
            ModbusError::connection("x"),
            ModbusError::bad_data("x"),
            ModbusError::too_many_data("x"),
            ModbusError::protocol("x"),
        ];
        for err in &errors {
            assert!(
                err.to_errno() <= -0x10,
                "{:?} collides with exception range",
                err
            );
        }
    }

    #[test]
    fn test_display_messages_are_human_readable() {
        let err = ModbusError::BadChecksum {
            computed: 0x8776,
            received: 0x8789,
        };
        assert!(err.to_string().contains("0x8776"));

        let err = ModbusError::exception(0x03, ExceptionCode::IllegalDataAddress);
        assert!(err.to_string().contains("Illegal data address"));
    }

    #[test]
    fn test_recovery_classification() {
        assert!(ModbusError::timeout("t", 1).is_link_error());
        assert!(ModbusError::connection("c").is_link_error());
        assert!(!ModbusError::bad_data("d").is_link_error());

        assert!(ModbusError::bad_data("d").is_protocol_error());
        assert!(ModbusError::BadChecksum {
            computed: 1,
            received: 2
        }
        .is_protocol_error());
        assert!(!ModbusError::timeout("t", 1).is_protocol_error());

        // Exceptions are ordinary responses; neither recovery class applies.
        let exc = ModbusError::exception(0x03, ExceptionCode::Acknowledge);
        assert!(!exc.is_link_error() && !exc.is_protocol_error());
    }
}
