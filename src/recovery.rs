//! Error-recovery policy
//!
//! Recovery re-arms a session after a failure so the next call has a chance
//! of succeeding. It never retries the failed exchange and never swallows
//! the error: the caller always sees what went wrong.
//!
//! - `LINK` reacts to transport failures (write error, connection closed,
//!   timeout) by closing and reopening the transport.
//! - `PROTOCOL` reacts to integrity failures (bad checksum, unexpected TID,
//!   function or quantity mismatch) by sleeping one response-timeout and
//!   flushing the inbound direction, so a late or mangled frame cannot
//!   poison the next exchange.
//!
//! Modbus exception replies are ordinary responses and trigger neither mode.

use tracing::debug;

use crate::config::SessionConfig;
use crate::error::ModbusError;
use crate::transport::ModbusTransport;

/// Recovery-mode bitset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorRecovery(u8);

impl ErrorRecovery {
    /// Surface every error; never touch the transport
    pub const NONE: ErrorRecovery = ErrorRecovery(0);
    /// Close and reopen the transport after link failures
    pub const LINK: ErrorRecovery = ErrorRecovery(1 << 0);
    /// Sleep and flush after integrity failures
    pub const PROTOCOL: ErrorRecovery = ErrorRecovery(1 << 1);

    /// Whether all modes in `other` are enabled
    #[inline]
    pub fn contains(self, other: ErrorRecovery) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ErrorRecovery {
    type Output = ErrorRecovery;

    fn bitor(self, rhs: ErrorRecovery) -> ErrorRecovery {
        ErrorRecovery(self.0 | rhs.0)
    }
}

/// Apply the configured recovery to a failed exchange, best effort.
///
/// Recovery failures are logged and dropped; the original error is what the
/// caller must see.
pub async fn recover<T: ModbusTransport>(
    transport: &mut T,
    config: &SessionConfig,
    error: &ModbusError,
) {
    if error.is_link_error() && config.recovery.contains(ErrorRecovery::LINK) {
        debug!("link recovery: reconnecting after {}", error);
        let _ = transport.close().await;
        if let Err(e) = transport.reconnect().await {
            debug!("link recovery failed: {}", e);
        }
    } else if error.is_protocol_error() && config.recovery.contains(ErrorRecovery::PROTOCOL) {
        debug!("protocol recovery: sleep and flush after {}", error);
        tokio::time::sleep(config.response_timeout.as_duration()).await;
        match transport.flush().await {
            Ok(discarded) if discarded > 0 => {
                debug!("protocol recovery discarded {} bytes", discarded)
            }
            Ok(_) => {}
            Err(e) => debug!("protocol recovery flush failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeoutSpec;
    use crate::transport::StreamTransport;
    use std::time::Duration;

    #[test]
    fn test_bitset() {
        let both = ErrorRecovery::LINK | ErrorRecovery::PROTOCOL;
        assert!(both.contains(ErrorRecovery::LINK));
        assert!(both.contains(ErrorRecovery::PROTOCOL));
        assert!(!ErrorRecovery::NONE.contains(ErrorRecovery::LINK));
        assert!(!ErrorRecovery::LINK.contains(ErrorRecovery::PROTOCOL));
    }

    #[tokio::test]
    async fn test_protocol_recovery_flushes_late_reply() {
        let (client, server) = tokio::io::duplex(64);
        let mut near = StreamTransport::new(client);
        let mut far = StreamTransport::new(server);

        // A late reply is sitting in the pipe when recovery runs
        far.send(&[0xDE, 0xAD, 0xBE, 0xEF]).await.unwrap();

        let mut config = SessionConfig::default();
        config.response_timeout = TimeoutSpec::from_millis(10).unwrap();
        config.recovery = ErrorRecovery::PROTOCOL;

        let error = ModbusError::BadChecksum {
            computed: 1,
            received: 2,
        };
        recover(&mut near, &config, &error).await;

        // Nothing left to read afterwards
        assert!(!near.readable(Duration::from_millis(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_recovery_none_leaves_input_alone() {
        let (client, server) = tokio::io::duplex(64);
        let mut near = StreamTransport::new(client);
        let mut far = StreamTransport::new(server);

        far.send(&[0x01, 0x02]).await.unwrap();

        let config = SessionConfig::default();
        let error = ModbusError::BadChecksum {
            computed: 1,
            received: 2,
        };
        recover(&mut near, &config, &error).await;

        assert!(near.readable(Duration::from_millis(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_exception_never_triggers_recovery() {
        let (client, server) = tokio::io::duplex(64);
        let mut near = StreamTransport::new(client);
        let mut far = StreamTransport::new(server);

        far.send(&[0x01, 0x02]).await.unwrap();

        let mut config = SessionConfig::default();
        config.recovery = ErrorRecovery::LINK | ErrorRecovery::PROTOCOL;

        let error = ModbusError::exception(0x03, crate::error::ExceptionCode::Acknowledge);
        recover(&mut near, &config, &error).await;

        // Transport untouched: still connected, input still pending
        assert!(near.is_connected());
        assert!(near.readable(Duration::from_millis(10)).await.unwrap());
    }
}
