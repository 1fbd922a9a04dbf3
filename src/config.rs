//! Per-session configuration
//!
//! A session carries its own timeouts, server id, quirks and recovery mode;
//! nothing is process-global. Builders follow the `with_*` convention.

use std::time::Duration;

use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::SlaveId;
use crate::recovery::ErrorRecovery;

/// A seconds + microseconds timeout, validated the way the C-heritage API
/// expects: `{0, 0}` and microseconds >= 1 000 000 are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutSpec {
    /// Whole seconds
    pub seconds: u32,
    /// Microsecond remainder, in `[0, 1_000_000)`
    pub microseconds: u32,
}

impl TimeoutSpec {
    /// Validate and build a timeout value
    pub fn new(seconds: u32, microseconds: u32) -> ModbusResult<Self> {
        if microseconds >= 1_000_000 {
            return Err(ModbusError::invalid_argument(format!(
                "Timeout microseconds {} out of range",
                microseconds
            )));
        }
        if seconds == 0 && microseconds == 0 {
            return Err(ModbusError::invalid_argument("Zero timeout is not allowed"));
        }
        Ok(Self {
            seconds,
            microseconds,
        })
    }

    /// Build from milliseconds (must be non-zero)
    pub fn from_millis(ms: u64) -> ModbusResult<Self> {
        Self::new((ms / 1000) as u32, ((ms % 1000) * 1000) as u32)
    }

    /// Convert to a `Duration` for the tokio timers
    #[inline]
    pub fn as_duration(&self) -> Duration {
        Duration::new(self.seconds as u64, self.microseconds * 1000)
    }
}

/// Inter-character timeout; `Disabled` mirrors the negative-seconds
/// convention and lets the start-timeout budget cover the whole frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteTimeout {
    /// Applied between successive byte arrivals within one frame
    Enabled(TimeoutSpec),
    /// No inter-character limit
    Disabled,
}

/// Compatibility quirks, off by default
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Quirks(u8);

impl Quirks {
    /// Standard behavior
    pub const NONE: Quirks = Quirks(0);
    /// Accept server ids up to 255 instead of 247
    pub const MAX_SLAVE: Quirks = Quirks(1 << 0);
    /// Non-standard: reply even to broadcast requests
    pub const REPLY_TO_BROADCAST: Quirks = Quirks(1 << 1);

    /// Whether all quirks in `other` are enabled
    #[inline]
    pub fn contains(self, other: Quirks) -> bool {
        self.0 & other.0 == other.0
    }

    /// Enable the quirks in `other`
    #[inline]
    pub fn insert(&mut self, other: Quirks) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for Quirks {
    type Output = Quirks;

    fn bitor(self, rhs: Quirks) -> Quirks {
        Quirks(self.0 | rhs.0)
    }
}

/// Session-level configuration shared by client and server roles
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Addressed server id (client role) or own server id (server role)
    pub slave: SlaveId,
    /// Budget between issuing a wait and the first byte of the confirmation
    pub response_timeout: TimeoutSpec,
    /// Budget between successive bytes of one frame
    pub byte_timeout: ByteTimeout,
    /// Budget a server applies while listening for an indication
    pub indication_timeout: Duration,
    /// Error-recovery mode bitset
    pub recovery: ErrorRecovery,
    /// Compatibility quirks bitset
    pub quirks: Quirks,
    /// Hex-dump frames through the logging hooks
    pub debug: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            slave: 1,
            response_timeout: TimeoutSpec::from_millis(DEFAULT_RESPONSE_TIMEOUT_MS)
                .expect("default response timeout is valid"),
            byte_timeout: ByteTimeout::Enabled(
                TimeoutSpec::from_millis(DEFAULT_BYTE_TIMEOUT_MS)
                    .expect("default byte timeout is valid"),
            ),
            indication_timeout: Duration::from_secs(INDICATION_TIMEOUT_SECS),
            recovery: ErrorRecovery::NONE,
            quirks: Quirks::NONE,
            debug: false,
        }
    }
}

impl SessionConfig {
    /// New configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest server id this session accepts
    pub fn max_slave(&self) -> u8 {
        if self.quirks.contains(Quirks::MAX_SLAVE) {
            MAX_SERVER_ID_RELAXED
        } else {
            MAX_SERVER_ID
        }
    }

    /// Set the server id, validating it against the configured bound
    pub fn set_slave(&mut self, slave: SlaveId) -> ModbusResult<()> {
        if slave > self.max_slave() {
            return Err(ModbusError::invalid_argument(format!(
                "Server id {} out of range 0..={}",
                slave,
                self.max_slave()
            )));
        }
        self.slave = slave;
        Ok(())
    }

    /// Builder: server id (validated)
    pub fn with_slave(mut self, slave: SlaveId) -> ModbusResult<Self> {
        self.set_slave(slave)?;
        Ok(self)
    }

    /// Builder: response timeout
    pub fn with_response_timeout(mut self, timeout: TimeoutSpec) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Builder: byte timeout
    pub fn with_byte_timeout(mut self, timeout: ByteTimeout) -> Self {
        self.byte_timeout = timeout;
        self
    }

    /// Builder: recovery mode
    pub fn with_recovery(mut self, recovery: ErrorRecovery) -> Self {
        self.recovery = recovery;
        self
    }

    /// Builder: quirks
    pub fn with_quirks(mut self, quirks: Quirks) -> Self {
        self.quirks = quirks;
        self
    }

    /// Builder: debug frame dumps
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_validation() {
        assert!(TimeoutSpec::new(0, 0).is_err());
        assert!(TimeoutSpec::new(0, 1_000_000).is_err());
        assert!(TimeoutSpec::new(0, 999_999).is_ok());
        assert!(TimeoutSpec::new(1, 0).is_ok());
    }

    #[test]
    fn test_timeout_duration_conversion() {
        let spec = TimeoutSpec::from_millis(1500).unwrap();
        assert_eq!(spec.seconds, 1);
        assert_eq!(spec.microseconds, 500_000);
        assert_eq!(spec.as_duration(), Duration::from_millis(1500));
    }

    #[test]
    fn test_quirks_bitset() {
        let mut quirks = Quirks::NONE;
        assert!(!quirks.contains(Quirks::MAX_SLAVE));

        quirks.insert(Quirks::MAX_SLAVE);
        assert!(quirks.contains(Quirks::MAX_SLAVE));
        assert!(!quirks.contains(Quirks::REPLY_TO_BROADCAST));

        let both = Quirks::MAX_SLAVE | Quirks::REPLY_TO_BROADCAST;
        assert!(both.contains(Quirks::MAX_SLAVE));
        assert!(both.contains(Quirks::REPLY_TO_BROADCAST));
    }

    #[test]
    fn test_slave_range_standard_and_relaxed() {
        let mut config = SessionConfig::new();
        assert!(config.set_slave(247).is_ok());
        assert!(config.set_slave(248).is_err());

        config.quirks.insert(Quirks::MAX_SLAVE);
        assert!(config.set_slave(255).is_ok());
    }

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.response_timeout.as_duration(), Duration::from_millis(500));
        assert_eq!(
            config.byte_timeout,
            ByteTimeout::Enabled(TimeoutSpec::from_millis(500).unwrap())
        );
        assert_eq!(config.indication_timeout, Duration::from_secs(60));
        assert!(!config.debug);
    }
}
