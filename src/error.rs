//! Error types for the instrument communication core.
//!
//! `PicoError` is the single error type surfaced by every layer of the crate,
//! built with `thiserror` so that lower-level failures convert with `?`.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: the port could not be opened or the instrument did not
//!   answer the handshake probe. Fatal, never retried here.
//! - **`Io`**: a transport-level fault on an open connection (including an
//!   unexpected end of stream or a frame not written in time). Fatal for the
//!   attempt.
//! - **`Timeout`**: a single line read exceeded its deadline. This is the
//!   only recoverable error; a streaming session tolerates a bounded number of
//!   consecutive timeouts before escalating to **`TimeoutExceeded`**.
//! - **`Protocol`**: the response stream violated package framing. The stream
//!   can no longer be trusted, so the session is always faulted.
//! - **`Instrument`**: the device reported an error code. It is propagated
//!   verbatim and not interpreted.
//! - **`Cancelled`**: the caller cancelled a running session.
//!
//! Configuration, validation and parse errors cover the ambient layers around
//! the protocol core.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type PicoResult<T> = std::result::Result<T, PicoError>;

/// Errors raised by the communication core.
#[derive(Error, Debug)]
pub enum PicoError {
    /// Port could not be opened or the handshake failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// Transport fault on an open connection
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A single line read exceeded its deadline
    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Consecutive read timeouts reached the session budget
    #[error("Exceeded timeout budget: {0} consecutive read timeouts")]
    TimeoutExceeded(u32),

    /// Response stream framing was violated
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Error code reported by the instrument
    #[error("Instrument reported error {code:04X}{}", .detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default())]
    Instrument {
        /// Hexadecimal error code
        code: u16,
        /// Text following the code, if any
        detail: Option<String>,
    },

    /// Cancelled through a `CancelToken`
    #[error("Session cancelled")]
    Cancelled,

    /// No open connection
    #[error("Serial port not connected")]
    NotConnected,

    /// A command is already in flight
    #[error("A command is already in flight on this session")]
    Busy,

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// A value is out of range
    #[error("Validation error: {0}")]
    Validation(String),

    /// Text could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Built without the `instrument_serial` feature
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

impl PicoError {
    /// Whether the caller may retry the failed operation on the same connection.
    ///
    /// Only a single transport timeout qualifies; everything else is terminal
    /// for the attempt.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PicoError::Timeout(_))
    }
}

/// Framing violations in the response stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Value token outside an open package
    #[error("value received outside of a data package")]
    OutOfPackageValue,

    /// Measurement or curve ended inside an open package
    #[error("measurement ended with an unterminated data package")]
    IncompleteMeasurement,

    /// Package start while a package is open
    #[error("data package started before the previous one ended")]
    NestedPackage,

    /// Package end without an open package
    #[error("data package end without a matching start")]
    UnmatchedPackageEnd,

    /// Compact package that could not be decoded
    #[error("malformed data package: {0}")]
    MalformedPackage(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_error_display() {
        let err = PicoError::Connection("no reply to probe".to_string());
        assert_eq!(err.to_string(), "Connection error: no reply to probe");
    }

    #[test]
    fn test_instrument_error_display() {
        let err = PicoError::Instrument {
            code: 0x4,
            detail: None,
        };
        assert_eq!(err.to_string(), "Instrument reported error 0004");

        let err = PicoError::Instrument {
            code: 0x2017,
            detail: Some("Line 3, Col 1".into()),
        };
        assert_eq!(
            err.to_string(),
            "Instrument reported error 2017 (Line 3, Col 1)"
        );
    }

    #[test]
    fn test_protocol_error_converts() {
        let err: PicoError = ProtocolError::OutOfPackageValue.into();
        assert!(matches!(
            err,
            PicoError::Protocol(ProtocolError::OutOfPackageValue)
        ));
    }

    #[test]
    fn test_only_timeout_is_recoverable() {
        assert!(PicoError::Timeout(Duration::from_millis(10)).is_recoverable());
        assert!(!PicoError::TimeoutExceeded(3).is_recoverable());
        assert!(!PicoError::Cancelled.is_recoverable());
    }
}
