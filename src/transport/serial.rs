//! Serial port connector.
//!
//! The EmStat Pico talks 8N1 without flow control. Serial support is behind
//! the `instrument_serial` feature; without it, opening fails with
//! `SerialFeatureDisabled`.

use super::{Connector, DynSerial, LineTransport};
use crate::config::SerialConfig;
#[cfg(not(feature = "instrument_serial"))]
use crate::error::PicoError;
use crate::error::PicoResult;

/// Opens the configured serial port.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConnector;

/// The production transport.
pub type SerialTransport = LineTransport<SerialConnector>;

impl SerialTransport {
    /// Transport over the configured serial port.
    pub fn serial() -> Self {
        LineTransport::new(SerialConnector)
    }
}

#[cfg(feature = "instrument_serial")]
impl Connector for SerialConnector {
    fn connect(&self, config: &SerialConfig) -> PicoResult<DynSerial> {
        use crate::error::PicoError;
        use tokio_serial::SerialPortBuilderExt;

        let port = tokio_serial::new(&config.port, config.baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                PicoError::Connection(format!(
                    "Failed to open serial port '{}' at {} baud: {}",
                    config.port, config.baud_rate, e
                ))
            })?;

        Ok(Box::new(port))
    }
}

#[cfg(not(feature = "instrument_serial"))]
impl Connector for SerialConnector {
    fn connect(&self, _config: &SerialConfig) -> PicoResult<DynSerial> {
        Err(PicoError::SerialFeatureDisabled)
    }
}
