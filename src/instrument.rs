//! EmStat Pico instrument handle.
//!
//! [`Instrument`] owns the transport and runs one [`Session`] per command.
//! The connection outlives individual runs: it stays open after a completed
//! measurement or an instrument-reported error, and is reopened on the next
//! run after any other fault.
//!
//! # Example
//!
//! ```no_run
//! use pico_daq::config::Settings;
//! use pico_daq::instrument::Instrument;
//! use pico_daq::mscript::techniques::{self, Limits, OcpParams};
//!
//! # async fn example() -> pico_daq::error::PicoResult<()> {
//! let settings = Settings::load_from("config/pico.toml")?;
//! let mut pico = Instrument::connect(settings).await?;
//!
//! let ocp = techniques::ocp(&OcpParams { interval: 0.1, total_time: 10.0 }, &Limits::default())?;
//! let record = pico.run(&ocp).await?;
//! println!("{} samples", record.sample_count());
//!
//! pico.disconnect().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::Settings;
use crate::error::PicoResult;
use crate::measurement::MeasurementRecord;
use crate::mscript::Command;
use crate::session::{CancelToken, Session};
use crate::transport::{SerialTransport, Transport};
use chrono::Utc;
use tracing::{info, instrument};

/// Handle to one EmStat Pico and its connection.
pub struct Instrument<T = SerialTransport> {
    transport: T,
    settings: Settings,
    cancel: CancelToken,
}

impl Instrument<SerialTransport> {
    /// Open the configured serial port and complete the handshake.
    pub async fn connect(settings: Settings) -> PicoResult<Self> {
        Self::with_transport(SerialTransport::serial(), settings).await
    }
}

impl<T: Transport> Instrument<T> {
    /// Use an existing transport, opening it if necessary.
    pub async fn with_transport(mut transport: T, settings: Settings) -> PicoResult<Self> {
        settings.validate()?;
        if !transport.is_open() {
            transport.open(&settings.serial).await?;
        }
        info!(
            "{} ready on {}",
            settings.session.instrument_id, settings.serial.port
        );
        Ok(Self {
            transport,
            settings,
            cancel: CancelToken::new(),
        })
    }

    /// Execute `command` and return the finalized measurement.
    ///
    /// A cancellation requested through [`Instrument::cancel_token`] while
    /// the run is in progress ends it with `PicoError::Cancelled`.
    #[instrument(skip_all, fields(instrument = %self.settings.session.instrument_id))]
    pub async fn run(&mut self, command: &Command) -> PicoResult<MeasurementRecord> {
        let started_at = Utc::now();
        let result = {
            let mut session = Session::new(&mut self.transport, &self.settings, self.cancel.clone());
            match session.submit(command.clone()) {
                Ok(()) => session.run().await,
                Err(e) => Err(e),
            }
        };
        // a cancellation only ever applies to the run it interrupted
        self.cancel.reset();

        Ok(MeasurementRecord {
            instrument_id: self.settings.session.instrument_id.clone(),
            firmware: self.firmware_version().map(str::to_string),
            started_at,
            finished_at: Utc::now(),
            command: command.clone(),
            curves: result?,
        })
    }

    /// Handle for cancelling a run from another task.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Whether the connection is currently open.
    pub fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    /// Firmware version reported by the handshake probe.
    pub fn firmware_version(&self) -> Option<&str> {
        self.transport.firmware_version()
    }

    /// Settings the instrument was created with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Close the connection and release the port.
    pub async fn disconnect(mut self) -> PicoResult<()> {
        self.transport.close().await
    }
}
