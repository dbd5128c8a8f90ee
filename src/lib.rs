//! Serial MethodSCRIPT communication core for PalmSens EmStat Pico
//! potentiostats.
//!
//! The crate is layered bottom-up:
//!
//! - [`transport`]: line-oriented byte I/O over a serial port (or any async
//!   stream), with the handshake probe and bounded timeouts
//! - [`mscript`]: encoding of commands and decoding of response lines
//! - [`measurement`]: assembly of decoded tokens into curves
//! - [`session`]: the per-command state machine with timeout budget and
//!   cancellation
//! - [`instrument`]: the connect / run / cancel / disconnect surface
//!
//! [`config`], [`logging`] and [`error`] provide the ambient stack.

/// Layered settings
pub mod config;
/// Crate error types
pub mod error;
/// Instrument handle
pub mod instrument;
/// Subscriber setup
pub mod logging;
/// Samples, curves and the token assembler
pub mod measurement;
/// MethodSCRIPT encoding and response decoding
pub mod mscript;
/// Session state machine and cancellation
pub mod session;
/// Line transport to the instrument
pub mod transport;

pub use config::Settings;
pub use error::{PicoError, PicoResult};
pub use instrument::Instrument;
pub use measurement::{Curve, MeasurementRecord, Sample};
pub use session::{CancelToken, FaultKind, SessionState};
