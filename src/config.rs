//! Configuration loading using Figment
//!
//! Settings are read from a TOML file and then overridden by environment
//! variables prefixed with `PICO_`. Nested keys are separated by a double
//! underscore:
//!
//! ```text
//! PICO_SERIAL__PORT=/dev/ttyUSB1
//! PICO_SESSION__TIMEOUT_BUDGET=5
//! PICO_LOGGING__LEVEL=debug
//! ```
//!
//! # Example
//!
//! ```no_run
//! use pico_daq::config::Settings;
//!
//! let settings = Settings::load_from("config/pico.toml")?;
//! println!("Port: {}", settings.serial.port);
//! # Ok::<(), pico_daq::error::PicoError>(())
//! ```

use crate::error::{PicoError, PicoResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Serial endpoint
    #[serde(default)]
    pub serial: SerialConfig,
    /// Measurement session behaviour
    #[serde(default)]
    pub session: SessionConfig,
    /// Response stream marker literals
    #[serde(default)]
    pub markers: MarkerConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerialConfig {
    /// Port name (e.g. "/dev/ttyUSB0", "COM3")
    #[serde(default)]
    pub port: String,
    /// Baud rate; the EmStat Pico runs at 230400
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Deadline for a single response line in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Deadline for writing a single frame in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Attempts allowed for a frame that keeps writing zero bytes
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,
    /// Command sent as the handshake probe after opening
    #[serde(default = "default_probe_command")]
    pub probe_command: String,
    /// Text ending the reply to the probe
    #[serde(default = "default_probe_terminator")]
    pub probe_terminator: String,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Consecutive read timeouts tolerated while streaming
    #[serde(default = "default_timeout_budget")]
    pub timeout_budget: u32,
    /// Identifier recorded on every measurement record
    #[serde(default = "default_instrument_id")]
    pub instrument_id: String,
}

/// Literal markers of the response stream.
///
/// The literals are compared against whole, trimmed response lines, except
/// `error_prefix` which introduces an error line and `package_start` which
/// also prefixes single-line compact packages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarkerConfig {
    /// Opens a data package
    #[serde(default = "default_package_start")]
    pub package_start: String,
    /// Closes a data package
    #[serde(default = "default_package_end")]
    pub package_end: String,
    /// Ends the measurement
    #[serde(default = "default_measurement_end")]
    pub measurement_end: String,
    /// End of loop / end of scan terminators that split curves
    #[serde(default = "default_curve_end")]
    pub curve_end: Vec<String>,
    /// Introduces an error line carrying a hexadecimal code
    #[serde(default = "default_error_prefix")]
    pub error_prefix: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_baud_rate() -> u32 {
    230_400
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_write_attempts() -> u32 {
    3
}

fn default_probe_command() -> String {
    "t".to_string()
}

fn default_probe_terminator() -> String {
    "*".to_string()
}

fn default_timeout_budget() -> u32 {
    3
}

fn default_instrument_id() -> String {
    "emstat_pico".to_string()
}

fn default_package_start() -> String {
    "P".to_string()
}

fn default_package_end() -> String {
    "E".to_string()
}

fn default_measurement_end() -> String {
    "*".to_string()
}

fn default_curve_end() -> Vec<String> {
    vec!["+".to_string(), "-".to_string()]
}

fn default_error_prefix() -> String {
    "!".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_timeout_ms(),
            write_timeout_ms: default_timeout_ms(),
            write_attempts: default_write_attempts(),
            probe_command: default_probe_command(),
            probe_terminator: default_probe_terminator(),
        }
    }
}

impl SerialConfig {
    /// Serial config for `port` with every other field at its default
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Default::default()
        }
    }

    /// Deadline for one response line
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Deadline for writing one frame
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_budget: default_timeout_budget(),
            instrument_id: default_instrument_id(),
        }
    }
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            package_start: default_package_start(),
            package_end: default_package_end(),
            measurement_end: default_measurement_end(),
            curve_end: default_curve_end(),
            error_prefix: default_error_prefix(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ============================================================================
// Loading and Validation
// ============================================================================

impl Settings {
    /// Load settings from a TOML file and `PICO_` environment variables
    ///
    /// Environment variables take precedence over the file. The result is
    /// validated before it is returned.
    ///
    /// # Errors
    ///
    /// Returns `PicoError::Config` if the sources cannot be merged or
    /// deserialized and `PicoError::Validation` if a value is out of range.
    pub fn load_from<P: AsRef<Path>>(path: P) -> PicoResult<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Settings::default()))
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("PICO_").split("__")),
        )
    }

    /// Load settings from environment variables only
    pub fn from_env() -> PicoResult<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(Settings::default()))
                .merge(Env::prefixed("PICO_").split("__")),
        )
    }

    fn from_figment(figment: Figment) -> PicoResult<Self> {
        let settings: Self = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Render the effective settings as TOML
    pub fn to_toml_string(&self) -> PicoResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| PicoError::Validation(format!("Cannot render settings: {}", e)))
    }

    /// Validate settings after loading
    ///
    /// Checks:
    /// - Port name is present and serial numbers are non-zero
    /// - Timeout budget is at least one
    /// - Log level is valid
    /// - Marker literals are non-empty and distinct
    pub fn validate(&self) -> PicoResult<()> {
        let serial = &self.serial;
        if serial.port.trim().is_empty() {
            return Err(PicoError::Validation(
                "serial.port cannot be empty".to_string(),
            ));
        }
        if serial.baud_rate == 0 {
            return Err(PicoError::Validation(
                "serial.baud_rate must be greater than 0".to_string(),
            ));
        }
        if serial.read_timeout_ms == 0 || serial.write_timeout_ms == 0 {
            return Err(PicoError::Validation(
                "serial timeouts must be greater than 0 ms".to_string(),
            ));
        }
        if serial.write_attempts == 0 {
            return Err(PicoError::Validation(
                "serial.write_attempts must be at least 1".to_string(),
            ));
        }
        if serial.probe_command.trim().is_empty() {
            return Err(PicoError::Validation(
                "serial.probe_command cannot be empty".to_string(),
            ));
        }
        if serial.probe_terminator.trim().is_empty() {
            return Err(PicoError::Validation(
                "serial.probe_terminator cannot be empty".to_string(),
            ));
        }

        if self.session.timeout_budget == 0 {
            return Err(PicoError::Validation(
                "session.timeout_budget must be at least 1".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(PicoError::Validation(format!(
                "Invalid logging.level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        self.markers.validate()
    }
}

impl MarkerConfig {
    /// Every marker must be non-empty and no literal may be used twice.
    pub fn validate(&self) -> PicoResult<()> {
        let mut seen = std::collections::HashSet::new();
        let literals = [
            ("package_start", &self.package_start),
            ("package_end", &self.package_end),
            ("measurement_end", &self.measurement_end),
            ("error_prefix", &self.error_prefix),
        ]
        .into_iter()
        .chain(self.curve_end.iter().map(|m| ("curve_end", m)));

        for (name, literal) in literals {
            if literal.trim().is_empty() {
                return Err(PicoError::Validation(format!(
                    "markers.{} cannot be empty",
                    name
                )));
            }
            if !seen.insert(literal.as_str()) {
                return Err(PicoError::Validation(format!(
                    "markers.{} '{}' collides with another marker",
                    name, literal
                )));
            }
        }
        Ok(())
    }
}
