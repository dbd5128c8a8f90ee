//! Incoming response lines and their decoded tokens.
//!
//! Decoding is a pure function of the line and the configured marker
//! literals. It never fails: anything that does not match a known shape is
//! returned as [`ResponseToken::Unknown`] so that callers decide the policy.
//!
//! Recognised shapes, checked in this order:
//!
//! | Line | Token |
//! |---|---|
//! | measurement end marker (`*`) | `MeasurementEnd` |
//! | curve end marker (`+`, `-`) | `CurveEnd` |
//! | package start / end marker (`P`, `E`) | `PackageStart` / `PackageEnd` |
//! | `[echo]!<hex code>[: detail]` | `Error` |
//! | `P<var>;<var>;...` compact package | `Package` |
//! | `<channel>=<float><unit>` | `Value` |

use crate::config::MarkerConfig;
use crate::mscript::vars::{self, VarMetadata};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Matches `<channel>=<float><unit>`, e.g. `CH1=1.234mV` or `ba=-2.5e-9A`.
static VALUE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<channel>[A-Za-z_][A-Za-z0-9_.]*)\s*=\s*(?P<value>[-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?|[-+]?(?i:nan|inf))\s*(?P<unit>\S*)$",
    )
    .unwrap_or_else(|e| unreachable!("invalid value line regex: {e}"))
});

/// A single channel reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelValue {
    /// Channel name, or the variable type id for compact packages
    pub channel: String,
    /// Numeric reading as sent by the device
    pub reading: f64,
    /// Unit text, may be empty
    pub unit: String,
    /// Status and range metadata of compact packages
    #[serde(default, skip_serializing_if = "VarMetadata::is_empty")]
    pub metadata: VarMetadata,
}

impl ChannelValue {
    /// Value without metadata.
    pub fn new(channel: impl Into<String>, reading: f64, unit: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            reading,
            unit: unit.into(),
            metadata: VarMetadata::default(),
        }
    }
}

impl From<vars::PackageVar> for ChannelValue {
    fn from(var: vars::PackageVar) -> Self {
        Self {
            channel: var.id,
            reading: var.value,
            unit: var.unit,
            metadata: var.metadata,
        }
    }
}

/// One decoded unit of instrument output.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseToken {
    /// `<channel>=<value><unit>` inside an open package
    Value(ChannelValue),
    /// A compact package carrying a complete sample on one line
    Package(Vec<ChannelValue>),
    /// Opens a package
    PackageStart,
    /// Closes a package
    PackageEnd,
    /// End of a loop or scan; the current curve is complete
    CurveEnd,
    /// End of the measurement
    MeasurementEnd,
    /// Device-reported error, code propagated verbatim
    Error {
        /// Hexadecimal error code
        code: u16,
        /// Text following the code, if any
        detail: Option<String>,
    },
    /// Anything else, including echoes and blank lines
    Unknown(String),
}

/// Marker literals used while decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoder {
    markers: MarkerConfig,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(MarkerConfig::default())
    }
}

static DEFAULT_DECODER: Lazy<Decoder> = Lazy::new(Decoder::default);

/// Decode a line with the default marker literals.
pub fn decode_line(line: &str) -> ResponseToken {
    DEFAULT_DECODER.decode_line(line)
}

impl Decoder {
    /// Decoder for `markers`.
    pub fn new(markers: MarkerConfig) -> Self {
        Self { markers }
    }

    /// Marker literals in use.
    pub fn markers(&self) -> &MarkerConfig {
        &self.markers
    }

    /// Decode one response line (with or without its terminator).
    pub fn decode_line(&self, line: &str) -> ResponseToken {
        // a trailing space is a valid prefix character in compact packages
        let unterminated = line.trim_end_matches(['\r', '\n']);
        let line = unterminated.trim();
        let m = &self.markers;

        if line == m.measurement_end {
            return ResponseToken::MeasurementEnd;
        }
        if m.curve_end.iter().any(|marker| marker == line) {
            return ResponseToken::CurveEnd;
        }
        if line == m.package_start {
            return ResponseToken::PackageStart;
        }
        if line == m.package_end {
            return ResponseToken::PackageEnd;
        }
        if let Some(token) = self.decode_error(line) {
            return token;
        }
        if let Some(token) = decode_compact_package(&m.package_start, unterminated.trim_start()) {
            return token;
        }
        if let Some(value) = decode_value(line) {
            return ResponseToken::Value(value);
        }
        ResponseToken::Unknown(line.to_string())
    }

    /// `!0004`, `e!0004` (after the script echo) or `!2017: Line 3, Col 1`.
    fn decode_error(&self, line: &str) -> Option<ResponseToken> {
        let prefix = self.markers.error_prefix.as_str();
        let rest = match line.strip_prefix(prefix) {
            Some(rest) => rest,
            None => {
                let mut chars = line.chars();
                let echo = chars.next()?;
                if !echo.is_ascii_alphabetic() {
                    return None;
                }
                chars.as_str().strip_prefix(prefix)?
            }
        };

        let digits = rest
            .find(|c: char| !c.is_ascii_hexdigit())
            .unwrap_or(rest.len());
        if digits == 0 || digits > 4 {
            return None;
        }
        let code = u16::from_str_radix(&rest[..digits], 16).ok()?;

        let detail = rest[digits..]
            .trim_start_matches(|c: char| c == ':' || c.is_whitespace())
            .trim();
        Some(ResponseToken::Error {
            code,
            detail: (!detail.is_empty()).then(|| detail.to_string()),
        })
    }
}

/// `<package_start><var>;<var>;...` on a single line.
fn decode_compact_package(package_start: &str, line: &str) -> Option<ResponseToken> {
    let body = line.strip_prefix(package_start)?;
    if body.is_empty() {
        return None;
    }
    let vars = vars::parse_package_body(body)?;
    Some(ResponseToken::Package(
        vars.into_iter().map(ChannelValue::from).collect(),
    ))
}

fn decode_value(line: &str) -> Option<ChannelValue> {
    let caps = VALUE_LINE.captures(line)?;
    let reading: f64 = caps["value"].parse().ok()?;
    Some(ChannelValue::new(&caps["channel"], reading, &caps["unit"]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_value_line() {
        assert_eq!(
            decode_line("CH1=1.234mV"),
            ResponseToken::Value(ChannelValue::new("CH1", 1.234, "mV"))
        );
    }

    #[test]
    fn test_decode_value_variants() {
        assert_eq!(
            decode_line("ba=-2.5e-9A\r\n"),
            ResponseToken::Value(ChannelValue::new("ba", -2.5e-9, "A"))
        );
        assert_eq!(
            decode_line("T = 21.5"),
            ResponseToken::Value(ChannelValue::new("T", 21.5, ""))
        );
        // exponent needs digits, so `eV` stays a unit
        assert_eq!(
            decode_line("E=2.5eV"),
            ResponseToken::Value(ChannelValue::new("E", 2.5, "eV"))
        );
    }

    #[test]
    fn test_decode_unknown_never_fails() {
        assert_eq!(decode_line("XYZ"), ResponseToken::Unknown("XYZ".into()));
        assert_eq!(decode_line(""), ResponseToken::Unknown(String::new()));
        assert_eq!(decode_line("CH1="), ResponseToken::Unknown("CH1=".into()));
        assert_eq!(decode_line("e"), ResponseToken::Unknown("e".into()));
    }

    #[test]
    fn test_decode_markers() {
        assert_eq!(decode_line("P"), ResponseToken::PackageStart);
        assert_eq!(decode_line("E\r"), ResponseToken::PackageEnd);
        assert_eq!(decode_line("*\n"), ResponseToken::MeasurementEnd);
        assert_eq!(decode_line("+"), ResponseToken::CurveEnd);
        assert_eq!(decode_line("-"), ResponseToken::CurveEnd);
    }

    #[test]
    fn test_decode_error_lines() {
        assert_eq!(
            decode_line("!0004"),
            ResponseToken::Error {
                code: 4,
                detail: None
            }
        );
        assert_eq!(
            decode_line("e!2017: Line 3, Col 1"),
            ResponseToken::Error {
                code: 0x2017,
                detail: Some("Line 3, Col 1".into())
            }
        );
        assert_eq!(decode_line("!"), ResponseToken::Unknown("!".into()));
        assert_eq!(decode_line("!!"), ResponseToken::Unknown("!!".into()));
    }

    #[test]
    fn test_decode_compact_package() {
        let token = decode_line("Peb8000001 ;ba8000002n,14,20A\n");
        let ResponseToken::Package(values) = token else {
            panic!("expected package, got {token:?}");
        };
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].channel, "eb");
        assert_eq!(values[0].unit, "s");
        assert!((values[0].reading - 1.0).abs() < 1e-12);
        assert_eq!(values[1].channel, "ba");
        assert!((values[1].reading - 2e-9).abs() < 1e-18);
        assert_eq!(values[1].metadata.status, Some(4));
    }

    #[test]
    fn test_compact_package_keeps_trailing_prefix() {
        let token = decode_line("Pda8000010 \r\n");
        let ResponseToken::Package(values) = token else {
            panic!("expected package, got {token:?}");
        };
        assert_eq!(values.len(), 1);
        assert!((values[0].reading - 16.0).abs() < 1e-12);
        assert_eq!(values[0].unit, "V");
    }

    #[test]
    fn test_damaged_compact_package_is_unknown() {
        assert_eq!(
            decode_line("Peb8000001 ;ba80"),
            ResponseToken::Unknown("Peb8000001 ;ba80".into())
        );
    }

    #[test]
    fn test_compact_package_follows_package_start() {
        let decoder = Decoder::new(MarkerConfig {
            package_start: "Q".into(),
            ..MarkerConfig::default()
        });
        let ResponseToken::Package(values) = decoder.decode_line("Qda8000001 ") else {
            panic!("expected a compact package");
        };
        assert_eq!(values[0].channel, "da");
        assert_eq!(values[0].reading, 1.0);
        assert_eq!(
            decoder.decode_line("Pda8000001 "),
            ResponseToken::Unknown("Pda8000001".into())
        );
    }

    #[test]
    fn test_custom_markers() {
        let decoder = Decoder::new(MarkerConfig {
            package_start: "pck_start".into(),
            package_end: "pck_end".into(),
            measurement_end: "END".into(),
            curve_end: vec!["~".into()],
            error_prefix: "ERR".into(),
        });
        assert_eq!(decoder.decode_line("pck_start"), ResponseToken::PackageStart);
        assert_eq!(decoder.decode_line("pck_end"), ResponseToken::PackageEnd);
        assert_eq!(decoder.decode_line("END"), ResponseToken::MeasurementEnd);
        assert_eq!(decoder.decode_line("~"), ResponseToken::CurveEnd);
        assert_eq!(decoder.decode_line("*"), ResponseToken::Unknown("*".into()));
        assert_eq!(
            decoder.decode_line("ERR12"),
            ResponseToken::Error {
                code: 0x12,
                detail: None
            }
        );
    }
}
