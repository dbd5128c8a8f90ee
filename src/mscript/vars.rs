//! MethodSCRIPT variable types and compact data-package variables.
//!
//! Compact packages send every variable as a fixed-width field:
//!
//! ```text
//! <type:2><value:7 hex digits><si prefix:1>[,<metadata>...]
//! <type:2>     nan
//! ```
//!
//! The hexadecimal value carries an offset of 2^27 so that negative readings
//! stay positive on the wire.

use crate::mscript::command::SiPrefix;
use serde::{Deserialize, Serialize};

/// Offset subtracted from the 7-digit hexadecimal raw value.
const RAW_VALUE_OFFSET: i64 = 1 << 27;

/// A MethodSCRIPT variable type such as `ba` (WE current).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarType {
    /// Two-letter identifier
    pub id: &'static str,
    /// Human readable name
    pub name: &'static str,
    /// Base unit, empty for dimensionless types
    pub unit: &'static str,
}

const VAR_TYPES: &[VarType] = &[
    VarType { id: "aa", name: "unknown", unit: "" },
    VarType { id: "ab", name: "WE vs RE potential", unit: "V" },
    VarType { id: "ac", name: "CE vs GND potential", unit: "V" },
    VarType { id: "ad", name: "SE vs GND potential", unit: "V" },
    VarType { id: "ae", name: "RE vs GND potential", unit: "V" },
    VarType { id: "af", name: "WE vs GND potential", unit: "V" },
    VarType { id: "ag", name: "WE vs CE potential", unit: "V" },
    VarType { id: "as", name: "AIN0 potential", unit: "V" },
    VarType { id: "at", name: "AIN1 potential", unit: "V" },
    VarType { id: "au", name: "AIN2 potential", unit: "V" },
    VarType { id: "av", name: "AIN3 potential", unit: "V" },
    VarType { id: "aw", name: "AIN4 potential", unit: "V" },
    VarType { id: "ax", name: "AIN5 potential", unit: "V" },
    VarType { id: "ay", name: "AIN6 potential", unit: "V" },
    VarType { id: "az", name: "AIN7 potential", unit: "V" },
    VarType { id: "ba", name: "WE current", unit: "A" },
    VarType { id: "ca", name: "Phase", unit: "degrees" },
    VarType { id: "cb", name: "Impedance", unit: "\u{2126}" },
    VarType { id: "cc", name: "Z_real", unit: "\u{2126}" },
    VarType { id: "cd", name: "Z_imag", unit: "\u{2126}" },
    VarType { id: "ce", name: "EIS E TDD", unit: "V" },
    VarType { id: "cf", name: "EIS I TDD", unit: "A" },
    VarType { id: "cg", name: "EIS sampling frequency", unit: "Hz" },
    VarType { id: "ch", name: "EIS E AC", unit: "Vrms" },
    VarType { id: "ci", name: "EIS E DC", unit: "V" },
    VarType { id: "cj", name: "EIS I AC", unit: "Arms" },
    VarType { id: "ck", name: "EIS I DC", unit: "A" },
    VarType { id: "da", name: "Applied potential", unit: "V" },
    VarType { id: "db", name: "Applied current", unit: "A" },
    VarType { id: "dc", name: "Applied frequency", unit: "Hz" },
    VarType { id: "dd", name: "Applied AC amplitude", unit: "Vrms" },
    VarType { id: "ea", name: "Channel", unit: "" },
    VarType { id: "eb", name: "Time", unit: "s" },
    VarType { id: "ec", name: "Pin mask", unit: "" },
    VarType { id: "ed", name: "Temperature", unit: "\u{b0} Celsius" },
    VarType { id: "ha", name: "Generic current 1", unit: "A" },
    VarType { id: "hb", name: "Generic current 2", unit: "A" },
    VarType { id: "hc", name: "Generic current 3", unit: "A" },
    VarType { id: "hd", name: "Generic current 4", unit: "A" },
    VarType { id: "ia", name: "Generic potential 1", unit: "V" },
    VarType { id: "ib", name: "Generic potential 2", unit: "V" },
    VarType { id: "ic", name: "Generic potential 3", unit: "V" },
    VarType { id: "id", name: "Generic potential 4", unit: "V" },
    VarType { id: "ja", name: "Misc. generic 1", unit: "" },
    VarType { id: "jb", name: "Misc. generic 2", unit: "" },
    VarType { id: "jc", name: "Misc. generic 3", unit: "" },
    VarType { id: "jd", name: "Misc. generic 4", unit: "" },
];

/// Look up a variable type by its two-letter id.
pub fn var_type(id: &str) -> Option<&'static VarType> {
    VAR_TYPES.iter().find(|t| t.id == id)
}

/// Status flags carried in the `1X` metadata field.
const STATUS_FLAGS: &[(u8, &str)] = &[
    (0x1, "TIMING_ERROR"),
    (0x2, "OVERLOAD"),
    (0x4, "UNDERLOAD"),
    (0x8, "OVERLOAD_WARNING"),
];

/// Describe a status nibble, e.g. `OVERLOAD | UNDERLOAD`, or `OK`.
pub fn status_text(status: u8) -> String {
    let set: Vec<&str> = STATUS_FLAGS
        .iter()
        .filter(|(mask, _)| status & mask != 0)
        .map(|(_, name)| *name)
        .collect();
    if set.is_empty() {
        "OK".to_string()
    } else {
        set.join(" | ")
    }
}

/// Describe the current range index reported in `2XX` metadata.
///
/// EmStat4 devices reuse the field as a potential range for `ab` and `cd`.
pub fn current_range_text(device_type: &str, var_id: &str, range: u8) -> &'static str {
    let text = if device_type == "EmStat Pico" {
        match range {
            0 => Some("100 nA"),
            1 => Some("2 uA"),
            2 => Some("4 uA"),
            3 => Some("8 uA"),
            4 => Some("16 uA"),
            5 => Some("32 uA"),
            6 => Some("63 uA"),
            7 => Some("125 uA"),
            8 => Some("250 uA"),
            9 => Some("500 uA"),
            10 => Some("1 mA"),
            11 => Some("5 mA"),
            128 => Some("100 nA (High speed)"),
            129 => Some("1 uA (High speed)"),
            130 => Some("6 uA (High speed)"),
            131 => Some("13 uA (High speed)"),
            132 => Some("25 uA (High speed)"),
            133 => Some("50 uA (High speed)"),
            134 => Some("100 uA (High speed)"),
            135 => Some("200 uA (High speed)"),
            136 => Some("1 mA (High speed)"),
            137 => Some("5 mA (High speed)"),
            _ => None,
        }
    } else if device_type.contains("EmStat4") {
        if var_id == "ab" || var_id == "cd" {
            match range {
                2 => Some("50 mV"),
                3 => Some("100 mV"),
                4 => Some("200 mV"),
                5 => Some("500 mV"),
                6 => Some("1 V"),
                _ => None,
            }
        } else {
            match range {
                3 => Some("1 nA"),
                6 => Some("10 nA"),
                9 => Some("100 nA"),
                12 => Some("1 uA"),
                15 => Some("10 uA"),
                18 => Some("100 uA"),
                21 => Some("1 mA"),
                24 => Some("10 mA"),
                27 => Some("100 mA"),
                _ => None,
            }
        }
    } else {
        None
    };
    text.unwrap_or("UNKNOWN CURRENT RANGE")
}

/// Optional per-variable metadata of a compact package.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarMetadata {
    /// Status nibble (see [`status_text`])
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u8>,
    /// Current range index (see [`current_range_text`])
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_range: Option<u8>,
}

impl VarMetadata {
    /// True when no metadata field was present.
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.current_range.is_none()
    }

    fn parse<'a>(tokens: impl Iterator<Item = &'a str>) -> Self {
        let mut metadata = Self::default();
        for token in tokens {
            match (token.len(), token.as_bytes().first()) {
                (2, Some(b'1')) => metadata.status = u8::from_str_radix(&token[1..], 16).ok(),
                (3, Some(b'2')) => {
                    metadata.current_range = u8::from_str_radix(&token[1..], 16).ok()
                }
                _ => {}
            }
        }
        metadata
    }
}

/// One decoded variable of a compact package.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageVar {
    /// Two-letter variable type id
    pub id: String,
    /// Value in base units (NaN when the device reported `nan`)
    pub value: f64,
    /// Unit from the variable type table, empty when unknown
    pub unit: String,
    /// Optional metadata
    pub metadata: VarMetadata,
}

impl PackageVar {
    /// Decode a single `;`-separated variable field.
    ///
    /// Returns `None` when the field does not follow the compact layout.
    pub fn parse(field: &str) -> Option<Self> {
        let mut parts = field.split(',');
        let body = parts.next()?;
        if body.len() < 10 || !body.is_ascii() {
            return None;
        }

        let id = &body[0..2];
        if !id.bytes().all(|b| b.is_ascii_lowercase()) {
            return None;
        }

        let value = if &body[2..10] == "     nan" {
            f64::NAN
        } else {
            if body.len() != 10 {
                return None;
            }
            let raw = i64::from_str_radix(&body[2..9], 16).ok()? - RAW_VALUE_OFFSET;
            let prefix = body[9..10].chars().next()?;
            raw as f64 * prefix_factor(prefix)?
        };

        let unit = var_type(id).map(|t| t.unit).unwrap_or_default();

        Some(Self {
            id: id.to_string(),
            value,
            unit: unit.to_string(),
            metadata: VarMetadata::parse(parts),
        })
    }
}

/// Multiplication factor of a compact package prefix character.
///
/// A space means no prefix and `i` marks an integer value.
fn prefix_factor(prefix: char) -> Option<f64> {
    match prefix {
        ' ' | 'i' => Some(1.0),
        other => SiPrefix::from_char(other).map(SiPrefix::factor),
    }
}

/// Decode the body of a compact package line (without the leading `P`).
///
/// Returns `None` if any field is malformed, so that a damaged line is never
/// half decoded.
pub fn parse_package_body(body: &str) -> Option<Vec<PackageVar>> {
    body.split(';').map(PackageVar::parse).collect()
}
