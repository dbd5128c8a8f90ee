//! Assembly of response tokens into samples and curves.
//!
//! The [`Assembler`] consumes the token stream of one run. Values between a
//! package start and end form a [`Sample`]; samples between curve terminators
//! form a [`Curve`]. The measurement end marker finalizes everything, after
//! which the curves are handed out and never mutated again.
//!
//! # Framing rules
//!
//! - A value outside an open package is `OutOfPackageValue`.
//! - A package start while one is open is `NestedPackage`.
//! - A package end without a start is `UnmatchedPackageEnd`.
//! - A curve or measurement end while a package is open, or a stream that
//!   stops before the measurement end, is `IncompleteMeasurement`.

use crate::error::ProtocolError;
use crate::mscript::{ChannelValue, Command, ResponseToken};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One data package: channel readings in the order they were received.
///
/// Duplicated channels are kept (bipotentiostat packages carry two `ba`
/// currents).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    values: Vec<ChannelValue>,
}

impl Sample {
    /// Sample holding `values` in arrival order.
    pub fn new(values: Vec<ChannelValue>) -> Self {
        Self { values }
    }

    /// First reading of `channel`.
    pub fn get(&self, channel: &str) -> Option<f64> {
        self.values
            .iter()
            .find(|v| v.channel == channel)
            .map(|v| v.reading)
    }

    /// Reading at position `index`.
    pub fn column(&self, index: usize) -> Option<f64> {
        self.values.get(index).map(|v| v.reading)
    }

    /// All values in arrival order.
    pub fn values(&self) -> &[ChannelValue] {
        &self.values
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when the sample holds no value.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Ordered samples of one scan or loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Curve {
    samples: Vec<Sample>,
}

impl Curve {
    /// Samples in arrival order.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when the curve holds no sample.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Values at position `index` of every sample; NaN where a sample is
    /// shorter.
    pub fn column(&self, index: usize) -> Vec<f64> {
        self.samples
            .iter()
            .map(|s| s.column(index).unwrap_or(f64::NAN))
            .collect()
    }

    /// Values of `channel` in every sample; NaN where it is missing.
    pub fn channel(&self, channel: &str) -> Vec<f64> {
        self.samples
            .iter()
            .map(|s| s.get(channel).unwrap_or(f64::NAN))
            .collect()
    }
}

/// Concatenate column `index` across `curves`.
pub fn concat_column(curves: &[Curve], index: usize) -> Vec<f64> {
    curves.iter().flat_map(|c| c.column(index)).collect()
}

/// Incremental builder driven by response tokens.
#[derive(Debug, Default)]
pub struct Assembler {
    open: Option<Sample>,
    current: Curve,
    curves: Vec<Curve>,
}

impl Assembler {
    /// Assembler with no package open.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one token.
    ///
    /// Returns the finalized curves when the token ends the measurement.
    /// Errors and unknown tokens are not framing tokens and are ignored here.
    pub fn on_token(&mut self, token: ResponseToken) -> Result<Option<Vec<Curve>>, ProtocolError> {
        match token {
            ResponseToken::PackageStart => {
                if self.open.is_some() {
                    return Err(ProtocolError::NestedPackage);
                }
                self.open = Some(Sample::default());
            }
            ResponseToken::Value(value) => {
                self.open
                    .as_mut()
                    .ok_or(ProtocolError::OutOfPackageValue)?
                    .values
                    .push(value);
            }
            ResponseToken::PackageEnd => {
                let sample = self.open.take().ok_or(ProtocolError::UnmatchedPackageEnd)?;
                self.current.samples.push(sample);
            }
            ResponseToken::Package(values) => {
                if self.open.is_some() {
                    return Err(ProtocolError::NestedPackage);
                }
                self.current.samples.push(Sample::new(values));
            }
            ResponseToken::CurveEnd => {
                self.ensure_closed()?;
                if !self.current.is_empty() {
                    self.curves.push(std::mem::take(&mut self.current));
                }
            }
            ResponseToken::MeasurementEnd => {
                self.ensure_closed()?;
                // a run always yields at least one curve, even an empty one
                if !self.current.is_empty() || self.curves.is_empty() {
                    self.curves.push(std::mem::take(&mut self.current));
                }
                return Ok(Some(std::mem::take(&mut self.curves)));
            }
            ResponseToken::Error { .. } | ResponseToken::Unknown(_) => {}
        }
        Ok(None)
    }

    /// The stream stopped before the measurement end.
    pub fn finish(&mut self) -> ProtocolError {
        self.open = None;
        ProtocolError::IncompleteMeasurement
    }

    /// Whether a package is currently open.
    pub fn in_package(&self) -> bool {
        self.open.is_some()
    }

    /// Samples received so far, across all curves.
    pub fn sample_count(&self) -> usize {
        self.curves.iter().map(Curve::len).sum::<usize>() + self.current.len()
    }

    fn ensure_closed(&self) -> Result<(), ProtocolError> {
        if self.open.is_some() {
            return Err(ProtocolError::IncompleteMeasurement);
        }
        Ok(())
    }
}

/// Assemble a complete token sequence offline.
pub fn assemble<I>(tokens: I) -> Result<Vec<Curve>, ProtocolError>
where
    I: IntoIterator<Item = ResponseToken>,
{
    let mut assembler = Assembler::new();
    for token in tokens {
        if let Some(curves) = assembler.on_token(token)? {
            return Ok(curves);
        }
    }
    Err(assembler.finish())
}

/// Result of one completed run, ready to be persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    /// Identifier from the session settings
    pub instrument_id: String,
    /// Firmware version from the handshake, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    /// When the command was submitted
    pub started_at: DateTime<Utc>,
    /// When the run ended
    pub finished_at: DateTime<Utc>,
    /// Command that produced the curves
    pub command: Command,
    /// Finalized curves in order
    pub curves: Vec<Curve>,
}

impl MeasurementRecord {
    /// Samples across all curves.
    pub fn sample_count(&self) -> usize {
        self.curves.iter().map(Curve::len).sum()
    }
}
