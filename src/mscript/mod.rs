//! MethodSCRIPT codec.
//!
//! - [`command`]: outgoing instructions and their wire encoding
//! - [`response`]: decoding of response lines into tokens
//! - [`vars`]: variable types and compact data packages
//! - [`techniques`]: ready-made measurement scripts

/// Outgoing commands
pub mod command;
/// Incoming response lines
pub mod response;
/// Technique script builders
pub mod techniques;
/// Variable types and compact packages
pub mod vars;

pub use command::{encode, parse_instruction, Command, Instruction, Param, Quantity, SiPrefix};
pub use response::{decode_line, ChannelValue, Decoder, ResponseToken};
