//! Outgoing MethodSCRIPT commands.
//!
//! A [`Command`] is an ordered list of [`Instruction`]s. Encoding produces one
//! newline-terminated frame per instruction:
//!
//! ```text
//! <opcode> <param1> <param2> ...\n
//! ```
//!
//! Numbers are written the way the firmware expects them: an integer mantissa
//! followed by an optional SI prefix character (`500m`, `-200m`, `100n`).

use crate::error::{PicoError, PicoResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SI prefixes accepted in numeric literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SiPrefix {
    /// 10^-18
    Atto,
    /// 10^-15
    Femto,
    /// 10^-12
    Pico,
    /// 10^-9
    Nano,
    /// 10^-6
    Micro,
    /// 10^-3
    Milli,
    /// 10^3
    Kilo,
    /// 10^6
    Mega,
    /// 10^9
    Giga,
    /// 10^12
    Tera,
    /// 10^15
    Peta,
    /// 10^18
    Exa,
}

impl SiPrefix {
    /// Multiplication factor of the prefix.
    pub fn factor(self) -> f64 {
        match self {
            SiPrefix::Atto => 1e-18,
            SiPrefix::Femto => 1e-15,
            SiPrefix::Pico => 1e-12,
            SiPrefix::Nano => 1e-9,
            SiPrefix::Micro => 1e-6,
            SiPrefix::Milli => 1e-3,
            SiPrefix::Kilo => 1e3,
            SiPrefix::Mega => 1e6,
            SiPrefix::Giga => 1e9,
            SiPrefix::Tera => 1e12,
            SiPrefix::Peta => 1e15,
            SiPrefix::Exa => 1e18,
        }
    }

    /// Character written after the mantissa.
    pub fn as_char(self) -> char {
        match self {
            SiPrefix::Atto => 'a',
            SiPrefix::Femto => 'f',
            SiPrefix::Pico => 'p',
            SiPrefix::Nano => 'n',
            SiPrefix::Micro => 'u',
            SiPrefix::Milli => 'm',
            SiPrefix::Kilo => 'k',
            SiPrefix::Mega => 'M',
            SiPrefix::Giga => 'G',
            SiPrefix::Tera => 'T',
            SiPrefix::Peta => 'P',
            SiPrefix::Exa => 'E',
        }
    }

    /// Prefix for a wire character.
    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'a' => SiPrefix::Atto,
            'f' => SiPrefix::Femto,
            'p' => SiPrefix::Pico,
            'n' => SiPrefix::Nano,
            'u' => SiPrefix::Micro,
            'm' => SiPrefix::Milli,
            'k' => SiPrefix::Kilo,
            'M' => SiPrefix::Mega,
            'G' => SiPrefix::Giga,
            'T' => SiPrefix::Tera,
            'P' => SiPrefix::Peta,
            'E' => SiPrefix::Exa,
            _ => return None,
        })
    }
}

/// Fixed-point number with an SI prefix, e.g. `500m` for 0.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quantity {
    /// Integer part sent on the wire
    pub mantissa: i64,
    /// Scale of the mantissa
    pub prefix: SiPrefix,
}

impl Quantity {
    /// Express `value` (in base units) in multiples of `prefix`, rounded to
    /// the nearest integer.
    pub fn new(value: f64, prefix: SiPrefix) -> Self {
        Self {
            mantissa: (value / prefix.factor()).round() as i64,
            prefix,
        }
    }

    /// Shorthand for millis, the unit used for potentials and times.
    pub fn milli(value: f64) -> Self {
        Self::new(value, SiPrefix::Milli)
    }

    /// Value in base units.
    pub fn value(&self) -> f64 {
        self.mantissa as f64 * self.prefix.factor()
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.mantissa, self.prefix.as_char())
    }
}

/// A typed instruction parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Param {
    /// Variable name or keyword, e.g. `p` or `ba`
    Ident(String),
    /// Plain integer
    Int(i64),
    /// Prefixed fixed-point number
    Number(Quantity),
    /// Call-style option such as `nscans(1)` or `poly_we(1 b)`
    Call { name: String, args: Vec<Param> },
}

impl Param {
    /// Bare identifier such as a variable name.
    pub fn ident(name: impl Into<String>) -> Self {
        Param::Ident(name.into())
    }

    /// Call-style option such as `nscans(1)`.
    pub fn call(name: impl Into<String>, args: Vec<Param>) -> Self {
        Param::Call {
            name: name.into(),
            args,
        }
    }
}

impl From<Quantity> for Param {
    fn from(q: Quantity) -> Self {
        Param::Number(q)
    }
}

impl From<i64> for Param {
    fn from(v: i64) -> Self {
        Param::Int(v)
    }
}

impl From<&str> for Param {
    fn from(s: &str) -> Self {
        Param::Ident(s.to_string())
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Ident(name) => f.write_str(name),
            Param::Int(v) => write!(f, "{}", v),
            Param::Number(q) => write!(f, "{}", q),
            Param::Call { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
        }
    }
}

/// One line of a MethodSCRIPT program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// Command word, e.g. `meas_loop_cv`
    pub opcode: String,
    /// Arguments in order
    pub params: Vec<Param>,
}

impl Instruction {
    /// Instruction without arguments.
    pub fn new(opcode: impl Into<String>) -> Self {
        Self {
            opcode: opcode.into(),
            params: Vec::new(),
        }
    }

    /// Append a parameter (builder style).
    pub fn arg(mut self, param: impl Into<Param>) -> Self {
        self.params.push(param.into());
        self
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.opcode)?;
        for param in &self.params {
            write!(f, " {}", param)?;
        }
        Ok(())
    }
}

/// An immutable, ordered sequence of instructions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    instructions: Vec<Instruction>,
    /// Scripts end with an empty line, which starts execution on the device.
    terminated: bool,
}

impl Command {
    /// A MethodSCRIPT program, sent with the trailing empty line.
    pub fn script(instructions: Vec<Instruction>) -> Self {
        Self {
            instructions,
            terminated: true,
        }
    }

    /// Direct commands such as `t` (version) or `i` (serial number).
    pub fn direct(instructions: Vec<Instruction>) -> Self {
        Self {
            instructions,
            terminated: false,
        }
    }

    /// Instructions in program order.
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Whether the command is a MethodSCRIPT program.
    pub fn is_script(&self) -> bool {
        self.terminated
    }

    /// True when there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Parse MethodSCRIPT source text into a script command.
    ///
    /// Blank lines and `#` comments are skipped; leading indentation is
    /// ignored.
    pub fn parse_script(source: &str) -> PicoResult<Self> {
        let instructions = source
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(parse_instruction)
            .collect::<PicoResult<Vec<_>>>()?;
        Ok(Self::script(instructions))
    }

    /// Render the command as source text, one instruction per line.
    pub fn to_source(&self) -> String {
        let mut out = String::new();
        for instruction in &self.instructions {
            out.push_str(&instruction.to_string());
            out.push('\n');
        }
        out
    }
}

/// Serialise a command into byte frames, one per instruction line.
pub fn encode(command: &Command) -> Vec<Vec<u8>> {
    let mut frames: Vec<Vec<u8>> = command
        .instructions
        .iter()
        .map(|instruction| format!("{}\n", instruction).into_bytes())
        .collect();
    if command.terminated {
        frames.push(b"\n".to_vec());
    }
    frames
}

/// Reference decoder for a single instruction line.
pub fn parse_instruction(line: &str) -> PicoResult<Instruction> {
    let line = line.trim();
    let tokens = split_tokens(line)?;
    let mut tokens = tokens.into_iter();
    let opcode = tokens
        .next()
        .ok_or_else(|| PicoError::Parse("empty instruction".to_string()))?;
    if opcode.contains('(') {
        return Err(PicoError::Parse(format!("invalid opcode '{}'", opcode)));
    }
    let params = tokens.map(|t| parse_param(&t)).collect::<PicoResult<_>>()?;
    Ok(Instruction { opcode, params })
}

/// Split on whitespace, keeping parenthesised groups together.
fn split_tokens(line: &str) -> PicoResult<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;

    for c in line.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| PicoError::Parse(format!("unbalanced ')' in '{}'", line)))?;
                current.push(c);
            }
            c if c.is_whitespace() && depth == 0 => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if depth != 0 {
        return Err(PicoError::Parse(format!("unbalanced '(' in '{}'", line)));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

fn parse_param(token: &str) -> PicoResult<Param> {
    if let Some(open) = token.find('(') {
        let inner = token[open + 1..]
            .strip_suffix(')')
            .ok_or_else(|| PicoError::Parse(format!("malformed option '{}'", token)))?;
        let args = split_tokens(inner)?
            .iter()
            .map(|t| parse_param(t))
            .collect::<PicoResult<_>>()?;
        return Ok(Param::call(&token[..open], args));
    }

    if let Ok(v) = token.parse::<i64>() {
        return Ok(Param::Int(v));
    }

    let mut chars = token.chars();
    if let Some(last) = chars.next_back() {
        let mantissa = chars.as_str();
        if let (Some(prefix), Ok(mantissa)) = (SiPrefix::from_char(last), mantissa.parse::<i64>()) {
            return Ok(Param::Number(Quantity { mantissa, prefix }));
        }
    }

    Ok(Param::Ident(token.to_string()))
}
