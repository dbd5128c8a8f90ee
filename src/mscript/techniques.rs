//! MethodSCRIPT programs for the standard electrochemical techniques.
//!
//! Every builder validates its parameters against the [`Limits`] of the
//! instrument model and returns a terminated [`Command`]. Potentials, times
//! and scan rates are sent as milli fixed-point numbers.
//!
//! Scripts store the timer in `a`, the applied potential in `p`, the WE
//! current in `c` and, in bipotentiostat mode, the second WE current in `b`.
//!
//! # Example
//!
//! ```
//! use pico_daq::mscript::techniques::{self, CvParams, Limits};
//!
//! let params = CvParams::new(-0.2, 0.5, -0.2, -0.2, 0.1, 0.005);
//! let command = techniques::cv(&params, &Limits::default())?;
//! assert!(command.to_source().contains("meas_loop_cv p c -200m 500m -200m 5m 100m nscans(0)"));
//! # Ok::<(), pico_daq::error::PicoError>(())
//! ```

use crate::error::{PicoError, PicoResult};
use crate::mscript::command::{Command, Instruction, Param, Quantity, SiPrefix};
use std::path::Path;
use std::str::FromStr;

// ============================================================================
// Instrument limits
// ============================================================================

/// EmStat Pico hardware variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Model {
    /// Low current range hardware (default)
    #[default]
    LowRange,
    /// High current range hardware
    HighRange,
}

impl FromStr for Model {
    type Err = PicoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low_range" | "lr" => Ok(Model::LowRange),
            "high_range" | "hr" => Ok(Model::HighRange),
            other => Err(PicoError::Validation(format!(
                "Unknown model '{}'. Must be low_range or high_range",
                other
            ))),
        }
    }
}

/// Parameter windows accepted by the instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct Limits {
    /// Hardware variant the windows apply to
    pub model: Model,
    /// Potential window (V)
    pub e_min: f64,
    /// Upper potential (V)
    pub e_max: f64,
    /// Current window (A)
    pub i_min: f64,
    /// Upper current (A)
    pub i_max: f64,
    /// Compliance voltage (V)
    pub compliance_voltage: f64,
    /// EIS frequency window (Hz)
    pub freq_min: f64,
    /// Upper frequency (Hz)
    pub freq_max: f64,
    /// Scan rate window (V/s)
    pub sr_min: f64,
    /// Upper scan rate (V/s)
    pub sr_max: f64,
    /// Potential step window (V)
    pub de_min: f64,
    /// Upper potential step (V)
    pub de_max: f64,
    /// Sampling interval window (s)
    pub dt_min: f64,
    /// Upper sampling interval (s)
    pub dt_max: f64,
    /// Total run time window (s)
    pub ttot_min: f64,
    /// Upper total time (s)
    pub ttot_max: f64,
}

impl Limits {
    /// Windows for `model`.
    pub fn for_model(model: Model) -> Self {
        let (e_min, e_max, i_min, i_max, compliance_voltage) = match model {
            Model::LowRange => (-3.0, 3.0, 1e-9, 0.01, 5.0),
            Model::HighRange => (-6.0, 6.0, 1e-7, 0.1, 8.0),
        };
        Self {
            model,
            e_min,
            e_max,
            i_min,
            i_max,
            compliance_voltage,
            freq_min: 1e-8,
            freq_max: 200_000.0,
            sr_min: 1e-6,
            sr_max: 10.0,
            de_min: 1e-4,
            de_max: 0.25,
            dt_min: 1e-4,
            dt_max: 300.0,
            ttot_min: 1e-3,
            ttot_max: 86_400.0,
        }
    }

    /// Fails with `Validation` when `value` lies outside `[low, high]`.
    pub fn check(value: f64, low: f64, high: f64, label: &str, unit: &str) -> PicoResult<()> {
        if value.is_nan() || value < low || value > high {
            return Err(PicoError::Validation(format!(
                "{label} should be between {low} {unit} and {high} {unit}. Received {value} {unit}"
            )));
        }
        Ok(())
    }

    fn potential(&self, value: f64, label: &str) -> PicoResult<()> {
        Self::check(value, self.e_min, self.e_max, label, "V")
    }

    fn scan_rate(&self, value: f64) -> PicoResult<()> {
        Self::check(value, self.sr_min, self.sr_max, "sr", "V/s")
    }

    fn step(&self, value: f64) -> PicoResult<()> {
        Self::check(value, self.de_min, self.de_max, "dE", "V")
    }

    fn interval(&self, value: f64) -> PicoResult<()> {
        Self::check(value, self.dt_min, self.dt_max, "dt", "s")
    }

    fn total_time(&self, value: f64) -> PicoResult<()> {
        Self::check(value, self.ttot_min, self.ttot_max, "ttot", "s")
    }

    fn frequency(&self, value: f64, label: &str) -> PicoResult<()> {
        Self::check(value, self.freq_min, self.freq_max, label, "Hz")
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::for_model(Model::default())
    }
}

/// Potentiostat speed/range trade-off passed to `set_pgstat_mode`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PgstatMode {
    /// Mode 2
    LowSpeed,
    /// Mode 3
    HighSpeed,
    /// Mode 4
    #[default]
    MaxRange,
}

impl PgstatMode {
    /// Numeric mode for `set_pgstat_mode`.
    pub fn code(self) -> i64 {
        match self {
            PgstatMode::LowSpeed => 2,
            PgstatMode::HighSpeed => 3,
            PgstatMode::MaxRange => 4,
        }
    }

    /// Unrecognised names select `MaxRange`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "low_speed" => PgstatMode::LowSpeed,
            "high_speed" => PgstatMode::HighSpeed,
            _ => PgstatMode::MaxRange,
        }
    }
}

// ============================================================================
// Technique parameters
// ============================================================================

/// Cyclic voltammetry.
#[derive(Debug, Clone, PartialEq)]
pub struct CvParams {
    /// Initial potential (V)
    pub e_ini: f64,
    /// First vertex (V)
    pub e_v1: f64,
    /// Second vertex (V)
    pub e_v2: f64,
    /// Final potential (V)
    pub e_fin: f64,
    /// Scan rate (V/s)
    pub scan_rate: f64,
    /// Potential step (V)
    pub step: f64,
    /// Number of sweeps
    pub sweeps: u32,
    /// Potentiostat mode
    pub mode: PgstatMode,
    /// Potential of the second working electrode (V)
    pub bipot: Option<f64>,
}

impl CvParams {
    /// One sweep in max range mode, single channel.
    pub fn new(e_ini: f64, e_v1: f64, e_v2: f64, e_fin: f64, scan_rate: f64, step: f64) -> Self {
        Self {
            e_ini,
            e_v1,
            e_v2,
            e_fin,
            scan_rate,
            step,
            sweeps: 1,
            mode: PgstatMode::default(),
            bipot: None,
        }
    }
}

/// Chronoamperometry.
#[derive(Debug, Clone, PartialEq)]
pub struct CaParams {
    /// Step potential (V)
    pub e_step: f64,
    /// Sampling interval (s)
    pub interval: f64,
    /// Total time (s)
    pub total_time: f64,
    /// Potentiostat mode
    pub mode: PgstatMode,
    /// Potential of the second working electrode (V)
    pub bipot: Option<f64>,
}

impl CaParams {
    /// Max range mode, single channel.
    pub fn new(e_step: f64, interval: f64, total_time: f64) -> Self {
        Self {
            e_step,
            interval,
            total_time,
            mode: PgstatMode::default(),
            bipot: None,
        }
    }
}

/// Linear sweep voltammetry.
#[derive(Debug, Clone, PartialEq)]
pub struct LsvParams {
    /// Initial potential (V)
    pub e_ini: f64,
    /// Final potential (V)
    pub e_fin: f64,
    /// Scan rate (V/s)
    pub scan_rate: f64,
    /// Potential step (V)
    pub step: f64,
    /// Potentiostat mode
    pub mode: PgstatMode,
    /// Potential of the second working electrode (V)
    pub bipot: Option<f64>,
}

impl LsvParams {
    /// Max range mode, single channel.
    pub fn new(e_ini: f64, e_fin: f64, scan_rate: f64, step: f64) -> Self {
        Self {
            e_ini,
            e_fin,
            scan_rate,
            step,
            mode: PgstatMode::default(),
            bipot: None,
        }
    }
}

/// Open circuit potential.
#[derive(Debug, Clone, PartialEq)]
pub struct OcpParams {
    /// Sampling interval (s)
    pub interval: f64,
    /// Total time (s)
    pub total_time: f64,
}

/// Electrochemical impedance spectroscopy.
#[derive(Debug, Clone, PartialEq)]
pub struct EisParams {
    /// DC potential (V)
    pub e_dc: f64,
    /// Potentiostat channel, 0 or 1
    pub channel: u8,
    /// Lowest frequency (Hz)
    pub low_freq: f64,
    /// Highest frequency (Hz)
    pub high_freq: f64,
    /// AC amplitude (V)
    pub amplitude: f64,
    /// Number of frequencies
    pub points: u32,
}

impl EisParams {
    /// 31 frequencies on channel 0.
    pub fn new(e_dc: f64, low_freq: f64, high_freq: f64, amplitude: f64) -> Self {
        Self {
            e_dc,
            channel: 0,
            low_freq,
            high_freq,
            amplitude,
            points: 31,
        }
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Cyclic voltammetry script.
pub fn cv(params: &CvParams, limits: &Limits) -> PicoResult<Command> {
    limits.potential(params.e_ini, "Eini")?;
    limits.potential(params.e_v1, "Ev1")?;
    limits.potential(params.e_v2, "Ev2")?;
    limits.potential(params.e_fin, "Efin")?;
    limits.scan_rate(params.scan_rate)?;
    limits.step(params.step)?;
    if params.sweeps == 0 {
        return Err(PicoError::Validation(
            "nSweeps must be at least 1".to_string(),
        ));
    }

    let loop_line = Instruction::new("meas_loop_cv")
        .arg("p")
        .arg("c")
        .arg(Quantity::milli(params.e_ini))
        .arg(Quantity::milli(params.e_v1))
        .arg(Quantity::milli(params.e_v2))
        .arg(Quantity::milli(params.step))
        .arg(Quantity::milli(params.scan_rate))
        .arg(Param::call("nscans", vec![Param::Int(i64::from(params.sweeps) - 1)]));

    let mut program = declare(&["c", "p", "a"]);
    match params.bipot {
        Some(e2) => {
            limits.potential(e2, "E2")?;
            program.extend(bipot_setup(e2, params.e_ini));
            program.push(loop_line.arg(poly_we()));
            program.extend(package(&["a", "p", "c", "b"]));
        }
        None => {
            program.extend(single_setup(params.mode, params.e_ini));
            program.push(Instruction::new("wait").arg(Param::Int(2)));
            program.push(Instruction::new("timer_start"));
            program.push(loop_line);
            program.extend(package(&["a", "p", "c"]));
        }
    }
    program.extend(finish());
    Ok(Command::script(program))
}

/// Chronoamperometry script.
pub fn ca(params: &CaParams, limits: &Limits) -> PicoResult<Command> {
    limits.potential(params.e_step, "Estep")?;
    limits.interval(params.interval)?;
    limits.total_time(params.total_time)?;

    let loop_line = Instruction::new("meas_loop_ca")
        .arg("p")
        .arg("c")
        .arg(Quantity::milli(params.e_step))
        .arg(Quantity::milli(params.interval))
        .arg(Quantity::milli(params.total_time));

    let mut program = declare(&["p", "c", "a"]);
    match params.bipot {
        Some(e2) => {
            limits.potential(e2, "E2")?;
            program.extend(bipot_setup(e2, params.e_step));
            program.push(loop_line.arg(poly_we()));
            program.extend(package(&["a", "p", "c", "b"]));
        }
        None => {
            program.extend(single_setup(params.mode, params.e_step));
            program.push(Instruction::new("timer_start"));
            program.push(loop_line);
            program.extend(package(&["a", "p", "c"]));
        }
    }
    program.extend(finish());
    Ok(Command::script(program))
}

/// Linear sweep voltammetry script.
pub fn lsv(params: &LsvParams, limits: &Limits) -> PicoResult<Command> {
    limits.potential(params.e_ini, "Eini")?;
    limits.potential(params.e_fin, "Efin")?;
    limits.scan_rate(params.scan_rate)?;
    limits.step(params.step)?;

    let loop_line = Instruction::new("meas_loop_lsv")
        .arg("p")
        .arg("c")
        .arg(Quantity::milli(params.e_ini))
        .arg(Quantity::milli(params.e_fin))
        .arg(Quantity::milli(params.step))
        .arg(Quantity::milli(params.scan_rate));

    let mut program = declare(&["c", "p", "a"]);
    match params.bipot {
        Some(e2) => {
            limits.potential(e2, "E2")?;
            program.extend(bipot_setup(e2, params.e_ini));
            program.push(loop_line.arg(poly_we()));
            program.extend(package(&["a", "p", "c", "b"]));
        }
        None => {
            program.extend(single_setup(params.mode, params.e_ini));
            program.push(Instruction::new("timer_start"));
            program.push(loop_line);
            program.extend(package(&["a", "p", "c"]));
        }
    }
    program.extend(finish());
    Ok(Command::script(program))
}

/// Open circuit potential script.
pub fn ocp(params: &OcpParams, limits: &Limits) -> PicoResult<Command> {
    limits.interval(params.interval)?;
    limits.total_time(params.total_time)?;

    let mut program = declare(&["p", "a"]);
    program.push(Instruction::new("set_pgstat_mode").arg(Param::Int(PgstatMode::MaxRange.code())));
    program.push(Instruction::new("cell_off"));
    program.push(Instruction::new("timer_start"));
    program.push(
        Instruction::new("meas_loop_ocp")
            .arg("p")
            .arg(Quantity::milli(params.interval))
            .arg(Quantity::milli(params.total_time)),
    );
    program.extend(package(&["a", "p"]));
    program.extend(finish());
    Ok(Command::script(program))
}

/// Impedance spectroscopy script over log-spaced frequencies.
pub fn eis(params: &EisParams, limits: &Limits) -> PicoResult<Command> {
    limits.potential(params.e_dc, "Edc")?;
    limits.frequency(params.low_freq, "fstart")?;
    limits.frequency(params.high_freq, "fend")?;
    if params.low_freq > params.high_freq {
        return Err(PicoError::Validation(format!(
            "fstart ({} Hz) must not exceed fend ({} Hz)",
            params.low_freq, params.high_freq
        )));
    }
    if params.amplitude <= 0.0 {
        return Err(PicoError::Validation(format!(
            "amplitude must be positive. Received {} V",
            params.amplitude
        )));
    }
    if params.points == 0 {
        return Err(PicoError::Validation(
            "points must be at least 1".to_string(),
        ));
    }
    let (idle, active, ba_low) = match params.channel {
        0 => (1, 0, fixed(2950, SiPrefix::Micro)),
        1 => (0, 1, fixed(2950, SiPrefix::Nano)),
        other => {
            return Err(PicoError::Validation(format!(
                "EIS channel must be 0 or 1. Received {}",
                other
            )))
        }
    };

    let mut program = declare(&["h", "r", "j"]);
    program.extend([
        Instruction::new("set_pgstat_chan").arg(Param::Int(idle)),
        Instruction::new("set_pgstat_mode").arg(Param::Int(0)),
        Instruction::new("set_pgstat_chan").arg(Param::Int(active)),
        Instruction::new("set_pgstat_mode").arg(Param::Int(PgstatMode::HighSpeed.code())),
        Instruction::new("set_max_bandwidth").arg(fixed(200, SiPrefix::Kilo)),
        Instruction::new("set_range_minmax")
            .arg("da")
            .arg(Param::Int(0))
            .arg(Param::Int(0)),
        Instruction::new("set_range")
            .arg("ba")
            .arg(fixed(2950, SiPrefix::Micro)),
        Instruction::new("set_autoranging")
            .arg("ba")
            .arg(ba_low)
            .arg(fixed(2950, SiPrefix::Micro)),
        Instruction::new("set_range")
            .arg("ab")
            .arg(fixed(4200, SiPrefix::Milli)),
        Instruction::new("set_autoranging")
            .arg("ab")
            .arg(fixed(4200, SiPrefix::Milli))
            .arg(fixed(4200, SiPrefix::Milli)),
        Instruction::new("set_e").arg(Quantity::milli(params.e_dc)),
        Instruction::new("cell_on"),
        Instruction::new("meas_loop_eis")
            .arg("h")
            .arg("r")
            .arg("j")
            .arg(Quantity::milli(params.amplitude))
            .arg(frequency(params.high_freq))
            .arg(frequency(params.low_freq))
            .arg(Param::Int(i64::from(params.points)))
            .arg(Param::Int(0)),
    ]);
    program.push(Instruction::new("pck_start"));
    for var in ["h", "r", "j"] {
        program.push(Instruction::new("pck_add").arg(var));
    }
    program.push(Instruction::new("pck_end"));
    program.extend(finish());
    Ok(Command::script(program))
}

/// Load a user-authored MethodSCRIPT file.
pub fn custom_from_file<P: AsRef<Path>>(path: P) -> PicoResult<Command> {
    let path = path.as_ref();
    let source = std::fs::read_to_string(path).map_err(|e| {
        PicoError::Io(std::io::Error::new(
            e.kind(),
            format!("Cannot read script {}: {}", path.display(), e),
        ))
    })?;
    let command = Command::parse_script(&source)?;
    if command.is_empty() {
        return Err(PicoError::Parse(format!(
            "Script {} contains no instructions",
            path.display()
        )));
    }
    Ok(command)
}

// ============================================================================
// Script fragments
// ============================================================================

fn fixed(mantissa: i64, prefix: SiPrefix) -> Param {
    Param::Number(Quantity { mantissa, prefix })
}

/// Largest prefix that represents `hz` exactly, e.g. `200k`, `100`, `10m`.
fn frequency(hz: f64) -> Param {
    if hz >= 1e3 && (hz / 1e3).fract() == 0.0 {
        return fixed((hz / 1e3) as i64, SiPrefix::Kilo);
    }
    if hz.fract() == 0.0 {
        return Param::Int(hz as i64);
    }
    for prefix in [SiPrefix::Milli, SiPrefix::Micro] {
        let q = Quantity::new(hz, prefix);
        if (q.value() - hz).abs() <= hz.abs() * 1e-9 {
            return q.into();
        }
    }
    Quantity::new(hz, SiPrefix::Nano).into()
}

fn declare(vars: &[&str]) -> Vec<Instruction> {
    std::iter::once(Instruction::new("e"))
        .chain(vars.iter().map(|v| Instruction::new("var").arg(*v)))
        .collect()
}

fn autorange_ba() -> Instruction {
    Instruction::new("set_autoranging")
        .arg("ba")
        .arg(fixed(100, SiPrefix::Nano))
        .arg(fixed(5, SiPrefix::Milli))
}

fn single_setup(mode: PgstatMode, e_start: f64) -> Vec<Instruction> {
    vec![
        Instruction::new("set_pgstat_mode").arg(Param::Int(mode.code())),
        autorange_ba(),
        Instruction::new("set_e").arg(Quantity::milli(e_start)),
        Instruction::new("cell_on"),
    ]
}

/// Channel 1 holds the second WE at `e2`, channel 0 runs the technique.
fn bipot_setup(e2: f64, e_start: f64) -> Vec<Instruction> {
    vec![
        Instruction::new("var").arg("b"),
        Instruction::new("set_pgstat_chan").arg(Param::Int(1)),
        Instruction::new("set_pgstat_mode").arg(Param::Int(5)),
        Instruction::new("set_poly_we_mode").arg(Param::Int(0)),
        Instruction::new("set_e").arg(Quantity::milli(e2)),
        autorange_ba(),
        Instruction::new("set_pgstat_chan").arg(Param::Int(0)),
        Instruction::new("set_pgstat_mode").arg(Param::Int(PgstatMode::LowSpeed.code())),
        autorange_ba(),
        Instruction::new("set_e").arg(Quantity::milli(e_start)),
        Instruction::new("timer_start"),
        Instruction::new("cell_on"),
    ]
}

fn poly_we() -> Param {
    Param::call("poly_we", vec![Param::Int(1), Param::ident("b")])
}

fn package(vars: &[&str]) -> Vec<Instruction> {
    let mut lines = vec![
        Instruction::new("pck_start"),
        Instruction::new("timer_get").arg("a"),
    ];
    lines.extend(vars.iter().map(|v| Instruction::new("pck_add").arg(*v)));
    lines.push(Instruction::new("pck_end"));
    lines
}

fn finish() -> Vec<Instruction> {
    vec![
        Instruction::new("endloop"),
        Instruction::new("on_finished:"),
        Instruction::new("cell_off"),
    ]
}
