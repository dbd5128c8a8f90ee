//! Measurement session state machine.
//!
//! ```text
//! Idle --submit--> Connecting --opened--> AwaitingAck --sent--> Streaming
//!   \--submit (already connected)---------^                       |
//!                                                                 |-- MeasurementEnd --> Completed
//!                                                                 |-- device error ----> Faulted(Instrument)
//!                                                                 |-- framing error ---> Faulted(Protocol)
//!                                                                 |-- N timeouts ------> Faulted(TimeoutExceeded)
//!                                                                 |-- I/O error -------> Faulted(Io)
//!                                                                 '-- cancel ----------> Faulted(Cancelled)
//! ```
//!
//! [`SessionMachine`] holds the transitions and is a pure function of the
//! token sequence. [`Session`] drives it with transport I/O and applies the
//! connection policy on faults: only an instrument-reported error leaves the
//! connection open.

use crate::config::{SerialConfig, Settings};
use crate::error::{PicoError, PicoResult};
use crate::measurement::{Assembler, Curve};
use crate::mscript::{encode, Command, Decoder, ResponseToken};
use crate::transport::Transport;
use std::io;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

/// Why a session faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Port could not be opened
    Connection,
    /// Transport fault
    Io,
    /// Timeout budget exhausted
    TimeoutExceeded,
    /// Framing violation or early end of stream
    Protocol,
    /// Device-reported error code
    Instrument(u16),
    /// Cancelled by the caller
    Cancelled,
}

impl FaultKind {
    /// Whether the connection is released after this fault.
    pub fn closes_connection(self) -> bool {
        !matches!(self, FaultKind::Instrument(_))
    }
}

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for a command
    Idle,
    /// Opening the connection
    Connecting,
    /// Sending the command
    AwaitingAck,
    /// Reading responses
    Streaming,
    /// Measurement finished
    Completed,
    /// Ended with a fault
    Faulted(FaultKind),
}

impl SessionState {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Faulted(_))
    }
}

// ============================================================================
// Deterministic core
// ============================================================================

/// Session transitions without I/O.
#[derive(Debug)]
pub struct SessionMachine {
    state: SessionState,
    assembler: Assembler,
    consecutive_timeouts: u32,
    timeout_budget: u32,
}

impl SessionMachine {
    /// `timeout_budget` is the number of consecutive read timeouts that
    /// fault the session; values below one are treated as one.
    pub fn new(timeout_budget: u32) -> Self {
        Self {
            state: SessionState::Idle,
            assembler: Assembler::new(),
            consecutive_timeouts: 0,
            timeout_budget: timeout_budget.max(1),
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Read timeouts since the last line.
    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    /// Accept a command. Only an idle session takes one.
    pub fn submit(&mut self, connected: bool) -> PicoResult<()> {
        if self.state != SessionState::Idle {
            return Err(PicoError::Busy);
        }
        self.state = if connected {
            SessionState::AwaitingAck
        } else {
            SessionState::Connecting
        };
        Ok(())
    }

    /// The connection was opened.
    pub fn connected(&mut self) {
        if self.state == SessionState::Connecting {
            self.state = SessionState::AwaitingAck;
        }
    }

    /// Every frame of the command was written.
    pub fn sent(&mut self) {
        if self.state == SessionState::AwaitingAck {
            self.state = SessionState::Streaming;
        }
    }

    /// Enter `Faulted(kind)` unless already terminal.
    pub fn fail(&mut self, kind: FaultKind) {
        if !self.state.is_terminal() {
            error!("session faulted: {:?}", kind);
            self.state = SessionState::Faulted(kind);
        }
    }

    /// Consume one decoded line.
    ///
    /// Returns the finalized curves when the measurement completes. Any line
    /// resets the consecutive timeout count.
    pub fn on_token(&mut self, token: ResponseToken) -> PicoResult<Option<Vec<Curve>>> {
        self.expect_streaming()?;
        self.consecutive_timeouts = 0;

        match token {
            ResponseToken::Error { code, detail } => {
                self.fail(FaultKind::Instrument(code));
                Err(PicoError::Instrument { code, detail })
            }
            ResponseToken::Unknown(raw) => {
                if raw.len() <= 1 {
                    debug!("ignoring line {:?}", raw);
                } else {
                    warn!("ignoring unrecognised line {:?}", raw);
                }
                Ok(None)
            }
            token => match self.assembler.on_token(token) {
                Ok(Some(curves)) => {
                    let samples: usize = curves.iter().map(Curve::len).sum();
                    info!(
                        "measurement complete: {} curve(s), {} sample(s)",
                        curves.len(),
                        samples
                    );
                    self.state = SessionState::Completed;
                    Ok(Some(curves))
                }
                Ok(None) => Ok(None),
                Err(violation) => {
                    self.fail(FaultKind::Protocol);
                    Err(violation.into())
                }
            },
        }
    }

    /// A read timed out while streaming.
    pub fn on_timeout(&mut self) -> PicoResult<()> {
        self.expect_streaming()?;
        self.consecutive_timeouts += 1;
        if self.consecutive_timeouts >= self.timeout_budget {
            self.fail(FaultKind::TimeoutExceeded);
            return Err(PicoError::TimeoutExceeded(self.consecutive_timeouts));
        }
        warn!(
            "read timeout {}/{} while streaming",
            self.consecutive_timeouts, self.timeout_budget
        );
        Ok(())
    }

    /// The stream ended before the measurement end marker.
    pub fn on_stream_end(&mut self) -> PicoError {
        let violation = self.assembler.finish();
        self.fail(FaultKind::Protocol);
        violation.into()
    }

    /// Fault as cancelled.
    pub fn cancel(&mut self) -> PicoError {
        self.fail(FaultKind::Cancelled);
        PicoError::Cancelled
    }

    fn expect_streaming(&self) -> PicoResult<()> {
        if self.state != SessionState::Streaming {
            return Err(PicoError::Validation(format!(
                "no response expected in state {:?}",
                self.state
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cloneable cancellation handle shared between a caller and a session.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// Token that is not cancelled.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Request cancellation of the running session.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Clear a previous cancellation.
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            // the sender lives as long as any token, so this only fails on shutdown
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Session
// ============================================================================

/// One command execution over a borrowed transport.
pub struct Session<'a, T: Transport + ?Sized> {
    transport: &'a mut T,
    serial: SerialConfig,
    decoder: Decoder,
    machine: SessionMachine,
    command: Option<Command>,
    cancel: CancelToken,
}

impl<'a, T: Transport + ?Sized> Session<'a, T> {
    /// Session over `transport` with limits from `settings`.
    pub fn new(transport: &'a mut T, settings: &Settings, cancel: CancelToken) -> Self {
        Self {
            transport,
            serial: settings.serial.clone(),
            decoder: Decoder::new(settings.markers.clone()),
            machine: SessionMachine::new(settings.session.timeout_budget),
            command: None,
            cancel,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    /// Queue `command` for execution. A session runs exactly one command.
    pub fn submit(&mut self, command: Command) -> PicoResult<()> {
        if command.is_empty() {
            return Err(PicoError::Validation("command has no instructions".to_string()));
        }
        self.machine.submit(self.transport.is_open())?;
        self.command = Some(command);
        Ok(())
    }

    /// Feed one decoded line.
    pub fn on_token(&mut self, token: ResponseToken) -> PicoResult<Option<Vec<Curve>>> {
        self.machine.on_token(token)
    }

    /// Report one read timeout.
    pub fn on_timeout(&mut self) -> PicoResult<()> {
        self.machine.on_timeout()
    }

    /// Execute the submitted command until it completes or faults.
    #[instrument(skip_all, fields(port = %self.serial.port))]
    pub async fn run(&mut self) -> PicoResult<Vec<Curve>> {
        let result = self.drive().await;
        if let SessionState::Faulted(kind) = self.machine.state() {
            if kind.closes_connection() && self.transport.is_open() {
                if let Err(e) = self.transport.close().await {
                    warn!("closing after {:?} failed: {}", kind, e);
                }
            }
        }
        result
    }

    async fn drive(&mut self) -> PicoResult<Vec<Curve>> {
        let command = self
            .command
            .take()
            .ok_or_else(|| PicoError::Validation("no command submitted".to_string()))?;

        if self.machine.state() == SessionState::Connecting {
            if self.cancel.is_cancelled() {
                return Err(self.machine.cancel());
            }
            if let Err(e) = self.transport.open(&self.serial).await {
                self.machine.fail(FaultKind::Connection);
                return Err(e);
            }
            self.machine.connected();
        }

        if let Err(e) = self.transport.discard_input().await {
            self.machine.fail(FaultKind::Io);
            return Err(e);
        }
        for frame in encode(&command) {
            if self.cancel.is_cancelled() {
                return Err(self.machine.cancel());
            }
            if let Err(e) = self.transport.write(&frame).await {
                self.machine.fail(FaultKind::Io);
                return Err(e);
            }
        }
        self.machine.sent();
        debug!("command sent, streaming");

        let cancel = self.cancel.clone();
        loop {
            if cancel.is_cancelled() {
                return Err(self.machine.cancel());
            }
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                line = self.transport.read_line() => Some(line),
            };
            match read {
                None => return Err(self.machine.cancel()),
                Some(Ok(line)) => {
                    let token = self.decoder.decode_line(&line);
                    if let Some(curves) = self.machine.on_token(token)? {
                        return Ok(curves);
                    }
                }
                Some(Err(PicoError::Timeout(_))) => self.machine.on_timeout()?,
                Some(Err(PicoError::Io(e))) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    debug!("stream ended: {}", e);
                    return Err(self.machine.on_stream_end());
                }
                Some(Err(e)) => {
                    self.machine.fail(FaultKind::Io);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use crate::mscript::{ChannelValue, Instruction};
    use crate::transport::{ScriptedEvent, ScriptedTransport};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn streaming(budget: u32) -> SessionMachine {
        let mut machine = SessionMachine::new(budget);
        machine.submit(true).unwrap();
        machine.sent();
        assert_eq!(machine.state(), SessionState::Streaming);
        machine
    }

    fn settings() -> Settings {
        Settings {
            serial: SerialConfig::new("scripted"),
            ..Default::default()
        }
    }

    fn command() -> Command {
        Command::script(vec![
            Instruction::new("e"),
            Instruction::new("var").arg("p"),
            Instruction::new("meas_loop_ocp").arg("p"),
        ])
    }

    #[test]
    fn test_timeout_budget_exact() {
        let mut machine = streaming(3);
        machine.on_timeout().unwrap();
        machine.on_timeout().unwrap();
        assert_eq!(machine.state(), SessionState::Streaming);

        let err = machine.on_timeout().unwrap_err();
        assert!(matches!(err, PicoError::TimeoutExceeded(3)));
        assert_eq!(
            machine.state(),
            SessionState::Faulted(FaultKind::TimeoutExceeded)
        );
    }

    #[test]
    fn test_line_resets_timeout_count() {
        let mut machine = streaming(3);
        machine.on_timeout().unwrap();
        machine.on_timeout().unwrap();
        machine.on_token(ResponseToken::PackageStart).unwrap();
        assert_eq!(machine.consecutive_timeouts(), 0);
        machine.on_timeout().unwrap();
        machine.on_timeout().unwrap();
        assert_eq!(machine.state(), SessionState::Streaming);
    }

    #[test]
    fn test_timeouts_keep_partial_curve() {
        let mut machine = streaming(3);
        machine.on_token(ResponseToken::PackageStart).unwrap();
        machine
            .on_token(ResponseToken::Value(ChannelValue::new("p", 0.1, "V")))
            .unwrap();
        machine.on_timeout().unwrap();
        machine
            .on_token(ResponseToken::Value(ChannelValue::new("c", 2.0, "uA")))
            .unwrap();
        machine.on_token(ResponseToken::PackageEnd).unwrap();
        let curves = machine
            .on_token(ResponseToken::MeasurementEnd)
            .unwrap()
            .unwrap();

        assert_eq!(machine.state(), SessionState::Completed);
        assert_eq!(curves[0].len(), 1);
        assert_eq!(curves[0].samples()[0].len(), 2);
    }

    #[test]
    fn test_instrument_error_faults_without_closing() {
        let mut machine = streaming(3);
        let err = machine
            .on_token(ResponseToken::Error {
                code: 0x4,
                detail: None,
            })
            .unwrap_err();
        assert!(matches!(err, PicoError::Instrument { code: 4, .. }));
        let SessionState::Faulted(kind) = machine.state() else {
            panic!("expected fault");
        };
        assert_eq!(kind, FaultKind::Instrument(4));
        assert!(!kind.closes_connection());
    }

    #[test]
    fn test_framing_violation_is_protocol_fault() {
        let mut machine = streaming(3);
        let err = machine
            .on_token(ResponseToken::Value(ChannelValue::new("p", 1.0, "V")))
            .unwrap_err();
        assert!(matches!(
            err,
            PicoError::Protocol(ProtocolError::OutOfPackageValue)
        ));
        assert_eq!(machine.state(), SessionState::Faulted(FaultKind::Protocol));
        // terminal states stay put
        assert!(machine.on_token(ResponseToken::MeasurementEnd).is_err());
        assert_eq!(machine.state(), SessionState::Faulted(FaultKind::Protocol));
    }

    #[test]
    fn test_second_submit_is_busy() {
        let mut machine = SessionMachine::new(3);
        machine.submit(false).unwrap();
        assert_eq!(machine.state(), SessionState::Connecting);
        assert!(matches!(machine.submit(false), Err(PicoError::Busy)));
    }

    #[test]
    fn test_tokens_rejected_before_streaming() {
        let mut machine = SessionMachine::new(3);
        assert!(machine.on_token(ResponseToken::PackageStart).is_err());
        assert!(machine.on_timeout().is_err());
        assert_eq!(machine.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_run_collects_curves() {
        let handle = ScriptedTransport::from_lines(["e", "P", "p=0.1V", "E", "Pda8000001m", "*"]);
        let mut transport = handle.clone();
        let mut session = Session::new(&mut transport, &settings(), CancelToken::new());
        session.submit(command()).unwrap();

        let curves = session.run().await.unwrap();
        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(curves.len(), 1);
        assert_eq!(curves[0].len(), 2);

        assert_eq!(handle.open_count(), 1);
        assert_eq!(handle.written(), encode(&command()));
        assert!(handle.is_open());
    }

    #[tokio::test]
    async fn test_run_on_open_transport_skips_connecting() {
        let handle = ScriptedTransport::from_lines(["*"]);
        let mut transport = handle.clone();
        transport.open(&settings().serial).await.unwrap();

        let mut session = Session::new(&mut transport, &settings(), CancelToken::new());
        session.submit(command()).unwrap();
        assert_eq!(session.state(), SessionState::AwaitingAck);
        session.run().await.unwrap();
        assert_eq!(handle.open_count(), 1);
    }

    #[tokio::test]
    async fn test_run_timeout_budget_closes_connection() {
        let handle = ScriptedTransport::new([
            ScriptedEvent::line("P"),
            ScriptedEvent::Timeout,
            ScriptedEvent::Timeout,
            ScriptedEvent::Timeout,
            ScriptedEvent::line("E"),
        ]);
        let mut transport = handle.clone();
        let mut session = Session::new(&mut transport, &settings(), CancelToken::new());
        session.submit(command()).unwrap();

        let err = session.run().await.unwrap_err();
        assert!(matches!(err, PicoError::TimeoutExceeded(3)));
        assert_eq!(handle.close_count(), 1);
        assert_eq!(handle.remaining(), 1);
    }

    #[tokio::test]
    async fn test_run_instrument_error_keeps_connection() {
        let handle = ScriptedTransport::from_lines(["e", "!0004"]);
        let mut transport = handle.clone();
        let mut session = Session::new(&mut transport, &settings(), CancelToken::new());
        session.submit(command()).unwrap();

        let err = session.run().await.unwrap_err();
        assert_eq!(err.to_string(), "Instrument reported error 0004");
        assert!(handle.is_open());
        assert_eq!(handle.close_count(), 0);
    }

    #[tokio::test]
    async fn test_run_stream_end_in_package_is_incomplete() {
        let handle = ScriptedTransport::from_lines(["P", "p=0.1V"]);
        let mut transport = handle.clone();
        let mut session = Session::new(&mut transport, &settings(), CancelToken::new());
        session.submit(command()).unwrap();

        let err = session.run().await.unwrap_err();
        assert!(matches!(
            err,
            PicoError::Protocol(ProtocolError::IncompleteMeasurement)
        ));
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn test_run_refused_connection() {
        let handle = ScriptedTransport::default();
        handle.refuse_open("port busy");
        let mut transport = handle.clone();
        let mut session = Session::new(&mut transport, &settings(), CancelToken::new());
        session.submit(command()).unwrap();

        assert!(matches!(session.run().await, Err(PicoError::Connection(_))));
        assert_eq!(session.state(), SessionState::Faulted(FaultKind::Connection));
        assert!(handle.written().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_streaming_releases_connection() {
        let handle = ScriptedTransport::new([ScriptedEvent::line("P"), ScriptedEvent::Hang]);
        let mut transport = handle.clone();
        let cancel = CancelToken::new();
        let mut session = Session::new(&mut transport, &settings(), cancel.clone());
        session.submit(command()).unwrap();

        let (result, _) = tokio::join!(session.run(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        assert!(matches!(result, Err(PicoError::Cancelled)));
        assert_eq!(session.state(), SessionState::Faulted(FaultKind::Cancelled));
        assert!(!handle.is_open());
        assert_eq!(handle.close_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_run_sends_nothing() {
        let handle = ScriptedTransport::from_lines(["*"]);
        let mut transport = handle.clone();
        transport.open(&settings().serial).await.unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let mut session = Session::new(&mut transport, &settings(), cancel);
        session.submit(command()).unwrap();
        assert!(matches!(session.run().await, Err(PicoError::Cancelled)));
        assert!(handle.written().is_empty());
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let mut transport = ScriptedTransport::default();
        let mut session = Session::new(&mut transport, &settings(), CancelToken::new());
        assert!(matches!(
            session.submit(Command::script(vec![])),
            Err(PicoError::Validation(_))
        ));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_unknown_lines_are_logged_and_ignored() {
        let handle = ScriptedTransport::from_lines(["e", "", "XYZ", "*"]);
        let mut transport = handle.clone();
        let mut session = Session::new(&mut transport, &settings(), CancelToken::new());
        session.submit(command()).unwrap();

        let curves = session.run().await.unwrap();
        assert_eq!(curves.len(), 1);
        assert!(logs_contain("ignoring unrecognised line \"XYZ\""));
    }

    #[tokio::test]
    async fn test_cancel_token_is_shared_and_resettable() {
        let token = CancelToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
        other.cancelled().await;
        other.reset();
        assert!(!token.is_cancelled());
    }
}
