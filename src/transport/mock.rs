//! Scripted transport for driving sessions without hardware.
//!
//! The transport plays back a queue of [`ScriptedEvent`]s, one per
//! `read_line` call, and records every frame written. Queued events are
//! replies still to come, so `discard_input` only counts the call.
//!
//! Clones share state, so a test can keep a handle after moving the
//! transport into an instrument.

use super::Transport;
use crate::config::SerialConfig;
use crate::error::{PicoError, PicoResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

/// One scripted reaction to `read_line`.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedEvent {
    /// Deliver a line
    Line(String),
    /// Report a read timeout
    Timeout,
    /// Fail with an I/O error of this kind
    IoError(io::ErrorKind),
    /// End of stream
    Eof,
    /// Never answer (until cancelled)
    Hang,
}

impl ScriptedEvent {
    /// Line event.
    pub fn line(text: impl Into<String>) -> Self {
        ScriptedEvent::Line(text.into())
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    events: VecDeque<ScriptedEvent>,
    written: Vec<Vec<u8>>,
    open: bool,
    opens: usize,
    closes: usize,
    discards: usize,
    refuse_open: Option<String>,
    read_timeout: std::time::Duration,
}

/// In-memory [`Transport`] replaying scripted events.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<ScriptState>>,
    firmware: Option<String>,
}

impl ScriptedTransport {
    /// Transport replaying `events`.
    pub fn new<I>(events: I) -> Self
    where
        I: IntoIterator<Item = ScriptedEvent>,
    {
        let transport = Self::default();
        transport.push_events(events);
        transport
    }

    /// Lines only, as the instrument would send them.
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(lines.into_iter().map(|l| ScriptedEvent::Line(l.into())))
    }

    /// Queue more events behind the existing ones.
    pub fn push_events<I>(&self, events: I)
    where
        I: IntoIterator<Item = ScriptedEvent>,
    {
        self.lock().events.extend(events);
    }

    /// Make every subsequent `open` fail with `Connection(reason)`.
    pub fn refuse_open(&self, reason: impl Into<String>) {
        self.lock().refuse_open = Some(reason.into());
    }

    /// Frames written so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    /// Frames written so far, as text.
    pub fn written_text(&self) -> String {
        self.lock()
            .written
            .iter()
            .map(|f| String::from_utf8_lossy(f).into_owned())
            .collect()
    }

    /// Number of successful opens.
    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    /// Number of closes of an open transport.
    pub fn close_count(&self) -> usize {
        self.lock().closes
    }

    /// Number of `discard_input` calls.
    pub fn discard_count(&self) -> usize {
        self.lock().discards
    }

    /// Events not consumed yet.
    pub fn remaining(&self) -> usize {
        self.lock().events.len()
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        // a panicking test must not hide the state from the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&mut self, config: &SerialConfig) -> PicoResult<()> {
        let mut state = self.lock();
        if state.open {
            return Err(PicoError::Connection(format!(
                "{} is already open",
                config.port
            )));
        }
        if let Some(reason) = &state.refuse_open {
            return Err(PicoError::Connection(reason.clone()));
        }
        state.open = true;
        state.opens += 1;
        state.read_timeout = config.read_timeout();
        drop(state);
        self.firmware = Some(format!("scripted {}", config.port));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }

    async fn write(&mut self, frame: &[u8]) -> PicoResult<()> {
        let mut state = self.lock();
        if !state.open {
            return Err(PicoError::NotConnected);
        }
        state.written.push(frame.to_vec());
        Ok(())
    }

    async fn read_line(&mut self) -> PicoResult<String> {
        let (event, read_timeout) = {
            let mut state = self.lock();
            if !state.open {
                return Err(PicoError::NotConnected);
            }
            let event = state.events.pop_front().unwrap_or(ScriptedEvent::Eof);
            if matches!(event, ScriptedEvent::IoError(_) | ScriptedEvent::Eof) {
                state.open = false;
            }
            (event, state.read_timeout)
        };
        match event {
            ScriptedEvent::Line(line) => Ok(line),
            ScriptedEvent::Timeout => Err(PicoError::Timeout(read_timeout)),
            ScriptedEvent::IoError(kind) => {
                Err(PicoError::Io(io::Error::new(kind, "scripted I/O error")))
            }
            ScriptedEvent::Eof => Err(PicoError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "scripted end of stream",
            ))),
            ScriptedEvent::Hang => std::future::pending().await,
        }
    }

    async fn discard_input(&mut self) -> PicoResult<()> {
        let mut state = self.lock();
        if !state.open {
            return Err(PicoError::NotConnected);
        }
        state.discards += 1;
        Ok(())
    }

    async fn close(&mut self) -> PicoResult<()> {
        self.firmware = None;
        let mut state = self.lock();
        if state.open {
            state.open = false;
            state.closes += 1;
        }
        Ok(())
    }

    fn firmware_version(&self) -> Option<&str> {
        self.firmware.as_deref()
    }
}
