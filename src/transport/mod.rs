//! Byte transport to the instrument.
//!
//! [`Transport`] is the seam the session drives: open a connection, write
//! frames, read newline-terminated lines, close. [`LineTransport`] implements
//! it over any async byte stream produced by a [`Connector`], with the serial
//! port as the production connector and in-memory streams in tests.
//!
//! A [`Connection`] only exists after the handshake probe was answered, and
//! at most one is open per transport.

/// Scripted transport for tests
pub mod mock;
/// Serial port connector
pub mod serial;

pub use mock::{ScriptedEvent, ScriptedTransport};
pub use serial::{SerialConnector, SerialTransport};

use crate::config::SerialConfig;
use crate::error::{PicoError, PicoResult};
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

/// Line-oriented byte channel to one instrument.
#[async_trait]
pub trait Transport: Send {
    /// Open the endpoint and complete the handshake probe.
    async fn open(&mut self, config: &SerialConfig) -> PicoResult<()>;

    /// Whether a connection is open.
    fn is_open(&self) -> bool;

    /// Write one complete frame.
    ///
    /// A frame that cannot be written within the configured deadline is an
    /// `Io` error (`TimedOut`) and the connection is dropped.
    async fn write(&mut self, frame: &[u8]) -> PicoResult<()>;

    /// Read the next line without its terminator.
    ///
    /// A single read exceeding the configured deadline returns
    /// `PicoError::Timeout`; the connection stays usable.
    async fn read_line(&mut self) -> PicoResult<String>;

    /// Drop input received before the next command is sent.
    ///
    /// Lines still buffered from a command that ended early (for example
    /// after a device error) belong to that command, not to the next one.
    async fn discard_input(&mut self) -> PicoResult<()> {
        Ok(())
    }

    /// Release the connection. Closing a closed transport is a no-op.
    async fn close(&mut self) -> PicoResult<()>;

    /// Version text captured by the handshake probe.
    fn firmware_version(&self) -> Option<&str> {
        None
    }
}

/// Trait alias for the byte streams a transport can run over.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + ?Sized> SerialPortIO for T {}

/// Boxed byte stream.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Opens the raw byte stream for a configured endpoint.
pub trait Connector: Send + Sync {
    /// Open the stream for `config`.
    fn connect(&self, config: &SerialConfig) -> PicoResult<DynSerial>;
}

impl<F> Connector for F
where
    F: Fn(&SerialConfig) -> PicoResult<DynSerial> + Send + Sync,
{
    fn connect(&self, config: &SerialConfig) -> PicoResult<DynSerial> {
        self(config)
    }
}

/// An open, handshaken link to the instrument.
pub struct Connection {
    config: SerialConfig,
    stream: DynSerial,
    /// Received bytes not yet returned as a line
    pending: Vec<u8>,
    firmware: Option<String>,
}

impl Connection {
    fn new(config: SerialConfig, stream: DynSerial) -> Self {
        Self {
            config,
            stream,
            pending: Vec::with_capacity(256),
            firmware: None,
        }
    }

    /// Settings the connection was opened with.
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    /// Version text from the probe reply.
    pub fn firmware(&self) -> Option<&str> {
        self.firmware.as_deref()
    }

    async fn write_frame(&mut self, frame: &[u8]) -> PicoResult<()> {
        let write_timeout = self.config.write_timeout();
        let attempts = self.config.write_attempts;
        match timeout(write_timeout, write_all_bounded(&mut self.stream, frame, attempts)).await {
            Ok(result) => result.map_err(PicoError::Io),
            // a frame cut off mid-write leaves the stream unusable
            Err(_) => Err(PicoError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("frame not written within {:?}", write_timeout),
            ))),
        }
    }

    /// Read one line within `deadline`.
    ///
    /// Bytes are buffered in `pending` before a line is extracted, so a
    /// timeout never loses a partially received line.
    async fn read_line_until(&mut self, deadline: Instant, budget: Duration) -> PicoResult<String> {
        let mut chunk = [0u8; 256];
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = self.pending.drain(..=pos).collect();
                return Ok(decode_line_bytes(&raw));
            }
            match timeout_at(deadline, self.stream.read(&mut chunk)).await {
                Err(_) => return Err(PicoError::Timeout(budget)),
                Ok(Ok(0)) => {
                    return Err(PicoError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "instrument closed the stream",
                    )))
                }
                Ok(Ok(n)) => self.pending.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(PicoError::Io(e)),
            }
        }
    }

    /// Drop the pending buffer and whatever the stream has ready right now.
    async fn discard_pending(&mut self) -> io::Result<usize> {
        let mut discarded = std::mem::take(&mut self.pending).len();
        let mut chunk = [0u8; 256];
        loop {
            // a zero deadline still polls the read once
            match timeout(Duration::ZERO, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => return Ok(discarded),
                Ok(Ok(n)) => discarded += n,
                Ok(Err(e)) => return Err(e),
            }
        }
    }

    /// Send the probe command and collect the reply up to the terminator line.
    async fn probe(&mut self) -> PicoResult<String> {
        let mut frame = self.config.probe_command.clone().into_bytes();
        frame.push(b'\n');
        self.write_frame(&frame).await?;

        let budget = self.config.read_timeout();
        let deadline = Instant::now() + budget;
        let mut lines = Vec::new();
        loop {
            let line = self.read_line_until(deadline, budget).await?;
            let done = line.contains(self.config.probe_terminator.as_str());
            lines.push(line);
            if done {
                break;
            }
        }
        Ok(firmware_text(
            &self.config.probe_command,
            &self.config.probe_terminator,
            &lines,
        ))
    }
}

/// Write `frame` completely. Writes that accept zero bytes count toward
/// `attempts`; partial writes continue with the remainder.
async fn write_all_bounded<W>(stream: &mut W, frame: &[u8], attempts: u32) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0;
    let mut stalled = 0;
    while written < frame.len() {
        let n = stream.write(&frame[written..]).await?;
        if n == 0 {
            stalled += 1;
            if stalled >= attempts {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("frame not accepted after {} attempts", stalled),
                ));
            }
            continue;
        }
        written += n;
        if written < frame.len() {
            debug!("short write: {}/{} bytes", written, frame.len());
        }
    }
    stream.flush().await
}

fn decode_line_bytes(raw: &[u8]) -> String {
    let trimmed = raw
        .strip_suffix(b"\n")
        .map(|r| r.strip_suffix(b"\r").unwrap_or(r))
        .unwrap_or(raw);
    String::from_utf8_lossy(trimmed).into_owned()
}

/// Join the probe reply into one version string, without the echoed probe
/// character and the terminator.
fn firmware_text(probe: &str, terminator: &str, lines: &[String]) -> String {
    let joined = lines
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let text = joined.strip_prefix(probe).unwrap_or(&joined);
    text.trim_end_matches(terminator).trim().to_string()
}

/// [`Transport`] over the byte stream produced by a [`Connector`].
pub struct LineTransport<C> {
    connector: C,
    connection: Option<Connection>,
}

impl<C: Connector> LineTransport<C> {
    /// Transport opening streams through `connector`.
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            connection: None,
        }
    }

    /// Open connection, if any.
    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    fn connection_mut(&mut self) -> PicoResult<&mut Connection> {
        self.connection.as_mut().ok_or(PicoError::NotConnected)
    }

    /// A fatal I/O error destroys the connection; timeouts keep it.
    fn drop_on_fatal<T>(&mut self, result: PicoResult<T>) -> PicoResult<T> {
        if let Err(err) = &result {
            if matches!(err, PicoError::Io(_)) {
                warn!("dropping connection after I/O error: {}", err);
                self.connection = None;
            }
        }
        result
    }
}

#[async_trait]
impl<C: Connector> Transport for LineTransport<C> {
    async fn open(&mut self, config: &SerialConfig) -> PicoResult<()> {
        if self.connection.is_some() {
            return Err(PicoError::Connection(format!(
                "{} is already open",
                config.port
            )));
        }

        let stream = self.connector.connect(config)?;
        let mut connection = Connection::new(config.clone(), stream);
        // the connection is dropped, and the port released, unless the probe succeeds
        let firmware = connection.probe().await.map_err(|e| match e {
            PicoError::Timeout(after) => PicoError::Connection(format!(
                "no reply to '{}' on {} within {:?}",
                config.probe_command, config.port, after
            )),
            other => PicoError::Connection(format!(
                "handshake on {} failed: {}",
                config.port, other
            )),
        })?;

        info!(
            "Connected to {} at {} baud (firmware: {})",
            config.port, config.baud_rate, firmware
        );
        connection.firmware = Some(firmware);
        self.connection = Some(connection);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    async fn write(&mut self, frame: &[u8]) -> PicoResult<()> {
        let result = self.connection_mut()?.write_frame(frame).await;
        if result.is_ok() {
            debug!("sent {:?}", String::from_utf8_lossy(frame));
        }
        self.drop_on_fatal(result)
    }

    async fn read_line(&mut self) -> PicoResult<String> {
        let connection = self.connection_mut()?;
        let budget = connection.config.read_timeout();
        let result = connection
            .read_line_until(Instant::now() + budget, budget)
            .await;
        if let Ok(line) = &result {
            debug!("received {:?}", line);
        }
        self.drop_on_fatal(result)
    }

    async fn discard_input(&mut self) -> PicoResult<()> {
        let result = self
            .connection_mut()?
            .discard_pending()
            .await
            .map_err(PicoError::Io);
        if let Ok(n) = &result {
            if *n > 0 {
                debug!("discarded {} stale byte(s)", n);
            }
        }
        self.drop_on_fatal(result.map(|_| ()))
    }

    async fn close(&mut self) -> PicoResult<()> {
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.stream.shutdown().await {
                debug!("shutdown of {} failed: {}", connection.config.port, e);
            }
            info!("Disconnected from {}", connection.config.port);
        }
        Ok(())
    }

    fn firmware_version(&self) -> Option<&str> {
        self.connection.as_ref().and_then(Connection::firmware)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio_test::io::Builder;

    fn config() -> SerialConfig {
        SerialConfig::new("mock0")
    }

    /// Connector handing out pre-built streams, one per open.
    fn streams(list: Vec<DynSerial>) -> impl Connector {
        let list = Arc::new(Mutex::new(list));
        move |_: &SerialConfig| -> PicoResult<DynSerial> {
            list.lock()
                .unwrap()
                .pop()
                .ok_or_else(|| PicoError::Connection("no stream left".into()))
        }
    }

    fn handshake() -> Builder {
        let mut builder = Builder::new();
        builder.write(b"t\n").read(b"tespico1201#Jun 10 2021\r\nR*\r\n");
        builder
    }

    #[tokio::test]
    async fn test_open_reads_firmware() {
        let mut transport = LineTransport::new(streams(vec![Box::new(handshake().build())]));
        transport.open(&config()).await.unwrap();
        assert!(transport.is_open());
        assert_eq!(transport.firmware_version(), Some("espico1201#Jun 10 2021 R"));
    }

    #[tokio::test]
    async fn test_open_twice_rejected() {
        let mut transport = LineTransport::new(streams(vec![Box::new(handshake().build())]));
        transport.open(&config()).await.unwrap();
        let err = transport.open(&config()).await.unwrap_err();
        assert!(err.to_string().contains("already open"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_without_reply_fails() {
        let (client, _device) = tokio::io::duplex(64);
        let mut transport = LineTransport::new(streams(vec![Box::new(client)]));
        let err = transport.open(&config()).await.unwrap_err();
        assert!(matches!(err, PicoError::Connection(ref msg) if msg.contains("no reply")));
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_open_on_closed_stream_fails() {
        let stream = Builder::new().write(b"t\n").build();
        let mut transport = LineTransport::new(streams(vec![Box::new(stream)]));
        let err = transport.open(&config()).await.unwrap_err();
        assert!(matches!(err, PicoError::Connection(_)));
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_read_line_strips_terminators() {
        let stream = handshake()
            .read(b"Pda80000")
            .read(b"01 \r\n*\n")
            .read(b"\xffbad\n")
            .build();
        let mut transport = LineTransport::new(streams(vec![Box::new(stream)]));
        transport.open(&config()).await.unwrap();

        assert_eq!(transport.read_line().await.unwrap(), "Pda8000001 ");
        assert_eq!(transport.read_line().await.unwrap(), "*");
        assert_eq!(transport.read_line().await.unwrap(), "\u{fffd}bad");
    }

    #[tokio::test]
    async fn test_eof_is_io_error_and_drops_connection() {
        let mut transport = LineTransport::new(streams(vec![Box::new(handshake().build())]));
        transport.open(&config()).await.unwrap();

        let err = transport.read_line().await.unwrap_err();
        assert!(matches!(err, PicoError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
        assert!(!transport.is_open());
        assert!(matches!(transport.read_line().await, Err(PicoError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_keeps_partial_line() {
        let (client, mut device) = tokio::io::duplex(256);
        let mut transport = LineTransport::new(streams(vec![Box::new(client)]));

        let device_side = async {
            let mut probe = [0u8; 2];
            device.read_exact(&mut probe).await.unwrap();
            device.write_all(b"tespico\n*\n").await.unwrap();
            device
        };
        let config = config();
        let (opened, mut device) = tokio::join!(transport.open(&config), device_side);
        opened.unwrap();

        device.write_all(b"CH1=1.2").await.unwrap();
        let err = transport.read_line().await.unwrap_err();
        assert!(matches!(err, PicoError::Timeout(d) if d == Duration::from_secs(1)));
        assert!(transport.is_open());

        device.write_all(b"34mV\n").await.unwrap();
        assert_eq!(transport.read_line().await.unwrap(), "CH1=1.234mV");
    }

    /// Open a transport over a duplex pipe of `capacity` bytes whose device
    /// side answers the probe and is then handed back to the test.
    async fn open_duplex(capacity: usize) -> (LineTransport<impl Connector>, tokio::io::DuplexStream) {
        let (client, mut device) = tokio::io::duplex(capacity);
        let mut transport = LineTransport::new(streams(vec![Box::new(client)]));
        let device_side = async {
            let mut probe = [0u8; 2];
            device.read_exact(&mut probe).await.unwrap();
            device.write_all(b"t\n*\n").await.unwrap();
            device
        };
        let config = config();
        let (opened, device) = tokio::join!(transport.open(&config), device_side);
        opened.unwrap();
        (transport, device)
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_deadline_is_fatal_io_error() {
        // the device never drains its side, so the frame cannot be flushed
        let (mut transport, _device) = open_duplex(16).await;

        let err = transport.write(&[b'x'; 200]).await.unwrap_err();
        assert!(matches!(err, PicoError::Io(ref e) if e.kind() == io::ErrorKind::TimedOut));
        assert!(!err.is_recoverable());
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn test_discard_input_drops_stale_lines() {
        let (mut transport, mut device) = open_duplex(256).await;

        device.write_all(b"!0004\n*\nCH1=").await.unwrap();
        assert_eq!(transport.read_line().await.unwrap(), "!0004");

        transport.discard_input().await.unwrap();
        assert!(transport.is_open());

        device.write_all(b"P\n").await.unwrap();
        assert_eq!(transport.read_line().await.unwrap(), "P");
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_terminator_from_config() {
        let (client, mut device) = tokio::io::duplex(256);
        let mut transport = LineTransport::new(streams(vec![Box::new(client)]));
        let config = SerialConfig {
            probe_terminator: "READY".into(),
            ..config()
        };
        let device_side = async {
            let mut probe = [0u8; 2];
            device.read_exact(&mut probe).await.unwrap();
            device.write_all(b"tespico1201*\nREADY\n").await.unwrap();
            device
        };
        let (opened, _device) = tokio::join!(transport.open(&config), device_side);
        opened.unwrap();
        assert_eq!(transport.firmware_version(), Some("espico1201*"));
    }

    #[tokio::test]
    async fn test_write_frames() {
        let stream = handshake().write(b"e\n").write(b"\n").build();
        let mut transport = LineTransport::new(streams(vec![Box::new(stream)]));
        transport.open(&config()).await.unwrap();
        transport.write(b"e\n").await.unwrap();
        transport.write(b"\n").await.unwrap();
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let mut transport = LineTransport::new(streams(vec![]));
        assert!(matches!(transport.write(b"t\n").await, Err(PicoError::NotConnected)));
        // closing a closed transport is fine
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_then_reopen() {
        let mut transport = LineTransport::new(streams(vec![
            Box::new(handshake().build()),
            Box::new(handshake().build()),
        ]));
        transport.open(&config()).await.unwrap();
        transport.close().await.unwrap();
        assert!(!transport.is_open());
        assert_eq!(transport.firmware_version(), None);
        transport.open(&config()).await.unwrap();
        assert!(transport.is_open());
    }

    /// Accepts nothing: every write returns zero bytes.
    struct Stuck;

    impl AsyncWrite for Stuck {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
            _: &[u8],
        ) -> std::task::Poll<io::Result<usize>> {
            std::task::Poll::Ready(Ok(0))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_zero_writes_bounded_by_attempts() {
        let err = write_all_bounded(&mut Stuck, b"e\n", 3).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_firmware_text() {
        let lines = vec!["tespico1201".to_string(), "*".to_string()];
        assert_eq!(firmware_text("t", "*", &lines), "espico1201");
    }
}
