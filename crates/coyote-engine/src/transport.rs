//! Device transport.
//!
//! The rest of the engine sees a transport as a [`TransportHandle`] for
//! outbound frames and a stream of [`TransportEvent`]s. [`spawn_line_transport`]
//! runs that contract over any byte stream using newline-delimited frames;
//! [`memory_pair`] connects one end to an in-process peer.
//!
//! A stream may open with a hello line naming the client, see [`read_hello`].

use std::time::Duration;

use thiserror::Error;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream,
    Lines, ReadHalf, WriteHalf,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Errors raised by transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The link is closed
    #[error("Transport closed")]
    Closed,

    /// Underlying stream failed
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Command accepted by a transport worker.
#[derive(Debug)]
pub enum TransportCommand {
    /// Write one frame
    Send {
        /// Frame text, without the trailing newline
        frame: String,
        /// Acknowledgement once written
        ack: oneshot::Sender<TransportResult<()>>,
    },
    /// Shut the link down
    Close,
}

/// Event produced by a transport worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// One inbound frame
    Message(String),
    /// The link is gone; always the last event
    Closed,
}

/// Transport worker settings.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Close the link when nothing was received for this long
    pub idle_timeout: Option<Duration>,
    /// Capacity of the command and event channels
    pub channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_secs(30)),
            channel_capacity: 64,
        }
    }
}

/// Cloneable sender side of a link.
#[derive(Clone, Debug)]
pub struct TransportHandle {
    tx: mpsc::Sender<TransportCommand>,
}

impl TransportHandle {
    /// Wrap a raw command sender.
    #[must_use]
    pub fn new(tx: mpsc::Sender<TransportCommand>) -> Self {
        Self { tx }
    }

    /// Send one frame and wait until it is written.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the link is gone, or the write
    /// error reported by the worker.
    pub async fn send(&self, frame: impl Into<String>) -> TransportResult<()> {
        let (ack, ack_rx) = oneshot::channel();
        self.tx
            .send(TransportCommand::Send {
                frame: frame.into(),
                ack,
            })
            .await
            .map_err(|_| TransportError::Closed)?;
        ack_rx.await.map_err(|_| TransportError::Closed)?
    }

    /// Ask the worker to close the link. Idempotent.
    pub async fn close(&self) {
        let _ = self.tx.send(TransportCommand::Close).await;
    }

    /// Whether the worker is still accepting commands.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Both sides of a running link as seen by the engine.
#[derive(Debug)]
pub struct Link {
    /// Outbound side
    pub handle: TransportHandle,
    /// Inbound events, ending with [`TransportEvent::Closed`]
    pub events: mpsc::Receiver<TransportEvent>,
}

// ============================================================================
// Hello Line
// ============================================================================

/// Longest client id accepted from a hello line.
pub const MAX_HELLO_LEN: usize = 128;

/// Read the optional hello line a device sends right after connecting.
///
/// The line holds the device's client id, optionally prefixed with `/`.
/// Returns `None` for a blank line, an unusable id, or when nothing arrives
/// within `timeout`.
///
/// # Errors
///
/// Returns [`TransportError::Closed`] if the stream ends first, or the read
/// error.
pub async fn read_hello<R>(reader: &mut R, timeout: Duration) -> TransportResult<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = match tokio::time::timeout(timeout, reader.read_line(&mut line)).await {
        Ok(read) => read?,
        Err(_) => return Ok(None),
    };
    if read == 0 {
        return Err(TransportError::Closed);
    }

    let id = line.trim().trim_start_matches('/');
    let usable = !id.is_empty()
        && id.len() <= MAX_HELLO_LEN
        && !id.starts_with('{')
        && !id.chars().any(char::is_whitespace);
    if !usable {
        if !id.is_empty() {
            tracing::warn!("Ignoring unusable hello line: {:?}", line.trim());
        }
        return Ok(None);
    }
    Ok(Some(id.to_string()))
}

// ============================================================================
// Line-delimited Stream Transport
// ============================================================================

/// Run a newline-delimited transport over `stream`.
pub fn spawn_line_transport<S>(stream: S, config: TransportConfig) -> Link
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_capacity);
    let (event_tx, event_rx) = mpsc::channel(config.channel_capacity);

    tokio::spawn(line_worker(stream, config.idle_timeout, cmd_rx, event_tx));

    Link {
        handle: TransportHandle::new(cmd_tx),
        events: event_rx,
    }
}

async fn line_worker<S>(
    stream: S,
    idle_timeout: Option<Duration>,
    mut cmd_rx: mpsc::Receiver<TransportCommand>,
    event_tx: mpsc::Sender<TransportEvent>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();
    let mut deadline = idle_timeout.map(|timeout| Instant::now() + timeout);

    loop {
        let idle = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(TransportCommand::Send { frame, ack }) => {
                    let result = write_line(&mut writer, &frame).await;
                    let failed = result.is_err();
                    let _ = ack.send(result);
                    if failed {
                        break;
                    }
                }
                Some(TransportCommand::Close) | None => break,
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    deadline = idle_timeout.map(|timeout| Instant::now() + timeout);
                    if line.trim().is_empty() {
                        continue;
                    }
                    tracing::trace!("Transport received: {}", line);
                    if event_tx.send(TransportEvent::Message(line)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Transport read failed: {}", e);
                    break;
                }
            },
            () = idle => {
                let idle_for = idle_timeout.unwrap_or_default();
                tracing::warn!("Transport idle for {:?}, closing", idle_for);
                break;
            }
        }
    }

    cmd_rx.close();
    let _ = writer.shutdown().await;
    let _ = event_tx.send(TransportEvent::Closed).await;
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, frame: &str) -> TransportResult<()> {
    writer.write_all(frame.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

// ============================================================================
// In-memory Pair
// ============================================================================

/// Far end of an in-memory link, playing the device.
pub struct RemotePeer {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl RemotePeer {
    /// Play the device on `stream`.
    #[must_use]
    pub fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    /// Write one frame to the engine side.
    ///
    /// # Errors
    ///
    /// Fails once the engine side is gone.
    pub async fn send(&mut self, frame: &str) -> TransportResult<()> {
        write_line(&mut self.writer, frame).await
    }

    /// Next frame from the engine side, `None` once it closed.
    ///
    /// # Errors
    ///
    /// Returns the underlying read error.
    pub async fn recv(&mut self) -> TransportResult<Option<String>> {
        Ok(self.lines.next_line().await?)
    }

    /// Close the device side of the link.
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// Create a line transport whose far end is an in-process [`RemotePeer`].
pub fn memory_pair(config: TransportConfig) -> (Link, RemotePeer) {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let link = spawn_line_transport(local, config);
    (link, RemotePeer::new(remote))
}

// ============================================================================
// Tests
// ============================================================================
