//! Standard I/O transport.
//!
//! Speaks `Content-Length` framed JSON over a pair of byte streams: the
//! current process's stdin/stdout, a child process's piped stdio, or any
//! raw `AsyncRead`/`AsyncWrite` pair (tests use `tokio::io::duplex`).
//!
//! Locking discipline: `std::sync::Mutex` for state and the handler slot
//! (short-lived, never across `.await`), `tokio::sync::Mutex` for the
//! framed writer (held across `.await` during writes).

use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::process::Child;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, trace, warn};

use async_trait::async_trait;

use crate::error::{TransportError, TransportResult};
use crate::framing::ContentLengthCodec;
use crate::traits::{FrameHandler, Transport, TransportKind, TransportState};

type BoxedRead = Pin<Box<dyn AsyncRead + Send + Sync + 'static>>;
type BoxedWrite = Pin<Box<dyn AsyncWrite + Send + Sync + 'static>>;
type FrameReader = FramedRead<BufReader<BoxedRead>, ContentLengthCodec>;
type FrameWriter = FramedWrite<BoxedWrite, ContentLengthCodec>;

/// Source of the byte streams for the transport.
enum StreamSource {
    /// Use the current process's stdin/stdout
    ProcessStdio,
    /// Use raw streams, taken exactly once at connect
    Raw {
        reader: Option<BoxedRead>,
        writer: Option<BoxedWrite>,
    },
}

/// Standard I/O transport implementation.
pub struct StdioTransport {
    state: Arc<StdMutex<TransportState>>,
    handler: Arc<StdMutex<Option<FrameHandler>>>,
    source: TokioMutex<StreamSource>,
    writer: Arc<TokioMutex<Option<FrameWriter>>>,
    task: TokioMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("state", &self.state)
            .finish()
    }
}

impl StdioTransport {
    /// Create a transport over the current process's stdin/stdout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_source(StreamSource::ProcessStdio)
    }

    /// Create a transport over a spawned child's piped stdin/stdout.
    ///
    /// The child must have been spawned with `Stdio::piped()` on both
    /// streams.
    ///
    /// # Errors
    ///
    /// Returns an error if either pipe was not piped or was already taken.
    pub fn from_child(child: &mut Child) -> TransportResult<Self> {
        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Configuration(
                "Child process stdin was not piped. Use Stdio::piped() when spawning.".to_string(),
            )
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Configuration(
                "Child process stdout was not piped. Use Stdio::piped() when spawning.".to_string(),
            )
        })?;
        Ok(Self::from_raw(stdout, stdin))
    }

    /// Create a transport from raw streams.
    ///
    /// `reader` is what we read frames from (a child's stdout), `writer`
    /// is what we write frames to (a child's stdin).
    pub fn from_raw<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Sync + 'static,
        W: AsyncWrite + Send + Sync + 'static,
    {
        Self::with_source(StreamSource::Raw {
            reader: Some(Box::pin(reader)),
            writer: Some(Box::pin(writer)),
        })
    }

    fn with_source(source: StreamSource) -> Self {
        Self {
            state: Arc::new(StdMutex::new(TransportState::Disconnected)),
            handler: Arc::new(StdMutex::new(None)),
            source: TokioMutex::new(source),
            writer: Arc::new(TokioMutex::new(None)),
            task: TokioMutex::new(None),
        }
    }

    fn set_state(&self, new_state: TransportState) {
        let mut state = self.state.lock().expect("state mutex poisoned");
        if *state != new_state {
            trace!("Stdio transport state: {} -> {}", *state, new_state);
            *state = new_state;
        }
    }

    async fn take_streams(&self) -> TransportResult<(BoxedRead, BoxedWrite)> {
        let mut source = self.source.lock().await;
        match &mut *source {
            StreamSource::ProcessStdio => {
                let reader: BoxedRead = Box::pin(tokio::io::stdin());
                let writer: BoxedWrite = Box::pin(tokio::io::stdout());
                Ok((reader, writer))
            }
            StreamSource::Raw { reader, writer } => {
                let reader = reader.take().ok_or_else(|| {
                    TransportError::Configuration("Raw reader stream already consumed".to_string())
                })?;
                let writer = writer.take().ok_or_else(|| {
                    TransportError::Configuration("Raw writer stream already consumed".to_string())
                })?;
                Ok((reader, writer))
            }
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn state(&self) -> TransportState {
        self.state.lock().expect("state mutex poisoned").clone()
    }

    fn set_handler(&self, handler: FrameHandler) {
        *self.handler.lock().expect("handler mutex poisoned") = Some(handler);
    }

    async fn connect(&self) -> TransportResult<()> {
        if matches!(self.state().await, TransportState::Connected) {
            return Ok(());
        }
        self.set_state(TransportState::Connecting);

        let (reader, writer) = match self.take_streams().await {
            Ok(streams) => streams,
            Err(setup_error) => {
                self.set_state(TransportState::Failed {
                    reason: setup_error.to_string(),
                });
                return Err(setup_error);
            }
        };

        let mut frames: FrameReader =
            FramedRead::new(BufReader::new(reader), ContentLengthCodec::new());
        *self.writer.lock().await = Some(FramedWrite::new(writer, ContentLengthCodec::new()));

        let handler_slot = self.handler.clone();
        let writer_slot = self.writer.clone();
        let state_slot = self.state.clone();

        let task = tokio::spawn(async move {
            while let Some(result) = frames.next().await {
                match result {
                    Ok(frame) => {
                        trace!("Received frame: {} bytes", frame.len());
                        let handler = handler_slot
                            .lock()
                            .expect("handler mutex poisoned")
                            .clone();
                        let Some(handler) = handler else {
                            warn!("Inbound frame dropped: no handler installed");
                            continue;
                        };

                        if let Some(reply) = handler(frame).await {
                            let mut writer = writer_slot.lock().await;
                            if let Some(writer) = writer.as_mut() {
                                if let Err(write_error) =
                                    writer.send(Bytes::from(reply)).await
                                {
                                    error!("Failed to write response frame: {write_error}");
                                    break;
                                }
                            }
                        }
                    }
                    Err(read_error) => {
                        error!("Failed to read frame: {read_error}");
                        *state_slot.lock().expect("state mutex poisoned") =
                            TransportState::Failed {
                                reason: read_error.to_string(),
                            };
                        return;
                    }
                }
            }

            debug!("Stdio reader reached end of stream");
            *state_slot.lock().expect("state mutex poisoned") = TransportState::Disconnected;
        });

        *self.task.lock().await = Some(task);
        self.set_state(TransportState::Connected);
        debug!("Stdio transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        if matches!(self.state().await, TransportState::Disconnected) {
            return Ok(());
        }

        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        *self.writer.lock().await = None;

        self.set_state(TransportState::Disconnected);
        debug!("Stdio transport disconnected");
        Ok(())
    }

    async fn send(&self, frame: Bytes) -> TransportResult<()> {
        let state = self.state().await;
        if !matches!(state, TransportState::Connected) {
            return Err(TransportError::SendFailed(format!(
                "Transport not connected: {state}"
            )));
        }

        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or_else(|| TransportError::SendFailed("Writer not available".to_string()))?;

        let size = frame.len();
        writer.send(frame).await.map_err(|write_error| {
            self.set_state(TransportState::Failed {
                reason: write_error.to_string(),
            });
            TransportError::SendFailed(write_error.to_string())
        })?;
        trace!("Sent frame: {size} bytes");
        Ok(())
    }
}
