//! In-memory transport for protocol-level tests.
//!
//! [`LoopbackTransport`] records every frame the engine sends so tests can
//! inspect outbound traffic, and lets tests inject inbound frames straight
//! into the installed handler without any I/O.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex as TokioMutex, mpsc};

use crate::error::TransportResult;
use crate::traits::{FrameHandler, Transport, TransportKind, TransportState};

/// A transport that loops frames through channels instead of I/O.
pub struct LoopbackTransport {
    handler: StdMutex<Option<FrameHandler>>,
    sent_tx: mpsc::UnboundedSender<Bytes>,
    sent_rx: TokioMutex<mpsc::UnboundedReceiver<Bytes>>,
    sent_count: AtomicUsize,
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("sent_count", &self.sent_count)
            .finish()
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    /// Create a loopback transport.
    #[must_use]
    pub fn new() -> Self {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        Self {
            handler: StdMutex::new(None),
            sent_tx,
            sent_rx: TokioMutex::new(sent_rx),
            sent_count: AtomicUsize::new(0),
        }
    }

    /// Await the next frame the engine sent.
    ///
    /// # Panics
    ///
    /// Panics if the transport was dropped without sending.
    pub async fn next_sent(&self) -> Bytes {
        let frame = self
            .sent_rx
            .lock()
            .await
            .recv()
            .await
            .expect("loopback transport closed");
        self.sent_count.fetch_sub(1, Ordering::SeqCst);
        frame
    }

    /// Whether any sent frames are waiting to be consumed.
    #[must_use]
    pub fn sent_is_empty(&self) -> bool {
        self.sent_count.load(Ordering::SeqCst) == 0
    }

    /// Push an inbound frame through the installed handler, returning the
    /// handler's reply frame.
    pub async fn inject(&self, frame: impl Into<Bytes>) -> Option<String> {
        let handler = self
            .handler
            .lock()
            .expect("handler mutex poisoned")
            .clone()?;
        handler(frame.into()).await
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn state(&self) -> TransportState {
        TransportState::Connected
    }

    fn set_handler(&self, handler: FrameHandler) {
        *self.handler.lock().expect("handler mutex poisoned") = Some(handler);
    }

    async fn connect(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn send(&self, frame: Bytes) -> TransportResult<()> {
        self.sent_count.fetch_add(1, Ordering::SeqCst);
        let _ = self.sent_tx.send(frame);
        Ok(())
    }
}
