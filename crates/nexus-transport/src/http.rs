//! HTTP + Server-Sent Events transport.
//!
//! The transport hosts two endpoints on the configured address:
//!
//! - `POST /jsonrpc` - the peer posts a single JSON-RPC envelope (never a
//!   batch); the handler's reply is returned as the response body, or
//!   `204 No Content` when the envelope was a notification.
//! - `GET /events` - an SSE stream carrying every outbound frame as one
//!   `data: <json>` event.
//!
//! Outbound frames go through an internal broadcast queue; a frame sent
//! while no peer is listening on `/events` is dropped, which is in line
//! with the hub's no-redelivery stance.

use std::convert::Infallible;
use std::sync::{Arc, Mutex as StdMutex};

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::{Mutex as TokioMutex, Notify, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, error, trace, warn};

use async_trait::async_trait;

use crate::error::{TransportError, TransportResult};
use crate::traits::{FrameHandler, Transport, TransportKind, TransportState};

const OUTBOUND_QUEUE_DEPTH: usize = 256;

#[derive(Clone)]
struct HttpState {
    handler: Arc<StdMutex<Option<FrameHandler>>>,
    outbound: broadcast::Sender<String>,
}

/// HTTP + SSE transport hosted on a local address.
pub struct HttpSseTransport {
    host: String,
    port: u16,
    origins: Vec<String>,
    state: Arc<StdMutex<TransportState>>,
    handler: Arc<StdMutex<Option<FrameHandler>>>,
    outbound: broadcast::Sender<String>,
    shutdown: Arc<Notify>,
    task: TokioMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for HttpSseTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSseTransport")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("state", &self.state)
            .finish()
    }
}

impl HttpSseTransport {
    /// Create a transport that will bind `host:port` on connect. `origins`
    /// is the CORS allow-list; `*` opens it up for development.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, origins: Vec<String>) -> Self {
        let (outbound, _) = broadcast::channel(OUTBOUND_QUEUE_DEPTH);
        Self {
            host: host.into(),
            port,
            origins,
            state: Arc::new(StdMutex::new(TransportState::Disconnected)),
            handler: Arc::new(StdMutex::new(None)),
            outbound,
            shutdown: Arc::new(Notify::new()),
            task: TokioMutex::new(None),
        }
    }

    fn set_state(&self, new_state: TransportState) {
        let mut state = self.state.lock().expect("state mutex poisoned");
        if *state != new_state {
            trace!("HTTP transport state: {} -> {}", *state, new_state);
            *state = new_state;
        }
    }

    fn cors_layer(&self) -> CorsLayer {
        if self.origins.iter().any(|origin| origin == "*") {
            return CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any);
        }

        let origins: Vec<HeaderValue> = self
            .origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Ignoring malformed CORS origin: {origin}");
                    None
                }
            })
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    }
}

async fn handle_jsonrpc(State(state): State<HttpState>, body: Bytes) -> Response {
    let handler = state
        .handler
        .lock()
        .expect("handler mutex poisoned")
        .clone();
    let Some(handler) = handler else {
        error!("JSON-RPC request received before a handler was installed");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    match handler(body).await {
        Some(reply) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            reply,
        )
            .into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn handle_events(
    State(state): State<HttpState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.outbound.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|frame| match frame {
        Ok(frame) => Some(Ok(Event::default().data(frame))),
        Err(lag) => {
            warn!("SSE stream lagged, dropping frames: {lag}");
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[async_trait]
impl Transport for HttpSseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
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

        let address = format!("{}:{}", self.host, self.port);
        let listener = match TcpListener::bind(&address).await {
            Ok(listener) => listener,
            Err(bind_error) => {
                self.set_state(TransportState::Failed {
                    reason: bind_error.to_string(),
                });
                return Err(TransportError::ConnectionFailed(format!(
                    "Failed to bind {address}: {bind_error}"
                )));
            }
        };

        let app_state = HttpState {
            handler: self.handler.clone(),
            outbound: self.outbound.clone(),
        };
        let router = Router::new()
            .route("/jsonrpc", post(handle_jsonrpc))
            .route("/events", get(handle_events))
            .layer(self.cors_layer())
            .with_state(app_state);

        let shutdown = self.shutdown.clone();
        let state_slot = self.state.clone();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.notified().await });
            if let Err(serve_error) = serve.await {
                error!("HTTP transport server error: {serve_error}");
                *state_slot.lock().expect("state mutex poisoned") = TransportState::Failed {
                    reason: serve_error.to_string(),
                };
            }
        });

        *self.task.lock().await = Some(task);
        self.set_state(TransportState::Connected);
        debug!("HTTP+SSE transport listening on http://{address}");
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        if matches!(self.state().await, TransportState::Disconnected) {
            return Ok(());
        }

        self.shutdown.notify_one();
        if let Some(mut task) = self.task.lock().await.take() {
            // Give the graceful shutdown a moment, then abort outright.
            if tokio::time::timeout(std::time::Duration::from_secs(5), &mut task)
                .await
                .is_err()
            {
                warn!("HTTP transport did not shut down gracefully");
                task.abort();
            }
        }

        self.set_state(TransportState::Disconnected);
        debug!("HTTP+SSE transport disconnected");
        Ok(())
    }

    async fn send(&self, frame: Bytes) -> TransportResult<()> {
        let state = self.state().await;
        if !matches!(state, TransportState::Connected) {
            return Err(TransportError::SendFailed(format!(
                "Transport not connected: {state}"
            )));
        }

        let frame = String::from_utf8(frame.to_vec())
            .map_err(|utf8_error| TransportError::SendFailed(utf8_error.to_string()))?;
        match self.outbound.send(frame) {
            Ok(receivers) => {
                trace!("Queued frame for {receivers} SSE receiver(s)");
                Ok(())
            }
            Err(_) => {
                debug!("Dropped outbound frame: no SSE receiver connected");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn transport_starts_disconnected() {
        let transport = HttpSseTransport::new("127.0.0.1", 0, vec!["*".to_string()]);
        assert_eq!(transport.state().await, TransportState::Disconnected);
        assert_eq!(transport.kind(), TransportKind::Http);
    }

    #[tokio::test]
    async fn send_requires_connection() {
        let transport = HttpSseTransport::new("127.0.0.1", 0, vec![]);
        let result = transport.send(Bytes::from_static(b"{}")).await;
        assert!(matches!(result, Err(TransportError::SendFailed(_))));
    }

    #[tokio::test]
    async fn connect_binds_and_disconnect_releases() {
        let transport = HttpSseTransport::new("127.0.0.1", 0, vec!["*".to_string()]);
        transport.set_handler(Arc::new(|_frame| Box::pin(async move { None })));

        transport.connect().await.unwrap();
        assert_eq!(transport.state().await, TransportState::Connected);

        // Frames sent with no SSE listener are dropped, not errors.
        transport.send(Bytes::from_static(b"{}")).await.unwrap();

        transport.disconnect().await.unwrap();
        assert_eq!(transport.state().await, TransportState::Disconnected);
    }
}
