//! Shared JSON-RPC dispatcher used by both protocol roles.
//!
//! The engine is the single consumer of a transport's inbound frames. Every
//! frame is classified as a request, notification, or response:
//!
//! - **Responses** complete the matching entry in the pending-request table
//!   through a oneshot channel.
//! - **Requests** go to the registered handler for their method, or to the
//!   request fallback (the hub wires the router in here), or produce a
//!   method-not-found error response.
//! - **Notifications** go to their handler or the notification fallback and
//!   never produce output.
//!
//! Abandoning a `send_request` future detaches the caller but leaves the
//! pending entry in place; the entry is removed when the response arrives or
//! when [`ProtocolEngine::fail_pending`] sweeps the table on connection
//! loss.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use bytes::Bytes;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

use nexus_transport::Transport;

use crate::error::{ErrorCode, ProtocolError, ProtocolResult};
use crate::jsonrpc::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId,
};

/// Handler for an inbound request method. Receives the request params and
/// produces the result value or a protocol error.
pub type RequestHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, ProtocolResult<Value>> + Send + Sync>;

/// Handler for an inbound notification method.
pub type NotificationHandler = Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Fallback for requests with no registered handler. Receives the raw
/// envelope and may produce a complete response envelope; `None` means the
/// method is unroutable and yields method-not-found.
pub type RequestFallback =
    Arc<dyn Fn(Value) -> BoxFuture<'static, ProtocolResult<Option<Value>>> + Send + Sync>;

/// Fallback for notifications with no registered handler.
pub type NotificationFallback = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// The shared dispatcher core.
pub struct ProtocolEngine {
    transport: Arc<dyn Transport>,
    request_handlers: StdMutex<HashMap<String, RequestHandler>>,
    notification_handlers: StdMutex<HashMap<String, NotificationHandler>>,
    request_fallback: StdMutex<Option<RequestFallback>>,
    notification_fallback: StdMutex<Option<NotificationFallback>>,
    pending: StdMutex<HashMap<RequestId, oneshot::Sender<JsonRpcResponse>>>,
}

impl std::fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("transport", &self.transport.kind())
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl ProtocolEngine {
    /// Create an engine bound to a transport and install it as the
    /// transport's frame handler. The handler holds a weak reference so
    /// dropping the engine does not leak through the transport.
    pub fn bind(transport: Arc<dyn Transport>) -> Arc<Self> {
        let engine = Arc::new(Self {
            transport: transport.clone(),
            request_handlers: StdMutex::new(HashMap::new()),
            notification_handlers: StdMutex::new(HashMap::new()),
            request_fallback: StdMutex::new(None),
            notification_fallback: StdMutex::new(None),
            pending: StdMutex::new(HashMap::new()),
        });

        let weak: Weak<Self> = Arc::downgrade(&engine);
        transport.set_handler(Arc::new(move |frame: Bytes| {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(engine) => engine.handle_frame(&frame).await,
                    None => None,
                }
            })
        }));

        engine
    }

    /// The transport this engine speaks through.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Register a request handler for a method.
    pub fn on_request(&self, method: impl Into<String>, handler: RequestHandler) {
        let method = method.into();
        trace!("Registered request handler for method: {method}");
        self.request_handlers
            .lock()
            .expect("handler mutex poisoned")
            .insert(method, handler);
    }

    /// Register a notification handler for a method.
    pub fn on_notification(&self, method: impl Into<String>, handler: NotificationHandler) {
        let method = method.into();
        trace!("Registered notification handler for method: {method}");
        self.notification_handlers
            .lock()
            .expect("handler mutex poisoned")
            .insert(method, handler);
    }

    /// Install the request fallback consulted when no handler matches.
    pub fn set_request_fallback(&self, fallback: RequestFallback) {
        *self
            .request_fallback
            .lock()
            .expect("fallback mutex poisoned") = Some(fallback);
    }

    /// Install the notification fallback consulted when no handler matches.
    pub fn set_notification_fallback(&self, fallback: NotificationFallback) {
        *self
            .notification_fallback
            .lock()
            .expect("fallback mutex poisoned") = Some(fallback);
    }

    /// Number of outstanding requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending mutex poisoned").len()
    }

    /// Classify and dispatch one inbound frame, returning the frame to send
    /// back, if any.
    pub async fn handle_frame(&self, frame: &[u8]) -> Option<String> {
        let raw: Value = match serde_json::from_slice(frame) {
            Ok(value) => value,
            Err(parse_error) => {
                error!("Inbound frame is not valid JSON: {parse_error}");
                return Some(encode_response(&JsonRpcResponse::error_null_id(
                    JsonRpcError::new(ErrorCode::ParseError, format!("Invalid JSON: {parse_error}")),
                )));
            }
        };

        let message: JsonRpcMessage = match serde_json::from_value(raw.clone()) {
            Ok(message) => message,
            Err(_) => {
                error!("Inbound frame is not a JSON-RPC envelope: {raw}");
                return Some(encode_response(&JsonRpcResponse::error_null_id(
                    JsonRpcError::new(ErrorCode::InvalidRequest, "Invalid message format"),
                )));
            }
        };

        match message {
            JsonRpcMessage::Request(request) => Some(self.dispatch_request(request, raw).await),
            JsonRpcMessage::Notification(notification) => {
                self.dispatch_notification(notification, raw).await;
                None
            }
            JsonRpcMessage::Response(response) => {
                self.complete_pending(response);
                None
            }
        }
    }

    async fn dispatch_request(&self, request: JsonRpcRequest, raw: Value) -> String {
        trace!("Dispatching request: method={}, id={}", request.method, request.id);

        let handler = self
            .request_handlers
            .lock()
            .expect("handler mutex poisoned")
            .get(&request.method)
            .cloned();

        if let Some(handler) = handler {
            let response = match handler(request.params.clone()).await {
                Ok(result) => JsonRpcResponse::success(result, request.id),
                Err(handler_error) => {
                    debug!("Handler for {} failed: {handler_error}", request.method);
                    JsonRpcResponse::error_response(handler_error.to_json_rpc(), request.id)
                }
            };
            return encode_response(&response);
        }

        let fallback = self
            .request_fallback
            .lock()
            .expect("fallback mutex poisoned")
            .clone();

        if let Some(fallback) = fallback {
            return match fallback(raw).await {
                Ok(Some(envelope)) => encode_value(&envelope),
                Ok(None) => encode_response(&JsonRpcResponse::error_response(
                    JsonRpcError::new(
                        ErrorCode::MethodNotFound,
                        format!("Method not found: {}", request.method),
                    ),
                    request.id,
                )),
                Err(fallback_error) => {
                    error!("Request fallback for {} failed: {fallback_error}", request.method);
                    encode_response(&JsonRpcResponse::error_response(
                        fallback_error.to_json_rpc(),
                        request.id,
                    ))
                }
            };
        }

        warn!("No handler for method: {}", request.method);
        encode_response(&JsonRpcResponse::error_response(
            JsonRpcError::new(
                ErrorCode::MethodNotFound,
                format!("Method not found: {}", request.method),
            ),
            request.id,
        ))
    }

    async fn dispatch_notification(&self, notification: JsonRpcNotification, raw: Value) {
        trace!("Dispatching notification: method={}", notification.method);

        let handler = self
            .notification_handlers
            .lock()
            .expect("handler mutex poisoned")
            .get(&notification.method)
            .cloned();

        if let Some(handler) = handler {
            handler(notification.params.clone()).await;
            return;
        }

        let fallback = self
            .notification_fallback
            .lock()
            .expect("fallback mutex poisoned")
            .clone();

        if let Some(fallback) = fallback {
            fallback(raw).await;
            return;
        }

        debug!("No handler for notification method: {}", notification.method);
    }

    fn complete_pending(&self, response: JsonRpcResponse) {
        let Some(id) = response.id.as_request_id().cloned() else {
            warn!("Received response with null id (parse error at peer)");
            return;
        };

        let sender = self
            .pending
            .lock()
            .expect("pending mutex poisoned")
            .remove(&id);

        match sender {
            Some(sender) => {
                trace!("Completing pending request: {id}");
                // The waiter may have been abandoned; that is not an error.
                let _ = sender.send(response);
            }
            None => {
                warn!("Received response for unknown request id: {id}");
            }
        }
    }

    fn register_pending(&self, id: RequestId) -> oneshot::Receiver<JsonRpcResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending mutex poisoned")
            .insert(id, tx);
        rx
    }

    fn discard_pending(&self, id: &RequestId) {
        self.pending
            .lock()
            .expect("pending mutex poisoned")
            .remove(id);
    }

    /// Send a request and await the peer's result.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> ProtocolResult<Value> {
        let id = RequestId::generate();
        let request = JsonRpcRequest::new(method, params, id.clone());
        let frame = serde_json::to_string(&request)
            .map_err(|serialize_error| ProtocolError::Internal(serialize_error.to_string()))?;

        let receiver = self.register_pending(id.clone());
        if let Err(send_error) = self.transport.send(Bytes::from(frame)).await {
            self.discard_pending(&id);
            return Err(ProtocolError::ConnectionClosed(send_error.to_string()));
        }

        let response = receiver
            .await
            .map_err(|_| ProtocolError::ConnectionClosed("engine dropped".to_string()))?;
        response.into_outcome().map_err(ProtocolError::Rpc)
    }

    /// Send a notification; fire-and-forget.
    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> ProtocolResult<()> {
        let notification = JsonRpcNotification::new(method, params);
        let frame = serde_json::to_string(&notification)
            .map_err(|serialize_error| ProtocolError::Internal(serialize_error.to_string()))?;
        self.transport
            .send(Bytes::from(frame))
            .await
            .map_err(|send_error| ProtocolError::ConnectionClosed(send_error.to_string()))
    }

    /// Forward a request envelope verbatim, correlating on its own id, and
    /// return the peer's full response envelope.
    pub async fn forward_request(&self, envelope: Value) -> ProtocolResult<Value> {
        let id: RequestId = envelope
            .get("id")
            .cloned()
            .and_then(|id| serde_json::from_value(id).ok())
            .ok_or_else(|| {
                ProtocolError::InvalidRequest("Forwarded request has no usable id".to_string())
            })?;

        let frame = serde_json::to_string(&envelope)
            .map_err(|serialize_error| ProtocolError::Internal(serialize_error.to_string()))?;

        let receiver = self.register_pending(id.clone());
        if let Err(send_error) = self.transport.send(Bytes::from(frame)).await {
            self.discard_pending(&id);
            return Err(ProtocolError::ConnectionClosed(send_error.to_string()));
        }

        let response = receiver
            .await
            .map_err(|_| ProtocolError::ConnectionClosed("engine dropped".to_string()))?;
        serde_json::to_value(&response)
            .map_err(|serialize_error| ProtocolError::Internal(serialize_error.to_string()))
    }

    /// Forward a notification envelope verbatim.
    pub async fn forward_notification(&self, envelope: Value) -> ProtocolResult<()> {
        let frame = serde_json::to_string(&envelope)
            .map_err(|serialize_error| ProtocolError::Internal(serialize_error.to_string()))?;
        self.transport
            .send(Bytes::from(frame))
            .await
            .map_err(|send_error| ProtocolError::ConnectionClosed(send_error.to_string()))
    }

    /// Fail every outstanding request with a connection error. Called when
    /// the connection closes underneath the engine.
    pub fn fail_pending(&self, reason: &str) {
        let drained: Vec<(RequestId, oneshot::Sender<JsonRpcResponse>)> = self
            .pending
            .lock()
            .expect("pending mutex poisoned")
            .drain()
            .collect();

        if !drained.is_empty() {
            warn!("Failing {} pending request(s): {reason}", drained.len());
        }

        for (id, sender) in drained {
            let _ = sender.send(JsonRpcResponse::error_response(
                JsonRpcError::new(ErrorCode::ProtocolError, format!("Connection lost: {reason}")),
                id,
            ));
        }
    }
}

fn encode_response(response: &JsonRpcResponse) -> String {
    serde_json::to_string(response).unwrap_or_else(|serialize_error| {
        error!("Failed to encode response: {serialize_error}");
        r#"{"jsonrpc":"2.0","error":{"code":-32603,"message":"Internal error"},"id":null}"#
            .to_string()
    })
}

fn encode_value(envelope: &Value) -> String {
    serde_json::to_string(envelope).unwrap_or_else(|serialize_error| {
        error!("Failed to encode envelope: {serialize_error}");
        r#"{"jsonrpc":"2.0","error":{"code":-32603,"message":"Internal error"},"id":null}"#
            .to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nexus_transport::testing::LoopbackTransport;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn engine() -> (Arc<ProtocolEngine>, Arc<LoopbackTransport>) {
        let transport = Arc::new(LoopbackTransport::new());
        let engine = ProtocolEngine::bind(transport.clone());
        (engine, transport)
    }

    #[tokio::test]
    async fn request_dispatches_to_handler() {
        let (engine, _transport) = engine();
        engine.on_request(
            "echo",
            Arc::new(|params| Box::pin(async move { Ok(params.unwrap_or(Value::Null)) })),
        );

        let frame = br#"{"jsonrpc":"2.0","id":"1","method":"echo","params":{"x":1}}"#;
        let reply = engine.handle_frame(frame).await.unwrap();
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply, json!({"jsonrpc":"2.0","result":{"x":1},"id":"1"}));
    }

    #[tokio::test]
    async fn unknown_method_yields_method_not_found() {
        let (engine, _transport) = engine();
        let frame = br#"{"jsonrpc":"2.0","id":"2","method":"nope"}"#;
        let reply = engine.handle_frame(frame).await.unwrap();
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["error"]["code"], json!(-32601));
        assert_eq!(reply["id"], json!("2"));
    }

    #[tokio::test]
    async fn invalid_json_yields_parse_error_with_null_id() {
        let (engine, _transport) = engine();
        let reply = engine.handle_frame(b"this is not json").await.unwrap();
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["error"]["code"], json!(-32700));
        assert_eq!(reply["id"], Value::Null);
    }

    #[tokio::test]
    async fn empty_object_yields_invalid_request() {
        let (engine, _transport) = engine();
        let reply = engine.handle_frame(b"{}").await.unwrap();
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["error"]["code"], json!(-32600));
        assert_eq!(reply["id"], Value::Null);
    }

    #[tokio::test]
    async fn response_completes_pending_entry() {
        let (engine, transport) = engine();

        let engine_clone = engine.clone();
        let call = tokio::spawn(async move {
            engine_clone.send_request("tools/list", None).await
        });

        // Wait for the outbound request to hit the transport, then feed the
        // matching response back through the engine.
        let sent = transport.next_sent().await;
        let sent: Value = serde_json::from_slice(&sent).unwrap();
        let id = sent["id"].clone();
        let response = json!({"jsonrpc": "2.0", "id": id, "result": {"tools": []}});
        let reply = engine
            .handle_frame(response.to_string().as_bytes())
            .await;
        assert!(reply.is_none());

        let result = call.await.unwrap().unwrap();
        assert_eq!(result, json!({"tools": []}));
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_response_id_is_discarded() {
        let (engine, _transport) = engine();
        let reply = engine
            .handle_frame(br#"{"jsonrpc":"2.0","id":"ghost","result":{}}"#)
            .await;
        assert!(reply.is_none());
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn fail_pending_fails_every_outstanding_request_once() {
        let (engine, transport) = engine();

        let engine_clone = engine.clone();
        let call = tokio::spawn(async move {
            engine_clone.send_request("tools/list", None).await
        });
        let _ = transport.next_sent().await;
        assert_eq!(engine.pending_count(), 1);

        engine.fail_pending("transport closed");
        let outcome = call.await.unwrap();
        match outcome {
            Err(ProtocolError::Rpc(error)) => assert_eq!(error.code, -32000),
            other => panic!("expected connection-lost error, got {other:?}"),
        }
        assert_eq!(engine.pending_count(), 0);
    }

    #[tokio::test]
    async fn forward_preserves_the_envelope_id() {
        let (engine, transport) = engine();

        let engine_clone = engine.clone();
        let envelope = json!({"jsonrpc": "2.0", "id": "7", "method": "tools/call", "params": {"name": "add"}});
        let call = tokio::spawn(async move { engine_clone.forward_request(envelope).await });

        let sent = transport.next_sent().await;
        let sent: Value = serde_json::from_slice(&sent).unwrap();
        assert_eq!(sent["id"], json!("7"));

        let response = json!({"jsonrpc": "2.0", "id": "7", "result": {"sum": 3}});
        engine.handle_frame(response.to_string().as_bytes()).await;

        let returned = call.await.unwrap().unwrap();
        assert_eq!(returned["id"], json!("7"));
        assert_eq!(returned["result"], json!({"sum": 3}));
    }

    #[tokio::test]
    async fn notification_fallback_sees_the_raw_envelope() {
        let (engine, _transport) = engine();
        let seen: Arc<StdMutex<Vec<Value>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        engine.set_notification_fallback(Arc::new(move |raw| {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().unwrap().push(raw);
            })
        }));

        engine
            .handle_frame(br#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#)
            .await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
