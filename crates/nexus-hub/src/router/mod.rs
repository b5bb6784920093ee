//! Rule-driven message broker.
//!
//! The router owns an insertion-ordered value set of [`Route`]s and a
//! handler per destination [`RouteKind`], registered once by the hub at
//! wiring time. Requests use the first matching route in route order, so
//! request routing is deterministic; notifications fan out to every match
//! in parallel background tasks.
//!
//! Lookup is exact on the source's route type. The routing entry point
//! retries with the class target (`ALL_CLIENTS` / `ALL_SERVERS`) when a
//! concrete source matched nothing, which is how the seeded
//! `ALL_CLIENTS -> HUB` default serves traffic from specific clients
//! without shadowing explicit per-client routes.

mod route;

pub use route::{Route, RouteKind, RouteTarget};

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, error, warn};

use nexus_protocol::{ErrorCode, JsonRpcError, JsonRpcResponse, RequestId};

use crate::error::{HubError, HubResult};

/// Handler delivering a message to one destination class. Receives the
/// raw envelope, the source, and the resolved destination; returns the
/// response envelope for requests, `None` for notifications.
pub type DestinationHandler = Arc<
    dyn Fn(Value, RouteTarget, RouteTarget) -> BoxFuture<'static, HubResult<Option<Value>>>
        + Send
        + Sync,
>;

/// The message router.
pub struct MessageRouter {
    routes: StdMutex<Vec<Route>>,
    handlers: StdMutex<HashMap<RouteKind, DestinationHandler>>,
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("routes", &self.routes.lock().expect("routes mutex poisoned").len())
            .finish()
    }
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageRouter {
    /// Create a router seeded with the default routes.
    #[must_use]
    pub fn new() -> Self {
        let router = Self {
            routes: StdMutex::new(Vec::new()),
            handlers: StdMutex::new(HashMap::new()),
        };
        router.seed_default_routes();
        router
    }

    fn seed_default_routes(&self) {
        // Client requests fall through to the hub; hub notifications fan
        // out to every client.
        self.add_route(Route::new(
            RouteTarget::all_clients(),
            RouteTarget::hub(),
            None,
        ));
        self.add_route(Route::new(
            RouteTarget::hub(),
            RouteTarget::all_clients(),
            Some("notifications/*".to_string()),
        ));
    }

    /// Register the delivery handler for a destination class. Called once
    /// per class by the hub at wiring time.
    pub fn register_handler(&self, kind: RouteKind, handler: DestinationHandler) {
        debug!("Registered destination handler for route kind: {kind:?}");
        self.handlers
            .lock()
            .expect("handlers mutex poisoned")
            .insert(kind, handler);
    }

    /// Add a route. The set is a value set: re-adding an existing route is
    /// a no-op, order of first insertion is preserved.
    pub fn add_route(&self, route: Route) {
        let mut routes = self.routes.lock().expect("routes mutex poisoned");
        if !routes.contains(&route) {
            debug!("Added route: {route}");
            routes.push(route);
        }
    }

    /// Remove a route.
    pub fn remove_route(&self, route: &Route) -> bool {
        let mut routes = self.routes.lock().expect("routes mutex poisoned");
        let before = routes.len();
        routes.retain(|existing| existing != route);
        let removed = routes.len() != before;
        if removed {
            debug!("Removed route: {route}");
        }
        removed
    }

    /// All routes in insertion order.
    #[must_use]
    pub fn routes(&self) -> Vec<Route> {
        self.routes.lock().expect("routes mutex poisoned").clone()
    }

    /// Drop every route and re-seed the defaults.
    pub fn clear_routes(&self) {
        self.routes.lock().expect("routes mutex poisoned").clear();
        debug!("Cleared all routes");
        self.seed_default_routes();
    }

    /// Routes whose source entry and pattern match, in insertion order.
    #[must_use]
    pub fn matching_routes(&self, source: &RouteTarget, method: &str) -> Vec<Route> {
        self.routes
            .lock()
            .expect("routes mutex poisoned")
            .iter()
            .filter(|route| route.source.matches_source(source))
            .filter(|route| route.matches_method(method))
            .cloned()
            .collect()
    }

    fn class_of(source: &RouteTarget) -> Option<RouteTarget> {
        match source.kind {
            RouteKind::Client => Some(RouteTarget::all_clients()),
            RouteKind::Server => Some(RouteTarget::all_servers()),
            _ => None,
        }
    }

    fn handler_for(&self, kind: RouteKind) -> Option<DestinationHandler> {
        self.handlers
            .lock()
            .expect("handlers mutex poisoned")
            .get(&kind)
            .cloned()
    }

    /// Route one message. Returns the response envelope for requests,
    /// `None` for notifications.
    pub async fn route_message(&self, message: Value, source: RouteTarget) -> Option<Value> {
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            error!("Invalid message from {source}: missing method");
            return error_response(&message, ErrorCode::InvalidRequest, "Missing method");
        };
        let method = method.to_string();

        let mut matching = self.matching_routes(&source, &method);
        if matching.is_empty() {
            if let Some(class) = Self::class_of(&source) {
                matching = self.matching_routes(&class, &method);
            }
        }

        let is_request = message.get("id").is_some();
        if matching.is_empty() {
            if is_request {
                warn!("No matching routes for request from {source}: {method}");
                return error_response(
                    &message,
                    ErrorCode::MethodNotFound,
                    &format!("Method not found: {method}"),
                );
            }
            // Unroutable notifications are dropped silently.
            debug!("No matching routes for notification from {source}: {method}");
            return None;
        }

        if is_request {
            // Deterministic: only the first matching route carries a
            // request, so exactly one response reaches the caller.
            let route = matching.remove(0);
            let Some(handler) = self.handler_for(route.destination.kind) else {
                warn!("No handler for destination: {}", route.destination);
                return error_response(
                    &message,
                    ErrorCode::InternalError,
                    &format!("No handler for destination: {}", route.destination),
                );
            };

            return match handler(message.clone(), source.clone(), route.destination.clone()).await
            {
                Ok(Some(response)) => Some(response),
                // The destination had no answer (unknown hub method, or a
                // broadcast with no members): still a method-not-found.
                Ok(None) => error_response(
                    &message,
                    ErrorCode::MethodNotFound,
                    &format!("Method not found: {method}"),
                ),
                Err(handler_error) => {
                    error!(
                        "Error handling message from {source} to {}: {handler_error}",
                        route.destination
                    );
                    error_response(
                        &message,
                        error_code_of(&handler_error),
                        &handler_error.to_string(),
                    )
                }
            };
        }

        // Notifications fan out to every matching destination; failures
        // are logged, never surfaced.
        for route in matching {
            let Some(handler) = self.handler_for(route.destination.kind) else {
                warn!("No handler for destination: {}", route.destination);
                continue;
            };
            let message = message.clone();
            let source = source.clone();
            let destination = route.destination.clone();
            tokio::spawn(async move {
                if let Err(handler_error) =
                    handler(message, source.clone(), destination.clone()).await
                {
                    error!(
                        "Error handling notification from {source} to {destination}: {handler_error}"
                    );
                }
            });
        }
        None
    }
}

fn error_code_of(error: &HubError) -> ErrorCode {
    match error {
        HubError::NotFound(_) => ErrorCode::MethodNotFound,
        HubError::InvalidRequest(_) => ErrorCode::InvalidRequest,
        _ => ErrorCode::InternalError,
    }
}

fn error_response(message: &Value, code: ErrorCode, text: &str) -> Option<Value> {
    let id: RequestId = message
        .get("id")
        .cloned()
        .and_then(|id| serde_json::from_value(id).ok())?;
    let response = JsonRpcResponse::error_response(JsonRpcError::new(code, text), id);
    serde_json::to_value(response).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recording_handler(log: Arc<StdMutex<Vec<String>>>, reply: Option<Value>) -> DestinationHandler {
        Arc::new(move |message, _source, destination| {
            let log = log.clone();
            let reply = reply.clone();
            Box::pin(async move {
                let method = message["method"].as_str().unwrap_or("?").to_string();
                log.lock().unwrap().push(format!("{destination}:{method}"));
                Ok(reply)
            })
        })
    }

    #[test]
    fn defaults_are_seeded_and_reseeded() {
        let router = MessageRouter::new();
        let routes = router.routes();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].source, RouteTarget::all_clients());
        assert_eq!(routes[0].destination, RouteTarget::hub());
        assert_eq!(routes[1].method_pattern.as_deref(), Some("notifications/*"));

        router.clear_routes();
        router.clear_routes();
        assert_eq!(router.routes().len(), 2);
    }

    #[test]
    fn route_set_collapses_duplicates_and_preserves_order() {
        let router = MessageRouter::new();
        let route = Route::new(
            RouteTarget::client("c1"),
            RouteTarget::server("s1"),
            Some("tools/*".to_string()),
        );
        router.add_route(route.clone());
        router.add_route(route.clone());
        assert_eq!(router.routes().len(), 3);

        assert!(router.remove_route(&route));
        assert!(!router.remove_route(&route));
        assert_eq!(router.routes().len(), 2);
    }

    #[test]
    fn lookup_is_the_intersection_of_source_and_pattern() {
        let router = MessageRouter::new();
        router.clear_routes();
        router.add_route(Route::new(
            RouteTarget::client("c1"),
            RouteTarget::server("s1"),
            Some("resources/*".to_string()),
        ));
        router.add_route(Route::new(
            RouteTarget::client("c1"),
            RouteTarget::server("s2"),
            Some("tools/*".to_string()),
        ));
        router.add_route(Route::new(
            RouteTarget::client("c2"),
            RouteTarget::server("s3"),
            Some("tools/*".to_string()),
        ));

        let matching = router.matching_routes(&RouteTarget::client("c1"), "tools/call");
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].destination, RouteTarget::server("s2"));

        // The class source only sees the re-seeded default to the hub.
        let class_matches = router.matching_routes(&RouteTarget::all_clients(), "tools/call");
        assert_eq!(class_matches.len(), 1);
        assert_eq!(class_matches[0].destination, RouteTarget::hub());
    }

    fn drop_default_routes(router: &MessageRouter) {
        for route in router.routes() {
            router.remove_route(&route);
        }
    }

    #[tokio::test]
    async fn requests_use_only_the_first_matching_route() {
        let router = MessageRouter::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        router.register_handler(
            RouteKind::Server,
            recording_handler(log.clone(), Some(json!({"jsonrpc": "2.0", "id": "1", "result": {}}))),
        );
        router.register_handler(RouteKind::Hub, recording_handler(log.clone(), None));

        router.add_route(Route::new(
            RouteTarget::client("c1"),
            RouteTarget::server("s1"),
            Some("tools/*".to_string()),
        ));
        router.add_route(Route::new(
            RouteTarget::client("c1"),
            RouteTarget::server("s2"),
            Some("tools/*".to_string()),
        ));

        let message = json!({"jsonrpc": "2.0", "id": "1", "method": "tools/call"});
        let response = router
            .route_message(message, RouteTarget::client("c1"))
            .await
            .unwrap();
        assert_eq!(response["result"], json!({}));

        let log = log.lock().unwrap();
        assert_eq!(log.as_slice(), ["SERVER:s1:tools/call"]);
    }

    #[tokio::test]
    async fn concrete_source_falls_back_to_the_class_defaults() {
        let router = MessageRouter::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        router.register_handler(
            RouteKind::Hub,
            recording_handler(
                log.clone(),
                Some(json!({"jsonrpc": "2.0", "id": "1", "result": {"status": "running"}})),
            ),
        );

        // No CLIENT-source routes exist, so the seeded ALL_CLIENTS -> HUB
        // default applies.
        let message = json!({"jsonrpc": "2.0", "id": "1", "method": "hub/status"});
        let response = router
            .route_message(message, RouteTarget::client("c1"))
            .await
            .unwrap();
        assert_eq!(response["result"]["status"], json!("running"));
        assert_eq!(log.lock().unwrap().as_slice(), ["HUB:hub/status"]);
    }

    #[tokio::test]
    async fn explicit_client_routes_shadow_the_defaults() {
        let router = MessageRouter::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        router.register_handler(
            RouteKind::Server,
            recording_handler(log.clone(), Some(json!({"jsonrpc": "2.0", "id": "7", "result": {"sum": 3}}))),
        );
        router.register_handler(RouteKind::Hub, recording_handler(log.clone(), None));

        router.add_route(Route::new(
            RouteTarget::client("c1"),
            RouteTarget::server("s1"),
            Some("tools/*".to_string()),
        ));

        let message = json!({"jsonrpc": "2.0", "id": "7", "method": "tools/call", "params": {"name": "add"}});
        let response = router
            .route_message(message, RouteTarget::client("c1"))
            .await
            .unwrap();
        assert_eq!(response["result"]["sum"], json!(3));
        assert_eq!(log.lock().unwrap().as_slice(), ["SERVER:s1:tools/call"]);
    }

    #[tokio::test]
    async fn unroutable_request_is_method_not_found() {
        let router = MessageRouter::new();
        drop_default_routes(&router);
        let response = router
            .route_message(
                json!({"jsonrpc": "2.0", "id": "9", "method": "nope"}),
                RouteTarget::client("c1"),
            )
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], json!(-32601));
        assert_eq!(response["id"], json!("9"));
    }

    #[tokio::test]
    async fn unroutable_notification_is_dropped_silently() {
        let router = MessageRouter::new();
        drop_default_routes(&router);
        let response = router
            .route_message(
                json!({"jsonrpc": "2.0", "method": "notifications/resources/updated"}),
                RouteTarget::client("c1"),
            )
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn notifications_fan_out_to_every_match() {
        let router = MessageRouter::new();
        router.clear_routes();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        router.register_handler(
            RouteKind::Client,
            Arc::new(move |_message, _source, _destination| {
                let hits = hits_clone.clone();
                Box::pin(async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                })
            }),
        );

        router.add_route(Route::new(
            RouteTarget::hub(),
            RouteTarget::client("c1"),
            Some("notifications/*".to_string()),
        ));
        router.add_route(Route::new(
            RouteTarget::hub(),
            RouteTarget::client("c2"),
            Some("notifications/*".to_string()),
        ));

        let response = router
            .route_message(
                json!({"jsonrpc": "2.0", "method": "notifications/resources/updated", "params": {"uri": "file:///a"}}),
                RouteTarget::hub(),
            )
            .await;
        assert!(response.is_none());

        // The fan-out runs in background tasks.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_method_is_invalid_request() {
        let router = MessageRouter::new();
        let response = router
            .route_message(json!({"jsonrpc": "2.0", "id": "1"}), RouteTarget::client("c1"))
            .await
            .unwrap();
        assert_eq!(response["error"]["code"], json!(-32600));
    }
}
