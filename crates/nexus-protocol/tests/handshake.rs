//! End-to-end protocol tests: a client role and a server role wired over
//! a real Content-Length framed duplex pipe.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use nexus_protocol::{
    Capabilities, Implementation, McpClient, McpServer, ProtocolError, ToolDescriptor, methods,
};
use nexus_transport::{StdioTransport, Transport};

fn pipe_pair() -> (Arc<dyn Transport>, Arc<dyn Transport>) {
    let (near, far) = tokio::io::duplex(16 * 1024);
    let (near_read, near_write) = tokio::io::split(near);
    let (far_read, far_write) = tokio::io::split(far);
    (
        Arc::new(StdioTransport::from_raw(near_read, near_write)),
        Arc::new(StdioTransport::from_raw(far_read, far_write)),
    )
}

struct Fixture {
    client: Arc<McpClient>,
    server: Arc<McpServer>,
}

async fn fixture() -> Fixture {
    let (client_side, server_side) = pipe_pair();

    let server = McpServer::bind(
        server_side.clone(),
        Implementation::new("echo-server", "1.0.0"),
        Capabilities::hub(),
        "hub",
    );
    server.register_tool(
        ToolDescriptor {
            name: "add".to_string(),
            description: Some("Add two numbers".to_string()),
            input_schema: json!({"type": "object"}),
        },
        Arc::new(|arguments| {
            Box::pin(async move {
                let a = arguments["a"].as_i64().unwrap_or(0);
                let b = arguments["b"].as_i64().unwrap_or(0);
                Ok(json!({"sum": a + b}))
            })
        }),
    );

    let client = McpClient::bind(client_side.clone(), Implementation::new("Nexus MCP Hub", "0.4.0"));

    server_side.connect().await.expect("server transport");
    client_side.connect().await.expect("client transport");

    Fixture { client, server }
}

async fn with_deadline<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("operation timed out")
}

#[tokio::test]
async fn initialize_negotiates_both_ways() {
    let fixture = fixture().await;

    let result = with_deadline(fixture.client.initialize(Capabilities::hub())).await.unwrap();
    assert_eq!(result.server_info.name, "echo-server");
    assert!(fixture.client.has_capability("tools"));
    assert!(fixture.client.has_capability("resources.subscriptions"));

    // The initialized notification reaches the server shortly after.
    with_deadline(async {
        while !fixture.server.initialized() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert_eq!(fixture.server.client_info().unwrap().name, "Nexus MCP Hub");
    assert!(fixture.server.client_has_capability("sampling"));
}

#[tokio::test]
async fn tool_calls_round_trip_with_matching_ids() {
    let fixture = fixture().await;
    with_deadline(fixture.client.initialize(Capabilities::hub())).await.unwrap();

    let tools = with_deadline(fixture.client.list_tools()).await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "add");

    let result = with_deadline(fixture.client.call_tool("add", json!({"a": 1, "b": 2})))
        .await
        .unwrap();
    assert_eq!(result, json!({"sum": 3}));

    let missing = with_deadline(fixture.client.call_tool("subtract", json!({}))).await;
    match missing {
        Err(ProtocolError::Rpc(error)) => assert_eq!(error.code, -32004),
        other => panic!("expected tool-not-found, got {other:?}"),
    }
}

#[tokio::test]
async fn subscriptions_feed_update_notifications() {
    let fixture = fixture().await;
    with_deadline(fixture.client.initialize(Capabilities::hub())).await.unwrap();

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<Value>();
    fixture.client.on_notification(
        methods::NOTIFY_RESOURCE_UPDATED,
        Arc::new(move |params| {
            let notify_tx = notify_tx.clone();
            Box::pin(async move {
                let _ = notify_tx.send(params.unwrap_or(Value::Null));
            })
        }),
    );

    with_deadline(fixture.client.subscribe_resource("file:///a")).await.unwrap();
    assert!(fixture.server.subscribers_of("file:///a").contains("hub"));

    fixture
        .server
        .notify_resource_updated("file:///a")
        .await
        .unwrap();
    let params = with_deadline(notify_rx.recv()).await.unwrap();
    assert_eq!(params["uri"], json!("file:///a"));

    with_deadline(fixture.client.unsubscribe_resource("file:///a")).await.unwrap();
    assert!(fixture.server.subscribers_of("file:///a").is_empty());
}

#[tokio::test]
async fn sampling_flows_from_server_to_client() {
    let fixture = fixture().await;

    fixture.client.on_request(
        methods::SAMPLING_SAMPLE,
        Arc::new(|params| {
            Box::pin(async move {
                let prompt = params
                    .as_ref()
                    .and_then(|p| p.get("prompt"))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                Ok(json!({"text": format!("echo {prompt}"), "finish_reason": "stop"}))
            })
        }),
    );

    // Before the handshake the client has not declared sampling.
    let early = fixture.server.sample(json!({"prompt": "hi"})).await;
    assert!(matches!(early, Err(ProtocolError::UnsupportedCapability(_))));

    with_deadline(fixture.client.initialize(Capabilities::hub())).await.unwrap();
    with_deadline(async {
        while !fixture.server.initialized() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    let result = with_deadline(fixture.server.sample(json!({"prompt": "hi"})))
        .await
        .unwrap();
    assert_eq!(result["text"], json!("echo hi"));
}

#[tokio::test]
async fn shutdown_resets_both_sides() {
    let fixture = fixture().await;
    with_deadline(fixture.client.initialize(Capabilities::hub())).await.unwrap();
    with_deadline(async {
        while !fixture.server.initialized() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    with_deadline(fixture.client.shutdown()).await.unwrap();
    assert!(!fixture.client.initialized());
    assert!(!fixture.server.initialized());
    assert!(!fixture.client.has_capability("tools"));
}
