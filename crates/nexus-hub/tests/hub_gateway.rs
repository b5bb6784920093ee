//! Hub-level integration tests: hub-directed methods, the auth/ACL gate,
//! and notification fan-out to connected clients.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use nexus_hub::security::PasswordHash;
use nexus_hub::{Credentials, Hub, HubConfig, HubError, RouteTarget, ServerSpec};
use nexus_transport::testing::LoopbackTransport;

fn config_in(dir: &tempfile::TempDir) -> HubConfig {
    let mut config = HubConfig::default();
    let base = dir.path();
    config.hub.registry_file = base.join("registry.json");
    config.hub.process_registry_file = base.join("process_registry.json");
    config.security.users_file = base.join("users.json");
    config.security.tokens_file = base.join("tokens.json");
    config.security.bearer_tokens_file = base.join("bearer_tokens.json");
    config.security.roles_file = base.join("roles.json");
    config.servers.auto_start = false;
    config
}

fn seed_user(config: &HubConfig, username: &str, password: &str) {
    let hash = PasswordHash::create(password);
    let users = json!({
        username: {
            "password": {"hash": hash.hash, "salt": hash.salt},
            "name": "Test User"
        }
    });
    std::fs::write(
        &config.security.users_file,
        serde_json::to_string_pretty(&users).unwrap(),
    )
    .unwrap();
}

async fn started_hub(dir: &tempfile::TempDir) -> Arc<Hub> {
    let config = config_in(dir);
    let hub = Hub::new(config).unwrap();
    hub.start().await;
    hub
}

/// Drive the MCP handshake of a loopback client.
async fn handshake(transport: &Arc<LoopbackTransport>) {
    let init = json!({
        "jsonrpc": "2.0", "id": "init-1", "method": "initialize",
        "params": {
            "clientInfo": {"name": "test-client", "version": "1.0"},
            "capabilities": {"resources": {"subscriptions": true}, "sampling": true}
        }
    });
    let reply = transport.inject(init.to_string()).await.unwrap();
    let reply: Value = serde_json::from_str(&reply).unwrap();
    assert!(reply.get("result").is_some(), "initialize failed: {reply}");

    let initialized = json!({"jsonrpc": "2.0", "method": "initialized"});
    assert!(transport.inject(initialized.to_string()).await.is_none());
}

#[tokio::test]
async fn hub_status_answers_through_the_default_route() {
    let dir = tempfile::tempdir().unwrap();
    let hub = started_hub(&dir).await;

    let message = json!({"jsonrpc": "2.0", "id": "1", "method": "hub/status"});
    let response = hub
        .route_message(message, RouteTarget::client("c1"))
        .await
        .unwrap();

    assert_eq!(response["id"], json!("1"));
    assert_eq!(response["result"]["status"], json!("running"));
    assert_eq!(response["result"]["server_count"], json!(0));
    assert_eq!(response["result"]["client_count"], json!(0));
    assert_eq!(response["result"]["mcp_server_count"], json!(0));
    assert_eq!(response["result"]["mcp_client_count"], json!(0));

    hub.shutdown().await;
}

#[tokio::test]
async fn hub_health_answers_through_the_default_route() {
    let dir = tempfile::tempdir().unwrap();
    let hub = started_hub(&dir).await;

    let message = json!({"jsonrpc": "2.0", "id": "2", "method": "hub/health"});
    let response = hub
        .route_message(message, RouteTarget::client("c1"))
        .await
        .unwrap();

    assert_eq!(response["id"], json!("2"));
    assert_eq!(response["result"]["status"], json!("healthy"));
    assert!(response["result"]["uptime"].is_u64());

    hub.shutdown().await;
}

#[tokio::test]
async fn hub_servers_and_clients_are_gated_on_the_routed_path() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir);
    seed_user(&config, "u", "p");
    let hub = Hub::new(config).unwrap();
    hub.start().await;
    hub.acl().assign_role("u", "user").unwrap();

    // Without a token the routed view methods are denied, unlike the
    // public status probe.
    let bare = json!({"jsonrpc": "2.0", "id": "20", "method": "hub/servers"});
    let response = hub
        .route_message(bare, RouteTarget::client("c1"))
        .await
        .unwrap();
    assert_eq!(response["error"]["code"], json!(-32000));

    let login = hub
        .login(
            &Credentials::Password {
                username: "u".to_string(),
                password: "p".to_string(),
            },
            None,
        )
        .unwrap();
    let token = login["token"].as_str().unwrap().to_string();

    let servers = json!({
        "jsonrpc": "2.0", "id": "21", "method": "hub/servers",
        "params": {"token": token.clone()}
    });
    let response = hub
        .route_message(servers, RouteTarget::client("c1"))
        .await
        .unwrap();
    assert!(response["result"]["servers"].is_object());

    let clients = json!({
        "jsonrpc": "2.0", "id": "22", "method": "hub/clients",
        "params": {"token": token}
    });
    let response = hub
        .route_message(clients, RouteTarget::client("c1"))
        .await
        .unwrap();
    assert!(response["result"]["clients"].is_array());

    hub.shutdown().await;
}

#[tokio::test]
async fn unknown_hub_method_is_method_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let hub = started_hub(&dir).await;

    let message = json!({"jsonrpc": "2.0", "id": "2", "method": "hub/does-not-exist"});
    let response = hub
        .route_message(message, RouteTarget::client("c1"))
        .await
        .unwrap();
    assert_eq!(response["error"]["code"], json!(-32601));

    hub.shutdown().await;
}

#[tokio::test]
async fn login_issues_a_token_and_the_acl_gates_administration() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir);
    seed_user(&config, "u", "p");
    let hub = Hub::new(config).unwrap();
    hub.start().await;
    hub.acl().assign_role("u", "user").unwrap();

    // Wrong password and unknown user fail identically.
    let bad = hub.login(
        &Credentials::Password {
            username: "u".to_string(),
            password: "wrong".to_string(),
        },
        None,
    );
    assert!(matches!(bad, Err(HubError::Unauthorized)));

    let login = hub
        .login(
            &Credentials::Password {
                username: "u".to_string(),
                password: "p".to_string(),
            },
            None,
        )
        .unwrap();
    let token = login["token"].as_str().unwrap().to_string();
    assert_eq!(login["user"]["username"], json!("u"));
    assert_eq!(token.len(), 64);

    // Role `user` can view but not create or delete servers.
    assert!(hub.list_servers(&token).is_ok());
    let denied = hub.register_server(
        &token,
        "s1",
        ServerSpec::stdio("Echo", "echo", vec!["hi".to_string()]),
    );
    assert!(matches!(denied, Err(HubError::Forbidden(_))));

    // After an admin assignment the same call passes.
    hub.acl().assign_role("u", "admin").unwrap();
    hub.register_server(
        &token,
        "s1",
        ServerSpec::stdio("Echo", "echo", vec!["hi".to_string()]),
    )
    .unwrap();
    assert!(hub.unregister_server(&token, "s1").await.unwrap());
    // Idempotent after the first call.
    assert!(!hub.unregister_server(&token, "s1").await.unwrap());

    // Bogus tokens are a 401, not a 403.
    let unauthorized = hub.list_servers("not-a-token");
    assert!(matches!(unauthorized, Err(HubError::Unauthorized)));

    hub.shutdown().await;
}

#[tokio::test]
async fn auth_methods_answer_through_the_hub_route() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir);
    seed_user(&config, "u", "p");
    let hub = Hub::new(config).unwrap();
    hub.start().await;

    let login = json!({
        "jsonrpc": "2.0", "id": "10", "method": "auth/login",
        "params": {"credentials": {"username": "u", "password": "p"}}
    });
    let response = hub
        .route_message(login, RouteTarget::client("c1"))
        .await
        .unwrap();
    let token = response["result"]["token"].as_str().unwrap().to_string();

    let validate = json!({
        "jsonrpc": "2.0", "id": "11", "method": "auth/validate",
        "params": {"token": token}
    });
    let response = hub
        .route_message(validate, RouteTarget::client("c1"))
        .await
        .unwrap();
    assert_eq!(response["result"]["valid"], json!(true));
    assert_eq!(response["result"]["user"]["username"], json!("u"));

    let logout = json!({
        "jsonrpc": "2.0", "id": "12", "method": "auth/logout",
        "params": {"token": token}
    });
    let response = hub
        .route_message(logout, RouteTarget::client("c1"))
        .await
        .unwrap();
    assert_eq!(response["result"]["success"], json!(true));

    let revalidate = json!({
        "jsonrpc": "2.0", "id": "13", "method": "auth/validate",
        "params": {"token": token}
    });
    let response = hub
        .route_message(revalidate, RouteTarget::client("c1"))
        .await
        .unwrap();
    assert_eq!(response["result"]["valid"], json!(false));

    let bad_login = json!({
        "jsonrpc": "2.0", "id": "14", "method": "auth/login",
        "params": {"credentials": {"username": "u", "password": "nope"}}
    });
    let response = hub
        .route_message(bad_login, RouteTarget::client("c1"))
        .await
        .unwrap();
    assert_eq!(response["error"]["message"], json!("Authentication failed"));

    hub.shutdown().await;
}

#[tokio::test]
async fn notifications_fan_out_to_every_initialized_client() {
    let dir = tempfile::tempdir().unwrap();
    let hub = started_hub(&dir).await;

    let transport_one = Arc::new(LoopbackTransport::new());
    let transport_two = Arc::new(LoopbackTransport::new());
    hub.clients().connect(transport_one.clone()).await.unwrap();
    hub.clients().connect(transport_two.clone()).await.unwrap();
    handshake(&transport_one).await;
    handshake(&transport_two).await;
    assert_eq!(hub.clients().initialized_count(), 2);

    let notification = json!({
        "jsonrpc": "2.0",
        "method": "notifications/resources/updated",
        "params": {"uri": "file:///a"}
    });
    let response = hub
        .route_message(notification, RouteTarget::hub())
        .await;
    assert!(response.is_none());

    for transport in [&transport_one, &transport_two] {
        let sent = tokio::time::timeout(Duration::from_secs(2), transport.next_sent())
            .await
            .expect("notification did not arrive");
        let sent: Value = serde_json::from_slice(&sent).unwrap();
        assert_eq!(sent["method"], json!("notifications/resources/updated"));
        assert_eq!(sent["params"]["uri"], json!("file:///a"));
        assert!(sent.get("id").is_none());
    }

    hub.shutdown().await;
}

#[tokio::test]
async fn client_messages_route_to_bound_servers_first() {
    // With no CLIENT-source route and no live server, a tools/call from a
    // client falls through to the hub default and is method-not-found.
    let dir = tempfile::tempdir().unwrap();
    let hub = started_hub(&dir).await;

    let message = json!({
        "jsonrpc": "2.0", "id": "7", "method": "tools/call",
        "params": {"name": "add", "arguments": {"a": 1, "b": 2}}
    });
    let response = hub
        .route_message(message, RouteTarget::client("c1"))
        .await
        .unwrap();
    assert_eq!(response["error"]["code"], json!(-32601));

    hub.shutdown().await;
}
