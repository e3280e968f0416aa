//! RPC multiplexer tests: caller, broker and receiver wired together.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};

use routeway::error::RequestError;
use routeway::pipeline::{Pipeline, RouteDefinition, RouteMethod};
use routeway::rpc::{MemoryBroker, MessageBroker, RpcCallError, RpcClient, RpcClientOptions, RpcRequest, RpcServer};
use routeway::security::{AuthVerifier, AuthenticationOptions, AuthenticationToken};
use routeway::Shutdown;

mod common;

/// Service-side routes: an echo with a path param, a slow route and a
/// route that needs authentication.
fn service_routes() -> Vec<RouteDefinition> {
    vec![
        RouteDefinition::new("send", RouteMethod::Post, "/send/:toId")
            .controller(|payload: Value| async move { Ok::<_, RequestError>(payload) }),
        RouteDefinition::new("slow", RouteMethod::Get, "/slow").controller(|payload: Value| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, RequestError>(json!({"slow": payload}))
        }),
        RouteDefinition::new("whoami", RouteMethod::Get, "/whoami")
            .authentication(AuthenticationOptions::new().roles(["admin"]))
            .controller(|payload: Value| async move { Ok::<_, RequestError>(payload) }),
    ]
}

async fn start_service(broker: &MemoryBroker, queues: &[&str], shutdown: &Shutdown) {
    let (_, services) = common::services();
    let pipelines: Vec<Arc<Pipeline>> = common::compile(&service_routes(), &services);
    let server = RpcServer::new(
        Arc::new(broker.clone()),
        queues.iter().map(|q| q.to_string()).collect(),
        pipelines,
    );
    tokio::spawn(server.run(shutdown.clone()));
}

async fn client(broker: &MemoryBroker, lifetime: Duration) -> RpcClient {
    let broker: Arc<dyn MessageBroker> = Arc::new(broker.clone());
    RpcClient::start(broker, RpcClientOptions { call_lifetime: lifetime })
        .await
        .unwrap()
}

#[tokio::test]
async fn test_call_by_path_and_by_name() {
    let broker = MemoryBroker::new();
    let shutdown = Shutdown::new();
    start_service(&broker, &["messages"], &shutdown).await;
    let client = client(&broker, Duration::from_secs(60)).await;

    let reply = client
        .call("messages", RpcRequest::to_path(RouteMethod::Post, "/send/42", json!({"text": "hi"})))
        .await
        .unwrap();
    assert_eq!(reply.body, json!({"text": "hi", "toId": "42"}));
    assert_eq!(
        reply.headers.get("content-type").map(String::as_str),
        Some("application/json; charset=utf-8")
    );

    let reply = client
        .call("messages", RpcRequest::named("send", json!({"text": "by name"})))
        .await
        .unwrap();
    assert_eq!(reply.body, json!({"text": "by name"}));

    match client
        .call("messages", RpcRequest::to_path(RouteMethod::Post, "/send/42/extra", json!({})))
        .await
    {
        Err(RpcCallError::Remote(envelope)) => {
            assert_eq!(envelope.code, 404);
            assert!(envelope.message.starts_with("unknown request"));
        }
        other => panic!("unexpected result {other:?}"),
    }

    client.stop().await;
    shutdown.trigger();
}

#[tokio::test]
async fn test_out_of_order_replies_reach_their_callers() {
    let broker = MemoryBroker::new();
    let shutdown = Shutdown::new();
    start_service(&broker, &["slow-queue", "fast-queue"], &shutdown).await;
    let client = client(&broker, Duration::from_secs(60)).await;

    let slow = client
        .send("slow-queue", RpcRequest::named("slow", json!({"n": 1})))
        .await
        .unwrap();
    let fast = client
        .send("fast-queue", RpcRequest::named("send", json!({"n": 2})))
        .await
        .unwrap();
    assert_eq!(client.pending_count(), 2);

    let fast_reply = fast.await.unwrap();
    assert_eq!(fast_reply.body, json!({"n": 2}));
    assert_eq!(client.pending_count(), 1);

    let slow_reply = slow.await.unwrap();
    assert_eq!(slow_reply.body, json!({"slow": {"n": 1}}));
    assert_eq!(client.pending_count(), 0);

    client.stop().await;
    shutdown.trigger();
}

#[tokio::test]
async fn test_http_proxy_forwards_token_and_adopts_reply() {
    let broker = MemoryBroker::new();
    let shutdown = Shutdown::new();
    start_service(&broker, &["accounts"], &shutdown).await;
    let client = client(&broker, Duration::from_secs(60)).await;

    let (_, gateway) = common::services();
    let gateway = gateway.with_rpc_client(client.clone());
    let routes = [
        RouteDefinition::new("send", RouteMethod::Post, "/send/:toId").proxy("accounts"),
        RouteDefinition::new("whoami", RouteMethod::Get, "/whoami").proxy("accounts"),
    ];
    let router = common::router(&routes, &gateway);

    let response = common::send(&router, common::post_json("/send/5", &json!({"text": "via http"}))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(common::json_body(response).await, json!({"text": "via http", "toId": "5"}));

    // Remote failures keep their status.
    let response = common::send(&router, common::get("/whoami")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let verifier = AuthVerifier::new(common::SECRET, Duration::from_secs(3600));
    let admin = verifier
        .sign(&AuthenticationToken::issue(vec!["admin".to_string()]))
        .unwrap();
    let request = Request::builder()
        .uri("/whoami")
        .header("authorization", format!("Bearer {admin}"))
        .body(Body::empty())
        .unwrap();
    assert_eq!(common::send(&router, request).await.status(), StatusCode::OK);

    client.stop().await;
    shutdown.trigger();
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_proxy_call_times_out() {
    let broker = MemoryBroker::new();
    let client = client(&broker, Duration::from_secs(5)).await;

    let (_, gateway) = common::services();
    let gateway = gateway.with_rpc_client(client.clone());
    let route = RouteDefinition::new("void", RouteMethod::Get, "/void").proxy("nobody-listens");
    let router = common::router(&[route], &gateway);

    let response = common::send(&router, common::get("/void")).await;
    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    assert_eq!(client.pending_count(), 0);

    client.stop().await;
}
