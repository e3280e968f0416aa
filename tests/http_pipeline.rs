//! End-to-end tests of compiled pipelines behind the HTTP adapter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};

use routeway::cache::CacheOptions;
use routeway::error::RequestError;
use routeway::pipeline::{RequestContext, RouteDefinition, RouteMethod};
use routeway::security::{
    AuthVerifier, AuthenticationOptions, AuthenticationToken, RateLimitOptions, RateLimitPolicy,
};
use routeway::store::DataStore;
use routeway::{HttpServer, RoutewayConfig, Shutdown};

mod common;

fn echo_route(name: &str, method: RouteMethod, path: &str) -> RouteDefinition {
    RouteDefinition::new(name, method, path)
        .controller(|payload: Value| async move { Ok::<_, RequestError>(payload) })
}

fn token(roles: &[&str]) -> String {
    let verifier = AuthVerifier::new(common::SECRET, Duration::from_secs(3600));
    let roles = roles.iter().map(|r| r.to_string()).collect();
    verifier.sign(&AuthenticationToken::issue(roles)).unwrap()
}

#[tokio::test]
async fn test_path_query_and_body_reach_the_controller() {
    let (_, services) = common::services();
    let router = common::router(&[echo_route("update", RouteMethod::Post, "/items/:id")], &services);

    let response = common::send(&router, common::post_json("/items/7?page=2", &json!({"name": "widget"}))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/json; charset=utf-8");
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(
        common::json_body(response).await,
        json!({"id": "7", "page": "2", "name": "widget"})
    );
}

#[tokio::test]
async fn test_unknown_route_is_json_404() {
    let (_, services) = common::services();
    let router = common::router(&[echo_route("items", RouteMethod::Get, "/items")], &services);

    let response = common::send(&router, common::get("/missing")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = common::json_body(response).await;
    assert_eq!(body["code"], 404);
    assert_eq!(body["status"], "Not Found");
}

#[tokio::test]
async fn test_authentication_and_roles() {
    let (_, services) = common::services();
    let routes = [
        echo_route("me", RouteMethod::Get, "/me").authentication(AuthenticationOptions::new()),
        echo_route("admin", RouteMethod::Get, "/admin")
            .authentication(AuthenticationOptions::new().roles(["admin"])),
    ];
    let router = common::router(&routes, &services);

    let response = common::send(&router, common::get("/me")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        common::json_body(response).await,
        json!({"code": 401, "message": "unauthorized", "metadata": {}, "status": "Unauthorized"})
    );

    let with_token = |uri: &str, token: &str| {
        Request::builder()
            .uri(uri)
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    };

    let user = token(&["user"]);
    assert_eq!(common::send(&router, with_token("/me", &user)).await.status(), StatusCode::OK);
    assert_eq!(
        common::send(&router, with_token("/admin", &user)).await.status(),
        StatusCode::FORBIDDEN
    );

    let admin = token(&["admin"]);
    assert_eq!(common::send(&router, with_token("/admin", &admin)).await.status(), StatusCode::OK);
    assert_eq!(
        common::send(&router, with_token("/me", "not-a-jwt")).await.status(),
        StatusCode::UNAUTHORIZED
    );
}

#[tokio::test]
async fn test_rate_limit_ceiling() {
    let (_, services) = common::services();
    let policy = RateLimitPolicy {
        wait_time: Duration::from_secs(60),
        requests_allowed_before_delay: 10,
        max_delay: Duration::from_secs(1),
        requests_allowed_before_limit: 2,
        message: "Too many requests, please try again later".into(),
    };
    let route = echo_route("limited", RouteMethod::Get, "/limited")
        .rate_limit(RateLimitOptions::new().policy(policy));
    let router = common::router(&[route], &services);

    for remaining in ["1", "0"] {
        let response = common::send(&router, common::get("/limited")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-rate-limit-limit"], "2");
        assert_eq!(response.headers()["x-rate-limit-remaining"], remaining);
        assert_eq!(response.headers()["x-rate-limit-reset"], "60");
    }

    let response = common::send(&router, common::get("/limited")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response.headers()["retry-after"].to_str().unwrap().parse().unwrap();
    assert!(retry_after > 0);
    let body = common::json_body(response).await;
    assert_eq!(body["message"], "Too many requests, please try again later");
    assert!(body["metadata"]["retryAfter"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_rate_limit_keys_are_per_client() {
    let (_, services) = common::services();
    let policy = RateLimitPolicy {
        requests_allowed_before_limit: 1,
        ..RateLimitPolicy::default()
    };
    let route = echo_route("limited", RouteMethod::Get, "/limited")
        .rate_limit(RateLimitOptions::new().policy(policy));
    let router = common::router(&[route], &services);

    let from = |ip: &str| {
        Request::builder()
            .uri("/limited")
            .header("x-forwarded-for", ip)
            .body(Body::empty())
            .unwrap()
    };
    assert_eq!(common::send(&router, from("1.1.1.1")).await.status(), StatusCode::OK);
    assert_eq!(common::send(&router, from("2.2.2.2")).await.status(), StatusCode::OK);
    assert_eq!(
        common::send(&router, from("1.1.1.1")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn test_cache_aside_serves_second_request_from_store() {
    let (store, services) = common::services();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let route = RouteDefinition::new("report", RouteMethod::Get, "/report")
        .cache(CacheOptions::new().expire(Duration::from_secs(30)))
        .controller(move |_payload: Value| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok::<_, RequestError>(json!({"generation": n})) }
        });
    let router = common::router(&[route], &services);

    let first = common::json_body(common::send(&router, common::get("/report")).await).await;
    let second = common::send(&router, common::get("/report")).await;
    assert_eq!(second.headers()["content-type"], "application/json; charset=utf-8");
    let second = common::json_body(second).await;

    assert_eq!(first, json!({"generation": 1}));
    assert_eq!(second, first);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let key = "test_cache_cache_10.1.1.1_GET_/report";
    let ttl = store.ttl(key).await.unwrap();
    assert!(ttl > 0 && ttl <= 30);
}

#[tokio::test]
async fn test_errors_are_not_cached() {
    let (store, services) = common::services();
    let route = RouteDefinition::new("broken", RouteMethod::Get, "/broken")
        .cache(CacheOptions::new())
        .controller(|_payload: Value| async move { Err::<Value, _>(RequestError::internal("boom")) });
    let router = common::router(&[route], &services);

    let response = common::send(&router, common::get("/broken")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_schema_normalizes_and_rejects() {
    let (_, services) = common::services();
    let schema = json!({
        "type": "object",
        "properties": {
            "count": {"type": "integer"},
            "label": {"type": "string", "default": "none"}
        },
        "required": ["count"]
    });
    let route = echo_route("counter", RouteMethod::Post, "/counter").schema(schema);
    let router = common::router(&[route], &services);

    let response = common::send(&router, common::post_json("/counter", &json!({"count": "5", "extra": true}))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(common::json_body(response).await, json!({"count": 5, "label": "none"}));

    let response = common::send(&router, common::post_json("/counter", &json!({"label": "x"}))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = common::json_body(response).await;
    assert_eq!(body["message"], "Invalid payload");
    assert!(!body["metadata"]["errors"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_payload_shaper_and_redirect_middleware() {
    let (_, services) = common::services();
    let routes = [
        RouteDefinition::new("shaped", RouteMethod::Get, "/shaped/:id")
            .payload(|ctx: &RequestContext| {
                Ok(json!({"id": ctx.request.params.get("id"), "ip": ctx.request.client_ip}))
            })
            .controller(|payload: Value| async move { Ok::<_, RequestError>(payload) }),
        echo_route("old", RouteMethod::Get, "/old").middleware(|ctx: &mut RequestContext| {
            ctx.response.redirect("/new", None);
            Ok::<(), RequestError>(())
        }),
    ];
    let router = common::router(&routes, &services);

    let response = common::send(&router, common::get("/shaped/9?ignored=1")).await;
    assert_eq!(common::json_body(response).await, json!({"id": "9", "ip": "10.1.1.1"}));

    let response = common::send(&router, common::get("/old")).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()["location"], "/new");
}

#[tokio::test]
async fn test_live_server_with_graceful_shutdown() {
    let (_, services) = common::services();
    let pipelines = common::compile(&[echo_route("ping", RouteMethod::Get, "/ping")], &services);
    let server = HttpServer::new(RoutewayConfig::default(), &pipelines);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let running = tokio::spawn(server.run(listener, shutdown.clone()));

    let body: Value = reqwest::get(format!("http://{addr}/ping?x=1"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body, json!({"x": "1"}));

    shutdown.trigger();
    running.await.unwrap().unwrap();
}
