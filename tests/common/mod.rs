//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use routeway::pipeline::{Pipeline, RouteDefinition, Services};
use routeway::security::AuthVerifier;
use routeway::store::{DataStore, MemoryStore};
use routeway::{HttpServer, RoutewayConfig};

pub const SECRET: &str = "integration-secret";

/// Services over a fresh in-memory store, with a verifier for `SECRET`.
pub fn services() -> (Arc<MemoryStore>, Services) {
    let store = Arc::new(MemoryStore::new());
    let shared: Arc<dyn DataStore> = store.clone();
    let services = Services::new(shared, "test")
        .with_verifier(AuthVerifier::new(SECRET, Duration::from_secs(3600)));
    (store, services)
}

pub fn compile(routes: &[RouteDefinition], services: &Services) -> Vec<Arc<Pipeline>> {
    routes
        .iter()
        .map(|route| Arc::new(Pipeline::compile(route, services).unwrap()))
        .collect()
}

/// Router serving `routes` with default config.
pub fn router(routes: &[RouteDefinition], services: &Services) -> Router {
    HttpServer::new(RoutewayConfig::default(), &compile(routes, services)).router()
}

pub async fn send(router: &Router, request: Request<Body>) -> Response<Body> {
    router.clone().oneshot(request).await.unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-forwarded-for", "10.1.1.1")
        .body(Body::empty())
        .unwrap()
}

pub fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-forwarded-for", "10.1.1.1")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
