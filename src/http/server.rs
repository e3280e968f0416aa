//! HTTP server setup.
//!
//! # Responsibilities
//! - Register one axum route per compiled pipeline
//! - Normalize axum requests into `TransportRequest`
//! - Wire up middleware (tracing, timeout, request ID, CORS, body limit)
//! - Serve over plain TCP or rustls with graceful shutdown

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request};
use axum::http::{header, HeaderValue, Method};
use axum::response::Response;
use axum::routing::{on, MethodFilter, MethodRouter};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::{CorsConfig, RoutewayConfig};
use crate::error::RequestError;
use crate::http::response::{error_response, pipeline_response};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;
use crate::pipeline::{Pipeline, RequestContext, RouteMethod, Transport, TransportRequest};

#[derive(Clone)]
struct RouteState {
    pipeline: Arc<Pipeline>,
    max_body_size: usize,
}

/// HTTP transport adapter.
pub struct HttpServer {
    router: Router,
    config: RoutewayConfig,
}

impl HttpServer {
    /// Build the router for `pipelines`. The first pipeline registered for a
    /// method and path wins.
    pub fn new(config: RoutewayConfig, pipelines: &[Arc<Pipeline>]) -> Self {
        let router = Self::build_router(&config, pipelines);
        Self { router, config }
    }

    #[allow(deprecated)]
    fn build_router(config: &RoutewayConfig, pipelines: &[Arc<Pipeline>]) -> Router {
        let mut routes: BTreeMap<String, MethodRouter> = BTreeMap::new();
        let mut registered = HashSet::new();

        for pipeline in pipelines {
            let axum_path = pipeline.pattern().axum_path();
            if !registered.insert((axum_path.clone(), pipeline.method())) {
                tracing::warn!(
                    route = %pipeline.name(),
                    method = %pipeline.method(),
                    path = %pipeline.path(),
                    "Duplicate HTTP route skipped"
                );
                continue;
            }

            let state = RouteState {
                pipeline: pipeline.clone(),
                max_body_size: config.listener.max_body_size,
            };
            let handler = move |request: Request| {
                let state = state.clone();
                async move { serve_route(state, request).await }
            };

            let filter = method_filter(pipeline.method());
            let method_router = match routes.remove(&axum_path) {
                Some(existing) => existing.on(filter, handler),
                None => on(filter, handler),
            };
            routes.insert(axum_path, method_router);
        }

        let mut router = Router::new();
        for (path, method_router) in routes {
            router = router.route(&path, method_router);
        }

        router
            .fallback(not_found)
            .layer(RequestBodyLimitLayer::new(config.listener.max_body_size))
            .layer(cors_layer(&config.cors))
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// The router, for serving elsewhere or driving with `oneshot` in tests.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn config(&self) -> &RoutewayConfig {
        &self.config
    }

    /// Serve plain HTTP on `listener` until `shutdown` fires.
    pub async fn run(self, listener: TcpListener, shutdown: Shutdown) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Serve HTTPS on `addr` until `shutdown` fires.
    pub async fn run_tls(
        self,
        addr: SocketAddr,
        tls: RustlsConfig,
        shutdown: Shutdown,
    ) -> Result<(), std::io::Error> {
        tracing::info!(address = %addr, "HTTPS server starting");

        let handle = axum_server::Handle::new();
        let stopper = handle.clone();
        tokio::spawn(async move {
            shutdown.wait().await;
            stopper.graceful_shutdown(Some(Duration::from_secs(30)));
        });

        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(self.router.into_make_service_with_connect_info::<SocketAddr>())
            .await?;

        tracing::info!("HTTPS server stopped");
        Ok(())
    }
}

fn method_filter(method: RouteMethod) -> MethodFilter {
    match method {
        RouteMethod::Get => MethodFilter::GET,
        RouteMethod::Post => MethodFilter::POST,
        RouteMethod::Put => MethodFilter::PUT,
        RouteMethod::Patch => MethodFilter::PATCH,
        RouteMethod::Delete => MethodFilter::DELETE,
    }
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    if config.allowed_origins.is_empty() {
        return CorsLayer::new();
    }
    let origin = if config.allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(
            config
                .allowed_origins
                .iter()
                .filter_map(|o| HeaderValue::from_str(o).ok()),
        )
    };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE])
        .allow_headers(Any)
}

async fn not_found(request: Request) -> Response {
    tracing::debug!(method = %request.method(), path = %request.uri().path(), "No route matched");
    error_response(&RequestError::not_found(format!(
        "cannot {} {}",
        request.method(),
        request.uri().path()
    )))
}

async fn serve_route(state: RouteState, request: Request) -> Response {
    let started = Instant::now();
    let pipeline = &state.pipeline;

    let result = match normalize(&state, request).await {
        Ok(transport_request) => pipeline.handle(RequestContext::new(transport_request)).await,
        Err(err) => Err(err),
    };

    let (response, ctx) = match result {
        Ok(ctx) => (pipeline_response(&ctx.response), Some(ctx)),
        Err(err) => {
            if err.status_code() >= 500 {
                tracing::error!(route = %pipeline.name(), error = %err, "Request failed");
            }
            (error_response(&err), None)
        }
    };

    let status = response.status().as_u16();
    metrics::record_request("http", pipeline.name(), status, started.elapsed());
    tracing::debug!(
        route = %pipeline.name(),
        status,
        duration_ms = started.elapsed().as_millis() as u64,
        "HTTP request handled"
    );

    if let Some(mut ctx) = ctx {
        ctx.complete().await;
    }
    response
}

async fn normalize(state: &RouteState, request: Request) -> Result<TransportRequest, RequestError> {
    let (parts, body) = request.into_parts();

    let path = parts.uri.path().to_string();
    let original_url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    let mut headers: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in &parts.headers {
        let Ok(value) = value.to_str() else { continue };
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    let client_ip = headers
        .get("x-forwarded-for")
        .and_then(|xff| xff.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .or_else(|| {
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_default();

    let query: BTreeMap<String, String> = parts
        .uri
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    let params = state.pipeline.pattern().captures(&path).unwrap_or_default();
    let content_type = headers.get(header::CONTENT_TYPE.as_str()).cloned();
    let authorization = headers.get(header::AUTHORIZATION.as_str()).cloned();

    let body = axum::body::to_bytes(body, state.max_body_size)
        .await
        .map_err(|e| RequestError::bad_request(format!("cannot read request body: {e}")))?;

    let payload = build_payload(&query, content_type.as_deref(), &body, &params)?;

    Ok(TransportRequest {
        transport: Transport::Http,
        name: None,
        method: RouteMethod::parse(parts.method.as_str()),
        path: Some(path),
        original_url,
        client_ip,
        headers,
        params,
        query,
        body,
        content_type,
        authorization,
        payload,
    })
}

/// Query, then body fields, then path params; later sources win.
fn build_payload(
    query: &BTreeMap<String, String>,
    content_type: Option<&str>,
    body: &[u8],
    params: &BTreeMap<String, String>,
) -> Result<Value, RequestError> {
    let mut payload: Map<String, Value> = query
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    let content_type = content_type.unwrap_or_default();
    if !body.is_empty() {
        if content_type.starts_with("application/x-www-form-urlencoded") {
            for (k, v) in url::form_urlencoded::parse(body) {
                payload.insert(k.into_owned(), Value::String(v.into_owned()));
            }
        } else if content_type.is_empty() || content_type.contains("json") {
            let parsed: Value = serde_json::from_slice(body)
                .map_err(|e| RequestError::bad_request(format!("invalid JSON body: {e}")))?;
            match parsed {
                Value::Object(fields) => payload.extend(fields),
                other => {
                    payload.insert("body".to_string(), other);
                }
            }
        }
    }

    for (k, v) in params {
        payload.insert(k.clone(), Value::String(v.clone()));
    }
    Ok(Value::Object(payload))
}
