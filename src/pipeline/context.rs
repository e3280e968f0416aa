//! Per-request state threaded through the pipeline.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use axum::body::Bytes;
use serde_json::Value;

use crate::pipeline::route::RouteMethod;
use crate::security::{Authentication, RateLimitOutcome};

pub const DEFAULT_CONTENT_TYPE: &str = "application/json; charset=utf-8";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Http,
    Rpc,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Http => "http",
            Transport::Rpc => "rpc",
        }
    }
}

/// A request normalized by a transport adapter.
#[derive(Debug, Clone, Default)]
pub struct TransportRequest {
    pub transport: Transport,
    /// Logical route name (RPC only).
    pub name: Option<String>,
    pub method: Option<RouteMethod>,
    pub path: Option<String>,
    /// Path plus query string as received.
    pub original_url: String,
    pub client_ip: String,
    /// Lowercased header names.
    pub headers: BTreeMap<String, String>,
    pub params: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Bytes,
    pub content_type: Option<String>,
    /// Raw `Authorization` header, or the token an RPC caller passed.
    pub authorization: Option<String>,
    /// Initial payload before any shaping.
    pub payload: Value,
}

impl TransportRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn method_str(&self) -> &str {
        self.method.map(RouteMethod::as_str).unwrap_or("")
    }
}

/// Which step produced the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseSource {
    #[default]
    Pending,
    Handler,
    Cache,
    Middleware,
}

/// Response under construction. Adapters render it once the pipeline ends.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseAccumulator {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub content_type: Option<String>,
    pub source: ResponseSource,
    finalized: bool,
}

impl Default for ResponseAccumulator {
    fn default() -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
            body: None,
            content_type: None,
            source: ResponseSource::Pending,
            finalized: false,
        }
    }
}

impl ResponseAccumulator {
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Fix the body; later stages are skipped.
    pub fn finalize(&mut self, body: Option<Value>, source: ResponseSource) {
        self.body = body;
        self.source = source;
        self.finalized = true;
    }

    /// Finalize as a redirect to `location` (302 unless given).
    pub fn redirect(&mut self, location: impl Into<String>, status: Option<u16>) {
        self.status = status.unwrap_or(302);
        self.set_header("location", location);
        self.finalize(None, ResponseSource::Middleware);
    }

    pub fn content_type_or_default(&self) -> &str {
        self.content_type.as_deref().unwrap_or(DEFAULT_CONTENT_TYPE)
    }
}

/// A file received through a multipart request.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedFile {
    pub field_name: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// Work to run after the final response is known.
#[async_trait]
pub trait DeferredAction: Send + Sync {
    async fn run(&self, response: &ResponseAccumulator);
}

pub struct RequestContext {
    pub request: TransportRequest,
    pub payload: Value,
    pub files: Vec<UploadedFile>,
    pub authentication: Option<Authentication>,
    pub response: ResponseAccumulator,
    pub rate_limit: Option<RateLimitOutcome>,
    pub cache_key: Option<String>,
    deferred: Vec<Box<dyn DeferredAction>>,
}

impl RequestContext {
    pub fn new(request: TransportRequest) -> Self {
        let payload = request.payload.clone();
        Self {
            request,
            payload,
            files: Vec::new(),
            authentication: None,
            response: ResponseAccumulator::default(),
            rate_limit: None,
            cache_key: None,
            deferred: Vec::new(),
        }
    }

    pub fn defer(&mut self, action: impl DeferredAction + 'static) {
        self.deferred.push(Box::new(action));
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.len()
    }

    /// Run deferred actions against the final response.
    ///
    /// Adapters call this after fixing the status and body they send.
    pub async fn complete(&mut self) {
        for action in self.deferred.drain(..) {
            action.run(&self.response).await;
        }
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request", &self.request)
            .field("payload", &self.payload)
            .field("files", &self.files.len())
            .field("authenticated", &self.authentication.is_some())
            .field("response", &self.response)
            .field("deferred", &self.deferred.len())
            .finish()
    }
}
