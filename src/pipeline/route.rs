//! Route definitions.
//!
//! A `RouteDefinition` is assembled with a builder at setup time and never
//! mutated afterwards. Everything callable sits behind an `Arc`, so cloning a
//! definition is cheap.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::CacheOptions;
use crate::error::RequestError;
use crate::pipeline::context::RequestContext;
use crate::pipeline::stage::Stage;
use crate::security::{AuthenticationOptions, RateLimitOptions};
use crate::validation::SchemaValidator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RouteMethod {
    #[serde(alias = "get")]
    Get,
    #[serde(alias = "post")]
    Post,
    #[serde(alias = "put")]
    Put,
    #[serde(alias = "patch")]
    Patch,
    #[serde(alias = "delete")]
    Delete,
}

impl RouteMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteMethod::Get => "GET",
            RouteMethod::Post => "POST",
            RouteMethod::Put => "PUT",
            RouteMethod::Patch => "PATCH",
            RouteMethod::Delete => "DELETE",
        }
    }

    /// Case-insensitive parse; unknown methods yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "GET" => Some(RouteMethod::Get),
            "POST" => Some(RouteMethod::Post),
            "PUT" => Some(RouteMethod::Put),
            "PATCH" => Some(RouteMethod::Patch),
            "DELETE" => Some(RouteMethod::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for RouteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Produces the response body for a matched request.
///
/// Any `Fn(Value) -> impl Future<Output = Result<Value, RequestError>>`
/// is a controller that receives the shaped payload.
#[async_trait]
pub trait Controller: Send + Sync {
    async fn handle(&self, ctx: &mut RequestContext) -> Result<Value, RequestError>;
}

#[async_trait]
impl<F, Fut> Controller for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, RequestError>> + Send,
{
    async fn handle(&self, ctx: &mut RequestContext) -> Result<Value, RequestError> {
        (self)(ctx.payload.clone()).await
    }
}

/// Builds the payload from the normalized request.
pub type PayloadShaper = Arc<dyn Fn(&RequestContext) -> Result<Value, RequestError> + Send + Sync>;

/// Forward the request over RPC instead of running a local controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    /// Destination queue of the remote service.
    pub service: String,
}

#[derive(Clone)]
pub struct RouteDefinition {
    pub name: String,
    pub description: String,
    pub method: RouteMethod,
    pub path: String,
    pub controller: Option<Arc<dyn Controller>>,
    pub proxy: Option<ProxyTarget>,
    pub authentication: Option<AuthenticationOptions>,
    pub files: bool,
    pub middlewares: Vec<Arc<dyn Stage>>,
    pub payload: Option<PayloadShaper>,
    pub schema: Option<Value>,
    pub validator: Option<Arc<dyn SchemaValidator>>,
    pub rate_limit: Option<RateLimitOptions>,
    pub cache: Option<CacheOptions>,
}

impl RouteDefinition {
    pub fn new(name: impl Into<String>, method: RouteMethod, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            method,
            path: path.into(),
            controller: None,
            proxy: None,
            authentication: None,
            files: false,
            middlewares: Vec::new(),
            payload: None,
            schema: None,
            validator: None,
            rate_limit: None,
            cache: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn controller(mut self, controller: impl Controller + 'static) -> Self {
        self.controller = Some(Arc::new(controller));
        self
    }

    pub fn proxy(mut self, service: impl Into<String>) -> Self {
        self.proxy = Some(ProxyTarget {
            service: service.into(),
        });
        self
    }

    pub fn authentication(mut self, options: AuthenticationOptions) -> Self {
        self.authentication = Some(options);
        self
    }

    pub fn files(mut self, accept: bool) -> Self {
        self.files = accept;
        self
    }

    /// Append a custom stage; stages run in the order they were added.
    pub fn middleware(mut self, stage: impl Stage + 'static) -> Self {
        self.middlewares.push(Arc::new(stage));
        self
    }

    pub fn payload<F>(mut self, shaper: F) -> Self
    where
        F: Fn(&RequestContext) -> Result<Value, RequestError> + Send + Sync + 'static,
    {
        self.payload = Some(Arc::new(shaper));
        self
    }

    /// JSON schema compiled at pipeline compilation time.
    pub fn schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Custom validator; takes precedence over `schema`.
    pub fn validator(mut self, validator: impl SchemaValidator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn rate_limit(mut self, options: RateLimitOptions) -> Self {
        self.rate_limit = Some(options);
        self
    }

    pub fn cache(mut self, options: CacheOptions) -> Self {
        self.cache = Some(options);
        self
    }
}

impl fmt::Debug for RouteDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteDefinition")
            .field("name", &self.name)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("controller", &self.controller.is_some())
            .field("proxy", &self.proxy)
            .field("authentication", &self.authentication)
            .field("files", &self.files)
            .field("middlewares", &self.middlewares.len())
            .field("rate_limit", &self.rate_limit)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}
