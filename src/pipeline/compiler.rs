//! Route compilation.
//!
//! # Data Flow
//! ```text
//! RouteDefinition + Services
//!     → Pipeline::compile (checks handler, verifier, client, schema, path)
//!     → [authenticate, accept_files, middlewares.., shape_payload,
//!        validate, rate_limit, cache, controller | proxy]
//!
//! Pipeline::handle(ctx)
//!     → run stages in order
//!     → stop once the response is finalized
//!     → first error aborts and is returned to the adapter
//! ```

use std::sync::Arc;

use crate::cache::Cacher;
use crate::error::RequestError;
use crate::pipeline::context::RequestContext;
use crate::pipeline::route::{RouteDefinition, RouteMethod};
use crate::pipeline::stage::{
    AcceptFilesStage, AuthenticateStage, CacheStage, InvokeStage, ProxyStage, RateLimitStage,
    ShapePayloadStage, Stage, ValidateStage,
};
use crate::rpc::{PathPattern, RpcClient};
use crate::security::{AuthVerifier, RateLimitPolicy, RateLimiter};
use crate::store::{DataStore, ScopedStore};
use crate::validation::{JsonSchemaValidator, SchemaValidator};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("route '{0}' declares both a controller and a proxy target")]
    ConflictingHandlers(String),
    #[error("route '{0}' has neither a controller nor a proxy target")]
    MissingHandler(String),
    #[error("route '{0}' requires authentication but no verifier is configured")]
    MissingVerifier(String),
    #[error("route '{0}' proxies over RPC but no RPC client is configured")]
    MissingRpcClient(String),
    #[error("route '{route}' has an invalid schema: {reason}")]
    InvalidSchema { route: String, reason: String },
    #[error("route '{route}' has an invalid path '{path}': {reason}")]
    InvalidPath {
        route: String,
        path: String,
        reason: String,
    },
}

/// Shared components the stages are built from.
#[derive(Debug, Clone)]
pub struct Services {
    pub rate_limiter: RateLimiter,
    pub cacher: Cacher,
    pub verifier: Option<Arc<AuthVerifier>>,
    pub rpc_client: Option<RpcClient>,
    pub default_rate_limit: RateLimitPolicy,
}

impl Services {
    /// Scope `store` into the `ratelimit` and `cache` namespaces under `prefix`.
    pub fn new(store: Arc<dyn DataStore>, prefix: &str) -> Self {
        let rate_limit_store = ScopedStore::new(store.clone(), prefix, "ratelimit");
        let cache_store = ScopedStore::new(store, prefix, "cache");
        Self {
            rate_limiter: RateLimiter::new(Arc::new(rate_limit_store)),
            cacher: Cacher::new(Arc::new(cache_store)),
            verifier: None,
            rpc_client: None,
            default_rate_limit: RateLimitPolicy::default(),
        }
    }

    pub fn with_verifier(mut self, verifier: AuthVerifier) -> Self {
        self.verifier = Some(Arc::new(verifier));
        self
    }

    pub fn with_rpc_client(mut self, client: RpcClient) -> Self {
        self.rpc_client = Some(client);
        self
    }

    pub fn with_default_rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.default_rate_limit = policy;
        self
    }
}

/// A compiled route: fixed stage order, immutable, shared by both transports.
pub struct Pipeline {
    name: String,
    description: String,
    method: RouteMethod,
    pattern: PathPattern,
    stages: Vec<Arc<dyn Stage>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("method", &self.method)
            .field("path", &self.pattern.template())
            .field("stages", &self.stage_names())
            .finish()
    }
}

impl Pipeline {
    pub fn compile(route: &RouteDefinition, services: &Services) -> Result<Self, CompileError> {
        let name = route.name.clone();

        let pattern = PathPattern::compile(&route.path).map_err(|reason| CompileError::InvalidPath {
            route: name.clone(),
            path: route.path.clone(),
            reason,
        })?;

        let mut stages: Vec<Arc<dyn Stage>> = Vec::new();

        if let Some(options) = &route.authentication {
            let verifier = services
                .verifier
                .clone()
                .ok_or_else(|| CompileError::MissingVerifier(name.clone()))?;
            stages.push(Arc::new(AuthenticateStage {
                verifier,
                options: options.clone(),
            }));
        }

        if route.files {
            stages.push(Arc::new(AcceptFilesStage));
        }

        stages.extend(route.middlewares.iter().cloned());

        if let Some(shaper) = &route.payload {
            stages.push(Arc::new(ShapePayloadStage {
                shaper: shaper.clone(),
            }));
        }

        let validator: Option<Arc<dyn SchemaValidator>> = match (&route.validator, &route.schema) {
            (Some(validator), _) => Some(validator.clone()),
            (None, Some(schema)) => {
                let compiled = JsonSchemaValidator::compile(schema).map_err(|reason| {
                    CompileError::InvalidSchema {
                        route: name.clone(),
                        reason,
                    }
                })?;
                Some(Arc::new(compiled))
            }
            (None, None) => None,
        };
        if let Some(validator) = validator {
            stages.push(Arc::new(ValidateStage { validator }));
        }

        if let Some(options) = &route.rate_limit {
            stages.push(Arc::new(RateLimitStage {
                route: name.clone(),
                limiter: services.rate_limiter.clone(),
                policy: options
                    .policy
                    .clone()
                    .unwrap_or_else(|| services.default_rate_limit.clone()),
                options: options.clone(),
            }));
        }

        if let Some(options) = &route.cache {
            stages.push(Arc::new(CacheStage {
                cacher: services.cacher.clone(),
                options: options.clone(),
            }));
        }

        match (&route.controller, &route.proxy) {
            (Some(_), Some(_)) => return Err(CompileError::ConflictingHandlers(name)),
            (None, None) => return Err(CompileError::MissingHandler(name)),
            (Some(controller), None) => stages.push(Arc::new(InvokeStage {
                controller: controller.clone(),
            })),
            (None, Some(target)) => {
                let client = services
                    .rpc_client
                    .clone()
                    .ok_or_else(|| CompileError::MissingRpcClient(name.clone()))?;
                stages.push(Arc::new(ProxyStage {
                    route: name.clone(),
                    service: target.service.clone(),
                    client,
                }));
            }
        }

        let pipeline = Self {
            name,
            description: route.description.clone(),
            method: route.method,
            pattern,
            stages,
        };
        tracing::debug!(
            route = %pipeline.name,
            method = %pipeline.method,
            path = %pipeline.path(),
            stages = ?pipeline.stage_names(),
            "Route compiled"
        );
        Ok(pipeline)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn method(&self) -> RouteMethod {
        self.method
    }

    pub fn path(&self) -> &str {
        self.pattern.template()
    }

    pub fn pattern(&self) -> &PathPattern {
        &self.pattern
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Run the stages against `ctx`.
    pub async fn handle(&self, mut ctx: RequestContext) -> Result<RequestContext, RequestError> {
        for stage in &self.stages {
            if ctx.response.is_finalized() {
                break;
            }
            if let Err(err) = stage.run(&mut ctx).await {
                tracing::debug!(
                    route = %self.name,
                    stage = stage.name(),
                    status = err.status_code(),
                    error = %err,
                    "Stage failed"
                );
                return Err(err);
            }
        }
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheOptions;
    use crate::pipeline::{ResponseSource, TransportRequest};
    use crate::security::{AuthenticationOptions, AuthenticationToken, RateLimitOptions};
    use crate::store::MemoryStore;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn services() -> Services {
        Services::new(Arc::new(MemoryStore::new()), "test")
    }

    fn echo(payload: Value) -> impl std::future::Future<Output = Result<Value, RequestError>> {
        async move { Ok(payload) }
    }

    fn request(payload: Value) -> RequestContext {
        RequestContext::new(TransportRequest {
            method: Some(RouteMethod::Get),
            path: Some("/items".into()),
            original_url: "/items".into(),
            client_ip: "127.0.0.1".into(),
            payload,
            ..Default::default()
        })
    }

    #[test]
    fn test_handler_errors() {
        let route = RouteDefinition::new("items", RouteMethod::Get, "/items");
        assert_eq!(
            Pipeline::compile(&route, &services()).unwrap_err(),
            CompileError::MissingHandler("items".into())
        );

        let route = route.controller(echo).proxy("svc");
        assert_eq!(
            Pipeline::compile(&route, &services()).unwrap_err(),
            CompileError::ConflictingHandlers("items".into())
        );
    }

    #[test]
    fn test_missing_services() {
        let route = RouteDefinition::new("items", RouteMethod::Get, "/items")
            .controller(echo)
            .authentication(AuthenticationOptions::new());
        assert!(matches!(
            Pipeline::compile(&route, &services()),
            Err(CompileError::MissingVerifier(_))
        ));

        let route = RouteDefinition::new("items", RouteMethod::Get, "/items").proxy("svc");
        assert!(matches!(
            Pipeline::compile(&route, &services()),
            Err(CompileError::MissingRpcClient(_))
        ));
    }

    #[test]
    fn test_invalid_schema_and_path() {
        let route = RouteDefinition::new("items", RouteMethod::Get, "/items")
            .controller(echo)
            .schema(json!({"type": 12}));
        assert!(matches!(
            Pipeline::compile(&route, &services()),
            Err(CompileError::InvalidSchema { .. })
        ));

        let route = RouteDefinition::new("items", RouteMethod::Get, "items").controller(echo);
        assert!(matches!(
            Pipeline::compile(&route, &services()),
            Err(CompileError::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_stage_order() {
        let services = services().with_verifier(AuthVerifier::new("secret", Duration::from_secs(60)));
        let route = RouteDefinition::new("items", RouteMethod::Post, "/items")
            .controller(echo)
            .cache(CacheOptions::new())
            .rate_limit(RateLimitOptions::new())
            .schema(json!({"type": "object"}))
            .payload(|ctx: &RequestContext| Ok(ctx.payload.clone()))
            .middleware(|_ctx: &mut RequestContext| Ok::<(), RequestError>(()))
            .files(true)
            .authentication(AuthenticationOptions::new());

        let pipeline = Pipeline::compile(&route, &services).unwrap();
        assert_eq!(
            pipeline.stage_names(),
            vec![
                "authenticate",
                "accept_files",
                "middleware",
                "shape_payload",
                "validate",
                "rate_limit",
                "cache",
                "controller"
            ]
        );
    }

    #[tokio::test]
    async fn test_finalized_response_skips_remaining_stages() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let route = RouteDefinition::new("items", RouteMethod::Get, "/items")
            .middleware(|ctx: &mut RequestContext| {
                ctx.response.redirect("/elsewhere", Some(301));
                Ok::<(), RequestError>(())
            })
            .controller(move |payload: Value| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, RequestError>(payload) }
            });

        let pipeline = Pipeline::compile(&route, &services()).unwrap();
        let ctx = pipeline.handle(request(json!({}))).await.unwrap();
        assert_eq!(ctx.response.status, 301);
        assert_eq!(ctx.response.source, ResponseSource::Middleware);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_error_aborts_pipeline() {
        let route = RouteDefinition::new("items", RouteMethod::Get, "/items")
            .middleware(|_ctx: &mut RequestContext| Err::<(), _>(RequestError::forbidden("no")))
            .controller(echo);

        let pipeline = Pipeline::compile(&route, &services()).unwrap();
        let err = pipeline.handle(request(json!({}))).await.unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn test_authenticators_run_in_order_and_mutate_payload() {
        let verifier = AuthVerifier::new("secret", Duration::from_secs(60));
        let token = verifier.sign(&AuthenticationToken::issue(vec![])).unwrap();

        let options = AuthenticationOptions::new()
            .authenticator(|_token: &AuthenticationToken, payload: &mut Value| {
                payload["trail"] = json!(["first"]);
                true
            })
            .authenticator(|_token: &AuthenticationToken, payload: &mut Value| {
                match payload["trail"].as_array_mut() {
                    Some(trail) => trail.push(json!("second")),
                    None => return false,
                }
                true
            });

        let route = RouteDefinition::new("items", RouteMethod::Get, "/items")
            .authentication(options)
            .controller(echo);
        let pipeline = Pipeline::compile(&route, &services().with_verifier(verifier)).unwrap();

        let mut ctx = request(json!({}));
        ctx.request.authorization = Some(format!("Bearer {token}"));
        let ctx = pipeline.handle(ctx).await.unwrap();
        assert_eq!(ctx.response.body, Some(json!({"trail": ["first", "second"]})));
        assert!(ctx.authentication.is_some());
    }
}
