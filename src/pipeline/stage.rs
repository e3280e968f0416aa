//! Pipeline stages.
//!
//! Every step of a compiled route is a [`Stage`]. Built-in stages wrap the
//! limiter, the cacher, the verifier and the controller; custom middlewares
//! implement the same trait (or are plain closures).

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{FromRequest, Multipart};
use axum::http::{header, Request};
use serde_json::{Map, Value};

use crate::cache::{CacheOptions, CacheWriteBack, Cacher};
use crate::error::{ErrorKind, RequestError};
use crate::observability::metrics;
use crate::pipeline::context::{RequestContext, ResponseSource, Transport, UploadedFile};
use crate::pipeline::route::{Controller, PayloadShaper};
use crate::rpc::{RpcCallError, RpcClient, RpcRequest};
use crate::security::auth::extract_token;
use crate::security::{AuthVerifier, AuthenticationOptions, RateLimitOptions, RateLimitPolicy, RateLimiter};
use crate::validation::SchemaValidator;

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str {
        "middleware"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<(), RequestError>;
}

#[async_trait]
impl<F> Stage for F
where
    F: Fn(&mut RequestContext) -> Result<(), RequestError> + Send + Sync,
{
    async fn run(&self, ctx: &mut RequestContext) -> Result<(), RequestError> {
        (self)(ctx)
    }
}

pub struct AuthenticateStage {
    pub(crate) verifier: Arc<AuthVerifier>,
    pub(crate) options: AuthenticationOptions,
}

#[async_trait]
impl Stage for AuthenticateStage {
    fn name(&self) -> &str {
        "authenticate"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<(), RequestError> {
        let authentication = self
            .verifier
            .verify(&self.options, ctx.request.authorization.as_deref(), &mut ctx.payload)
            .await?;
        ctx.authentication = Some(authentication);
        Ok(())
    }
}

/// Parses `multipart/form-data` bodies. Text fields join the payload.
pub struct AcceptFilesStage;

#[async_trait]
impl Stage for AcceptFilesStage {
    fn name(&self) -> &str {
        "accept_files"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<(), RequestError> {
        if ctx.request.transport == Transport::Rpc {
            return Ok(());
        }
        let Some(content_type) = ctx
            .request
            .content_type
            .clone()
            .filter(|ct| ct.starts_with("multipart/form-data"))
        else {
            return Ok(());
        };

        let request = Request::builder()
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(ctx.request.body.clone()))
            .map_err(|e| RequestError::bad_request(e.to_string()))?;
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| RequestError::bad_request(e.body_text()))?;

        let mut fields = Map::new();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| RequestError::bad_request(e.body_text()))?
        {
            let field_name = field.name().unwrap_or_default().to_string();
            let file_name = field.file_name().map(str::to_string);
            let field_content_type = field.content_type().map(str::to_string);

            if file_name.is_some() {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| RequestError::bad_request(e.body_text()))?;
                ctx.files.push(UploadedFile {
                    field_name,
                    file_name,
                    content_type: field_content_type,
                    data,
                });
            } else {
                let text = field
                    .text()
                    .await
                    .map_err(|e| RequestError::bad_request(e.body_text()))?;
                fields.insert(field_name, Value::String(text));
            }
        }

        tracing::debug!(files = ctx.files.len(), fields = fields.len(), "Multipart body accepted");
        match &mut ctx.payload {
            Value::Object(payload) => payload.extend(fields),
            other => *other = Value::Object(fields),
        }
        Ok(())
    }
}

pub struct ShapePayloadStage {
    pub(crate) shaper: PayloadShaper,
}

#[async_trait]
impl Stage for ShapePayloadStage {
    fn name(&self) -> &str {
        "shape_payload"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<(), RequestError> {
        ctx.payload = (self.shaper)(ctx)?;
        Ok(())
    }
}

pub struct ValidateStage {
    pub(crate) validator: Arc<dyn SchemaValidator>,
}

#[async_trait]
impl Stage for ValidateStage {
    fn name(&self) -> &str {
        "validate"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<(), RequestError> {
        let payload = std::mem::take(&mut ctx.payload);
        ctx.payload = self.validator.validate(payload)?;
        Ok(())
    }
}

pub struct RateLimitStage {
    pub(crate) route: String,
    pub(crate) limiter: RateLimiter,
    pub(crate) policy: RateLimitPolicy,
    pub(crate) options: RateLimitOptions,
}

impl RateLimitStage {
    fn key(&self, ctx: &RequestContext) -> String {
        match &self.options.key_generator {
            Some(generate) => generate(ctx),
            None => default_rate_limit_key(ctx),
        }
    }
}

/// `ratelimit_{ip}_{method}_{originalUrl}`
pub fn default_rate_limit_key(ctx: &RequestContext) -> String {
    let request = &ctx.request;
    format!(
        "ratelimit_{}_{}_{}",
        request.client_ip,
        request.method_str(),
        request.original_url
    )
}

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &str {
        "rate_limit"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<(), RequestError> {
        let key = self.key(ctx);
        let outcome = match self.limiter.limit(&key, &self.policy).await {
            Ok(outcome) => outcome,
            Err(err) => {
                if err.kind == ErrorKind::TooManyRequests {
                    metrics::record_rate_limited(&self.route);
                }
                return Err(err);
            }
        };

        if let Some(outcome) = outcome {
            let response = &mut ctx.response;
            response.set_header("X-Rate-Limit-Limit", outcome.requests_allowed_before_limit.to_string());
            response.set_header("X-Rate-Limit-Remaining", outcome.remaining().to_string());
            response.set_header("X-Rate-Limit-Reset", outcome.wait_time.as_secs().to_string());
            response.set_header(
                "X-Rate-Limit-Wait",
                (outcome.response_delay.as_millis() as f64 / 1000.0).round().to_string(),
            );
            ctx.rate_limit = Some(outcome);
        }
        Ok(())
    }
}

pub struct CacheStage {
    pub(crate) cacher: Cacher,
    pub(crate) options: CacheOptions,
}

#[async_trait]
impl Stage for CacheStage {
    fn name(&self) -> &str {
        "cache"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<(), RequestError> {
        let key = self.options.key_for(ctx);

        match self.cacher.retrieve(&key).await? {
            Some(cached) => {
                tracing::debug!(key = %key, "Serving cached response");
                ctx.response.content_type = cached.header_content_type;
                ctx.response.finalize(Some(cached.body), ResponseSource::Cache);
            }
            None => {
                ctx.defer(CacheWriteBack::new(self.cacher.clone(), key.clone(), self.options.expire));
                ctx.cache_key = Some(key);
            }
        }
        Ok(())
    }
}

pub struct InvokeStage {
    pub(crate) controller: Arc<dyn Controller>,
}

#[async_trait]
impl Stage for InvokeStage {
    fn name(&self) -> &str {
        "controller"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<(), RequestError> {
        let body = self.controller.handle(ctx).await?;
        // A controller may already have finalized (e.g. a redirect).
        if !ctx.response.is_finalized() {
            let body = (!body.is_null()).then_some(body);
            ctx.response.finalize(body, ResponseSource::Handler);
        }
        Ok(())
    }
}

/// Forwards the request to a remote service queue and adopts its reply.
pub struct ProxyStage {
    pub(crate) route: String,
    pub(crate) service: String,
    pub(crate) client: RpcClient,
}

impl ProxyStage {
    fn forward_request(&self, ctx: &RequestContext) -> RpcRequest {
        let request = &ctx.request;
        let mut forwarded = RpcRequest {
            name: request.name.clone(),
            method: request.method,
            path: request.path.clone(),
            payload: ctx.payload.clone(),
            authentication_token: request
                .authorization
                .as_deref()
                .and_then(extract_token)
                .map(str::to_string),
            ip: (!request.client_ip.is_empty()).then(|| request.client_ip.clone()),
        };
        if !forwarded.is_addressable() {
            forwarded.name = Some(self.route.clone());
        }
        forwarded
    }
}

#[async_trait]
impl Stage for ProxyStage {
    fn name(&self) -> &str {
        "proxy"
    }

    async fn run(&self, ctx: &mut RequestContext) -> Result<(), RequestError> {
        let request = self.forward_request(ctx);

        match self.client.call(&self.service, request).await {
            Ok(reply) => {
                for (name, value) in reply.headers {
                    if name.eq_ignore_ascii_case("content-type") {
                        ctx.response.content_type = Some(value);
                    } else {
                        ctx.response.set_header(name, value);
                    }
                }
                let body = (!reply.body.is_null()).then_some(reply.body);
                ctx.response.finalize(body, ResponseSource::Handler);
                Ok(())
            }
            Err(RpcCallError::Remote(envelope)) => Err(envelope.to_request_error()),
            Err(RpcCallError::Timeout) => Err(RequestError::new(
                ErrorKind::RequestTimeout,
                format!("service '{}' did not reply in time", self.service),
            )),
            Err(e) => {
                tracing::error!(service = %self.service, error = %e, "Proxy call failed");
                Err(RequestError::internal(format!("service '{}' unavailable", self.service)))
            }
        }
    }
}
