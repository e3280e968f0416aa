//! Cache-aside response memoization.
//!
//! # Data Flow
//! ```text
//! Cache stage:
//!     key = key_generator(ctx) or default_cache_key(ctx)
//!     → Cacher::retrieve(key)
//!         hit  → response finalized from cache, later stages skipped
//!         miss → CacheWriteBack deferred on the context
//!
//! Adapter finished the response:
//!     → RequestContext::complete()
//!     → CacheWriteBack stores {body, headerContentType} if status 200
//! ```
//!
//! # Design Decisions
//! - A corrupt entry is deleted and treated as a miss
//! - `set` and `expire` are two separate store calls; an entry may outlive
//!   its expiry if the second call fails
//! - Write-back failures are logged, never surfaced to the caller

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::observability::metrics;
use crate::pipeline::{DeferredAction, RequestContext, ResponseAccumulator, ResponseSource};
use crate::store::{DataStore, StoreError};

/// Stored form of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResponse {
    pub body: Value,
    #[serde(default)]
    pub header_content_type: Option<String>,
}

pub type CacheKeyGenerator = Arc<dyn Fn(&RequestContext) -> String + Send + Sync>;

#[derive(Clone)]
pub struct CacheOptions {
    pub expire: Duration,
    /// Append the serialized token to the default key.
    pub auth_based: bool,
    pub key_generator: Option<CacheKeyGenerator>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            expire: Duration::from_secs(60),
            auth_based: false,
            key_generator: None,
        }
    }
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expire(mut self, expire: Duration) -> Self {
        self.expire = expire;
        self
    }

    pub fn auth_based(mut self, auth_based: bool) -> Self {
        self.auth_based = auth_based;
        self
    }

    pub fn key_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&RequestContext) -> String + Send + Sync + 'static,
    {
        self.key_generator = Some(Arc::new(generator));
        self
    }

    pub fn key_for(&self, ctx: &RequestContext) -> String {
        match &self.key_generator {
            Some(generator) => generator(ctx),
            None => default_cache_key(ctx, self.auth_based),
        }
    }
}

impl fmt::Debug for CacheOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheOptions")
            .field("expire", &self.expire)
            .field("auth_based", &self.auth_based)
            .field("key_generator", &self.key_generator.is_some())
            .finish()
    }
}

/// `cache_{ip}_{method}_{originalUrl}`, plus `_{token json}` when `auth_based`
/// and the request is authenticated.
pub fn default_cache_key(ctx: &RequestContext, auth_based: bool) -> String {
    let request = &ctx.request;
    let mut key = format!(
        "cache_{}_{}_{}",
        request.client_ip,
        request.method_str(),
        request.original_url
    );

    if auth_based {
        if let Some(authentication) = &ctx.authentication {
            match serde_json::to_string(&authentication.token) {
                Ok(token) => {
                    key.push('_');
                    key.push_str(&token);
                }
                Err(e) => tracing::warn!(error = %e, "Failed to serialize token for cache key"),
            }
        }
    }
    key
}

/// Reads and writes cached responses. Share one instance across routes.
#[derive(Debug, Clone)]
pub struct Cacher {
    store: Arc<dyn DataStore>,
}

impl Cacher {
    /// `store` should already be scoped to the cache namespace.
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    pub async fn retrieve(&self, key: &str) -> Result<Option<CachedResponse>, StoreError> {
        let Some(raw) = self.store.get(key).await? else {
            metrics::record_cache_lookup("miss");
            return Ok(None);
        };

        match serde_json::from_str::<CachedResponse>(&raw) {
            Ok(cached) => {
                metrics::record_cache_lookup("hit");
                Ok(Some(cached))
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Discarding corrupt cache entry");
                metrics::record_cache_lookup("corrupt");
                self.store.del(key).await?;
                Ok(None)
            }
        }
    }

    /// Write `value` and set its expiry in whole seconds (rounded up, at least 1).
    pub async fn store(
        &self,
        key: &str,
        value: &CachedResponse,
        expire: Duration,
    ) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(value)
            .map_err(|e| StoreError::Unavailable(format!("cannot serialize cache entry: {e}")))?;

        self.store.set(key, &serialized).await?;
        self.store.expire(key, expire_seconds(expire)).await?;
        Ok(())
    }
}

fn expire_seconds(expire: Duration) -> u64 {
    (expire.as_millis().div_ceil(1000) as u64).max(1)
}

/// Deferred write-back of a cache miss.
pub struct CacheWriteBack {
    cacher: Cacher,
    key: String,
    expire: Duration,
}

impl CacheWriteBack {
    pub fn new(cacher: Cacher, key: String, expire: Duration) -> Self {
        Self { cacher, key, expire }
    }
}

#[async_trait]
impl DeferredAction for CacheWriteBack {
    async fn run(&self, response: &ResponseAccumulator) {
        if response.status != 200 || response.source == ResponseSource::Cache {
            return;
        }
        let Some(body) = &response.body else {
            return;
        };

        let cached = CachedResponse {
            body: body.clone(),
            header_content_type: Some(response.content_type_or_default().to_string()),
        };
        match self.cacher.store(&self.key, &cached, self.expire).await {
            Ok(()) => tracing::debug!(key = %self.key, "Response cached"),
            Err(e) => tracing::warn!(key = %self.key, error = %e, "Failed to cache response"),
        }
    }
}
