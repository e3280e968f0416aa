//! Sliding-window rate limiting with a quadratic slow-down zone.
//!
//! Every request unshifts its timestamp onto a per-key list in the store.
//! The list length is the number of requests in the current window:
//!
//! ```text
//! requests ≤ before_delay            → no delay
//! before_delay < requests ≤ limit    → delay grows quadratically up to max_delay
//! requests > limit                   → TooManyRequests with retryAfter = ttl
//! ```
//!
//! The window expires `wait_time` after the latest request, and the list is
//! trimmed to `limit + 1` entries since only the count matters.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::RateLimitConfig;
use crate::error::RequestError;
use crate::observability::metrics;
use crate::pipeline::RequestContext;
use crate::store::DataStore;

/// Numeric limits for one route.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitPolicy {
    /// Window length; also how long a blocked key stays blocked.
    pub wait_time: Duration,
    pub requests_allowed_before_delay: u64,
    pub max_delay: Duration,
    pub requests_allowed_before_limit: u64,
    pub message: String,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::from(&RateLimitConfig::default())
    }
}

impl From<&RateLimitConfig> for RateLimitPolicy {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            wait_time: Duration::from_secs(config.wait_time_secs),
            requests_allowed_before_delay: config.requests_allowed_before_delay,
            max_delay: Duration::from_millis(config.max_delay_ms),
            requests_allowed_before_limit: config.requests_allowed_before_limit,
            message: config.message.clone(),
        }
    }
}

pub type KeyGenerator = Arc<dyn Fn(&RequestContext) -> String + Send + Sync>;

/// Route-level rate limiting options.
///
/// Without a policy the application-wide default applies. Without a key
/// generator the key is `ratelimit_{ip}_{method}_{originalUrl}`.
#[derive(Clone, Default)]
pub struct RateLimitOptions {
    pub policy: Option<RateLimitPolicy>,
    pub key_generator: Option<KeyGenerator>,
}

impl RateLimitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn policy(mut self, policy: RateLimitPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn key_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&RequestContext) -> String + Send + Sync + 'static,
    {
        self.key_generator = Some(Arc::new(generator));
        self
    }
}

impl fmt::Debug for RateLimitOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitOptions")
            .field("policy", &self.policy)
            .field("key_generator", &self.key_generator.is_some())
            .finish()
    }
}

/// Result of an admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitOutcome {
    pub requests: u64,
    pub requests_allowed_before_limit: u64,
    pub wait_time: Duration,
    pub response_delay: Duration,
}

impl RateLimitOutcome {
    pub fn remaining(&self) -> u64 {
        self.requests_allowed_before_limit.saturating_sub(self.requests)
    }
}

/// Delay imposed on the `requests`-th request of the window.
pub fn response_delay(requests: u64, policy: &RateLimitPolicy) -> Duration {
    let before_delay = policy.requests_allowed_before_delay;
    let before_limit = policy.requests_allowed_before_limit;

    let over_delay_limit = requests.saturating_sub(before_delay);
    if over_delay_limit == 0 {
        return Duration::ZERO;
    }
    // No soft zone: straight to the maximum.
    if before_limit <= before_delay {
        return policy.max_delay;
    }

    let span = (before_limit - before_delay) as f64;
    let max_ms = policy.max_delay.as_millis() as f64;
    let delay_ms = (max_ms / span.powi(2) * (over_delay_limit as f64).powi(2)).round();
    Duration::from_millis(delay_ms.min(max_ms) as u64)
}

/// Store-backed limiter. Share one instance across routes.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    store: Arc<dyn DataStore>,
}

impl RateLimiter {
    /// `store` should already be scoped to the rate-limit namespace.
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    /// Count one request against `key`, sleeping for the slow-down delay.
    ///
    /// Returns `Ok(None)` for an empty key.
    pub async fn limit(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
    ) -> Result<Option<RateLimitOutcome>, RequestError> {
        if key.is_empty() {
            return Ok(None);
        }

        let wait_secs = policy.wait_time.as_secs().max(1);
        let requests = self.store.unshift(key, &now_millis().to_string()).await? as u64;

        if requests > policy.requests_allowed_before_limit.saturating_add(1) {
            self.store.pop(key).await?;
        }

        if requests > policy.requests_allowed_before_limit {
            self.store.expire(key, wait_secs).await?;
            let retry_after = self.store.ttl(key).await?.max(1) as u64;
            tracing::warn!(key = %key, requests, retry_after, "Rate limit exceeded");
            return Err(RequestError::too_many_requests(policy.message.clone(), retry_after));
        }

        let delay = response_delay(requests, policy);
        self.store.expire(key, wait_secs).await?;

        if !delay.is_zero() {
            tracing::debug!(key = %key, requests, delay_ms = delay.as_millis() as u64, "Delaying request");
            metrics::record_rate_limit_delay(delay);
            tokio::time::sleep(delay).await;
        }

        Ok(Some(RateLimitOutcome {
            requests,
            requests_allowed_before_limit: policy.requests_allowed_before_limit,
            wait_time: policy.wait_time,
            response_delay: delay,
        }))
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}
