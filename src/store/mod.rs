//! Key–value/list store subsystem.
//!
//! # Data Flow
//! ```text
//! RateLimiter / Cacher
//!     → ScopedStore (adds "{prefix}_{namespace}_" to every key)
//!     → DataStore implementation (memory.rs, redis.rs)
//! ```
//!
//! # Design Decisions
//! - The core depends only on the narrow `DataStore` contract
//! - Every operation is individually atomic at the single-key level
//! - No cross-key transactions are assumed anywhere
//! - Failures surface as `StoreError`; callers decide whether to recover

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Errors raised by store backends.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("wrong value type for key {0}")]
    WrongType(String),
    #[error("value for key {0} is not an integer")]
    NotAnInteger(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Asynchronous key–value and list store.
///
/// `ttl` follows the usual convention: `-2` for a missing key, `-1` for a
/// key without expiry, otherwise the remaining seconds.
#[async_trait]
pub trait DataStore: Send + Sync + fmt::Debug {
    async fn start(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn stop(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;
    async fn del(&self, key: &str) -> StoreResult<bool>;
    async fn expire(&self, key: &str, seconds: u64) -> StoreResult<bool>;
    async fn ttl(&self, key: &str) -> StoreResult<i64>;
    async fn incr(&self, key: &str) -> StoreResult<i64>;
    async fn decr(&self, key: &str) -> StoreResult<i64>;

    /// Append to the tail, returning the new length.
    async fn push(&self, list: &str, value: &str) -> StoreResult<usize>;
    /// Prepend to the head, returning the new length.
    async fn unshift(&self, list: &str, value: &str) -> StoreResult<usize>;
    /// Remove from the tail.
    async fn pop(&self, list: &str) -> StoreResult<Option<String>>;
    /// Remove from the head.
    async fn shift(&self, list: &str) -> StoreResult<Option<String>>;
    /// Inclusive range; negative indexes count from the end.
    async fn slice(&self, list: &str, start: isize, end: isize) -> StoreResult<Vec<String>>;
}

/// A store view that prefixes every key with a namespace.
#[derive(Debug, Clone)]
pub struct ScopedStore {
    inner: Arc<dyn DataStore>,
    prefix: String,
}

impl ScopedStore {
    /// `global_prefix` and `namespace` are each followed by `_` when non-empty.
    pub fn new(inner: Arc<dyn DataStore>, global_prefix: &str, namespace: &str) -> Self {
        let mut prefix = String::new();
        if !global_prefix.is_empty() {
            prefix.push_str(global_prefix);
            prefix.push('_');
        }
        if !namespace.is_empty() {
            prefix.push_str(namespace);
            prefix.push('_');
        }
        Self { inner, prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

#[async_trait]
impl DataStore for ScopedStore {
    async fn start(&self) -> StoreResult<()> {
        self.inner.start().await
    }

    async fn stop(&self) -> StoreResult<()> {
        self.inner.stop().await
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.get(&self.key(key)).await
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.inner.set(&self.key(key), value).await
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.inner.del(&self.key(key)).await
    }

    async fn expire(&self, key: &str, seconds: u64) -> StoreResult<bool> {
        self.inner.expire(&self.key(key), seconds).await
    }

    async fn ttl(&self, key: &str) -> StoreResult<i64> {
        self.inner.ttl(&self.key(key)).await
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.inner.incr(&self.key(key)).await
    }

    async fn decr(&self, key: &str) -> StoreResult<i64> {
        self.inner.decr(&self.key(key)).await
    }

    async fn push(&self, list: &str, value: &str) -> StoreResult<usize> {
        self.inner.push(&self.key(list), value).await
    }

    async fn unshift(&self, list: &str, value: &str) -> StoreResult<usize> {
        self.inner.unshift(&self.key(list), value).await
    }

    async fn pop(&self, list: &str) -> StoreResult<Option<String>> {
        self.inner.pop(&self.key(list)).await
    }

    async fn shift(&self, list: &str) -> StoreResult<Option<String>> {
        self.inner.shift(&self.key(list)).await
    }

    async fn slice(&self, list: &str, start: isize, end: isize) -> StoreResult<Vec<String>> {
        self.inner.slice(&self.key(list), start, end).await
    }
}
