//! Redis-backed data store (feature `redis`).

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ErrorKind, RedisError};

use super::{DataStore, StoreError, StoreResult};

/// Store using a shared, auto-reconnecting Redis connection.
#[derive(Clone)]
pub struct RedisStore {
    url: String,
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").field("url", &self.url).finish()
    }
}

impl RedisStore {
    /// Connect to the server at `url` (`redis://host:port/db`).
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        tracing::info!(url = %url, "Connected to redis store");
        Ok(Self {
            url: url.to_string(),
            conn,
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn unavailable(err: RedisError) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn classify(key: &str) -> impl FnOnce(RedisError) -> StoreError + '_ {
    move |err| match err.kind() {
        ErrorKind::TypeError => StoreError::WrongType(key.to_string()),
        ErrorKind::ExtensionError if err.code() == Some("WRONGTYPE") => {
            StoreError::WrongType(key.to_string())
        }
        _ => unavailable(err),
    }
}

/// Like `classify`, but a rejected counter value is `NotAnInteger`.
fn classify_counter(key: &str) -> impl FnOnce(RedisError) -> StoreError + '_ {
    move |err| match err.kind() {
        ErrorKind::ResponseError | ErrorKind::TypeError => StoreError::NotAnInteger(key.to_string()),
        _ => classify(key)(err),
    }
}

#[async_trait]
impl DataStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.conn().get(key).await.map_err(classify(key))
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.conn().set(key, value).await.map_err(classify(key))
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        let removed: i64 = self.conn().del(key).await.map_err(classify(key))?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, seconds: u64) -> StoreResult<bool> {
        let seconds = i64::try_from(seconds).unwrap_or(i64::MAX);
        self.conn().expire(key, seconds).await.map_err(classify(key))
    }

    async fn ttl(&self, key: &str) -> StoreResult<i64> {
        self.conn().ttl(key).await.map_err(classify(key))
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.conn()
            .incr(key, 1)
            .await
            .map_err(classify_counter(key))
    }

    async fn decr(&self, key: &str) -> StoreResult<i64> {
        self.conn()
            .decr(key, 1)
            .await
            .map_err(classify_counter(key))
    }

    async fn push(&self, list: &str, value: &str) -> StoreResult<usize> {
        self.conn().rpush(list, value).await.map_err(classify(list))
    }

    async fn unshift(&self, list: &str, value: &str) -> StoreResult<usize> {
        self.conn().lpush(list, value).await.map_err(classify(list))
    }

    async fn pop(&self, list: &str) -> StoreResult<Option<String>> {
        self.conn().rpop(list, None).await.map_err(classify(list))
    }

    async fn shift(&self, list: &str) -> StoreResult<Option<String>> {
        self.conn().lpop(list, None).await.map_err(classify(list))
    }

    async fn slice(&self, list: &str, start: isize, end: isize) -> StoreResult<Vec<String>> {
        self.conn().lrange(list, start, end).await.map_err(classify(list))
    }
}
