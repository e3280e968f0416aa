//! In-process data store backed by a concurrent map.
//!
//! A slot past its deadline is treated as missing and removed the next time
//! it is touched. Once started, a background task also purges expired slots
//! every `PURGE_INTERVAL`, so keys that are never touched again do not
//! accumulate. Deadlines use `tokio::time::Instant` so tests can drive them
//! with a paused clock.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::{DataStore, StoreError, StoreResult};

pub const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Thread-safe memory store. Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<DashMap<String, Slot>>,
    purger: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner.iter().filter(|slot| !slot.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired slot, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        purge(&self.inner)
    }

    /// Drop expired entries before operating on `key`.
    fn evict_if_expired(&self, key: &str) {
        let now = Instant::now();
        self.inner.remove_if(key, |_, slot| slot.is_expired(now));
    }

    fn add_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        self.evict_if_expired(key);
        match self.inner.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                let current = match &slot.value {
                    Value::Str(raw) => raw
                        .parse::<i64>()
                        .map_err(|_| StoreError::NotAnInteger(key.to_string()))?,
                    Value::List(_) => return Err(StoreError::WrongType(key.to_string())),
                };
                let next = current + delta;
                slot.value = Value::Str(next.to_string());
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    value: Value::Str(delta.to_string()),
                    expires_at: None,
                });
                Ok(delta)
            }
        }
    }

    fn insert_list(&self, key: &str, value: &str, front: bool) -> StoreResult<usize> {
        self.evict_if_expired(key);
        let mut slot = self.inner.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });
        match &mut slot.value {
            Value::List(list) => {
                if front {
                    list.push_front(value.to_string());
                } else {
                    list.push_back(value.to_string());
                }
                Ok(list.len())
            }
            Value::Str(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn remove_list(&self, key: &str, front: bool) -> StoreResult<Option<String>> {
        self.evict_if_expired(key);
        let Some(mut slot) = self.inner.get_mut(key) else {
            return Ok(None);
        };
        let (item, now_empty) = match &mut slot.value {
            Value::List(list) => {
                let item = if front { list.pop_front() } else { list.pop_back() };
                (item, list.is_empty())
            }
            Value::Str(_) => return Err(StoreError::WrongType(key.to_string())),
        };
        drop(slot);
        if now_empty {
            self.inner
                .remove_if(key, |_, slot| matches!(&slot.value, Value::List(list) if list.is_empty()));
        }
        Ok(item)
    }
}

fn purge(map: &DashMap<String, Slot>) -> usize {
    let now = Instant::now();
    let mut purged = 0;
    map.retain(|_, slot| {
        let expired = slot.is_expired(now);
        purged += usize::from(expired);
        !expired
    });
    purged
}

/// Resolve an inclusive, possibly negative index pair into a half-open range.
fn resolve_range(len: usize, start: isize, end: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let end = if end < 0 { len + end } else { end.min(len - 1) };
    if len == 0 || start > end || start >= len {
        return None;
    }
    Some((start as usize, end as usize + 1))
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn start(&self) -> StoreResult<()> {
        let Ok(mut purger) = self.purger.lock() else {
            return Ok(());
        };
        if purger.is_some() {
            return Ok(());
        }

        let map: Weak<DashMap<String, Slot>> = Arc::downgrade(&self.inner);
        *purger = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + PURGE_INTERVAL, PURGE_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(map) = map.upgrade() else { break };
                let purged = purge(&map);
                if purged > 0 {
                    tracing::debug!(purged, remaining = map.len(), "Expired store entries purged");
                }
            }
        }));
        Ok(())
    }

    async fn stop(&self) -> StoreResult<()> {
        if let Ok(mut purger) = self.purger.lock() {
            if let Some(task) = purger.take() {
                task.abort();
            }
        }
        self.inner.clear();
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.evict_if_expired(key);
        match self.inner.get(key) {
            Some(slot) => match &slot.value {
                Value::Str(raw) => Ok(Some(raw.clone())),
                Value::List(_) => Err(StoreError::WrongType(key.to_string())),
            },
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.inner.insert(
            key.to_string(),
            Slot {
                value: Value::Str(value.to_string()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<bool> {
        self.evict_if_expired(key);
        Ok(self.inner.remove(key).is_some())
    }

    async fn expire(&self, key: &str, seconds: u64) -> StoreResult<bool> {
        self.evict_if_expired(key);
        match self.inner.get_mut(key) {
            Some(mut slot) => {
                slot.expires_at = Some(Instant::now() + Duration::from_secs(seconds));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> StoreResult<i64> {
        self.evict_if_expired(key);
        let Some(slot) = self.inner.get(key) else {
            return Ok(-2);
        };
        match slot.expires_at {
            None => Ok(-1),
            Some(at) => {
                let remaining = at.saturating_duration_since(Instant::now());
                Ok(remaining.as_millis().div_ceil(1000) as i64)
            }
        }
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.add_by(key, 1)
    }

    async fn decr(&self, key: &str) -> StoreResult<i64> {
        self.add_by(key, -1)
    }

    async fn push(&self, list: &str, value: &str) -> StoreResult<usize> {
        self.insert_list(list, value, false)
    }

    async fn unshift(&self, list: &str, value: &str) -> StoreResult<usize> {
        self.insert_list(list, value, true)
    }

    async fn pop(&self, list: &str) -> StoreResult<Option<String>> {
        self.remove_list(list, false)
    }

    async fn shift(&self, list: &str) -> StoreResult<Option<String>> {
        self.remove_list(list, true)
    }

    async fn slice(&self, list: &str, start: isize, end: isize) -> StoreResult<Vec<String>> {
        self.evict_if_expired(list);
        let Some(slot) = self.inner.get(list) else {
            return Ok(Vec::new());
        };
        match &slot.value {
            Value::List(items) => Ok(match resolve_range(items.len(), start, end) {
                Some((from, to)) => items.range(from..to).cloned().collect(),
                None => Vec::new(),
            }),
            Value::Str(_) => Err(StoreError::WrongType(list.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_string_operations() {
        let store = MemoryStore::new();
        assert_eq!(store.get("missing").await.unwrap(), None);

        store.set("a", "1").await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.incr("a").await.unwrap(), 2);
        assert_eq!(store.decr("a").await.unwrap(), 1);
        assert_eq!(store.incr("counter").await.unwrap(), 1);

        assert!(store.del("a").await.unwrap());
        assert!(!store.del("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_incr_rejects_non_integer() {
        let store = MemoryStore::new();
        store.set("word", "hello").await.unwrap();
        assert_eq!(
            store.incr("word").await,
            Err(StoreError::NotAnInteger("word".into()))
        );
    }

    #[tokio::test]
    async fn test_list_operations() {
        let store = MemoryStore::new();
        assert_eq!(store.push("l", "b").await.unwrap(), 1);
        assert_eq!(store.unshift("l", "a").await.unwrap(), 2);
        assert_eq!(store.push("l", "c").await.unwrap(), 3);

        assert_eq!(store.slice("l", 0, -1).await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(store.slice("l", -2, -1).await.unwrap(), vec!["b", "c"]);
        assert_eq!(store.slice("l", 1, 10).await.unwrap(), vec!["b", "c"]);
        assert!(store.slice("l", 5, 6).await.unwrap().is_empty());

        assert_eq!(store.pop("l").await.unwrap().as_deref(), Some("c"));
        assert_eq!(store.shift("l").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.shift("l").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.shift("l").await.unwrap(), None);
        assert_eq!(store.ttl("l").await.unwrap(), -2);
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let store = MemoryStore::new();
        store.push("l", "x").await.unwrap();
        assert!(matches!(store.get("l").await, Err(StoreError::WrongType(_))));
        store.set("s", "x").await.unwrap();
        assert!(matches!(store.push("s", "y").await, Err(StoreError::WrongType(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();
        assert_eq!(store.ttl("k").await.unwrap(), -1);
        assert!(!store.expire("nope", 5).await.unwrap());

        assert!(store.expire("k", 5).await.unwrap());
        assert_eq!(store.ttl("k").await.unwrap(), 5);

        tokio::time::advance(Duration::from_millis(2500)).await;
        assert_eq!(store.ttl("k").await.unwrap(), 3);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.ttl("k").await.unwrap(), -2);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_store_purges_untouched_keys() {
        let store = MemoryStore::new();
        store.start().await.unwrap();

        for i in 0..1000 {
            let key = format!("ratelimit_10.0.0.{i}_GET_/");
            store.unshift(&key, "1").await.unwrap();
            store.expire(&key, 1).await.unwrap();
        }
        store.set("durable", "v").await.unwrap();
        assert_eq!(store.inner.len(), 1001);

        tokio::time::sleep(PURGE_INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(store.inner.len(), 1);
        assert_eq!(store.get("durable").await.unwrap().as_deref(), Some("v"));

        store.stop().await.unwrap();
        assert!(store.purger.lock().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired_counts_dropped_slots() {
        let store = MemoryStore::new();
        store.set("a", "1").await.unwrap();
        store.set("b", "1").await.unwrap();
        store.expire("a", 1).await.unwrap();

        assert_eq!(store.purge_expired(), 0);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.inner.len(), 1);
    }

    #[tokio::test]
    async fn test_set_clears_expiry() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();
        store.expire("k", 10).await.unwrap();
        store.set("k", "w").await.unwrap();
        assert_eq!(store.ttl("k").await.unwrap(), -1);
    }

    #[test]
    fn test_resolve_range() {
        assert_eq!(resolve_range(3, 0, -1), Some((0, 3)));
        assert_eq!(resolve_range(3, -10, 0), Some((0, 1)));
        assert_eq!(resolve_range(0, 0, -1), None);
        assert_eq!(resolve_range(3, 2, 1), None);
    }
}
