use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Error surfaced by cache backends. Callers decide how to degrade; the
/// rate limiter maps these onto its failover modes.
#[derive(Debug, Clone)]
pub enum CacheError {
    Backend(String),
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Backend(msg) => write!(f, "cache backend error: {msg}"),
        }
    }
}

impl std::error::Error for CacheError {}

/// Pluggable cache repository.
///
/// Implement this to swap the in-memory store for Redis, Memcached, etc.
/// Values are opaque bytes with a per-entry TTL.
pub trait CacheStore: Send + Sync + 'static {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, CacheError>>;
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>>;
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), CacheError>>;
}

/// Held for the duration of a keyed critical section.
pub struct CacheLock {
    _guard: OwnedMutexGuard<()>,
}

/// Optional per-key locking offered by a store.
///
/// When a store provides this, read-modify-write users (the rate limiter)
/// get at-most-one-concurrent-update per key. `acquire` returns `None` if
/// the lock could not be taken within `timeout`.
pub trait LockProvider: Send + Sync + 'static {
    fn acquire<'a>(&'a self, key: &'a str, timeout: Duration)
        -> BoxFuture<'a, Option<CacheLock>>;
}

/// In-memory store backed by `DashMap`, with lazy expiry and a per-key
/// lock table. The reference backend for tests and single-process use.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    entries: Arc<DashMap<String, (Bytes, Instant, Duration)>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove all expired entries.
    pub fn evict_expired(&self) {
        self.entries
            .retain(|_, (_, inserted, ttl)| inserted.elapsed() < *ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CacheStore for InMemoryStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Bytes>, CacheError>> {
        Box::pin(async move {
            if let Some(entry) = self.entries.get(key) {
                let (value, inserted, ttl) = entry.value();
                if inserted.elapsed() < *ttl {
                    return Ok(Some(value.clone()));
                }
                // expired; drop the read guard before removing
                drop(entry);
                self.entries.remove(key);
            }
            Ok(None)
        })
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: Bytes,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.entries
                .insert(key.to_string(), (value, Instant::now(), ttl));
            Ok(())
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), CacheError>> {
        Box::pin(async move {
            self.entries.remove(key);
            Ok(())
        })
    }
}

impl LockProvider for InMemoryStore {
    fn acquire<'a>(
        &'a self,
        key: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Option<CacheLock>> {
        Box::pin(async move {
            let mutex = self
                .locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            match tokio::time::timeout(timeout, mutex.lock_owned()).await {
                Ok(guard) => Some(CacheLock { _guard: guard }),
                Err(_) => None,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_remove() {
        let store = InMemoryStore::new();
        store
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
        store.remove("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn entries_expire() {
        let store = InMemoryStore::new();
        store
            .set("k", Bytes::from_static(b"v"), Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn evict_expired_sweeps() {
        let store = InMemoryStore::new();
        store
            .set("short", Bytes::from_static(b"a"), Duration::from_millis(10))
            .await
            .unwrap();
        store
            .set("long", Bytes::from_static(b"b"), Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.evict_expired();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn lock_serializes_holders() {
        let store = InMemoryStore::new();
        let first = store.acquire("k", Duration::from_millis(50)).await;
        assert!(first.is_some());

        // held: second acquire times out
        let second = store.acquire("k", Duration::from_millis(20)).await;
        assert!(second.is_none());

        drop(first);
        let third = store.acquire("k", Duration::from_millis(50)).await;
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn locks_are_per_key() {
        let store = InMemoryStore::new();
        let _a = store.acquire("a", Duration::from_millis(50)).await.unwrap();
        let b = store.acquire("b", Duration::from_millis(50)).await;
        assert!(b.is_some());
    }
}
