use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use routed_cache::{CacheError, CacheStore, InMemoryStore, LockProvider};
use routed_core::middleware::BoxFuture;

use crate::algorithm::{apply, Algorithm, Decision};

/// A backend failure. The limiter maps these onto the policy's failover
/// mode instead of failing the request outright.
#[derive(Debug, Clone)]
pub struct BackendError(pub String);

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rate-limit backend error: {}", self.0)
    }
}

impl std::error::Error for BackendError {}

impl From<CacheError> for BackendError {
    fn from(e: CacheError) -> Self {
        BackendError(e.to_string())
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Storage strategy for bucket state.
pub trait RateLimitBackend: Send + Sync + 'static {
    /// Run one read-modify-write consume for `bucket` under `algo`.
    fn consume<'a>(
        &'a self,
        bucket: &'a str,
        algo: &'a Algorithm,
        lock_timeout: Duration,
    ) -> BoxFuture<'a, Result<Decision, BackendError>>;
}

/// The reference backend: bucket records live in a [`CacheStore`] with a
/// TTL of `max(2 × period, 1 s)`.
///
/// When the store also provides a [`LockProvider`], the read-modify-write
/// runs under a per-bucket lock, guaranteeing at most one concurrent update
/// per bucket. A lock that cannot be taken within `lock_timeout` is
/// reported as a backend error so the policy's failover mode applies.
/// Without a lock provider updates may race; the TTL bounds the damage.
#[derive(Clone)]
pub struct CacheBackend {
    store: Arc<dyn CacheStore>,
    locks: Option<Arc<dyn LockProvider>>,
}

impl CacheBackend {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store, locks: None }
    }

    pub fn with_locks(mut self, locks: Arc<dyn LockProvider>) -> Self {
        self.locks = Some(locks);
        self
    }

    /// An in-memory backend with per-bucket locking, for single-process use
    /// and tests.
    pub fn in_memory() -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self {
            store: store.clone(),
            locks: Some(store),
        }
    }
}

impl RateLimitBackend for CacheBackend {
    fn consume<'a>(
        &'a self,
        bucket: &'a str,
        algo: &'a Algorithm,
        lock_timeout: Duration,
    ) -> BoxFuture<'a, Result<Decision, BackendError>> {
        Box::pin(async move {
            let _lock = match &self.locks {
                Some(provider) => match provider.acquire(bucket, lock_timeout).await {
                    Some(lock) => Some(lock),
                    None => {
                        return Err(BackendError(format!(
                            "lock on '{bucket}' not acquired within {lock_timeout:?}"
                        )))
                    }
                },
                None => None,
            };

            let state = self.store.get(bucket).await?;
            let (next, decision) = apply(algo, state.as_deref(), now_ms());
            self.store
                .set(bucket, Bytes::from(next), algo.state_ttl())
                .await?;
            Ok(decision)
        })
    }
}
