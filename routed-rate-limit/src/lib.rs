pub mod algorithm;
pub mod backend;
pub mod config;
pub mod matcher;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;

use routed_core::middleware::BoxFuture;
use routed_core::{EngineError, GateDecision, GateRequest, PolicyGate};
use routed_events::EventBus;

pub use algorithm::{apply, Algorithm, Decision};
pub use backend::{BackendError, CacheBackend, RateLimitBackend};
pub use matcher::RouteMatcher;

use backend::now_ms;

/// Errors raised while constructing policies.
#[derive(Debug, Clone)]
pub enum PolicyError {
    Algorithm(String),
    Matcher(String),
    Config(String),
}

impl fmt::Display for PolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyError::Algorithm(msg) => write!(f, "invalid algorithm: {msg}"),
            PolicyError::Matcher(msg) => write!(f, "invalid matcher: {msg}"),
            PolicyError::Config(msg) => write!(f, "invalid rate-limit config: {msg}"),
        }
    }
}

impl std::error::Error for PolicyError {}

/// How a policy derives the identity string a request is billed to.
/// Requests with no identity are not subject to the policy.
#[derive(Clone)]
pub enum KeyResolver {
    /// The resolved client address.
    ClientIp,
    /// A named request header, verbatim.
    Header(String),
    /// Caller-supplied resolver.
    Custom(Arc<dyn Fn(&GateRequest<'_>) -> Option<String> + Send + Sync>),
}

impl KeyResolver {
    fn resolve(&self, req: &GateRequest<'_>) -> Option<String> {
        match self {
            KeyResolver::ClientIp => Some(req.client_ip.to_string()),
            KeyResolver::Header(name) => req
                .headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string()),
            KeyResolver::Custom(f) => f(req),
        }
    }
}

impl fmt::Debug for KeyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyResolver::ClientIp => f.write_str("ClientIp"),
            KeyResolver::Header(name) => write!(f, "Header({name})"),
            KeyResolver::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Strategy when the backend is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverMode {
    /// Admit the request, marking the outcome.
    Allow,
    /// Deny with a 30-second retry hint.
    Block,
    /// Enforce the algorithm against in-process state.
    Local,
}

const BLOCK_FAILOVER_RETRY: Duration = Duration::from_secs(30);
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// One compiled rate-limit policy.
pub struct Policy {
    name: String,
    matcher: RouteMatcher,
    key: KeyResolver,
    algorithm: Algorithm,
    backend: Arc<dyn RateLimitBackend>,
    failover: FailoverMode,
    lock_timeout: Duration,
}

impl Policy {
    pub fn new(
        name: impl Into<String>,
        matcher: RouteMatcher,
        key: KeyResolver,
        algorithm: Algorithm,
        backend: Arc<dyn RateLimitBackend>,
    ) -> Result<Self, PolicyError> {
        algorithm.validate()?;
        Ok(Self {
            name: name.into(),
            matcher,
            key,
            algorithm,
            backend,
            failover: FailoverMode::Allow,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    pub fn with_failover(mut self, failover: FailoverMode) -> Self {
        self.failover = failover;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Published to the event bus for every rate-limit decision.
#[derive(Debug, Clone)]
pub struct RateLimitEvent {
    pub policy: String,
    pub strategy: &'static str,
    pub identity: String,
    pub allowed: bool,
    pub remaining: Option<u64>,
    pub retry_after: Duration,
    pub failover: Option<FailoverMode>,
}

/// In-process fallback state for `FailoverMode::Local`, keyed by bucket.
#[derive(Default)]
struct LocalFallback {
    buckets: DashMap<String, Mutex<Option<Vec<u8>>>>,
}

impl LocalFallback {
    fn consume(&self, bucket: &str, algo: &Algorithm) -> Decision {
        let entry = self
            .buckets
            .entry(bucket.to_string())
            .or_insert_with(|| Mutex::new(None));
        let mut state = match entry.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let (next, decision) = apply(algo, state.as_deref(), now_ms());
        *state = Some(next);
        decision
    }
}

/// The rate-limiting policy gate.
///
/// Policies are evaluated in declaration order against each request; every
/// matching policy consumes, and the first blocking decision denies the
/// request with 429 and a `Retry-After` hint. Backend failures degrade per
/// the policy's failover mode. Every decision is published to the event
/// bus.
pub struct RateLimiter {
    policies: Vec<Policy>,
    local: LocalFallback,
    events: EventBus,
}

impl RateLimiter {
    pub fn new(events: EventBus) -> Self {
        Self {
            policies: Vec::new(),
            local: LocalFallback::default(),
            events,
        }
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn policies(&self) -> usize {
        self.policies.len()
    }

    async fn decide(&self, policy: &Policy, bucket: &str) -> (Decision, Option<FailoverMode>) {
        match policy
            .backend
            .consume(bucket, &policy.algorithm, policy.lock_timeout)
            .await
        {
            Ok(decision) => (decision, None),
            Err(e) => {
                tracing::warn!(
                    policy = policy.name.as_str(),
                    error = %e,
                    failover = ?policy.failover,
                    "rate-limit backend failed"
                );
                let decision = match policy.failover {
                    FailoverMode::Allow => Decision {
                        allowed: true,
                        retry_after: Duration::ZERO,
                        remaining: None,
                    },
                    FailoverMode::Block => Decision::block(BLOCK_FAILOVER_RETRY),
                    FailoverMode::Local => self.local.consume(bucket, &policy.algorithm),
                };
                (decision, Some(policy.failover))
            }
        }
    }
}

fn retry_secs(retry_after: Duration) -> u64 {
    let ms = retry_after.as_millis() as u64;
    std::cmp::max(ms.div_ceil(1000), 1)
}

impl PolicyGate for RateLimiter {
    fn check<'a>(&'a self, req: &'a GateRequest<'a>) -> BoxFuture<'a, GateDecision> {
        Box::pin(async move {
            for policy in &self.policies {
                if !policy.matcher.matches(req.method, req.path) {
                    continue;
                }
                let identity = match policy.key.resolve(req) {
                    Some(identity) => identity,
                    None => continue,
                };
                let bucket = format!("{}:{}", policy.name, identity);

                let (decision, failover) = self.decide(policy, &bucket).await;

                self.events.emit(RateLimitEvent {
                    policy: policy.name.clone(),
                    strategy: policy.algorithm.strategy(),
                    identity: identity.clone(),
                    allowed: decision.allowed,
                    remaining: decision.remaining,
                    retry_after: decision.retry_after,
                    failover,
                });

                if !decision.allowed {
                    let secs = retry_secs(decision.retry_after);
                    return GateDecision::Deny(EngineError::too_many_requests(
                        secs,
                        "rate limit exceeded",
                    ));
                }
            }
            GateDecision::Allow
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_seconds_round_up() {
        assert_eq!(retry_secs(Duration::from_millis(200)), 1);
        assert_eq!(retry_secs(Duration::from_secs(1)), 1);
        assert_eq!(retry_secs(Duration::from_millis(1500)), 2);
        assert_eq!(retry_secs(Duration::from_secs(30)), 30);
    }

    #[test]
    fn local_fallback_is_consistent() {
        let local = LocalFallback::default();
        let algo = Algorithm::SlidingWindow {
            limit: 2,
            window: Duration::from_secs(60),
        };
        assert!(local.consume("b", &algo).allowed);
        assert!(local.consume("b", &algo).allowed);
        assert!(!local.consume("b", &algo).allowed);
        // other buckets unaffected
        assert!(local.consume("c", &algo).allowed);
    }
}
