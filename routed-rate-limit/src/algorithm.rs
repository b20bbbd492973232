//! Rate-limit algorithms as pure state transitions over serialized bucket
//! records, so every backend (cache, local fallback) shares the same math.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::PolicyError;

/// Algorithm configuration for one policy.
#[derive(Debug, Clone, PartialEq)]
pub enum Algorithm {
    TokenBucket {
        capacity: u64,
        refill_tokens: u64,
        refill_interval: Duration,
        max_tokens: u64,
    },
    SlidingWindow {
        limit: u64,
        window: Duration,
    },
    Quota {
        limit: u64,
        period: Duration,
    },
}

impl Algorithm {
    pub fn validate(&self) -> Result<(), PolicyError> {
        match self {
            Algorithm::TokenBucket {
                capacity,
                refill_tokens,
                refill_interval,
                max_tokens,
            } => {
                if *capacity < 1 {
                    return Err(PolicyError::Algorithm("capacity must be at least 1".into()));
                }
                if refill_interval.is_zero() {
                    return Err(PolicyError::Algorithm(
                        "refill interval must be positive".into(),
                    ));
                }
                if *refill_tokens < 1 {
                    return Err(PolicyError::Algorithm(
                        "refill tokens must be at least 1".into(),
                    ));
                }
                if *max_tokens < *capacity {
                    return Err(PolicyError::Algorithm(
                        "max tokens cannot be below capacity".into(),
                    ));
                }
            }
            Algorithm::SlidingWindow { limit, window } => {
                if *limit < 1 {
                    return Err(PolicyError::Algorithm("limit must be at least 1".into()));
                }
                if window.is_zero() {
                    return Err(PolicyError::Algorithm("window must be positive".into()));
                }
            }
            Algorithm::Quota { limit, period } => {
                if *limit < 1 {
                    return Err(PolicyError::Algorithm("limit must be at least 1".into()));
                }
                if period.is_zero() {
                    return Err(PolicyError::Algorithm("period must be positive".into()));
                }
            }
        }
        Ok(())
    }

    /// Name used in published decision events.
    pub fn strategy(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket { .. } => "token_bucket",
            Algorithm::SlidingWindow { .. } => "sliding_window",
            Algorithm::Quota { .. } => "quota",
        }
    }

    fn period(&self) -> Duration {
        match self {
            Algorithm::TokenBucket {
                refill_interval, ..
            } => *refill_interval,
            Algorithm::SlidingWindow { window, .. } => *window,
            Algorithm::Quota { period, .. } => *period,
        }
    }

    /// TTL on stored bucket state: twice the algorithm period, at least one
    /// second, so abandoned buckets age out without explicit cleanup.
    pub fn state_ttl(&self) -> Duration {
        std::cmp::max(self.period() * 2, Duration::from_secs(1))
    }
}

/// Outcome of one consume attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    pub retry_after: Duration,
    pub remaining: Option<u64>,
}

impl Decision {
    pub fn allow(remaining: u64) -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
            remaining: Some(remaining),
        }
    }

    pub fn block(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after,
            remaining: Some(0),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct TokenBucketState {
    tokens: f64,
    ts: u64,
}

#[derive(Serialize, Deserialize)]
struct WindowState {
    count: u64,
    window_start: u64,
}

/// Run one consume step: read the serialized state (if any), apply the
/// algorithm at `now_ms`, and return the new state plus the decision.
/// Unreadable state is treated as a fresh bucket.
pub fn apply(algo: &Algorithm, state: Option<&[u8]>, now_ms: u64) -> (Vec<u8>, Decision) {
    match algo {
        Algorithm::TokenBucket {
            capacity,
            refill_tokens,
            refill_interval,
            max_tokens,
        } => {
            let rate = *refill_tokens as f64 / refill_interval.as_millis().max(1) as f64;
            let mut bucket = state
                .and_then(|b| serde_json::from_slice::<TokenBucketState>(b).ok())
                .unwrap_or(TokenBucketState {
                    tokens: *capacity as f64,
                    ts: now_ms,
                });

            let elapsed = now_ms.saturating_sub(bucket.ts) as f64;
            bucket.tokens = (bucket.tokens + elapsed * rate).min(*max_tokens as f64);
            bucket.ts = now_ms;

            let decision = if bucket.tokens >= 1.0 {
                bucket.tokens -= 1.0;
                Decision::allow(bucket.tokens as u64)
            } else {
                let retry_ms = ((1.0 - bucket.tokens) / rate).ceil() as u64;
                Decision::block(Duration::from_millis(retry_ms))
            };
            (encode(&bucket), decision)
        }
        Algorithm::SlidingWindow { limit, window } => {
            windowed(*limit, window.as_millis() as u64, state, now_ms)
        }
        Algorithm::Quota { limit, period } => {
            windowed(*limit, period.as_millis() as u64, state, now_ms)
        }
    }
}

fn windowed(limit: u64, window_ms: u64, state: Option<&[u8]>, now_ms: u64) -> (Vec<u8>, Decision) {
    let window_ms = window_ms.max(1);
    let current_start = now_ms / window_ms * window_ms;

    let mut record = state
        .and_then(|b| serde_json::from_slice::<WindowState>(b).ok())
        .unwrap_or(WindowState {
            count: 0,
            window_start: current_start,
        });
    if record.window_start != current_start {
        record.count = 0;
        record.window_start = current_start;
    }

    let decision = if record.count < limit {
        record.count += 1;
        Decision::allow(limit - record.count)
    } else {
        let window_end = record.window_start + window_ms;
        Decision::block(Duration::from_millis(window_end.saturating_sub(now_ms)))
    };
    (encode(&record), decision)
}

fn encode<T: Serialize>(state: &T) -> Vec<u8> {
    serde_json::to_vec(state).unwrap_or_default()
}
