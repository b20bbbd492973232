//! routed — a web-application toolkit built around a compiled routing
//! engine.
//!
//! This facade crate re-exports the sub-crates behind feature flags so an
//! application needs a single dependency:
//!
//! ```ignore
//! use routed::prelude::*;
//! ```
//!
//! | Feature      | Default | Crate                |
//! |--------------|---------|----------------------|
//! | `security`   | **yes** | `routed-security`    |
//! | `events`     | **yes** | `routed-events`      |
//! | `session`    | **yes** | `routed-session`     |
//! | `cache`      | no      | `routed-cache`       |
//! | `rate-limit` | no      | `routed-rate-limit`  |
//! | `full`       | no      | all of the above     |

pub use routed_core::*;

#[cfg(feature = "security")]
pub use routed_security;

#[cfg(feature = "events")]
pub use routed_events;

#[cfg(feature = "cache")]
pub use routed_cache;

#[cfg(feature = "rate-limit")]
pub use routed_rate_limit;

#[cfg(feature = "session")]
pub use routed_session;

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    #[tokio::test]
    async fn prelude_builds_a_working_engine() {
        let mut router = Router::new();
        router.get(
            "/ping",
            handler_fn(|mut ctx: Context| async move {
                ctx.string("pong");
                ctx
            }),
        );
        let engine = Engine::builder(router).build().unwrap();

        let req = crate::http::Request::new(Body::empty());
        let resp = engine.dispatch(req, "127.0.0.1:4000".parse().unwrap()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = http::Request::builder()
            .uri("/ping")
            .body(Body::empty())
            .unwrap();
        let resp = engine.dispatch(req, "127.0.0.1:4000".parse().unwrap()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
}

/// Unified prelude — `use routed::prelude::*`.
pub mod prelude {
    pub use routed_core::prelude::*;

    #[cfg(feature = "security")]
    pub use routed_security::prelude::*;

    #[cfg(feature = "events")]
    pub use routed_events::EventBus;

    #[cfg(feature = "rate-limit")]
    pub use routed_rate_limit::{
        Algorithm, CacheBackend, FailoverMode, KeyResolver, Policy, RateLimiter, RouteMatcher,
    };

    #[cfg(feature = "session")]
    pub use routed_session::prelude::*;
}
