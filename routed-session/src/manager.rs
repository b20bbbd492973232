use std::sync::Arc;

use tokio::sync::Mutex;

use routed_core::middleware::{BoxFuture, Middleware, Next};
use routed_core::{Context, EngineError};

use crate::session::Session;
use crate::store::{SessionError, SessionStore};

/// Lazy, shared access to the request's session.
///
/// The middleware places one of these in the context's data bag; the first
/// accessor triggers the store's `read`, later accessors reuse the loaded
/// session. Cloning shares state.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    store: Arc<dyn SessionStore>,
    name: String,
    session: Mutex<Option<Session>>,
}

impl SessionHandle {
    fn new(store: Arc<dyn SessionStore>, name: String) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                store,
                name,
                session: Mutex::new(None),
            }),
        }
    }

    /// Run `f` against the loaded session, reading it on first access.
    pub async fn with_session<R>(
        &self,
        ctx: &Context,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Result<R, SessionError> {
        let mut slot = self.inner.session.lock().await;
        if slot.is_none() {
            let session = self.inner.store.read(ctx, &self.inner.name).await?;
            *slot = Some(session);
        }
        // the slot was just filled above
        let session = slot.as_mut().ok_or_else(|| {
            SessionError::Store("session slot empty after read".to_string())
        })?;
        Ok(f(session))
    }

    /// The loaded session, if any accessor ran. Used by the middleware's
    /// post-phase; an untouched session stays unloaded and unwritten.
    async fn take_loaded(&self) -> Option<Session> {
        self.inner.session.lock().await.take()
    }

    pub async fn get<T: serde::de::DeserializeOwned>(
        &self,
        ctx: &Context,
        key: &str,
    ) -> Result<Option<T>, SessionError> {
        self.with_session(ctx, |s| s.get(key)).await
    }

    pub async fn insert(
        &self,
        ctx: &Context,
        key: &str,
        value: impl serde::Serialize,
    ) -> Result<(), SessionError> {
        self.with_session(ctx, |s| s.insert(key, value)).await
    }

    pub async fn flash(
        &self,
        ctx: &Context,
        message: &str,
        category: Option<&str>,
    ) -> Result<(), SessionError> {
        self.with_session(ctx, |s| s.flash(message, category)).await
    }

    pub async fn take_flashes(
        &self,
        ctx: &Context,
        filter: Option<&[&str]>,
    ) -> Result<Vec<(String, String)>, SessionError> {
        self.with_session(ctx, |s| s.take_flashes(filter)).await
    }

    pub async fn regenerate(&self, ctx: &Context) -> Result<(), SessionError> {
        self.with_session(ctx, |s| s.regenerate()).await
    }

    pub async fn destroy(&self, ctx: &Context) -> Result<(), SessionError> {
        self.with_session(ctx, |s| s.destroy()).await
    }
}

/// Retrieve the request's session handle. Fails when no
/// [`SessionMiddleware`] is installed on the route.
pub fn session(ctx: &Context) -> Result<SessionHandle, EngineError> {
    ctx.get::<SessionHandle>().ok_or_else(|| {
        EngineError::internal("no session middleware on this route").with_code("no_session")
    })
}

/// Binds a [`SessionStore`] to each request.
///
/// Pre-phase: places a lazy [`SessionHandle`] in the context. Post-phase:
/// writes the session back through the store, but only when it was loaded
/// and is new, mutated, or destroyed — an untouched or read-only session
/// produces no `Set-Cookie`.
pub struct SessionMiddleware {
    store: Arc<dyn SessionStore>,
    name: String,
}

impl SessionMiddleware {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            name: "routed_session".to_string(),
        }
    }

    pub fn with_cookie_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Middleware for SessionMiddleware {
    fn handle(&self, mut ctx: Context, next: Next) -> BoxFuture<'_, Context> {
        Box::pin(async move {
            let handle = SessionHandle::new(self.store.clone(), self.name.clone());
            ctx.set(handle.clone());

            let mut ctx = next.run(ctx).await;

            if let Some(session) = handle.take_loaded().await {
                if session.needs_write() {
                    if let Err(e) = self.store.write(&mut ctx, &session).await {
                        tracing::error!(error = %e, "session write failed");
                        ctx.error(
                            EngineError::internal(format!("session write failed: {e}"))
                                .with_code("session_write"),
                        );
                    }
                }
            }
            ctx
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use routed_core::http::{Body, Method, SET_COOKIE};
    use routed_core::middleware::{handler_fn, RegisteredMiddleware};

    fn ctx_with_cookie(cookie: Option<&str>) -> Context {
        let mut builder = http::Request::builder().method(Method::GET).uri("/");
        if let Some(cookie) = cookie {
            builder = builder.header("cookie", cookie);
        }
        Context::from_request(
            builder.body(Body::empty()).unwrap(),
            "127.0.0.1:9000".parse().unwrap(),
        )
    }

    async fn run(store: Arc<MemoryStore>, cookie: Option<&str>, work: fn(Context) -> Context) -> routed_core::http::Response {
        // run the middleware around a sync transform for simple cases
        let mw = RegisteredMiddleware::anonymous(Arc::new(SessionMiddleware::new(store)));
        let handler = handler_fn(move |ctx| async move { work(ctx) });
        let next = Next::new(vec![mw].into(), handler);
        next.run(ctx_with_cookie(cookie)).await.finalize()
    }

    #[tokio::test]
    async fn untouched_session_writes_nothing() {
        let store = Arc::new(MemoryStore::new(b"secret"));
        let resp = run(store, None, |ctx| ctx).await;
        assert!(resp.headers().get(SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn first_write_emits_cookie_then_reads_do_not() {
        let store = Arc::new(MemoryStore::new(b"secret"));

        // request 1: write a value
        let mw = RegisteredMiddleware::anonymous(Arc::new(SessionMiddleware::new(store.clone())));
        let handler = handler_fn(|ctx: Context| async move {
            let handle = session(&ctx).unwrap();
            handle.insert(&ctx, "user", "alice").await.unwrap();
            ctx
        });
        let next = Next::new(vec![mw].into(), handler);
        let resp = next.run(ctx_with_cookie(None)).await.finalize();
        let cookie = resp
            .headers()
            .get(SET_COOKIE)
            .expect("first write sets the cookie")
            .to_str()
            .unwrap()
            .to_string();
        let cookie_pair = cookie.split(';').next().unwrap().to_string();

        // requests 2..n: only read
        for _ in 0..3 {
            let mw =
                RegisteredMiddleware::anonymous(Arc::new(SessionMiddleware::new(store.clone())));
            let handler = handler_fn(|ctx: Context| async move {
                let handle = session(&ctx).unwrap();
                let user: Option<String> = handle.get(&ctx, "user").await.unwrap();
                assert_eq!(user, Some("alice".to_string()));
                ctx
            });
            let next = Next::new(vec![mw].into(), handler);
            let resp = next.run(ctx_with_cookie(Some(&cookie_pair))).await.finalize();
            assert!(
                resp.headers().get(SET_COOKIE).is_none(),
                "read-only request must not set a cookie"
            );
        }
    }

    #[tokio::test]
    async fn destroy_emits_expiring_cookie() {
        let store = Arc::new(MemoryStore::new(b"secret"));

        // establish a session
        let mw = RegisteredMiddleware::anonymous(Arc::new(SessionMiddleware::new(store.clone())));
        let handler = handler_fn(|ctx: Context| async move {
            session(&ctx).unwrap().insert(&ctx, "k", 1).await.unwrap();
            ctx
        });
        let resp = Next::new(vec![mw].into(), handler)
            .run(ctx_with_cookie(None))
            .await
            .finalize();
        let cookie = resp.headers().get(SET_COOKIE).unwrap().to_str().unwrap();
        let cookie_pair = cookie.split(';').next().unwrap().to_string();

        // destroy it
        let mw = RegisteredMiddleware::anonymous(Arc::new(SessionMiddleware::new(store.clone())));
        let handler = handler_fn(|ctx: Context| async move {
            session(&ctx).unwrap().destroy(&ctx).await.unwrap();
            ctx
        });
        let resp = Next::new(vec![mw].into(), handler)
            .run(ctx_with_cookie(Some(&cookie_pair)))
            .await
            .finalize();
        let expiring = resp.headers().get(SET_COOKIE).unwrap().to_str().unwrap();
        assert!(expiring.contains("Max-Age=0"));
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn flashes_survive_exactly_one_read() {
        let store = Arc::new(MemoryStore::new(b"secret"));

        let mw = RegisteredMiddleware::anonymous(Arc::new(SessionMiddleware::new(store.clone())));
        let handler = handler_fn(|ctx: Context| async move {
            session(&ctx)
                .unwrap()
                .flash(&ctx, "saved", None)
                .await
                .unwrap();
            ctx
        });
        let resp = Next::new(vec![mw].into(), handler)
            .run(ctx_with_cookie(None))
            .await
            .finalize();
        let cookie = resp.headers().get(SET_COOKIE).unwrap().to_str().unwrap();
        let cookie_pair = cookie.split(';').next().unwrap().to_string();

        // first read drains
        let mw = RegisteredMiddleware::anonymous(Arc::new(SessionMiddleware::new(store.clone())));
        let handler = handler_fn(|ctx: Context| async move {
            let flashes = session(&ctx)
                .unwrap()
                .take_flashes(&ctx, None)
                .await
                .unwrap();
            assert_eq!(flashes, vec![("message".to_string(), "saved".to_string())]);
            ctx
        });
        Next::new(vec![mw].into(), handler)
            .run(ctx_with_cookie(Some(&cookie_pair)))
            .await;

        // second read sees nothing
        let mw = RegisteredMiddleware::anonymous(Arc::new(SessionMiddleware::new(store.clone())));
        let handler = handler_fn(|ctx: Context| async move {
            let flashes = session(&ctx)
                .unwrap()
                .take_flashes(&ctx, None)
                .await
                .unwrap();
            assert!(flashes.is_empty());
            ctx
        });
        Next::new(vec![mw].into(), handler)
            .run(ctx_with_cookie(Some(&cookie_pair)))
            .await;
    }
}
