use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::context::Context;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A layer wrapping the remainder of the chain.
///
/// Calling [`Next::run`] invokes the rest of the chain and hands the context
/// back once it unwinds; returning without calling it short-circuits.
/// Aborted contexts skip every remaining layer, so code after `next.run`
/// still executes during unwinding (the post-phase).
pub trait Middleware: Send + Sync + 'static {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture<'_, Context>;
}

/// The suspended remainder of a middleware chain.
///
/// Owns shared references to the compiled stack and the handler, so it can
/// be moved into middleware futures freely.
#[derive(Clone)]
pub struct Next {
    stack: Arc<[RegisteredMiddleware]>,
    index: usize,
    handler: Arc<dyn Handler>,
}

impl Next {
    pub fn new(stack: Arc<[RegisteredMiddleware]>, handler: Arc<dyn Handler>) -> Self {
        Self {
            stack,
            index: 0,
            handler,
        }
    }

    /// Run the rest of the chain. A context already marked aborted passes
    /// straight through without touching further layers or the handler.
    pub async fn run(mut self, ctx: Context) -> Context {
        if ctx.is_aborted() {
            return ctx;
        }
        if self.index < self.stack.len() {
            let layer = self.stack[self.index].inner.clone();
            self.index += 1;
            layer.handle(ctx, self).await
        } else {
            self.handler.call(ctx).await
        }
    }
}

/// The innermost layer of a chain.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: Context) -> BoxFuture<'static, Context>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Context> + Send + 'static,
{
    fn call(&self, ctx: Context) -> BoxFuture<'static, Context> {
        Box::pin(self(ctx))
    }
}

/// Wrap an async closure as a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Context> + Send + 'static,
{
    Arc::new(f)
}

struct FnMiddleware<F>(F);

impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(Context, Next) -> BoxFuture<'static, Context> + Send + Sync + 'static,
{
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture<'_, Context> {
        (self.0)(ctx, next)
    }
}

/// Wrap a closure as an anonymous registered middleware.
pub fn middleware_fn<F>(f: F) -> RegisteredMiddleware
where
    F: Fn(Context, Next) -> BoxFuture<'static, Context> + Send + Sync + 'static,
{
    RegisteredMiddleware::anonymous(Arc::new(FnMiddleware(f)))
}

// ── Identity side-table ─────────────────────────────────────────────────────

static NEXT_MIDDLEWARE_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle identifying one registered middleware. Exclusion lists
/// carry these (or names) instead of comparing function pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MiddlewareId(u64);

impl MiddlewareId {
    fn next() -> Self {
        Self(NEXT_MIDDLEWARE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A middleware together with its registration identity.
#[derive(Clone)]
pub struct RegisteredMiddleware {
    id: MiddlewareId,
    name: Option<Arc<str>>,
    inner: Arc<dyn Middleware>,
}

impl RegisteredMiddleware {
    pub fn anonymous(inner: Arc<dyn Middleware>) -> Self {
        Self {
            id: MiddlewareId::next(),
            name: None,
            inner,
        }
    }

    pub fn named(name: &str, inner: Arc<dyn Middleware>) -> Self {
        Self {
            id: MiddlewareId::next(),
            name: Some(Arc::from(name)),
            inner,
        }
    }

    pub fn id(&self) -> MiddlewareId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The underlying middleware, for re-registration under another name.
    pub fn into_inner(self) -> Arc<dyn Middleware> {
        self.inner
    }
}

impl fmt::Debug for RegisteredMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredMiddleware")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// A middleware reference as it appears on route and group declarations.
///
/// Named references are placeholders: they carry only the name and are
/// swapped for the registered middleware during route compilation, so a
/// missing registration fails the build and never reaches a request.
#[derive(Clone)]
pub enum MiddlewareRef {
    Named(String),
    Instance(RegisteredMiddleware),
}

impl MiddlewareRef {
    pub fn name(&self) -> Option<&str> {
        match self {
            MiddlewareRef::Named(name) => Some(name),
            MiddlewareRef::Instance(mw) => mw.name(),
        }
    }
}

impl From<&str> for MiddlewareRef {
    fn from(name: &str) -> Self {
        MiddlewareRef::Named(name.to_string())
    }
}

impl From<String> for MiddlewareRef {
    fn from(name: String) -> Self {
        MiddlewareRef::Named(name)
    }
}

impl From<RegisteredMiddleware> for MiddlewareRef {
    fn from(mw: RegisteredMiddleware) -> Self {
        MiddlewareRef::Instance(mw)
    }
}

// ── Exclusions ──────────────────────────────────────────────────────────────

/// Middlewares removed from the final stack, accumulated along the group
/// path and unioned.
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    names: HashSet<String>,
    ids: HashSet<MiddlewareId>,
}

impl ExclusionSet {
    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.ids.is_empty()
    }

    pub fn add_name(&mut self, name: impl Into<String>) {
        self.names.insert(name.into());
    }

    pub fn add_id(&mut self, id: MiddlewareId) {
        self.ids.insert(id);
    }

    pub fn union(&mut self, other: &ExclusionSet) {
        self.names.extend(other.names.iter().cloned());
        self.ids.extend(other.ids.iter().copied());
    }

    pub fn excludes(&self, mw: &RegisteredMiddleware) -> bool {
        if self.ids.contains(&mw.id()) {
            return true;
        }
        mw.name().map(|n| self.names.contains(n)).unwrap_or(false)
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

/// Error raised when a named placeholder has no registration.
#[derive(Debug)]
pub struct UnknownMiddleware {
    pub name: String,
}

impl fmt::Display for UnknownMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "middleware '{}' is not registered; register it before building routes",
            self.name
        )
    }
}

impl std::error::Error for UnknownMiddleware {}

/// Maps names to middlewares. Route compilation resolves every named
/// placeholder through this registry.
#[derive(Default)]
pub struct MiddlewareRegistry {
    by_name: HashMap<String, RegisteredMiddleware>,
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a middleware under a name, returning its identity handle.
    pub fn register(&mut self, name: &str, mw: Arc<dyn Middleware>) -> MiddlewareId {
        let registered = RegisteredMiddleware::named(name, mw);
        let id = registered.id();
        self.by_name.insert(name.to_string(), registered);
        id
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredMiddleware> {
        self.by_name.get(name)
    }

    /// Resolve a reference, replacing named placeholders with their
    /// registered middleware.
    pub fn resolve(&self, r: &MiddlewareRef) -> Result<RegisteredMiddleware, UnknownMiddleware> {
        match r {
            MiddlewareRef::Instance(mw) => Ok(mw.clone()),
            MiddlewareRef::Named(name) => self
                .by_name
                .get(name)
                .cloned()
                .ok_or_else(|| UnknownMiddleware { name: name.clone() }),
        }
    }
}

// ── Default error renderer ──────────────────────────────────────────────────

/// Outermost layer installed by default: turns accumulated errors into a
/// JSON response when no layer wrote a body.
pub struct ErrorRenderer {
    debug: bool,
}

impl ErrorRenderer {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }
}

impl Middleware for ErrorRenderer {
    fn handle(&self, ctx: Context, next: Next) -> BoxFuture<'_, Context> {
        Box::pin(async move {
            let mut ctx = next.run(ctx).await;
            if !ctx.has_response_body() {
                if let Some(err) = ctx.errors().first().cloned() {
                    tracing::debug!(error = %err, "rendering accumulated error");
                    let resp = err.to_response(self.debug);
                    let (head, body) = resp.into_parts();
                    ctx.set_status(head.status);
                    for (name, value) in head.headers.iter() {
                        if let Ok(v) = value.to_str() {
                            ctx.set_response_header(name.clone(), v);
                        }
                    }
                    ctx.set_response_body(body);
                }
            }
            ctx
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::http::{Body, Method, StatusCode};
    use std::sync::Mutex;

    fn test_ctx() -> Context {
        let req = http::Request::builder()
            .method(Method::GET)
            .uri("/")
            .body(Body::empty())
            .unwrap();
        Context::from_request(req, "127.0.0.1:4000".parse().unwrap())
    }

    fn tracer(log: Arc<Mutex<Vec<String>>>, tag: &'static str) -> RegisteredMiddleware {
        middleware_fn(move |ctx, next| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().unwrap().push(format!("{tag}_pre"));
                let ctx = next.run(ctx).await;
                log.lock().unwrap().push(format!("{tag}_post"));
                ctx
            })
        })
    }

    fn chain(stack: Vec<RegisteredMiddleware>, handler: Arc<dyn Handler>) -> Next {
        Next::new(stack.into(), handler)
    }

    #[tokio::test]
    async fn chain_runs_outer_to_inner_and_unwinds() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stack = vec![
            tracer(log.clone(), "a"),
            tracer(log.clone(), "b"),
            tracer(log.clone(), "c"),
        ];
        let l = log.clone();
        let handler = handler_fn(move |ctx| {
            let l = l.clone();
            async move {
                l.lock().unwrap().push("h".to_string());
                ctx
            }
        });

        chain(stack, handler).run(test_ctx()).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a_pre", "b_pre", "c_pre", "h", "c_post", "b_post", "a_post"]
        );
    }

    #[tokio::test]
    async fn abort_skips_inner_layers_but_unwinds_outer() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let aborter = middleware_fn(move |mut ctx: Context, next| {
            let l = l.clone();
            Box::pin(async move {
                l.lock().unwrap().push("b_pre".to_string());
                ctx.abort_with_status(StatusCode::UNAUTHORIZED, "stopped");
                let ctx = next.run(ctx).await;
                l.lock().unwrap().push("b_post".to_string());
                ctx
            })
        });
        let stack = vec![tracer(log.clone(), "a"), aborter, tracer(log.clone(), "c")];
        let l = log.clone();
        let handler = handler_fn(move |ctx| {
            let l = l.clone();
            async move {
                l.lock().unwrap().push("h".to_string());
                ctx
            }
        });

        let ctx = chain(stack, handler).run(test_ctx()).await;
        assert_eq!(ctx.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a_pre", "b_pre", "b_post", "a_post"]
        );
    }

    #[tokio::test]
    async fn registry_resolves_named_placeholders() {
        let mut registry = MiddlewareRegistry::new();
        let passthrough = middleware_fn(|ctx, next| Box::pin(next.run(ctx)));
        registry.register("auth", passthrough.inner.clone());

        let resolved = registry
            .resolve(&MiddlewareRef::Named("auth".into()))
            .unwrap();
        assert_eq!(resolved.name(), Some("auth"));

        let err = registry
            .resolve(&MiddlewareRef::Named("missing".into()))
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn exclusions_match_by_name_and_id() {
        let anonymous = middleware_fn(|ctx, next| Box::pin(next.run(ctx)));
        let mut by_id = ExclusionSet::default();
        by_id.add_id(anonymous.id());
        assert!(by_id.excludes(&anonymous));

        let mut registry = MiddlewareRegistry::new();
        let named = middleware_fn(|ctx, next| Box::pin(next.run(ctx)));
        registry.register("trace", named.inner.clone());
        let registered = registry.get("trace").unwrap();

        let mut by_name = ExclusionSet::default();
        by_name.add_name("trace");
        assert!(by_name.excludes(registered));
        assert!(!by_name.excludes(&anonymous));
    }

    #[test]
    fn exclusion_union_accumulates() {
        let mut base = ExclusionSet::default();
        base.add_name("a");
        let mut child = ExclusionSet::default();
        child.add_name("b");
        base.union(&child);
        let named_a = {
            let mut reg = MiddlewareRegistry::new();
            reg.register("a", middleware_fn(|ctx, next| Box::pin(next.run(ctx))).inner);
            reg.get("a").cloned().unwrap()
        };
        assert!(base.excludes(&named_a));
    }

    #[tokio::test]
    async fn error_renderer_writes_json_body() {
        let stack = vec![RegisteredMiddleware::anonymous(Arc::new(
            ErrorRenderer::new(true),
        ))];
        let handler = handler_fn(|mut ctx: Context| async move {
            ctx.error(EngineError::not_found("nope"));
            ctx.set_status(StatusCode::NOT_FOUND);
            ctx
        });
        let ctx = chain(stack, handler).run(test_ctx()).await;
        assert!(ctx.has_response_body());
        assert_eq!(ctx.status(), StatusCode::NOT_FOUND);
    }
}
