use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::config::RoutedConfig;
use crate::context::Context;
use crate::error::EngineError;
use crate::http::{HeaderMap, Method, Request, Response};
use crate::middleware::{
    BoxFuture, ErrorRenderer, MiddlewareRegistry, Next, RegisteredMiddleware,
};
use crate::routing::compile::{compile, CompileError, CompiledRoute, RouteMatch, RouteTable, UrlError};
use crate::routing::router::Router;

/// Derives the client address a request should be attributed to, given the
/// transport peer and the request headers.
pub trait ClientIpResolver: Send + Sync + 'static {
    fn resolve(&self, remote: IpAddr, headers: &HeaderMap) -> IpAddr;
}

/// The slice of a request visible to policy gates, before any context is
/// built.
pub struct GateRequest<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub remote_addr: IpAddr,
    pub client_ip: IpAddr,
}

/// Outcome of one policy gate.
pub enum GateDecision {
    Allow,
    Deny(EngineError),
}

/// A cross-cutting policy evaluated before route matching: IP filtering,
/// rate limiting. A denial short-circuits the request; no user middleware
/// runs.
pub trait PolicyGate: Send + Sync + 'static {
    fn check<'a>(&'a self, req: &'a GateRequest<'a>) -> BoxFuture<'a, GateDecision>;
}

/// Builder collecting the route tree, middleware registry, gates, and
/// engine-wide settings.
pub struct EngineBuilder {
    router: Router,
    registry: MiddlewareRegistry,
    resolver: Option<Arc<dyn ClientIpResolver>>,
    gates: Vec<Arc<dyn PolicyGate>>,
    debug: bool,
}

impl EngineBuilder {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            registry: MiddlewareRegistry::new(),
            resolver: None,
            gates: Vec::new(),
            debug: false,
        }
    }

    pub fn middleware_registry(mut self, registry: MiddlewareRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn client_ip_resolver(mut self, resolver: Arc<dyn ClientIpResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn gate(mut self, gate: Arc<dyn PolicyGate>) -> Self {
        self.gates.push(gate);
        self
    }

    /// Expose error messages in 500 responses. Off by default.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Read engine-wide settings from the configuration.
    pub fn configure(self, config: &RoutedConfig) -> Self {
        let debug = config.get_or("server.debug", false).unwrap_or(false);
        self.debug(debug)
    }

    /// Compile the tree and produce an immutable engine. The default error
    /// renderer is installed outermost on every route.
    pub fn build(self) -> Result<Engine, CompileError> {
        let table = compile(self.router, &self.registry)?;
        let renderer = RegisteredMiddleware::anonymous(Arc::new(ErrorRenderer::new(self.debug)));
        Ok(Engine {
            table: Arc::new(table),
            renderer,
            resolver: self.resolver,
            gates: self.gates,
            debug: self.debug,
        })
    }
}

/// The request dispatcher.
///
/// Everything inside is immutable after [`EngineBuilder::build`]; dispatch
/// borrows shared state only, so an `Arc<Engine>` serves any number of
/// connections concurrently.
pub struct Engine {
    table: Arc<RouteTable>,
    renderer: RegisteredMiddleware,
    resolver: Option<Arc<dyn ClientIpResolver>>,
    gates: Vec<Arc<dyn PolicyGate>>,
    debug: bool,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    pub fn builder(router: Router) -> EngineBuilder {
        EngineBuilder::new(router)
    }

    pub fn routes(&self) -> &RouteTable {
        &self.table
    }

    /// Generate a URL for a named route.
    pub fn url_for(
        &self,
        name: &str,
        params: &HashMap<String, String>,
    ) -> Result<String, UrlError> {
        self.table.url_for(name, params)
    }

    /// Process one request end to end.
    ///
    /// Order: client-IP resolution, policy gates, route matching, context
    /// construction, middleware chain, response finalization. Gate denials
    /// and match failures short-circuit before any user middleware runs.
    pub async fn dispatch(&self, req: Request, remote_addr: SocketAddr) -> Response {
        let client_ip = match &self.resolver {
            Some(resolver) => resolver.resolve(remote_addr.ip(), req.headers()),
            None => remote_addr.ip(),
        };

        let gate_req = GateRequest {
            method: req.method(),
            path: req.uri().path(),
            headers: req.headers(),
            remote_addr: remote_addr.ip(),
            client_ip,
        };
        for gate in &self.gates {
            if let GateDecision::Deny(err) = gate.check(&gate_req).await {
                tracing::warn!(
                    client_ip = %client_ip,
                    path = gate_req.path,
                    status = %err.status(),
                    "request denied by policy gate"
                );
                return err.to_response(self.debug);
            }
        }

        let (route, params) = match self.table.lookup(req.method(), req.uri().path()) {
            RouteMatch::Found { route, params } => (route.clone(), params),
            RouteMatch::MethodMismatch { allow } => {
                tracing::debug!(path = req.uri().path(), "method mismatch");
                return EngineError::method_not_allowed(allow).to_response(self.debug);
            }
            RouteMatch::NotFound => match self.table.fallback() {
                Some(fallback) => (fallback.clone(), HashMap::new()),
                None => {
                    tracing::debug!(path = req.uri().path(), "no route matched");
                    return EngineError::not_found("resource not found").to_response(self.debug);
                }
            },
        };

        tracing::debug!(
            template = %route.template,
            source = %route.source,
            "route matched"
        );

        let mut ctx = Context::from_request(req, remote_addr);
        ctx.set_client_ip(client_ip);
        ctx.set_params(params);
        ctx.set_route_name(route.name.clone());
        ctx.set_debug(self.debug);

        let cancel = CancellationToken::new();
        ctx.set_cancel_token(cancel.clone());
        // fires the cancel signal if the connection drops and this future
        // is dropped mid-flight; disarmed once the chain produced a response
        let guard = cancel.clone().drop_guard();

        let response = self.run_chain(&route, ctx, cancel).await;
        let _ = guard.disarm();
        response
    }

    async fn run_chain(
        &self,
        route: &Arc<CompiledRoute>,
        ctx: Context,
        cancel: CancellationToken,
    ) -> Response {
        let mut stack = Vec::with_capacity(route.stack.len() + 1);
        stack.push(self.renderer.clone());
        stack.extend(route.stack.iter().cloned());
        let next = Next::new(stack.into(), route.handler.clone());

        let chain = std::panic::AssertUnwindSafe(next.run(ctx)).catch_unwind();

        let outcome = match route.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, chain).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    cancel.cancel();
                    tracing::warn!(template = %route.template, ?timeout, "route timed out");
                    return EngineError::timeout("request timed out").to_response(self.debug);
                }
            },
            None => chain.await,
        };

        match outcome {
            Ok(ctx) => ctx.finalize(),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(template = %route.template, message, "handler panicked");
                EngineError::internal(format!("handler panicked: {message}"))
                    .to_response(self.debug)
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Body, StatusCode, ALLOW};
    use std::time::Duration;
    use crate::middleware::{handler_fn, middleware_fn};
    use http_body_util::BodyExt;
    use serde_json::json;

    fn request(method: Method, uri: &str) -> Request {
        http::Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn remote() -> SocketAddr {
        "127.0.0.1:5000".parse().unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn path_params_reach_the_handler() {
        let mut router = Router::new();
        router.get(
            "/users/{id}/posts/{postId}",
            handler_fn(|mut ctx: Context| async move {
                let id = ctx.param("id").unwrap_or_default().to_string();
                let post = ctx.param("postId").unwrap_or_default().to_string();
                ctx.json(&json!({"id": id, "postId": post}), StatusCode::OK);
                ctx
            }),
        );
        let engine = Engine::builder(router).build().unwrap();

        let resp = engine
            .dispatch(request(Method::GET, "/users/42/posts/7"), remote())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body, json!({"id": "42", "postId": "7"}));
    }

    #[tokio::test]
    async fn unmatched_path_is_404() {
        let mut router = Router::new();
        router.get("/registered", handler_fn(|ctx| async move { ctx }));
        let engine = Engine::builder(router).build().unwrap();

        let resp = engine
            .dispatch(request(Method::GET, "/unregistered"), remote())
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn fallback_handles_unmatched_paths() {
        let mut router = Router::new();
        router.get("/registered", handler_fn(|ctx| async move { ctx }));
        router.fallback(handler_fn(|mut ctx: Context| async move {
            ctx.set_status(StatusCode::NOT_FOUND);
            ctx.string("fell through");
            ctx
        }));
        let engine = Engine::builder(router).build().unwrap();

        let resp = engine
            .dispatch(request(Method::GET, "/unregistered"), remote())
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"fell through");
    }

    #[tokio::test]
    async fn method_mismatch_is_405_with_allow() {
        let mut router = Router::new();
        router.get("/x", handler_fn(|ctx| async move { ctx }));
        let engine = Engine::builder(router).build().unwrap();

        let resp = engine.dispatch(request(Method::PUT, "/x"), remote()).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(resp.headers().get(ALLOW).unwrap(), "GET");
    }

    #[tokio::test]
    async fn aborting_middleware_skips_handler() {
        let mut router = Router::new();
        router
            .get(
                "/guarded",
                handler_fn(|mut ctx: Context| async move {
                    ctx.string("handler ran");
                    ctx
                }),
            )
            .middleware(middleware_fn(|mut ctx: Context, next| {
                Box::pin(async move {
                    ctx.abort_with_status(StatusCode::UNAUTHORIZED, "stopped");
                    next.run(ctx).await
                })
            }));
        let engine = Engine::builder(router).build().unwrap();

        let resp = engine
            .dispatch(request(Method::GET, "/guarded"), remote())
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"stopped");
    }

    #[tokio::test]
    async fn panicking_handler_becomes_500() {
        let mut router = Router::new();
        router.get(
            "/boom",
            handler_fn(|_ctx: Context| async move { panic!("kaboom") }),
        );
        let engine = Engine::builder(router).debug(true).build().unwrap();

        let resp = engine.dispatch(request(Method::GET, "/boom"), remote()).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(resp).await;
        assert!(body["message"].as_str().unwrap().contains("kaboom"));
    }

    #[tokio::test]
    async fn release_mode_hides_internal_messages() {
        let mut router = Router::new();
        router.get(
            "/boom",
            handler_fn(|_ctx: Context| async move { panic!("secret detail") }),
        );
        let engine = Engine::builder(router).debug(false).build().unwrap();

        let resp = engine.dispatch(request(Method::GET, "/boom"), remote()).await;
        let body = body_json(resp).await;
        assert_eq!(body["message"], "internal server error");
    }

    #[tokio::test]
    async fn timeout_yields_504_and_fires_cancel() {
        let mut router = Router::new();
        router
            .get(
                "/slow",
                handler_fn(|ctx: Context| async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    ctx
                }),
            )
            .timeout(Duration::from_millis(20));
        let engine = Engine::builder(router).build().unwrap();

        let resp = engine.dispatch(request(Method::GET, "/slow"), remote()).await;
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    struct DenyAll;

    impl PolicyGate for DenyAll {
        fn check<'a>(&'a self, _req: &'a GateRequest<'a>) -> BoxFuture<'a, GateDecision> {
            Box::pin(async { GateDecision::Deny(EngineError::forbidden("blocked")) })
        }
    }

    #[tokio::test]
    async fn gate_denial_short_circuits() {
        let mut router = Router::new();
        router.get(
            "/x",
            handler_fn(|mut ctx: Context| async move {
                ctx.string("should not run");
                ctx
            }),
        );
        let engine = Engine::builder(router).gate(Arc::new(DenyAll)).build().unwrap();

        let resp = engine.dispatch(request(Method::GET, "/x"), remote()).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    struct FixedIp(IpAddr);

    impl ClientIpResolver for FixedIp {
        fn resolve(&self, _remote: IpAddr, _headers: &HeaderMap) -> IpAddr {
            self.0
        }
    }

    #[tokio::test]
    async fn resolved_ip_reaches_the_context() {
        let mut router = Router::new();
        router.get(
            "/ip",
            handler_fn(|mut ctx: Context| async move {
                let ip = ctx.client_ip().to_string();
                ctx.string(ip);
                ctx
            }),
        );
        let engine = Engine::builder(router)
            .client_ip_resolver(Arc::new(FixedIp("203.0.113.5".parse().unwrap())))
            .build()
            .unwrap();

        let resp = engine.dispatch(request(Method::GET, "/ip"), remote()).await;
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"203.0.113.5");
    }

    #[tokio::test]
    async fn must_accessor_error_renders_json() {
        let mut router = Router::new();
        router.get(
            "/strict",
            handler_fn(|mut ctx: Context| async move {
                let _ = ctx.must_param("missing");
                ctx
            }),
        );
        let engine = Engine::builder(router).debug(true).build().unwrap();

        let resp = engine
            .dispatch(request(Method::GET, "/strict"), remote())
            .await;
        let body = body_json(resp).await;
        assert_eq!(body["error"], "bad_request");
        assert_eq!(body["code"], "missing_param");
    }
}
