pub mod config;
pub mod container;
pub mod context;
pub mod cookie;
pub mod error;
pub mod forward;
pub mod http;
pub mod middleware;
pub mod negotiate;
pub mod routing;
pub mod serve;
pub mod sse;

pub use config::{ConfigError, ConfigValue, FromConfigValue, RoutedConfig};
pub use container::{Container, ContainerError};
pub use context::{Context, Offer};
pub use cookie::{Cookie, SameSite};
pub use error::{EngineError, ErrorKind};
pub use forward::ForwardOptions;
pub use middleware::{
    handler_fn, middleware_fn, BoxFuture, ErrorRenderer, ExclusionSet, Handler, Middleware,
    MiddlewareId, MiddlewareRef, MiddlewareRegistry, Next, RegisteredMiddleware,
};
pub use routing::compile::{CompileError, CompiledRoute, RouteMatch, RouteTable, UrlError};
pub use routing::dispatch::{
    ClientIpResolver, Engine, EngineBuilder, GateDecision, GateRequest, PolicyGate,
};
pub use routing::router::{Constraint, MethodSpec, RouteBuilder, Router, Scope, SourceLocation};
pub use serve::{listen, serve};
pub use sse::{sse_body, SseBroadcaster, SseEvent};

pub mod prelude {
    //! The types almost every application touches.
    pub use crate::config::RoutedConfig;
    pub use crate::container::Container;
    pub use crate::context::{Context, Offer};
    pub use crate::cookie::{Cookie, SameSite};
    pub use crate::error::EngineError;
    pub use crate::http::{Body, Method, Request, Response, StatusCode};
    pub use crate::middleware::{handler_fn, middleware_fn, MiddlewareRegistry, Next};
    pub use crate::routing::dispatch::Engine;
    pub use crate::routing::router::{Constraint, Router};
    pub use crate::sse::SseEvent;
}
