use std::collections::HashMap;
use std::panic::Location;
use std::sync::Arc;

use crate::http::Method;
use crate::middleware::{ExclusionSet, Handler, MiddlewareId, MiddlewareRef};

/// Where a route was registered, for build-time diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
}

impl SourceLocation {
    #[track_caller]
    fn caller() -> Self {
        let loc = Location::caller();
        Self {
            file: loc.file(),
            line: loc.line(),
            column: loc.column(),
        }
    }
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// The verbs a route answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodSpec {
    Any,
    Verb(Method),
}

const ALLOWED_VERBS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "OPTIONS", "CONNECT",
];

impl MethodSpec {
    /// Parse an uppercase verb or `*`.
    pub fn parse(s: &str) -> Result<Self, InvalidMethod> {
        if s == "*" {
            return Ok(MethodSpec::Any);
        }
        if ALLOWED_VERBS.contains(&s) {
            // the allowed set is exactly the verbs `Method` parses
            s.parse::<Method>()
                .map(MethodSpec::Verb)
                .map_err(|_| InvalidMethod(s.to_string()))
        } else {
            Err(InvalidMethod(s.to_string()))
        }
    }

    pub fn matches(&self, method: &Method) -> bool {
        match self {
            MethodSpec::Any => true,
            MethodSpec::Verb(v) => v == method,
        }
    }
}

/// A method string outside the allowed verb set.
#[derive(Debug)]
pub struct InvalidMethod(pub String);

impl std::fmt::Display for InvalidMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid route method '{}'", self.0)
    }
}

impl std::error::Error for InvalidMethod {}

/// A post-match check on one captured parameter.
#[derive(Debug, Clone)]
pub enum Constraint {
    Int,
    Uuid,
    Alpha,
    AlphaNum,
    Regex(String),
}

/// One declared endpoint, before compilation.
pub struct RouteDef {
    pub(crate) method: MethodSpec,
    pub(crate) path: String,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) middlewares: Vec<MiddlewareRef>,
    pub(crate) exclusions: ExclusionSet,
    pub(crate) name: Option<String>,
    pub(crate) constraints: HashMap<String, Constraint>,
    pub(crate) timeout: Option<std::time::Duration>,
    pub(crate) source: SourceLocation,
    /// Global declaration order, so precedence survives the tree walk.
    pub(crate) seq: u64,
}

pub(crate) struct GroupNode {
    pub(crate) prefix: String,
    pub(crate) name: Option<String>,
    pub(crate) middlewares: Vec<MiddlewareRef>,
    pub(crate) exclusions: ExclusionSet,
    pub(crate) timeout: Option<std::time::Duration>,
    pub(crate) children: Vec<usize>,
    pub(crate) routes: Vec<RouteDef>,
}

impl GroupNode {
    fn new(prefix: String) -> Self {
        Self {
            prefix,
            name: None,
            middlewares: Vec::new(),
            exclusions: ExclusionSet::default(),
            timeout: None,
            children: Vec::new(),
            routes: Vec::new(),
        }
    }
}

/// Join two path fragments with exactly one `/` at the boundary.
/// Empty fragments are identity.
pub fn join_paths(base: &str, child: &str) -> String {
    if base.is_empty() {
        return child.to_string();
    }
    if child.is_empty() {
        return base.to_string();
    }
    match (base.ends_with('/'), child.starts_with('/')) {
        (true, true) => format!("{}{}", base, &child[1..]),
        (false, false) => format!("{base}/{child}"),
        _ => format!("{base}{child}"),
    }
}

/// Join dotted name segments, skipping empty ones.
pub fn join_names(base: &str, child: &str) -> String {
    match (base.is_empty(), child.is_empty()) {
        (true, _) => child.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{base}.{child}"),
    }
}

/// Build-time tree of route groups.
///
/// Groups live in an arena indexed by `usize`; node 0 is the root. The tree
/// only exists while routes are declared — compilation flattens it into an
/// immutable table and the tree is dropped.
pub struct Router {
    pub(crate) nodes: Vec<GroupNode>,
    pub(crate) fallback: Option<RouteDef>,
    pub(crate) next_seq: u64,
}

impl Router {
    pub fn new() -> Self {
        Self {
            nodes: vec![GroupNode::new(String::new())],
            fallback: None,
            next_seq: 0,
        }
    }

    /// The root scope, for registering routes and groups.
    pub fn root(&mut self) -> Scope<'_> {
        Scope {
            router: self,
            node: 0,
        }
    }

    #[track_caller]
    pub fn get(&mut self, path: &str, handler: Arc<dyn Handler>) -> RouteBuilder<'_> {
        self.route_at(0, MethodSpec::Verb(Method::GET), path, handler)
    }

    #[track_caller]
    pub fn post(&mut self, path: &str, handler: Arc<dyn Handler>) -> RouteBuilder<'_> {
        self.route_at(0, MethodSpec::Verb(Method::POST), path, handler)
    }

    #[track_caller]
    pub fn put(&mut self, path: &str, handler: Arc<dyn Handler>) -> RouteBuilder<'_> {
        self.route_at(0, MethodSpec::Verb(Method::PUT), path, handler)
    }

    #[track_caller]
    pub fn patch(&mut self, path: &str, handler: Arc<dyn Handler>) -> RouteBuilder<'_> {
        self.route_at(0, MethodSpec::Verb(Method::PATCH), path, handler)
    }

    #[track_caller]
    pub fn delete(&mut self, path: &str, handler: Arc<dyn Handler>) -> RouteBuilder<'_> {
        self.route_at(0, MethodSpec::Verb(Method::DELETE), path, handler)
    }

    #[track_caller]
    pub fn options(&mut self, path: &str, handler: Arc<dyn Handler>) -> RouteBuilder<'_> {
        self.route_at(0, MethodSpec::Verb(Method::OPTIONS), path, handler)
    }

    #[track_caller]
    pub fn head(&mut self, path: &str, handler: Arc<dyn Handler>) -> RouteBuilder<'_> {
        self.route_at(0, MethodSpec::Verb(Method::HEAD), path, handler)
    }

    /// Register under every verb.
    #[track_caller]
    pub fn any(&mut self, path: &str, handler: Arc<dyn Handler>) -> RouteBuilder<'_> {
        self.route_at(0, MethodSpec::Any, path, handler)
    }

    /// Generic registration; `method` is an uppercase verb or `*`.
    #[track_caller]
    pub fn handle(
        &mut self,
        method: &str,
        path: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<RouteBuilder<'_>, InvalidMethod> {
        let spec = MethodSpec::parse(method)?;
        Ok(self.route_at(0, spec, path, handler))
    }

    #[track_caller]
    pub(crate) fn route_at(
        &mut self,
        node: usize,
        method: MethodSpec,
        path: &str,
        handler: Arc<dyn Handler>,
    ) -> RouteBuilder<'_> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let def = RouteDef {
            method,
            path: path.to_string(),
            handler,
            middlewares: Vec::new(),
            exclusions: ExclusionSet::default(),
            name: None,
            constraints: HashMap::new(),
            timeout: None,
            source: SourceLocation::caller(),
            seq,
        };
        let routes = &mut self.nodes[node].routes;
        routes.push(def);
        let route = routes.len() - 1;
        RouteBuilder {
            router: self,
            node,
            route,
        }
    }

    /// Register the route matched only when nothing else matches the path.
    #[track_caller]
    pub fn fallback(&mut self, handler: Arc<dyn Handler>) {
        self.fallback = Some(RouteDef {
            method: MethodSpec::Any,
            path: String::new(),
            handler,
            middlewares: Vec::new(),
            exclusions: ExclusionSet::default(),
            name: None,
            constraints: HashMap::new(),
            timeout: None,
            source: SourceLocation::caller(),
            seq: u64::MAX,
        });
    }

    /// Open a nested group under the root.
    #[track_caller]
    pub fn group<F>(&mut self, prefix: &str, f: F) -> &mut Self
    where
        F: FnOnce(&mut Scope<'_>),
    {
        self.root().group(prefix, f);
        self
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// A mutable view over one group node.
pub struct Scope<'r> {
    router: &'r mut Router,
    node: usize,
}

impl<'r> Scope<'r> {
    /// Set the group's name segment.
    pub fn name(&mut self, name: &str) -> &mut Self {
        self.router.nodes[self.node].name = Some(name.to_string());
        self
    }

    /// Append a group-level middleware.
    pub fn middleware(&mut self, mw: impl Into<MiddlewareRef>) -> &mut Self {
        self.router.nodes[self.node].middlewares.push(mw.into());
        self
    }

    /// Exclude an inherited middleware by name for this subtree.
    pub fn exclude(&mut self, name: &str) -> &mut Self {
        self.router.nodes[self.node].exclusions.add_name(name);
        self
    }

    /// Exclude an inherited middleware by identity handle.
    pub fn exclude_id(&mut self, id: MiddlewareId) -> &mut Self {
        self.router.nodes[self.node].exclusions.add_id(id);
        self
    }

    /// Timeout applied to every route in this subtree unless overridden.
    pub fn timeout(&mut self, timeout: std::time::Duration) -> &mut Self {
        self.router.nodes[self.node].timeout = Some(timeout);
        self
    }

    /// Open a nested group.
    #[track_caller]
    pub fn group<F>(&mut self, prefix: &str, f: F) -> &mut Self
    where
        F: FnOnce(&mut Scope<'_>),
    {
        let idx = self.router.nodes.len();
        self.router.nodes.push(GroupNode::new(prefix.to_string()));
        self.router.nodes[self.node].children.push(idx);
        let mut scope = Scope {
            router: self.router,
            node: idx,
        };
        f(&mut scope);
        self
    }

    #[track_caller]
    pub fn get(&mut self, path: &str, handler: Arc<dyn Handler>) -> RouteBuilder<'_> {
        self.route(MethodSpec::Verb(Method::GET), path, handler)
    }

    #[track_caller]
    pub fn post(&mut self, path: &str, handler: Arc<dyn Handler>) -> RouteBuilder<'_> {
        self.route(MethodSpec::Verb(Method::POST), path, handler)
    }

    #[track_caller]
    pub fn put(&mut self, path: &str, handler: Arc<dyn Handler>) -> RouteBuilder<'_> {
        self.route(MethodSpec::Verb(Method::PUT), path, handler)
    }

    #[track_caller]
    pub fn patch(&mut self, path: &str, handler: Arc<dyn Handler>) -> RouteBuilder<'_> {
        self.route(MethodSpec::Verb(Method::PATCH), path, handler)
    }

    #[track_caller]
    pub fn delete(&mut self, path: &str, handler: Arc<dyn Handler>) -> RouteBuilder<'_> {
        self.route(MethodSpec::Verb(Method::DELETE), path, handler)
    }

    #[track_caller]
    pub fn options(&mut self, path: &str, handler: Arc<dyn Handler>) -> RouteBuilder<'_> {
        self.route(MethodSpec::Verb(Method::OPTIONS), path, handler)
    }

    #[track_caller]
    pub fn head(&mut self, path: &str, handler: Arc<dyn Handler>) -> RouteBuilder<'_> {
        self.route(MethodSpec::Verb(Method::HEAD), path, handler)
    }

    #[track_caller]
    pub fn any(&mut self, path: &str, handler: Arc<dyn Handler>) -> RouteBuilder<'_> {
        self.route(MethodSpec::Any, path, handler)
    }

    #[track_caller]
    pub fn handle(
        &mut self,
        method: &str,
        path: &str,
        handler: Arc<dyn Handler>,
    ) -> Result<RouteBuilder<'_>, InvalidMethod> {
        let spec = MethodSpec::parse(method)?;
        Ok(self.route(spec, path, handler))
    }

    #[track_caller]
    fn route(
        &mut self,
        method: MethodSpec,
        path: &str,
        handler: Arc<dyn Handler>,
    ) -> RouteBuilder<'_> {
        self.router.route_at(self.node, method, path, handler)
    }
}

/// Fluent attachment of name, constraints, middlewares, and exclusions to a
/// just-registered route.
pub struct RouteBuilder<'r> {
    router: &'r mut Router,
    node: usize,
    route: usize,
}

impl RouteBuilder<'_> {
    fn def(&mut self) -> &mut RouteDef {
        &mut self.router.nodes[self.node].routes[self.route]
    }

    /// Dotted route name, joined onto the group names.
    pub fn name(mut self, name: &str) -> Self {
        self.def().name = Some(name.to_string());
        self
    }

    /// Add a post-match constraint on one parameter.
    pub fn constrain(mut self, param: &str, constraint: Constraint) -> Self {
        self.def().constraints.insert(param.to_string(), constraint);
        self
    }

    /// Append a route-local middleware.
    pub fn middleware(mut self, mw: impl Into<MiddlewareRef>) -> Self {
        self.def().middlewares.push(mw.into());
        self
    }

    /// Exclude an inherited middleware by name.
    pub fn exclude(mut self, name: &str) -> Self {
        self.def().exclusions.add_name(name);
        self
    }

    /// Exclude an inherited middleware by identity handle.
    pub fn exclude_id(mut self, id: MiddlewareId) -> Self {
        self.def().exclusions.add_id(id);
        self
    }

    /// Per-route timeout, overriding any group timeout.
    pub fn timeout(mut self, timeout: std::time::Duration) -> Self {
        self.def().timeout = Some(timeout);
        self
    }
}
