use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::http::Method;
use crate::middleware::{
    ExclusionSet, Handler, MiddlewareRef, MiddlewareRegistry, RegisteredMiddleware,
};
use crate::routing::router::{
    join_names, join_paths, Constraint, MethodSpec, RouteDef, Router, SourceLocation,
};

// ── Template grammar ────────────────────────────────────────────────────────

/// One piece of a parsed path template.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Token {
    Literal(String),
    Param { name: String, pattern: Option<String> },
    CatchAll { name: String },
}

fn is_valid_param_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parse `{name}`, `{name:pattern}`, and `{*name}` placeholders out of a
/// template. Patterns may contain balanced braces (regex quantifiers).
pub(crate) fn parse_template(template: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '{' {
            if c == '}' {
                return Err("unmatched '}' in template".to_string());
            }
            literal.push(c);
            continue;
        }

        if !literal.is_empty() {
            tokens.push(Token::Literal(std::mem::take(&mut literal)));
        }

        let mut depth = 1usize;
        let mut inner = String::new();
        for c in chars.by_ref() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
            inner.push(c);
        }
        if depth != 0 {
            return Err("unterminated '{' in template".to_string());
        }

        let token = if let Some(name) = inner.strip_prefix('*') {
            if !is_valid_param_name(name) {
                return Err(format!("invalid catchall name '{name}'"));
            }
            Token::CatchAll {
                name: name.to_string(),
            }
        } else if let Some((name, pattern)) = inner.split_once(':') {
            if !is_valid_param_name(name) {
                return Err(format!("invalid parameter name '{name}'"));
            }
            Token::Param {
                name: name.to_string(),
                pattern: Some(pattern.to_string()),
            }
        } else {
            if !is_valid_param_name(&inner) {
                return Err(format!("invalid parameter name '{inner}'"));
            }
            Token::Param {
                name: inner,
                pattern: None,
            }
        };
        tokens.push(token);
    }

    if !literal.is_empty() {
        tokens.push(Token::Literal(literal));
    }

    // catchall: at most one, and only at the end
    let catchall_count = tokens
        .iter()
        .filter(|t| matches!(t, Token::CatchAll { .. }))
        .count();
    if catchall_count > 1 {
        return Err("only one catchall parameter is allowed".to_string());
    }
    if catchall_count == 1 && !matches!(tokens.last(), Some(Token::CatchAll { .. })) {
        return Err("catchall parameter must be the last template element".to_string());
    }

    // duplicate parameter names break the capture groups
    let mut seen = std::collections::HashSet::new();
    for token in &tokens {
        if let Token::Param { name, .. } | Token::CatchAll { name } = token {
            if !seen.insert(name.clone()) {
                return Err(format!("duplicate parameter name '{name}'"));
            }
        }
    }

    Ok(tokens)
}

fn build_regex(tokens: &[Token]) -> Result<Regex, String> {
    let mut pattern = String::from("^");
    for token in tokens {
        match token {
            Token::Literal(lit) => pattern.push_str(&regex::escape(lit)),
            Token::Param { name, pattern: p } => {
                let inner = p.as_deref().unwrap_or("[^/]+");
                pattern.push_str(&format!("(?P<{name}>{inner})"));
            }
            Token::CatchAll { name } => {
                pattern.push_str(&format!("(?P<{name}>.*)"));
            }
        }
    }
    pattern.push('$');
    Regex::new(&pattern).map_err(|e| e.to_string())
}

// ── Constraints ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) enum CompiledConstraint {
    Int,
    Uuid,
    Alpha,
    AlphaNum,
    Regex(Regex),
}

impl CompiledConstraint {
    fn compile(constraint: &Constraint) -> Result<Self, String> {
        Ok(match constraint {
            Constraint::Int => CompiledConstraint::Int,
            Constraint::Uuid => CompiledConstraint::Uuid,
            Constraint::Alpha => CompiledConstraint::Alpha,
            Constraint::AlphaNum => CompiledConstraint::AlphaNum,
            Constraint::Regex(p) => {
                let anchored = format!("^(?:{p})$");
                CompiledConstraint::Regex(Regex::new(&anchored).map_err(|e| e.to_string())?)
            }
        })
    }

    fn validate(&self, value: &str) -> bool {
        match self {
            CompiledConstraint::Int => {
                !value.is_empty() && value.chars().all(|c| c.is_ascii_digit())
            }
            CompiledConstraint::Uuid => is_uuid(value),
            CompiledConstraint::Alpha => {
                !value.is_empty() && value.chars().all(|c| c.is_ascii_alphabetic())
            }
            CompiledConstraint::AlphaNum => {
                !value.is_empty() && value.chars().all(|c| c.is_ascii_alphanumeric())
            }
            CompiledConstraint::Regex(re) => re.is_match(value),
        }
    }
}

fn is_uuid(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    for (i, b) in bytes.iter().enumerate() {
        match i {
            8 | 13 | 18 | 23 => {
                if *b != b'-' {
                    return false;
                }
            }
            _ => {
                if !b.is_ascii_hexdigit() {
                    return false;
                }
            }
        }
    }
    true
}

// ── Compile errors ──────────────────────────────────────────────────────────

/// Errors raised while flattening the router tree. These surface at build
/// time; a running engine never sees them.
#[derive(Debug)]
pub enum CompileError {
    Template {
        route: String,
        source: SourceLocation,
        message: String,
    },
    Constraint {
        route: String,
        param: String,
        message: String,
    },
    DuplicateName {
        name: String,
        source: SourceLocation,
    },
    UnknownMiddleware {
        name: String,
        route: String,
        source: SourceLocation,
    },
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Template {
                route,
                source,
                message,
            } => write!(f, "invalid template '{route}' at {source}: {message}"),
            CompileError::Constraint {
                route,
                param,
                message,
            } => write!(f, "invalid constraint on '{param}' for '{route}': {message}"),
            CompileError::DuplicateName { name, source } => {
                write!(f, "route name '{name}' registered twice (at {source})")
            }
            CompileError::UnknownMiddleware {
                name,
                route,
                source,
            } => write!(
                f,
                "middleware '{name}' on route '{route}' (at {source}) is not registered"
            ),
        }
    }
}

impl std::error::Error for CompileError {}

/// Errors raised while generating a URL from a route name.
#[derive(Debug)]
pub enum UrlError {
    UnknownRoute(String),
    MissingParam { route: String, param: String },
    ConstraintViolation { route: String, param: String },
}

impl fmt::Display for UrlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UrlError::UnknownRoute(name) => write!(f, "no route named '{name}'"),
            UrlError::MissingParam { route, param } => {
                write!(f, "missing parameter '{param}' for route '{route}'")
            }
            UrlError::ConstraintViolation { route, param } => {
                write!(f, "parameter '{param}' fails its constraint for route '{route}'")
            }
        }
    }
}

impl std::error::Error for UrlError {}

// ── Compiled routes ─────────────────────────────────────────────────────────

/// One endpoint after compilation, consumed read-only at runtime.
pub struct CompiledRoute {
    pub method: MethodSpec,
    pub template: String,
    pub name: Option<String>,
    pub param_names: Vec<String>,
    pub stack: Arc<[RegisteredMiddleware]>,
    pub handler: Arc<dyn Handler>,
    pub constraints: HashMap<String, Constraint>,
    pub timeout: Option<Duration>,
    pub source: SourceLocation,
    pub is_fallback: bool,
    tokens: Vec<Token>,
    regex: Option<Regex>,
    validators: Vec<(String, CompiledConstraint)>,
    has_catchall: bool,
}

impl CompiledRoute {
    /// Match a path, returning captured parameters when the regex and every
    /// validator accept it.
    pub fn try_match(&self, path: &str) -> Option<HashMap<String, String>> {
        let regex = self.regex.as_ref()?;
        let captures = regex.captures(path)?;
        let mut params = HashMap::with_capacity(self.param_names.len());
        for name in &self.param_names {
            let value = captures.name(name)?.as_str().to_string();
            params.insert(name.clone(), value);
        }
        for (param, validator) in &self.validators {
            match params.get(param) {
                Some(value) if validator.validate(value) => {}
                _ => return None,
            }
        }
        Some(params)
    }
}

impl fmt::Debug for CompiledRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledRoute")
            .field("method", &self.method)
            .field("template", &self.template)
            .field("name", &self.name)
            .field("source", &self.source)
            .finish()
    }
}

/// Result of matching one request against the table.
pub enum RouteMatch<'t> {
    Found {
        route: &'t Arc<CompiledRoute>,
        params: HashMap<String, String>,
    },
    MethodMismatch {
        allow: Vec<Method>,
    },
    NotFound,
}

/// The immutable output of compilation: ordered routes plus a name index.
#[derive(Debug)]
pub struct RouteTable {
    routes: Vec<Arc<CompiledRoute>>,
    by_name: HashMap<String, usize>,
    fallback: Option<Arc<CompiledRoute>>,
}

impl RouteTable {
    /// Match a request. Non-catchall routes are tested before catchall; the
    /// first declared match wins. A path that matches under a different
    /// verb reports the allowed methods instead.
    pub fn lookup(&self, method: &Method, path: &str) -> RouteMatch<'_> {
        let mut allow: Vec<Method> = Vec::new();
        for route in &self.routes {
            if let Some(params) = route.try_match(path) {
                if route.method.matches(method) {
                    return RouteMatch::Found { route, params };
                }
                if let MethodSpec::Verb(v) = &route.method {
                    if !allow.contains(v) {
                        allow.push(v.clone());
                    }
                }
            }
        }
        if allow.is_empty() {
            RouteMatch::NotFound
        } else {
            RouteMatch::MethodMismatch { allow }
        }
    }

    pub fn fallback(&self) -> Option<&Arc<CompiledRoute>> {
        self.fallback.as_ref()
    }

    pub fn routes(&self) -> &[Arc<CompiledRoute>] {
        &self.routes
    }

    pub fn route_named(&self, name: &str) -> Option<&Arc<CompiledRoute>> {
        self.by_name.get(name).map(|idx| &self.routes[*idx])
    }

    /// Generate a URL for a named route, substituting and percent-encoding
    /// each parameter.
    pub fn url_for(&self, name: &str, params: &HashMap<String, String>) -> Result<String, UrlError> {
        let route = self
            .route_named(name)
            .ok_or_else(|| UrlError::UnknownRoute(name.to_string()))?;
        let mut url = String::new();
        for token in &route.tokens {
            match token {
                Token::Literal(lit) => url.push_str(lit),
                Token::Param { name: param, .. } | Token::CatchAll { name: param } => {
                    let value = params.get(param).ok_or_else(|| UrlError::MissingParam {
                        route: name.to_string(),
                        param: param.clone(),
                    })?;
                    let valid = route
                        .validators
                        .iter()
                        .filter(|(p, _)| p == param)
                        .all(|(_, v)| v.validate(value));
                    if !valid {
                        return Err(UrlError::ConstraintViolation {
                            route: name.to_string(),
                            param: param.clone(),
                        });
                    }
                    let keep_slash = matches!(token, Token::CatchAll { .. });
                    url.push_str(&encode_component(value, keep_slash));
                }
            }
        }
        Ok(url)
    }
}

fn encode_component(value: &str, keep_slash: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            b'/' if keep_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

// ── Compiler ────────────────────────────────────────────────────────────────

struct Frame {
    node: usize,
    prefix: String,
    name: String,
    middlewares: Vec<MiddlewareRef>,
    exclusions: ExclusionSet,
    timeout: Option<Duration>,
}

/// Flatten a router tree into a [`RouteTable`].
///
/// Accumulates prefixes, dotted names, middlewares, and exclusion sets along
/// each group path; resolves named middleware placeholders through the
/// registry; and orders routes so non-catchall templates are tested first
/// while insertion order is otherwise preserved.
pub fn compile(router: Router, registry: &MiddlewareRegistry) -> Result<RouteTable, CompileError> {
    let Router {
        nodes, fallback, ..
    } = router;

    let mut compiled: Vec<(bool, u64, Arc<CompiledRoute>)> = Vec::new();
    let mut stack = vec![Frame {
        node: 0,
        prefix: String::new(),
        name: String::new(),
        middlewares: Vec::new(),
        exclusions: ExclusionSet::default(),
        timeout: None,
    }];

    while let Some(frame) = stack.pop() {
        let node = &nodes[frame.node];
        let prefix = join_paths(&frame.prefix, &node.prefix);
        let name = join_names(&frame.name, node.name.as_deref().unwrap_or(""));
        let mut middlewares = frame.middlewares.clone();
        middlewares.extend(node.middlewares.iter().cloned());
        let mut exclusions = frame.exclusions.clone();
        exclusions.union(&node.exclusions);
        let timeout = node.timeout.or(frame.timeout);

        for route in &node.routes {
            let (has_catchall, entry) = compile_route(
                route, &prefix, &name, &middlewares, &exclusions, timeout, registry, false,
            )?;
            compiled.push((has_catchall, route.seq, entry));
        }

        // children pushed in reverse so the walk visits them in declaration
        // order (the stack reverses)
        for child in node.children.iter().rev() {
            stack.push(Frame {
                node: *child,
                prefix: prefix.clone(),
                name: name.clone(),
                middlewares: middlewares.clone(),
                exclusions: exclusions.clone(),
                timeout,
            });
        }
    }

    let fallback = match &fallback {
        Some(def) => {
            let root = &nodes[0];
            let mut exclusions = ExclusionSet::default();
            exclusions.union(&root.exclusions);
            let (_, route) = compile_route(
                def,
                "",
                "",
                &root.middlewares,
                &exclusions,
                root.timeout,
                registry,
                true,
            )?;
            Some(route)
        }
        None => None,
    };

    // non-catchall before catchall, declaration order within each bucket
    compiled.sort_by_key(|(has_catchall, seq, _)| (*has_catchall, *seq));

    let mut by_name = HashMap::new();
    let routes: Vec<Arc<CompiledRoute>> = compiled.into_iter().map(|(_, _, r)| r).collect();
    for (idx, route) in routes.iter().enumerate() {
        if let Some(name) = &route.name {
            if by_name.insert(name.clone(), idx).is_some() {
                return Err(CompileError::DuplicateName {
                    name: name.clone(),
                    source: route.source,
                });
            }
        }
    }

    Ok(RouteTable {
        routes,
        by_name,
        fallback,
    })
}

#[allow(clippy::too_many_arguments)]
fn compile_route(
    route: &RouteDef,
    prefix: &str,
    group_name: &str,
    inherited: &[MiddlewareRef],
    exclusions: &ExclusionSet,
    group_timeout: Option<Duration>,
    registry: &MiddlewareRegistry,
    is_fallback: bool,
) -> Result<(bool, Arc<CompiledRoute>), CompileError> {
    let template = join_paths(prefix, &route.path);

    let (tokens, regex, has_catchall) = if is_fallback {
        (Vec::new(), None, true)
    } else {
        let tokens = parse_template(&template).map_err(|message| CompileError::Template {
            route: template.clone(),
            source: route.source,
            message,
        })?;
        let regex = build_regex(&tokens).map_err(|message| CompileError::Template {
            route: template.clone(),
            source: route.source,
            message,
        })?;
        let has_catchall = tokens.iter().any(|t| matches!(t, Token::CatchAll { .. }));
        (tokens, Some(regex), has_catchall)
    };

    let param_names: Vec<String> = tokens
        .iter()
        .filter_map(|t| match t {
            Token::Param { name, .. } | Token::CatchAll { name } => Some(name.clone()),
            Token::Literal(_) => None,
        })
        .collect();

    let mut validators = Vec::new();
    for (param, constraint) in &route.constraints {
        let compiled =
            CompiledConstraint::compile(constraint).map_err(|message| CompileError::Constraint {
                route: template.clone(),
                param: param.clone(),
                message,
            })?;
        validators.push((param.clone(), compiled));
    }

    let mut all_exclusions = exclusions.clone();
    all_exclusions.union(&route.exclusions);

    let mut refs: Vec<MiddlewareRef> = inherited.to_vec();
    refs.extend(route.middlewares.iter().cloned());

    let mut stack = Vec::with_capacity(refs.len());
    for r in &refs {
        let resolved = registry
            .resolve(r)
            .map_err(|e| CompileError::UnknownMiddleware {
                name: e.name,
                route: template.clone(),
                source: route.source,
            })?;
        if !all_exclusions.excludes(&resolved) {
            stack.push(resolved);
        }
    }

    let name = route
        .name
        .as_deref()
        .map(|n| join_names(group_name, n))
        .filter(|n| !n.is_empty());

    Ok((
        has_catchall,
        Arc::new(CompiledRoute {
            method: route.method.clone(),
            template,
            name,
            param_names,
            stack: stack.into(),
            handler: route.handler.clone(),
            constraints: route.constraints.clone(),
            timeout: route.timeout.or(group_timeout),
            source: route.source,
            is_fallback,
            tokens,
            regex,
            validators,
            has_catchall,
        }),
    ))
}
