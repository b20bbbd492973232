use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::OnceLock;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::cookie::{parse_cookie_header, Cookie};
use crate::error::EngineError;
use crate::http::{
    Body, HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri,
    CONTENT_TYPE, COOKIE, SET_COOKIE, VARY,
};
use crate::negotiate::best_offer;

/// A content-type offer for [`Context::negotiate`].
pub struct Offer {
    content_type: String,
    produce: Box<dyn FnOnce(&mut Context) + Send>,
}

impl Offer {
    pub fn new(
        content_type: impl Into<String>,
        produce: impl FnOnce(&mut Context) + Send + 'static,
    ) -> Self {
        Self {
            content_type: content_type.into(),
            produce: Box::new(produce),
        }
    }
}

/// Per-request state threaded through the middleware chain.
///
/// A fresh context is built for every dispatched request and destroyed once
/// the response is written. It owns the request snapshot, the route params,
/// a typed data bag for inter-middleware communication, the accumulated
/// error list, and the response under construction. The chain passes it by
/// value; only the request's own task ever touches it.
pub struct Context {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    remote_addr: SocketAddr,
    client_ip: IpAddr,
    body: Option<Body>,
    body_bytes: Option<Bytes>,
    params: HashMap<String, String>,
    route_name: Option<String>,

    data: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    errors: Vec<EngineError>,
    aborted: bool,
    locale: Option<String>,
    cancel: CancellationToken,
    debug: bool,

    query_cache: OnceLock<Vec<(String, String)>>,
    request_cookies: OnceLock<HashMap<String, String>>,

    status: StatusCode,
    response_headers: HeaderMap,
    response_body: Option<Body>,
    response_cookies: Vec<Cookie>,
}

impl Context {
    /// Build a context from a request. Used by the dispatcher; also handy
    /// for driving middleware directly in tests.
    pub fn from_request(req: Request, remote_addr: SocketAddr) -> Self {
        let (parts, body) = req.into_parts();
        Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            remote_addr,
            client_ip: remote_addr.ip(),
            body: Some(body),
            body_bytes: None,
            params: HashMap::new(),
            route_name: None,
            data: HashMap::new(),
            errors: Vec::new(),
            aborted: false,
            locale: None,
            cancel: CancellationToken::new(),
            debug: false,
            query_cache: OnceLock::new(),
            request_cookies: OnceLock::new(),
            status: StatusCode::OK,
            response_headers: HeaderMap::new(),
            response_body: None,
            response_cookies: Vec::new(),
        }
    }

    // ── Request accessors ───────────────────────────────────────────────

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of a request header, lossily decoded.
    pub fn header(&self, name: impl AsRef<str>) -> Option<String> {
        self.headers
            .get(name.as_ref())
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The proxy-resolved client address (transport address when no
    /// resolver ran).
    pub fn client_ip(&self) -> IpAddr {
        self.client_ip
    }

    pub fn set_client_ip(&mut self, ip: IpAddr) {
        self.client_ip = ip;
    }

    pub fn route_name(&self) -> Option<&str> {
        self.route_name.as_deref()
    }

    pub fn set_route_name(&mut self, name: Option<String>) {
        self.route_name = name;
    }

    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    pub fn set_locale(&mut self, locale: impl Into<String>) {
        self.locale = Some(locale.into());
    }

    /// Token fired when the client disconnects or a timeout policy expires.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn set_cancel_token(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    // ── Route params ────────────────────────────────────────────────────

    pub fn set_params(&mut self, params: HashMap<String, String>) {
        self.params = params;
    }

    /// Retrieve a route parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|s| s.as_str())
    }

    /// Retrieve a route parameter, failing fast with a named error when
    /// absent. The error is also accumulated.
    pub fn must_param(&mut self, name: &str) -> Result<String, EngineError> {
        match self.params.get(name) {
            Some(v) => Ok(v.clone()),
            None => {
                let err = EngineError::bad_request(format!("missing route parameter '{name}'"))
                    .with_code("missing_param");
                self.errors.push(err.clone());
                Err(err)
            }
        }
    }

    // ── Query string ────────────────────────────────────────────────────

    fn query_pairs(&self) -> &[(String, String)] {
        self.query_cache.get_or_init(|| {
            match self.uri.query() {
                Some(q) => form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect(),
                None => Vec::new(),
            }
        })
    }

    /// First query value for `name`. The query string is parsed lazily and
    /// cached.
    pub fn query(&self, name: &str) -> Option<String> {
        self.query_pairs()
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    }

    /// All query values for a repeated key.
    pub fn query_array(&self, name: &str) -> Vec<String> {
        self.query_pairs()
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Entries whose key starts with `prefix`; keys keep the prefix.
    pub fn query_map(&self, prefix: &str) -> HashMap<String, String> {
        self.query_pairs()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    // ── Data bag ────────────────────────────────────────────────────────

    /// Store a value for later middleware or the handler.
    pub fn set<T: Send + Sync + 'static>(&mut self, value: T) {
        self.data.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Retrieve a previously stored value.
    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.data
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Borrow a previously stored value.
    pub fn get_ref<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.data
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    /// Like [`get`](Self::get) but fails fast with a typed error.
    pub fn must_get<T: Clone + Send + Sync + 'static>(&mut self) -> Result<T, EngineError> {
        match self.get::<T>() {
            Some(v) => Ok(v),
            None => {
                let err = EngineError::internal(format!(
                    "no value of type '{}' in the request context",
                    type_name::<T>()
                ))
                .with_code("missing_context_value");
                self.errors.push(err.clone());
                Err(err)
            }
        }
    }

    // ── Errors & abort ──────────────────────────────────────────────────

    pub fn error(&mut self, err: EngineError) {
        self.errors.push(err);
    }

    pub fn errors(&self) -> &[EngineError] {
        &self.errors
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Stop the chain after the current layer returns.
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    /// Abort with a status and a plain-text body.
    pub fn abort_with_status(&mut self, status: StatusCode, message: impl Into<String>) {
        self.status = status;
        self.string(message);
        self.aborted = true;
    }

    /// Abort with an accumulated error; the error renderer produces the
    /// response body.
    pub fn abort_with_error(&mut self, err: EngineError) {
        self.status = err.status();
        self.errors.push(err);
        self.aborted = true;
    }

    // ── Cookies ─────────────────────────────────────────────────────────

    /// A request cookie by name. The `Cookie` header is parsed lazily.
    pub fn cookie(&self, name: &str) -> Option<String> {
        self.request_cookies
            .get_or_init(|| {
                self.headers
                    .get(COOKIE)
                    .and_then(|v| v.to_str().ok())
                    .map(parse_cookie_header)
                    .unwrap_or_default()
            })
            .get(name)
            .cloned()
    }

    /// Queue a cookie on the response.
    pub fn set_cookie(&mut self, cookie: Cookie) {
        self.response_cookies.push(cookie);
    }

    // ── Body binding ────────────────────────────────────────────────────

    /// The raw request body. Read once from the transport, cached after.
    pub async fn body_bytes(&mut self) -> Result<Bytes, EngineError> {
        if let Some(bytes) = &self.body_bytes {
            return Ok(bytes.clone());
        }
        let body = match self.body.take() {
            Some(body) => body,
            None => {
                let err = EngineError::internal("request body already consumed")
                    .with_code("body_consumed");
                self.errors.push(err.clone());
                return Err(err);
            }
        };
        match body.collect_bytes().await {
            Ok(bytes) => {
                self.body_bytes = Some(bytes.clone());
                Ok(bytes)
            }
            Err(e) => {
                let err = EngineError::bad_request(format!("failed to read request body: {e}"))
                    .with_code("body_read");
                self.errors.push(err.clone());
                Err(err)
            }
        }
    }

    /// Parse the body as JSON into `T`. Parse faults become accumulated
    /// bad-request errors.
    pub async fn bind_json<T: DeserializeOwned>(&mut self) -> Result<T, EngineError> {
        let bytes = self.body_bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            let err = EngineError::bad_request(format!("invalid JSON body: {e}"))
                .with_code("invalid_json");
            self.errors.push(err.clone());
            err
        })
    }

    /// Parse the body as XML into `T`.
    pub async fn bind_xml<T: DeserializeOwned>(&mut self) -> Result<T, EngineError> {
        let bytes = self.body_bytes().await?;
        let text = std::str::from_utf8(&bytes).map_err(|e| {
            let err = EngineError::bad_request(format!("XML body is not UTF-8: {e}"))
                .with_code("invalid_xml");
            self.errors.push(err.clone());
            err
        })?;
        quick_xml::de::from_str(text).map_err(|e| {
            let err = EngineError::bad_request(format!("invalid XML body: {e}"))
                .with_code("invalid_xml");
            self.errors.push(err.clone());
            err
        })
    }

    /// Bind the query string into `T`.
    pub fn bind_query<T: DeserializeOwned>(&mut self) -> Result<T, EngineError> {
        let value = pairs_to_json(self.query_pairs());
        serde_json::from_value(value).map_err(|e| {
            let err = EngineError::bad_request(format!("invalid query parameters: {e}"))
                .with_code("invalid_query");
            self.errors.push(err.clone());
            err
        })
    }

    /// Bind the body according to its `Content-Type`.
    pub async fn bind<T: DeserializeOwned>(&mut self) -> Result<T, EngineError> {
        let content_type = self
            .header(CONTENT_TYPE.as_str())
            .unwrap_or_default()
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        match content_type.as_str() {
            "application/json" | "" => self.bind_json().await,
            "application/xml" | "text/xml" => self.bind_xml().await,
            "application/x-www-form-urlencoded" => {
                let bytes = self.body_bytes().await?;
                let pairs: Vec<(String, String)> = form_urlencoded::parse(&bytes)
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect();
                serde_json::from_value(pairs_to_json(&pairs)).map_err(|e| {
                    let err = EngineError::bad_request(format!("invalid form body: {e}"))
                        .with_code("invalid_form");
                    self.errors.push(err.clone());
                    err
                })
            }
            other => {
                let err =
                    EngineError::bad_request(format!("unsupported content type '{other}'"))
                        .with_code("unsupported_media_type");
                self.errors.push(err.clone());
                Err(err)
            }
        }
    }

    // ── Negotiation ─────────────────────────────────────────────────────

    /// Pick the best offer for the request's `Accept` header and run its
    /// producer. With no acceptable offer the request aborts with 406;
    /// either way the response varies on `Accept`.
    pub fn negotiate(&mut self, offers: Vec<Offer>) {
        let accept = self.header("accept");
        let types: Vec<&str> = offers.iter().map(|o| o.content_type.as_str()).collect();
        match best_offer(accept.as_deref(), &types) {
            Some(idx) => {
                let offer = offers.into_iter().nth(idx).expect("offer index in range");
                (offer.produce)(self);
                self.set_response_header(CONTENT_TYPE, &offer.content_type);
                self.set_response_header(VARY, "Accept");
            }
            None => {
                self.abort_with_error(EngineError::not_acceptable(
                    "no acceptable representation available",
                ));
            }
        }
    }

    // ── Response writers ────────────────────────────────────────────────

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn set_response_header(&mut self, name: HeaderName, value: &str) {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.response_headers.insert(name, value);
        }
    }

    pub fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    /// Whether a layer has already written a response body.
    pub fn has_response_body(&self) -> bool {
        self.response_body.is_some()
    }

    /// Write a JSON response with the given status.
    pub fn json<T: Serialize>(&mut self, value: &T, status: StatusCode) {
        match serde_json::to_vec(value) {
            Ok(bytes) => {
                self.status = status;
                self.response_headers.insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                self.response_body = Some(Body::from(bytes));
            }
            Err(e) => {
                self.errors
                    .push(EngineError::internal(format!("JSON serialization failed: {e}")));
            }
        }
    }

    /// Write a plain-text response, keeping the current status.
    pub fn string(&mut self, value: impl Into<String>) {
        self.response_headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        self.response_body = Some(Body::from(value.into()));
    }

    /// Stream a file from disk, guessing the content type from the path.
    pub async fn file(&mut self, path: impl AsRef<std::path::Path>) {
        let path = path.as_ref();
        match tokio::fs::File::open(path).await {
            Ok(file) => {
                let mime = mime_guess::from_path(path).first_or_octet_stream();
                self.set_response_header(CONTENT_TYPE, mime.as_ref());
                let stream = tokio_util::io::ReaderStream::new(file);
                self.response_body = Some(Body::from_stream(stream));
            }
            Err(e) => {
                self.abort_with_error(
                    EngineError::not_found(format!("file not available: {e}"))
                        .with_code("file_not_found"),
                );
            }
        }
    }

    /// Stream Server-Sent Events to the client. See [`crate::sse`] for the
    /// wire format, primer, and heartbeat behavior.
    pub fn sse<S, E>(&mut self, stream: S, heartbeat: Option<std::time::Duration>)
    where
        S: futures_core::Stream<Item = Result<crate::sse::SseEvent, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        self.set_response_header(CONTENT_TYPE, "text/event-stream");
        self.set_response_header(crate::http::CACHE_CONTROL, "no-cache");
        self.response_body = Some(crate::sse::sse_body(stream, heartbeat));
    }

    /// Proxy this request to another URL and stream the answer back. See
    /// [`crate::forward`].
    pub async fn forward(&mut self, url: &str, options: crate::forward::ForwardOptions) {
        crate::forward::forward(self, url, options).await;
    }

    /// Set a raw response body.
    pub fn set_response_body(&mut self, body: Body) {
        self.response_body = Some(body);
    }

    /// Consume the context and produce the response.
    pub fn finalize(mut self) -> Response {
        let mut builder = http::Response::builder().status(self.status);
        if let Some(headers) = builder.headers_mut() {
            std::mem::swap(headers, &mut self.response_headers);
            for cookie in &self.response_cookies {
                if let Ok(value) = HeaderValue::from_str(&cookie.to_header_value()) {
                    headers.append(SET_COOKIE, value);
                }
            }
        }
        let body = self.response_body.unwrap_or_default();
        builder.body(body).unwrap_or_else(|_| {
            let mut resp = http::Response::new(Body::empty());
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        })
    }
}

/// Fold key/value pairs into a JSON object, repeating keys as arrays and
/// inferring scalar types so numeric and boolean fields bind.
fn pairs_to_json(pairs: &[(String, String)]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (key, value) in pairs {
        let scalar = infer_scalar(value);
        match map.get_mut(key) {
            Some(serde_json::Value::Array(items)) => items.push(scalar),
            Some(existing) => {
                let first = existing.take();
                *existing = serde_json::Value::Array(vec![first, scalar]);
            }
            None => {
                map.insert(key.clone(), scalar);
            }
        }
    }
    serde_json::Value::Object(map)
}

fn infer_scalar(value: &str) -> serde_json::Value {
    if let Ok(i) = value.parse::<i64>() {
        return serde_json::Value::from(i);
    }
    if let Ok(f) = value.parse::<f64>() {
        return serde_json::Value::from(f);
    }
    match value {
        "true" => serde_json::Value::Bool(true),
        "false" => serde_json::Value::Bool(false),
        _ => serde_json::Value::String(value.to_string()),
    }
}
