use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderMap, CONTENT_TYPE, COOKIE};
use http::{Method, StatusCode};
use serde::de::DeserializeOwned;

use routed_core::http::{Body, Request};
use routed_core::Engine;

const DEFAULT_REMOTE: &str = "127.0.0.1:4000";

/// In-process HTTP client driving an [`Engine`] directly.
///
/// Requests go straight into the dispatcher without a TCP socket; the
/// transport remote address is configurable per app and per request so
/// proxy and filter behavior is testable.
pub struct TestApp {
    engine: Arc<Engine>,
    remote_addr: SocketAddr,
}

impl TestApp {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine: Arc::new(engine),
            remote_addr: DEFAULT_REMOTE.parse().expect("default remote is valid"),
        }
    }

    /// Change the transport peer address used for subsequent requests.
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = addr;
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Send an arbitrary request.
    pub async fn send(&self, request: Request) -> TestResponse {
        self.send_from(self.remote_addr, request).await
    }

    /// Send an arbitrary request with an explicit transport peer.
    pub async fn send_from(&self, remote: SocketAddr, request: Request) -> TestResponse {
        let response = self.engine.dispatch(request, remote).await;
        let (head, body) = response.into_parts();
        let body = body
            .collect_bytes()
            .await
            .expect("failed to read response body");
        TestResponse {
            status: head.status,
            headers: head.headers,
            body,
        }
    }

    /// Send a GET request to the given path.
    pub async fn get(&self, path: &str) -> TestResponse {
        let req = http::Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .expect("request construction");
        self.send(req).await
    }

    /// Send a GET request with extra headers.
    pub async fn get_with_headers(&self, path: &str, headers: &[(&str, &str)]) -> TestResponse {
        let mut builder = http::Request::builder().method(Method::GET).uri(path);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let req = builder.body(Body::empty()).expect("request construction");
        self.send(req).await
    }

    /// Send a GET request carrying a `Cookie` header.
    pub async fn get_with_cookie(&self, path: &str, cookie: &str) -> TestResponse {
        let req = http::Request::builder()
            .method(Method::GET)
            .uri(path)
            .header(COOKIE, cookie)
            .body(Body::empty())
            .expect("request construction");
        self.send(req).await
    }

    /// Send a POST request with a JSON body.
    pub async fn post_json(&self, path: &str, body: &impl serde::Serialize) -> TestResponse {
        let json = serde_json::to_vec(body).expect("body serialization");
        let req = http::Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(json))
            .expect("request construction");
        self.send(req).await
    }

    /// Send a PUT request with a JSON body.
    pub async fn put_json(&self, path: &str, body: &impl serde::Serialize) -> TestResponse {
        let json = serde_json::to_vec(body).expect("body serialization");
        let req = http::Request::builder()
            .method(Method::PUT)
            .uri(path)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(json))
            .expect("request construction");
        self.send(req).await
    }

    /// Send a DELETE request.
    pub async fn delete(&self, path: &str) -> TestResponse {
        let req = http::Request::builder()
            .method(Method::DELETE)
            .uri(path)
            .body(Body::empty())
            .expect("request construction");
        self.send(req).await
    }
}

/// A buffered response with assertion helpers.
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> T {
        serde_json::from_slice(&self.body).unwrap_or_else(|e| {
            panic!("response body is not the expected JSON: {e}: {}", self.text())
        })
    }

    /// First value of a response header, if present and readable.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn assert_status(&self, expected: StatusCode) -> &Self {
        assert_eq!(
            self.status, expected,
            "unexpected status; body: {}",
            self.text()
        );
        self
    }
}
