//! Reverse-proxy forwarding: replay the current request against another
//! URL and stream the answer back verbatim.

use std::sync::OnceLock;

use crate::context::Context;
use crate::error::EngineError;
use crate::http::Body;

/// Options for [`Context::forward`].
#[derive(Debug, Clone, Default)]
pub struct ForwardOptions {
    /// Add `X-Forwarded-For`, `X-Forwarded-Host`, and `X-Forwarded-Proto`.
    pub add_forwarded_headers: bool,
    /// Extra headers set on the outbound request.
    pub headers: Vec<(String, String)>,
}

impl ForwardOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forwarded_headers(mut self) -> Self {
        self.add_forwarded_headers = true;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

fn client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(reqwest::Client::new)
}

const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

pub(crate) async fn forward(ctx: &mut Context, url: &str, options: ForwardOptions) {
    let body = match ctx.body_bytes().await {
        Ok(bytes) => bytes,
        // error already accumulated by body_bytes
        Err(_) => return,
    };

    let mut request = client().request(ctx.method().clone(), url).body(body);

    for (name, value) in ctx.headers() {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str()) {
            continue;
        }
        request = request.header(name, value);
    }

    if options.add_forwarded_headers {
        request = request.header("x-forwarded-for", ctx.client_ip().to_string());
        if let Some(host) = ctx.header("host") {
            request = request.header("x-forwarded-host", host);
        }
        request = request.header("x-forwarded-proto", "http");
    }
    for (name, value) in &options.headers {
        request = request.header(name, value);
    }

    match request.send().await {
        Ok(response) => {
            ctx.set_status(response.status());
            for (name, value) in response.headers() {
                let lower = name.as_str().to_ascii_lowercase();
                if HOP_BY_HOP.contains(&lower.as_str()) {
                    continue;
                }
                if let Ok(v) = value.to_str() {
                    ctx.set_response_header(name.clone(), v);
                }
            }
            ctx.set_response_body(Body::from_stream(response.bytes_stream()));
        }
        Err(e) => {
            tracing::warn!(url, error = %e, "forward target unreachable");
            ctx.abort_with_error(
                EngineError::unavailable(format!("upstream request failed: {e}"))
                    .with_code("forward_failed"),
            );
        }
    }
}
