use std::collections::BTreeMap;

use crate::http::{Body, Method, Response, StatusCode, ALLOW, CONTENT_TYPE, RETRY_AFTER, VARY};

/// What went wrong, mapped onto an HTTP status.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed { allow: Vec<Method> },
    NotAcceptable,
    Conflict,
    Validation { errors: BTreeMap<String, Vec<String>> },
    TooManyRequests { retry_after_secs: u64 },
    Internal,
    Unavailable,
    Timeout,
}

/// Error carried on the context's error list and rendered as a JSON response.
///
/// Binding and parsing failures are accumulated here rather than thrown; the
/// `must_*` accessors and the dispatcher's catch layer also produce these.
/// Each error has a stable slug, an optional machine code, and an optional
/// JSON payload.
#[derive(Debug, Clone)]
pub struct EngineError {
    kind: ErrorKind,
    message: String,
    code: Option<String>,
    details: Option<serde_json::Value>,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            details: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn method_not_allowed(allow: Vec<Method>) -> Self {
        Self::new(
            ErrorKind::MethodNotAllowed { allow },
            "method not allowed for this resource",
        )
    }

    pub fn not_acceptable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotAcceptable, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn validation(errors: BTreeMap<String, Vec<String>>) -> Self {
        Self::new(ErrorKind::Validation { errors }, "validation failed")
    }

    pub fn too_many_requests(retry_after_secs: u64, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TooManyRequests { retry_after_secs }, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Attach a machine-readable code (e.g. `"invalid_json"`).
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach a JSON-serializable payload.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn status(&self) -> StatusCode {
        match &self.kind {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            ErrorKind::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Stable slug used as the `error` field of the JSON body.
    pub fn slug(&self) -> &'static str {
        match &self.kind {
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::MethodNotAllowed { .. } => "method_not_allowed",
            ErrorKind::NotAcceptable => "not_acceptable",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Validation { .. } => "validation_failed",
            ErrorKind::TooManyRequests { .. } => "rate_limited",
            ErrorKind::Internal => "internal_error",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Timeout => "timeout",
        }
    }

    /// Render the JSON error response.
    ///
    /// `debug` controls whether internal errors expose their message; in
    /// release mode they collapse to a generic phrase. Kind-specific headers
    /// (`Allow`, `Retry-After`, `Vary`) are set here.
    pub fn to_response(&self, debug: bool) -> Response {
        let message = match &self.kind {
            ErrorKind::Internal if !debug => "internal server error".to_string(),
            _ => self.message.clone(),
        };

        let mut body = serde_json::json!({
            "error": self.slug(),
            "message": message,
        });
        if let Some(code) = &self.code {
            body["code"] = serde_json::Value::String(code.clone());
        }
        if let Some(details) = &self.details {
            body["details"] = details.clone();
        }
        match &self.kind {
            ErrorKind::Validation { errors } => {
                body["details"] = serde_json::to_value(errors)
                    .unwrap_or(serde_json::Value::Null);
            }
            ErrorKind::TooManyRequests { retry_after_secs } => {
                body["retryAfter"] = serde_json::Value::from(*retry_after_secs);
            }
            _ => {}
        }

        let payload =
            serde_json::to_vec(&body).unwrap_or_else(|_| b"{\"error\":\"internal_error\"}".to_vec());

        let mut builder = http::Response::builder()
            .status(self.status())
            .header(CONTENT_TYPE, "application/json");

        match &self.kind {
            ErrorKind::MethodNotAllowed { allow } => {
                let list = allow
                    .iter()
                    .map(|m| m.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                builder = builder.header(ALLOW, list);
            }
            ErrorKind::TooManyRequests { retry_after_secs } => {
                builder = builder.header(RETRY_AFTER, retry_after_secs.to_string());
            }
            ErrorKind::NotAcceptable => {
                builder = builder.header(VARY, "Accept");
            }
            _ => {}
        }

        builder
            .body(Body::from(payload))
            .unwrap_or_else(|_| fallback_response())
    }
}

fn fallback_response() -> Response {
    let mut resp = http::Response::new(Body::from("internal server error"));
    *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    resp
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.slug(), self.status(), self.message)
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn parts(err: EngineError, debug: bool) -> (http::response::Parts, serde_json::Value) {
        let resp = err.to_response(debug);
        let (head, body) = resp.into_parts();
        let bytes = body.collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap();
        (head, json)
    }

    #[tokio::test]
    async fn not_found_body() {
        let (head, body) = parts(EngineError::not_found("no such user"), true).await;
        assert_eq!(head.status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
        assert_eq!(body["message"], "no such user");
    }

    #[tokio::test]
    async fn method_not_allowed_sets_allow_header() {
        let err = EngineError::method_not_allowed(vec![Method::GET, Method::HEAD]);
        let (head, body) = parts(err, true).await;
        assert_eq!(head.status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(head.headers.get(ALLOW).unwrap(), "GET, HEAD");
        assert_eq!(body["error"], "method_not_allowed");
    }

    #[tokio::test]
    async fn rate_limited_sets_retry_after() {
        let err = EngineError::too_many_requests(30, "slow down");
        let (head, body) = parts(err, true).await;
        assert_eq!(head.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(head.headers.get(RETRY_AFTER).unwrap(), "30");
        assert_eq!(body["error"], "rate_limited");
        assert_eq!(body["retryAfter"], 30);
    }

    #[tokio::test]
    async fn internal_message_hidden_in_release() {
        let err = EngineError::internal("db password was hunter2");
        let (_, body) = parts(err.clone(), false).await;
        assert_eq!(body["message"], "internal server error");
        let (_, body) = parts(err, true).await;
        assert_eq!(body["message"], "db password was hunter2");
    }

    #[tokio::test]
    async fn validation_carries_field_map() {
        let mut errors = BTreeMap::new();
        errors.insert("email".to_string(), vec!["not an email".to_string()]);
        let (head, body) = parts(EngineError::validation(errors), true).await;
        assert_eq!(head.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["details"]["email"][0], "not an email");
    }

    #[tokio::test]
    async fn code_and_details_round_trip() {
        let err = EngineError::bad_request("bad json")
            .with_code("invalid_json")
            .with_details(serde_json::json!({"line": 3}));
        let (_, body) = parts(err, true).await;
        assert_eq!(body["code"], "invalid_json");
        assert_eq!(body["details"]["line"], 3);
    }
}
