pub mod body;

pub use body::{Body, BoxError};

pub use http::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ALLOW, CACHE_CONTROL, CONTENT_LENGTH,
    CONTENT_TYPE, COOKIE, HOST, LOCATION, RETRY_AFTER, SET_COOKIE, VARY,
};
pub use http::{Method, StatusCode, Uri};

/// Request type flowing into the engine.
pub type Request = http::Request<Body>;

/// Response type produced by the engine.
pub type Response = http::Response<Body>;
