use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;
use http_body::Frame;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};

/// Boxed error used by body and streaming layers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The engine's request/response body.
///
/// Wraps either a fully buffered payload or a byte stream (SSE, proxied
/// responses, files). Request bodies are readable once; the context caches
/// the collected bytes on first read.
pub struct Body(BoxBody<Bytes, BoxError>);

impl Body {
    /// Wrap any `http_body::Body` with compatible data/error types.
    pub fn new<B>(body: B) -> Self
    where
        B: http_body::Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        Self(body.map_err(Into::into).boxed())
    }

    pub fn empty() -> Self {
        Self::new(Empty::new())
    }

    /// Build a streaming body from a stream of byte chunks.
    pub fn from_stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Sync + 'static,
        E: Into<BoxError> + 'static,
    {
        let frames = futures_util::StreamExt::map(stream, |chunk| {
            chunk.map(Frame::data).map_err(Into::into)
        });
        Self(StreamBody::new(frames).boxed())
    }

    /// Buffer the entire body into contiguous bytes.
    pub async fn collect_bytes(self) -> Result<Bytes, BoxError> {
        Ok(self.0.collect().await?.to_bytes())
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Body")
    }
}

impl http_body::Body for Body {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.0).poll_frame(cx)
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.0.size_hint()
    }

    fn is_end_stream(&self) -> bool {
        self.0.is_end_stream()
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::new(Full::new(bytes))
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Bytes::from(s).into()
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Bytes::from_static(s.as_bytes()).into()
    }
}

impl From<()> for Body {
    fn from(_: ()) -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collect_full_body() {
        let body = Body::from("hello".to_string());
        let bytes = body.collect_bytes().await.unwrap();
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn collect_stream_body() {
        let chunks: Vec<Result<Bytes, BoxError>> =
            vec![Ok(Bytes::from_static(b"a")), Ok(Bytes::from_static(b"bc"))];
        let body = Body::from_stream(futures_util::stream::iter(chunks));
        let bytes = body.collect_bytes().await.unwrap();
        assert_eq!(&bytes[..], b"abc");
    }

    #[tokio::test]
    async fn empty_body_is_empty() {
        let bytes = Body::empty().collect_bytes().await.unwrap();
        assert!(bytes.is_empty());
    }
}
