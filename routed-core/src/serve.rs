//! HTTP/1.1 serving glue between a [`Engine`] and the tokio listener.

use std::sync::Arc;

use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use crate::http::Body;
use crate::routing::dispatch::Engine;

/// Accept connections and dispatch every request through the engine.
///
/// One task per connection; the engine is shared read-only. Runs until the
/// listener fails.
pub async fn serve(engine: Arc<Engine>, listener: TcpListener) -> std::io::Result<()> {
    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let engine = engine.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req: http::Request<hyper::body::Incoming>| {
                let engine = engine.clone();
                async move {
                    let req = req.map(Body::new);
                    Ok::<_, std::convert::Infallible>(engine.dispatch(req, remote_addr).await)
                }
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                tracing::debug!(error = %e, "connection ended with error");
            }
        });
    }
}

/// Bind an address and serve.
pub async fn listen(engine: Arc<Engine>, addr: &str) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr, "listening");
    serve(engine, listener).await
}
