//! Server-Sent Events: wire-format encoding, a streaming writer with
//! primer and heartbeat, and a multi-client broadcaster.

use std::pin::pin;
use std::time::Duration;

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};

use crate::http::{Body, BoxError};

/// One event on an SSE stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
    pub retry: Option<Duration>,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            id: None,
            event: None,
            data: data.into(),
            retry: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn with_retry(mut self, retry: Duration) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Encode into wire form: optional `id:`/`event:` lines, one `data:`
    /// line per payload line, optional `retry:` in milliseconds, blank line.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        if let Some(id) = &self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        if let Some(retry) = self.retry {
            out.push_str("retry: ");
            out.push_str(&retry.as_millis().to_string());
            out.push('\n');
        }
        out.push('\n');
        out
    }
}

/// Build a streaming SSE body.
///
/// Writes the `:ok` primer on open, emits a `:hb` comment whenever no event
/// has been sent for `heartbeat`, and on stream error flushes a final blank
/// line and closes without propagating the error to the transport.
pub fn sse_body<S, E>(stream: S, heartbeat: Option<Duration>) -> Body
where
    S: Stream<Item = Result<SseEvent, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<Bytes, BoxError>>(16);

    tokio::spawn(async move {
        if tx.send(Ok(Bytes::from_static(b":ok\n\n"))).await.is_err() {
            return;
        }
        let mut stream = pin!(stream);
        loop {
            let item = match heartbeat {
                Some(interval) => match tokio::time::timeout(interval, stream.next()).await {
                    Ok(item) => item,
                    Err(_) => {
                        if tx.send(Ok(Bytes::from_static(b":hb\n\n"))).await.is_err() {
                            return;
                        }
                        continue;
                    }
                },
                None => stream.next().await,
            };
            match item {
                Some(Ok(event)) => {
                    if tx.send(Ok(Bytes::from(event.encode()))).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "SSE source failed, closing stream");
                    let _ = tx.send(Ok(Bytes::from_static(b"\n"))).await;
                    return;
                }
                None => return,
            }
        }
    });

    Body::from_stream(ReceiverStream::new(rx))
}

/// Multi-client SSE fan-out over a broadcast channel.
///
/// Clone it into handlers and background tasks; each subscriber gets every
/// event sent after it subscribed. Slow subscribers that lag past the
/// channel capacity silently skip the missed events.
#[derive(Clone)]
pub struct SseBroadcaster {
    tx: broadcast::Sender<SseEvent>,
}

impl SseBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Broadcast an event. Returns the number of live subscribers, zero
    /// when nobody is listening.
    pub fn send(&self, event: SseEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// A stream of events suitable for [`sse_body`].
    pub fn subscribe(&self) -> impl Stream<Item = Result<SseEvent, BoxError>> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|item| async move {
            match item {
                Ok(event) => Some(Ok(event)),
                // lagged: drop missed events, keep the stream alive
                Err(_) => None,
            }
        })
    }
}
