//! Server-sent events: low-latency one-way streaming over plain HTTP.
//!
//! # Example
//!
//! ```no_run
//! use http::Request;
//! use streamhub::sse::{Event, KeepAlive, SseUpgrade};
//!
//! # async fn handle(req: Request<()>) -> Result<(), Box<dyn std::error::Error>> {
//! let (parts, _body) = req.into_parts();
//!
//! let upgrade = SseUpgrade::from_request_parts(&parts)?;
//! let resumed_from = upgrade.last_event_id().map(ToOwned::to_owned);
//!
//! let (connection, response) = upgrade.keep_alive(KeepAlive::default()).start();
//! // hand `response` back to the HTTP server, then stream:
//! connection
//!     .send(Event::default().event("time").data("2024-01-01T00:00:00Z"))
//!     .await?;
//! # let _ = (resumed_from, response);
//! # Ok(())
//! # }
//! ```
//!
//! Every [`send`](SseConnection::send) is flushed to the client
//! immediately; [`done`](SseConnection::done) resolves when the peer
//! disconnects or the connection is closed locally.

mod body;
mod event;

pub use self::body::{KeepAlive, SseBody};
pub use self::event::Event;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::{header, request::Parts, HeaderValue, Method, Response, StatusCode};
use tokio::sync::mpsc;

use crate::error::{Error, HandshakeError};
use crate::util::Signal;

#[derive(Debug)]
pub(crate) struct SseShared {
    open: AtomicBool,
    done: Signal,
}

impl SseShared {
    fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
            done: Signal::new(),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Idempotent; signals `done` only on the first call.
    pub(crate) fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.done.set();
        }
    }
}

/// A validated SSE request, ready to start streaming.
#[derive(Debug)]
pub struct SseUpgrade {
    last_event_id: Option<HeaderValue>,
    keep_alive: Option<KeepAlive>,
    capacity: usize,
}

impl SseUpgrade {
    /// Validate the request head: event streams are `GET` only.
    pub fn from_request_parts(parts: &Parts) -> Result<Self, HandshakeError> {
        if parts.method != Method::GET {
            return Err(HandshakeError::MethodNotAllowed);
        }

        Ok(Self {
            last_event_id: parts.headers.get("last-event-id").cloned(),
            keep_alive: None,
            capacity: 32,
        })
    }

    /// Emit comment heartbeats while the stream is idle.
    ///
    /// Off by default.
    pub fn keep_alive(mut self, keep_alive: KeepAlive) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    /// Capacity of the event queue between `send` and the wire
    /// (defaults to 32).
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// The client's `Last-Event-ID` header, verbatim.
    ///
    /// Surfaced for the application to drive its own resumption; the
    /// transport core does not replay anything.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id
            .as_ref()
            .and_then(|value| value.to_str().ok())
    }

    /// Split into the sending handle and the response to return.
    ///
    /// The response carries the `text/event-stream` headers and a body
    /// that streams every subsequently sent event.
    pub fn start(self) -> (SseConnection, Response<SseBody>) {
        let (tx, rx) = mpsc::channel(self.capacity.max(1));
        let shared = Arc::new(SseShared::new());

        let body = SseBody::new(rx, Arc::clone(&shared), self.keep_alive);
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, mime::TEXT_EVENT_STREAM.as_ref())
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .header("x-accel-buffering", "no")
            .body(body)
            .expect("valid response");

        let connection = SseConnection {
            tx: Mutex::new(Some(tx)),
            shared,
            last_event_id: self.last_event_id,
        };

        tracing::debug!("sse connection started");
        (connection, response)
    }
}

/// The server side of an established event stream.
#[derive(Debug)]
pub struct SseConnection {
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    shared: Arc<SseShared>,
    last_event_id: Option<HeaderValue>,
}

impl SseConnection {
    /// Encode and flush one event.
    ///
    /// Events reach the client in submission order; an event with no
    /// fields is a no-op. Fails with [`Error::Closed`] once the
    /// connection is no longer open.
    pub async fn send(&self, event: Event) -> Result<(), Error> {
        self.send_chunk(event.finalize()).await
    }

    /// Send a comment line, the heartbeat path.
    pub async fn send_comment(&self, text: &str) -> Result<(), Error> {
        self.send_chunk(Event::default().comment(text).finalize())
            .await
    }

    /// The client's `Last-Event-ID` header, verbatim.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id
            .as_ref()
            .and_then(|value| value.to_str().ok())
    }

    /// Resolves when the peer disconnects or the connection is closed
    /// locally; signaled exactly once.
    pub async fn done(&self) {
        self.shared.done.wait().await
    }

    /// Whether the connection has been closed (from either side).
    pub fn is_closed(&self) -> bool {
        !self.shared.is_open()
    }

    /// Close the stream.
    ///
    /// Idempotent. Events already submitted are still flushed, then the
    /// response body ends and the server tears the stream down.
    pub fn close(&self) {
        self.tx.lock().expect("sse sender lock poisoned").take();
        self.shared.close();
    }

    async fn send_chunk(&self, chunk: Bytes) -> Result<(), Error> {
        let tx = {
            let guard = self.tx.lock().expect("sse sender lock poisoned");
            match &*guard {
                Some(tx) => tx.clone(),
                None => return Err(Error::Closed),
            }
        };
        if !self.shared.is_open() {
            return Err(Error::Closed);
        }
        if chunk.is_empty() {
            return Ok(());
        }

        tx.send(chunk).await.map_err(|_| {
            // receiver gone: the peer disconnected under us
            self.shared.close();
            Error::Closed
        })
    }
}
