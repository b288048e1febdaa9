//! Server-side real-time transport cores for hyper-based servers.
//!
//! `streamhub` provides the two workhorses of browser push on top of a
//! host HTTP server's connection-hijacking facility:
//!
//! - [`sse`]: a Server-Sent Events emitter — event framing, per-event
//!   flushing, comment heartbeats, and `Last-Event-ID` surfacing.
//! - [`ws`]: an RFC 6455 WebSocket endpoint — handshake, frame codec,
//!   masking, fragmentation, the ping/pong/close control protocol, and a
//!   broadcast [`Hub`](ws::Hub) with bounded per-connection queues.
//!
//! The crate is deliberately router-agnostic: it consumes an
//! [`http::request::Parts`] and produces an [`http::Response`], so it
//! slots under any hyper 1.x server (or any framework that exposes the
//! request head and `hyper::upgrade::OnUpgrade`).
//!
//! # A minimal hyper handler
//!
//! ```no_run
//! use http::{Request, Response};
//! use http_body_util::Full;
//! use bytes::Bytes;
//! use streamhub::ws::{Message, WebSocketUpgrade};
//!
//! fn ws_handler(req: Request<hyper::body::Incoming>) -> Response<Full<Bytes>> {
//!     let (mut parts, _body) = req.into_parts();
//!     match WebSocketUpgrade::from_request_parts(&mut parts) {
//!         Ok(upgrade) => upgrade.on_upgrade(|mut socket| async move {
//!             while let Ok(msg) = socket.recv().await {
//!                 if socket.send(msg).await.is_err() {
//!                     break;
//!                 }
//!             }
//!         }),
//!         Err(rejection) => rejection.into_response(),
//!     }
//! }
//! ```
//!
//! # Concurrency model
//!
//! Every WebSocket connection runs three tasks: a reader (owns the read
//! half), a writer (owns the write half, drains the bounded send queue),
//! and a keep-alive timer. Closure is a compare-and-set state machine —
//! `Open → Closing → Closed` — and the `done()` signal on each
//! connection fires exactly once, waking every waiter. The [`ws::Hub`]
//! is an actor: a single task owns the member set, so broadcast requires
//! no locks, and a slow consumer is evicted rather than allowed to stall
//! the fleet.

#![warn(missing_debug_implementations, missing_docs, rust_2018_idioms)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![cfg_attr(test, allow(clippy::float_cmp))]

pub mod error;
pub mod sse;
pub mod ws;

mod util;

#[doc(inline)]
pub use self::error::{Error, HandshakeError, ProtocolError};
