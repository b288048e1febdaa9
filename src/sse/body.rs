//! The streaming response body behind an SSE connection.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http_body::{Body, Frame};
use pin_project_lite::pin_project;
use tokio::sync::mpsc;
use tokio::time::Sleep;

use super::{Event, SseShared};

pin_project! {
    /// `text/event-stream` response body.
    ///
    /// Yields one body frame per submitted event, in submission order, so
    /// the server writes and flushes each event as soon as it is
    /// produced. While the stream is idle the body may interleave
    /// heartbeat comments (see [`KeepAlive`]). The body ends once the
    /// connection is closed and every queued event has been delivered;
    /// dropping it (the peer went away) closes the connection.
    pub struct SseBody {
        rx: mpsc::Receiver<Bytes>,
        shared: Arc<SseShared>,
        // pre-encoded heartbeat comment and its cadence, if configured
        heartbeat: Option<(Bytes, Duration)>,
        // armed on the first idle poll, disarmed whenever an event flows
        #[pin]
        idle_timer: Option<Sleep>,
    }

    impl PinnedDrop for SseBody {
        fn drop(this: Pin<&mut Self>) {
            this.shared.close();
        }
    }
}

impl SseBody {
    pub(crate) fn new(
        rx: mpsc::Receiver<Bytes>,
        shared: Arc<SseShared>,
        keep_alive: Option<KeepAlive>,
    ) -> Self {
        let heartbeat = keep_alive
            .map(|keep_alive| (Event::default().comment(keep_alive.comment).finalize(), keep_alive.period));

        Self {
            rx,
            shared,
            heartbeat,
            idle_timer: None,
        }
    }
}

impl Body for SseBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let mut idle_timer = this.idle_timer;

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                // traffic: the next idle stretch starts over
                idle_timer.set(None);
                Poll::Ready(Some(Ok(Frame::data(chunk))))
            }
            // sender gone: the connection was closed and has flushed
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => {
                let Some((comment, period)) = this.heartbeat else {
                    return Poll::Pending;
                };

                if idle_timer.as_mut().as_pin_mut().is_none() {
                    idle_timer.set(Some(tokio::time::sleep(*period)));
                }
                let timer = idle_timer.as_mut().as_pin_mut().expect("timer armed above");

                match timer.poll(cx) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(()) => {
                        idle_timer.set(Some(tokio::time::sleep(*period)));
                        Poll::Ready(Some(Ok(Frame::data(comment.clone()))))
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for SseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseBody").finish_non_exhaustive()
    }
}

/// Heartbeat configuration for an idle event stream.
///
/// When set on an [`SseUpgrade`], the body emits a comment line whenever
/// no event has flowed for one period, keeping intermediaries from
/// timing the connection out.
///
/// [`SseUpgrade`]: super::SseUpgrade
#[derive(Debug, Clone)]
pub struct KeepAlive {
    comment: String,
    period: Duration,
}

impl KeepAlive {
    /// Heartbeat with an empty comment every 30 seconds, the same
    /// cadence the WebSocket side pings at.
    pub fn new() -> Self {
        Self {
            comment: String::new(),
            period: Duration::from_secs(30),
        }
    }

    /// How much idle time passes before a heartbeat is sent.
    pub fn every(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// The text of the heartbeat comment; empty by default.
    ///
    /// The text is encoded through the regular event encoder when the
    /// stream starts, so newlines and carriage returns are rejected
    /// there.
    pub fn comment(mut self, text: impl Into<String>) -> Self {
        self.comment = text.into();
        self
    }
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self::new()
    }
}
