//! WebSocket endpoint: handshake, connection lifecycle, and broadcast hub.
//!
//! # Example
//!
//! ```no_run
//! use http::{Request, Response};
//! use streamhub::ws::{Message, WebSocketUpgrade};
//!
//! fn handle(req: Request<()>) -> Response<http_body_util::Full<bytes::Bytes>> {
//!     let (mut parts, _body) = req.into_parts();
//!
//!     let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts) {
//!         Ok(upgrade) => upgrade,
//!         Err(rejection) => return rejection.into_response(),
//!     };
//!
//!     upgrade.on_upgrade(|mut socket| async move {
//!         while let Ok(msg) = socket.recv().await {
//!             if socket.send(msg).await.is_err() {
//!                 break;
//!             }
//!         }
//!     })
//! }
//! ```
//!
//! For fan-out, register each connection's [`WsSender`] with a [`Hub`] and
//! broadcast through it; see the [`hub`] module docs.

use bytes::Bytes;

pub mod frame;
pub mod hub;
mod mask;
mod socket;
mod upgrade;

pub use self::frame::{Frame, FrameCodec, OpCode};
pub use self::hub::{Hub, HubConfig};
pub use self::socket::{WebSocket, WebSocketConfig, WsSender};
pub use self::upgrade::{same_origin, DefaultOnFailedUpgrade, OnFailedUpgrade, WebSocketUpgrade};

/// UTF-8 wrapper for [`Bytes`].
///
/// A `Utf8Bytes` is always guaranteed to contain valid UTF-8; text frames
/// are validated once, after reassembly, and carried in this form from
/// then on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Utf8Bytes(Bytes);

impl Utf8Bytes {
    /// Creates from a static str.
    pub fn from_static(str: &'static str) -> Self {
        Self(Bytes::from_static(str.as_bytes()))
    }

    /// Returns as a string slice.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).expect("utf-8 validated on construction")
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the string is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::ops::Deref for Utf8Bytes {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl std::fmt::Display for Utf8Bytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<Bytes> for Utf8Bytes {
    type Error = std::str::Utf8Error;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        std::str::from_utf8(&bytes)?;
        Ok(Self(bytes))
    }
}

impl TryFrom<Vec<u8>> for Utf8Bytes {
    type Error = std::str::Utf8Error;

    fn try_from(v: Vec<u8>) -> Result<Self, Self::Error> {
        Self::try_from(Bytes::from(v))
    }
}

impl From<String> for Utf8Bytes {
    fn from(s: String) -> Self {
        Self(Bytes::from(s))
    }
}

impl From<&str> for Utf8Bytes {
    fn from(s: &str) -> Self {
        Self(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Utf8Bytes> for Bytes {
    fn from(Utf8Bytes(bytes): Utf8Bytes) -> Self {
        bytes
    }
}

impl<T> PartialEq<T> for Utf8Bytes
where
    for<'a> &'a str: PartialEq<T>,
{
    fn eq(&self, other: &T) -> bool {
        self.as_str() == *other
    }
}

/// Status code used to indicate why an endpoint is closing the WebSocket
/// connection.
pub type CloseCode = u16;

/// A struct representing the close command.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CloseFrame {
    /// The reason as a code.
    pub code: CloseCode,
    /// The reason as text string.
    pub reason: Utf8Bytes,
}

/// A WebSocket message.
///
/// [`WebSocket::recv`] only ever yields `Text` and `Binary`; pings are
/// answered and close frames handled inside the connection.
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Message {
    /// A text WebSocket message.
    Text(Utf8Bytes),
    /// A binary WebSocket message.
    Binary(Bytes),
    /// A ping message with the specified payload.
    ///
    /// The payload must be 125 bytes or less. Incoming pings are answered
    /// automatically; sending one explicitly probes the peer out of band.
    Ping(Bytes),
    /// A pong message with the specified payload.
    ///
    /// The payload must be 125 bytes or less. Sent automatically in reply
    /// to pings; an unsolicited pong is a permitted unidirectional
    /// heartbeat.
    Pong(Bytes),
    /// A close message with the optional close frame.
    ///
    /// Sending one is equivalent to calling [`WebSocket::close`].
    Close(Option<CloseFrame>),
}

impl Message {
    /// Create a new text WebSocket message from a stringable.
    pub fn text<S>(string: S) -> Message
    where
        S: Into<Utf8Bytes>,
    {
        Message::Text(string.into())
    }

    /// Create a new binary WebSocket message by converting to `Bytes`.
    pub fn binary<B>(bin: B) -> Message
    where
        B: Into<Bytes>,
    {
        Message::Binary(bin.into())
    }

    /// Consume the message and return it as binary data.
    pub fn into_data(self) -> Bytes {
        match self {
            Self::Text(string) => Bytes::from(string),
            Self::Binary(data) | Self::Ping(data) | Self::Pong(data) => data,
            Self::Close(None) => Bytes::new(),
            Self::Close(Some(frame)) => Bytes::from(frame.reason),
        }
    }

    /// Attempt to consume the message and convert it to a [`Utf8Bytes`].
    pub fn into_text(self) -> Result<Utf8Bytes, std::str::Utf8Error> {
        match self {
            Self::Text(string) => Ok(string),
            Self::Binary(data) | Self::Ping(data) | Self::Pong(data) => Utf8Bytes::try_from(data),
            Self::Close(None) => Ok(Utf8Bytes::default()),
            Self::Close(Some(frame)) => Ok(frame.reason),
        }
    }
}

impl From<String> for Message {
    fn from(string: String) -> Self {
        Message::Text(string.into())
    }
}

impl<'s> From<&'s str> for Message {
    fn from(string: &'s str) -> Self {
        Message::Text(string.into())
    }
}

impl<'b> From<&'b [u8]> for Message {
    fn from(data: &'b [u8]) -> Self {
        Message::Binary(Bytes::copy_from_slice(data))
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Message::Binary(data.into())
    }
}

pub mod close_code {
    //! Constants for [`CloseCode`]s.
    //!
    //! [`CloseCode`]: super::CloseCode

    /// Indicates a normal closure, meaning that the purpose for which the
    /// connection was established has been fulfilled.
    pub const NORMAL: u16 = 1000;

    /// Indicates that an endpoint is "going away", such as a server going
    /// down or a browser having navigated away from a page.
    pub const AWAY: u16 = 1001;

    /// Indicates that an endpoint is terminating the connection due to a
    /// protocol error.
    pub const PROTOCOL: u16 = 1002;

    /// Indicates that an endpoint is terminating the connection because it
    /// has received a type of data that it cannot accept.
    pub const UNSUPPORTED: u16 = 1003;

    /// Indicates that an endpoint is terminating the connection because it
    /// has received data within a message that was not consistent with the
    /// type of the message.
    pub const INVALID: u16 = 1007;

    /// Indicates that an endpoint is terminating the connection because it
    /// has received a message that violates its policy.
    pub const POLICY: u16 = 1008;

    /// Indicates that an endpoint is terminating the connection because it
    /// has received a message that is too big for it to process.
    pub const SIZE: u16 = 1009;

    /// Indicates that a server is terminating the connection because it
    /// encountered an unexpected condition that prevented it from
    /// fulfilling the request.
    pub const ERROR: u16 = 1011;

    /// Indicates that the server is restarting.
    pub const RESTART: u16 = 1012;

    /// Indicates that the server is overloaded and the client should
    /// connect again later.
    pub const AGAIN: u16 = 1013;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_bytes_round_trips() {
        let payload = Utf8Bytes::from_static("foo123");
        assert_eq!(payload, "foo123");
        assert_eq!(payload.len(), 6);
        assert_eq!(&*payload, "foo123");

        assert!(Utf8Bytes::try_from(Bytes::from_static(&[0xff, 0xfe])).is_err());
        assert_eq!(Utf8Bytes::try_from(b"ok".to_vec()).unwrap(), "ok");
    }

    #[test]
    fn message_conversions() {
        assert_eq!(Message::text("hi"), Message::Text("hi".into()));
        assert_eq!(Message::from("hi").into_data(), Bytes::from_static(b"hi"));
        assert_eq!(
            Message::binary(vec![1, 2, 3]).into_data(),
            Bytes::from_static(&[1, 2, 3])
        );
        assert_eq!(Message::text("hi").into_text().unwrap(), "hi");
        assert!(Message::Binary(Bytes::from_static(&[0xff])).into_text().is_err());
    }
}
