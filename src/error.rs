//! Error types returned by the transport cores.

use bytes::Bytes;
use http::{header, HeaderValue, Response, StatusCode};
use http_body_util::Full;

/// Errors returned by operations on an established connection.
///
/// The core never retries on its own; every failure surfaces through the
/// operation that hit it and retry policy is left to the application.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The connection (or hub) is no longer open.
    ///
    /// Every public operation on a connection that has left the `Open`
    /// state fails with this variant.
    #[error("connection closed")]
    Closed,

    /// The underlying stream failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A read or write deadline elapsed.
    ///
    /// Semantically an I/O failure; kept separate so callers can tell a
    /// dead peer from a slow one.
    #[error("operation timed out")]
    Timeout,

    /// The peer violated the WebSocket protocol.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// A violation of RFC 6455 detected while parsing or reassembling frames.
///
/// Each kind maps to exactly one RFC close code through
/// [`close_code`](ProtocolError::close_code); the connection sends that
/// code in its Close frame before tearing down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Reserved bits were set but no extension was negotiated.
    #[error("non-zero reserved bits")]
    RsvBits,

    /// The opcode is not one of continuation, text, binary, close, ping
    /// or pong.
    #[error("invalid opcode {0}")]
    BadOpcode(u8),

    /// A client-originated frame arrived without masking.
    #[error("client frame is not masked")]
    UnmaskedClient,

    /// A control frame carried more than 125 bytes of payload.
    #[error("control frame payload too long: {0} bytes")]
    ControlTooLong(usize),

    /// A control frame arrived with the fin bit clear.
    #[error("fragmented control frame")]
    ControlFragmented,

    /// A continuation frame without an open message, or a new data frame
    /// while a fragmented message is still open.
    #[error("invalid continuation frame")]
    InvalidContinuation,

    /// A text message or close reason is not valid UTF-8.
    #[error("invalid utf-8 payload")]
    InvalidUtf8,

    /// A message exceeded the configured maximum size.
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// A close frame carried a status code that must not appear on the
    /// wire, or a truncated status code.
    #[error("invalid close code {0}")]
    BadCloseCode(u16),
}

impl ProtocolError {
    /// The RFC 6455 close code sent to the peer for this violation.
    ///
    /// This is the single source of truth for the error-to-code mapping;
    /// nothing else in the crate branches on protocol-error kinds.
    pub fn close_code(&self) -> u16 {
        match self {
            ProtocolError::RsvBits
            | ProtocolError::BadOpcode(_)
            | ProtocolError::UnmaskedClient
            | ProtocolError::ControlTooLong(_)
            | ProtocolError::ControlFragmented
            | ProtocolError::InvalidContinuation
            | ProtocolError::BadCloseCode(_) => 1002,
            ProtocolError::InvalidUtf8 => 1007,
            ProtocolError::MessageTooLarge(_) => 1009,
        }
    }
}

/// Errors rejecting an upgrade request before any stream is hijacked.
///
/// Each kind corresponds to one HTTP status; [`into_response`] produces
/// the response to send back.
///
/// [`into_response`]: HandshakeError::into_response
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum HandshakeError {
    /// The request method is not `GET`.
    #[error("request method must be GET")]
    MethodNotAllowed,

    /// A required upgrade header is missing or has the wrong value.
    #[error("missing or invalid `{0}` header")]
    MissingHeader(&'static str),

    /// `Sec-WebSocket-Version` is not 13.
    #[error("unsupported websocket version")]
    BadVersion,

    /// `Sec-WebSocket-Key` does not decode to 16 bytes.
    #[error("invalid Sec-WebSocket-Key")]
    BadKey,

    /// The origin check rejected the request.
    #[error("origin not allowed")]
    OriginRejected,

    /// The server did not expose the connection for hijacking.
    #[error("connection cannot be hijacked")]
    NotHijackable,
}

impl HandshakeError {
    /// The HTTP status this rejection maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            HandshakeError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            HandshakeError::MissingHeader(_) | HandshakeError::BadKey => StatusCode::BAD_REQUEST,
            HandshakeError::BadVersion => StatusCode::UPGRADE_REQUIRED,
            HandshakeError::OriginRejected => StatusCode::FORBIDDEN,
            HandshakeError::NotHijackable => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Build the rejection response.
    ///
    /// A version rejection advertises the supported version, as RFC 6455
    /// requires.
    pub fn into_response(self) -> Response<Full<Bytes>> {
        let mut res = Response::builder()
            .status(self.status())
            .body(Full::from(self.to_string()))
            .expect("valid response");

        if matches!(self, HandshakeError::BadVersion) {
            res.headers_mut().insert(
                header::SEC_WEBSOCKET_VERSION,
                HeaderValue::from_static("13"),
            );
        }

        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_code_table() {
        assert_eq!(ProtocolError::RsvBits.close_code(), 1002);
        assert_eq!(ProtocolError::BadOpcode(3).close_code(), 1002);
        assert_eq!(ProtocolError::UnmaskedClient.close_code(), 1002);
        assert_eq!(ProtocolError::ControlTooLong(126).close_code(), 1002);
        assert_eq!(ProtocolError::ControlFragmented.close_code(), 1002);
        assert_eq!(ProtocolError::InvalidContinuation.close_code(), 1002);
        assert_eq!(ProtocolError::BadCloseCode(1005).close_code(), 1002);
        assert_eq!(ProtocolError::InvalidUtf8.close_code(), 1007);
        assert_eq!(ProtocolError::MessageTooLarge(1).close_code(), 1009);
    }

    #[test]
    fn handshake_statuses() {
        assert_eq!(HandshakeError::MethodNotAllowed.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(HandshakeError::MissingHeader("upgrade").status(), StatusCode::BAD_REQUEST);
        assert_eq!(HandshakeError::BadVersion.status(), StatusCode::UPGRADE_REQUIRED);
        assert_eq!(HandshakeError::BadKey.status(), StatusCode::BAD_REQUEST);
        assert_eq!(HandshakeError::OriginRejected.status(), StatusCode::FORBIDDEN);
        assert_eq!(HandshakeError::NotHijackable.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn version_rejection_advertises_supported_version() {
        let res = HandshakeError::BadVersion.into_response();
        assert_eq!(res.status(), StatusCode::UPGRADE_REQUIRED);
        assert_eq!(
            res.headers().get(header::SEC_WEBSOCKET_VERSION).unwrap(),
            "13"
        );
    }
}
