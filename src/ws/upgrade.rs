//! HTTP-to-WebSocket handshake.

use std::borrow::Cow;
use std::future::Future;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use http::{header, request::Parts, HeaderValue, Method, Response, StatusCode, Version};
use http_body_util::Full;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};

use super::socket::{WebSocket, WebSocketConfig};
use crate::error::{Error, HandshakeError};
use crate::util::{header_contains, header_eq};

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A validated upgrade request, ready to switch protocols.
///
/// Built from the request head with [`from_request_parts`] (default
/// same-origin policy) or [`with_check_origin`]; configured through the
/// builder methods; finalized with [`on_upgrade`], which produces the
/// `101 Switching Protocols` response and hands the hijacked stream to
/// the callback as a [`WebSocket`].
///
/// [`from_request_parts`]: WebSocketUpgrade::from_request_parts
/// [`with_check_origin`]: WebSocketUpgrade::with_check_origin
/// [`on_upgrade`]: WebSocketUpgrade::on_upgrade
pub struct WebSocketUpgrade<F = DefaultOnFailedUpgrade> {
    config: WebSocketConfig,
    /// The chosen protocol sent in the `Sec-WebSocket-Protocol` header of
    /// the response.
    protocol: Option<HeaderValue>,
    sec_websocket_key: HeaderValue,
    on_upgrade: OnUpgrade,
    on_failed_upgrade: F,
    sec_websocket_protocol: Option<HeaderValue>,
}

impl<F> std::fmt::Debug for WebSocketUpgrade<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketUpgrade")
            .field("config", &self.config)
            .field("protocol", &self.protocol)
            .field("sec_websocket_key", &self.sec_websocket_key)
            .field("sec_websocket_protocol", &self.sec_websocket_protocol)
            .finish_non_exhaustive()
    }
}

impl WebSocketUpgrade {
    /// Validate an upgrade request under the default same-origin policy.
    pub fn from_request_parts(parts: &mut Parts) -> Result<Self, HandshakeError> {
        Self::with_check_origin(parts, same_origin)
    }

    /// Validate an upgrade request with a custom origin policy.
    ///
    /// The predicate sees the whole request head and returns whether the
    /// upgrade may proceed; rejection maps to `403 Forbidden`.
    pub fn with_check_origin<P>(parts: &mut Parts, check_origin: P) -> Result<Self, HandshakeError>
    where
        P: FnOnce(&Parts) -> bool,
    {
        if parts.method != Method::GET {
            return Err(HandshakeError::MethodNotAllowed);
        }
        if parts.version < Version::HTTP_11 {
            return Err(HandshakeError::NotHijackable);
        }

        if !header_contains(&parts.headers, header::CONNECTION, "upgrade") {
            return Err(HandshakeError::MissingHeader("connection"));
        }
        if !header_eq(&parts.headers, header::UPGRADE, "websocket") {
            return Err(HandshakeError::MissingHeader("upgrade"));
        }
        if !header_eq(&parts.headers, header::SEC_WEBSOCKET_VERSION, "13") {
            return Err(HandshakeError::BadVersion);
        }

        let sec_websocket_key = parts
            .headers
            .get(header::SEC_WEBSOCKET_KEY)
            .ok_or(HandshakeError::MissingHeader("sec-websocket-key"))?
            .clone();
        match STANDARD.decode(sec_websocket_key.as_bytes()) {
            Ok(decoded) if decoded.len() == 16 => {}
            _ => return Err(HandshakeError::BadKey),
        }

        if !check_origin(parts) {
            return Err(HandshakeError::OriginRejected);
        }

        let on_upgrade = parts
            .extensions
            .remove::<OnUpgrade>()
            .ok_or(HandshakeError::NotHijackable)?;

        let sec_websocket_protocol = parts.headers.get(header::SEC_WEBSOCKET_PROTOCOL).cloned();

        Ok(Self {
            config: WebSocketConfig::default(),
            protocol: None,
            sec_websocket_key,
            on_upgrade,
            on_failed_upgrade: DefaultOnFailedUpgrade,
            sec_websocket_protocol,
        })
    }
}

impl<F> WebSocketUpgrade<F> {
    /// Replace the whole connection configuration.
    pub fn config(mut self, config: WebSocketConfig) -> Self {
        self.config = config;
        self
    }

    /// Initial capacity of the read buffer (defaults to 4096).
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Initial capacity of the write buffer (defaults to 4096).
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    /// Set the maximum message size (defaults to 32 MiB).
    pub fn max_message_size(mut self, max: usize) -> Self {
        self.config.max_message_size = max;
        self
    }

    /// How long the whole handshake exchange may take (defaults to 10 s).
    pub fn handshake_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Bound each read; `None` (the default) waits indefinitely.
    pub fn read_deadline(mut self, deadline: Option<std::time::Duration>) -> Self {
        self.config.read_deadline = deadline;
        self
    }

    /// Bound each write (defaults to 10 s).
    pub fn write_deadline(mut self, deadline: std::time::Duration) -> Self {
        self.config.write_deadline = deadline;
        self
    }

    /// Interval between keep-alive pings; zero disables (defaults to 30 s).
    pub fn ping_interval(mut self, interval: std::time::Duration) -> Self {
        self.config.ping_interval = interval;
        self
    }

    /// How long a pong may take before the peer counts as dead
    /// (defaults to 60 s).
    pub fn pong_wait(mut self, wait: std::time::Duration) -> Self {
        self.config.pong_wait = wait;
        self
    }

    /// Capacity of the per-connection send queue (defaults to 64).
    pub fn send_queue(mut self, capacity: usize) -> Self {
        self.config.send_queue = capacity;
        self
    }

    /// Set the known subprotocols.
    ///
    /// If the client's `Sec-WebSocket-Protocol` header offers one of
    /// them, the response selects it and [`WebSocket::protocol`] reports
    /// it. Without this call no subprotocol is ever selected.
    ///
    /// The protocols should be listed in decreasing order of preference.
    pub fn protocols<I>(mut self, protocols: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Cow<'static, str>>,
    {
        self.protocol = select_protocol(self.sec_websocket_protocol.as_ref(), protocols);
        self
    }

    /// Provide a callback to call if upgrading the connection fails.
    ///
    /// The connection upgrade is performed in a background task. If that
    /// fails this callback will be called; by default any errors are
    /// silently ignored.
    pub fn on_failed_upgrade<C>(self, callback: C) -> WebSocketUpgrade<C>
    where
        C: OnFailedUpgrade,
    {
        WebSocketUpgrade {
            config: self.config,
            protocol: self.protocol,
            sec_websocket_key: self.sec_websocket_key,
            on_upgrade: self.on_upgrade,
            on_failed_upgrade: callback,
            sec_websocket_protocol: self.sec_websocket_protocol,
        }
    }

    /// Finalize upgrading the connection and call the provided callback
    /// with the established socket.
    #[must_use = "to set up the WebSocket connection, this response must be returned"]
    pub fn on_upgrade<C, Fut>(self, callback: C) -> Response<Full<Bytes>>
    where
        C: FnOnce(WebSocket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        F: OnFailedUpgrade,
    {
        let Self {
            config,
            protocol,
            sec_websocket_key,
            on_upgrade,
            on_failed_upgrade,
            sec_websocket_protocol: _,
        } = self;

        let selected_protocol = protocol.clone();

        tokio::spawn(async move {
            let upgraded =
                match tokio::time::timeout(config.handshake_timeout, on_upgrade).await {
                    Ok(Ok(upgraded)) => upgraded,
                    Ok(Err(err)) => {
                        on_failed_upgrade.call(Error::Io(std::io::Error::other(err)));
                        return;
                    }
                    Err(_) => {
                        on_failed_upgrade.call(Error::Timeout);
                        return;
                    }
                };

            let socket = WebSocket::from_stream(TokioIo::new(upgraded), &config)
                .with_protocol(selected_protocol);
            callback(socket).await;
        });

        #[allow(clippy::declare_interior_mutable_const)]
        const UPGRADE: HeaderValue = HeaderValue::from_static("upgrade");
        #[allow(clippy::declare_interior_mutable_const)]
        const WEBSOCKET: HeaderValue = HeaderValue::from_static("websocket");

        let mut builder = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::CONNECTION, UPGRADE)
            .header(header::UPGRADE, WEBSOCKET)
            .header(header::SEC_WEBSOCKET_ACCEPT, sign(sec_websocket_key.as_bytes()));

        if let Some(protocol) = protocol {
            builder = builder.header(header::SEC_WEBSOCKET_PROTOCOL, protocol);
        }

        builder
            .body(Full::new(Bytes::new()))
            .expect("valid response")
    }
}

/// The default origin policy: same-origin only.
///
/// A request without an `Origin` header (non-browser clients) is allowed;
/// otherwise the origin's authority must match the `Host` header.
pub fn same_origin(parts: &Parts) -> bool {
    let Some(origin) = parts.headers.get(header::ORIGIN) else {
        return true;
    };
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    let Some(host) = parts
        .headers
        .get(header::HOST)
        .and_then(|host| host.to_str().ok())
    else {
        return false;
    };

    origin_authority(origin).is_some_and(|authority| authority.eq_ignore_ascii_case(host))
}

fn origin_authority(origin: &str) -> Option<&str> {
    let rest = origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"))?;
    rest.split('/').next()
}

fn select_protocol<I>(requested: Option<&HeaderValue>, supported: I) -> Option<HeaderValue>
where
    I: IntoIterator,
    I::Item: Into<Cow<'static, str>>,
{
    let requested = requested.and_then(|header| header.to_str().ok())?;

    supported
        .into_iter()
        .map(Into::into)
        .find(|supported| {
            requested
                .split(',')
                .any(|candidate| candidate.trim() == supported)
        })
        .map(|protocol| match protocol {
            Cow::Owned(s) => HeaderValue::from_str(&s).expect("protocol came from a header value"),
            Cow::Borrowed(s) => HeaderValue::from_static(s),
        })
}

fn sign(key: &[u8]) -> HeaderValue {
    let mut sha1 = Sha1::default();
    sha1.update(key);
    sha1.update(GUID);
    let b64 = Bytes::from(STANDARD.encode(sha1.finalize()));
    HeaderValue::from_maybe_shared(b64).expect("base64 is a valid value")
}

/// What to do when a connection upgrade fails.
///
/// See [`WebSocketUpgrade::on_failed_upgrade`] for more details.
pub trait OnFailedUpgrade: Send + 'static {
    /// Call the callback.
    fn call(self, error: Error);
}

impl<F> OnFailedUpgrade for F
where
    F: FnOnce(Error) + Send + 'static,
{
    fn call(self, error: Error) {
        self(error)
    }
}

/// The default `OnFailedUpgrade` used by `WebSocketUpgrade`.
///
/// It simply ignores the error.
#[non_exhaustive]
#[derive(Debug)]
pub struct DefaultOnFailedUpgrade;

impl OnFailedUpgrade for DefaultOnFailedUpgrade {
    fn call(self, _error: Error) {}
}
