//! Server-sent event records and their wire encoding.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

/// A server-sent event.
///
/// Built up with the field methods, then serialized to the
/// `text/event-stream` grammar in a fixed order: comments, `retry:`,
/// `id:`, `event:`, then one `data:` line per line of data, terminated by
/// a blank line. Once handed to [`SseConnection::send`] the record is
/// never mutated.
///
/// An event with no fields at all encodes to nothing.
///
/// [`SseConnection::send`]: super::SseConnection::send
#[derive(Debug, Default, Clone)]
pub struct Event {
    data: Option<String>,
    event: Option<String>,
    id: Option<String>,
    retry: Option<Duration>,
    comments: Vec<String>,
}

impl Event {
    /// Set the event's data field(s) (`data: <content>`).
    ///
    /// Newlines in `data` are broken across multiple `data:` lines.
    ///
    /// # Panics
    ///
    /// - Panics if `data` contains any carriage returns, as they cannot
    ///   be transmitted over SSE.
    /// - Panics if `data` or `json_data` has already been called.
    pub fn data<T>(mut self, data: T) -> Self
    where
        T: AsRef<str>,
    {
        if self.data.is_some() {
            panic!("Called `Event::data` multiple times");
        }
        let data = data.as_ref();
        assert_eq!(
            memchr::memchr(b'\r', data.as_bytes()),
            None,
            "SSE data cannot contain carriage returns",
        );

        self.data = Some(data.to_owned());
        self
    }

    /// Set the event's data field to a serialized JSON value.
    ///
    /// # Panics
    ///
    /// Panics if `data` or `json_data` has already been called.
    #[cfg(feature = "json")]
    pub fn json_data<T>(mut self, data: T) -> serde_json::Result<Self>
    where
        T: serde::Serialize,
    {
        if self.data.is_some() {
            panic!("Called `Event::json_data` multiple times");
        }

        self.data = Some(serde_json::to_string(&data)?);
        Ok(self)
    }

    /// Set the event's type field (`event: <name>`).
    ///
    /// Omitted, clients dispatch the event under the default type
    /// `message`.
    ///
    /// # Panics
    ///
    /// - Panics if `event` is not a token of `[A-Za-z0-9_-]` characters.
    /// - Panics if this function has already been called on this event.
    pub fn event<T>(mut self, event: T) -> Self
    where
        T: AsRef<str>,
    {
        if self.event.is_some() {
            panic!("Called `Event::event` multiple times");
        }
        let event = event.as_ref();
        assert!(
            !event.is_empty()
                && event
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'),
            "SSE event type must be a [A-Za-z0-9_-]+ token",
        );

        self.event = Some(event.to_owned());
        self
    }

    /// Set the event's identifier field (`id: <identifier>`).
    ///
    /// # Panics
    ///
    /// - Panics if `id` contains any newlines, carriage returns or null
    ///   characters.
    /// - Panics if this function has already been called on this event.
    pub fn id<T>(mut self, id: T) -> Self
    where
        T: AsRef<str>,
    {
        if self.id.is_some() {
            panic!("Called `Event::id` multiple times");
        }
        let id = id.as_ref();
        assert_eq!(
            memchr::memchr3(b'\r', b'\n', b'\0', id.as_bytes()),
            None,
            "SSE event id cannot contain newlines, carriage returns or null characters",
        );

        self.id = Some(id.to_owned());
        self
    }

    /// Set the event's retry timeout field (`retry: <milliseconds>`), the
    /// client's reconnection-delay hint.
    ///
    /// # Panics
    ///
    /// Panics if this function has already been called on this event.
    pub fn retry(mut self, duration: Duration) -> Self {
        if self.retry.is_some() {
            panic!("Called `Event::retry` multiple times");
        }

        self.retry = Some(duration);
        self
    }

    /// Add a comment line (`:<comment-text>`).
    ///
    /// Unlike the other fields, comments can be added repeatedly.
    ///
    /// # Panics
    ///
    /// Panics if `comment` contains any newlines or carriage returns.
    pub fn comment<T>(mut self, comment: T) -> Self
    where
        T: AsRef<str>,
    {
        let comment = comment.as_ref();
        assert_eq!(
            memchr::memchr2(b'\r', b'\n', comment.as_bytes()),
            None,
            "SSE comment cannot contain newlines or carriage returns",
        );

        self.comments.push(comment.to_owned());
        self
    }

    fn is_empty(&self) -> bool {
        self.data.is_none()
            && self.event.is_none()
            && self.id.is_none()
            && self.retry.is_none()
            && self.comments.is_empty()
    }

    /// Serialize to wire bytes; an empty event encodes to nothing.
    pub(crate) fn finalize(&self) -> Bytes {
        if self.is_empty() {
            return Bytes::new();
        }

        let mut buf = BytesMut::new();

        for comment in &self.comments {
            buf.put_u8(b':');
            buf.extend_from_slice(comment.as_bytes());
            buf.put_u8(b'\n');
        }

        if let Some(retry) = self.retry {
            buf.extend_from_slice(b"retry: ");
            let mut millis = itoa::Buffer::new();
            buf.extend_from_slice(millis.format(retry.as_millis() as u64).as_bytes());
            buf.put_u8(b'\n');
        }

        if let Some(id) = &self.id {
            field(&mut buf, b"id", id);
        }

        if let Some(event) = &self.event {
            field(&mut buf, b"event", event);
        }

        if let Some(data) = &self.data {
            for line in data.split('\n') {
                field(&mut buf, b"data", line);
            }
        }

        // a single blank line terminates the event
        buf.put_u8(b'\n');
        buf.freeze()
    }
}

fn field(buf: &mut BytesMut, name: &[u8], value: &str) {
    buf.extend_from_slice(name);
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value.as_bytes());
    buf.put_u8(b'\n');
}
