use http::{header::HeaderName, HeaderMap};
use tokio::sync::watch;

/// A set-once flag observable by any number of waiters.
///
/// Backs the `done()` signal on both connection flavors. Setting is
/// idempotent; waiters that subscribe after the flag is set return
/// immediately.
#[derive(Debug, Clone)]
pub(crate) struct Signal {
    tx: watch::Sender<bool>,
}

impl Signal {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub(crate) fn set(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in `self`, so wait_for cannot fail
        let _ = rx.wait_for(|set| *set).await;
    }
}

pub(crate) fn header_eq(headers: &HeaderMap, key: HeaderName, value: &'static str) -> bool {
    if let Some(header) = headers.get(&key) {
        header.as_bytes().eq_ignore_ascii_case(value.as_bytes())
    } else {
        false
    }
}

pub(crate) fn header_contains(headers: &HeaderMap, key: HeaderName, value: &'static str) -> bool {
    let header = if let Some(header) = headers.get(&key) {
        header
    } else {
        return false;
    };

    if let Ok(header) = std::str::from_utf8(header.as_bytes()) {
        header.to_ascii_lowercase().contains(value)
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header;

    #[tokio::test]
    async fn signal_wakes_current_and_future_waiters() {
        let signal = Signal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };

        signal.set();
        waiter.await.unwrap();

        // late subscriber returns immediately
        signal.wait().await;
        assert!(signal.is_set());
    }

    #[test]
    fn signal_set_is_idempotent() {
        let signal = Signal::new();
        signal.set();
        signal.set();
        assert!(signal.is_set());
    }

    #[test]
    fn header_matching_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, "WebSocket".parse().unwrap());
        headers.insert(header::CONNECTION, "keep-alive, Upgrade".parse().unwrap());

        assert!(header_eq(&headers, header::UPGRADE, "websocket"));
        assert!(header_contains(&headers, header::CONNECTION, "upgrade"));
        assert!(!header_contains(&headers, header::CONNECTION, "websocket"));
    }
}
