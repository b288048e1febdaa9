//! Fan-out broadcast hub.
//!
//! A [`Hub`] owns the set of live connections and fans messages out to
//! all of them. All state lives inside a single actor task: the task is
//! the only mutator of the member set and the only reader of the hub's
//! channels, so no lock is ever taken.
//!
//! Broadcast delivery is non-blocking per member. A member whose send
//! queue is full when a broadcast is dispatched is a slow consumer: it is
//! unregistered and closed with code 1008, because one stalled peer must
//! not hold up the rest of the fleet.
//!
//! # Example
//!
//! ```no_run
//! # async fn example(upgrade: streamhub::ws::WebSocketUpgrade) {
//! use streamhub::ws::Hub;
//!
//! let hub = Hub::new();
//!
//! # let hub2 = hub.clone();
//! // per connection, typically inside `on_upgrade`:
//! let response = upgrade.on_upgrade(move |mut socket| async move {
//!     let membership = socket.sender();
//!     let id = membership.id();
//!     let _ = hub2.register(membership).await;
//!     while socket.recv().await.is_ok() {}
//!     let _ = hub2.unregister(id).await;
//! });
//! # let _ = response;
//!
//! let _ = hub.broadcast_text("tick").await;
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};

use super::frame::Frame;
use super::socket::WsSender;
use super::{close_code, Utf8Bytes};
use crate::error::Error;
use crate::util::Signal;

/// Queue capacities for a [`Hub`].
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the registration queue.
    pub register_capacity: usize,
    /// Capacity of the unregistration queue.
    pub unregister_capacity: usize,
    /// Capacity of the broadcast queue.
    pub broadcast_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            register_capacity: 16,
            unregister_capacity: 16,
            broadcast_capacity: 256,
        }
    }
}

/// Handle to a broadcast hub.
///
/// Cheap to clone; all clones talk to the same actor. Dropping every
/// clone shuts the hub down as if [`close`](Hub::close) had been called.
#[derive(Debug, Clone)]
pub struct Hub {
    register: mpsc::Sender<WsSender>,
    unregister: mpsc::Sender<u64>,
    broadcast: mpsc::Sender<Frame>,
    shutdown: mpsc::Sender<()>,
    closed: Arc<AtomicBool>,
    done: Signal,
}

impl Hub {
    /// Start a hub with default queue capacities.
    pub fn new() -> Self {
        Self::with_config(HubConfig::default())
    }

    /// Start a hub with the given queue capacities.
    pub fn with_config(config: HubConfig) -> Self {
        let (register_tx, register_rx) = mpsc::channel(config.register_capacity.max(1));
        let (unregister_tx, unregister_rx) = mpsc::channel(config.unregister_capacity.max(1));
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let done = Signal::new();
        tokio::spawn(hub_task(
            register_rx,
            unregister_rx,
            broadcast_rx,
            shutdown_rx,
            done.clone(),
        ));

        Self {
            register: register_tx,
            unregister: unregister_tx,
            broadcast: broadcast_tx,
            shutdown: shutdown_tx,
            closed: Arc::new(AtomicBool::new(false)),
            done,
        }
    }

    /// Add a connection to the member set.
    ///
    /// The hub holds only the sending handle; it never extends the
    /// connection's lifetime, and a member that closes on its own is
    /// pruned on the next dispatch.
    pub async fn register(&self, member: WsSender) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        self.register.send(member).await.map_err(|_| Error::Closed)
    }

    /// Remove a connection from the member set.
    ///
    /// Idempotent: unknown ids and repeated calls are no-ops, including
    /// after shutdown.
    pub async fn unregister(&self, id: u64) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let _ = self.unregister.send(id).await;
        Ok(())
    }

    /// Broadcast a text message to every member.
    pub async fn broadcast_text(&self, text: impl Into<Utf8Bytes>) -> Result<(), Error> {
        self.dispatch(Frame::text(text.into().into())).await
    }

    /// Broadcast a binary message to every member.
    pub async fn broadcast_binary(&self, data: impl Into<Bytes>) -> Result<(), Error> {
        self.dispatch(Frame::binary(data.into())).await
    }

    /// Broadcast a value as a JSON text message.
    ///
    /// The value is serialized once and the encoding shared across all
    /// members.
    #[cfg(feature = "json")]
    pub async fn broadcast_json<T>(&self, value: &T) -> Result<(), Error>
    where
        T: serde::Serialize,
    {
        let encoded = serde_json::to_vec(value).map_err(|err| {
            Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
        })?;
        self.dispatch(Frame::text(Bytes::from(encoded))).await
    }

    /// Shut the hub down.
    ///
    /// Pending unregistrations are drained, every remaining member is
    /// closed with code 1001 ("going away"), and once the actor has
    /// returned so does this call. Later `register` and broadcast calls
    /// fail with [`Error::Closed`]; `close` itself is idempotent.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.shutdown.try_send(());
        }
        self.done.wait().await;
    }

    /// Whether the hub has been shut down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn dispatch(&self, frame: Frame) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        self.broadcast.send(frame).await.map_err(|_| Error::Closed)
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

async fn hub_task(
    mut register: mpsc::Receiver<WsSender>,
    mut unregister: mpsc::Receiver<u64>,
    mut broadcast: mpsc::Receiver<Frame>,
    mut shutdown: mpsc::Receiver<()>,
    done: Signal,
) {
    let mut members: HashMap<u64, WsSender> = HashMap::new();

    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            Some(member) = register.recv() => {
                tracing::debug!(id = member.id(), "hub member registered");
                members.insert(member.id(), member);
            }
            Some(id) = unregister.recv() => {
                members.remove(&id);
            }
            Some(frame) = broadcast.recv() => {
                fan_out(&mut members, frame);
            }
            else => break,
        }
    }

    // drain pending unregistrations before saying goodbye
    while let Ok(id) = unregister.try_recv() {
        members.remove(&id);
    }
    for (_, member) in members.drain() {
        member.close_now(close_code::AWAY, "going away");
    }
    done.set();
}

/// Deliver one frame to every member without blocking the actor.
///
/// Per-member outcome: enqueued, or evicted. A full queue is a policy
/// violation (slow consumer, closed with 1008); a closed queue is a
/// member that went away on its own and is pruned silently.
fn fan_out(members: &mut HashMap<u64, WsSender>, frame: Frame) {
    let mut evicted: Vec<(u64, bool)> = Vec::new();

    for (id, member) in members.iter() {
        match member.try_broadcast(frame.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => evicted.push((*id, true)),
            Err(TrySendError::Closed(_)) => evicted.push((*id, false)),
        }
    }

    for (id, slow) in evicted {
        if let Some(member) = members.remove(&id) {
            if slow {
                tracing::debug!(id, "evicting slow consumer");
                member.close_now(close_code::POLICY, "policy violation: slow consumer");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::{Message, WebSocket, WebSocketConfig};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::time::timeout;

    fn connect(config: &WebSocketConfig) -> (WebSocket, DuplexStream) {
        let (server, client) = tokio::io::duplex(4096);
        (WebSocket::from_stream(server, config), client)
    }

    async fn read_frame(client: &mut DuplexStream) -> (u8, Vec<u8>) {
        let mut head = [0u8; 2];
        client.read_exact(&mut head).await.unwrap();
        let len = (head[1] & 0x7f) as usize;
        assert!(len <= 125, "test frames stay small");
        let mut payload = vec![0u8; len];
        client.read_exact(&mut payload).await.unwrap();
        (head[0], payload)
    }

    #[tokio::test]
    async fn broadcast_reaches_every_member_once() {
        let hub = Hub::new();
        let (socket_a, mut client_a) = connect(&WebSocketConfig::default());
        let (socket_b, mut client_b) = connect(&WebSocketConfig::default());

        hub.register(socket_a.sender()).await.unwrap();
        hub.register(socket_b.sender()).await.unwrap();

        hub.broadcast_text("tick").await.unwrap();

        for client in [&mut client_a, &mut client_b] {
            let (head, payload) = read_frame(client).await;
            assert_eq!(head, 0x81);
            assert_eq!(payload, b"tick");
        }

        // exactly once: nothing further is queued
        assert!(timeout(Duration::from_millis(50), read_frame(&mut client_a))
            .await
            .is_err());

        drop((socket_a, socket_b));
    }

    #[tokio::test]
    async fn fan_out_scales_past_a_pair_of_members() {
        let hub = Hub::new();
        let mut clients = Vec::new();
        let mut sockets = Vec::new();

        for _ in 0..5 {
            let (socket, client) = connect(&WebSocketConfig::default());
            hub.register(socket.sender()).await.unwrap();
            clients.push(client);
            sockets.push(socket);
        }

        hub.broadcast_binary(vec![0xaa; 32]).await.unwrap();
        hub.broadcast_text("follow-up").await.unwrap();

        for client in &mut clients {
            let (head, payload) = read_frame(client).await;
            assert_eq!(head, 0x82);
            assert_eq!(payload, vec![0xaa; 32]);

            let (head, payload) = read_frame(client).await;
            assert_eq!(head, 0x81);
            assert_eq!(payload, b"follow-up");
        }

        drop(sockets);
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_and_closed() {
        let hub = Hub::new();

        // member A: one-slot send queue over a wire nobody reads
        let (server_a, client_a) = tokio::io::duplex(1);
        let config_a = WebSocketConfig {
            send_queue: 1,
            write_deadline: Duration::from_millis(100),
            ..Default::default()
        };
        let socket_a = WebSocket::from_stream(server_a, &config_a);

        let (socket_b, mut client_b) = connect(&WebSocketConfig::default());

        hub.register(socket_a.sender()).await.unwrap();
        hub.register(socket_b.sender()).await.unwrap();

        // jam A's writer on the 1-byte wire, then fill its queue
        socket_a.send(Message::text("jam")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        socket_a.send(Message::text("queued")).await.unwrap();

        hub.broadcast_text("x").await.unwrap();

        // B receives the broadcast
        let (head, payload) = read_frame(&mut client_b).await;
        assert_eq!(head, 0x81);
        assert_eq!(payload, b"x");

        // A is closed (code 1008, best effort on a jammed wire) and gone
        // from the member set
        socket_a.done().await;

        hub.broadcast_text("y").await.unwrap();
        let (_, payload) = read_frame(&mut client_b).await;
        assert_eq!(payload, b"y");

        drop((socket_b, client_a));
    }

    #[tokio::test]
    async fn eviction_close_carries_policy_code() {
        // the close frame a slow consumer gets, observed on a free wire
        let (socket, mut client) = connect(&WebSocketConfig::default());
        socket
            .sender()
            .close_now(close_code::POLICY, "policy violation: slow consumer");

        let (head, payload) = read_frame(&mut client).await;
        assert_eq!(head, 0x88);
        assert_eq!(&payload[..2], 1008u16.to_be_bytes());
        assert_eq!(&payload[2..], b"policy violation: slow consumer");

        drop(socket);
    }

    #[tokio::test]
    async fn close_says_going_away_and_rejects_further_use() {
        let hub = Hub::new();
        let (socket, mut client) = connect(&WebSocketConfig::default());
        hub.register(socket.sender()).await.unwrap();

        hub.close().await;
        hub.close().await; // idempotent

        let (head, payload) = read_frame(&mut client).await;
        assert_eq!(head, 0x88);
        assert_eq!(&payload[..2], 1001u16.to_be_bytes());
        assert_eq!(&payload[2..], b"going away");

        let (other, _other_client) = connect(&WebSocketConfig::default());
        assert!(matches!(
            hub.register(other.sender()).await,
            Err(Error::Closed)
        ));
        assert!(matches!(hub.broadcast_text("x").await, Err(Error::Closed)));

        // unregister stays a harmless no-op
        hub.unregister(socket.id()).await.unwrap();

        drop((socket, other));
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let hub = Hub::new();
        let (socket, mut client) = connect(&WebSocketConfig::default());
        hub.register(socket.sender()).await.unwrap();

        hub.unregister(socket.id()).await.unwrap();
        hub.unregister(socket.id()).await.unwrap();
        hub.unregister(9999).await.unwrap();

        hub.broadcast_text("after").await.unwrap();
        assert!(
            timeout(Duration::from_millis(50), read_frame(&mut client))
                .await
                .is_err(),
            "unregistered member must not receive broadcasts"
        );

        drop(socket);
    }

    #[tokio::test]
    async fn members_that_closed_are_pruned_silently() {
        let hub = Hub::new();
        let (socket_a, client_a) = connect(&WebSocketConfig::default());
        let (socket_b, mut client_b) = connect(&WebSocketConfig::default());

        hub.register(socket_a.sender()).await.unwrap();
        hub.register(socket_b.sender()).await.unwrap();

        // A goes away on its own
        drop(socket_a);
        drop(client_a);
        tokio::time::sleep(Duration::from_millis(20)).await;

        hub.broadcast_text("still here").await.unwrap();
        let (_, payload) = read_frame(&mut client_b).await;
        assert_eq!(payload, b"still here");

        drop(socket_b);
    }

    #[cfg(feature = "json")]
    #[tokio::test]
    async fn broadcast_json_encodes_once() {
        #[derive(serde::Serialize)]
        struct Tick {
            seq: u32,
        }

        let hub = Hub::new();
        let (socket, mut client) = connect(&WebSocketConfig::default());
        hub.register(socket.sender()).await.unwrap();

        hub.broadcast_json(&Tick { seq: 7 }).await.unwrap();

        let (head, payload) = read_frame(&mut client).await;
        assert_eq!(head, 0x81);
        assert_eq!(payload, br#"{"seq":7}"#);

        drop(socket);
    }
}
