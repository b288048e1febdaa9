//! A single WebSocket connection and the task trio that drives it.
//!
//! Every connection owns three tasks: a reader (exclusive owner of the
//! read half, reassembles fragmented messages and handles control
//! frames), a writer (exclusive owner of the write half, drains the
//! control and data queues), and a timer (ping/pong keep-alive). Closure
//! is a compare-and-set state transition; only the first task to move the
//! connection into `Closing` runs the teardown, and every queued waiter
//! is woken with [`Error::Closed`].

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use http::HeaderValue;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tokio_util::codec::{Encoder, FramedRead};

use super::frame::{valid_close_code, Frame, FrameCodec, OpCode};
use super::{close_code, CloseCode, CloseFrame, Message, Utf8Bytes};
use crate::error::{Error, ProtocolError};
use crate::util::Signal;

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Hard bound on how long any connection task keeps running after the
/// close handshake has been decided.
const DRAIN_DEADLINE: Duration = Duration::from_secs(1);

/// Capacity of the control-frame queue (automatic pongs, close replies,
/// keep-alive pings).
const CONTROL_QUEUE: usize = 8;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Tunables for a WebSocket connection.
///
/// The defaults match what most deployments want; zero disables the
/// keep-alive ping, `read_deadline: None` (the default) waits on the peer
/// indefinitely.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Initial capacity of the read buffer.
    pub read_buffer_size: usize,
    /// Initial capacity of the write buffer.
    pub write_buffer_size: usize,
    /// Maximum size of a single message, fragmented or not.
    pub max_message_size: usize,
    /// How long the whole upgrade handshake may take.
    pub handshake_timeout: Duration,
    /// Bound on each individual read; `None` waits indefinitely.
    pub read_deadline: Option<Duration>,
    /// Bound on each individual write.
    pub write_deadline: Duration,
    /// Interval between keep-alive pings; zero disables them.
    pub ping_interval: Duration,
    /// How long a pong may take before the connection is considered dead.
    pub pong_wait: Duration,
    /// Capacity of the per-connection send queue.
    pub send_queue: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 4096,
            write_buffer_size: 4096,
            max_message_size: 32 << 20,
            handshake_timeout: Duration::from_secs(10),
            read_deadline: None,
            write_deadline: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            pong_wait: Duration::from_secs(60),
            send_queue: 64,
        }
    }
}

#[derive(Debug)]
struct Shared {
    id: u64,
    state: AtomicU8,
    /// Set on entering `Closing`.
    closing: Signal,
    /// Tells the writer to wind down without waiting for more data.
    stop: Signal,
    /// Set when the writer task has exited.
    writer_done: Signal,
    /// Set exactly once, on entering `Closed`.
    done: Signal,
}

impl Shared {
    fn new(id: u64) -> Self {
        Self {
            id,
            state: AtomicU8::new(OPEN),
            closing: Signal::new(),
            stop: Signal::new(),
            writer_done: Signal::new(),
            done: Signal::new(),
        }
    }

    fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN
    }

    /// `Open -> Closing`; returns whether this caller won the transition
    /// and therefore owes the peer a close frame.
    fn begin_close(&self) -> bool {
        if self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.closing.set();
            true
        } else {
            false
        }
    }

    /// `-> Closed`; idempotent, signals `done` only once.
    fn finish_close(&self) {
        if self.state.swap(CLOSED, Ordering::AcqRel) != CLOSED {
            self.closing.set();
            self.done.set();
        }
    }
}

#[derive(Debug)]
enum Command {
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseFrame>),
}

/// Clonable sending half of a connection.
///
/// This is what a [`Hub`](super::Hub) holds for each member: the bounded
/// send queue plus the ability to close the connection. All methods are
/// safe to call from any task.
#[derive(Debug, Clone)]
pub struct WsSender {
    data: mpsc::Sender<Frame>,
    ctrl: mpsc::Sender<Command>,
    shared: Arc<Shared>,
}

impl WsSender {
    /// Stable identity of the connection this handle sends to.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Whether the connection has left the `Open` state.
    pub fn is_closed(&self) -> bool {
        !self.shared.is_open()
    }

    /// Queue a message for the peer.
    ///
    /// Text and binary messages go through the bounded send queue in call
    /// order and block when it is full. Sending `Message::Close` starts
    /// the close handshake.
    pub async fn send(&self, msg: Message) -> Result<(), Error> {
        match msg {
            Message::Text(text) => self.send_data(Frame::text(text.into())).await,
            Message::Binary(data) => self.send_data(Frame::binary(data)).await,
            Message::Ping(data) => self.send_control(Command::Ping(data)).await,
            Message::Pong(data) => self.send_control(Command::Pong(data)).await,
            Message::Close(Some(close)) => self.close(close.code, close.reason.as_str()).await,
            Message::Close(None) => self.close(close_code::NORMAL, "").await,
        }
    }

    /// Send a ping with the given payload.
    pub async fn ping(&self, payload: impl Into<Bytes>) -> Result<(), Error> {
        self.send_control(Command::Ping(payload.into())).await
    }

    /// Send an unsolicited pong with the given payload.
    pub async fn pong(&self, payload: impl Into<Bytes>) -> Result<(), Error> {
        self.send_control(Command::Pong(payload.into())).await
    }

    /// Start the close handshake with the given status code and reason.
    ///
    /// Idempotent: only the first close (from any task, including the
    /// peer's own close frame) decides the code; later calls succeed
    /// without effect. Codes that may not appear on the wire are refused.
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<(), Error> {
        if !valid_close_code(code) {
            return Err(ProtocolError::BadCloseCode(code).into());
        }
        if self.shared.begin_close() {
            let close = CloseFrame {
                code,
                reason: reason.into(),
            };
            if self.ctrl.send(Command::Close(Some(close))).await.is_err() {
                self.shared.stop.set();
            }
        }
        Ok(())
    }

    /// Resolves once the connection reaches `Closed`.
    pub async fn done(&self) {
        self.shared.done.wait().await
    }

    async fn send_data(&self, frame: Frame) -> Result<(), Error> {
        if !self.shared.is_open() {
            return Err(Error::Closed);
        }
        self.data.send(frame).await.map_err(|_| Error::Closed)
    }

    async fn send_control(&self, command: Command) -> Result<(), Error> {
        if !self.shared.is_open() {
            return Err(Error::Closed);
        }
        self.ctrl.send(command).await.map_err(|_| Error::Closed)
    }

    /// Non-blocking enqueue used by the hub's broadcast dispatch.
    pub(crate) fn try_broadcast(&self, frame: Frame) -> Result<(), TrySendError<Frame>> {
        if !self.shared.is_open() {
            return Err(TrySendError::Closed(frame));
        }
        self.data.try_send(frame)
    }

    /// Synchronous close used where awaiting is not an option (hub
    /// dispatch, drop). Falls back to a hard stop when the control queue
    /// is jammed.
    pub(crate) fn close_now(&self, code: CloseCode, reason: &str) {
        if self.shared.begin_close() {
            let close = CloseFrame {
                code,
                reason: reason.into(),
            };
            if self.ctrl.try_send(Command::Close(Some(close))).is_err() {
                self.shared.stop.set();
            }
        }
    }
}

/// A server-side WebSocket connection.
///
/// Returned by [`WebSocketUpgrade::on_upgrade`] with the handshake
/// already done, or built directly from any byte stream with
/// [`from_stream`] (tests do this over an in-memory duplex).
///
/// Dropping the socket closes the connection.
///
/// [`WebSocketUpgrade::on_upgrade`]: super::WebSocketUpgrade::on_upgrade
/// [`from_stream`]: WebSocket::from_stream
#[derive(Debug)]
pub struct WebSocket {
    incoming: mpsc::Receiver<Result<Message, Error>>,
    sender: WsSender,
    protocol: Option<HeaderValue>,
}

impl WebSocket {
    /// Run the connection protocol over an already-upgraded byte stream.
    pub fn from_stream<S>(stream: S, config: &WebSocketConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Shared::new(id));

        let (read_half, write_half) = tokio::io::split(stream);
        let (incoming_tx, incoming_rx) = mpsc::channel(1);
        let (data_tx, data_rx) = mpsc::channel(config.send_queue.max(1));
        let (ctrl_tx, ctrl_rx) = mpsc::channel(CONTROL_QUEUE);
        let (pong_tx, pong_rx) = watch::channel(Instant::now());

        let framed = FramedRead::with_capacity(
            read_half,
            FrameCodec::new(config.max_message_size),
            config.read_buffer_size.max(16),
        );

        tokio::spawn(reader_task(
            framed,
            incoming_tx,
            ctrl_tx.clone(),
            pong_tx,
            Arc::clone(&shared),
            config.read_deadline,
        ));
        tokio::spawn(writer_task(
            write_half,
            data_rx,
            ctrl_rx,
            Arc::clone(&shared),
            config.write_deadline,
            config.write_buffer_size,
        ));
        tokio::spawn(timer_task(
            ctrl_tx.clone(),
            pong_rx,
            Arc::clone(&shared),
            config.ping_interval,
            config.pong_wait,
        ));

        tracing::debug!(id, "websocket connection started");

        Self {
            incoming: incoming_rx,
            sender: WsSender {
                data: data_tx,
                ctrl: ctrl_tx,
                shared,
            },
            protocol: None,
        }
    }

    pub(crate) fn with_protocol(mut self, protocol: Option<HeaderValue>) -> Self {
        self.protocol = protocol;
        self
    }

    /// Receive the next application message.
    ///
    /// Blocks until a complete text or binary message is available —
    /// control frames are handled internally and never show up here.
    /// Returns [`Error::Closed`] once the connection is done.
    pub async fn recv(&mut self) -> Result<Message, Error> {
        match self.incoming.recv().await {
            Some(result) => result,
            None => Err(Error::Closed),
        }
    }

    /// Queue a message for the peer; see [`WsSender::send`].
    pub async fn send(&self, msg: Message) -> Result<(), Error> {
        self.sender.send(msg).await
    }

    /// Send a ping with the given payload.
    pub async fn ping(&self, payload: impl Into<Bytes>) -> Result<(), Error> {
        self.sender.ping(payload).await
    }

    /// Send an unsolicited pong with the given payload.
    pub async fn pong(&self, payload: impl Into<Bytes>) -> Result<(), Error> {
        self.sender.pong(payload).await
    }

    /// Start the close handshake; see [`WsSender::close`].
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<(), Error> {
        self.sender.close(code, reason).await
    }

    /// Resolves once the connection reaches `Closed`.
    pub async fn done(&self) {
        self.sender.done().await
    }

    /// Stable identity of this connection.
    pub fn id(&self) -> u64 {
        self.sender.id()
    }

    /// A clonable sending handle, e.g. for hub membership.
    pub fn sender(&self) -> WsSender {
        self.sender.clone()
    }

    /// The subprotocol selected during the handshake, if any.
    pub fn protocol(&self) -> Option<&HeaderValue> {
        self.protocol.as_ref()
    }
}

impl Drop for WebSocket {
    fn drop(&mut self) {
        self.sender.close_now(close_code::NORMAL, "");
    }
}

async fn reader_task<S>(
    mut framed: FramedRead<ReadHalf<S>, FrameCodec>,
    incoming: mpsc::Sender<Result<Message, Error>>,
    ctrl: mpsc::Sender<Command>,
    pong_seen: watch::Sender<Instant>,
    shared: Arc<Shared>,
    read_deadline: Option<Duration>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let max_message_size = framed.decoder().max_message_size();
    // opcode plus accumulated payload of the currently open message
    let mut assembly: Option<(OpCode, BytesMut)> = None;

    loop {
        let next = if shared.closing.is_set() {
            // close already under way; wait briefly for the peer's reply
            match timeout(DRAIN_DEADLINE, framed.next()).await {
                Ok(item) => item,
                Err(_) => break,
            }
        } else if let Some(deadline) = read_deadline {
            match timeout(deadline, framed.next()).await {
                Ok(item) => item,
                Err(_) => {
                    shared.begin_close();
                    shared.stop.set();
                    let _ = timeout(DRAIN_DEADLINE, incoming.send(Err(Error::Timeout))).await;
                    break;
                }
            }
        } else {
            tokio::select! {
                item = framed.next() => item,
                _ = shared.closing.wait() => continue,
            }
        };

        let frame = match next {
            // peer sent a TCP FIN (or the stream died mid-frame)
            None => {
                shared.begin_close();
                shared.stop.set();
                break;
            }
            Some(Err(err)) => {
                match &err {
                    Error::Protocol(protocol_err) => {
                        close_for_protocol_error(&shared, &ctrl, protocol_err).await;
                    }
                    _ => {
                        shared.begin_close();
                        shared.stop.set();
                    }
                }
                let _ = timeout(DRAIN_DEADLINE, incoming.send(Err(err))).await;
                break;
            }
            Some(Ok(frame)) => frame,
        };

        match frame.opcode {
            OpCode::Ping => {
                // answered immediately, ahead of any queued data frames
                let _ = ctrl.send(Command::Pong(frame.payload)).await;
            }
            OpCode::Pong => {
                let _ = pong_seen.send(Instant::now());
            }
            OpCode::Close => {
                match frame.parse_close() {
                    Ok(close) => {
                        let code = close.as_ref().map(|c| c.code).unwrap_or(close_code::NORMAL);
                        tracing::debug!(id = shared.id, code, "close frame received");
                        if shared.begin_close() {
                            // peer initiated: reply with the mirrored code
                            let reply = CloseFrame {
                                code,
                                reason: Utf8Bytes::default(),
                            };
                            let _ = ctrl.send(Command::Close(Some(reply))).await;
                        }
                    }
                    Err(protocol_err) => {
                        close_for_protocol_error(&shared, &ctrl, &protocol_err).await;
                        let _ = timeout(DRAIN_DEADLINE, incoming.send(Err(protocol_err.into())))
                            .await;
                    }
                }
                break;
            }
            OpCode::Text | OpCode::Binary => {
                if assembly.is_some() {
                    protocol_fail(&shared, &ctrl, &incoming, ProtocolError::InvalidContinuation)
                        .await;
                    break;
                }
                if frame.fin {
                    if deliver(&incoming, &shared, &ctrl, frame.opcode, frame.payload)
                        .await
                        .is_err()
                    {
                        break;
                    }
                } else {
                    assembly = Some((frame.opcode, BytesMut::from(&frame.payload[..])));
                }
            }
            OpCode::Continuation => {
                let Some((_, buffer)) = assembly.as_mut() else {
                    protocol_fail(&shared, &ctrl, &incoming, ProtocolError::InvalidContinuation)
                        .await;
                    break;
                };
                let total = buffer.len() + frame.payload.len();
                if total > max_message_size {
                    protocol_fail(&shared, &ctrl, &incoming, ProtocolError::MessageTooLarge(total))
                        .await;
                    break;
                }
                buffer.extend_from_slice(&frame.payload);
                if frame.fin {
                    let (opcode, buffer) = assembly.take().expect("message is open");
                    if deliver(&incoming, &shared, &ctrl, opcode, buffer.freeze())
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    }

    // the reader owns the final transition: give the writer a moment to
    // put the close frame on the wire, then mark the connection closed
    shared.begin_close();
    drop(ctrl);
    let _ = timeout(DRAIN_DEADLINE, shared.writer_done.wait()).await;
    shared.finish_close();
    tracing::debug!(id = shared.id, "websocket connection closed");
}

/// Hand a reassembled message to the application, validating text frames
/// as UTF-8 first. An `Err` return means the reader loop should stop.
async fn deliver(
    incoming: &mpsc::Sender<Result<Message, Error>>,
    shared: &Shared,
    ctrl: &mpsc::Sender<Command>,
    opcode: OpCode,
    payload: Bytes,
) -> Result<(), ()> {
    let message = if opcode == OpCode::Text {
        match Utf8Bytes::try_from(payload) {
            Ok(text) => Message::Text(text),
            Err(_) => {
                protocol_fail(shared, ctrl, incoming, ProtocolError::InvalidUtf8).await;
                return Err(());
            }
        }
    } else {
        Message::Binary(payload)
    };

    // delivery blocks while the application is not receiving; that is the
    // read-side backpressure, and it ends if the socket handle goes away
    match incoming.send(Ok(message)).await {
        Ok(()) => Ok(()),
        Err(_) => {
            shared.begin_close();
            shared.stop.set();
            Err(())
        }
    }
}

async fn close_for_protocol_error(
    shared: &Shared,
    ctrl: &mpsc::Sender<Command>,
    err: &ProtocolError,
) {
    if shared.begin_close() {
        let close = CloseFrame {
            code: err.close_code(),
            reason: err.to_string().into(),
        };
        let _ = ctrl.send(Command::Close(Some(close))).await;
    }
}

async fn protocol_fail(
    shared: &Shared,
    ctrl: &mpsc::Sender<Command>,
    incoming: &mpsc::Sender<Result<Message, Error>>,
    err: ProtocolError,
) {
    close_for_protocol_error(shared, ctrl, &err).await;
    let _ = timeout(DRAIN_DEADLINE, incoming.send(Err(err.into()))).await;
}

async fn writer_task<S>(
    mut writer: WriteHalf<S>,
    mut data: mpsc::Receiver<Frame>,
    mut ctrl: mpsc::Receiver<Command>,
    shared: Arc<Shared>,
    write_deadline: Duration,
    write_buffer_size: usize,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    enum Job {
        Ctrl(Command),
        Data(Frame),
        Stop,
    }

    let mut codec = FrameCodec::new(usize::MAX);
    let mut buf = BytesMut::with_capacity(write_buffer_size);
    let mut stopping = false;

    loop {
        let job = if stopping {
            // only control traffic (the close frame) may still go out
            match timeout(DRAIN_DEADLINE, ctrl.recv()).await {
                Ok(Some(command)) => Job::Ctrl(command),
                _ => break,
            }
        } else {
            tokio::select! {
                biased;
                command = ctrl.recv() => match command {
                    Some(command) => Job::Ctrl(command),
                    None => break,
                },
                _ = shared.stop.wait() => Job::Stop,
                frame = data.recv() => match frame {
                    Some(frame) => Job::Data(frame),
                    None => break,
                },
            }
        };

        let frame = match job {
            Job::Stop => {
                stopping = true;
                continue;
            }
            Job::Ctrl(Command::Ping(payload)) => Frame::ping(payload),
            Job::Ctrl(Command::Pong(payload)) => Frame::pong(payload),
            Job::Ctrl(Command::Close(close)) => {
                // nothing may follow a close frame
                let _ = write_frame(
                    &mut writer,
                    &mut codec,
                    &mut buf,
                    Frame::close(close.as_ref()),
                    write_deadline,
                )
                .await;
                break;
            }
            Job::Data(frame) => frame,
        };

        if let Err(err) = write_frame(&mut writer, &mut codec, &mut buf, frame, write_deadline).await
        {
            tracing::debug!(id = shared.id, error = %err, "write failed");
            shared.begin_close();
            break;
        }
    }

    let _ = writer.shutdown().await;
    shared.writer_done.set();
}

async fn write_frame<S>(
    writer: &mut WriteHalf<S>,
    codec: &mut FrameCodec,
    buf: &mut BytesMut,
    frame: Frame,
    deadline: Duration,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    buf.clear();
    codec.encode(frame, buf)?;
    match timeout(deadline, async {
        writer.write_all(buf).await?;
        writer.flush().await
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.into()),
        Err(_) => Err(Error::Timeout),
    }
}

async fn timer_task(
    ctrl: mpsc::Sender<Command>,
    pong_seen: watch::Receiver<Instant>,
    shared: Arc<Shared>,
    ping_interval: Duration,
    pong_wait: Duration,
) {
    if ping_interval.is_zero() {
        return;
    }

    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    loop {
        tokio::select! {
            _ = shared.closing.wait() => return,
            _ = ticker.tick() => {}
        }

        if pong_seen.borrow().elapsed() > pong_wait {
            tracing::debug!(id = shared.id, "pong wait exceeded");
            if shared.begin_close() {
                let close = CloseFrame {
                    code: close_code::ERROR,
                    reason: "keepalive ping timeout".into(),
                };
                if ctrl.try_send(Command::Close(Some(close))).is_err() {
                    shared.stop.set();
                }
            }
            return;
        }

        let _ = ctrl.try_send(Command::Ping(Bytes::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::frame::client_frame;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn connect(config: &WebSocketConfig) -> (WebSocket, DuplexStream) {
        let (server, client) = tokio::io::duplex(4096);
        (WebSocket::from_stream(server, config), client)
    }

    /// Read one server frame off the wire; returns (first byte, payload).
    async fn read_frame(client: &mut DuplexStream) -> (u8, Vec<u8>) {
        let mut head = [0u8; 2];
        client.read_exact(&mut head).await.unwrap();
        assert_eq!(head[1] & 0x80, 0, "server frames must be unmasked");
        let len = match head[1] & 0x7f {
            126 => {
                let mut ext = [0u8; 2];
                client.read_exact(&mut ext).await.unwrap();
                u16::from_be_bytes(ext) as usize
            }
            127 => {
                let mut ext = [0u8; 8];
                client.read_exact(&mut ext).await.unwrap();
                u64::from_be_bytes(ext) as usize
            }
            n => n as usize,
        };
        let mut payload = vec![0u8; len];
        client.read_exact(&mut payload).await.unwrap();
        (head[0], payload)
    }

    async fn write_client(client: &mut DuplexStream, bytes: &[u8]) {
        client.write_all(bytes).await.unwrap();
    }

    #[tokio::test]
    async fn echoes_text_with_exact_wire_bytes() {
        let (mut socket, mut client) = connect(&WebSocketConfig::default());

        write_client(
            &mut client,
            &client_frame(true, 0x1, [0x37, 0xfa, 0x21, 0x3d], b"hello"),
        )
        .await;

        let msg = socket.recv().await.unwrap();
        assert_eq!(msg, Message::text("hello"));

        socket.send(msg).await.unwrap();

        let mut reply = [0u8; 7];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x81, 0x05, b'h', b'e', b'l', b'l', b'o']);
    }

    #[tokio::test]
    async fn reassembles_fragments_and_answers_interleaved_ping() {
        let (mut socket, mut client) = connect(&WebSocketConfig::default());

        write_client(&mut client, &client_frame(false, 0x1, [1, 2, 3, 4], b"he")).await;
        write_client(&mut client, &client_frame(true, 0x9, [5, 6, 7, 8], b"p")).await;
        write_client(&mut client, &client_frame(true, 0x0, [9, 10, 11, 12], b"llo")).await;

        // the pong goes out while the message is still being assembled
        let (head, payload) = read_frame(&mut client).await;
        assert_eq!(head, 0x8a);
        assert_eq!(payload, b"p");

        assert_eq!(socket.recv().await.unwrap(), Message::text("hello"));
    }

    #[tokio::test]
    async fn close_handshake_mirrors_peer_code() {
        let (mut socket, mut client) = connect(&WebSocketConfig::default());

        let mut close_payload = 1000u16.to_be_bytes().to_vec();
        close_payload.extend_from_slice(b"bye");
        write_client(
            &mut client,
            &client_frame(true, 0x8, [1, 2, 3, 4], &close_payload),
        )
        .await;

        // the reply carries the mirrored status code
        let (head, payload) = read_frame(&mut client).await;
        assert_eq!(head, 0x88);
        assert_eq!(payload, 1000u16.to_be_bytes());

        assert!(matches!(socket.recv().await, Err(Error::Closed)));
        socket.done().await;

        // the stream is torn down after the handshake
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        // every public operation now fails with Closed
        assert!(matches!(
            socket.send(Message::text("late")).await,
            Err(Error::Closed)
        ));
    }

    #[tokio::test]
    async fn local_close_sends_frame_and_is_idempotent() {
        let (mut socket, mut client) = connect(&WebSocketConfig::default());

        socket.close(1000, "done").await.unwrap();
        socket.close(1000, "done").await.unwrap();
        socket.close(4000, "still fine").await.unwrap();

        let (head, payload) = read_frame(&mut client).await;
        assert_eq!(head, 0x88);
        assert_eq!(&payload[..2], 1000u16.to_be_bytes());
        assert_eq!(&payload[2..], b"done");

        // peer answers and the connection finishes
        write_client(
            &mut client,
            &client_frame(true, 0x8, [1, 2, 3, 4], &1000u16.to_be_bytes()),
        )
        .await;

        socket.done().await;
        socket.done().await; // done is observable repeatedly
        assert!(matches!(socket.recv().await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn refuses_reserved_close_codes_locally() {
        let (socket, _client) = connect(&WebSocketConfig::default());
        for code in [1005, 1006, 1015, 999] {
            assert!(matches!(
                socket.close(code, "").await,
                Err(Error::Protocol(ProtocolError::BadCloseCode(_)))
            ));
        }
    }

    #[tokio::test]
    async fn invalid_utf8_text_closes_with_1007() {
        let (mut socket, mut client) = connect(&WebSocketConfig::default());

        write_client(
            &mut client,
            &client_frame(true, 0x1, [1, 2, 3, 4], &[0xff, 0xfe]),
        )
        .await;

        assert!(matches!(
            socket.recv().await,
            Err(Error::Protocol(ProtocolError::InvalidUtf8))
        ));

        let (head, payload) = read_frame(&mut client).await;
        assert_eq!(head, 0x88);
        assert_eq!(&payload[..2], 1007u16.to_be_bytes());
    }

    #[tokio::test]
    async fn utf8_sequence_split_across_fragments_validates() {
        let (mut socket, mut client) = connect(&WebSocketConfig::default());

        let heart = "💖".as_bytes(); // four bytes
        write_client(&mut client, &client_frame(false, 0x1, [1, 2, 3, 4], &heart[..2])).await;
        write_client(&mut client, &client_frame(true, 0x0, [5, 6, 7, 8], &heart[2..])).await;

        assert_eq!(socket.recv().await.unwrap(), Message::text("💖"));
    }

    #[tokio::test]
    async fn new_data_frame_during_open_message_is_rejected() {
        let (mut socket, mut client) = connect(&WebSocketConfig::default());

        write_client(&mut client, &client_frame(false, 0x1, [1, 2, 3, 4], b"he")).await;
        write_client(&mut client, &client_frame(true, 0x1, [1, 2, 3, 4], b"x")).await;

        assert!(matches!(
            socket.recv().await,
            Err(Error::Protocol(ProtocolError::InvalidContinuation))
        ));

        let (head, payload) = read_frame(&mut client).await;
        assert_eq!(head, 0x88);
        assert_eq!(&payload[..2], 1002u16.to_be_bytes());
    }

    #[tokio::test]
    async fn continuation_without_open_message_is_rejected() {
        let (mut socket, mut client) = connect(&WebSocketConfig::default());

        write_client(&mut client, &client_frame(true, 0x0, [1, 2, 3, 4], b"llo")).await;

        assert!(matches!(
            socket.recv().await,
            Err(Error::Protocol(ProtocolError::InvalidContinuation))
        ));
    }

    #[tokio::test]
    async fn oversized_reassembled_message_closes_with_1009() {
        let config = WebSocketConfig {
            max_message_size: 8,
            ..Default::default()
        };
        let (mut socket, mut client) = connect(&config);

        write_client(&mut client, &client_frame(false, 0x2, [1, 2, 3, 4], &[0u8; 6])).await;
        write_client(&mut client, &client_frame(true, 0x0, [1, 2, 3, 4], &[0u8; 6])).await;

        assert!(matches!(
            socket.recv().await,
            Err(Error::Protocol(ProtocolError::MessageTooLarge(12)))
        ));

        let (head, payload) = read_frame(&mut client).await;
        assert_eq!(head, 0x88);
        assert_eq!(&payload[..2], 1009u16.to_be_bytes());
    }

    #[tokio::test]
    async fn sends_are_serialized_in_call_order() {
        let (socket, mut client) = connect(&WebSocketConfig::default());

        for text in ["first", "second", "third"] {
            socket.send(Message::text(text)).await.unwrap();
        }

        for expected in ["first", "second", "third"] {
            let (head, payload) = read_frame(&mut client).await;
            assert_eq!(head, 0x81);
            assert_eq!(payload, expected.as_bytes());
        }
    }

    #[tokio::test]
    async fn binary_echo_uses_extended_length_form() {
        let (mut socket, mut client) = connect(&WebSocketConfig::default());

        let payload: Vec<u8> = (0..300).map(|i| i as u8).collect();
        write_client(&mut client, &client_frame(true, 0x2, [7, 7, 7, 7], &payload)).await;

        let msg = socket.recv().await.unwrap();
        assert_eq!(msg, Message::binary(payload.clone()));
        socket.send(msg).await.unwrap();

        let (head, echoed) = read_frame(&mut client).await;
        assert_eq!(head, 0x82);
        assert_eq!(echoed, payload);
    }

    #[tokio::test]
    async fn explicit_ping_and_pong_reach_the_wire() {
        let (socket, mut client) = connect(&WebSocketConfig::default());

        socket.ping(&b"probe"[..]).await.unwrap();
        let (head, payload) = read_frame(&mut client).await;
        assert_eq!(head, 0x89);
        assert_eq!(payload, b"probe");

        socket.pong(&b"beat"[..]).await.unwrap();
        let (head, payload) = read_frame(&mut client).await;
        assert_eq!(head, 0x8a);
        assert_eq!(payload, b"beat");

        drop(socket);
    }

    #[tokio::test]
    async fn peer_fin_closes_the_connection() {
        let (mut socket, client) = connect(&WebSocketConfig::default());
        drop(client);

        assert!(matches!(socket.recv().await, Err(Error::Closed)));
        socket.done().await;
    }

    #[tokio::test(start_paused = true)]
    async fn read_deadline_surfaces_timeout() {
        let config = WebSocketConfig {
            read_deadline: Some(Duration::from_secs(1)),
            ping_interval: Duration::ZERO,
            ..Default::default()
        };
        let (mut socket, _client) = connect(&config);

        assert!(matches!(socket.recv().await, Err(Error::Timeout)));
        socket.done().await;
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_then_closes_when_pongs_stop() {
        let config = WebSocketConfig {
            ping_interval: Duration::from_secs(5),
            pong_wait: Duration::from_secs(12),
            ..Default::default()
        };
        let (socket, mut client) = connect(&config);

        // two pings fit inside the pong grace period
        for _ in 0..2 {
            let (head, _) = read_frame(&mut client).await;
            assert_eq!(head, 0x89);
        }

        // still no pong: the next tick gives up with 1011
        let (head, payload) = read_frame(&mut client).await;
        assert_eq!(head, 0x88);
        assert_eq!(&payload[..2], close_code::ERROR.to_be_bytes());

        socket.done().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pongs_keep_the_connection_alive() {
        let config = WebSocketConfig {
            ping_interval: Duration::from_secs(5),
            pong_wait: Duration::from_secs(12),
            ..Default::default()
        };
        let (socket, mut client) = connect(&config);

        for _ in 0..4 {
            let (head, _) = read_frame(&mut client).await;
            assert_eq!(head, 0x89, "connection stays alive while pongs flow");
            write_client(&mut client, &client_frame(true, 0xa, [1, 2, 3, 4], b"")).await;
        }

        drop(socket);
    }

    #[tokio::test]
    async fn dropping_the_socket_closes_the_connection() {
        let (socket, mut client) = connect(&WebSocketConfig::default());
        let sender = socket.sender();
        drop(socket);

        let (head, payload) = read_frame(&mut client).await;
        assert_eq!(head, 0x88);
        assert_eq!(&payload[..2], 1000u16.to_be_bytes());

        sender.done().await;
        assert!(matches!(
            sender.send(Message::text("late")).await,
            Err(Error::Closed)
        ));
    }
}
