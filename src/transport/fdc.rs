//! Framed Duplex Channel (FDC).
//!
//! Wraps a WebSocket-framed duplex byte stream with an ordered,
//! single-reader, bounded-queue contract: `wait_open`, `send`,
//! `recv`/`recv_json`/`recv_json_with_field`, `close`, `terminate`, and
//! `subscribe` for push mode.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::ids::ConnectionId;
use crate::transport::queue::{BoundedQueue, MultiPromise, QueueError};
use crate::ws::{WsMessage, WsReader, WsWriter};

/// A single frame exchanged over the channel.
#[derive(Debug, Clone)]
pub enum Frame {
    /// UTF-8 text frame.
    Text(String),
    /// Opaque binary frame.
    Binary(Vec<u8>),
}

impl Frame {
    /// Borrow this frame's bytes regardless of text/binary framing.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Binary(b) => b,
        }
    }
}

/// Failure modes surfaced by the Framed Duplex Channel.
#[derive(Debug, Clone)]
pub enum FdcError {
    /// Another `recv*` call is already pending.
    ReaderBusy,
    /// The frame queue overflowed with no consumer; the channel is now closed.
    QueueOverflow,
    /// Terminal: carries the accumulated, source-tagged close reason.
    Closed(String),
    /// The caller-supplied timeout elapsed.
    Timeout,
    /// The wait was cancelled.
    Cancelled,
    /// `recv*` was called while the channel is in push mode.
    Disabled,
    /// `recv_json*` received a frame that was not valid JSON.
    MalformedJson(String),
    /// `recv_json_with_field` received a JSON object lacking or mismatching
    /// the expected field.
    WrongType {
        /// The field that was checked.
        key: String,
        /// The value it was required to equal.
        expected: String,
        /// What was actually found, if the key was present.
        found: Option<String>,
    },
    /// The underlying transport rejected a write.
    SendFailed(String),
}

impl fmt::Display for FdcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReaderBusy => write!(f, "a recv is already pending on this channel"),
            Self::QueueOverflow => write!(f, "frame queue overflowed"),
            Self::Closed(reason) => write!(f, "channel closed: {reason}"),
            Self::Timeout => write!(f, "timed out"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Disabled => write!(f, "channel is in push mode"),
            Self::MalformedJson(detail) => write!(f, "malformed json: {detail}"),
            Self::WrongType {
                key,
                expected,
                found,
            } => write!(
                f,
                "field {key} expected {expected}, found {}",
                found.as_deref().unwrap_or("<missing>")
            ),
            Self::SendFailed(detail) => write!(f, "send failed: {detail}"),
        }
    }
}

impl std::error::Error for FdcError {}

impl From<QueueError> for FdcError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::ReaderBusy => Self::ReaderBusy,
            QueueError::QueueOverflow => Self::QueueOverflow,
            QueueError::Closed(reason) => Self::Closed(reason),
            QueueError::Timeout => Self::Timeout,
            QueueError::Cancelled => Self::Cancelled,
        }
    }
}

/// A push-mode frame handler, installed via [`FramedDuplexChannel::subscribe`].
pub type FrameHandler = Arc<dyn Fn(Frame) + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Pull,
    Push,
}

struct Shared<S> {
    id: ConnectionId,
    writer: Mutex<WsWriter<S>>,
    queue: BoundedQueue<Frame>,
    terminal: MultiPromise<()>,
    reasons: Mutex<Vec<String>>,
    mode: Mutex<Mode>,
    handler: Mutex<Option<FrameHandler>>,
    max_close_reason_bytes: usize,
    closing: AtomicBool,
}

/// A bidirectional, ordered, reliable frame transport over a WebSocket.
pub struct FramedDuplexChannel<S> {
    shared: Arc<Shared<S>>,
    reader_task: JoinHandle<()>,
}

impl<S> fmt::Debug for FramedDuplexChannel<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedDuplexChannel")
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

impl<S> Drop for FramedDuplexChannel<S> {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

impl<S> FramedDuplexChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an already-open WebSocket reader/writer pair. The channel is
    /// open immediately — `wait_open` exists for interface symmetry with
    /// dialers that may still be negotiating.
    pub fn new(id: ConnectionId, writer: WsWriter<S>, reader: WsReader<S>, max_frame_queue: usize) -> Self {
        let shared = Arc::new(Shared {
            id,
            writer: Mutex::new(writer),
            queue: BoundedQueue::new(max_frame_queue),
            terminal: MultiPromise::new(),
            reasons: Mutex::new(Vec::new()),
            mode: Mutex::new(Mode::Pull),
            handler: Mutex::new(None),
            max_close_reason_bytes: 123,
            closing: AtomicBool::new(false),
        });

        let reader_task = tokio::spawn(Self::read_loop(Arc::clone(&shared), reader));

        Self { shared, reader_task }
    }

    /// This channel's connection id, for logging.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    async fn read_loop(shared: Arc<Shared<S>>, mut reader: WsReader<S>) {
        loop {
            match reader.recv().await {
                Some(Ok(WsMessage::Text(text))) => {
                    Self::deliver(&shared, Frame::Text(text)).await;
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    Self::deliver(&shared, Frame::Binary(data)).await;
                }
                Some(Ok(WsMessage::Ping(payload))) => {
                    let mut writer = shared.writer.lock().await;
                    let _ = writer.send_pong(payload).await;
                }
                Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close { code, reason })) => {
                    let detail = if reason.is_empty() {
                        format!("code {code}")
                    } else {
                        format!("code {code}: {reason}")
                    };
                    Self::fail(&shared, "remote", detail).await;
                    return;
                }
                Some(Err(err)) => {
                    Self::fail(&shared, "transport", err.to_string()).await;
                    return;
                }
                None => {
                    Self::fail(&shared, "transport", "connection closed".to_string()).await;
                    return;
                }
            }

            if shared.terminal.is_resolved().await {
                return;
            }
        }
    }

    async fn deliver(shared: &Arc<Shared<S>>, frame: Frame) {
        let mode = *shared.mode.lock().await;
        if mode == Mode::Push {
            let handler = shared.handler.lock().await.clone();
            if let Some(handler) = handler {
                handler(frame);
            }
            return;
        }
        // An overflow here is silent at push time; the next recv() (or the
        // one already pending) observes QueueOverflow and that closes the
        // channel — the producer never blocks or silently evicts instead.
        shared.queue.push(frame).await;
    }

    async fn accumulated_reason(shared: &Shared<S>) -> String {
        shared.reasons.lock().await.join("; ")
    }

    async fn fail(shared: &Arc<Shared<S>>, source: &str, reason: String) {
        shared
            .reasons
            .lock()
            .await
            .push(format!("{source}: {reason}"));
        let already_terminal = shared.terminal.is_resolved().await;
        shared.terminal.resolve(()).await;
        if !already_terminal {
            let joined = Self::accumulated_reason(shared).await;
            shared.queue.close(joined).await;
        }
    }

    /// Resolves immediately: the channel is constructed already open.
    pub async fn wait_open(&self, timeout: Option<Duration>) -> Result<(), FdcError> {
        if self.shared.terminal.is_resolved().await {
            return Err(FdcError::Closed(
                Self::accumulated_reason(&self.shared).await,
            ));
        }
        let _ = timeout;
        Ok(())
    }

    /// Send a frame. Fails with `Closed` once the channel has reached a
    /// terminal state.
    pub async fn send(&self, frame: Frame) -> Result<(), FdcError> {
        if self.shared.terminal.is_resolved().await {
            return Err(FdcError::Closed(
                Self::accumulated_reason(&self.shared).await,
            ));
        }
        let mut writer = self.shared.writer.lock().await;
        let result = match frame {
            Frame::Text(text) => writer.send_text(&text).await,
            Frame::Binary(data) => writer.send_binary(data).await,
        };
        drop(writer);
        if let Err(err) = result {
            let detail = err.to_string();
            Self::fail(&self.shared, "transport", detail.clone()).await;
            return Err(FdcError::SendFailed(detail));
        }
        Ok(())
    }

    async fn recv_frame(&self, timeout: Option<Duration>) -> Result<Frame, FdcError> {
        if *self.shared.mode.lock().await == Mode::Push {
            return Err(FdcError::Disabled);
        }
        if self.shared.terminal.is_resolved().await {
            return Err(FdcError::Closed(
                Self::accumulated_reason(&self.shared).await,
            ));
        }
        match self.shared.queue.recv(timeout).await {
            Ok(frame) => Ok(frame),
            Err(QueueError::QueueOverflow) => {
                Self::fail(&self.shared, "queue", "overflow".to_string()).await;
                Err(FdcError::QueueOverflow)
            }
            Err(QueueError::Closed(_)) => Err(FdcError::Closed(
                Self::accumulated_reason(&self.shared).await,
            )),
            Err(QueueError::Cancelled) if *self.shared.mode.lock().await == Mode::Push => {
                Err(FdcError::Disabled)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Receive the next frame, suspending up to `timeout`.
    pub async fn recv(&self, timeout: Option<Duration>) -> Result<Frame, FdcError> {
        self.recv_frame(timeout).await
    }

    /// Receive the next frame and parse it as JSON.
    pub async fn recv_json(&self, timeout: Option<Duration>) -> Result<Value, FdcError> {
        let frame = self.recv_frame(timeout).await?;
        let text = match &frame {
            Frame::Text(text) => text.as_str(),
            Frame::Binary(_) => return Err(FdcError::MalformedJson("binary frame".to_string())),
        };
        serde_json::from_str(text).map_err(|err| FdcError::MalformedJson(err.to_string()))
    }

    /// Receive JSON and additionally require `object[key] == expected`.
    pub async fn recv_json_with_field(
        &self,
        timeout: Option<Duration>,
        key: &str,
        expected: &str,
    ) -> Result<Value, FdcError> {
        let value = self.recv_json(timeout).await?;
        let found = value.get(key).and_then(Value::as_str);
        if found != Some(expected) {
            return Err(FdcError::WrongType {
                key: key.to_string(),
                expected: expected.to_string(),
                found: found.map(ToString::to_string),
            });
        }
        Ok(value)
    }

    fn truncate_reason(&self, reason: &str) -> String {
        if reason.len() <= self.shared.max_close_reason_bytes {
            return reason.to_string();
        }
        let mut end = self.shared.max_close_reason_bytes;
        while end > 0 && !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason[..end].to_string()
    }

    /// Graceful close: sends a close frame (reason truncated to the
    /// configured byte budget) and marks the channel terminal.
    pub async fn close(&self, reason: &str) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return; // already closed — no-op
        }
        let wire_reason = self.truncate_reason(reason);
        let mut writer = self.shared.writer.lock().await;
        let _ = writer.send_close(wire_reason).await;
        drop(writer);
        Self::fail(&self.shared, "local_close", reason.to_string()).await;
    }

    /// Immediate close: releases all waiters without waiting for the peer's
    /// FIN. Still attempts a best-effort close frame.
    pub async fn terminate(&self, reason: &str) {
        if self.shared.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        Self::fail(&self.shared, "local_terminate", reason.to_string()).await;
        let wire_reason = self.truncate_reason(reason);
        if let Ok(mut writer) = self.shared.writer.try_lock() {
            let _ = writer.send_close(wire_reason).await;
        }
    }

    /// Switch to push mode. Drains any buffered frames into `handler`
    /// first, then delivers every subsequent frame directly. Any `recv*`
    /// already pending is rejected with `Disabled`.
    pub async fn subscribe(&self, handler: FrameHandler) {
        let drained = self.shared.queue.drain().await;
        *self.shared.mode.lock().await = Mode::Push;
        *self.shared.handler.lock().await = Some(Arc::clone(&handler));
        // A recv* suspended before this call would otherwise never be woken:
        // frames now route to the handler instead of the queue, so it would
        // hang until its own timeout rather than failing fast.
        self.shared.queue.reject_pending_reader().await;
        for frame in drained {
            handler(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (
        FramedDuplexChannel<TcpStream>,
        FramedDuplexChannel<crate::ws::ClientStream>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();

        let server_fut = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            crate::ws::accept(stream).await.unwrap()
        });

        let (client_writer, client_reader) =
            crate::ws::connect(&format!("ws://{addr}"), &[]).await.unwrap();
        let (server_writer, server_reader) = server_fut.await.unwrap();

        let server = FramedDuplexChannel::new(ConnectionId::next(), server_writer, server_reader, 8);
        let client = FramedDuplexChannel::new(ConnectionId::next(), client_writer, client_reader, 8);
        (server, client)
    }

    #[tokio::test]
    async fn send_then_recv_round_trip() {
        let (server, client) = pair().await;
        client.send(Frame::Text("hello".to_string())).await.unwrap();
        let frame = server.recv(Some(Duration::from_secs(2))).await.unwrap();
        match frame {
            Frame::Text(text) => assert_eq!(text, "hello"),
            Frame::Binary(_) => panic!("expected text frame"),
        }
    }

    #[tokio::test]
    async fn recv_json_parses_object() {
        let (server, client) = pair().await;
        client
            .send(Frame::Text(r#"{"command":"register","public_key":"ab"}"#.to_string()))
            .await
            .unwrap();
        let value = server.recv_json(Some(Duration::from_secs(2))).await.unwrap();
        assert_eq!(value["command"], "register");
    }

    #[tokio::test]
    async fn recv_json_with_field_rejects_mismatch() {
        let (server, client) = pair().await;
        client
            .send(Frame::Text(r#"{"command":"register"}"#.to_string()))
            .await
            .unwrap();
        let err = server
            .recv_json_with_field(Some(Duration::from_secs(2)), "command", "communication_request")
            .await
            .unwrap_err();
        assert!(matches!(err, FdcError::WrongType { .. }));
    }

    #[tokio::test]
    async fn second_concurrent_recv_fails_reader_busy() {
        let (server, _client) = pair().await;
        let server = Arc::new(server);
        let s2 = Arc::clone(&server);
        let first = tokio::spawn(async move { s2.recv(Some(Duration::from_millis(500))).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = server.recv(Some(Duration::from_millis(10))).await;
        assert!(matches!(second, Err(FdcError::ReaderBusy)));
        drop(first);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (server, _client) = pair().await;
        server.close("bye").await;
        server.close("bye again").await; // no-op, must not panic or deadlock
        let err = server.recv(Some(Duration::from_millis(50))).await.unwrap_err();
        assert!(matches!(err, FdcError::Closed(_)));
    }

    #[tokio::test]
    async fn subscribe_rejects_a_pending_recv_with_disabled() {
        let (server, _client) = pair().await;
        let server = Arc::new(server);
        let s2 = Arc::clone(&server);
        let pending = tokio::spawn(async move { s2.recv(Some(Duration::from_secs(5))).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        server.subscribe(Arc::new(|_frame| {})).await;
        let result = tokio::time::timeout(Duration::from_millis(200), pending)
            .await
            .expect("subscribe must wake the pending recv instead of leaving it hanging")
            .unwrap();
        assert!(matches!(result, Err(FdcError::Disabled)));
    }

    #[tokio::test]
    async fn subscribe_delivers_frames_to_handler() {
        let (server, client) = pair().await;
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        server
            .subscribe(Arc::new(move |_frame| {
                count2.fetch_add(1, Ordering::SeqCst);
            }))
            .await;
        client.send(Frame::Text("one".to_string())).await.unwrap();
        client.send(Frame::Text("two".to_string())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
