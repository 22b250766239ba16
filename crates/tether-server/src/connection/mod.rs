//! Transport-agnostic connection.
//!
//! A [`Connection`] is a cheap, cloneable handle on one bidirectional frame
//! channel. Every carrier runs a driver task that owns the transport; the
//! handle only talks to the driver through channels, so `send` and `close`
//! never block and never touch the socket directly.
//!
//! Lifecycle: `Connecting → Open → Closed`, `Connecting → Closed` when the
//! handshake fails, or born `Closed` for the failed stub. `Closed` is
//! terminal.
//!
//! Inbound text goes through a [`FrameDecoder`] backlog. Lines are only parsed
//! while at least one consuming handler ([`Connection::subscribe`]) is
//! registered; subscribing re-feeds whatever accumulated, so a late subscriber
//! does not miss frames. Watchers ([`Connection::watch`]) only see frames that
//! are parsed while they are registered and never claim the backlog, so the
//! order in which a watcher and a consumer attach does not matter. Each
//! handler owns a channel and every frame is re-checked at
//! [`MessageStream::recv`]: a frame for a handler that was removed, or for a
//! connection that has since closed, is dropped.

mod native;
mod web_client;
mod web_server;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tether_core::codec::{Frame, FrameDecoder, FrameKind};
use tether_core::{ConnectionError, ConnectionId, HandlerId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Which carrier backs a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Raw upgraded stream socket, newline-delimited frames.
    Native,
    /// Accepted WebSocket.
    WebServer,
    /// Dialed WebSocket.
    WebClient,
    /// Never-connected stub.
    Failed,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Native => "native",
            Self::WebServer => "web-server",
            Self::WebClient => "web-client",
            Self::Failed => "failed",
        })
    }
}

/// Connection lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress. Outbound frames queue up.
    Connecting,
    /// Transport is live.
    Open,
    /// Terminal.
    Closed,
}

struct Handler {
    tx: mpsc::UnboundedSender<Frame>,
    consumes: bool,
}

struct Inner {
    state: ConnectionState,
    error: Option<ConnectionError>,
    decoder: FrameDecoder,
    handlers: HashMap<HandlerId, Handler>,
}

impl Inner {
    fn has_consumer(&self) -> bool {
        self.handlers.values().any(|h| h.consumes)
    }
}

struct Shared {
    id: ConnectionId,
    kind: ConnectionKind,
    protocol: Option<String>,
    inner: Mutex<Inner>,
    outbound: mpsc::UnboundedSender<Frame>,
    closed: CancellationToken,
}

/// Handle on one connection. Clones share the connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Build the handle and the outbound queue its driver drains.
    fn build(
        kind: ConnectionKind,
        protocol: Option<String>,
        state: ConnectionState,
    ) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let conn = Self {
            shared: Arc::new(Shared {
                id: ConnectionId::new(),
                kind,
                protocol,
                inner: Mutex::new(Inner {
                    state,
                    error: None,
                    decoder: FrameDecoder::new(),
                    handlers: HashMap::new(),
                }),
                outbound,
                closed: CancellationToken::new(),
            }),
        };
        (conn, rx)
    }

    /// A connection that failed before it existed.
    ///
    /// Born closed with `error`; every operation is a no-op.
    #[must_use]
    pub fn failed(error: ConnectionError) -> Self {
        let (conn, _outbound) = Self::build(ConnectionKind::Failed, None, ConnectionState::Connecting);
        debug!(conn = %conn.id(), error = %error, "connection failed before opening");
        let _ = conn.close(Some(error));
        conn
    }

    /// Unique handle of this connection.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Carrier backing this connection.
    #[must_use]
    pub fn kind(&self) -> ConnectionKind {
        self.shared.kind
    }

    /// Negotiated protocol token, if the carrier has one.
    #[must_use]
    pub fn protocol(&self) -> Option<&str> {
        self.shared.protocol.as_deref()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state
    }

    /// Whether the transport is live.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Whether the connection has terminated.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Terminal error, if the connection closed abnormally.
    #[must_use]
    pub fn error(&self) -> Option<ConnectionError> {
        self.shared.inner.lock().error.clone()
    }

    /// Queue a frame for the peer.
    ///
    /// Frames sent while connecting are flushed in order once open. Returns
    /// `false` once closed.
    pub fn send(&self, kind: FrameKind, body: Value) -> bool {
        if self.is_closed() {
            return false;
        }
        self.shared.outbound.send(Frame::new(kind, body)).is_ok()
    }

    /// Close the connection. Only the first call has any effect.
    ///
    /// `None` marks an intentional close, `Some` an abnormal one.
    pub fn close(&self, error: Option<ConnectionError>) -> bool {
        {
            let mut inner = self.shared.inner.lock();
            if inner.state == ConnectionState::Closed {
                return false;
            }
            inner.state = ConnectionState::Closed;
            inner.error.clone_from(&error);
            inner.handlers.clear();
            inner.decoder.clear();
        }
        match &error {
            Some(err) => debug!(conn = %self.id(), kind = %self.kind(), error = %err, "connection closed"),
            None => debug!(conn = %self.id(), kind = %self.kind(), "connection closed"),
        }
        self.shared.closed.cancel();
        true
    }

    /// Wait for the connection to close and return its terminal error.
    pub async fn closed(&self) -> Option<ConnectionError> {
        self.shared.closed.cancelled().await;
        self.error()
    }

    /// Register a frame handler.
    ///
    /// Any complete frames already buffered are parsed and delivered to it
    /// (and to every other registered handler) first. On a closed connection
    /// the stream is already finished.
    #[must_use]
    pub fn subscribe(&self) -> MessageStream {
        self.register(true)
    }

    /// Register a handler that observes frames without claiming the backlog.
    ///
    /// A watcher alone does not cause inbound lines to be parsed; it sees
    /// what is parsed for consuming handlers while it is registered.
    #[must_use]
    pub fn watch(&self) -> MessageStream {
        self.register(false)
    }

    fn register(&self, consumes: bool) -> MessageStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = HandlerId::new();
        let backlog = {
            let mut inner = self.shared.inner.lock();
            if inner.state == ConnectionState::Closed {
                Vec::new()
            } else {
                let _ = inner.handlers.insert(id, Handler { tx, consumes });
                if consumes {
                    inner.decoder.drain()
                } else {
                    Vec::new()
                }
            }
        };
        for frame in backlog {
            self.receive(frame);
        }
        MessageStream {
            id,
            conn: self.clone(),
            rx,
        }
    }

    /// Remove a frame handler. Frames already queued for it are dropped.
    pub fn off(&self, id: HandlerId) -> bool {
        self.shared.inner.lock().handlers.remove(&id).is_some()
    }

    /// Close this connection when `token` is cancelled.
    ///
    /// The watcher task ends on its own once the connection closes.
    pub fn close_on(&self, token: CancellationToken) {
        let conn = self.clone();
        drop(tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => {
                    let _ = conn.close(None);
                }
                () = conn.shared.closed.cancelled() => {}
            }
        }));
    }

    // ── Driver side ─────────────────────────────────────────────────

    fn mark_open(&self) -> bool {
        let mut inner = self.shared.inner.lock();
        if inner.state == ConnectionState::Connecting {
            inner.state = ConnectionState::Open;
            true
        } else {
            false
        }
    }

    fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.shared.closed.cancelled()
    }

    /// Feed received text into the decoder.
    fn receive_text(&self, chunk: &str) {
        let frames = {
            let mut inner = self.shared.inner.lock();
            if inner.state == ConnectionState::Closed {
                return;
            }
            inner.decoder.push(chunk);
            if !inner.has_consumer() || !chunk.contains('\n') {
                return;
            }
            inner.decoder.drain()
        };
        for frame in frames {
            self.receive(frame);
        }
    }

    /// Handle one decoded frame: answer pings, then fan out.
    fn receive(&self, frame: Frame) {
        if frame.kind == FrameKind::Ping {
            let _ = self.send(FrameKind::Pong, frame.body.clone());
        }
        self.dispatch(frame);
    }

    /// Fan a frame out to the handlers registered right now.
    fn dispatch(&self, frame: Frame) {
        let inner = self.shared.inner.lock();
        if inner.state == ConnectionState::Closed {
            return;
        }
        for handler in inner.handlers.values() {
            let _ = handler.tx.send(frame.clone());
        }
    }

    fn accepts(&self, id: HandlerId) -> bool {
        let inner = self.shared.inner.lock();
        inner.state != ConnectionState::Closed && inner.handlers.contains_key(&id)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("kind", &self.shared.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MessageStream
// ─────────────────────────────────────────────────────────────────────────────

/// Frames delivered to one handler. Dropping it removes the handler.
pub struct MessageStream {
    id: HandlerId,
    conn: Connection,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl MessageStream {
    /// Handler registration, usable with [`Connection::off`].
    #[must_use]
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Next frame. `None` once the handler is removed or the connection closes.
    ///
    /// Cancel-safe.
    pub async fn recv(&mut self) -> Option<Frame> {
        while let Some(frame) = self.rx.recv().await {
            if self.conn.accepts(self.id) {
                return Some(frame);
            }
        }
        None
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        let _ = self.conn.off(self.id);
    }
}

impl fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageStream")
            .field("id", &self.id)
            .field("conn", &self.conn.id())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    /// Two native connections joined by an in-memory pipe.
    pub(crate) fn pair() -> (Connection, Connection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Connection::native(a, None), Connection::native(b, None))
    }

    async fn next(stream: &mut MessageStream) -> Frame {
        tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn failed_stub_is_closed() {
        let conn = Connection::failed(ConnectionError::Refused("nowhere".into()));
        assert_eq!(conn.kind(), ConnectionKind::Failed);
        assert!(conn.is_closed());
        assert!(!conn.send(FrameKind::Message, json!(1)));
        assert!(!conn.close(None));
        assert_eq!(
            conn.closed().await,
            Some(ConnectionError::Refused("nowhere".into()))
        );
        let mut stream = conn.subscribe();
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_keeps_first_error() {
        let (a, _b) = pair();
        assert!(a.is_open());
        assert!(a.close(Some(ConnectionError::KeepaliveTimeout)));
        assert!(!a.close(None));
        assert_eq!(a.closed().await, Some(ConnectionError::KeepaliveTimeout));
        assert!(!a.send(FrameKind::Message, json!("late")));
    }

    #[tokio::test]
    async fn frames_flow_between_peers() {
        let (a, b) = pair();
        let mut inbox = b.subscribe();
        assert!(a.send(FrameKind::Message, json!([1, {"project": "x"}])));
        assert!(a.send(FrameKind::Message, json!([2, false])));
        assert_eq!(next(&mut inbox).await.body, json!([1, {"project": "x"}]));
        assert_eq!(next(&mut inbox).await.body, json!([2, false]));
    }

    #[tokio::test]
    async fn ping_is_answered_with_matching_pong() {
        let (a, b) = pair();
        let _b_handler = b.subscribe();
        let mut replies = a.subscribe();
        assert!(a.send(FrameKind::Ping, json!("nonce-1")));
        let frame = next(&mut replies).await;
        assert_eq!(frame, Frame::new(FrameKind::Pong, json!("nonce-1")));
    }

    #[tokio::test(start_paused = true)]
    async fn late_subscriber_gets_buffered_frames() {
        let (a, b) = pair();
        assert!(a.send(FrameKind::Message, json!("early")));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut inbox = b.subscribe();
        assert_eq!(next(&mut inbox).await.body, json!("early"));
    }

    #[tokio::test(start_paused = true)]
    async fn buffered_frames_reach_consumer_behind_watcher() {
        let (a, b) = pair();
        assert!(a.send(FrameKind::Message, json!([1, {"project": "early"}])));
        assert!(a.send(FrameKind::Message, json!([2, {"project": "early"}])));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut watcher = b.watch();
        let mut inbox = b.subscribe();
        assert_eq!(next(&mut inbox).await.body, json!([1, {"project": "early"}]));
        assert_eq!(next(&mut inbox).await.body, json!([2, {"project": "early"}]));
        // the watcher was registered when the backlog was parsed
        assert_eq!(next(&mut watcher).await.body, json!([1, {"project": "early"}]));
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_alone_leaves_backlog_unparsed() {
        let (a, b) = pair();
        let mut watcher = b.watch();
        assert!(a.send(FrameKind::Message, json!("held")));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(watcher.rx.try_recv().is_err());

        let mut inbox = b.subscribe();
        assert_eq!(next(&mut inbox).await.body, json!("held"));
        assert_eq!(next(&mut watcher).await.body, json!("held"));
    }

    #[tokio::test(start_paused = true)]
    async fn off_suppresses_queued_frames() {
        let (a, b) = pair();
        let mut inbox = b.subscribe();
        assert!(a.send(FrameKind::Message, json!(1)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(b.off(inbox.id()));
        assert!(inbox.recv().await.is_none());
    }

    #[tokio::test]
    async fn peer_close_closes_cleanly() {
        let (a, b) = pair();
        assert!(a.close(None));
        let err = tokio::time::timeout(Duration::from_secs(5), b.closed())
            .await
            .unwrap();
        assert_eq!(err, None);
        assert!(b.is_closed());
    }

    #[tokio::test]
    async fn stream_ends_when_connection_closes() {
        let (a, _b) = pair();
        let mut inbox = a.subscribe();
        let _ = a.close(None);
        assert!(inbox.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_on_token() {
        let (a, _b) = pair();
        let token = CancellationToken::new();
        a.close_on(token.clone());
        token.cancel();
        let err = tokio::time::timeout(Duration::from_secs(5), a.closed())
            .await
            .unwrap();
        assert!(err.is_none());
    }

    #[test]
    fn kind_display() {
        assert_eq!(ConnectionKind::WebServer.to_string(), "web-server");
        assert_eq!(ConnectionKind::Failed.to_string(), "failed");
    }
}
