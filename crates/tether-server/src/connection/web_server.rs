//! Accepted WebSocket carrier.
//!
//! Message frames travel as text, split into bounded pieces. Ping and pong
//! travel as WebSocket control frames carrying the JSON body, so browser peers
//! answer keepalive pings without any application code.

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tether_core::ConnectionError;
use tether_core::codec::{self, Frame, FrameKind};
use tokio::sync::mpsc;

use super::{Connection, ConnectionKind, ConnectionState};

impl Connection {
    /// Wrap an upgraded server-side WebSocket. Opens immediately.
    pub fn web_server(socket: WebSocket) -> Self {
        let protocol = socket
            .protocol()
            .and_then(|p| p.to_str().ok())
            .map(str::to_owned);
        let (conn, outbound) =
            Self::build(ConnectionKind::WebServer, protocol, ConnectionState::Open);
        drop(tokio::spawn(drive(conn.clone(), socket, outbound)));
        conn
    }
}

async fn drive(conn: Connection, socket: WebSocket, mut outbound: mpsc::UnboundedReceiver<Frame>) {
    let (mut sink, mut stream) = socket.split();

    let error = loop {
        tokio::select! {
            () = conn.cancelled() => break None,
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => conn.receive_text(text.as_str()),
                Some(Ok(Message::Binary(data))) => conn.receive_text(&String::from_utf8_lossy(&data)),
                // the socket already answered with a protocol-level pong
                Some(Ok(Message::Ping(payload))) => conn.dispatch(control_frame(FrameKind::Ping, &payload)),
                Some(Ok(Message::Pong(payload))) => conn.dispatch(control_frame(FrameKind::Pong, &payload)),
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Err(err)) => break Some(ConnectionError::WebSocket(err.to_string())),
            },
            Some(frame) = outbound.recv() => {
                if let Err(err) = send_frame(&mut sink, &frame).await {
                    break Some(ConnectionError::WebSocket(err.to_string()));
                }
            }
        }
    };

    let _ = sink.close().await;
    let _ = conn.close(error);
}

fn control_frame(kind: FrameKind, payload: &[u8]) -> Frame {
    Frame::new(kind, serde_json::from_slice(payload).unwrap_or(Value::Null))
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &Frame,
) -> Result<(), axum::Error> {
    match frame.kind {
        FrameKind::Ping => sink.send(Message::Ping(Bytes::from(frame.body.to_string()))).await,
        FrameKind::Pong => sink.send(Message::Pong(Bytes::from(frame.body.to_string()))).await,
        FrameKind::Message => {
            for piece in codec::encode_chunks(frame) {
                sink.feed(Message::Text(piece.into())).await?;
            }
            sink.flush().await
        }
    }
}
