//! Dialed WebSocket carrier.
//!
//! The handshake runs inside the driver, so the connection starts out
//! `Connecting` and frames sent meanwhile queue until it opens. Every frame,
//! ping and pong included, travels as text.

use futures::{Sink, SinkExt, StreamExt};
use tether_core::ConnectionError;
use tether_core::codec::{self, Frame};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::info;

use super::{Connection, ConnectionKind, ConnectionState};

impl Connection {
    /// Dial a `ws://` address.
    ///
    /// An unparseable address yields the failed stub. Handshake failures
    /// close the returned connection with the cause.
    pub fn web_client(address: &str) -> Self {
        let request = match address.into_client_request() {
            Ok(request) => request,
            Err(err) => {
                return Self::failed(ConnectionError::InvalidAddress {
                    address: address.to_owned(),
                    reason: err.to_string(),
                });
            }
        };
        let (conn, outbound) =
            Self::build(ConnectionKind::WebClient, None, ConnectionState::Connecting);
        drop(tokio::spawn(drive(conn.clone(), request, outbound)));
        conn
    }
}

async fn drive(conn: Connection, request: Request, mut outbound: mpsc::UnboundedReceiver<Frame>) {
    let uri = request.uri().to_string();
    let handshake = tokio::select! {
        () = conn.cancelled() => return,
        result = tokio_tungstenite::connect_async(request) => result,
    };
    let socket = match handshake {
        Ok((socket, _response)) => socket,
        Err(err) => {
            let _ = conn.close(Some(classify(err)));
            return;
        }
    };
    if !conn.mark_open() {
        return;
    }
    info!(conn = %conn.id(), uri = %uri, "websocket connected");

    let (mut sink, mut stream) = socket.split();
    let error = loop {
        tokio::select! {
            () = conn.cancelled() => break None,
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => conn.receive_text(text.as_str()),
                Some(Ok(Message::Binary(data))) => conn.receive_text(&String::from_utf8_lossy(&data)),
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Ok(_)) => {}
                Some(Err(err)) => break Some(classify(err)),
            },
            Some(frame) = outbound.recv() => {
                if let Err(err) = send_frame(&mut sink, &frame).await {
                    break Some(classify(err));
                }
            }
        }
    };

    let _ = sink.close().await;
    let _ = conn.close(error);
}

async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), tungstenite::Error>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    for piece in codec::encode_chunks(frame) {
        sink.feed(Message::text(piece)).await?;
    }
    sink.flush().await
}

fn classify(err: tungstenite::Error) -> ConnectionError {
    match err {
        tungstenite::Error::Io(io) if io.kind() == std::io::ErrorKind::ConnectionRefused => {
            ConnectionError::Refused(io.to_string())
        }
        tungstenite::Error::Io(io) => ConnectionError::Io(io.to_string()),
        tungstenite::Error::Http(response) => {
            ConnectionError::Handshake(format!("unexpected status {}", response.status()))
        }
        tungstenite::Error::Url(url) => ConnectionError::InvalidAddress {
            address: String::new(),
            reason: url.to_string(),
        },
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ConnectionError::Closed
        }
        other => ConnectionError::WebSocket(other.to_string()),
    }
}
