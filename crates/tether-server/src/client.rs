//! Dialing a hub and staying attached to it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Empty;
use hyper::header::{CONNECTION, HOST, UPGRADE};
use hyper::upgrade::Upgraded;
use hyper::{Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tether_core::{ConnectionError, Hub};
use tether_settings::{ClientCarrier, TetherSettings};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bridge::bridge;
use crate::connection::Connection;

/// Dial `address` over `carrier`.
///
/// Never fails outright: a connection that could not be established comes
/// back closed, carrying the cause as its error.
pub async fn connect(address: &str, carrier: ClientCarrier, protocol: &str) -> Connection {
    match carrier {
        ClientCarrier::Websocket => Connection::web_client(address),
        ClientCarrier::Native => match request_upgrade(address, protocol).await {
            Ok(stream) => {
                let conn = Connection::native(stream, Some(protocol.to_owned()));
                info!(conn = %conn.id(), address, protocol, "native connection upgraded");
                conn
            }
            Err(err) => Connection::failed(err),
        },
    }
}

/// HTTP/1.1 request with `Upgrade: <protocol>`, returning the raw stream.
async fn request_upgrade(
    address: &str,
    protocol: &str,
) -> Result<TokioIo<Upgraded>, ConnectionError> {
    let invalid = |reason: String| ConnectionError::InvalidAddress {
        address: address.to_owned(),
        reason,
    };

    let uri: Uri = address.parse().map_err(|e: hyper::http::uri::InvalidUri| invalid(e.to_string()))?;
    if !matches!(uri.scheme_str(), Some("ws" | "http")) {
        return Err(invalid("expected a ws:// or http:// address".to_owned()));
    }
    let authority = uri
        .authority()
        .ok_or_else(|| invalid("missing host".to_owned()))?
        .clone();
    let host = authority.host().trim_start_matches('[').trim_end_matches(']');
    let port = authority.port_u16().unwrap_or(80);

    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| ConnectionError::Refused(e.to_string()))?;
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| ConnectionError::Handshake(e.to_string()))?;
    drop(tokio::spawn(async move {
        if let Err(err) = connection.with_upgrades().await {
            debug!(error = %err, "upgrade request connection ended");
        }
    }));

    let path = uri.path_and_query().map_or("/", |p| p.as_str());
    let request = Request::builder()
        .uri(path)
        .header(HOST, authority.as_str())
        .header(CONNECTION, "upgrade")
        .header(UPGRADE, protocol)
        .body(Empty::<Bytes>::new())
        .map_err(|e| invalid(e.to_string()))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| ConnectionError::Handshake(e.to_string()))?;
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(ConnectionError::Handshake(format!(
            "unexpected status {}",
            response.status()
        )));
    }
    let upgraded = hyper::upgrade::on(response)
        .await
        .map_err(|e| ConnectionError::Handshake(e.to_string()))?;
    Ok(TokioIo::new(upgraded))
}

// ─────────────────────────────────────────────────────────────────────────────
// IpcClient
// ─────────────────────────────────────────────────────────────────────────────

struct ClientInner {
    hub: Hub,
    address: Mutex<Option<String>>,
    carrier: ClientCarrier,
    protocol: String,
    retry_after: Duration,
    active: Mutex<Option<CancellationToken>>,
    stopped: CancellationToken,
}

/// Keeps a hub attached to a remote hub while it has anything to share.
///
/// [`sync`](Self::sync) connects, bridges until the connection drops, waits
/// `retry_after` and reconnects, for as long as an address is set and the
/// hub holds facts or subscribers. Clones share the same loop.
#[derive(Clone)]
pub struct IpcClient {
    inner: Arc<ClientInner>,
}

impl IpcClient {
    /// Client for `hub`, configured from `settings`.
    pub fn new(hub: Hub, settings: &TetherSettings) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                hub,
                address: Mutex::new(settings.ipc.attach_address.clone()),
                carrier: settings.client.carrier,
                protocol: settings.ipc.protocol.clone(),
                retry_after: settings.client.retry_after(),
                active: Mutex::new(None),
                stopped: CancellationToken::new(),
            }),
        }
    }

    /// Hub address to attach to, if any.
    pub fn address(&self) -> Option<String> {
        self.inner.address.lock().clone()
    }

    /// Change the hub address. Takes effect on the next (re)connect.
    pub fn set_address(&self, address: Option<String>) {
        *self.inner.address.lock() = address;
    }

    /// Whether a sync loop is running.
    pub fn is_syncing(&self) -> bool {
        self.inner.active.lock().is_some()
    }

    /// Run the connect/bridge/retry loop.
    ///
    /// Returns `false` at once if a loop is already running or the client
    /// was shut down; otherwise returns `true` once the loop ends because
    /// the hub became empty, the address was unset or [`shutdown`] was
    /// called.
    ///
    /// [`shutdown`]: Self::shutdown
    pub async fn sync(&self) -> bool {
        let token = {
            let mut active = self.inner.active.lock();
            if active.is_some() || self.inner.stopped.is_cancelled() {
                return false;
            }
            let token = self.inner.stopped.child_token();
            *active = Some(token.clone());
            token
        };

        loop {
            let address = {
                let mut active = self.inner.active.lock();
                // decided under the slot lock so a concurrent commit either
                // sees the slot free or is picked up by this loop
                match self.address() {
                    Some(address) if !token.is_cancelled() && self.inner.hub.any() => address,
                    _ => {
                        *active = None;
                        break;
                    }
                }
            };

            let conn = connect(&address, self.inner.carrier, &self.inner.protocol).await;
            conn.close_on(token.clone());
            bridge(&self.inner.hub, &conn, None).await;

            match conn.error() {
                Some(err) => debug!(address, error = %err, "hub connection lost"),
                None => debug!(address, "hub connection closed"),
            }
            tokio::select! {
                () = tokio::time::sleep(self.inner.retry_after) => {}
                () = token.cancelled() => {}
            }
        }

        debug!("sync loop ended");
        true
    }

    /// Stop the loop for good and close its connection.
    pub fn shutdown(&self) {
        self.inner.stopped.cancel();
    }
}

impl std::fmt::Debug for IpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcClient")
            .field("address", &self.address())
            .field("carrier", &self.inner.carrier)
            .field("syncing", &self.is_syncing())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionKind;
    use serde_json::json;
    use tether_core::{FactKey, FactValue};
    use tokio::net::TcpListener;

    async fn refused_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{addr}/")
    }

    fn settings(address: Option<String>, carrier: ClientCarrier) -> TetherSettings {
        let mut settings = TetherSettings::default();
        settings.ipc.attach_address = address;
        settings.client.carrier = carrier;
        settings.client.retry_after_ms = 50;
        settings
    }

    #[tokio::test]
    async fn native_refused_is_failed_stub() {
        let conn = connect(&refused_address().await, ClientCarrier::Native, "ipc").await;
        assert_eq!(conn.kind(), ConnectionKind::Failed);
        assert!(matches!(conn.error(), Some(ConnectionError::Refused(_))));
    }

    #[tokio::test]
    async fn native_rejects_foreign_scheme() {
        let conn = connect("wss://localhost/", ClientCarrier::Native, "ipc").await;
        assert!(matches!(
            conn.error(),
            Some(ConnectionError::InvalidAddress { .. })
        ));
        let conn = connect("not an address", ClientCarrier::Native, "ipc").await;
        assert!(matches!(
            conn.error(),
            Some(ConnectionError::InvalidAddress { .. })
        ));
    }

    #[tokio::test]
    async fn native_non_upgrade_response_is_handshake_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 400 Bad Request\r\nconnection: close\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
        }));

        let conn = connect(&format!("ws://{addr}/"), ClientCarrier::Native, "ipc").await;
        assert!(matches!(conn.error(), Some(ConnectionError::Handshake(_))));
    }

    #[tokio::test]
    async fn empty_hub_never_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("ws://{}/", listener.local_addr().unwrap());
        let client = IpcClient::new(Hub::new(), &settings(Some(address), ClientCarrier::Native));

        let ran = tokio::time::timeout(Duration::from_secs(1), client.sync())
            .await
            .unwrap();
        assert!(ran);
        let accepted = tokio::time::timeout(Duration::from_millis(50), listener.accept()).await;
        assert!(accepted.is_err());
    }

    #[tokio::test]
    async fn no_address_ends_loop() {
        let hub = Hub::new();
        let _ = hub.set(FactKey::new(), FactValue::new(json!({"project": "x"})));
        let client = IpcClient::new(hub, &settings(None, ClientCarrier::Websocket));
        assert!(client.sync().await);
        assert!(!client.is_syncing());
    }

    #[tokio::test]
    async fn concurrent_sync_collapses_and_shutdown_stops() {
        let hub = Hub::new();
        let _ = hub.set(FactKey::new(), FactValue::new(json!({"project": "x"})));
        let client = IpcClient::new(
            hub,
            &settings(Some(refused_address().await), ClientCarrier::Native),
        );

        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.sync().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(client.is_syncing());
        assert!(!client.sync().await);

        client.shutdown();
        let ran = tokio::time::timeout(Duration::from_secs(2), first)
            .await
            .unwrap()
            .unwrap();
        assert!(ran);
        assert!(!client.is_syncing());
        assert!(!client.sync().await);
    }
}
