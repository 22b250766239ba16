//! Hub listener.
//!
//! One HTTP port serves three things:
//!
//! - `GET /` returns the hub snapshot as JSON, for diagnostics
//! - `Upgrade: websocket` becomes a [`ConnectionKind::WebServer`] connection
//! - `Upgrade: <protocol token>` becomes a [`ConnectionKind::Native`]
//!   connection over the raw upgraded stream
//!
//! Any other upgrade is answered `400` with `Connection: close`. Every
//! accepted connection is registered, kept alive and bridged into the hub
//! until it closes.
//!
//! [`ConnectionKind::WebServer`]: crate::connection::ConnectionKind::WebServer
//! [`ConnectionKind::Native`]: crate::connection::ConnectionKind::Native

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE, UPGRADE};
use axum::http::{HeaderValue, Method, StatusCode, Version};
use axum::response::{IntoResponse, Response};
use hyper_util::rt::TokioIo;
use tether_core::Hub;
use tether_settings::IpcSettings;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, info, warn};

use crate::bridge::{self, FactFilter, bridge};
use crate::connection::Connection;
use crate::errors::{IpcError, Result};
use crate::keepalive::keep_alive;
use crate::registry::ConnectionRegistry;
use crate::shutdown::ShutdownCoordinator;

/// Upgrade token selecting the WebSocket carrier.
const WEBSOCKET_TOKEN: &str = "websocket";

/// Shared state for the accept handler.
#[derive(Clone)]
struct AcceptState {
    hub: Hub,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    protocol: Arc<str>,
    keepalive: Duration,
}

impl AcceptState {
    /// Register, keep alive and bridge an accepted connection until it closes.
    fn attach(&self, conn: Connection, filter: Option<FactFilter>) {
        info!(conn = %conn.id(), kind = %conn.kind(), "peer connected");
        let state = self.clone();
        self.shutdown.spawn(async move {
            state.registry.add(conn.clone()).await;
            if state.shutdown.is_shutting_down() {
                let _ = conn.close(None);
            }
            let ((), liveness) = tokio::join!(
                bridge(&state.hub, &conn, filter),
                keep_alive(&conn, state.keepalive),
            );
            let _ = state.registry.remove(conn.id()).await;
            match conn.error() {
                Some(err) => info!(conn = %conn.id(), ?liveness, error = %err, "peer disconnected"),
                None => info!(conn = %conn.id(), ?liveness, "peer disconnected"),
            }
        });
    }
}

/// Accepts peers for one hub.
pub struct IpcServer {
    settings: IpcSettings,
    state: AcceptState,
}

impl IpcServer {
    /// Create a server for `hub`. Tasks it spawns are tracked by `shutdown`.
    pub fn new(hub: Hub, settings: IpcSettings, shutdown: Arc<ShutdownCoordinator>) -> Self {
        let state = AcceptState {
            hub,
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown,
            protocol: Arc::from(settings.protocol.as_str()),
            keepalive: settings.keepalive(),
        };
        Self { settings, state }
    }

    /// The hub being served.
    pub fn hub(&self) -> &Hub {
        &self.state.hub
    }

    /// Accepted connections still open.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.state.registry
    }

    /// Build the HTTP router.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(AllowOrigin::mirror_request())
            .allow_methods([Method::GET]);

        Router::new()
            .fallback(handle_request)
            .with_state(self.state.clone())
            .layer(cors)
    }

    /// Bind and start serving.
    ///
    /// If the configured port is taken, an ephemeral port is used instead.
    /// A host of `*` binds every interface and advertises the machine
    /// hostname. The listener stops, and every accepted connection closes,
    /// when the shutdown token is cancelled.
    pub async fn listen(&self) -> Result<ServerHandle> {
        let (bind_host, advertised) = resolve_host(&self.settings.host)?;
        let listener = bind(&bind_host, self.settings.port).await?;
        let local_addr = listener.local_addr()?;
        let address = format!("ws://{advertised}:{}/", local_addr.port());
        info!(address, protocol = %self.state.protocol, "hub listening");

        let app = self.router();
        let token = self.state.shutdown.token();
        let serve_token = token.clone();
        self.state.shutdown.spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(serve_token.cancelled_owned());
            if let Err(err) = serve.await {
                warn!(error = %err, "hub listener stopped");
            }
        });

        let registry = Arc::clone(&self.state.registry);
        self.state.shutdown.spawn(async move {
            token.cancelled().await;
            let _ = registry.close_all().await;
        });

        Ok(ServerHandle {
            address,
            local_addr,
        })
    }
}

/// A running listener.
#[derive(Clone, Debug)]
pub struct ServerHandle {
    address: String,
    local_addr: SocketAddr,
}

impl ServerHandle {
    /// Address peers attach to, `ws://host:port/`.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Socket address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Port actually bound.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }
}

fn resolve_host(host: &str) -> Result<(String, String)> {
    if host == "*" {
        let name = hostname::get().map_err(IpcError::Hostname)?;
        Ok(("0.0.0.0".to_owned(), name.to_string_lossy().into_owned()))
    } else {
        Ok((host.to_owned(), host.to_owned()))
    }
}

async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    match TcpListener::bind((host, port)).await {
        Ok(listener) => Ok(listener),
        Err(err) if port != 0 => {
            warn!(host, port, error = %err, "port unavailable, falling back to an ephemeral port");
            TcpListener::bind((host, 0))
                .await
                .map_err(|source| IpcError::Bind {
                    addr: format!("{host}:0"),
                    source,
                })
        }
        Err(source) => Err(IpcError::Bind {
            addr: format!("{host}:{port}"),
            source,
        }),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_request(State(state): State<AcceptState>, req: Request) -> Response {
    let Some(token) = req
        .headers()
        .get(UPGRADE)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).trim().to_owned())
    else {
        return serve_snapshot(&state, &req);
    };

    if req.version() != Version::HTTP_11 {
        debug!(version = ?req.version(), "upgrade over unsupported http version");
        return reject_upgrade();
    }
    if token.eq_ignore_ascii_case(WEBSOCKET_TOKEN) {
        accept_websocket(state, req).await
    } else if token == *state.protocol {
        accept_native(state, req)
    } else {
        debug!(upgrade = %token, "unknown upgrade");
        reject_upgrade()
    }
}

fn serve_snapshot(state: &AcceptState, req: &Request) -> Response {
    if req.method() != Method::GET || req.uri().path() != "/" {
        return StatusCode::NOT_FOUND.into_response();
    }
    let body = state.hub.snapshot().to_string();
    (
        [
            (CONTENT_TYPE, "application/json; charset=utf-8"),
            (CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

fn reject_upgrade() -> Response {
    (StatusCode::BAD_REQUEST, [(CONNECTION, "close")]).into_response()
}

async fn accept_websocket(state: AcceptState, req: Request) -> Response {
    let filter = bridge::query_filter(req.uri().query());
    let (mut parts, _body) = req.into_parts();
    match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(upgrade) => upgrade.on_upgrade(move |socket| async move {
            state.attach(Connection::web_server(socket), filter);
        }),
        Err(rejection) => {
            debug!(error = %rejection, "websocket upgrade rejected");
            reject_upgrade()
        }
    }
}

fn accept_native(state: AcceptState, mut req: Request) -> Response {
    let filter = bridge::query_filter(req.uri().query());
    let connection = req
        .headers()
        .get(CONNECTION)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("upgrade"));
    let upgrade = req.headers().get(UPGRADE).cloned();
    let on_upgrade = hyper::upgrade::on(&mut req);
    let protocol = state.protocol.to_string();

    let shutdown = Arc::clone(&state.shutdown);
    shutdown.spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let conn = Connection::native(TokioIo::new(upgraded), Some(protocol));
                state.attach(conn, filter);
            }
            Err(err) => debug!(error = %err, "native upgrade failed"),
        }
    });

    let mut response = StatusCode::SWITCHING_PROTOCOLS.into_response();
    let headers = response.headers_mut();
    let _ = headers.insert(CONNECTION, connection);
    if let Some(upgrade) = upgrade {
        let _ = headers.insert(UPGRADE, upgrade);
    }
    response
}
