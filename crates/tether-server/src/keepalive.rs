//! Ping/pong liveness for a connection.

use std::time::Duration;

use serde_json::Value;
use tether_core::ConnectionError;
use tether_core::codec::{Frame, FrameKind};
use tokio::time::{self, MissedTickBehavior};
use tracing::warn;
use uuid::Uuid;

use crate::connection::Connection;

/// Default interval between pings.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// Why the keepalive loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepaliveResult {
    /// The peer missed a pong; the connection was closed.
    TimedOut,
    /// The connection closed for some other reason.
    Closed,
}

/// Ping the peer every `interval` until the connection closes.
///
/// Each ping carries a fresh nonce. If the pong for the previous ping has not
/// arrived by the next tick, the connection is closed with
/// [`ConnectionError::KeepaliveTimeout`].
///
/// Pongs are observed through [`Connection::watch`], so buffered inbound
/// frames stay with whichever handler consumes them; some consuming handler
/// must be subscribed for pongs to be parsed.
pub async fn keep_alive(conn: &Connection, interval: Duration) -> KeepaliveResult {
    let mut replies = conn.watch();
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately
    let _ = ticker.tick().await;

    let mut outstanding: Option<String> = None;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if outstanding.is_some() {
                    warn!(conn = %conn.id(), kind = %conn.kind(), "keepalive timed out");
                    let _ = conn.close(Some(ConnectionError::KeepaliveTimeout));
                    return KeepaliveResult::TimedOut;
                }
                let nonce = Uuid::now_v7().to_string();
                if !conn.send(FrameKind::Ping, Value::String(nonce.clone())) {
                    return KeepaliveResult::Closed;
                }
                outstanding = Some(nonce);
            }
            frame = replies.recv() => match frame {
                Some(Frame { kind: FrameKind::Pong, body }) => {
                    if outstanding.is_some() && body.as_str() == outstanding.as_deref() {
                        outstanding = None;
                    }
                }
                Some(_) => {}
                None => return KeepaliveResult::Closed,
            }
        }
    }
}
