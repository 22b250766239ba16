//! # tether-server
//!
//! Transport side of the tether IPC layer.
//!
//! - [`connection`]: one send/receive/close contract over a raw upgraded
//!   stream, a server-side WebSocket, a client-side WebSocket, or a failed stub
//! - [`keepalive`]: ping/pong liveness on top of a connection
//! - [`bridge`]: mirrors a [`Hub`](tether_core::Hub) across one connection
//! - [`server`]: one HTTP port accepting both upgrade kinds plus a diagnostic
//!   snapshot endpoint
//! - [`client`]: `connect()` and the [`IpcClient`](client::IpcClient) retry loop
//! - [`context`]: [`IpcContext`](context::IpcContext), the per-process owner of
//!   all of the above

#![deny(unsafe_code)]

pub mod bridge;
pub mod client;
pub mod connection;
pub mod context;
pub mod errors;
pub mod keepalive;
pub mod registry;
pub mod server;
pub mod shutdown;

pub use bridge::{FactFilter, bridge};
pub use client::{IpcClient, connect};
pub use connection::{Connection, ConnectionKind, ConnectionState, MessageStream};
pub use context::IpcContext;
pub use errors::IpcError;
pub use keepalive::{KeepaliveResult, keep_alive};
pub use server::{IpcServer, ServerHandle};
