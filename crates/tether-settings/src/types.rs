//! Settings types.
//!
//! All structs deserialize from camelCase JSON and fill missing fields from
//! their `Default` impls.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Hub host and wire settings.
    pub ipc: IpcSettings,
    /// Attach-mode client settings.
    pub client: ClientSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl TetherSettings {
    /// Reject combinations the layer cannot run with.
    pub fn validate(&self) -> Result<()> {
        let token = self.ipc.protocol.trim();
        if token.is_empty() {
            return Err(SettingsError::InvalidValue("empty protocol token".into()));
        }
        if token.eq_ignore_ascii_case("websocket") {
            return Err(SettingsError::InvalidValue(
                "protocol token must differ from 'websocket'".into(),
            ));
        }
        if self.ipc.keepalive_ms == 0 {
            return Err(SettingsError::InvalidValue("keepaliveMs must be positive".into()));
        }
        Ok(())
    }
}

/// Hub host and wire settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IpcSettings {
    /// Whether IPC runs at all (watch mode).
    pub watch: bool,
    /// Bind host. `*` binds every interface and advertises the hostname.
    pub host: String,
    /// Preferred port. Falls back to an ephemeral port if busy.
    pub port: u16,
    /// Upgrade token for the native carrier.
    pub protocol: String,
    /// Keepalive ping interval in milliseconds.
    pub keepalive_ms: u64,
    /// Existing hub to attach to instead of hosting one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attach_address: Option<String>,
}

impl IpcSettings {
    /// Keepalive interval as a [`Duration`].
    #[must_use]
    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }
}

impl Default for IpcSettings {
    fn default() -> Self {
        Self {
            watch: false,
            host: "localhost".to_string(),
            port: 7180,
            protocol: "ipc".to_string(),
            keepalive_ms: 25_000,
            attach_address: None,
        }
    }
}

/// Which transport an attaching client dials with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientCarrier {
    /// WebSocket client.
    #[default]
    Websocket,
    /// HTTP/1.1 upgrade to a raw stream.
    Native,
}

impl ClientCarrier {
    /// Parse a carrier name (case-insensitive).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Some(Self::Websocket),
            "native" => Some(Self::Native),
            _ => None,
        }
    }
}

/// Attach-mode client settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// Delay before reconnecting after a connection closes, in milliseconds.
    pub retry_after_ms: u64,
    /// Transport used to reach the hub.
    pub carrier: ClientCarrier,
}

impl ClientSettings {
    /// Retry delay as a [`Duration`].
    #[must_use]
    pub fn retry_after(&self) -> Duration {
        Duration::from_millis(self.retry_after_ms)
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            retry_after_ms: 1_500,
            carrier: ClientCarrier::default(),
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default `tracing` filter directive.
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}
