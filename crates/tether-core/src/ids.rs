//! Generated handle newtypes.
//!
//! Identity in the hub never relies on names or object addresses. Every
//! publisher slot, subscriber, frame handler, bridge and connection gets a
//! process-unique numeric handle drawn from its own counter, so a stale handle
//! can never alias a live one.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! handle_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Allocate a fresh handle. Never returns the same value twice.
            #[must_use]
            pub fn new() -> Self {
                static NEXT: AtomicU64 = AtomicU64::new(1);
                Self(NEXT.fetch_add(1, Ordering::Relaxed))
            }

            /// Raw numeric value.
            #[must_use]
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

handle_id! {
    /// Registration handle for a hub subscriber.
    SubscriberId, "sub"
}

handle_id! {
    /// Registration handle for a connection frame handler.
    HandlerId, "handler"
}

handle_id! {
    /// Identity of one peer bridge. Tags the synthetic keys it publishes.
    BridgeId, "bridge"
}

handle_id! {
    /// Identity of one connection, used for logging and the server registry.
    ConnectionId, "conn"
}

// ─────────────────────────────────────────────────────────────────────────────
// FactKey
// ─────────────────────────────────────────────────────────────────────────────

static NEXT_FACT: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of one fact slot in a [`Hub`](crate::Hub).
///
/// Local publishers create keys with [`FactKey::new`]. Peer bridges mint
/// synthetic keys with [`FactKey::synthetic`], which remember the bridge that
/// owns them so the bridge can skip its own echoes and retract everything it
/// published when the peer goes away.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FactKey {
    id: u64,
    origin: Option<BridgeId>,
}

impl FactKey {
    /// A fresh local key.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: NEXT_FACT.fetch_add(1, Ordering::Relaxed),
            origin: None,
        }
    }

    /// A fresh key owned by the given bridge.
    #[must_use]
    pub fn synthetic(origin: BridgeId) -> Self {
        Self {
            id: NEXT_FACT.fetch_add(1, Ordering::Relaxed),
            origin: Some(origin),
        }
    }

    /// The bridge that minted this key, if any.
    #[must_use]
    pub fn origin(&self) -> Option<BridgeId> {
        self.origin
    }

    /// Whether this key was minted by `bridge`.
    #[must_use]
    pub fn is_from(&self, bridge: BridgeId) -> bool {
        self.origin == Some(bridge)
    }
}

impl Default for FactKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin {
            Some(origin) => write!(f, "{origin}/fact-{}", self.id),
            None => write!(f, "fact-{}", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_unique() {
        let a = SubscriberId::new();
        let b = SubscriberId::new();
        assert_ne!(a, b);
        assert!(b.get() > a.get());
    }

    #[test]
    fn handle_display_has_prefix() {
        let id = ConnectionId::new();
        assert_eq!(id.to_string(), format!("conn-{}", id.get()));
    }

    #[test]
    fn fact_keys_are_unique() {
        assert_ne!(FactKey::new(), FactKey::new());
    }

    #[test]
    fn synthetic_key_remembers_origin() {
        let bridge = BridgeId::new();
        let key = FactKey::synthetic(bridge);
        assert!(key.is_from(bridge));
        assert!(!key.is_from(BridgeId::new()));
        assert_eq!(key.origin(), Some(bridge));
        assert!(FactKey::new().origin().is_none());
    }

    #[test]
    fn synthetic_display_includes_bridge() {
        let bridge = BridgeId::new();
        let key = FactKey::synthetic(bridge);
        assert!(key.to_string().starts_with(&format!("{bridge}/fact-")));
        assert!(FactKey::new().to_string().starts_with("fact-"));
    }
}
