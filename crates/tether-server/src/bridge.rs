//! Mirrors a hub across one connection.
//!
//! Outbound, every local fact gets a small integer id for this connection
//! (fresh on first sight, starting at 1) and goes out as a message frame
//! `[id, value]`; a retraction goes out as `[id, false]`. Inbound, each remote
//! id maps to a synthetic key tagged with this bridge, so the bridge never
//! echoes a peer's facts back to it and can retract all of them when the
//! connection closes.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tether_core::codec::{Frame, FrameKind};
use tether_core::{BridgeId, FactEvent, FactKey, FactValue, Hub};
use tracing::{debug, trace};

use crate::connection::Connection;

/// Per-peer outbound filter. Returning `None` withholds the fact.
pub type FactFilter = Arc<dyn Fn(&FactValue) -> Option<FactValue> + Send + Sync>;

/// Forward only JSON objects that carry at least one of `fields`.
///
/// An empty field list means no filter.
pub fn field_filter(fields: Vec<String>) -> Option<FactFilter> {
    if fields.is_empty() {
        return None;
    }
    Some(Arc::new(move |value: &FactValue| {
        let object = value.as_object()?;
        fields
            .iter()
            .any(|field| object.contains_key(field))
            .then(|| value.clone())
    }))
}

/// Build a [`field_filter`] from a URL query: `project&hmr` keeps facts with a
/// `project` or `hmr` field. Values after `=` are ignored.
pub fn query_filter(query: Option<&str>) -> Option<FactFilter> {
    let fields = query
        .unwrap_or_default()
        .split('&')
        .filter_map(|pair| pair.split('=').next())
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect();
    field_filter(fields)
}

/// Mirror `hub` across `conn` until the connection closes.
///
/// On return every fact this bridge received from the peer has been
/// retracted from `hub`.
pub async fn bridge(hub: &Hub, conn: &Connection, filter: Option<FactFilter>) {
    PeerBridge::new(hub, conn, filter).run().await;
}

struct PeerBridge {
    id: BridgeId,
    hub: Hub,
    conn: Connection,
    filter: Option<FactFilter>,
    /// Peer's ids to the synthetic keys standing in for them.
    remote: HashMap<u64, FactKey>,
    /// Local keys to the ids the peer knows them by.
    local: HashMap<FactKey, u64>,
    last_local: u64,
}

impl PeerBridge {
    fn new(hub: &Hub, conn: &Connection, filter: Option<FactFilter>) -> Self {
        Self {
            id: BridgeId::new(),
            hub: hub.clone(),
            conn: conn.clone(),
            filter,
            remote: HashMap::new(),
            local: HashMap::new(),
            last_local: 0,
        }
    }

    async fn run(mut self) {
        let mut inbound = self.conn.subscribe();
        let mut events = self.hub.subscribe();
        debug!(bridge = %self.id, conn = %self.conn.id(), "bridge attached");

        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(frame) => self.apply(frame),
                    None => break,
                },
                event = events.recv() => match event {
                    Some(event) => self.publish(event),
                    None => break,
                },
            }
        }

        drop(events);
        let id = self.id;
        let retracted = self.hub.clear(|key, _| key.is_from(id));
        debug!(bridge = %id, conn = %self.conn.id(), retracted, "bridge detached");
    }

    fn apply(&mut self, frame: Frame) {
        if frame.kind != FrameKind::Message {
            return;
        }
        let Value::Array(items) = frame.body else {
            trace!(bridge = %self.id, "ignoring non-array message");
            return;
        };
        let Ok([id, value]) = <[Value; 2]>::try_from(items) else {
            trace!(bridge = %self.id, "ignoring malformed message");
            return;
        };
        let Some(id) = id.as_u64() else {
            trace!(bridge = %self.id, "ignoring message without integer id");
            return;
        };
        let value = FactValue::new(value);
        if !value.is_truthy() {
            if let Some(key) = self.remote.remove(&id) {
                let _ = self.hub.set(key, None);
            }
            return;
        }
        let origin = self.id;
        let key = *self
            .remote
            .entry(id)
            .or_insert_with(|| FactKey::synthetic(origin));
        let _ = self.hub.set(key, value);
    }

    fn publish(&mut self, event: FactEvent) {
        if event.key.is_from(self.id) {
            return;
        }
        let value = match (&self.filter, event.value) {
            (Some(filter), Some(value)) => filter(&value),
            (_, value) => value,
        };

        match value.filter(FactValue::is_truthy) {
            Some(value) => {
                let last = &mut self.last_local;
                let id = *self.local.entry(event.key).or_insert_with(|| {
                    *last += 1;
                    *last
                });
                let _ = self
                    .conn
                    .send(FrameKind::Message, json!([id, value.as_value()]));
            }
            None => {
                if let Some(id) = self.local.remove(&event.key) {
                    let _ = self.conn.send(FrameKind::Message, json!([id, false]));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::pair;
    use std::time::Duration;

    async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(tokio::time::Instant::now() < deadline, "timed out: {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn values(hub: &Hub) -> Vec<Value> {
        hub.snapshot()
            .as_object()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    fn spawn_bridge(hub: &Hub, conn: &Connection, filter: Option<FactFilter>) -> tokio::task::JoinHandle<()> {
        let hub = hub.clone();
        let conn = conn.clone();
        tokio::spawn(async move { bridge(&hub, &conn, filter).await })
    }

    #[test]
    fn query_filter_parses_names() {
        let filter = query_filter(Some("project&hmr=1")).unwrap();
        assert!(filter(&FactValue::new(json!({"project": "a"}))).is_some());
        assert!(filter(&FactValue::new(json!({"hmr": 2}))).is_some());
        assert!(filter(&FactValue::new(json!({"lockReq": "t"}))).is_none());
        assert!(filter(&FactValue::new(json!("project"))).is_none());
    }

    #[test]
    fn empty_query_is_no_filter() {
        assert!(query_filter(None).is_none());
        assert!(query_filter(Some("")).is_none());
        assert!(query_filter(Some("&&")).is_none());
    }

    #[tokio::test]
    async fn facts_mirror_both_ways() {
        let (a, b) = pair();
        let hub_a = Hub::new();
        let hub_b = Hub::new();
        let _ = hub_a.set(FactKey::new(), FactValue::new(json!({"project": "a"})));
        let _ta = spawn_bridge(&hub_a, &a, None);
        let _tb = spawn_bridge(&hub_b, &b, None);

        eventually("a reaches b", || hub_b.len() == 1).await;
        assert_eq!(values(&hub_b), vec![json!({"project": "a"})]);

        let _ = hub_b.set(FactKey::new(), FactValue::new(json!({"project": "b"})));
        eventually("b reaches a", || hub_a.len() == 2).await;
        // no echo of a's own fact back into a, no echo of b's into b
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hub_a.len(), 2);
        assert_eq!(hub_b.len(), 2);
    }

    #[tokio::test]
    async fn retraction_propagates() {
        let (a, b) = pair();
        let hub_a = Hub::new();
        let hub_b = Hub::new();
        let key = FactKey::new();
        let _ = hub_a.set(key, FactValue::new(json!({"project": "a"})));
        let _ta = spawn_bridge(&hub_a, &a, None);
        let _tb = spawn_bridge(&hub_b, &b, None);
        eventually("a reaches b", || hub_b.len() == 1).await;

        let _ = hub_a.set(key, None);
        eventually("retraction reaches b", || hub_b.is_empty()).await;
    }

    #[tokio::test]
    async fn close_retracts_peer_facts() {
        let (a, b) = pair();
        let hub_a = Hub::new();
        let hub_b = Hub::new();
        let _ = hub_a.set(FactKey::new(), FactValue::new(json!({"project": "a"})));
        let _ta = spawn_bridge(&hub_a, &a, None);
        let tb = spawn_bridge(&hub_b, &b, None);
        eventually("a reaches b", || hub_b.len() == 1).await;

        let _ = a.close(None);
        tokio::time::timeout(Duration::from_secs(5), tb)
            .await
            .unwrap()
            .unwrap();
        assert!(hub_b.is_empty());
        assert_eq!(hub_a.len(), 1);
        assert_eq!(hub_b.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn filter_withholds_and_retracts() {
        let (a, b) = pair();
        let hub_a = Hub::new();
        let hub_b = Hub::new();
        let key = FactKey::new();
        let _ = hub_a.set(key, FactValue::new(json!({"project": "a"})));
        let _ = hub_a.set(FactKey::new(), FactValue::new(json!({"lockReq": "t"})));
        let _ta = spawn_bridge(&hub_a, &a, query_filter(Some("project")));
        let _tb = spawn_bridge(&hub_b, &b, None);

        eventually("project reaches b", || hub_b.len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(values(&hub_b), vec![json!({"project": "a"})]);

        // same key now fails the filter: the peer sees a retraction
        let _ = hub_a.set(key, FactValue::new(json!({"other": 1})));
        eventually("filtered value retracted", || hub_b.is_empty()).await;
    }

    #[tokio::test]
    async fn facts_travel_transitively() {
        let (a1, b1) = pair();
        let (b2, c2) = pair();
        let hub_a = Hub::new();
        let hub_b = Hub::new();
        let hub_c = Hub::new();
        let _t1 = spawn_bridge(&hub_a, &a1, None);
        let _t2 = spawn_bridge(&hub_b, &b1, None);
        let _t3 = spawn_bridge(&hub_b, &b2, None);
        let _t4 = spawn_bridge(&hub_c, &c2, None);

        let _ = hub_a.set(FactKey::new(), FactValue::new(json!({"project": "far"})));
        eventually("a reaches c through b", || hub_c.len() == 1).await;
        assert_eq!(values(&hub_c), vec![json!({"project": "far"})]);
    }

    #[tokio::test]
    async fn remote_ids_are_forgotten_on_retraction() {
        let (a, _b) = pair();
        let hub = Hub::new();
        let mut peer = PeerBridge::new(&hub, &a, None);
        let message = |body| Frame::new(FrameKind::Message, body);

        peer.apply(message(json!([4, false])));
        assert!(peer.remote.is_empty());
        assert!(hub.is_empty());

        peer.apply(message(json!([4, {"project": "x"}])));
        assert_eq!(peer.remote.len(), 1);
        assert_eq!(hub.len(), 1);

        peer.apply(message(json!([4, 0])));
        assert!(peer.remote.is_empty());
        assert!(hub.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn early_frames_reach_bridge_behind_keepalive() {
        let (a, b) = pair();
        let hub_b = Hub::new();
        assert!(a.send(FrameKind::Message, json!([1, {"project": "early"}])));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let keepalive = {
            let b = b.clone();
            tokio::spawn(async move { crate::keepalive::keep_alive(&b, Duration::from_secs(60)).await })
        };
        tokio::task::yield_now().await;
        let _tb = spawn_bridge(&hub_b, &b, None);

        eventually("early frame applied", || hub_b.len() == 1).await;
        assert_eq!(values(&hub_b), vec![json!({"project": "early"})]);
        keepalive.abort();
    }

    #[tokio::test]
    async fn malformed_messages_are_ignored() {
        let (a, b) = pair();
        let hub_b = Hub::new();
        let _tb = spawn_bridge(&hub_b, &b, None);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(a.send(FrameKind::Message, json!({"not": "an array"})));
        assert!(a.send(FrameKind::Message, json!(["x", 1])));
        assert!(a.send(FrameKind::Message, json!([1])));
        assert!(a.send(FrameKind::Message, json!([7, {"project": "ok"}])));
        eventually("valid message applied", || hub_b.len() == 1).await;
        assert!(b.is_open());
    }
}
