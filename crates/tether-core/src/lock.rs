//! Fact-based distributed lock.
//!
//! Requesters publish `{"lockReq": ticket}` under a fresh key and wait for a
//! `{"lockAck": ticket}` fact from anywhere in the hub. One process, the hub
//! host, runs a [`LockArbiter`] that watches every fact and grants the lock to
//! one queued request at a time. Because requests and grants are ordinary
//! facts, they travel across peer bridges like everything else, and a crashed
//! requester's request disappears together with its bridge.
//!
//! Fairness is best-effort: requests are granted in the order the arbiter
//! first observed them, which is not necessarily the order they were made.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::hub::{Hub, Subscription};
use crate::ids::FactKey;
use crate::value::FactValue;

/// Field carrying a pending request ticket.
pub const LOCK_REQUEST_FIELD: &str = "lockReq";
/// Field carrying the currently granted ticket.
pub const LOCK_ACK_FIELD: &str = "lockAck";

/// Generate a globally unique request ticket.
///
/// SHA-256 over the wall clock in nanoseconds, the pid, a per-process random
/// tag and a per-process counter.
#[must_use]
pub fn new_ticket() -> String {
    static PROCESS_TAG: OnceLock<String> = OnceLock::new();
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let tag = PROCESS_TAG.get_or_init(|| format!("{}:{}", std::process::id(), Uuid::now_v7()));
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut hasher = Sha256::new();
    hasher.update(nanos.to_le_bytes());
    hasher.update(tag.as_bytes());
    hasher.update(count.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

/// A granted lock. Pass it to [`lock_leave`] to release.
#[derive(Clone, PartialEq, Eq)]
pub struct LockTicket {
    ticket: String,
    key: FactKey,
}

impl LockTicket {
    /// Ticket string as published on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.ticket
    }

    /// Key the request fact lives under.
    #[must_use]
    pub fn key(&self) -> FactKey {
        self.key
    }
}

impl fmt::Debug for LockTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockTicket")
            .field("ticket", &&self.ticket[..12.min(self.ticket.len())])
            .field("key", &self.key)
            .finish()
    }
}

/// A published lock request that has not been granted yet.
///
/// Dropping it before [`LockRequest::acquired`] resolves withdraws the
/// request.
pub struct LockRequest {
    hub: Hub,
    key: FactKey,
    ticket: String,
    acks: Subscription,
    armed: bool,
}

impl LockRequest {
    /// Wait until the arbiter grants this request.
    ///
    /// Returns `None`, withdrawing the request, if the hub deregisters the
    /// request's subscription before a grant arrives.
    pub async fn acquired(mut self) -> Option<LockTicket> {
        loop {
            let event = self.acks.recv().await?;
            if ack_ticket(event.value.as_ref()) == Some(self.ticket.as_str()) {
                break;
            }
        }
        self.armed = false;
        debug!(key = %self.key, "lock acquired");
        Some(LockTicket {
            ticket: std::mem::take(&mut self.ticket),
            key: self.key,
        })
    }
}

impl Drop for LockRequest {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.hub.set(self.key, None);
            debug!(key = %self.key, "lock request withdrawn");
        }
    }
}

impl fmt::Debug for LockRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRequest")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Publish a lock request now. The request fact is in the hub when this
/// returns.
#[must_use]
pub fn request_lock(hub: &Hub) -> LockRequest {
    let ticket = new_ticket();
    let key = FactKey::new();
    let acks = hub.subscribe();
    let _ = hub.set(key, FactValue::new(json!({ LOCK_REQUEST_FIELD: ticket })));
    debug!(key = %key, "lock requested");
    LockRequest {
        hub: hub.clone(),
        key,
        ticket,
        acks,
        armed: true,
    }
}

/// Request the lock and wait until this process holds it.
///
/// Dropping the returned future before it resolves withdraws the request.
/// `None` means the wait ended without a grant; see [`LockRequest::acquired`].
pub async fn lock_enter(hub: &Hub) -> Option<LockTicket> {
    request_lock(hub).acquired().await
}

/// Release a held lock by retracting its request fact.
pub fn lock_leave(hub: &Hub, ticket: &LockTicket) {
    let _ = hub.set(ticket.key, None);
    debug!(key = %ticket.key, "lock released");
}

fn field<'a>(value: Option<&'a FactValue>, name: &str) -> Option<&'a str> {
    value.and_then(|v| v.get(name)).and_then(Value::as_str)
}

fn ack_ticket(value: Option<&FactValue>) -> Option<&str> {
    field(value, LOCK_ACK_FIELD)
}

// ─────────────────────────────────────────────────────────────────────────────
// Arbitration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Grant(String),
    Release,
    Keep,
}

/// Arbiter bookkeeping: who holds the lock and who is waiting.
#[derive(Debug, Default)]
struct Arbitration {
    held: HashSet<FactKey>,
    queue: VecDeque<(FactKey, String)>,
    granted: Option<String>,
}

impl Arbitration {
    fn observe(&mut self, key: FactKey, value: Option<&FactValue>) -> Verdict {
        match field(value, LOCK_REQUEST_FIELD) {
            Some(ticket) if self.granted.as_deref() == Some(ticket) => {
                let _ = self.held.insert(key);
                self.queue.retain(|(k, _)| *k != key);
            }
            Some(ticket) => {
                let _ = self.held.remove(&key);
                match self.queue.iter_mut().find(|(k, _)| *k == key) {
                    Some(entry) => ticket.clone_into(&mut entry.1),
                    None => self.queue.push_back((key, ticket.to_owned())),
                }
            }
            None => {
                if self.held.remove(&key) {
                    debug!(key = %key, "lock holder left");
                }
                self.queue.retain(|(k, _)| *k != key);
            }
        }

        if !self.held.is_empty() {
            return Verdict::Keep;
        }
        match self.queue.pop_front() {
            Some((key, ticket)) => {
                let _ = self.held.insert(key);
                self.granted = Some(ticket.clone());
                Verdict::Grant(ticket)
            }
            None if self.granted.take().is_some() => Verdict::Release,
            None => Verdict::Keep,
        }
    }
}

/// Background task granting the lock on one hub.
///
/// Run exactly one per hub namespace, on the hub host. Dropping the arbiter
/// stops it and retracts its grant.
pub struct LockArbiter {
    hub: Hub,
    ack_key: FactKey,
    task: JoinHandle<()>,
}

impl LockArbiter {
    /// Start arbitrating on `hub`.
    #[must_use]
    pub fn spawn(hub: &Hub) -> Self {
        let ack_key = FactKey::new();
        let mut events = hub.subscribe();
        let task_hub = hub.clone();
        let task = tokio::spawn(async move {
            let mut arbitration = Arbitration::default();
            while let Some(event) = events.recv().await {
                if event.key == ack_key {
                    continue;
                }
                match arbitration.observe(event.key, event.value.as_ref()) {
                    Verdict::Grant(ticket) => {
                        debug!(queued = arbitration.queue.len(), "lock granted");
                        let _ = task_hub
                            .set(ack_key, FactValue::new(json!({ LOCK_ACK_FIELD: ticket })));
                    }
                    Verdict::Release => {
                        let _ = task_hub.set(ack_key, None);
                    }
                    Verdict::Keep => {}
                }
            }
        });
        debug!(ack_key = %ack_key, "lock arbiter started");
        Self { hub: hub.clone(), ack_key, task }
    }

    /// Stop arbitrating and retract the current grant.
    pub fn stop(&self) {
        self.task.abort();
        let _ = self.hub.set(self.ack_key, None);
    }
}

impl Drop for LockArbiter {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for LockArbiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockArbiter")
            .field("ack_key", &self.ack_key)
            .finish_non_exhaustive()
    }
}
