//! Project readiness facts.
//!
//! A finished project announces itself with `{"project": name}`. Other
//! processes wait on those announcements before starting dependent work.

use std::collections::HashSet;

use serde_json::{Value, json};
use tracing::debug;

use crate::hub::{Hub, Subscription};
use crate::ids::FactKey;
use crate::value::FactValue;

/// Field naming a ready project.
pub const PROJECT_FIELD: &str = "project";

/// Publish that `name` is ready, under `key`.
pub fn register_project(hub: &Hub, key: FactKey, name: &str) -> bool {
    hub.set(key, FactValue::new(json!({ PROJECT_FIELD: name })))
}

/// Pending wait on a set of project names.
///
/// Created by [`watch_projects`], which subscribes before returning, so no
/// announcement made afterwards can be missed.
#[derive(Debug)]
pub struct ProjectWait {
    pending: HashSet<String>,
    events: Option<Subscription>,
}

impl ProjectWait {
    /// Names not announced yet, as of the last event observed.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Resolve once every name has been announced.
    pub async fn ready(mut self) {
        let Some(mut events) = self.events.take() else {
            return;
        };
        while let Some(event) = events.recv().await {
            let name = event
                .value
                .as_ref()
                .and_then(|v| v.get(PROJECT_FIELD))
                .and_then(Value::as_str);
            if let Some(name) = name {
                if self.pending.remove(name) {
                    debug!(project = name, remaining = self.pending.len(), "project ready");
                    if self.pending.is_empty() {
                        return;
                    }
                }
            }
        }
    }
}

/// Start watching for `names`. Names match the `project` field exactly.
///
/// An empty list subscribes to nothing and is ready at once.
pub fn watch_projects<I, S>(hub: &Hub, names: I) -> ProjectWait
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let pending: HashSet<String> = names.into_iter().map(Into::into).collect();
    let events = (!pending.is_empty()).then(|| hub.subscribe());
    ProjectWait { pending, events }
}

/// Resolve once every name in `names` has been announced.
pub async fn wait_for_projects<I, S>(hub: &Hub, names: I)
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    watch_projects(hub, names).ready().await;
}
