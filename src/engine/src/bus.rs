//! Action bus: the seam external collaborators attach to
//!
//! Every lifecycle change the registry makes is mirrored here as an
//! [`Action`]. Actions carrying an `id` are delivered on that id's channel,
//! all others on the channel named after their kind, see [`route`].

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Announcement request for the directory collaborator
pub const DIRECTORY_PUBLISH: &str = "[Directory] Publish Now";

/// Build a lifecycle action kind, e.g. `[Entitlement] Add Ok`
pub fn lifecycle_kind(node_kind: &str, label: &str) -> String {
    format!("[{}] {}", node_kind, label)
}

/// Generic change notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Action {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            payload: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Delivery channel of an action
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Scoped to one node
    Id(String),
    /// Everyone interested in a kind of action
    Kind(String),
}

impl Channel {
    pub fn id(id: impl Into<String>) -> Self {
        Self::Id(id.into())
    }

    pub fn kind(kind: impl Into<String>) -> Self {
        Self::Kind(kind.into())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id:{}", id),
            Self::Kind(kind) => write!(f, "kind:{}", kind),
        }
    }
}

/// The dispatch rule: `id` wins over `type`
pub fn route(action: &Action) -> Channel {
    match &action.id {
        Some(id) => Channel::Id(id.clone()),
        None => Channel::Kind(action.kind.clone()),
    }
}

/// Handle returned by [`ActionBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&Action) + Send + Sync>;

/// Synchronous publish/subscribe bus
///
/// `publish` runs every handler of the routed channel, in subscription
/// order, before returning. Handlers may publish again; the listener list is
/// snapshotted before dispatch so re-entrant publishes never deadlock.
#[derive(Default)]
pub struct ActionBus {
    listeners: RwLock<HashMap<Channel, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
}

impl ActionBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a channel
    pub fn subscribe<F>(&self, channel: Channel, handler: F) -> SubscriptionId
    where
        F: Fn(&Action) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(channel)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler; returns false if it was already gone
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let mut removed = false;
        listeners.retain(|_, handlers| {
            let before = handlers.len();
            handlers.retain(|(id, _)| *id != subscription);
            removed |= handlers.len() != before;
            !handlers.is_empty()
        });
        removed
    }

    /// Deliver an action to its routed channel
    pub fn publish(&self, action: Action) {
        let channel = route(&action);
        let handlers: Vec<Handler> = match self.listeners.read().get(&channel) {
            Some(handlers) => handlers.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return,
        };

        for handler in handlers {
            handler(&action);
        }
    }

    /// Number of handlers on a channel
    pub fn listener_count(&self, channel: &Channel) -> usize {
        self.listeners
            .read()
            .get(channel)
            .map(|handlers| handlers.len())
            .unwrap_or(0)
    }
}

impl fmt::Debug for ActionBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionBus")
            .field("channels", &self.listeners.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn test_route_prefers_id() {
        let action = Action::new("[Entitlement] Add Ok").with_id("ent-1");
        assert_eq!(route(&action), Channel::id("ent-1"));

        let action = Action::new("[Entitlement] Add Ok");
        assert_eq!(route(&action), Channel::kind("[Entitlement] Add Ok"));
    }

    #[test]
    fn test_publish_in_subscription_order() {
        let bus = ActionBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            bus.subscribe(Channel::kind("ping"), move |_| seen.lock().push(tag));
        }

        bus.publish(Action::new("ping"));
        assert_eq!(*seen.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_id_channel_isolated_from_kind_channel() {
        let bus = ActionBus::new();
        let hits = Arc::new(Mutex::new(0));

        let counter = Arc::clone(&hits);
        bus.subscribe(Channel::kind("ping"), move |_| *counter.lock() += 1);

        bus.publish(Action::new("ping").with_id("node"));
        assert_eq!(*hits.lock(), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = ActionBus::new();
        let sub = bus.subscribe(Channel::kind("ping"), |_| {});
        assert_eq!(bus.listener_count(&Channel::kind("ping")), 1);

        assert!(bus.unsubscribe(sub));
        assert!(!bus.unsubscribe(sub));
        assert_eq!(bus.listener_count(&Channel::kind("ping")), 0);
    }

    #[test]
    fn test_reentrant_publish() {
        let bus = Arc::new(ActionBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner = Arc::clone(&bus);
        bus.subscribe(Channel::kind("outer"), move |_| inner.publish(Action::new("inner")));
        let log = Arc::clone(&seen);
        bus.subscribe(Channel::kind("inner"), move |a| log.lock().push(a.kind.clone()));

        bus.publish(Action::new("outer"));
        assert_eq!(*seen.lock(), vec!["inner".to_string()]);
    }

    #[test]
    fn test_wire_format_uses_type() {
        let action = Action::new("Compiled").with_id("root").with_payload(json!({"a": 1}));
        let wire = serde_json::to_value(&action).unwrap();
        assert_eq!(wire, json!({"type": "Compiled", "id": "root", "payload": {"a": 1}}));
    }
}
