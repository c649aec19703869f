//! Lifecycle event emitter.
//!
//! Every committed state transition publishes one event, in commit order, on
//! a broadcast channel. `events --since/--until/--filter` and the service's
//! events endpoint consume filtered streams of the same channel, so there is
//! a single source of event ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Buffered events before slow subscribers start losing the oldest.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Object category an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Container,
    Pod,
    Image,
    Volume,
    System,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Container => write!(f, "container"),
            Self::Pod => write!(f, "pod"),
            Self::Image => write!(f, "image"),
            Self::Volume => write!(f, "volume"),
            Self::System => write!(f, "system"),
        }
    }
}

/// A single lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Object category.
    #[serde(rename = "Type")]
    pub kind: EventKind,
    /// Action, e.g. "create", "start", "died".
    #[serde(rename = "Action")]
    pub action: String,
    /// Object ID.
    #[serde(rename = "Actor")]
    pub id: String,
    /// Human name, when the object has one.
    #[serde(rename = "Name", skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// When the transition committed.
    #[serde(rename = "Time")]
    pub time: DateTime<Utc>,
}

/// Filter for event subscriptions. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub kinds: Vec<EventKind>,
    pub actions: Vec<String>,
    pub ids: Vec<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl EventFilter {
    /// Whether an event passes the filter.
    pub fn matches(&self, event: &Event) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.actions.is_empty() && !self.actions.contains(&event.action) {
            return false;
        }
        if !self.ids.is_empty()
            && !self
                .ids
                .iter()
                .any(|i| event.id.starts_with(i.as_str()) || event.name.as_deref() == Some(i))
        {
            return false;
        }
        if let Some(since) = self.since {
            if event.time < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.time > until {
                return false;
            }
        }
        true
    }
}

/// Process-wide event bus with explicit construction and teardown.
///
/// Held by the engine; not a global. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Creates a new event bus.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publishes an event. Delivery order is send order.
    pub fn publish(&self, kind: EventKind, action: &str, id: &str, name: Option<&str>) {
        let event = Event {
            kind,
            action: action.to_string(),
            id: id.to_string(),
            name: name.map(str::to_string),
            time: Utc::now(),
        };
        // No subscribers is fine; events are best-effort notifications.
        let _ = self.sender.send(event);
    }

    /// Subscribes to the live stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_delivered_in_commit_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EventKind::Container, "create", "aaa", Some("c1"));
        bus.publish(EventKind::Container, "start", "aaa", Some("c1"));
        bus.publish(EventKind::Container, "died", "aaa", Some("c1"));

        assert_eq!(rx.recv().await.unwrap().action, "create");
        assert_eq!(rx.recv().await.unwrap().action, "start");
        assert_eq!(rx.recv().await.unwrap().action, "died");
    }

    #[test]
    fn filter_by_kind_and_id() {
        let event = Event {
            kind: EventKind::Pod,
            action: "start".into(),
            id: "deadbeef".into(),
            name: Some("p1".into()),
            time: Utc::now(),
        };

        let mut filter = EventFilter::default();
        assert!(filter.matches(&event));

        filter.kinds = vec![EventKind::Container];
        assert!(!filter.matches(&event));

        filter.kinds = vec![EventKind::Pod];
        filter.ids = vec!["dead".into()];
        assert!(filter.matches(&event));

        filter.ids = vec!["p1".into()];
        assert!(filter.matches(&event));

        filter.ids = vec!["other".into()];
        assert!(!filter.matches(&event));
    }

    #[test]
    fn filter_by_time_window() {
        let now = Utc::now();
        let event = Event {
            kind: EventKind::Volume,
            action: "create".into(),
            id: "v1".into(),
            name: None,
            time: now,
        };

        let filter = EventFilter {
            since: Some(now - chrono::Duration::seconds(5)),
            until: Some(now + chrono::Duration::seconds(5)),
            ..Default::default()
        };
        assert!(filter.matches(&event));

        let filter = EventFilter {
            until: Some(now - chrono::Duration::seconds(5)),
            ..Default::default()
        };
        assert!(!filter.matches(&event));
    }
}
