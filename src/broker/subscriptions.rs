//! Per-connection subscription table
//!
//! Filters map to the set of subscribers listening on them. The table is
//! plain data; the owning connection decides when the transport hears about
//! a change.

use super::NodeId;
use crate::message::{Message, Qos};
use crate::topic::TopicMatcher;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Callback run for each message matching a subscriber's filter
pub type DeliveryHandler = Arc<dyn Fn(&Message) + Send + Sync>;

struct Subscriber {
    qos: Qos,
    handler: DeliveryHandler,
}

struct FilterEntry {
    matcher: TopicMatcher,
    subscribers: BTreeMap<NodeId, Subscriber>,
}

impl FilterEntry {
    fn max_qos(&self) -> Qos {
        self.subscribers
            .values()
            .map(|s| s.qos)
            .max()
            .unwrap_or_default()
    }
}

/// Result of removing a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The filter was not in the table
    UnknownFilter,
    /// Other subscribers still use the filter
    StillInUse,
    /// The filter is gone and the broker should forget it
    FilterRemoved,
}

#[derive(Default)]
pub struct SubscriptionTable {
    filters: BTreeMap<String, FilterEntry>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a subscriber, returning the filter's effective QoS
    pub fn insert(
        &mut self,
        filter: &str,
        subscriber: NodeId,
        qos: Qos,
        handler: DeliveryHandler,
    ) -> Qos {
        let entry = self
            .filters
            .entry(filter.to_string())
            .or_insert_with(|| FilterEntry {
                matcher: TopicMatcher::new(filter),
                subscribers: BTreeMap::new(),
            });
        entry.subscribers.insert(subscriber, Subscriber { qos, handler });
        entry.max_qos()
    }

    pub fn remove(&mut self, filter: &str, subscriber: &NodeId) -> Removal {
        let Some(entry) = self.filters.get_mut(filter) else {
            return Removal::UnknownFilter;
        };
        entry.subscribers.remove(subscriber);
        if entry.subscribers.is_empty() {
            self.filters.remove(filter);
            Removal::FilterRemoved
        } else {
            Removal::StillInUse
        }
    }

    /// Highest QoS requested on a filter
    pub fn effective_qos(&self, filter: &str) -> Option<Qos> {
        self.filters.get(filter).map(FilterEntry::max_qos)
    }

    /// Every filter with its effective QoS, one entry per filter
    pub fn active_filters(&self) -> Vec<(String, Qos)> {
        self.filters
            .iter()
            .map(|(filter, entry)| (filter.clone(), entry.max_qos()))
            .collect()
    }

    /// Handlers of every subscriber whose filter matches `topic`
    ///
    /// A subscriber listening on several matching filters appears once per filter.
    pub fn handlers_for(&self, topic: &str) -> Vec<DeliveryHandler> {
        self.filters
            .values()
            .filter(|entry| entry.matcher.matches(topic))
            .flat_map(|entry| entry.subscribers.values().map(|s| s.handler.clone()))
            .collect()
    }

    pub fn subscriber_count(&self, filter: &str) -> usize {
        self.filters
            .get(filter)
            .map_or(0, |entry| entry.subscribers.len())
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: &Arc<AtomicUsize>) -> DeliveryHandler {
        let counter = counter.clone();
        Arc::new(move |_message: &Message| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_effective_qos_is_max() {
        let mut table = SubscriptionTable::new();
        let noop: DeliveryHandler = Arc::new(|_: &Message| {});

        assert_eq!(
            table.insert("a/b", NodeId::from("n1"), Qos::AtMostOnce, noop.clone()),
            Qos::AtMostOnce
        );
        assert_eq!(
            table.insert("a/b", NodeId::from("n2"), Qos::ExactlyOnce, noop.clone()),
            Qos::ExactlyOnce
        );
        assert_eq!(
            table.insert("a/b", NodeId::from("n3"), Qos::AtLeastOnce, noop),
            Qos::ExactlyOnce
        );
        assert_eq!(table.len(), 1);
        assert_eq!(table.subscriber_count("a/b"), 3);

        table.remove("a/b", &NodeId::from("n2"));
        assert_eq!(table.effective_qos("a/b"), Some(Qos::AtLeastOnce));
    }

    #[test]
    fn test_resubscribing_replaces_the_handler() {
        let mut table = SubscriptionTable::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        table.insert("t", NodeId::from("n"), Qos::AtMostOnce, counting_handler(&first));
        table.insert("t", NodeId::from("n"), Qos::AtMostOnce, counting_handler(&second));

        for handler in table.handlers_for("t") {
            handler(&Message::new("t", "x"));
        }
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_reports_when_filter_disappears() {
        let mut table = SubscriptionTable::new();
        let noop: DeliveryHandler = Arc::new(|_: &Message| {});
        table.insert("t", NodeId::from("a"), Qos::AtMostOnce, noop.clone());
        table.insert("t", NodeId::from("b"), Qos::AtMostOnce, noop);

        assert_eq!(table.remove("t", &NodeId::from("a")), Removal::StillInUse);
        assert_eq!(table.remove("t", &NodeId::from("a")), Removal::StillInUse);
        assert_eq!(table.remove("t", &NodeId::from("b")), Removal::FilterRemoved);
        assert_eq!(table.remove("t", &NodeId::from("b")), Removal::UnknownFilter);
        assert!(table.is_empty());
    }

    #[test]
    fn test_handlers_for_matches_wildcards() {
        let mut table = SubscriptionTable::new();
        let wildcard = Arc::new(AtomicUsize::new(0));
        let exact = Arc::new(AtomicUsize::new(0));
        let other = Arc::new(AtomicUsize::new(0));

        table.insert(
            "sensors/+/temp",
            NodeId::from("a"),
            Qos::AtMostOnce,
            counting_handler(&wildcard),
        );
        table.insert(
            "sensors/room1/temp",
            NodeId::from("b"),
            Qos::AtMostOnce,
            counting_handler(&exact),
        );
        table.insert(
            "actuators/#",
            NodeId::from("c"),
            Qos::AtMostOnce,
            counting_handler(&other),
        );

        let handlers = table.handlers_for("sensors/room1/temp");
        assert_eq!(handlers.len(), 2);
        for handler in handlers {
            handler(&Message::new("sensors/room1/temp", "21"));
        }
        assert_eq!(wildcard.load(Ordering::SeqCst), 1);
        assert_eq!(exact.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 0);

        assert_eq!(table.handlers_for("sensors/room2/temp").len(), 1);
        assert!(table.handlers_for("elsewhere").is_empty());
    }
}
