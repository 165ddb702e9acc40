//! The Event Bus (spec.md §4.13): a fire-and-forget pub/sub pipe for
//! lifecycle events, sitting alongside (not instead of) the durable
//! [`crate::ledger::Ledger`] event log. Every state transition the
//! dispatcher, executors, worker loop, and workflow engine record also gets
//! published here for observers — metrics, alerting, audit logging — none
//! of which this crate implements (spec.md §1).
//!
//! Grounded in the teacher's `EventListener` / `CompositeEventListener`
//! (`crates/core/src/event_listeners.rs`): a trait invoked after an event is
//! persisted, with an optional type filter, fanned out to every registered
//! listener. Generalized here from a fixed listener list to runtime
//! subscribe/unsubscribe with glob-style topic patterns (spec's `*`,
//! `run.*`), and from direct synchronous dispatch to a bounded per-subscriber
//! queue so a slow listener cannot block the publisher (spec.md §5: "the bus
//! does not block publishers").

pub mod external;

pub use external::{ExternalEventBus, ExternalTransport};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::model::{Event, EventType};

/// Topic an [`EventEnvelope`] is published under, e.g. `"run.completed"` or
/// `"workflow.step_failed"`. Subscribers match against this, not the raw
/// [`EventType`], so future topic families (e.g. `"schedule.*"`) don't
/// require touching the ledger's event vocabulary.
pub fn topic_for(subject: &str, event_type: EventType) -> String {
    format!("{subject}.{}", event_type.to_string().to_lowercase())
}

/// An event as seen by bus subscribers: the durable [`Event`] plus the topic
/// it was published under.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub topic: String,
    pub event: Event,
}

/// Opaque handle returned by [`EventBus::subscribe`], passed back to
/// [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A listener invoked for every [`EventEnvelope`] whose topic matches the
/// pattern it subscribed under. Mirrors the teacher's `EventListener` trait,
/// generalized to carry the topic the match fired on.
#[async_trait::async_trait]
pub trait EventListener: Send + Sync + 'static {
    async fn on_event(&self, envelope: &EventEnvelope);
}

/// The bus interface spec.md §4.13 describes: `publish`, `subscribe` with
/// wildcard patterns, `unsubscribe`, `close`. Implemented in-process by
/// [`InMemoryEventBus`]; [`ExternalEventBus`] bridges the same interface to
/// a multi-process transport.
pub trait EventBus: Send + Sync + 'static {
    /// Fire-and-forget: never blocks on delivery, never propagates a
    /// listener's error back to the caller.
    fn publish(&self, envelope: EventEnvelope);

    /// Register `listener` against `pattern`. Patterns: `"*"` matches every
    /// topic; `"run.*"` matches any topic with the `run.` prefix; any other
    /// string matches only that exact topic.
    fn subscribe(&self, pattern: impl Into<String>, listener: Arc<dyn EventListener>) -> SubscriptionId
    where
        Self: Sized;

    fn unsubscribe(&self, id: SubscriptionId) -> bool;

    fn close(&self);
}

fn pattern_matches(pattern: &str, topic: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return topic == prefix || topic.starts_with(&format!("{prefix}."));
    }
    pattern == topic
}

struct Subscriber {
    pattern: String,
    tx: mpsc::Sender<EventEnvelope>,
    handle: tokio::task::JoinHandle<()>,
}

/// Bounded capacity of each subscriber's delivery queue (spec.md §5). A
/// subscriber that cannot keep up has events dropped rather than stalling
/// every other subscriber and the publisher.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// The default, single-process [`EventBus`]. Each subscriber gets its own
/// background task draining a bounded `mpsc` channel into its listener, so
/// one slow listener never delays another or the publisher.
#[derive(Default)]
pub struct InMemoryEventBus {
    subscribers: DashMap<u64, Subscriber>,
    next_id: AtomicU64,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(&self, envelope: EventEnvelope) {
        for entry in self.subscribers.iter() {
            let sub = entry.value();
            if !pattern_matches(&sub.pattern, &envelope.topic) {
                continue;
            }
            if sub.tx.try_send(envelope.clone()).is_err() {
                tracing::warn!(
                    topic = %envelope.topic,
                    subscription_id = *entry.key(),
                    "event bus subscriber queue full, dropping event"
                );
            }
        }
    }

    fn subscribe(&self, pattern: impl Into<String>, listener: Arc<dyn EventListener>) -> SubscriptionId {
        let pattern = pattern.into();
        let (tx, mut rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let handle = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                listener.on_event(&envelope).await;
            }
        });

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.insert(id, Subscriber { pattern, tx, handle });
        SubscriptionId(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        if let Some((_, sub)) = self.subscribers.remove(&id.0) {
            sub.handle.abort();
            true
        } else {
            false
        }
    }

    fn close(&self) {
        for entry in self.subscribers.iter() {
            entry.value().handle.abort();
        }
        self.subscribers.clear();
    }
}

impl Drop for InMemoryEventBus {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use uuid::Uuid;

    struct CountingListener(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl EventListener for CountingListener {
        async fn on_event(&self, _envelope: &EventEnvelope) {
            self.0.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    fn sample_envelope(topic: &str) -> EventEnvelope {
        EventEnvelope {
            topic: topic.to_string(),
            event: Event::new(Uuid::now_v7(), EventType::Completed, serde_json::json!({})),
        }
    }

    #[tokio::test]
    async fn wildcard_pattern_matches_every_topic() {
        let bus = InMemoryEventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe("*", Arc::new(CountingListener(count.clone())));

        bus.publish(sample_envelope("run.completed"));
        bus.publish(sample_envelope("workflow.step_failed"));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(count.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn prefix_pattern_matches_only_its_namespace() {
        let bus = InMemoryEventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe("run.*", Arc::new(CountingListener(count.clone())));

        bus.publish(sample_envelope("run.completed"));
        bus.publish(sample_envelope("workflow.step_failed"));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = InMemoryEventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = bus.subscribe("*", Arc::new(CountingListener(count.clone())));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        bus.publish(sample_envelope("run.completed"));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(count.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn topic_for_lowercases_the_event_type() {
        assert_eq!(topic_for("run", EventType::StepFailed), "run.step_failed");
    }
}
