//! Topic-addressed event bus with last-value replay
//!
//! Subscribers joining a topic after a publish still receive the most recent
//! value, which is how listeners and discovery consumers converge on current
//! state regardless of startup order. Delivery is non-blocking: a full
//! subscriber channel drops the message with a warning and never stalls the
//! publisher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

/// Capacity of each subscriber channel.
const SUBSCRIBER_CAPACITY: usize = 100;

/// Event topic carrying route updates for a listener.
pub fn route_topic(listener: &str) -> String {
    format!("routes_{listener}")
}

/// Event topic carrying stream-route updates for a listener.
pub fn stream_route_topic(listener: &str) -> String {
    format!("stream_routes_{listener}")
}

/// Event topic carrying node-set updates for a `(discovery type, service)` pair.
pub fn discovery_topic(typ: &str, service: &str) -> String {
    format!("sd_{typ}_{service}")
}

struct Topic<T> {
    last: Option<T>,
    subscribers: Vec<(u64, mpsc::Sender<T>)>,
}

impl<T> Default for Topic<T> {
    fn default() -> Self {
        Self {
            last: None,
            subscribers: Vec::new(),
        }
    }
}

/// A handle to one subscriber channel on one topic.
#[derive(Debug)]
pub struct Subscription<T> {
    id: u64,
    topic: String,
    rx: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Receive the next value. Returns `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for draining in tests and sweeps.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

pub struct EventBus<T> {
    topics: Mutex<HashMap<String, Topic<T>>>,
    next_id: AtomicU64,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventBus<T> {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T: Clone> EventBus<T> {
    /// Register a new subscriber on `topic`. If the topic has a cached last
    /// value, it is already enqueued when this returns.
    pub fn subscribe(&self, topic: &str) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut topics = self.topics.lock();
        let entry = topics.entry(topic.to_string()).or_default();
        if let Some(last) = &entry.last {
            // Channel is empty, capacity is nonzero: this cannot fail.
            let _ = tx.try_send(last.clone());
        }
        entry.subscribers.push((id, tx));

        Subscription {
            id,
            topic: topic.to_string(),
            rx,
        }
    }

    /// Publish `value` on `topic`. Updates the replay cache, then offers the
    /// value to every subscriber without blocking. Closed subscribers are
    /// pruned; full ones drop this value and observe it as a gap.
    pub fn publish(&self, topic: &str, value: T) {
        let mut topics = self.topics.lock();
        let entry = topics.entry(topic.to_string()).or_default();
        entry.last = Some(value.clone());

        entry.subscribers.retain(|(id, tx)| match tx.try_send(value.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(topic, subscriber = *id, "Subscriber channel full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Remove one subscriber from a topic. Its channel closes once removed.
    pub fn unsubscribe(&self, topic: &str, id: u64) {
        let mut topics = self.topics.lock();
        if let Some(entry) = topics.get_mut(topic) {
            entry.subscribers.retain(|(sub_id, _)| *sub_id != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("t");
        bus.publish("t", 1u32);
        bus.publish("t", 2u32);
        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_last_value() {
        let bus = EventBus::new();
        bus.publish("t", "old".to_string());
        bus.publish("t", "current".to_string());

        let mut sub = bus.subscribe("t");
        assert_eq!(sub.try_recv(), Some("current".to_string()));
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = EventBus::new();
        let mut a = bus.subscribe("a");
        let mut b = bus.subscribe("b");
        bus.publish("a", 7u32);
        assert_eq!(a.try_recv(), Some(7));
        assert_eq!(b.try_recv(), None);
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_blocking() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("t");
        // One more than the channel holds; the publisher must not block.
        for i in 0..=SUBSCRIBER_CAPACITY {
            bus.publish("t", i);
        }
        // The first CAPACITY values arrive in order; the overflow is a gap.
        for i in 0..SUBSCRIBER_CAPACITY {
            assert_eq!(sub.try_recv(), Some(i));
        }
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_channel() {
        let bus = EventBus::<u32>::new();
        let mut sub = bus.subscribe("t");
        bus.unsubscribe("t", sub.id());
        assert_eq!(sub.recv().await, None);
    }

    #[test]
    fn test_topic_keys() {
        assert_eq!(route_topic("l1"), "routes_l1");
        assert_eq!(stream_route_topic("l1"), "stream_routes_l1");
        assert_eq!(discovery_topic("demo", "ip"), "sd_demo_ip");
    }
}
