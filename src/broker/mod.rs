//! Channel broker (component C9): topic registry, subscription table, and
//! fan-out with backpressure and per-topic metrics.
//!
//! No teacher module maps onto this directly; the registry/fan-out shape is
//! built from the dashmap-per-key discipline used throughout this crate plus
//! the bounded-mailbox delivery model `ws::connection` already establishes.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::core::{id_string, now_iso};
use crate::error::HubError;
use crate::ws::connection::{ConnectionHandle, Delivery};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    High,
    Normal,
    Low,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("no such topic")]
    NotFound,
    #[error("caller does not own this topic")]
    NotOwner,
}

impl From<BrokerError> for HubError {
    fn from(_: BrokerError) -> Self {
        HubError::InvalidPayload
    }
}

/// A pure predicate on the published payload; `None` accepts everything.
pub type Selector = Arc<dyn Fn(&serde_json::Value) -> bool + Send + Sync>;

struct Subscription {
    handle: ConnectionHandle,
    selector: Option<Selector>,
    dropped: AtomicU64,
}

struct Topic {
    owner_id: String,
    subscribers: DashMap<String, Subscription>,
    message_count: AtomicU64,
    last_activity_s: AtomicU64,
}

pub struct TopicMetrics {
    pub message_count: u64,
    pub subscriber_count: usize,
    pub last_activity_s: u64,
}

pub struct PublishOutcome {
    pub message_id: String,
    pub delivered: usize,
    pub dropped: usize,
}

pub struct ChannelBroker {
    topics: DashMap<String, Topic>,
    queue_threshold: usize,
    queue_size: AtomicUsize,
    global_message_count: AtomicU64,
    started_at_s: u64,
}

impl ChannelBroker {
    pub fn new(queue_threshold: usize) -> Self {
        Self {
            topics: DashMap::new(),
            queue_threshold,
            queue_size: AtomicUsize::new(0),
            global_message_count: AtomicU64::new(0),
            started_at_s: crate::core::now_s(),
        }
    }

    /// Explicit creation; subscribing to an unknown topic also creates it
    /// implicitly with `owner_id` set to the first subscriber.
    pub fn create(&self, name: &str, owner_id: &str) -> String {
        self.topics.entry(name.to_string()).or_insert_with(|| Topic {
            owner_id: owner_id.to_string(),
            subscribers: DashMap::new(),
            message_count: AtomicU64::new(0),
            last_activity_s: AtomicU64::new(crate::core::now_s()),
        });
        name.to_string()
    }

    pub fn subscribe(&self, topic: &str, connection_id: &str, handle: ConnectionHandle, selector: Option<Selector>) {
        let entry = self.topics.entry(topic.to_string()).or_insert_with(|| Topic {
            owner_id: connection_id.to_string(),
            subscribers: DashMap::new(),
            message_count: AtomicU64::new(0),
            last_activity_s: AtomicU64::new(crate::core::now_s()),
        });
        entry.subscribers.insert(
            connection_id.to_string(),
            Subscription {
                handle,
                selector,
                dropped: AtomicU64::new(0),
            },
        );
    }

    pub fn unsubscribe(&self, topic: &str, connection_id: &str) {
        if let Some(t) = self.topics.get(topic) {
            t.subscribers.remove(connection_id);
        }
    }

    /// `remove` requires the caller to be the topic's owner. Subscribers are
    /// notified with a close envelope before the topic is deregistered.
    pub fn remove(&self, topic: &str, caller_id: &str) -> Result<(), BrokerError> {
        let t = self.topics.get(topic).ok_or(BrokerError::NotFound)?;
        if t.owner_id != caller_id {
            return Err(BrokerError::NotOwner);
        }
        for sub in t.subscribers.iter() {
            sub.handle.try_deliver(Delivery::Envelope(serde_json::json!({
                "type": "channel.removed",
                "topic": topic,
            })));
        }
        drop(t);
        self.topics.remove(topic);
        Ok(())
    }

    pub fn list(&self) -> Vec<String> {
        self.topics.iter().map(|e| e.key().clone()).collect()
    }

    /// Publish to every subscriber whose selector accepts the payload.
    /// Delivery is best-effort: a full subscriber mailbox counts as a drop,
    /// not a publish failure. Per-(topic, subscriber) order is preserved
    /// because each subscriber's mailbox is an ordered mpsc channel and this
    /// call is the only writer enqueueing broadcasts onto it for this topic.
    pub fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Result<PublishOutcome, HubError> {
        let queue_size = self.queue_size.load(Ordering::Relaxed);
        let rejected = match priority {
            Priority::High => false,
            Priority::Normal => queue_size > self.queue_threshold * 2,
            Priority::Low => queue_size >= self.queue_threshold,
        };
        if rejected {
            return Err(HubError::Backpressure);
        }

        let t = self.topics.get(topic).ok_or(HubError::InvalidPayload)?;
        let message_id = id_string();
        let envelope = serde_json::json!({
            "type": "channel.message",
            "topic": topic,
            "payload": payload,
            "timestamp": now_iso(),
        });

        self.queue_size.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0usize;
        let mut dropped = 0usize;
        for sub in t.subscribers.iter() {
            let accepted = match &sub.selector {
                Some(f) => f(&envelope["payload"]),
                None => true,
            };
            if !accepted {
                continue;
            }
            if sub.handle.try_deliver(Delivery::Envelope(envelope.clone())) {
                delivered += 1;
            } else {
                sub.dropped.fetch_add(1, Ordering::Relaxed);
                dropped += 1;
            }
        }

        t.message_count.fetch_add(1, Ordering::Relaxed);
        t.last_activity_s.store(crate::core::now_s(), Ordering::Relaxed);
        self.global_message_count.fetch_add(1, Ordering::Relaxed);
        self.queue_size.fetch_sub(1, Ordering::Relaxed);

        Ok(PublishOutcome {
            message_id,
            delivered,
            dropped,
        })
    }

    pub fn topic_metrics(&self, topic: &str) -> Option<TopicMetrics> {
        self.topics.get(topic).map(|t| TopicMetrics {
            message_count: t.message_count.load(Ordering::Relaxed),
            subscriber_count: t.subscribers.len(),
            last_activity_s: t.last_activity_s.load(Ordering::Relaxed),
        })
    }

    pub fn global_metrics(&self) -> HashMap<&'static str, u64> {
        let mut m = HashMap::new();
        m.insert("message_count", self.global_message_count.load(Ordering::Relaxed));
        m.insert("queue_size", self.queue_size.load(Ordering::Relaxed) as u64);
        m.insert("uptime_seconds", crate::core::now_s().saturating_sub(self.started_at_s));
        m
    }

    /// Drop every subscriber matching `connection_id`, e.g. on disconnect.
    pub fn remove_subscriber_everywhere(&self, connection_id: &str) {
        for t in self.topics.iter() {
            t.subscribers.remove(connection_id);
        }
    }
}

impl Default for ChannelBroker {
    fn default() -> Self {
        Self::new(1_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn handle_pair(id: &str) -> (ConnectionHandle, crate::ws::connection::DeliveryReceiver) {
        let registry = crate::ws::connection::ConnectionRegistry::new();
        let (h, rx) = registry.register(id.to_string(), StdHashMap::new());
        (h, rx)
    }

    #[test]
    fn subscribe_then_publish_delivers_exactly_once() {
        let broker = ChannelBroker::new(1_000);
        let (handle, mut rx) = handle_pair("conn-x");
        broker.subscribe("room:42", "conn-x", handle, None);

        let outcome = broker
            .publish("room:42", serde_json::json!({"content": "hello"}), Priority::Normal)
            .unwrap();
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.dropped, 0);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn selector_suppresses_non_matching_payloads() {
        let broker = ChannelBroker::new(1_000);
        let (handle, mut rx) = handle_pair("conn-y");
        let selector: Selector = Arc::new(|p| p.get("urgent").and_then(|v| v.as_bool()).unwrap_or(false));
        broker.subscribe("alerts", "conn-y", handle, Some(selector));

        broker
            .publish("alerts", serde_json::json!({"urgent": false}), Priority::Normal)
            .unwrap();
        assert!(rx.try_recv().is_err());

        broker
            .publish("alerts", serde_json::json!({"urgent": true}), Priority::Normal)
            .unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn remove_requires_owner() {
        let broker = ChannelBroker::new(1_000);
        broker.create("room:1", "owner");
        assert_eq!(broker.remove("room:1", "not-owner"), Err(BrokerError::NotOwner));
        assert!(broker.remove("room:1", "owner").is_ok());
        assert!(broker.list().is_empty());
    }

    #[test]
    fn low_priority_rejected_at_threshold_high_always_accepted() {
        let broker = ChannelBroker::new(0);
        broker.create("t", "owner");
        assert_eq!(
            broker.publish("t", serde_json::json!({}), Priority::Low),
            Err(HubError::Backpressure)
        );
        assert!(broker.publish("t", serde_json::json!({}), Priority::High).is_ok());
    }
}
