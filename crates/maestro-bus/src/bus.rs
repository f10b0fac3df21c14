use async_trait::async_trait;
use chrono::{DateTime, Utc};
use maestro_core::{BusMessage, MaestroResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
#[cfg(any(test, feature = "testing"))]
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

/// A message as delivered on a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique per publish.
    pub id: Uuid,
    /// Topic the envelope was published on.
    pub topic: String,
    /// Name of the publishing participant.
    pub source: String,
    /// Publish time.
    pub published_at: DateTime<Utc>,
    /// The payload.
    pub message: BusMessage,
}

/// Receiving end of a topic subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next envelope, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

/// Topic-addressed publish/subscribe.
///
/// Delivery is at-least-once: subscribers must tolerate duplicates. Order is
/// preserved per publisher per topic.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        source: &str,
        message: BusMessage,
    ) -> MaestroResult<Envelope>;
    async fn subscribe(&self, topic: &str) -> MaestroResult<Subscription>;
}

/// In-process bus: every subscriber gets its own unbounded queue.
///
/// A bus built with [`InMemoryBus::recording`] also keeps a log of every
/// published envelope for inspection; [`InMemoryBus::new`] keeps nothing.
#[derive(Default)]
pub struct InMemoryBus {
    subscribers: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<Envelope>>>>,
    log: Option<RwLock<Vec<Envelope>>>,
    #[cfg(any(test, feature = "testing"))]
    failures_left: AtomicU32,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that logs every published envelope. The log is never pruned.
    pub fn recording() -> Self {
        Self {
            log: Some(RwLock::new(Vec::new())),
            ..Self::default()
        }
    }

    /// Envelopes published so far on topics starting with `prefix`.
    ///
    /// Always empty unless the bus was built with [`InMemoryBus::recording`].
    pub async fn published(&self, prefix: &str) -> Vec<Envelope> {
        let Some(log) = &self.log else {
            return Vec::new();
        };
        log.read()
            .await
            .iter()
            .filter(|e| e.topic.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Live subscriber count for `topic`.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .read()
            .await
            .get(topic)
            .map_or(0, |subs| subs.iter().filter(|s| !s.is_closed()).count())
    }

    /// Make the next `n` publishes fail with [`maestro_core::MaestroError::BusPublish`].
    #[cfg(any(test, feature = "testing"))]
    pub fn fail_next_publishes(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    #[cfg(any(test, feature = "testing"))]
    fn injected_failure(&self, topic: &str) -> MaestroResult<()> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            tracing::warn!(topic, "Injected publish failure");
            return Err(maestro_core::MaestroError::BusPublish {
                topic: topic.to_string(),
                reason: "injected failure".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(
        &self,
        topic: &str,
        source: &str,
        message: BusMessage,
    ) -> MaestroResult<Envelope> {
        #[cfg(any(test, feature = "testing"))]
        self.injected_failure(topic)?;

        let envelope = Envelope {
            id: Uuid::new_v4(),
            topic: topic.to_string(),
            source: source.to_string(),
            published_at: Utc::now(),
            message,
        };

        if let Some(log) = &self.log {
            log.write().await.push(envelope.clone());
        }

        let mut subs = self.subscribers.write().await;
        if let Some(list) = subs.get_mut(topic) {
            list.retain(|tx| tx.send(envelope.clone()).is_ok());
            debug!(
                topic,
                kind = envelope.message.kind(),
                subscribers = list.len(),
                "Published"
            );
        } else {
            debug!(topic, kind = envelope.message.kind(), "Published with no subscribers");
        }
        Ok(envelope)
    }

    async fn subscribe(&self, topic: &str) -> MaestroResult<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        debug!(topic, "Subscribed");
        Ok(Subscription {
            topic: topic.to_string(),
            rx,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use maestro_core::BroadcastMessage;

    fn broadcast(summary: &str) -> BusMessage {
        BusMessage::BroadcastMessage(BroadcastMessage {
            instance_id: "wf-1".into(),
            from_agent: "MathAgent".into(),
            summary: summary.into(),
        })
    }

    #[tokio::test]
    async fn test_fan_out_to_every_subscriber() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe("agents.broadcast").await.unwrap();
        let mut b = bus.subscribe("agents.broadcast").await.unwrap();

        bus.publish("agents.broadcast", "MathAgent", broadcast("hi"))
            .await
            .unwrap();

        assert_eq!(a.recv().await.unwrap().source, "MathAgent");
        assert_eq!(b.recv().await.unwrap().message, broadcast("hi"));
    }

    #[tokio::test]
    async fn test_topics_are_isolated_and_ordered() {
        let bus = InMemoryBus::recording();
        let mut inbox = bus.subscribe("agents.A.inbox").await.unwrap();

        bus.publish("agents.B.inbox", "x", broadcast("other")).await.unwrap();
        for i in 0..5 {
            bus.publish("agents.A.inbox", "x", broadcast(&i.to_string()))
                .await
                .unwrap();
        }

        for i in 0..5 {
            let env = inbox.recv().await.unwrap();
            assert_eq!(env.message, broadcast(&i.to_string()));
        }
        assert!(inbox.try_recv().is_none());
        assert_eq!(bus.published("agents.").await.len(), 6);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let bus = InMemoryBus::new();
        let sub = bus.subscribe("t").await.unwrap();
        assert_eq!(bus.subscriber_count("t").await, 1);
        drop(sub);
        bus.publish("t", "x", broadcast("gone")).await.unwrap();
        assert_eq!(bus.subscriber_count("t").await, 0);
    }

    #[tokio::test]
    async fn test_injected_failures_are_retryable() {
        let bus = InMemoryBus::recording();
        bus.fail_next_publishes(1);
        let err = bus.publish("t", "x", broadcast("a")).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.code(), "BusPublishError");
        bus.publish("t", "x", broadcast("b")).await.unwrap();
        assert_eq!(bus.published("t").await.len(), 1);
    }

    #[tokio::test]
    async fn test_plain_bus_keeps_no_log() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("t").await.unwrap();
        bus.publish("t", "x", broadcast("a")).await.unwrap();
        assert!(sub.recv().await.is_some());
        assert!(bus.published("").await.is_empty());
    }

    #[test]
    fn test_envelope_wire_format() {
        let env = Envelope {
            id: Uuid::nil(),
            topic: "agents.broadcast".into(),
            source: "maestro".into(),
            published_at: Utc::now(),
            message: broadcast("s"),
        };
        let v = serde_json::to_value(&env).unwrap();
        assert!(v.get("publishedAt").is_some());
        assert_eq!(v["message"]["type"], "BroadcastMessage");
        assert_eq!(v["message"]["fromAgent"], "MathAgent");
    }
}
