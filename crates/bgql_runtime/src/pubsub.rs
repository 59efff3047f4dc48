//! Publish/Subscribe system for BGQL subscriptions.
//!
//! Subscribing to a topic yields a [`ValueStream`], ready to be returned from
//! a subscribe function as the source event stream.

use crate::resolver::ValueStream;
use bgql_repeater::Repeater;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tracing::{trace, warn};

const DEFAULT_CAPACITY: usize = 256;

/// A publish/subscribe hub for GraphQL subscriptions.
#[derive(Clone)]
pub struct PubSub {
    channels: Arc<RwLock<FxHashMap<String, broadcast::Sender<Value>>>>,
    capacity: usize,
}

impl Default for PubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSub")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl PubSub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a hub whose topics retain up to `capacity` undelivered events
    /// per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(FxHashMap::default())),
            capacity,
        }
    }

    /// Publishes an event, returning how many subscribers received it.
    pub async fn publish(&self, topic: impl AsRef<str>, event: Value) -> usize {
        let topic = topic.as_ref();
        let channels = self.channels.read().await;

        match channels.get(topic).map(|sender| sender.send(event)) {
            Some(Ok(count)) => count,
            _ => 0,
        }
    }

    /// Subscribes to a topic.
    ///
    /// Events published from now on are retained until pulled. Closing the
    /// returned stream unsubscribes.
    pub async fn subscribe(&self, topic: impl Into<String>) -> ValueStream {
        let topic = topic.into();
        let receiver = {
            let mut channels = self.channels.write().await;
            match channels.get(&topic) {
                Some(sender) => sender.subscribe(),
                None => {
                    let (sender, receiver) = broadcast::channel(self.capacity.max(1));
                    channels.insert(topic.clone(), sender);
                    receiver
                }
            }
        };

        Repeater::new(move |push, stop| async move {
            let mut receiver = receiver;
            loop {
                let event = tokio::select! {
                    biased;
                    () = stop.stopped() => break,
                    event = receiver.recv() => event,
                };
                match event {
                    Ok(event) => {
                        push.send(event).await?;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(%topic, skipped, "subscriber lagged behind, events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            trace!(%topic, "unsubscribed");
            Ok(())
        })
    }

    pub async fn topic_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn has_subscribers(&self, topic: &str) -> bool {
        let channels = self.channels.read().await;
        channels
            .get(topic)
            .is_some_and(|sender| sender.receiver_count() > 0)
    }

    /// Drops topics nobody is subscribed to.
    pub async fn cleanup(&self) {
        let mut channels = self.channels.write().await;
        channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bgql_repeater::Iteration;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let pubsub = PubSub::new();
        assert_eq!(pubsub.publish("events", json!(1)).await, 0);
        assert_eq!(pubsub.topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_subscribe_receives_events_in_order() {
        let pubsub = PubSub::new();
        let events = pubsub.subscribe("events").await;
        assert!(pubsub.has_subscribers("events").await);

        assert_eq!(pubsub.publish("events", json!("a")).await, 1);
        assert_eq!(pubsub.publish("events", json!("b")).await, 1);

        assert_eq!(events.next().unwrap().await, Ok(Iteration::Next(json!("a"))));
        assert_eq!(events.next().unwrap().await, Ok(Iteration::Next(json!("b"))));
    }

    #[tokio::test]
    async fn test_close_unsubscribes() {
        let pubsub = PubSub::new();
        let events = pubsub.subscribe("events").await;

        let pending = events.next().unwrap();
        pubsub.publish("events", json!(1)).await;
        assert_eq!(pending.await, Ok(Iteration::Next(json!(1))));

        assert_eq!(events.close().await, Ok(Iteration::Done(None)));
        assert!(!pubsub.has_subscribers("events").await);

        pubsub.cleanup().await;
        assert_eq!(pubsub.topic_count().await, 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_events() {
        let pubsub = PubSub::with_capacity(2);
        let events = pubsub.subscribe("events").await;
        for i in 0..5 {
            pubsub.publish("events", json!(i)).await;
        }

        assert_eq!(events.next().unwrap().await, Ok(Iteration::Next(json!(3))));
        assert_eq!(events.next().unwrap().await, Ok(Iteration::Next(json!(4))));
    }
}
