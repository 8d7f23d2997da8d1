//! Subscriber storage used by message-driven publish/subscribe.

use std::collections::BTreeMap;

use async_trait::async_trait;
use courier_core::MessageType;
use dashmap::DashMap;

/// One subscribing endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    /// Queue the events are delivered to.
    pub transport_address: String,
    pub endpoint: Option<String>,
}

impl Subscriber {
    #[must_use]
    pub fn new(transport_address: impl Into<String>, endpoint: Option<String>) -> Self {
        Self {
            transport_address: transport_address.into(),
            endpoint,
        }
    }
}

/// Persists who subscribed to which event type.
#[async_trait]
pub trait SubscriptionStorage: Send + Sync {
    /// Adds or replaces the subscription of `subscriber.transport_address`.
    async fn subscribe(&self, subscriber: Subscriber, event_type: &MessageType) -> anyhow::Result<()>;

    /// Removes the subscription of `subscriber.transport_address`. Missing entries are ignored.
    async fn unsubscribe(&self, subscriber: &Subscriber, event_type: &MessageType) -> anyhow::Result<()>;

    /// Current subscribers of `event_type`, ordered by address.
    async fn subscribers_for(&self, event_type: &MessageType) -> anyhow::Result<Vec<Subscriber>>;
}

/// Process-local [`SubscriptionStorage`]; subscriptions are lost on restart.
#[derive(Debug, Default)]
pub struct InMemorySubscriptionStorage {
    entries: DashMap<MessageType, BTreeMap<String, Subscriber>>,
}

impl InMemorySubscriptionStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStorage for InMemorySubscriptionStorage {
    async fn subscribe(&self, subscriber: Subscriber, event_type: &MessageType) -> anyhow::Result<()> {
        self.entries
            .entry(event_type.clone())
            .or_default()
            .insert(subscriber.transport_address.clone(), subscriber);
        Ok(())
    }

    async fn unsubscribe(&self, subscriber: &Subscriber, event_type: &MessageType) -> anyhow::Result<()> {
        if let Some(mut entry) = self.entries.get_mut(event_type) {
            entry.remove(&subscriber.transport_address);
        }
        Ok(())
    }

    async fn subscribers_for(&self, event_type: &MessageType) -> anyhow::Result<Vec<Subscriber>> {
        Ok(self
            .entries
            .get(event_type)
            .map(|entry| entry.values().cloned().collect())
            .unwrap_or_default())
    }
}
