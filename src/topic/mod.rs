//! Topic fan-out.
//!
//! Topic messages are fire-and-forget: every subscription listening at
//! publish time gets a copy, nobody else ever does.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::dispatch::DispatchError;
use crate::exchange::{DomainEntry, ExchangeRegistry};
use crate::transport::{TopicHandle, TopicMessageHandler};

/// Publishes topic messages and manages topic subscriptions across domains.
pub struct TopicBus {
    registry: Arc<ExchangeRegistry>,
    subscriptions: Mutex<HashMap<TopicHandle, Arc<DomainEntry>>>,
}

impl TopicBus {
    pub fn new(registry: Arc<ExchangeRegistry>) -> Self {
        Self {
            registry,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Publish to every subscription on `exchange` whose pattern matches `topic`.
    ///
    /// Zero subscribers is not an error.
    #[tracing::instrument(name = "topic.publish", skip_all, fields(domain = %domain, exchange = %exchange, topic = %topic))]
    pub async fn publish_topic_message(
        &self,
        domain: &str,
        exchange: &str,
        topic: &str,
        payload: impl Into<Bytes>,
    ) -> Result<(), DispatchError> {
        let entry = self.registry.ensure_domain(domain).await?;
        entry
            .transport()
            .publish_topic(exchange, topic, payload.into())
            .await?;
        Ok(())
    }

    /// Start a receive loop for `topic` on `exchange`.
    pub async fn subscribe_topic(
        &self,
        domain: &str,
        exchange: &str,
        topic: &str,
        handler: Arc<dyn TopicMessageHandler>,
    ) -> Result<TopicHandle, DispatchError> {
        let entry = self.registry.ensure_domain(domain).await?;
        let handle = entry
            .transport()
            .subscribe_topic(exchange, topic, handler)
            .await?;
        debug!(domain = %domain, exchange = %exchange, topic = %topic, subscription = %handle, "Topic subscribed");
        self.subscriptions.lock().await.insert(handle, entry);
        Ok(handle)
    }

    /// Stop a subscription. Returns `false` for an unknown handle.
    pub async fn unsubscribe_topic(&self, handle: TopicHandle) -> Result<bool, DispatchError> {
        let entry = self.subscriptions.lock().await.remove(&handle);
        match entry {
            Some(entry) => {
                entry.transport().unsubscribe_topic(handle).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Stop every subscription.
    pub async fn shutdown(&self) {
        let all: Vec<_> = self.subscriptions.lock().await.drain().collect();
        for (handle, entry) in all {
            if let Err(e) = entry.transport().unsubscribe_topic(handle).await {
                warn!(subscription = %handle, error = %e, "Failed to stop topic subscription");
            }
        }
    }
}
