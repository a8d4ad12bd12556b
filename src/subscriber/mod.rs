//! Queue subscribers.
//!
//! A `Subscriber` names the queue it listens on and a stable identity.
//! Subscribers sharing (queue, identity) form one competing-consumer group,
//! across processes too: each message reaches one member of the group.
//! Subscribers with different identities each see every message.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::dispatch::{decode_envelope, DispatchError, TaskDispatcher};
use crate::exchange::{DomainEntry, ExchangeRegistry};
use crate::task::Task;
use crate::transport::{
    ConsumerOptions, ConsumerTag, Delivery, HandlerError, MessageKind, QueueHandler,
};

/// A registered queue handler.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Queue this subscriber consumes from.
    fn queue(&self) -> &str;

    /// Competing-consumer identity.
    fn identity(&self) -> &str;

    /// Handle a task. Output and state changes made here are reported back
    /// to the publisher when the call returns.
    async fn handle_task(&self, task: &mut Task) -> Result<(), HandlerError> {
        let _ = task;
        Err(HandlerError::Unsupported("tasks"))
    }

    /// Handle a broadcast payload.
    async fn handle_event(&self, payload: Bytes) -> Result<(), HandlerError> {
        let _ = payload;
        Err(HandlerError::Unsupported("events"))
    }
}

struct Registration {
    domain: String,
    queue: String,
    identity: String,
    entry: Arc<DomainEntry>,
    subscriber: Arc<dyn Subscriber>,
}

/// Tracks active subscribers and their transport consumers.
///
/// Registrations live until explicitly removed.
pub struct SubscriberRegistry {
    registry: Arc<ExchangeRegistry>,
    dispatcher: Weak<TaskDispatcher>,
    concurrency: usize,
    registrations: RwLock<HashMap<ConsumerTag, Registration>>,
}

impl SubscriberRegistry {
    pub fn new(
        registry: Arc<ExchangeRegistry>,
        dispatcher: &Arc<TaskDispatcher>,
        concurrency: usize,
    ) -> Self {
        Self {
            registry,
            dispatcher: Arc::downgrade(dispatcher),
            concurrency: concurrency.max(1),
            registrations: RwLock::new(HashMap::new()),
        }
    }

    /// Start delivering messages from the subscriber's queue to it.
    pub async fn subscribe(
        &self,
        domain: &str,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<ConsumerTag, DispatchError> {
        let entry = self.registry.ensure_domain(domain).await?;
        let queue = subscriber.queue().to_string();
        let identity = subscriber.identity().to_string();
        if !entry.has_queue(entry.name(), &queue).await {
            return Err(DispatchError::UnknownQueue {
                domain: domain.to_string(),
                queue,
            });
        }

        let adapter = Arc::new(SubscriberAdapter {
            subscriber: Arc::clone(&subscriber),
            dispatcher: self.dispatcher.clone(),
            domain: domain.to_string(),
        });
        let options = ConsumerOptions::group(identity.clone()).with_concurrency(self.concurrency);
        let tag = entry
            .transport()
            .start_consuming(entry.name(), &queue, options, adapter)
            .await?;

        info!(domain = %domain, queue = %queue, identity = %identity, consumer = %tag, "Subscribed");
        self.registrations.write().await.insert(
            tag.clone(),
            Registration {
                domain: domain.to_string(),
                queue,
                identity,
                entry,
                subscriber,
            },
        );
        Ok(tag)
    }

    /// Remove every registration of `subscriber` in `domain`.
    ///
    /// Waits for in-flight callbacks. Returns the number of registrations removed.
    pub async fn unsubscribe(
        &self,
        domain: &str,
        subscriber: &Arc<dyn Subscriber>,
    ) -> Result<usize, DispatchError> {
        let removed: Vec<(ConsumerTag, Registration)> = {
            let mut registrations = self.registrations.write().await;
            let tags: Vec<ConsumerTag> = registrations
                .iter()
                .filter(|(_, r)| {
                    r.domain == domain
                        && std::ptr::addr_eq(Arc::as_ptr(&r.subscriber), Arc::as_ptr(subscriber))
                })
                .map(|(tag, _)| tag.clone())
                .collect();
            tags.into_iter()
                .filter_map(|tag| registrations.remove(&tag).map(|r| (tag, r)))
                .collect()
        };

        if removed.is_empty() {
            warn!(domain = %domain, queue = %subscriber.queue(), "Subscriber was not registered");
        }

        let count = removed.len();
        for (tag, registration) in removed {
            registration.entry.transport().stop_consuming(&tag).await?;
            info!(
                domain = %registration.domain,
                queue = %registration.queue,
                identity = %registration.identity,
                "Unsubscribed"
            );
        }
        Ok(count)
    }

    /// Remove one registration by consumer tag.
    pub async fn unsubscribe_tag(&self, tag: &ConsumerTag) -> Result<bool, DispatchError> {
        let registration = self.registrations.write().await.remove(tag);
        match registration {
            Some(registration) => {
                registration.entry.transport().stop_consuming(tag).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Number of local members of a competing-consumer group.
    pub async fn group_size(&self, domain: &str, queue: &str, identity: &str) -> usize {
        self.registrations
            .read()
            .await
            .values()
            .filter(|r| r.domain == domain && r.queue == queue && r.identity == identity)
            .count()
    }

    pub async fn len(&self) -> usize {
        self.registrations.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.registrations.read().await.is_empty()
    }

    /// Remove every registration.
    pub async fn unsubscribe_all(&self) {
        let all: Vec<_> = self.registrations.write().await.drain().collect();
        for (tag, registration) in all {
            if let Err(e) = registration.entry.transport().stop_consuming(&tag).await {
                warn!(queue = %registration.queue, error = %e, "Failed to stop consumer");
            }
        }
    }
}

/// Routes deliveries to a `Subscriber` by message kind.
struct SubscriberAdapter {
    subscriber: Arc<dyn Subscriber>,
    dispatcher: Weak<TaskDispatcher>,
    domain: String,
}

impl QueueHandler for SubscriberAdapter {
    fn handle(&self, delivery: Arc<Delivery>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let subscriber = Arc::clone(&self.subscriber);
        let dispatcher = self.dispatcher.clone();
        let domain = self.domain.clone();
        Box::pin(async move {
            match delivery.properties.kind {
                MessageKind::Task => {
                    let envelope = decode_envelope(&delivery.payload)?;
                    let mut task = Task::received(&delivery.queue, envelope);
                    subscriber.handle_task(&mut task).await?;
                    if !task.has_progress() {
                        return Ok(());
                    }
                    let Some(dispatcher) = dispatcher.upgrade() else {
                        debug!(task_id = %task.id(), "Dispatcher gone, response not published");
                        return Ok(());
                    };
                    dispatcher
                        .publish_task_response(&domain, &delivery.queue, task.status())
                        .await
                        .map_err(|e| HandlerError::Failed(e.to_string()))
                }
                _ => subscriber.handle_event(delivery.payload.clone()).await,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatcherConfig;
    use crate::task::{InMemoryStatusStore, TaskState};
    use crate::test_utils::RecordingSubscriber;
    use crate::transport::TransportFactory;
    use std::time::Duration;

    fn setup() -> (Arc<TaskDispatcher>, SubscriberRegistry) {
        let registry = Arc::new(ExchangeRegistry::in_memory(TransportFactory::new()));
        let dispatcher = TaskDispatcher::new(
            Arc::clone(&registry),
            Arc::new(InMemoryStatusStore::new()),
            DispatcherConfig::default(),
        );
        let subscribers = SubscriberRegistry::new(registry, &dispatcher, 2);
        (dispatcher, subscribers)
    }

    #[tokio::test]
    async fn test_subscribe_requires_declared_queue() {
        let (_dispatcher, subscribers) = setup();
        let subscriber = RecordingSubscriber::new("missing", "worker").shared();

        let result = subscribers.subscribe("orders", subscriber).await;

        assert!(matches!(result, Err(DispatchError::UnknownQueue { .. })));
        assert!(subscribers.is_empty().await);
    }

    #[tokio::test]
    async fn test_task_handler_response_reaches_publisher() {
        let (dispatcher, subscribers) = setup();
        dispatcher.create_task_queue("orders", "work").await.unwrap();
        let worker = RecordingSubscriber::new("work", "worker")
            .responding_with("Response")
            .shared();
        subscribers.subscribe("orders", worker.clone()).await.unwrap();

        let status = dispatcher
            .publish_task("orders", "work", "Hello World", Some(Duration::from_secs(5)), 0)
            .await
            .unwrap();

        assert_eq!(status.current_state, TaskState::Completed);
        assert_eq!(status.output, vec!["Response"]);
        assert_eq!(worker.tasks().await, vec!["Hello World".to_string()]);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let (dispatcher, subscribers) = setup();
        dispatcher.create_task_queue("orders", "work").await.unwrap();
        let worker = RecordingSubscriber::new("work", "worker").shared();
        let as_dyn: Arc<dyn Subscriber> = worker.clone();
        subscribers.subscribe("orders", Arc::clone(&as_dyn)).await.unwrap();
        assert_eq!(subscribers.group_size("orders", "work", "worker").await, 1);

        assert_eq!(subscribers.unsubscribe("orders", &as_dyn).await.unwrap(), 1);
        assert_eq!(subscribers.unsubscribe("orders", &as_dyn).await.unwrap(), 0);

        dispatcher
            .publish_task("orders", "work", "ignored", Some(Duration::ZERO), 0)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(worker.tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_event_without_handler_is_acked() {
        let (dispatcher, subscribers) = setup();
        dispatcher.create_task_queue("orders", "work").await.unwrap();
        let worker = RecordingSubscriber::new("work", "worker")
            .rejecting_events()
            .shared();
        subscribers.subscribe("orders", worker.clone()).await.unwrap();

        let entry = dispatcher.registry().domain("orders").await.unwrap();
        entry
            .transport()
            .publish("orders", "work", crate::transport::Message::event("stray"))
            .await
            .unwrap();
        entry
            .transport()
            .publish("orders", "work", crate::transport::Message::event("again"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(worker.event_attempts(), 2);
    }
}
