//! Google Pub/Sub transport.
//!
//! Pub/Sub has no exchanges or routing keys, so the topology is emulated:
//! - Each exchange is one Pub/Sub topic `{prefix}-{exchange}`. The routing key
//!   travels as a message attribute.
//! - Each competing-consumer group on a logical queue owns the subscription
//!   `{prefix}-{exchange}-{queue}-{group}`. Subscriptions see every message on
//!   the exchange topic and drop (ack) those the queue's bindings reject.
//! - The default exchange maps each queue name to its own topic
//!   `{prefix}-q-{queue}`.
//! - Topic messages use `{prefix}-{exchange}-topics`; each subscription gets a
//!   short-lived Pub/Sub subscription filtered client-side by pattern.
//!
//! # Authentication
//!
//! Uses ADC (Application Default Credentials):
//! - Set `GOOGLE_APPLICATION_CREDENTIALS` to a service account JSON path
//! - For local testing: set `PUBSUB_EMULATOR_HOST` to the emulator address

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use bytes::Bytes;
use gcloud_googleapis::pubsub::v1::PubsubMessage;
use gcloud_pubsub::client::{Client, ClientConfig};
use gcloud_pubsub::publisher::Publisher;
use gcloud_pubsub::subscriber::ReceivedMessage;
use gcloud_pubsub::subscription::{Subscription, SubscriptionConfig};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatch::{deliver_topic, invoke_handler, ConsumerWorkers};
use super::routing::topic_matches;
use super::{
    ConsumerOptions, ConsumerTag, Delivery, Message, MessageKind, MessageProperties,
    QueueHandler, Result, TopicHandle, TopicMessage, TopicMessageHandler, TransportError,
    TransportHandler, TransportKind, TransportSettings, DEFAULT_EXCHANGE,
};
use crate::exchange::{ExchangeDefinition, ExchangeType, QueueDefinition};

/// Attribute carrying the routing key.
const ROUTING_KEY_ATTR: &str = "routing_key";
/// Attribute carrying the message kind.
const KIND_ATTR: &str = "kind";
const CONTENT_TYPE_ATTR: &str = "content_type";
const PRIORITY_ATTR: &str = "priority";
const CORRELATION_ID_ATTR: &str = "correlation_id";
const REPLY_TO_ATTR: &str = "reply_to";

const DEFAULT_TOPIC_PREFIX: &str = "courier";
/// Messages fetched per pull.
const PULL_BATCH: i32 = 10;

/// Configuration for Google Pub/Sub connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PubSubConfig {
    /// GCP project ID.
    pub project_id: String,
    /// Prefix for every topic and subscription name.
    pub topic_prefix: String,
}

impl PubSubConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
        }
    }

    /// Read `project_id` (required) and `topic_prefix` from domain settings.
    pub fn from_settings(settings: &TransportSettings) -> Result<Self> {
        let project_id = settings.option("project_id").ok_or_else(|| {
            TransportError::Unavailable("Pub/Sub transport requires 'project_id'".to_string())
        })?;
        let mut config = Self::new(project_id);
        if let Some(prefix) = settings.option("topic_prefix") {
            config = config.with_topic_prefix(prefix);
        }
        Ok(config)
    }

    /// Set topic prefix.
    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    /// Topic carrying queue messages of an exchange, or of one default-exchange queue.
    pub fn exchange_topic(&self, exchange: &str, routing_key: &str) -> String {
        if exchange == DEFAULT_EXCHANGE {
            format!("{}-q-{}", self.topic_prefix, sanitize(routing_key))
        } else {
            format!("{}-{}", self.topic_prefix, sanitize(exchange))
        }
    }

    /// Subscription of one consumer group on a queue.
    pub fn group_subscription(&self, exchange: &str, queue: &str, group: &str) -> String {
        if exchange == DEFAULT_EXCHANGE {
            format!("{}-q-{}", self.topic_prefix, sanitize(queue))
        } else {
            format!(
                "{}-{}-{}-{}",
                self.topic_prefix,
                sanitize(exchange),
                sanitize(queue),
                sanitize(group)
            )
        }
    }

    /// Topic carrying topic messages of an exchange.
    pub fn topic_messages_topic(&self, exchange: &str) -> String {
        format!("{}-{}-topics", self.topic_prefix, sanitize(exchange))
    }
}

/// Replace characters Pub/Sub resource names do not allow.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~' | '+' | '%') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

fn to_attributes(routing_key: &str, properties: &MessageProperties) -> HashMap<String, String> {
    let mut attributes = HashMap::new();
    attributes.insert(ROUTING_KEY_ATTR.to_string(), routing_key.to_string());
    attributes.insert(KIND_ATTR.to_string(), properties.kind.as_str().to_string());
    if let Some(content_type) = &properties.content_type {
        attributes.insert(CONTENT_TYPE_ATTR.to_string(), content_type.clone());
    }
    if properties.priority > 0 {
        attributes.insert(PRIORITY_ATTR.to_string(), properties.priority.to_string());
    }
    if let Some(correlation_id) = &properties.correlation_id {
        attributes.insert(CORRELATION_ID_ATTR.to_string(), correlation_id.clone());
    }
    if let Some(reply_to) = &properties.reply_to {
        attributes.insert(REPLY_TO_ATTR.to_string(), reply_to.clone());
    }
    attributes
}

fn from_attributes(attributes: &HashMap<String, String>) -> MessageProperties {
    MessageProperties {
        kind: attributes
            .get(KIND_ATTR)
            .map(|k| MessageKind::parse(k))
            .unwrap_or_default(),
        content_type: attributes.get(CONTENT_TYPE_ATTR).cloned(),
        priority: attributes
            .get(PRIORITY_ATTR)
            .and_then(|p| p.parse().ok())
            .unwrap_or(0),
        correlation_id: attributes.get(CORRELATION_ID_ATTR).cloned(),
        reply_to: attributes.get(REPLY_TO_ATTR).cloned(),
    }
}

/// Client-side routing filter for one subscription.
#[derive(Clone, Debug)]
struct Route {
    exchange: String,
    queue: String,
    exchange_type: ExchangeType,
    definition: Option<QueueDefinition>,
}

impl Route {
    fn accepts(&self, routing_key: &str) -> bool {
        match &self.definition {
            Some(queue) => queue.accepts(self.exchange_type, routing_key),
            None => true,
        }
    }
}

struct ConsumerEntry {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    workers: ConsumerWorkers,
    /// Subscription deleted when the consumer stops (ephemeral groups).
    owned_subscription: Option<String>,
}

/// Subscription an ephemeral group owns. Default-exchange subscriptions
/// belong to the queue and go with `delete_queue`.
fn owned_subscription(exchange: &str, options: &ConsumerOptions, subscription: &str) -> Option<String> {
    (options.ephemeral && exchange != DEFAULT_EXCHANGE).then(|| subscription.to_string())
}

struct TopicEntry {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    subscription: String,
}

/// Google Pub/Sub transport.
pub struct PubSubTransport {
    client: Client,
    config: PubSubConfig,
    exchanges: RwLock<HashMap<String, ExchangeDefinition>>,
    /// Cache of publishers per topic.
    publishers: RwLock<HashMap<String, Publisher>>,
    consumers: Mutex<HashMap<ConsumerTag, ConsumerEntry>>,
    topics: Mutex<HashMap<TopicHandle, TopicEntry>>,
    shutdown: CancellationToken,
}

impl PubSubTransport {
    /// Create a Pub/Sub client.
    ///
    /// Uses Application Default Credentials (ADC) for authentication.
    /// Set GOOGLE_APPLICATION_CREDENTIALS or PUBSUB_EMULATOR_HOST for testing.
    pub async fn connect(config: PubSubConfig) -> Result<Self> {
        let mut client_config = ClientConfig::default();
        client_config.project_id = Some(config.project_id.clone());
        let client_config = client_config.with_auth().await.map_err(|e| {
            TransportError::Unavailable(format!("Failed to configure Pub/Sub auth: {}", e))
        })?;

        let client = Client::new(client_config).await.map_err(|e| {
            TransportError::Unavailable(format!("Failed to create Pub/Sub client: {}", e))
        })?;

        info!(
            project_id = %config.project_id,
            topic_prefix = %config.topic_prefix,
            "Connected to Google Pub/Sub"
        );

        Ok(Self {
            client,
            config,
            exchanges: RwLock::new(HashMap::new()),
            publishers: RwLock::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            topics: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn ensure_topic(&self, topic_name: &str) -> Result<()> {
        let topic = self.client.topic(topic_name);
        let exists = topic.exists(None).await.map_err(|e| {
            TransportError::Unavailable(format!("Failed to check topic existence: {}", e))
        })?;
        if !exists {
            topic.create(None, None).await.map_err(|e| {
                TransportError::Unavailable(format!("Failed to create topic {}: {}", topic_name, e))
            })?;
            info!(topic = %topic_name, "Created Pub/Sub topic");
        }
        Ok(())
    }

    /// Get or create a publisher for a topic.
    async fn get_publisher(&self, topic_name: &str) -> Result<Publisher> {
        {
            let publishers = self.publishers.read().await;
            if let Some(publisher) = publishers.get(topic_name) {
                return Ok(publisher.clone());
            }
        }

        self.ensure_topic(topic_name).await?;
        let publisher = self.client.topic(topic_name).new_publisher(None);
        self.publishers
            .write()
            .await
            .insert(topic_name.to_string(), publisher.clone());
        Ok(publisher)
    }

    async fn ensure_subscription(&self, topic_name: &str, name: &str) -> Result<Subscription> {
        self.ensure_topic(topic_name).await?;
        let subscription = self.client.subscription(name);
        let exists = subscription.exists(None).await.map_err(|e| {
            TransportError::Subscribe(format!("Failed to check subscription existence: {}", e))
        })?;
        if !exists {
            let topic = self.client.topic(topic_name);
            subscription
                .create(topic.fully_qualified_name(), SubscriptionConfig::default(), None)
                .await
                .map_err(|e| {
                    TransportError::Subscribe(format!(
                        "Failed to create subscription {}: {}",
                        name, e
                    ))
                })?;
            info!(subscription = %name, topic = %topic_name, "Created Pub/Sub subscription");
        }
        Ok(subscription)
    }

    async fn send(&self, topic_name: &str, routing_key: &str, message: Message) -> std::result::Result<(), (String, Bytes)> {
        let publisher = match self.get_publisher(topic_name).await {
            Ok(publisher) => publisher,
            Err(e) => return Err((e.to_string(), message.payload)),
        };

        let pubsub_message = PubsubMessage {
            data: message.payload.to_vec(),
            attributes: to_attributes(routing_key, &message.properties),
            ..Default::default()
        };

        let awaiter = publisher.publish(pubsub_message).await;
        awaiter
            .get()
            .await
            .map(|_| ())
            .map_err(|e| (format!("Failed to publish to Pub/Sub: {}", e), message.payload))
    }

    async fn delete_subscription(&self, name: &str) {
        if let Err(e) = self.client.subscription(name).delete(None).await {
            debug!(subscription = %name, error = %e, "Subscription already gone");
        }
    }

    /// Pull loop for one queue consumer with exponential backoff on errors.
    async fn pull_loop(
        subscription: Subscription,
        route: Route,
        handler: Arc<dyn QueueHandler>,
        workers: ConsumerWorkers,
        cancel: CancellationToken,
    ) {
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();
        let mut backoff_iter = backoff_builder.build();

        loop {
            let pulled = tokio::select! {
                _ = cancel.cancelled() => return,
                pulled = subscription.pull(PULL_BATCH, None) => pulled,
            };

            match pulled {
                Ok(messages) => {
                    backoff_iter = backoff_builder.build();
                    for message in messages {
                        Self::dispatch(message, &route, &handler, &workers).await;
                    }
                }
                Err(e) => {
                    let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                    error!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        queue = %route.queue,
                        "Failed to pull messages from Pub/Sub, retrying after backoff"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn dispatch(
        message: ReceivedMessage,
        route: &Route,
        handler: &Arc<dyn QueueHandler>,
        workers: &ConsumerWorkers,
    ) {
        let attributes = &message.message.attributes;
        let routing_key = attributes
            .get(ROUTING_KEY_ATTR)
            .cloned()
            .unwrap_or_default();

        if !route.accepts(&routing_key) {
            // Ack to remove from subscription (not for this queue)
            let _ = message.ack().await;
            return;
        }

        let delivery = Arc::new(Delivery {
            exchange: route.exchange.clone(),
            routing_key,
            queue: route.queue.clone(),
            payload: Bytes::from(message.message.data.clone()),
            properties: from_attributes(attributes),
        });
        let handler = Arc::clone(handler);
        workers
            .spawn(async move {
                invoke_handler(&handler, delivery).await;
                if let Err(e) = message.ack().await {
                    error!(error = %e, "Failed to ack message");
                }
            })
            .await;
    }
}

#[async_trait]
impl TransportHandler for PubSubTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Pubsub
    }

    async fn declare_exchange(&self, exchange: &ExchangeDefinition) -> Result<()> {
        self.ensure_open()?;
        if exchange.name == DEFAULT_EXCHANGE {
            return Ok(());
        }
        self.ensure_topic(&self.config.exchange_topic(&exchange.name, ""))
            .await?;

        let mut exchanges = self.exchanges.write().await;
        match exchanges.get_mut(&exchange.name) {
            Some(held) => {
                for queue in &exchange.queues {
                    held.add_queue(queue.clone());
                }
            }
            None => {
                exchanges.insert(exchange.name.clone(), exchange.clone());
            }
        }
        debug!(exchange = %exchange.name, "Exchange declared");
        Ok(())
    }

    async fn tear_down_exchange(&self, exchange: &str) -> Result<()> {
        self.ensure_open()?;
        self.exchanges.write().await.remove(exchange);
        let topic_name = self.config.exchange_topic(exchange, "");
        self.publishers.write().await.remove(&topic_name);
        if let Err(e) = self.client.topic(&topic_name).delete(None).await {
            debug!(topic = %topic_name, error = %e, "Topic already gone");
        }
        info!(exchange = %exchange, "Exchange torn down");
        Ok(())
    }

    async fn start_consuming(
        &self,
        exchange: &str,
        queue: &str,
        options: ConsumerOptions,
        handler: Arc<dyn QueueHandler>,
    ) -> Result<ConsumerTag> {
        self.ensure_open()?;

        let route = if exchange == DEFAULT_EXCHANGE {
            Route {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                exchange_type: ExchangeType::Direct,
                definition: None,
            }
        } else {
            let exchanges = self.exchanges.read().await;
            let definition = exchanges
                .get(exchange)
                .ok_or_else(|| TransportError::UnknownExchange(exchange.to_string()))?;
            let queue_def = definition
                .queue(queue)
                .cloned()
                .ok_or_else(|| TransportError::UnknownQueue {
                    exchange: exchange.to_string(),
                    queue: queue.to_string(),
                })?;
            Route {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                exchange_type: definition.exchange_type,
                definition: Some(queue_def),
            }
        };

        let topic_name = self.config.exchange_topic(exchange, queue);
        let subscription_name = self
            .config
            .group_subscription(exchange, queue, &options.group);
        let subscription = self
            .ensure_subscription(&topic_name, &subscription_name)
            .await?;

        let tag = ConsumerTag::generate();
        let cancel = self.shutdown.child_token();
        let workers = ConsumerWorkers::new(options.concurrency);
        let task = tokio::spawn(Self::pull_loop(
            subscription,
            route,
            handler,
            workers.clone(),
            cancel.clone(),
        ));

        info!(
            exchange = %exchange,
            queue = %queue,
            subscription = %subscription_name,
            consumer = %tag,
            "Pub/Sub consumer started"
        );
        self.consumers.lock().await.insert(
            tag.clone(),
            ConsumerEntry {
                cancel,
                task,
                workers,
                owned_subscription: owned_subscription(exchange, &options, &subscription_name),
            },
        );
        Ok(tag)
    }

    async fn stop_consuming(&self, tag: &ConsumerTag) -> Result<()> {
        let entry = self.consumers.lock().await.remove(tag);
        match entry {
            Some(entry) => {
                entry.cancel.cancel();
                let _ = entry.task.await;
                entry.workers.drain().await;
                if let Some(name) = &entry.owned_subscription {
                    self.delete_subscription(name).await;
                }
                debug!(consumer = %tag, "Consumer stopped");
            }
            None => warn!(consumer = %tag, "Stop requested for unknown consumer"),
        }
        Ok(())
    }

    #[tracing::instrument(name = "pubsub.publish", skip_all, fields(exchange = %exchange, routing_key = %routing_key))]
    async fn publish(&self, exchange: &str, routing_key: &str, message: Message) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::publish_failed(
                exchange,
                routing_key,
                "transport closed",
                message.payload,
            ));
        }
        if exchange != DEFAULT_EXCHANGE && !self.exchanges.read().await.contains_key(exchange) {
            return Err(TransportError::publish_failed(
                exchange,
                routing_key,
                "exchange not declared",
                message.payload,
            ));
        }

        let topic_name = self.config.exchange_topic(exchange, routing_key);
        match self.send(&topic_name, routing_key, message).await {
            Ok(()) => {
                debug!(topic = %topic_name, "Published message");
                Ok(())
            }
            Err((reason, payload)) => {
                error!(error = %reason, "Publish failed");
                Err(TransportError::publish_failed(
                    exchange,
                    routing_key,
                    reason,
                    payload,
                ))
            }
        }
    }

    async fn publish_topic(&self, exchange: &str, topic: &str, payload: Bytes) -> Result<()> {
        let topic_name = self.config.topic_messages_topic(exchange);
        self.send(&topic_name, topic, Message::event(payload))
            .await
            .map_err(|(reason, payload)| {
                TransportError::publish_failed(exchange, topic, reason, payload)
            })
    }

    async fn subscribe_topic(
        &self,
        exchange: &str,
        topic: &str,
        handler: Arc<dyn TopicMessageHandler>,
    ) -> Result<TopicHandle> {
        self.ensure_open()?;

        let handle = TopicHandle::next();
        let topic_name = self.config.topic_messages_topic(exchange);
        let subscription_name = format!("{}-{}", topic_name, uuid::Uuid::new_v4());
        let subscription = self
            .ensure_subscription(&topic_name, &subscription_name)
            .await?;

        let cancel = self.shutdown.child_token();
        let loop_cancel = cancel.clone();
        let exchange_name = exchange.to_string();
        let pattern = topic.to_string();
        let task = tokio::spawn(async move {
            loop {
                let pulled = tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    pulled = subscription.pull(PULL_BATCH, None) => pulled,
                };
                let messages = match pulled {
                    Ok(messages) => messages,
                    Err(e) => {
                        error!(error = %e, "Topic pull failed");
                        tokio::select! {
                            _ = loop_cancel.cancelled() => break,
                            _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                        }
                    }
                };
                for message in messages {
                    let routing_key = message
                        .message
                        .attributes
                        .get(ROUTING_KEY_ATTR)
                        .cloned()
                        .unwrap_or_default();
                    if topic_matches(&pattern, &routing_key) {
                        let topic_message = TopicMessage {
                            exchange: exchange_name.clone(),
                            topic: pattern.clone(),
                            routing_key,
                            payload: Bytes::from(message.message.data.clone()),
                        };
                        deliver_topic(&handler, topic_message).await;
                    }
                    let _ = message.ack().await;
                }
            }
        });

        info!(exchange = %exchange, topic = %topic, subscription = %handle, "Topic subscription started");
        self.topics.lock().await.insert(
            handle,
            TopicEntry {
                cancel,
                task,
                subscription: subscription_name,
            },
        );
        Ok(handle)
    }

    async fn unsubscribe_topic(&self, handle: TopicHandle) -> Result<()> {
        let entry = self.topics.lock().await.remove(&handle);
        if let Some(entry) = entry {
            entry.cancel.cancel();
            let _ = entry.task.await;
            self.delete_subscription(&entry.subscription).await;
            debug!(subscription = %handle, "Topic subscription stopped");
        }
        Ok(())
    }

    async fn declare_private_queue(&self) -> Result<String> {
        self.ensure_open()?;
        let name = format!("private-{}", uuid::Uuid::new_v4());
        let topic_name = self.config.exchange_topic(DEFAULT_EXCHANGE, &name);
        let subscription_name = self.config.group_subscription(DEFAULT_EXCHANGE, &name, "");
        self.ensure_subscription(&topic_name, &subscription_name)
            .await?;
        Ok(name)
    }

    async fn delete_queue(&self, exchange: &str, queue: &str) -> Result<()> {
        if exchange == DEFAULT_EXCHANGE {
            let topic_name = self.config.exchange_topic(DEFAULT_EXCHANGE, queue);
            self.delete_subscription(&self.config.group_subscription(DEFAULT_EXCHANGE, queue, ""))
                .await;
            self.publishers.write().await.remove(&topic_name);
            if let Err(e) = self.client.topic(&topic_name).delete(None).await {
                debug!(topic = %topic_name, error = %e, "Topic already gone");
            }
            return Ok(());
        }

        // Group subscriptions of other processes are left to expire
        if let Some(definition) = self.exchanges.write().await.get_mut(exchange) {
            definition.remove_queue(queue);
        }
        debug!(exchange = %exchange, queue = %queue, "Queue deleted");
        Ok(())
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    async fn close(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.shutdown.cancel();

        let consumers: Vec<_> = self.consumers.lock().await.drain().collect();
        for (_, entry) in consumers {
            let _ = entry.task.await;
            entry.workers.drain().await;
            if let Some(name) = &entry.owned_subscription {
                self.delete_subscription(name).await;
            }
        }

        let topics: Vec<_> = self.topics.lock().await.drain().collect();
        for (_, entry) in topics {
            let _ = entry.task.await;
            self.delete_subscription(&entry.subscription).await;
        }

        let publishers: Vec<_> = self.publishers.write().await.drain().collect();
        for (_, mut publisher) in publishers {
            publisher.shutdown().await;
        }

        info!(project_id = %self.config.project_id, "Pub/Sub transport closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_settings() {
        let settings = TransportSettings::new(TransportKind::Pubsub)
            .with_option("project_id", "my-project")
            .with_option("topic_prefix", "myapp");

        let config = PubSubConfig::from_settings(&settings).unwrap();

        assert_eq!(config.project_id, "my-project");
        assert_eq!(config.topic_prefix, "myapp");
    }

    #[test]
    fn test_config_requires_project() {
        let settings = TransportSettings::new(TransportKind::Pubsub);

        let result = PubSubConfig::from_settings(&settings);

        assert!(matches!(result, Err(TransportError::Unavailable(_))));
    }

    #[test]
    fn test_resource_names() {
        let config = PubSubConfig::new("my-project");

        assert_eq!(config.exchange_topic("orders", "work"), "courier-orders");
        assert_eq!(config.exchange_topic("", "calc"), "courier-q-calc");
        assert_eq!(
            config.group_subscription("orders", "work", "workers"),
            "courier-orders-work-workers"
        );
        assert_eq!(config.topic_messages_topic("game/events"), "courier-game-events-topics");
    }

    #[test]
    fn test_only_ephemeral_groups_own_their_subscription() {
        let watcher = ConsumerOptions::group("watcher-1").ephemeral();
        let workers = ConsumerOptions::group("workers");

        assert_eq!(
            owned_subscription("orders", &watcher, "courier-orders-work-response-watcher-1"),
            Some("courier-orders-work-response-watcher-1".to_string())
        );
        assert_eq!(owned_subscription("orders", &workers, "courier-orders-work-workers"), None);
        assert_eq!(owned_subscription(DEFAULT_EXCHANGE, &watcher, "courier-q-replies"), None);
    }

    #[test]
    fn test_attributes_carry_properties() {
        let properties = MessageProperties {
            kind: MessageKind::Task,
            content_type: Some("application/json".to_string()),
            priority: 5,
            correlation_id: Some("work:1".to_string()),
            reply_to: None,
        };

        let attributes = to_attributes("work", &properties);

        assert_eq!(attributes.get(ROUTING_KEY_ATTR).map(String::as_str), Some("work"));
        assert_eq!(from_attributes(&attributes), properties);
    }

    #[test]
    fn test_route_filters_by_binding() {
        let route = Route {
            exchange: "orders".to_string(),
            queue: "work".to_string(),
            exchange_type: ExchangeType::Direct,
            definition: Some(QueueDefinition::routed_by_name("work")),
        };

        assert!(route.accepts("work"));
        assert!(!route.accepts("other"));
    }
}
