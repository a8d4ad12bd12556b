//! Transport layer for exchange, queue and topic delivery.
//!
//! This module contains:
//! - `TransportHandler` trait: per-backend exchange/queue lifecycle and raw send/receive
//! - `QueueHandler` / `TopicMessageHandler` traits: callbacks invoked per inbound message
//! - Message and delivery types shared by every backend
//! - `TransportFactory`: selects a backend from configuration
//! - Implementations: in-memory, AMQP (RabbitMQ), Google Pub/Sub, Mock

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::exchange::ExchangeDefinition;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub(crate) mod dispatch;
pub mod memory;
pub mod mock;
#[cfg(feature = "pubsub")]
pub mod pubsub;
pub mod routing;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpConfig, AmqpTransport};
pub use memory::{MemoryBroker, MemoryTransport};
pub use mock::MockTransport;
#[cfg(feature = "pubsub")]
pub use pubsub::{PubSubConfig, PubSubTransport};

/// Name of the default exchange. Publishing to it routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

// ============================================================================
// Errors
// ============================================================================

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connection or setup failure. Fatal for the domain until reconfigured.
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    /// Send-time failure. Carries the original payload so the caller can retry.
    #[error("Publish to '{exchange}' with key '{routing_key}' failed: {message}")]
    PublishFailed {
        exchange: String,
        routing_key: String,
        message: String,
        payload: Bytes,
    },

    #[error("Exchange '{0}' is not declared")]
    UnknownExchange(String),

    #[error("Exchange '{exchange}' is already declared as {existing}")]
    ExchangeConflict { exchange: String, existing: String },

    #[error("Queue '{queue}' is not declared on exchange '{exchange}'")]
    UnknownQueue { exchange: String, queue: String },

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Build a `PublishFailed` error that hands the payload back to the caller.
    pub fn publish_failed(
        exchange: &str,
        routing_key: &str,
        message: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        Self::PublishFailed {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message: message.into(),
            payload,
        }
    }

    /// The payload of a failed publish, if this is a `PublishFailed` error.
    pub fn failed_payload(&self) -> Option<&Bytes> {
        match self {
            Self::PublishFailed { payload, .. } => Some(payload),
            _ => None,
        }
    }
}

/// Errors raised by message handlers.
///
/// These never propagate to the publisher. The consumer loop logs them and
/// still acknowledges the message.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Handler failed: {0}")]
    Failed(String),

    #[error("Malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Subscriber does not handle {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ============================================================================
// Messages
// ============================================================================

/// What a message carries. Travels as the AMQP `type` property or a Pub/Sub attribute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Opaque broadcast payload, delivered to `handle_event`.
    #[default]
    Event,
    /// Task envelope, delivered to `handle_task`.
    Task,
    /// Task status document travelling back to the publisher.
    TaskResponse,
    /// RPC request envelope.
    RpcRequest,
    /// RPC reply payload.
    RpcReply,
    /// RPC reply describing a handler failure.
    RpcFault,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::Task => "task",
            Self::TaskResponse => "task-response",
            Self::RpcRequest => "rpc-request",
            Self::RpcReply => "rpc-reply",
            Self::RpcFault => "rpc-fault",
        }
    }

    /// Parse a wire value. Unknown values are treated as events.
    pub fn parse(value: &str) -> Self {
        match value {
            "task" => Self::Task,
            "task-response" => Self::TaskResponse,
            "rpc-request" => Self::RpcRequest,
            "rpc-reply" => Self::RpcReply,
            "rpc-fault" => Self::RpcFault,
            _ => Self::Event,
        }
    }
}

/// Metadata carried alongside a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub kind: MessageKind,
    pub content_type: Option<String>,
    pub priority: u8,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

/// An outbound message.
#[derive(Debug, Clone)]
pub struct Message {
    pub payload: Bytes,
    pub properties: MessageProperties,
}

impl Message {
    /// A plain event message.
    pub fn event(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            properties: MessageProperties::default(),
        }
    }

    /// A message of the given kind.
    pub fn of_kind(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            properties: MessageProperties {
                kind,
                ..Default::default()
            },
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.properties.content_type = Some(content_type.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.properties.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.properties.reply_to = Some(reply_to.into());
        self
    }
}

/// An inbound message handed to a `QueueHandler`.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key used at publish time.
    pub routing_key: String,
    /// Logical queue the consumer was registered on.
    pub queue: String,
    pub payload: Bytes,
    pub properties: MessageProperties,
}

/// A topic message handed to a `TopicMessageHandler`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMessage {
    pub exchange: String,
    /// Topic pattern the subscription was registered with.
    pub topic: String,
    /// Routing key the publisher actually used.
    pub routing_key: String,
    pub payload: Bytes,
}

// ============================================================================
// Handler traits
// ============================================================================

/// Handler invoked once per message delivered to a queue consumer.
pub trait QueueHandler: Send + Sync {
    /// Process a delivery. Errors are logged by the consumer loop; the message
    /// is acknowledged regardless.
    fn handle(&self, delivery: Arc<Delivery>)
        -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

/// Adapter turning an async closure into a `QueueHandler`.
pub struct FnQueueHandler<F>(F);

impl<F, Fut> QueueHandler for FnQueueHandler<F>
where
    F: Fn(Arc<Delivery>) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    fn handle(
        &self,
        delivery: Arc<Delivery>,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        Box::pin((self.0)(delivery))
    }
}

/// Wrap an async closure as a shareable `QueueHandler`.
pub fn queue_handler_fn<F, Fut>(f: F) -> Arc<dyn QueueHandler>
where
    F: Fn(Arc<Delivery>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnQueueHandler(f))
}

/// Listener for topic messages.
#[async_trait]
pub trait TopicMessageHandler: Send + Sync {
    async fn deliver_message(&self, message: TopicMessage);
}

// ============================================================================
// Consumers and subscriptions
// ============================================================================

/// Identifies a running queue consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerTag(pub String);

impl ConsumerTag {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ConsumerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a running topic subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TopicHandle(pub u64);

impl TopicHandle {
    /// Allocate a handle unique within this process.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TopicHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "topic-{}", self.0)
    }
}

/// Options for a queue consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Competing-consumer group. Consumers sharing a group on the same queue
    /// split the messages; distinct groups each receive every message.
    pub group: String,
    /// Maximum number of handler callbacks running at once for this consumer.
    pub concurrency: usize,
    /// The group lives only as long as its members: when the last one stops,
    /// the backend removes the group and whatever it still buffers.
    pub ephemeral: bool,
}

impl ConsumerOptions {
    pub fn group(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            concurrency: 1,
            ephemeral: false,
        }
    }

    /// Mark the group as ephemeral.
    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

// ============================================================================
// Transport trait
// ============================================================================

/// Interface every backend adapter satisfies.
///
/// Implementations:
/// - `MemoryTransport`: in-process broker, also the reference semantics
/// - `AmqpTransport`: RabbitMQ via AMQP
/// - `PubSubTransport`: Google Cloud Pub/Sub
/// - `MockTransport`: records publishes for testing
///
/// Connections are established by each backend's `connect` constructor,
/// selected through `TransportFactory`.
#[async_trait]
pub trait TransportHandler: Send + Sync {
    /// Backend discriminator.
    fn kind(&self) -> TransportKind;

    /// Declare an exchange and (re)apply its queue bindings.
    ///
    /// Idempotent: declaring the same exchange twice is a no-op apart from
    /// binding queues added since the first declaration.
    async fn declare_exchange(&self, exchange: &ExchangeDefinition) -> Result<()>;

    /// Remove an exchange and its queues. A later declaration recreates it.
    async fn tear_down_exchange(&self, exchange: &str) -> Result<()>;

    /// Start a consumer on a queue. The handler is invoked once per message
    /// delivered to this consumer's group; the adapter acknowledges after the
    /// callback returns, whether or not it succeeded.
    async fn start_consuming(
        &self,
        exchange: &str,
        queue: &str,
        options: ConsumerOptions,
        handler: Arc<dyn QueueHandler>,
    ) -> Result<ConsumerTag>;

    /// Stop a consumer, waiting for its in-flight callbacks to finish.
    async fn stop_consuming(&self, tag: &ConsumerTag) -> Result<()>;

    /// Best-effort send. Failures return `PublishFailed` with the payload; no
    /// retry is performed.
    async fn publish(&self, exchange: &str, routing_key: &str, message: Message) -> Result<()>;

    /// Publish a fire-and-forget topic message.
    async fn publish_topic(&self, exchange: &str, topic: &str, payload: Bytes) -> Result<()>;

    /// Start a dedicated receive loop bound to a topic pattern.
    async fn subscribe_topic(
        &self,
        exchange: &str,
        topic: &str,
        handler: Arc<dyn TopicMessageHandler>,
    ) -> Result<TopicHandle>;

    /// Stop a topic subscription and delete its private queue.
    async fn unsubscribe_topic(&self, handle: TopicHandle) -> Result<()>;

    /// Declare a private queue on the default exchange with a generated name.
    async fn declare_private_queue(&self) -> Result<String>;

    /// Delete a queue. Use `DEFAULT_EXCHANGE` for private queues.
    async fn delete_queue(&self, exchange: &str, queue: &str) -> Result<()>;

    /// Token cancelled when the transport shuts down.
    fn shutdown_token(&self) -> CancellationToken;

    /// Stop every consumer and release the connection.
    async fn close(&self) -> Result<()>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Transport type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process broker.
    #[default]
    Memory,
    /// AMQP/RabbitMQ.
    #[serde(alias = "rabbitmq")]
    Amqp,
    /// Google Cloud Pub/Sub.
    #[serde(alias = "gcp")]
    Pubsub,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Amqp => "amqp",
            Self::Pubsub => "pubsub",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "amqp" | "rabbitmq" => Ok(Self::Amqp),
            "pubsub" | "gcp" => Ok(Self::Pubsub),
            other => Err(TransportError::Unavailable(format!(
                "Unknown transport type '{}'",
                other
            ))),
        }
    }
}

/// Per-domain transport settings.
///
/// `options` is an opaque string map; each backend parses the keys it needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    #[serde(rename = "transport")]
    pub kind: TransportKind,
    #[serde(rename = "settings")]
    pub options: HashMap<String, String>,
}

impl TransportSettings {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            options: HashMap::new(),
        }
    }

    pub fn memory() -> Self {
        Self::new(TransportKind::Memory)
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Creates transport connections from settings.
///
/// Every `connect` call yields a fresh connection. In-memory connections made
/// by the same factory share one `MemoryBroker`, so several registries can
/// talk to each other the way separate processes share a real broker.
#[derive(Clone, Default)]
pub struct TransportFactory {
    memory_broker: MemoryBroker,
}

impl TransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing in-memory broker for `memory` domains.
    pub fn with_memory_broker(broker: MemoryBroker) -> Self {
        Self {
            memory_broker: broker,
        }
    }

    pub fn memory_broker(&self) -> &MemoryBroker {
        &self.memory_broker
    }

    /// Connect to the backend named by `settings.kind`.
    ///
    /// Requires the corresponding feature to be enabled:
    /// - AMQP: `--features amqp`
    /// - Pub/Sub: `--features pubsub`
    pub async fn connect(&self, settings: &TransportSettings) -> Result<Arc<dyn TransportHandler>> {
        match settings.kind {
            TransportKind::Memory => {
                let transport = MemoryTransport::connect(&self.memory_broker);
                info!(transport = "memory", "Transport connected");
                Ok(Arc::new(transport))
            }
            TransportKind::Amqp => {
                #[cfg(feature = "amqp")]
                {
                    let transport = AmqpTransport::connect(AmqpConfig::from_settings(settings)).await?;
                    info!(transport = "amqp", "Transport connected");
                    Ok(Arc::new(transport))
                }

                #[cfg(not(feature = "amqp"))]
                {
                    Err(TransportError::Unavailable(
                        "AMQP support requires the 'amqp' feature. Rebuild with --features amqp"
                            .to_string(),
                    ))
                }
            }
            TransportKind::Pubsub => {
                #[cfg(feature = "pubsub")]
                {
                    let transport =
                        PubSubTransport::connect(PubSubConfig::from_settings(settings)?).await?;
                    info!(transport = "pubsub", "Transport connected");
                    Ok(Arc::new(transport))
                }

                #[cfg(not(feature = "pubsub"))]
                {
                    Err(TransportError::Unavailable(
                        "Pub/Sub support requires the 'pubsub' feature. Rebuild with --features pubsub"
                            .to_string(),
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_from_str() {
        assert_eq!("memory".parse::<TransportKind>().unwrap(), TransportKind::Memory);
        assert_eq!("RabbitMQ".parse::<TransportKind>().unwrap(), TransportKind::Amqp);
        assert_eq!("pubsub".parse::<TransportKind>().unwrap(), TransportKind::Pubsub);
        assert!(matches!(
            "carrier-pigeon".parse::<TransportKind>(),
            Err(TransportError::Unavailable(_))
        ));
    }

    #[test]
    fn test_message_kind_wire_values() {
        for kind in [
            MessageKind::Event,
            MessageKind::Task,
            MessageKind::TaskResponse,
            MessageKind::RpcRequest,
            MessageKind::RpcReply,
            MessageKind::RpcFault,
        ] {
            assert_eq!(MessageKind::parse(kind.as_str()), kind);
        }
        assert_eq!(MessageKind::parse("something-else"), MessageKind::Event);
    }

    #[test]
    fn test_settings_option_ignores_blank_values() {
        let settings = TransportSettings::memory()
            .with_option("url", "  ")
            .with_option("prefix", "orders");
        assert_eq!(settings.option("url"), None);
        assert_eq!(settings.option("prefix"), Some("orders"));
        assert_eq!(settings.option("missing"), None);
    }

    #[test]
    fn test_publish_failed_returns_payload() {
        let err = TransportError::publish_failed("ex", "key", "boom", Bytes::from_static(b"body"));
        assert_eq!(err.failed_payload(), Some(&Bytes::from_static(b"body")));
        assert!(TransportError::Closed.failed_payload().is_none());
    }

    #[cfg(not(feature = "amqp"))]
    #[tokio::test]
    async fn test_factory_rejects_disabled_backend() {
        let factory = TransportFactory::new();
        let result = factory
            .connect(&TransportSettings::new(TransportKind::Amqp))
            .await;
        assert!(matches!(result, Err(TransportError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_factory_memory_connections_share_broker() {
        let factory = TransportFactory::new();
        let first = factory.connect(&TransportSettings::memory()).await.unwrap();
        let second = factory.connect(&TransportSettings::memory()).await.unwrap();
        assert_eq!(first.kind(), TransportKind::Memory);

        let queue = first.declare_private_queue().await.unwrap();
        assert!(factory.memory_broker().has_queue(DEFAULT_EXCHANGE, &queue).await);
        second.delete_queue(DEFAULT_EXCHANGE, &queue).await.unwrap();
        assert!(!factory.memory_broker().has_queue(DEFAULT_EXCHANGE, &queue).await);
    }
}
