//! AMQP (RabbitMQ) transport.
//!
//! Topology mapping:
//! - An `ExchangeDefinition` becomes a durable AMQP exchange of the same type.
//! - Each competing-consumer group on a logical queue gets its own durable
//!   AMQP queue `{exchange}-{queue}.{group}`, bound with the queue's route
//!   bindings. Members of a group share that queue; groups each get a copy.
//!   Ephemeral groups get a non-durable auto-delete queue with an expiry,
//!   deleted when their consumer stops.
//! - The default exchange routes by queue name, so RPC queues are consumed
//!   directly by name.
//! - Topic messages go through a separate topic exchange `{exchange}.topics`;
//!   each subscription binds a server-named auto-delete queue to its pattern.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use bytes::Bytes;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, ConnectionProperties, ExchangeKind,
};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatch::{deliver_topic, invoke_handler, ConsumerWorkers};
use super::{
    ConsumerOptions, ConsumerTag, Delivery, Message, MessageKind, MessageProperties,
    QueueHandler, Result, TopicHandle, TopicMessage, TopicMessageHandler, TransportError,
    TransportHandler, TransportKind, TransportSettings, DEFAULT_EXCHANGE,
};
use crate::exchange::{ExchangeDefinition, ExchangeType, QueueDefinition};

const DEFAULT_URL: &str = "amqp://localhost:5672";
const DEFAULT_POOL_SIZE: usize = 10;
/// Unused ephemeral group queues are removed by the broker after this long.
const EPHEMERAL_QUEUE_EXPIRY_MS: u32 = 60_000;

/// Configuration for AMQP connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AmqpConfig {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// Maximum pooled connections.
    pub pool_size: usize,
}

impl AmqpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool_size: DEFAULT_POOL_SIZE,
        }
    }

    /// Read `url` and `pool_size` from domain settings.
    pub fn from_settings(settings: &TransportSettings) -> Self {
        let url = settings.option("url").unwrap_or(DEFAULT_URL).to_string();
        let pool_size = settings
            .option("pool_size")
            .and_then(|v| v.parse().ok())
            .filter(|n: &usize| *n > 0)
            .unwrap_or(DEFAULT_POOL_SIZE);
        Self { url, pool_size }
    }
}

fn exchange_kind(exchange_type: ExchangeType) -> ExchangeKind {
    match exchange_type {
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Topic => ExchangeKind::Topic,
    }
}

/// AMQP queue backing one consumer group of a logical queue.
fn group_queue_name(underlying: &str, group: &str) -> String {
    format!("{}.{}", underlying, group)
}

fn topic_exchange_name(exchange: &str) -> String {
    format!("{}.topics", exchange)
}

/// Route keys a queue is bound with. A queue with no bindings catches the empty key.
fn binding_keys(queue: &QueueDefinition) -> Vec<String> {
    if queue.bindings.is_empty() {
        vec![String::new()]
    } else {
        queue.bindings.clone()
    }
}

fn to_amqp_properties(properties: &MessageProperties) -> BasicProperties {
    let mut amqp = BasicProperties::default()
        .with_kind(properties.kind.as_str().into())
        .with_delivery_mode(2); // persistent
    if let Some(content_type) = &properties.content_type {
        amqp = amqp.with_content_type(content_type.as_str().into());
    }
    if properties.priority > 0 {
        amqp = amqp.with_priority(properties.priority);
    }
    if let Some(correlation_id) = &properties.correlation_id {
        amqp = amqp.with_correlation_id(correlation_id.as_str().into());
    }
    if let Some(reply_to) = &properties.reply_to {
        amqp = amqp.with_reply_to(reply_to.as_str().into());
    }
    amqp
}

fn from_amqp_properties(amqp: &BasicProperties) -> MessageProperties {
    MessageProperties {
        kind: amqp
            .kind()
            .as_ref()
            .map(|k| MessageKind::parse(k.as_str()))
            .unwrap_or_default(),
        content_type: amqp.content_type().as_ref().map(|v| v.as_str().to_string()),
        priority: amqp.priority().unwrap_or(0),
        correlation_id: amqp
            .correlation_id()
            .as_ref()
            .map(|v| v.as_str().to_string()),
        reply_to: amqp.reply_to().as_ref().map(|v| v.as_str().to_string()),
    }
}

/// Where a consumer reads from and how its queue is (re)declared.
#[derive(Clone, Debug)]
struct ConsumerBinding {
    exchange: String,
    /// Logical queue name handed to the handler.
    queue: String,
    /// AMQP queue name.
    amqp_queue: String,
    /// Route keys; empty for the default exchange.
    keys: Vec<String>,
    prefetch: u16,
    ephemeral: bool,
}

impl ConsumerBinding {
    fn queue_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            durable: self.exchange != DEFAULT_EXCHANGE && !self.ephemeral,
            auto_delete: self.ephemeral,
            ..Default::default()
        }
    }

    fn queue_arguments(&self) -> FieldTable {
        let mut arguments = FieldTable::default();
        // Default-exchange queues are declared elsewhere; their arguments must match.
        if self.ephemeral && self.exchange != DEFAULT_EXCHANGE {
            arguments.insert(
                "x-expires".into(),
                AMQPValue::LongUInt(EPHEMERAL_QUEUE_EXPIRY_MS),
            );
        }
        arguments
    }

    /// Queue to delete when the consumer stops.
    fn owned_queue(&self) -> Option<String> {
        (self.ephemeral && self.exchange != DEFAULT_EXCHANGE).then(|| self.amqp_queue.clone())
    }
}

struct ConsumerEntry {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    workers: ConsumerWorkers,
    owned_queue: Option<String>,
}

struct TopicEntry {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    amqp_queue: String,
}

#[derive(Default)]
struct Topology {
    exchanges: HashMap<String, ExchangeDefinition>,
    /// Underlying names of anonymous queues, keyed by (exchange, logical name).
    anonymous: HashMap<(String, String), String>,
    /// Group queues declared through this connection, per (exchange, logical queue).
    groups: HashMap<(String, String), HashSet<String>>,
    topic_exchanges: HashSet<String>,
}

impl Topology {
    fn underlying(&mut self, exchange: &str, queue: &QueueDefinition) -> String {
        if queue.is_anonymous() {
            return self
                .anonymous
                .entry((exchange.to_string(), queue.name.clone()))
                .or_insert_with(|| format!("{}-anon-{}", exchange, uuid::Uuid::new_v4()))
                .clone();
        }
        format!("{}-{}", exchange, queue.name)
    }

    /// Whether publishing to `exchange` through this connection can route.
    fn knows_exchange(&self, exchange: &str) -> bool {
        exchange == DEFAULT_EXCHANGE
            || self.exchanges.contains_key(exchange)
            || self.topic_exchanges.contains(exchange)
    }
}

/// AMQP transport using RabbitMQ.
pub struct AmqpTransport {
    pool: Pool,
    config: AmqpConfig,
    topology: RwLock<Topology>,
    consumers: Mutex<HashMap<ConsumerTag, ConsumerEntry>>,
    topics: Mutex<HashMap<TopicHandle, TopicEntry>>,
    shutdown: CancellationToken,
}

impl AmqpTransport {
    /// Connect to the broker. Fails with `Unavailable` if no connection can be made.
    pub async fn connect(config: AmqpConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), ConnectionProperties::default());
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| TransportError::Unavailable(format!("Failed to create pool: {}", e)))?;

        // Verify connection
        let conn = pool
            .get()
            .await
            .map_err(|e| TransportError::Unavailable(format!("Failed to connect: {}", e)))?;
        drop(conn);

        info!(url = %config.url, "Connected to AMQP");

        Ok(Self {
            pool,
            config,
            topology: RwLock::new(Topology::default()),
            consumers: Mutex::new(HashMap::new()),
            topics: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &AmqpConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    /// Get a channel from the pool.
    async fn get_channel(&self) -> Result<Channel> {
        open_channel(&self.pool).await
    }

    async fn declare_group_queue(channel: &Channel, binding: &ConsumerBinding) -> Result<()> {
        channel
            .queue_declare(
                &binding.amqp_queue,
                binding.queue_options(),
                binding.queue_arguments(),
            )
            .await
            .map_err(|e| TransportError::Subscribe(format!("Failed to declare queue: {}", e)))?;

        for key in &binding.keys {
            channel
                .queue_bind(
                    &binding.amqp_queue,
                    &binding.exchange,
                    key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| TransportError::Subscribe(format!("Failed to bind queue: {}", e)))?;
        }
        Ok(())
    }

    /// Set up consumer channel, queue, and bindings.
    async fn setup_consumer(
        pool: &Pool,
        binding: &ConsumerBinding,
        tag: &ConsumerTag,
    ) -> Result<lapin::Consumer> {
        let channel = open_channel(pool).await?;
        Self::declare_group_queue(&channel, binding).await?;

        channel
            .basic_qos(binding.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| TransportError::Subscribe(format!("Failed to set prefetch: {}", e)))?;

        channel
            .basic_consume(
                &binding.amqp_queue,
                &tag.0,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Subscribe(format!("Failed to start consumer: {}", e)))
    }

    /// Consumer loop with automatic reconnection and exponential backoff with jitter.
    async fn consume_with_reconnect(
        pool: Pool,
        binding: ConsumerBinding,
        tag: ConsumerTag,
        handler: Arc<dyn QueueHandler>,
        workers: ConsumerWorkers,
        cancel: CancellationToken,
    ) {
        // Exponential backoff with jitter to prevent thundering herd
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();

        let mut backoff_iter = backoff_builder.build();

        loop {
            let setup = tokio::select! {
                _ = cancel.cancelled() => return,
                setup = Self::setup_consumer(&pool, &binding, &tag) => setup,
            };

            match setup {
                Ok(mut consumer) => {
                    info!(queue = %binding.amqp_queue, consumer = %tag, "Consumer connected, processing messages");
                    backoff_iter = backoff_builder.build();

                    loop {
                        let next = tokio::select! {
                            _ = cancel.cancelled() => return,
                            next = consumer.next() => next,
                        };
                        match next {
                            Some(Ok(delivery)) => {
                                let handler = Arc::clone(&handler);
                                let binding = binding.clone();
                                workers
                                    .spawn(async move {
                                        process_delivery(delivery, &binding, &handler).await;
                                    })
                                    .await;
                            }
                            Some(Err(e)) => {
                                error!(error = %e, "Consumer delivery error, will reconnect");
                                break;
                            }
                            None => break,
                        }
                    }

                    info!(queue = %binding.amqp_queue, "Consumer stream ended, reconnecting...");
                }
                Err(e) => {
                    let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                    error!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        queue = %binding.amqp_queue,
                        "Failed to set up consumer, retrying after backoff"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            }

            // Brief pause before reconnecting after stream end (not error)
            let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn ensure_topic_exchange(&self, exchange: &str) -> Result<String> {
        let name = topic_exchange_name(exchange);
        if self.topology.read().await.topic_exchanges.contains(&name) {
            return Ok(name);
        }
        let channel = self.get_channel().await?;
        channel
            .exchange_declare(
                &name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                TransportError::Unavailable(format!("Failed to declare topic exchange: {}", e))
            })?;
        self.topology
            .write()
            .await
            .topic_exchanges
            .insert(name.clone());
        Ok(name)
    }

    async fn stop_entry(tag: &ConsumerTag, entry: ConsumerEntry) {
        entry.cancel.cancel();
        let _ = entry.task.await;
        entry.workers.drain().await;
        debug!(consumer = %tag, "Consumer stopped");
    }

    /// Delete an ephemeral group queue. Failure only delays removal until the
    /// queue's expiry.
    async fn delete_owned_queue(&self, amqp_queue: &str) {
        match self.delete_amqp_queue(amqp_queue).await {
            Ok(()) => debug!(queue = %amqp_queue, "Ephemeral queue deleted"),
            Err(e) => debug!(queue = %amqp_queue, error = %e, "Ephemeral queue left to expire"),
        }
    }

    async fn delete_amqp_queue(&self, amqp_queue: &str) -> Result<()> {
        let channel = self.get_channel().await?;
        channel
            .queue_delete(amqp_queue, QueueDeleteOptions::default())
            .await
            .map_err(|e| TransportError::Subscribe(format!("Failed to delete queue: {}", e)))?;
        Ok(())
    }
}

async fn open_channel(pool: &Pool) -> Result<Channel> {
    let conn = pool.get().await.map_err(|e: PoolError| {
        TransportError::Unavailable(format!("Failed to get connection from pool: {}", e))
    })?;

    conn.create_channel()
        .await
        .map_err(|e| TransportError::Unavailable(format!("Failed to create channel: {}", e)))
}

/// Run the handler for one delivery, then acknowledge it regardless of outcome.
async fn process_delivery(
    delivery: lapin::message::Delivery,
    binding: &ConsumerBinding,
    handler: &Arc<dyn QueueHandler>,
) {
    let inbound = Arc::new(Delivery {
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        queue: binding.queue.clone(),
        payload: Bytes::from(delivery.data.clone()),
        properties: from_amqp_properties(&delivery.properties),
    });

    invoke_handler(handler, inbound).await;

    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
        error!(error = %e, "Failed to ack message");
    }
}

#[async_trait]
impl TransportHandler for AmqpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Amqp
    }

    async fn declare_exchange(&self, exchange: &ExchangeDefinition) -> Result<()> {
        self.ensure_open()?;
        if exchange.name == DEFAULT_EXCHANGE {
            return Ok(());
        }

        let channel = self.get_channel().await?;
        channel
            .exchange_declare(
                &exchange.name,
                exchange_kind(exchange.exchange_type),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                TransportError::Unavailable(format!(
                    "Failed to declare exchange '{}': {}",
                    exchange.name, e
                ))
            })?;

        // Re-apply bindings to group queues already consumed through this connection
        let rebinds: Vec<ConsumerBinding> = {
            let mut topology = self.topology.write().await;
            let merged = match topology.exchanges.remove(&exchange.name) {
                Some(mut held) => {
                    for queue in &exchange.queues {
                        held.add_queue(queue.clone());
                    }
                    held
                }
                None => exchange.clone(),
            };
            let mut rebinds = Vec::new();
            for queue in &merged.queues {
                let underlying = topology.underlying(&merged.name, queue);
                let key = (merged.name.clone(), queue.name.clone());
                for group in topology.groups.get(&key).into_iter().flatten() {
                    rebinds.push(ConsumerBinding {
                        exchange: merged.name.clone(),
                        queue: queue.name.clone(),
                        amqp_queue: group_queue_name(&underlying, group),
                        keys: binding_keys(queue),
                        prefetch: 1,
                        ephemeral: false,
                    });
                }
            }
            topology.exchanges.insert(merged.name.clone(), merged);
            rebinds
        };
        for binding in &rebinds {
            Self::declare_group_queue(&channel, binding).await?;
        }

        debug!(exchange = %exchange.name, queues = exchange.queues.len(), "Exchange declared");
        Ok(())
    }

    async fn tear_down_exchange(&self, exchange: &str) -> Result<()> {
        self.ensure_open()?;
        if exchange == DEFAULT_EXCHANGE {
            return Ok(());
        }

        let group_queues: Vec<String> = {
            let mut topology = self.topology.write().await;
            let Some(definition) = topology.exchanges.remove(exchange) else {
                return Ok(());
            };
            let mut names = Vec::new();
            for queue in &definition.queues {
                let underlying = topology.underlying(exchange, queue);
                let key = (exchange.to_string(), queue.name.clone());
                if let Some(groups) = topology.groups.remove(&key) {
                    names.extend(groups.iter().map(|g| group_queue_name(&underlying, g)));
                }
                topology.anonymous.remove(&key);
            }
            names
        };

        for name in group_queues {
            self.delete_amqp_queue(&name).await?;
        }
        let channel = self.get_channel().await?;
        channel
            .exchange_delete(exchange, ExchangeDeleteOptions::default())
            .await
            .map_err(|e| {
                TransportError::Unavailable(format!("Failed to delete exchange: {}", e))
            })?;
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

        let prefetch = u16::try_from(options.concurrency).unwrap_or(u16::MAX);
        let binding = if exchange == DEFAULT_EXCHANGE {
            // Default exchange: the queue is addressed by name, groups do not apply
            ConsumerBinding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                amqp_queue: queue.to_string(),
                keys: Vec::new(),
                prefetch,
                ephemeral: options.ephemeral,
            }
        } else {
            let mut topology = self.topology.write().await;
            let definition = topology
                .exchanges
                .get(exchange)
                .ok_or_else(|| TransportError::UnknownExchange(exchange.to_string()))?;
            let queue_def = definition
                .queue(queue)
                .cloned()
                .ok_or_else(|| TransportError::UnknownQueue {
                    exchange: exchange.to_string(),
                    queue: queue.to_string(),
                })?;
            let underlying = topology.underlying(exchange, &queue_def);
            // Ephemeral groups are not re-bound on redeclare; they die with their consumer
            if !options.ephemeral {
                topology
                    .groups
                    .entry((exchange.to_string(), queue.to_string()))
                    .or_default()
                    .insert(options.group.clone());
            }
            ConsumerBinding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                amqp_queue: group_queue_name(&underlying, &options.group),
                keys: binding_keys(&queue_def),
                prefetch,
                ephemeral: options.ephemeral,
            }
        };

        // Declare up front so messages published right after this returns are kept
        let channel = self.get_channel().await?;
        Self::declare_group_queue(&channel, &binding).await?;

        let tag = ConsumerTag::generate();
        let cancel = self.shutdown.child_token();
        let workers = ConsumerWorkers::new(options.concurrency);
        let task = tokio::spawn(Self::consume_with_reconnect(
            self.pool.clone(),
            binding.clone(),
            tag.clone(),
            handler,
            workers.clone(),
            cancel.clone(),
        ));

        info!(
            exchange = %exchange,
            queue = %queue,
            amqp_queue = %binding.amqp_queue,
            group = %options.group,
            consumer = %tag,
            "AMQP consumer started"
        );
        self.consumers.lock().await.insert(
            tag.clone(),
            ConsumerEntry {
                cancel,
                task,
                workers,
                owned_queue: binding.owned_queue(),
            },
        );
        Ok(tag)
    }

    async fn stop_consuming(&self, tag: &ConsumerTag) -> Result<()> {
        let entry = self.consumers.lock().await.remove(tag);
        match entry {
            Some(entry) => {
                let owned_queue = entry.owned_queue.clone();
                Self::stop_entry(tag, entry).await;
                if let Some(name) = owned_queue {
                    self.delete_owned_queue(&name).await;
                }
            }
            None => warn!(consumer = %tag, "Stop requested for unknown consumer"),
        }
        Ok(())
    }

    #[tracing::instrument(name = "amqp.publish", skip_all, fields(exchange = %exchange, routing_key = %routing_key))]
    async fn publish(&self, exchange: &str, routing_key: &str, message: Message) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::publish_failed(
                exchange,
                routing_key,
                "transport closed",
                message.payload,
            ));
        }

        // No publisher confirms: a missing exchange is only caught here.
        if !self.topology.read().await.knows_exchange(exchange) {
            return Err(TransportError::publish_failed(
                exchange,
                routing_key,
                "exchange not declared",
                message.payload,
            ));
        }

        let channel = match self.get_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                return Err(TransportError::publish_failed(
                    exchange,
                    routing_key,
                    e.to_string(),
                    message.payload,
                ))
            }
        };

        let properties = to_amqp_properties(&message.properties);
        let outcome = match channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await
        {
            Ok(confirm) => confirm
                .await
                .map(|_| ())
                .map_err(|e| format!("Publish confirmation failed: {}", e)),
            Err(e) => Err(format!("Failed to publish: {}", e)),
        };

        match outcome {
            Ok(()) => {
                debug!(kind = message.properties.kind.as_str(), "Published message");
                Ok(())
            }
            Err(reason) => {
                error!(error = %reason, "Publish failed");
                Err(TransportError::publish_failed(
                    exchange,
                    routing_key,
                    reason,
                    message.payload,
                ))
            }
        }
    }

    async fn publish_topic(&self, exchange: &str, topic: &str, payload: Bytes) -> Result<()> {
        let topic_exchange = match self.ensure_topic_exchange(exchange).await {
            Ok(name) => name,
            Err(e) => {
                return Err(TransportError::publish_failed(
                    exchange,
                    topic,
                    e.to_string(),
                    payload,
                ))
            }
        };
        self.publish(&topic_exchange, topic, Message::event(payload))
            .await
            .map_err(|e| match e {
                TransportError::PublishFailed {
                    message, payload, ..
                } => TransportError::publish_failed(exchange, topic, message, payload),
                other => other,
            })
    }

    async fn subscribe_topic(
        &self,
        exchange: &str,
        topic: &str,
        handler: Arc<dyn TopicMessageHandler>,
    ) -> Result<TopicHandle> {
        self.ensure_open()?;
        let topic_exchange = self.ensure_topic_exchange(exchange).await?;

        let channel = self.get_channel().await?;
        let declared = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Subscribe(format!("Failed to declare queue: {}", e)))?;
        let amqp_queue = declared.name().as_str().to_string();

        channel
            .queue_bind(
                &amqp_queue,
                &topic_exchange,
                topic,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Subscribe(format!("Failed to bind queue: {}", e)))?;

        let handle = TopicHandle::next();
        let mut consumer = channel
            .basic_consume(
                &amqp_queue,
                &handle.to_string(),
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        let cancel = self.shutdown.child_token();
        let loop_cancel = cancel.clone();
        let exchange_name = exchange.to_string();
        let pattern = topic.to_string();
        let task = tokio::spawn(async move {
            // The channel owns the exclusive queue; keep it open for the loop
            let _channel = channel;
            loop {
                let next = tokio::select! {
                    _ = loop_cancel.cancelled() => break,
                    next = consumer.next() => next,
                };
                match next {
                    Some(Ok(delivery)) => {
                        let message = TopicMessage {
                            exchange: exchange_name.clone(),
                            topic: pattern.clone(),
                            routing_key: delivery.routing_key.as_str().to_string(),
                            payload: Bytes::from(delivery.data),
                        };
                        deliver_topic(&handler, message).await;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Topic consumer error, subscription ended");
                        break;
                    }
                    None => break,
                }
            }
        });

        info!(exchange = %exchange, topic = %topic, subscription = %handle, "Topic subscription started");
        self.topics.lock().await.insert(
            handle,
            TopicEntry {
                cancel,
                task,
                amqp_queue,
            },
        );
        Ok(handle)
    }

    async fn unsubscribe_topic(&self, handle: TopicHandle) -> Result<()> {
        let entry = self.topics.lock().await.remove(&handle);
        if let Some(entry) = entry {
            entry.cancel.cancel();
            let _ = entry.task.await;
            if let Err(e) = self.delete_amqp_queue(&entry.amqp_queue).await {
                debug!(subscription = %handle, error = %e, "Topic queue already gone");
            }
            debug!(subscription = %handle, "Topic subscription stopped");
        }
        Ok(())
    }

    async fn declare_private_queue(&self) -> Result<String> {
        self.ensure_open()?;
        let channel = self.get_channel().await?;
        let declared = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Subscribe(format!("Failed to declare queue: {}", e)))?;
        let name = declared.name().as_str().to_string();
        debug!(queue = %name, "Private queue declared");
        Ok(name)
    }

    async fn delete_queue(&self, exchange: &str, queue: &str) -> Result<()> {
        if exchange == DEFAULT_EXCHANGE {
            return self.delete_amqp_queue(queue).await;
        }

        let group_queues: Vec<String> = {
            let mut topology = self.topology.write().await;
            let Some(definition) = topology
                .exchanges
                .get_mut(exchange)
                .and_then(|d| d.remove_queue(queue))
            else {
                return Ok(());
            };
            let underlying = topology.underlying(exchange, &definition);
            let key = (exchange.to_string(), queue.to_string());
            topology.anonymous.remove(&key);
            topology
                .groups
                .remove(&key)
                .map(|groups| {
                    groups
                        .iter()
                        .map(|g| group_queue_name(&underlying, g))
                        .collect()
                })
                .unwrap_or_default()
        };

        for name in group_queues {
            self.delete_amqp_queue(&name).await?;
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
        for (tag, entry) in consumers {
            let owned_queue = entry.owned_queue.clone();
            Self::stop_entry(&tag, entry).await;
            if let Some(name) = owned_queue {
                self.delete_owned_queue(&name).await;
            }
        }

        let topics: Vec<_> = self.topics.lock().await.drain().collect();
        for (_, entry) in topics {
            entry.cancel.cancel();
            let _ = entry.task.await;
        }

        self.pool.close();
        info!(url = %self.config.url, "AMQP transport closed");
        Ok(())
    }
}
