//! In-memory transport for standalone mode and tests.
//!
//! A `MemoryBroker` plays the role of a message broker inside one process.
//! Each `MemoryTransport` is a connection to it: it owns the consumers and
//! topic loops it started and stops them on close. Several transports on one
//! broker behave like several processes sharing a real broker.
//!
//! Delivery model:
//! - A queue delivers each message once to every consumer group attached to it
//! - Within a group, members take turns (round-robin)
//! - Messages for a queue with no groups yet wait for the first group
//! - Messages for a group whose members all left wait for the next member,
//!   unless the group is ephemeral: it is dropped with its backlog when the
//!   last member leaves
//! - A queue whose only groups were ephemeral drops messages once they are gone

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dispatch::{deliver_topic, invoke_handler, ConsumerWorkers};
use super::routing::{binding_matches, topic_matches};
use super::{
    ConsumerOptions, ConsumerTag, Delivery, Message, QueueHandler, Result, TopicHandle,
    TopicMessage, TopicMessageHandler, TransportError, TransportHandler, TransportKind,
    DEFAULT_EXCHANGE,
};
use crate::exchange::{ExchangeDefinition, ExchangeType};

/// Prefix for broker-generated queue names.
const GENERATED_PREFIX: &str = "amq.gen-";

fn generated_name() -> String {
    format!("{}{}", GENERATED_PREFIX, uuid::Uuid::new_v4())
}

// ============================================================================
// Broker state
// ============================================================================

struct Member {
    slot: u64,
    sender: mpsc::UnboundedSender<Arc<Delivery>>,
}

#[derive(Default)]
struct ConsumerGroup {
    members: Vec<Member>,
    next: usize,
    backlog: VecDeque<Arc<Delivery>>,
    ephemeral: bool,
}

impl ConsumerGroup {
    /// Hand a delivery to the next live member, or keep it for later.
    fn offer(&mut self, delivery: Arc<Delivery>) {
        while !self.members.is_empty() {
            let idx = self.next % self.members.len();
            if self.members[idx].sender.send(Arc::clone(&delivery)).is_ok() {
                self.next = idx + 1;
                return;
            }
            // Receiver gone without detaching
            self.members.remove(idx);
        }
        self.backlog.push_back(delivery);
    }

    fn flush_backlog(&mut self) {
        let pending: Vec<_> = self.backlog.drain(..).collect();
        for delivery in pending {
            self.offer(delivery);
        }
    }
}

struct QueueState {
    underlying: String,
    bindings: Vec<String>,
    groups: HashMap<String, ConsumerGroup>,
    unclaimed: VecDeque<Arc<Delivery>>,
    /// Set once an ephemeral group has come and gone; nothing waits here any more.
    abandoned: bool,
}

impl QueueState {
    fn new(underlying: String) -> Self {
        Self {
            underlying,
            bindings: Vec::new(),
            groups: HashMap::new(),
            unclaimed: VecDeque::new(),
            abandoned: false,
        }
    }

    fn enqueue(&mut self, delivery: Arc<Delivery>) {
        if self.groups.is_empty() {
            if self.abandoned {
                debug!(queue = %self.underlying, "No consumer group left, delivery dropped");
            } else {
                self.unclaimed.push_back(delivery);
            }
            return;
        }
        for group in self.groups.values_mut() {
            group.offer(Arc::clone(&delivery));
        }
    }
}

struct ExchangeState {
    exchange_type: ExchangeType,
    queues: HashMap<String, QueueState>,
}

impl ExchangeState {
    fn new(exchange_type: ExchangeType) -> Self {
        Self {
            exchange_type,
            queues: HashMap::new(),
        }
    }
}

struct TopicBinding {
    exchange: String,
    pattern: String,
    sender: mpsc::UnboundedSender<TopicMessage>,
}

struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    /// (exchange, logical name) -> generated underlying name
    anonymous: HashMap<(String, String), String>,
    topics: HashMap<TopicHandle, TopicBinding>,
}

impl Default for BrokerState {
    fn default() -> Self {
        let mut exchanges = HashMap::new();
        exchanges.insert(
            DEFAULT_EXCHANGE.to_string(),
            ExchangeState::new(ExchangeType::Direct),
        );
        Self {
            exchanges,
            anonymous: HashMap::new(),
            topics: HashMap::new(),
        }
    }
}

/// Shared in-process broker.
///
/// Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    next_slot: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `queue` is declared on `exchange`.
    pub async fn has_queue(&self, exchange: &str, queue: &str) -> bool {
        let state = self.state.lock().await;
        state
            .exchanges
            .get(exchange)
            .is_some_and(|ex| ex.queues.contains_key(queue))
    }

    pub async fn has_exchange(&self, exchange: &str) -> bool {
        self.state.lock().await.exchanges.contains_key(exchange)
    }

    /// Consumer groups attached to a queue, sorted.
    pub async fn group_names(&self, exchange: &str, queue: &str) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state
            .exchanges
            .get(exchange)
            .and_then(|ex| ex.queues.get(queue))
            .map(|q| q.groups.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Deliveries held for a queue: unclaimed plus every group backlog.
    pub async fn buffered(&self, exchange: &str, queue: &str) -> usize {
        let state = self.state.lock().await;
        state
            .exchanges
            .get(exchange)
            .and_then(|ex| ex.queues.get(queue))
            .map(|q| {
                q.unclaimed.len() + q.groups.values().map(|g| g.backlog.len()).sum::<usize>()
            })
            .unwrap_or(0)
    }

    /// Underlying names of the queues declared on an exchange, sorted.
    pub async fn queue_names(&self, exchange: &str) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state
            .exchanges
            .get(exchange)
            .map(|ex| ex.queues.values().map(|q| q.underlying.clone()).collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    async fn declare(&self, definition: &ExchangeDefinition) -> Result<()> {
        let mut state = self.state.lock().await;
        let BrokerState {
            exchanges,
            anonymous,
            ..
        } = &mut *state;

        let exchange = exchanges
            .entry(definition.name.clone())
            .or_insert_with(|| ExchangeState::new(definition.exchange_type));

        if exchange.exchange_type != definition.exchange_type {
            return Err(TransportError::ExchangeConflict {
                exchange: definition.name.clone(),
                existing: exchange.exchange_type.to_string(),
            });
        }

        for queue in &definition.queues {
            let queue_state = exchange.queues.entry(queue.name.clone()).or_insert_with(|| {
                let underlying = if queue.is_anonymous() {
                    anonymous
                        .entry((definition.name.clone(), queue.name.clone()))
                        .or_insert_with(generated_name)
                        .clone()
                } else {
                    format!("{}-{}", definition.name, queue.name)
                };
                debug!(
                    exchange = %definition.name,
                    queue = %queue.name,
                    underlying = %underlying,
                    "Declared queue"
                );
                QueueState::new(underlying)
            });
            for key in &queue.bindings {
                if !queue_state.bindings.contains(key) {
                    queue_state.bindings.push(key.clone());
                }
            }
        }

        Ok(())
    }

    async fn tear_down(&self, exchange: &str) -> Result<()> {
        if exchange == DEFAULT_EXCHANGE {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        if state.exchanges.remove(exchange).is_some() {
            state.anonymous.retain(|(ex, _), _| ex != exchange);
            info!(exchange = %exchange, "Exchange torn down");
        }
        Ok(())
    }

    async fn route(&self, exchange: &str, routing_key: &str, message: Message) -> Result<usize> {
        let mut state = self.state.lock().await;
        let Some(target) = state.exchanges.get_mut(exchange) else {
            return Err(TransportError::publish_failed(
                exchange,
                routing_key,
                "exchange not declared",
                message.payload,
            ));
        };

        let exchange_type = target.exchange_type;
        let mut routed = 0;
        for (name, queue) in target.queues.iter_mut() {
            let accepted = if exchange == DEFAULT_EXCHANGE {
                name == routing_key
            } else {
                binding_matches(exchange_type, &queue.bindings, routing_key)
            };
            if !accepted {
                continue;
            }
            queue.enqueue(Arc::new(Delivery {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                queue: name.clone(),
                payload: message.payload.clone(),
                properties: message.properties.clone(),
            }));
            routed += 1;
        }
        Ok(routed)
    }

    async fn attach(
        &self,
        exchange: &str,
        queue: &str,
        options: &ConsumerOptions,
        sender: mpsc::UnboundedSender<Arc<Delivery>>,
    ) -> Result<u64> {
        let group = options.group.as_str();
        let mut state = self.state.lock().await;
        let target = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| TransportError::UnknownExchange(exchange.to_string()))?;

        // The default exchange creates queues on first use.
        if exchange == DEFAULT_EXCHANGE && !target.queues.contains_key(queue) {
            target
                .queues
                .insert(queue.to_string(), QueueState::new(queue.to_string()));
        }

        let queue_state =
            target
                .queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::UnknownQueue {
                    exchange: exchange.to_string(),
                    queue: queue.to_string(),
                })?;

        let fresh_group = !queue_state.groups.contains_key(group);
        let unclaimed: Vec<_> = if fresh_group && queue_state.groups.is_empty() {
            queue_state.unclaimed.drain(..).collect()
        } else {
            Vec::new()
        };

        let slot = self.next_slot.fetch_add(1, Ordering::Relaxed);
        queue_state.abandoned = false;
        let consumer_group = queue_state
            .groups
            .entry(group.to_string())
            .or_insert_with(|| ConsumerGroup {
                ephemeral: options.ephemeral,
                ..Default::default()
            });
        consumer_group.backlog.extend(unclaimed);
        consumer_group.members.push(Member { slot, sender });
        consumer_group.flush_backlog();
        Ok(slot)
    }

    async fn detach(&self, exchange: &str, queue: &str, group: &str, slot: u64) {
        let mut state = self.state.lock().await;
        let Some(queue_state) = state
            .exchanges
            .get_mut(exchange)
            .and_then(|ex| ex.queues.get_mut(queue))
        else {
            return;
        };
        let Some(consumer_group) = queue_state.groups.get_mut(group) else {
            return;
        };
        consumer_group.members.retain(|m| m.slot != slot);
        if consumer_group.members.is_empty() && consumer_group.ephemeral {
            let dropped = consumer_group.backlog.len();
            queue_state.groups.remove(group);
            if queue_state.groups.is_empty() {
                queue_state.abandoned = true;
            }
            debug!(queue = %queue, group = %group, dropped, "Ephemeral group removed");
        }
    }

    /// Put deliveries a stopped consumer never processed back to its group.
    async fn requeue(&self, exchange: &str, queue: &str, group: &str, deliveries: Vec<Arc<Delivery>>) {
        if deliveries.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        if let Some(consumer_group) = state
            .exchanges
            .get_mut(exchange)
            .and_then(|ex| ex.queues.get_mut(queue))
            .and_then(|q| q.groups.get_mut(group))
        {
            debug!(queue = %queue, count = deliveries.len(), "Requeued unprocessed deliveries");
            for delivery in deliveries {
                consumer_group.offer(delivery);
            }
        } else {
            debug!(queue = %queue, count = deliveries.len(), "Group gone, unprocessed deliveries dropped");
        }
    }

    async fn create_private_queue(&self) -> String {
        let name = generated_name();
        let mut state = self.state.lock().await;
        if let Some(default) = state.exchanges.get_mut(DEFAULT_EXCHANGE) {
            default
                .queues
                .insert(name.clone(), QueueState::new(name.clone()));
        }
        name
    }

    async fn remove_queue(&self, exchange: &str, queue: &str) -> bool {
        let mut state = self.state.lock().await;
        let removed = state
            .exchanges
            .get_mut(exchange)
            .and_then(|ex| ex.queues.remove(queue))
            .is_some();
        state
            .anonymous
            .remove(&(exchange.to_string(), queue.to_string()));
        removed
    }

    async fn bind_topic(&self, handle: TopicHandle, binding: TopicBinding) {
        self.state.lock().await.topics.insert(handle, binding);
    }

    async fn unbind_topic(&self, handle: TopicHandle) -> bool {
        self.state.lock().await.topics.remove(&handle).is_some()
    }

    async fn fan_out_topic(&self, exchange: &str, routing_key: &str, payload: Bytes) -> usize {
        let mut state = self.state.lock().await;
        let mut delivered = 0;
        state.topics.retain(|_, binding| {
            if binding.exchange != exchange || !topic_matches(&binding.pattern, routing_key) {
                return true;
            }
            let message = TopicMessage {
                exchange: exchange.to_string(),
                topic: binding.pattern.clone(),
                routing_key: routing_key.to_string(),
                payload: payload.clone(),
            };
            match binding.sender.send(message) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        delivered
    }
}

// ============================================================================
// Transport
// ============================================================================

struct ConsumerEntry {
    exchange: String,
    queue: String,
    group: String,
    slot: u64,
    cancel: CancellationToken,
    task: JoinHandle<Vec<Arc<Delivery>>>,
    workers: ConsumerWorkers,
}

struct TopicEntry {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// A connection to a `MemoryBroker`.
pub struct MemoryTransport {
    broker: MemoryBroker,
    consumers: Mutex<HashMap<ConsumerTag, ConsumerEntry>>,
    topics: Mutex<HashMap<TopicHandle, TopicEntry>>,
    shutdown: CancellationToken,
}

impl MemoryTransport {
    /// Open a connection to `broker`.
    pub fn connect(broker: &MemoryBroker) -> Self {
        Self {
            broker: broker.clone(),
            consumers: Mutex::new(HashMap::new()),
            topics: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Connect to a broker of its own.
    pub fn standalone() -> Self {
        Self::connect(&MemoryBroker::new())
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn consume_loop(
        mut receiver: mpsc::UnboundedReceiver<Arc<Delivery>>,
        handler: Arc<dyn QueueHandler>,
        workers: ConsumerWorkers,
        cancel: CancellationToken,
    ) -> Vec<Arc<Delivery>> {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(delivery) => {
                        let handler = Arc::clone(&handler);
                        workers
                            .spawn(async move {
                                invoke_handler(&handler, delivery).await;
                            })
                            .await;
                    }
                    None => {
                        debug!("Queue removed, stopping consumer");
                        break;
                    }
                },
            }
        }

        receiver.close();
        let mut leftovers = Vec::new();
        while let Ok(delivery) = receiver.try_recv() {
            leftovers.push(delivery);
        }
        leftovers
    }

    async fn stop_entry(&self, tag: &ConsumerTag, entry: ConsumerEntry) {
        self.broker
            .detach(&entry.exchange, &entry.queue, &entry.group, entry.slot)
            .await;
        entry.cancel.cancel();
        let leftovers = entry.task.await.unwrap_or_default();
        entry.workers.drain().await;
        self.broker
            .requeue(&entry.exchange, &entry.queue, &entry.group, leftovers)
            .await;
        debug!(consumer = %tag, queue = %entry.queue, "Consumer stopped");
    }
}

#[async_trait]
impl TransportHandler for MemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    async fn declare_exchange(&self, exchange: &ExchangeDefinition) -> Result<()> {
        self.ensure_open()?;
        self.broker.declare(exchange).await
    }

    async fn tear_down_exchange(&self, exchange: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker.tear_down(exchange).await
    }

    async fn start_consuming(
        &self,
        exchange: &str,
        queue: &str,
        options: ConsumerOptions,
        handler: Arc<dyn QueueHandler>,
    ) -> Result<ConsumerTag> {
        self.ensure_open()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let slot = self
            .broker
            .attach(exchange, queue, &options, sender)
            .await?;

        let tag = ConsumerTag::generate();
        let cancel = self.shutdown.child_token();
        let workers = ConsumerWorkers::new(options.concurrency);
        let task = tokio::spawn(Self::consume_loop(
            receiver,
            handler,
            workers.clone(),
            cancel.clone(),
        ));

        info!(
            exchange = %exchange,
            queue = %queue,
            group = %options.group,
            consumer = %tag,
            "Memory consumer started"
        );

        self.consumers.lock().await.insert(
            tag.clone(),
            ConsumerEntry {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                group: options.group,
                slot,
                cancel,
                task,
                workers,
            },
        );
        Ok(tag)
    }

    async fn stop_consuming(&self, tag: &ConsumerTag) -> Result<()> {
        let entry = self.consumers.lock().await.remove(tag);
        match entry {
            Some(entry) => {
                self.stop_entry(tag, entry).await;
                Ok(())
            }
            None => {
                warn!(consumer = %tag, "Stop requested for unknown consumer");
                Ok(())
            }
        }
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: Message) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::publish_failed(
                exchange,
                routing_key,
                "transport closed",
                message.payload,
            ));
        }

        let routed = self.broker.route(exchange, routing_key, message).await?;
        if routed == 0 {
            debug!(exchange = %exchange, routing_key = %routing_key, "Message unroutable, dropped");
        }
        Ok(())
    }

    async fn publish_topic(&self, exchange: &str, topic: &str, payload: Bytes) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::publish_failed(
                exchange,
                topic,
                "transport closed",
                payload,
            ));
        }
        let receivers = self.broker.fan_out_topic(exchange, topic, payload).await;
        debug!(exchange = %exchange, topic = %topic, receivers, "Published topic message");
        Ok(())
    }

    async fn subscribe_topic(
        &self,
        exchange: &str,
        topic: &str,
        handler: Arc<dyn TopicMessageHandler>,
    ) -> Result<TopicHandle> {
        self.ensure_open()?;

        let (sender, mut receiver) = mpsc::unbounded_channel::<TopicMessage>();
        let handle = TopicHandle::next();
        self.broker
            .bind_topic(
                handle,
                TopicBinding {
                    exchange: exchange.to_string(),
                    pattern: topic.to_string(),
                    sender,
                },
            )
            .await;

        let cancel = self.shutdown.child_token();
        let loop_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = loop_cancel.cancelled() => break,
                    next = receiver.recv() => match next {
                        Some(message) => deliver_topic(&handler, message).await,
                        None => break,
                    },
                }
            }
        });

        info!(exchange = %exchange, topic = %topic, subscription = %handle, "Topic subscription started");
        self.topics
            .lock()
            .await
            .insert(handle, TopicEntry { cancel, task });
        Ok(handle)
    }

    async fn unsubscribe_topic(&self, handle: TopicHandle) -> Result<()> {
        self.broker.unbind_topic(handle).await;
        let entry = self.topics.lock().await.remove(&handle);
        if let Some(entry) = entry {
            entry.cancel.cancel();
            let _ = entry.task.await;
            debug!(subscription = %handle, "Topic subscription stopped");
        }
        Ok(())
    }

    async fn declare_private_queue(&self) -> Result<String> {
        self.ensure_open()?;
        Ok(self.broker.create_private_queue().await)
    }

    async fn delete_queue(&self, exchange: &str, queue: &str) -> Result<()> {
        if self.broker.remove_queue(exchange, queue).await {
            debug!(exchange = %exchange, queue = %queue, "Queue deleted");
        }
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
            self.stop_entry(&tag, entry).await;
        }

        let topics: Vec<_> = self.topics.lock().await.drain().collect();
        for (handle, entry) in topics {
            self.broker.unbind_topic(handle).await;
            entry.cancel.cancel();
            let _ = entry.task.await;
        }

        info!("Memory transport closed");
        Ok(())
    }
}
