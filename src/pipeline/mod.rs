//! Collaborator-facing facade.
//!
//! A `Pipeline` bundles an exchange registry with the dispatcher, subscriber
//! registry, topic bus and RPC endpoints built on it. Several pipelines over
//! one `MemoryBroker` behave like separate processes sharing a broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::CourierConfig;
use crate::dispatch::{Completion, DispatchError, DispatcherConfig, Result, TaskDispatcher};
use crate::exchange::{ExchangeRegistry, QueueDefinition};
use crate::rpc::{self, RpcClient, RpcHandler, RpcParams, RpcServer};
use crate::subscriber::{Subscriber, SubscriberRegistry};
use crate::task::{InMemoryStatusStore, TaskRequest, TaskStatus, TaskStatusStore};
use crate::topic::TopicBus;
use crate::transport::{
    ConsumerTag, Message, MessageKind, MemoryBroker, TopicHandle, TopicMessageHandler,
    TransportFactory, TransportSettings,
};

pub struct Pipeline {
    registry: Arc<ExchangeRegistry>,
    dispatcher: Arc<TaskDispatcher>,
    subscribers: SubscriberRegistry,
    topics: TopicBus,
    rpc_clients: Mutex<HashMap<String, Arc<RpcClient>>>,
    rpc_servers: Mutex<HashMap<String, Arc<RpcServer>>>,
    rpc_timeout: Duration,
    consumer_concurrency: usize,
}

impl Pipeline {
    pub fn new(
        registry: Arc<ExchangeRegistry>,
        store: Arc<dyn TaskStatusStore>,
        config: &CourierConfig,
    ) -> Self {
        let dispatcher_config = DispatcherConfig::from(&config.dispatcher);
        let consumer_concurrency = dispatcher_config.consumer_concurrency;
        let dispatcher = TaskDispatcher::new(Arc::clone(&registry), store, dispatcher_config);
        let subscribers =
            SubscriberRegistry::new(Arc::clone(&registry), &dispatcher, consumer_concurrency);
        let topics = TopicBus::new(Arc::clone(&registry));
        Self {
            registry,
            dispatcher,
            subscribers,
            topics,
            rpc_clients: Mutex::new(HashMap::new()),
            rpc_servers: Mutex::new(HashMap::new()),
            rpc_timeout: Duration::from_secs(config.rpc.default_timeout_secs),
            consumer_concurrency,
        }
    }

    /// Pipeline with configured domains; unconfigured domains use the
    /// factory's in-memory broker.
    pub fn from_config(config: &CourierConfig, factory: TransportFactory) -> Self {
        let registry = ExchangeRegistry::new(factory, config.domains.clone())
            .with_fallback(TransportSettings::memory());
        Self::new(
            Arc::new(registry),
            Arc::new(InMemoryStatusStore::new()),
            config,
        )
    }

    /// Pipeline where every domain lives on `broker`.
    pub fn in_memory(broker: &MemoryBroker) -> Self {
        let factory = TransportFactory::with_memory_broker(broker.clone());
        Self::new(
            Arc::new(ExchangeRegistry::in_memory(factory)),
            Arc::new(InMemoryStatusStore::new()),
            &CourierConfig::default(),
        )
    }

    pub fn registry(&self) -> &Arc<ExchangeRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    pub fn subscribers(&self) -> &SubscriberRegistry {
        &self.subscribers
    }

    // ------------------------------------------------------------------
    // Queues
    // ------------------------------------------------------------------

    /// Declare a task queue and its response queue.
    pub async fn create_task_queue(&self, domain: &str, queue: &str) -> Result<()> {
        self.dispatcher.create_task_queue(domain, queue).await
    }

    pub async fn remove_task_queue(&self, domain: &str, queue: &str) -> Result<bool> {
        self.dispatcher.remove_task_queue(domain, queue).await
    }

    /// Declare a queue carrying broadcast events.
    ///
    /// Every subscriber identity on it gets each event once.
    pub async fn create_broadcast_queue(&self, domain: &str, queue: &str) -> Result<()> {
        let entry = self.registry.ensure_domain(domain).await?;
        entry
            .add_queues(entry.name(), vec![QueueDefinition::routed_by_name(queue)])
            .await?;
        info!(domain = %domain, queue = %queue, "Broadcast queue created");
        Ok(())
    }

    pub async fn remove_broadcast_queue(&self, domain: &str, queue: &str) -> Result<bool> {
        let entry = self.registry.ensure_domain(domain).await?;
        Ok(entry.remove_queue(entry.name(), queue).await?)
    }

    /// Whether `queue` is declared in the domain's exchange.
    pub async fn queue_exists(&self, domain: &str, queue: &str) -> Result<bool> {
        let entry = self.registry.ensure_domain(domain).await?;
        Ok(entry.has_queue(entry.name(), queue).await)
    }

    // ------------------------------------------------------------------
    // Subscribers
    // ------------------------------------------------------------------

    pub async fn subscribe_to_queue(
        &self,
        domain: &str,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<ConsumerTag> {
        self.subscribers.subscribe(domain, subscriber).await
    }

    pub async fn unsubscribe_queue(
        &self,
        domain: &str,
        subscriber: &Arc<dyn Subscriber>,
    ) -> Result<usize> {
        self.subscribers.unsubscribe(domain, subscriber).await
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    pub async fn publish_task(
        &self,
        domain: &str,
        queue: &str,
        content: impl Into<String>,
        timeout: Option<Duration>,
        priority: i32,
    ) -> Result<TaskStatus> {
        self.dispatcher
            .publish_task(domain, queue, content, timeout, priority)
            .await
    }

    pub async fn publish_request(
        &self,
        domain: &str,
        queue: &str,
        request: TaskRequest,
        timeout: Option<Duration>,
    ) -> Result<TaskStatus> {
        self.dispatcher
            .publish_request(domain, queue, request, timeout)
            .await
    }

    pub async fn publish_task_response(
        &self,
        domain: &str,
        queue: &str,
        status: &TaskStatus,
    ) -> Result<()> {
        self.dispatcher
            .publish_task_response(domain, queue, status)
            .await
    }

    pub async fn complete_task(
        &self,
        domain: &str,
        queue: &str,
        status: &TaskStatus,
    ) -> Result<Completion> {
        self.dispatcher.complete_task(domain, queue, status).await
    }

    pub async fn get_status(&self, domain: &str, task_id: &str) -> Result<Option<TaskStatus>> {
        self.dispatcher.get_status(domain, task_id).await
    }

    pub async fn list_tasks(&self, domain: &str) -> Result<Vec<TaskStatus>> {
        self.dispatcher.list_tasks(domain).await
    }

    // ------------------------------------------------------------------
    // Broadcast and topics
    // ------------------------------------------------------------------

    /// Send an event to every subscriber group of a broadcast queue.
    pub async fn broadcast_message(
        &self,
        domain: &str,
        queue: &str,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        let entry = self.registry.ensure_domain(domain).await?;
        if !entry.has_queue(entry.name(), queue).await {
            return Err(DispatchError::UnknownQueue {
                domain: domain.to_string(),
                queue: queue.to_string(),
            });
        }
        let message = Message::of_kind(MessageKind::Event, payload);
        entry.transport().publish(entry.name(), queue, message).await?;
        debug!(domain = %domain, queue = %queue, "Broadcast published");
        Ok(())
    }

    pub async fn publish_topic_message(
        &self,
        domain: &str,
        exchange: &str,
        topic: &str,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.topics
            .publish_topic_message(domain, exchange, topic, payload)
            .await
    }

    pub async fn subscribe_topic(
        &self,
        domain: &str,
        exchange: &str,
        topic: &str,
        handler: Arc<dyn TopicMessageHandler>,
    ) -> Result<TopicHandle> {
        self.topics
            .subscribe_topic(domain, exchange, topic, handler)
            .await
    }

    pub async fn unsubscribe_topic(&self, handle: TopicHandle) -> Result<bool> {
        self.topics.unsubscribe_topic(handle).await
    }

    // ------------------------------------------------------------------
    // RPC
    // ------------------------------------------------------------------

    /// Call `function` on the server consuming `queue` in `domain`.
    ///
    /// `timeout` defaults to the configured RPC timeout.
    pub async fn rpc_call(
        &self,
        domain: &str,
        queue: &str,
        function: &str,
        params: RpcParams,
        timeout: Option<Duration>,
    ) -> rpc::Result<RpcParams> {
        self.rpc_call_with_cancel(domain, queue, function, params, timeout, &CancellationToken::new())
            .await
    }

    pub async fn rpc_call_with_cancel(
        &self,
        domain: &str,
        queue: &str,
        function: &str,
        params: RpcParams,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> rpc::Result<RpcParams> {
        let client = self.rpc_client(domain).await?;
        client
            .call_with_cancel(
                queue,
                function,
                params,
                timeout.unwrap_or(self.rpc_timeout),
                cancel,
            )
            .await
    }

    /// Answer RPC requests sent to `queue` in `domain`.
    pub async fn serve_rpc(
        &self,
        domain: &str,
        queue: &str,
        handler: Arc<dyn RpcHandler>,
    ) -> rpc::Result<ConsumerTag> {
        let server = self.rpc_server(domain).await?;
        server.serve(queue, handler, self.consumer_concurrency).await
    }

    pub async fn stop_rpc(&self, domain: &str, queue: &str) -> rpc::Result<bool> {
        let server = self.rpc_servers.lock().await.get(domain).cloned();
        match server {
            Some(server) => server.stop(queue).await,
            None => Ok(false),
        }
    }

    async fn rpc_client(&self, domain: &str) -> rpc::Result<Arc<RpcClient>> {
        let mut clients = self.rpc_clients.lock().await;
        if let Some(client) = clients.get(domain) {
            return Ok(Arc::clone(client));
        }
        let entry = self.registry.ensure_domain(domain).await?;
        let client = Arc::new(RpcClient::new(Arc::clone(entry.transport())));
        clients.insert(domain.to_string(), Arc::clone(&client));
        Ok(client)
    }

    async fn rpc_server(&self, domain: &str) -> rpc::Result<Arc<RpcServer>> {
        let mut servers = self.rpc_servers.lock().await;
        if let Some(server) = servers.get(domain) {
            return Ok(Arc::clone(server));
        }
        let entry = self.registry.ensure_domain(domain).await?;
        let server = Arc::new(RpcServer::new(Arc::clone(entry.transport())));
        servers.insert(domain.to_string(), Arc::clone(&server));
        Ok(server)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Stop every consumer, drain in-flight callbacks and close transports.
    pub async fn shutdown(&self) {
        self.subscribers.unsubscribe_all().await;
        self.dispatcher.shutdown().await;
        self.topics.shutdown().await;

        let servers: Vec<_> = self.rpc_servers.lock().await.drain().collect();
        for (_, server) in servers {
            server.stop_all().await;
        }
        let clients: Vec<_> = self.rpc_clients.lock().await.drain().collect();
        for (domain, client) in clients {
            if let Err(e) = client.close().await {
                debug!(domain = %domain, error = %e, "RPC client close failed");
            }
        }

        self.registry.close_all().await;
        info!("Pipeline shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingSubscriber;

    #[tokio::test]
    async fn test_queue_exists_tracks_declarations() {
        let pipeline = Pipeline::in_memory(&MemoryBroker::new());

        assert!(!pipeline.queue_exists("orders", "work").await.unwrap());
        pipeline.create_task_queue("orders", "work").await.unwrap();
        assert!(pipeline.queue_exists("orders", "work").await.unwrap());
        assert!(pipeline.queue_exists("orders", "work-response").await.unwrap());

        pipeline.create_broadcast_queue("orders", "news").await.unwrap();
        assert!(pipeline.queue_exists("orders", "news").await.unwrap());
        assert!(pipeline.remove_broadcast_queue("orders", "news").await.unwrap());
        assert!(!pipeline.queue_exists("orders", "news").await.unwrap());
    }

    #[tokio::test]
    async fn test_broadcast_to_undeclared_queue() {
        let pipeline = Pipeline::in_memory(&MemoryBroker::new());

        let result = pipeline.broadcast_message("orders", "news", "x").await;

        assert!(matches!(result, Err(DispatchError::UnknownQueue { .. })));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_each_identity() {
        let pipeline = Pipeline::in_memory(&MemoryBroker::new());
        pipeline.create_broadcast_queue("orders", "news").await.unwrap();
        let first = RecordingSubscriber::new("news", "audit").shared();
        let second = RecordingSubscriber::new("news", "mailer").shared();
        pipeline.subscribe_to_queue("orders", first.clone()).await.unwrap();
        pipeline.subscribe_to_queue("orders", second.clone()).await.unwrap();

        pipeline.broadcast_message("orders", "news", "Message").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(first.events().await, vec![Bytes::from("Message")]);
        assert_eq!(second.events().await, vec![Bytes::from("Message")]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_subscribers() {
        let pipeline = Pipeline::in_memory(&MemoryBroker::new());
        pipeline.create_task_queue("orders", "work").await.unwrap();
        pipeline
            .subscribe_to_queue("orders", RecordingSubscriber::new("work", "w").shared())
            .await
            .unwrap();

        pipeline.shutdown().await;

        assert!(pipeline.subscribers().is_empty().await);
        assert!(pipeline.registry().domains().await.is_empty());
    }
}
