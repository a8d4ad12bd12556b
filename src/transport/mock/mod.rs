//! Mock transport implementation for testing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::{
    ConsumerOptions, ConsumerTag, Message, QueueHandler, Result, TopicHandle,
    TopicMessageHandler, TransportError, TransportHandler, TransportKind,
};
use crate::exchange::ExchangeDefinition;

/// A message captured by `MockTransport::publish`.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message: Message,
}

/// Mock transport for testing.
///
/// Records declarations and publishes; never delivers anything.
#[derive(Default)]
pub struct MockTransport {
    published: RwLock<Vec<PublishedMessage>>,
    declared: RwLock<HashMap<String, ExchangeDefinition>>,
    consumers: RwLock<HashMap<ConsumerTag, String>>,
    fail_on_publish: RwLock<bool>,
    shutdown: CancellationToken,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn take_published(&self) -> Vec<PublishedMessage> {
        std::mem::take(&mut *self.published.write().await)
    }

    pub async fn declared(&self, exchange: &str) -> Option<ExchangeDefinition> {
        self.declared.read().await.get(exchange).cloned()
    }

    pub async fn consumer_count(&self) -> usize {
        self.consumers.read().await.len()
    }
}

#[async_trait]
impl TransportHandler for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    async fn declare_exchange(&self, exchange: &ExchangeDefinition) -> Result<()> {
        self.declared
            .write()
            .await
            .insert(exchange.name.clone(), exchange.clone());
        Ok(())
    }

    async fn tear_down_exchange(&self, exchange: &str) -> Result<()> {
        self.declared.write().await.remove(exchange);
        Ok(())
    }

    async fn start_consuming(
        &self,
        _exchange: &str,
        queue: &str,
        _options: ConsumerOptions,
        _handler: Arc<dyn QueueHandler>,
    ) -> Result<ConsumerTag> {
        let tag = ConsumerTag::generate();
        self.consumers
            .write()
            .await
            .insert(tag.clone(), queue.to_string());
        Ok(tag)
    }

    async fn stop_consuming(&self, tag: &ConsumerTag) -> Result<()> {
        self.consumers.write().await.remove(tag);
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: Message) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(TransportError::publish_failed(
                exchange,
                routing_key,
                "Mock publish failure",
                message.payload,
            ));
        }
        self.published.write().await.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message,
        });
        Ok(())
    }

    async fn publish_topic(&self, exchange: &str, topic: &str, payload: Bytes) -> Result<()> {
        self.publish(exchange, topic, Message::event(payload)).await
    }

    async fn subscribe_topic(
        &self,
        _exchange: &str,
        _topic: &str,
        _handler: Arc<dyn TopicMessageHandler>,
    ) -> Result<TopicHandle> {
        Ok(TopicHandle::next())
    }

    async fn unsubscribe_topic(&self, _handle: TopicHandle) -> Result<()> {
        Ok(())
    }

    async fn declare_private_queue(&self) -> Result<String> {
        Ok(format!("mock-{}", uuid::Uuid::new_v4()))
    }

    async fn delete_queue(&self, _exchange: &str, _queue: &str) -> Result<()> {
        Ok(())
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::QueueDefinition;

    #[tokio::test]
    async fn test_mock_transport_publish() {
        let transport = MockTransport::new();

        transport
            .publish("orders", "work", Message::event("hi"))
            .await
            .unwrap();

        assert_eq!(transport.published_count().await, 1);
        let published = transport.take_published().await;
        assert_eq!(published[0].routing_key, "work");
        assert_eq!(transport.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_mock_transport_fail_on_publish() {
        let transport = MockTransport::new();
        transport.set_fail_on_publish(true).await;

        let result = transport
            .publish("orders", "work", Message::event("hi"))
            .await;

        assert_eq!(
            result.unwrap_err().failed_payload(),
            Some(&Bytes::from_static(b"hi"))
        );
    }

    #[tokio::test]
    async fn test_mock_transport_records_declarations() {
        let transport = MockTransport::new();
        let exchange = ExchangeDefinition::standard_direct("orders")
            .with_queue(QueueDefinition::routed_by_name("work"));

        transport.declare_exchange(&exchange).await.unwrap();

        assert_eq!(transport.declared("orders").await, Some(exchange));
        transport.tear_down_exchange("orders").await.unwrap();
        assert!(transport.declared("orders").await.is_none());
    }
}
