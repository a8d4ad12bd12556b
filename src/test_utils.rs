//! Test utilities and mock implementations.
//!
//! Recording subscribers and topic handlers for exercising the pipeline
//! without a real broker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::subscriber::Subscriber;
use crate::task::Task;
use crate::transport::{queue_handler_fn, Delivery, HandlerError, QueueHandler, TopicMessage};
use crate::transport::TopicMessageHandler;

pub use crate::transport::MockTransport;

/// Subscriber that records what it receives.
pub struct RecordingSubscriber {
    queue: String,
    identity: String,
    response: Option<String>,
    reject_events: bool,
    delay: Duration,
    tasks: Mutex<Vec<String>>,
    events: Mutex<Vec<Bytes>>,
    event_attempts: AtomicUsize,
}

impl RecordingSubscriber {
    pub fn new(queue: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            identity: identity.into(),
            response: None,
            reject_events: false,
            delay: Duration::ZERO,
            tasks: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            event_attempts: AtomicUsize::new(0),
        }
    }

    /// Append `output` to every task and complete it.
    pub fn responding_with(mut self, output: impl Into<String>) -> Self {
        self.response = Some(output.into());
        self
    }

    /// Sleep before finishing each task.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail every event with the default "unsupported" error.
    pub fn rejecting_events(mut self) -> Self {
        self.reject_events = true;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Contents of the tasks handled so far.
    pub async fn tasks(&self) -> Vec<String> {
        self.tasks.lock().await.clone()
    }

    /// Payloads of the events handled so far.
    pub async fn events(&self) -> Vec<Bytes> {
        self.events.lock().await.clone()
    }

    /// Number of `handle_event` calls, including rejected ones.
    pub fn event_attempts(&self) -> usize {
        self.event_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Subscriber for RecordingSubscriber {
    fn queue(&self) -> &str {
        &self.queue
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    async fn handle_task(&self, task: &mut Task) -> Result<(), HandlerError> {
        self.tasks.lock().await.push(task.content().to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(output) = &self.response {
            task.add_output(output.clone());
            task.complete();
        }
        Ok(())
    }

    async fn handle_event(&self, payload: Bytes) -> Result<(), HandlerError> {
        self.event_attempts.fetch_add(1, Ordering::SeqCst);
        if self.reject_events {
            return Err(HandlerError::Unsupported("events"));
        }
        self.events.lock().await.push(payload);
        Ok(())
    }
}

/// Topic handler that counts and keeps every message.
#[derive(Default)]
pub struct CountingTopicHandler {
    count: AtomicUsize,
    messages: Mutex<Vec<TopicMessage>>,
}

impl CountingTopicHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub async fn messages(&self) -> Vec<TopicMessage> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl TopicMessageHandler for CountingTopicHandler {
    async fn deliver_message(&self, message: TopicMessage) {
        self.messages.lock().await.push(message);
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Queue handler forwarding every delivery into a channel.
pub fn channel_handler() -> (Arc<dyn QueueHandler>, mpsc::UnboundedReceiver<Arc<Delivery>>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let handler = queue_handler_fn(move |delivery| {
        let sender = sender.clone();
        async move {
            sender
                .send(delivery)
                .map_err(|_| HandlerError::Failed("receiver dropped".to_string()))
        }
    });
    (handler, receiver)
}
