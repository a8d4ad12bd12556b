//! Shared helpers for pipeline integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use courier::rpc::{RpcHandler, RpcParams};
use courier::subscriber::Subscriber;
use courier::task::Task;
use courier::transport::{HandlerError, TopicMessage, TopicMessageHandler};

/// Worker that tags its output with its own name.
pub struct TaggedWorker {
    pub tag: String,
    queue: String,
    identity: String,
    delay: Duration,
    handled: AtomicUsize,
}

impl TaggedWorker {
    pub fn new(tag: &str, queue: &str, identity: &str) -> Self {
        Self {
            tag: tag.to_string(),
            queue: queue.to_string(),
            identity: identity.to_string(),
            delay: Duration::ZERO,
            handled: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Subscriber for TaggedWorker {
    fn queue(&self) -> &str {
        &self.queue
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    async fn handle_task(&self, task: &mut Task) -> Result<(), HandlerError> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        task.add_output(self.tag.clone());
        task.complete();
        Ok(())
    }
}

/// Worker appending a fixed response.
pub struct Responder {
    queue: String,
    response: String,
}

impl Responder {
    pub fn new(queue: &str, response: &str) -> Self {
        Self {
            queue: queue.to_string(),
            response: response.to_string(),
        }
    }
}

#[async_trait]
impl Subscriber for Responder {
    fn queue(&self) -> &str {
        &self.queue
    }

    fn identity(&self) -> &str {
        "responder"
    }

    async fn handle_task(&self, task: &mut Task) -> Result<(), HandlerError> {
        task.add_output(self.response.clone());
        task.complete();
        Ok(())
    }
}

/// Broadcast listener recording every event.
pub struct EventListener {
    queue: String,
    identity: String,
    events: Mutex<Vec<Bytes>>,
}

impl EventListener {
    pub fn new(queue: &str, identity: &str) -> Self {
        Self {
            queue: queue.to_string(),
            identity: identity.to_string(),
            events: Mutex::new(Vec::new()),
        }
    }

    pub async fn events(&self) -> Vec<Bytes> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl Subscriber for EventListener {
    fn queue(&self) -> &str {
        &self.queue
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    async fn handle_event(&self, payload: Bytes) -> Result<(), HandlerError> {
        self.events.lock().await.push(payload);
        Ok(())
    }
}

/// Topic listener counting deliveries.
#[derive(Default)]
pub struct TopicCounter {
    count: AtomicUsize,
    messages: Mutex<Vec<TopicMessage>>,
}

impl TopicCounter {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub async fn messages(&self) -> Vec<TopicMessage> {
        self.messages.lock().await.clone()
    }
}

#[async_trait]
impl TopicMessageHandler for TopicCounter {
    async fn deliver_message(&self, message: TopicMessage) {
        self.messages.lock().await.push(message);
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// RPC handler echoing its parameters, after an optional per-call delay in
/// milliseconds taken from `params["delayMs"]`.
pub struct EchoHandler;

#[async_trait]
impl RpcHandler for EchoHandler {
    async fn call(&self, function: &str, params: RpcParams) -> Result<RpcParams, HandlerError> {
        if function != "echo" {
            return Err(HandlerError::Failed(format!("unknown function {}", function)));
        }
        if let Some(delay) = params.get("delayMs").and_then(|v| v.as_u64()) {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(params)
    }
}

/// Shared handle helper.
pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
