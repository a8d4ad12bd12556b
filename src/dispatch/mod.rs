//! Task dispatch.
//!
//! `TaskDispatcher` publishes tasks to queues and lets the caller wait a
//! bounded time for the outcome. Completion reaches it in one of two ways:
//! - `complete_task` called directly in the same process
//! - a status report on the `{queue}-response` queue, picked up by the
//!   dispatcher's response watcher for that queue
//!
//! A caller that stops waiting gets the status as it stands; the record moves
//! to the status store, where later completions still land.
//!
//! Response queues are shared by every dispatcher that publishes to the same
//! queue. A watcher only applies reports for tasks its own dispatcher issued
//! and forgets the id once a terminal report has been stored.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::DispatcherSettings;
use crate::exchange::{DomainEntry, ExchangeRegistry, QueueDefinition, RegistryError};
use crate::task::{
    StoreError, TaskEnvelope, TaskRequest, TaskState, TaskStatus, TaskStatusStore,
};
use crate::transport::{
    ConsumerOptions, ConsumerTag, Delivery, HandlerError, Message, MessageKind, QueueHandler,
    TransportError,
};

/// Content type of task envelopes and status documents on the wire.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Errors returned to callers of the dispatcher and the pipeline facade.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Queue '{queue}' is not declared in domain '{domain}'")]
    UnknownQueue { domain: String, queue: String },
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Dispatcher tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub default_timeout: Duration,
    pub consumer_concurrency: usize,
    pub response_suffix: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from(&DispatcherSettings::default())
    }
}

impl From<&DispatcherSettings> for DispatcherConfig {
    fn from(settings: &DispatcherSettings) -> Self {
        Self {
            default_timeout: Duration::from_millis(settings.default_timeout_ms),
            consumer_concurrency: settings.consumer_concurrency.max(1),
            response_suffix: settings.response_suffix.clone(),
        }
    }
}

/// How a completion was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// A caller in this process was waiting and has been signalled.
    Notified,
    /// Nobody is waiting here; the status store was updated.
    Stored,
}

struct WaitRecord {
    domain: String,
    status: watch::Sender<TaskStatus>,
}

struct ResponseWatch {
    entry: Arc<DomainEntry>,
    tag: ConsumerTag,
}

/// Publishes tasks and correlates their completions.
pub struct TaskDispatcher {
    registry: Arc<ExchangeRegistry>,
    store: Arc<dyn TaskStatusStore>,
    config: DispatcherConfig,
    /// Consumer group of this dispatcher's response watchers. Unique per
    /// dispatcher so every dispatcher sees every response.
    identity: String,
    waiters: RwLock<HashMap<String, Arc<WaitRecord>>>,
    /// Tasks published here whose terminal status has not been seen yet.
    issued: RwLock<HashSet<String>>,
    watchers: Mutex<HashMap<(String, String), ResponseWatch>>,
    store_lock: Mutex<()>,
}

impl TaskDispatcher {
    pub fn new(
        registry: Arc<ExchangeRegistry>,
        store: Arc<dyn TaskStatusStore>,
        config: DispatcherConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            config,
            identity: format!("watcher-{}", uuid::Uuid::new_v4()),
            waiters: RwLock::new(HashMap::new()),
            issued: RwLock::new(HashSet::new()),
            watchers: Mutex::new(HashMap::new()),
            store_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ExchangeRegistry> {
        &self.registry
    }

    /// Name of the queue carrying status reports for `queue`.
    pub fn response_queue(&self, queue: &str) -> String {
        format!("{}{}", queue, self.config.response_suffix)
    }

    /// Declare a task queue and its response queue in a domain.
    pub async fn create_task_queue(&self, domain: &str, queue: &str) -> Result<()> {
        let entry = self.registry.ensure_domain(domain).await?;
        entry
            .add_queues(
                entry.name(),
                vec![
                    QueueDefinition::routed_by_name(queue),
                    QueueDefinition::routed_by_name(self.response_queue(queue)),
                ],
            )
            .await?;
        info!(domain = %domain, queue = %queue, "Task queue created");
        Ok(())
    }

    /// Remove a task queue, its response queue and this dispatcher's watcher on it.
    pub async fn remove_task_queue(&self, domain: &str, queue: &str) -> Result<bool> {
        let entry = self.registry.ensure_domain(domain).await?;
        self.stop_watcher(domain, queue).await;
        let removed = entry.remove_queue(entry.name(), queue).await?;
        entry
            .remove_queue(entry.name(), &self.response_queue(queue))
            .await?;
        Ok(removed)
    }

    /// Publish a task with default content type and wait up to `timeout`
    /// (the configured default if `None`) for it to finish.
    pub async fn publish_task(
        self: &Arc<Self>,
        domain: &str,
        queue: &str,
        content: impl Into<String>,
        timeout: Option<Duration>,
        priority: i32,
    ) -> Result<TaskStatus> {
        let request = TaskRequest::new(content).with_priority(priority);
        self.publish_request(domain, queue, request, timeout).await
    }

    /// Publish a task and wait up to `timeout` for it to finish.
    ///
    /// A zero timeout returns as soon as the task is handed to the transport.
    /// On timeout the returned status is not terminal; the handler keeps
    /// running and its outcome is visible through `get_status`.
    #[tracing::instrument(name = "task.publish", skip_all, fields(domain = %domain, queue = %queue))]
    pub async fn publish_request(
        self: &Arc<Self>,
        domain: &str,
        queue: &str,
        request: TaskRequest,
        timeout: Option<Duration>,
    ) -> Result<TaskStatus> {
        let entry = self.registry.ensure_domain(domain).await?;
        if !entry.has_queue(entry.name(), queue).await {
            return Err(DispatchError::UnknownQueue {
                domain: domain.to_string(),
                queue: queue.to_string(),
            });
        }
        self.ensure_watcher(&entry, queue).await?;

        let task_id = format!("{}:{}", queue, uuid::Uuid::new_v4());
        let (sender, mut receiver) = watch::channel(TaskStatus::new(&task_id));
        let record = Arc::new(WaitRecord {
            domain: domain.to_string(),
            status: sender,
        });
        self.waiters
            .write()
            .await
            .insert(task_id.clone(), Arc::clone(&record));
        self.issued.write().await.insert(task_id.clone());

        record.status.send_modify(|status| {
            status.transition(TaskState::Pending);
        });

        let priority = request.priority.clamp(0, u8::MAX as i32) as u8;
        let payload = match serde_json::to_vec(&request.into_envelope(&task_id)) {
            Ok(payload) => payload,
            Err(e) => {
                self.forget(&task_id).await;
                return Err(e.into());
            }
        };
        let message = Message::of_kind(MessageKind::Task, payload)
            .with_content_type(JSON_CONTENT_TYPE)
            .with_priority(priority)
            .with_correlation_id(&task_id);

        if let Err(e) = entry.transport().publish(entry.name(), queue, message).await {
            self.forget(&task_id).await;
            return Err(e.into());
        }
        debug!(task_id = %task_id, "Task published");

        let timeout = timeout.unwrap_or(self.config.default_timeout);
        if !timeout.is_zero() {
            match tokio::time::timeout(timeout, receiver.wait_for(TaskStatus::is_finished)).await {
                Ok(Ok(_)) => debug!(task_id = %task_id, "Task finished"),
                Ok(Err(_)) => warn!(task_id = %task_id, "Wait record dropped"),
                Err(_) => info!(
                    task_id = %task_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Task still running after timeout"
                ),
            }
        }

        // Removal and snapshot under one write lock: a completion either lands
        // in the snapshot or finds no waiter and goes to the store.
        let snapshot = {
            let mut waiters = self.waiters.write().await;
            waiters.remove(&task_id);
            record.status.borrow().clone()
        };
        if snapshot.is_finished() {
            self.issued.write().await.remove(&task_id);
        }
        self.store_merged(&snapshot).await?;
        Ok(snapshot)
    }

    /// Whether a task was published here and is still awaiting its outcome.
    pub async fn is_issued(&self, task_id: &str) -> bool {
        self.issued.read().await.contains(task_id)
    }

    /// Apply a report from a response queue, skipping tasks issued elsewhere.
    async fn accept_report(
        &self,
        domain: &str,
        queue: &str,
        status: &TaskStatus,
    ) -> Result<Option<Completion>> {
        if !self.is_issued(&status.task_id).await {
            debug!(
                domain = %domain,
                queue = %queue,
                task_id = %status.task_id,
                "Ignoring report for a task issued elsewhere"
            );
            return Ok(None);
        }
        let outcome = self.complete_task(domain, queue, status).await?;
        if outcome == Completion::Stored && status.is_finished() {
            self.issued.write().await.remove(&status.task_id);
        }
        Ok(Some(outcome))
    }

    async fn forget(&self, task_id: &str) {
        self.waiters.write().await.remove(task_id);
        self.issued.write().await.remove(task_id);
    }

    /// Apply a status report for a task published through `queue`.
    pub async fn complete_task(
        &self,
        domain: &str,
        queue: &str,
        status: &TaskStatus,
    ) -> Result<Completion> {
        {
            let waiters = self.waiters.read().await;
            if let Some(record) = waiters.get(&status.task_id) {
                let changed = record.status.send_if_modified(|held| held.merge(status));
                debug!(
                    domain = %domain,
                    queue = %queue,
                    task_id = %status.task_id,
                    changed,
                    "Completion delivered to waiting caller"
                );
                return Ok(Completion::Notified);
            }
        }

        self.store_merged(status).await?;
        debug!(
            domain = %domain,
            queue = %queue,
            task_id = %status.task_id,
            "Completion stored"
        );
        Ok(Completion::Stored)
    }

    /// Publish a status report to `{queue}-response`.
    pub async fn publish_task_response(
        &self,
        domain: &str,
        queue: &str,
        status: &TaskStatus,
    ) -> Result<()> {
        let entry = self.registry.ensure_domain(domain).await?;
        let response_queue = self.response_queue(queue);
        let payload = serde_json::to_vec(status)?;
        let message = Message::of_kind(MessageKind::TaskResponse, payload)
            .with_content_type(JSON_CONTENT_TYPE)
            .with_correlation_id(&status.task_id);
        entry
            .transport()
            .publish(entry.name(), &response_queue, message)
            .await?;
        debug!(task_id = %status.task_id, queue = %response_queue, "Task response published");
        Ok(())
    }

    /// Current status of a task: the live record if a caller is waiting,
    /// else the stored one.
    pub async fn get_status(&self, domain: &str, task_id: &str) -> Result<Option<TaskStatus>> {
        if let Some(record) = self.waiters.read().await.get(task_id) {
            return Ok(Some(record.status.borrow().clone()));
        }
        let status = self.store.read(task_id).await?;
        if status.is_none() {
            debug!(domain = %domain, task_id = %task_id, "Unknown task");
        }
        Ok(status)
    }

    /// In-flight tasks for a domain plus stored tasks on its queues.
    pub async fn list_tasks(&self, domain: &str) -> Result<Vec<TaskStatus>> {
        let mut tasks: HashMap<String, TaskStatus> = self
            .waiters
            .read()
            .await
            .iter()
            .filter(|(_, record)| record.domain == domain)
            .map(|(id, record)| (id.clone(), record.status.borrow().clone()))
            .collect();

        if let Some(entry) = self.registry.domain(domain).await {
            for status in self.store.list().await? {
                if tasks.contains_key(&status.task_id) {
                    continue;
                }
                let Some(queue) = status.queue() else {
                    continue;
                };
                if entry.has_queue(entry.name(), queue).await {
                    tasks.insert(status.task_id.clone(), status);
                }
            }
        }

        let mut tasks: Vec<TaskStatus> = tasks.into_values().collect();
        tasks.sort_by(|a, b| a.creation_time.cmp(&b.creation_time));
        Ok(tasks)
    }

    /// Stop every response watcher.
    pub async fn shutdown(&self) {
        let watchers: Vec<_> = self.watchers.lock().await.drain().collect();
        for ((domain, queue), watch) in watchers {
            if let Err(e) = watch.entry.transport().stop_consuming(&watch.tag).await {
                warn!(domain = %domain, queue = %queue, error = %e, "Failed to stop response watcher");
            }
        }
    }

    async fn store_merged(&self, status: &TaskStatus) -> Result<()> {
        let _guard = self.store_lock.lock().await;
        let merged = match self.store.read(&status.task_id).await? {
            Some(mut held) => {
                if !held.merge(status) {
                    return Ok(());
                }
                held
            }
            None => status.clone(),
        };
        self.store.write(&merged.task_id, &merged).await?;
        Ok(())
    }

    async fn ensure_watcher(self: &Arc<Self>, entry: &Arc<DomainEntry>, queue: &str) -> Result<()> {
        let key = (entry.name().to_string(), queue.to_string());
        let mut watchers = self.watchers.lock().await;
        if watchers.contains_key(&key) {
            return Ok(());
        }

        let handler = Arc::new(ResponseWatcher {
            dispatcher: Arc::downgrade(self),
            domain: entry.name().to_string(),
            queue: queue.to_string(),
        });
        let options = ConsumerOptions::group(self.identity.clone())
            .with_concurrency(self.config.consumer_concurrency)
            .ephemeral();
        let tag = entry
            .transport()
            .start_consuming(entry.name(), &self.response_queue(queue), options, handler)
            .await?;

        debug!(domain = %entry.name(), queue = %queue, consumer = %tag, "Response watcher started");
        watchers.insert(
            key,
            ResponseWatch {
                entry: Arc::clone(entry),
                tag,
            },
        );
        Ok(())
    }

    async fn stop_watcher(&self, domain: &str, queue: &str) {
        let watch = self
            .watchers
            .lock()
            .await
            .remove(&(domain.to_string(), queue.to_string()));
        if let Some(watch) = watch {
            if let Err(e) = watch.entry.transport().stop_consuming(&watch.tag).await {
                warn!(domain = %domain, queue = %queue, error = %e, "Failed to stop response watcher");
            }
        }
    }
}

/// Feeds status reports from a response queue into `complete_task`.
/// Reports for tasks this dispatcher did not issue are dropped.
struct ResponseWatcher {
    dispatcher: Weak<TaskDispatcher>,
    domain: String,
    queue: String,
}

impl QueueHandler for ResponseWatcher {
    fn handle(
        &self,
        delivery: Arc<Delivery>,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        let dispatcher = self.dispatcher.clone();
        let domain = self.domain.clone();
        let queue = self.queue.clone();
        Box::pin(async move {
            let Some(dispatcher) = dispatcher.upgrade() else {
                return Ok(());
            };
            let status = decode_status(&delivery.payload)?;
            dispatcher
                .accept_report(&domain, &queue, &status)
                .await
                .map_err(|e| HandlerError::Failed(e.to_string()))?;
            Ok(())
        })
    }
}

fn decode_status(payload: &Bytes) -> std::result::Result<TaskStatus, HandlerError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Decode a task envelope from a delivery payload.
pub(crate) fn decode_envelope(payload: &Bytes) -> std::result::Result<TaskEnvelope, HandlerError> {
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests;
