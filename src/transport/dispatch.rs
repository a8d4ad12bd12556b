//! Handler dispatch utilities.
//!
//! Every backend runs inbound messages through the same two pieces: a
//! span-wrapped handler invocation that logs failures, and a bounded worker
//! set that lets a consumer run several callbacks at once and drain them on stop.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, Instrument};

use super::{Delivery, HandlerError, QueueHandler, TopicMessage, TopicMessageHandler};

/// Invoke a queue handler for one delivery.
///
/// Errors are logged and swallowed: the caller acknowledges the message either
/// way. Returns `true` if the handler succeeded.
pub(crate) async fn invoke_handler(handler: &Arc<dyn QueueHandler>, delivery: Arc<Delivery>) -> bool {
    let consume_span = tracing::info_span!(
        "queue.consume",
        exchange = %delivery.exchange,
        queue = %delivery.queue,
        kind = delivery.properties.kind.as_str(),
    );

    async {
        match handler.handle(Arc::clone(&delivery)).await {
            Ok(()) => {
                debug!(routing_key = %delivery.routing_key, "Handler completed");
                true
            }
            Err(HandlerError::Decode(e)) => {
                error!(error = %e, "Malformed message, dropping");
                false
            }
            Err(e) => {
                error!(error = %e, "Handler failed");
                false
            }
        }
    }
    .instrument(consume_span)
    .await
}

/// Deliver a topic message to its listener.
pub(crate) async fn deliver_topic(handler: &Arc<dyn TopicMessageHandler>, message: TopicMessage) {
    let span = tracing::info_span!(
        "topic.consume",
        exchange = %message.exchange,
        topic = %message.topic,
    );
    handler.deliver_message(message).instrument(span).await;
}

/// Bounded set of in-flight handler callbacks for one consumer.
#[derive(Clone)]
pub(crate) struct ConsumerWorkers {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
}

impl ConsumerWorkers {
    pub(crate) fn new(concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            tracker: TaskTracker::new(),
        }
    }

    /// Run `work` once a slot is free. Waits for the slot, not for the work.
    pub(crate) async fn spawn<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return;
        };
        self.tracker.spawn(async move {
            work.await;
            drop(permit);
        });
    }

    /// Wait for every callback started so far to finish.
    pub(crate) async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{queue_handler_fn, MessageProperties};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn delivery() -> Arc<Delivery> {
        Arc::new(Delivery {
            exchange: "ex".to_string(),
            routing_key: "q".to_string(),
            queue: "q".to_string(),
            payload: Bytes::from_static(b"{}"),
            properties: MessageProperties::default(),
        })
    }

    #[tokio::test]
    async fn test_invoke_handler_reports_failure() {
        let failing = queue_handler_fn(|_| async { Err(HandlerError::Failed("nope".into())) });
        let passing = queue_handler_fn(|_| async { Ok(()) });

        assert!(!invoke_handler(&failing, delivery()).await);
        assert!(invoke_handler(&passing, delivery()).await);
    }

    #[tokio::test]
    async fn test_workers_respect_concurrency_and_drain() {
        let workers = ConsumerWorkers::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            let done = done.clone();
            workers
                .spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .await;
        }

        workers.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(workers.in_flight(), 0);
    }
}
