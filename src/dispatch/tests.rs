use super::*;
use crate::task::{InMemoryStatusStore, Task};
use crate::transport::{queue_handler_fn, MockTransport, TransportFactory};

fn dispatcher() -> Arc<TaskDispatcher> {
    let registry = Arc::new(ExchangeRegistry::in_memory(TransportFactory::new()));
    TaskDispatcher::new(
        registry,
        Arc::new(InMemoryStatusStore::new()),
        DispatcherConfig::default(),
    )
}

/// Start a raw worker on `queue` that answers every task after `delay`.
async fn start_worker(dispatcher: &Arc<TaskDispatcher>, queue: &str, delay: Duration, output: &str) {
    let entry = dispatcher.registry().ensure_domain("orders").await.unwrap();
    let responder = Arc::clone(dispatcher);
    let output = output.to_string();
    let handler = queue_handler_fn(move |delivery| {
        let responder = Arc::clone(&responder);
        let output = output.clone();
        async move {
            let envelope = decode_envelope(&delivery.payload)?;
            tokio::time::sleep(delay).await;
            let mut task = Task::received(&delivery.queue, envelope);
            task.add_output(output);
            task.complete();
            responder
                .publish_task_response("orders", &delivery.queue, task.status())
                .await
                .map_err(|e| HandlerError::Failed(e.to_string()))
        }
    });
    entry
        .transport()
        .start_consuming("orders", queue, ConsumerOptions::group("workers"), handler)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_publish_to_undeclared_queue() {
    let dispatcher = dispatcher();

    let result = dispatcher
        .publish_task("orders", "nowhere", "x", Some(Duration::ZERO), 0)
        .await;

    assert!(matches!(
        result,
        Err(DispatchError::UnknownQueue { queue, .. }) if queue == "nowhere"
    ));
}

#[tokio::test]
async fn test_publish_failure_is_returned_and_forgotten() {
    let registry = Arc::new(ExchangeRegistry::new(TransportFactory::new(), HashMap::new()));
    let mock = Arc::new(MockTransport::new());
    registry.register_transport("orders", mock.clone()).await.unwrap();
    let dispatcher = TaskDispatcher::new(
        registry,
        Arc::new(InMemoryStatusStore::new()),
        DispatcherConfig::default(),
    );
    dispatcher.create_task_queue("orders", "work").await.unwrap();
    mock.set_fail_on_publish(true).await;

    let result = dispatcher
        .publish_task("orders", "work", "payload", Some(Duration::from_millis(10)), 0)
        .await;

    match result {
        Err(DispatchError::Transport(err)) => assert!(err.failed_payload().is_some()),
        other => panic!("expected PublishFailed, got {:?}", other),
    }
    assert!(dispatcher.list_tasks("orders").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_envelope_published_with_task_properties() {
    let registry = Arc::new(ExchangeRegistry::new(TransportFactory::new(), HashMap::new()));
    let mock = Arc::new(MockTransport::new());
    registry.register_transport("orders", mock.clone()).await.unwrap();
    let dispatcher = TaskDispatcher::new(
        registry,
        Arc::new(InMemoryStatusStore::new()),
        DispatcherConfig::default(),
    );
    dispatcher.create_task_queue("orders", "work").await.unwrap();

    let status = dispatcher
        .publish_task("orders", "work", "Hello World", Some(Duration::ZERO), 7)
        .await
        .unwrap();

    let published = mock.take_published().await;
    assert_eq!(published.len(), 1);
    let sent = &published[0];
    assert_eq!(sent.exchange, "orders");
    assert_eq!(sent.routing_key, "work");
    assert_eq!(sent.message.properties.kind, MessageKind::Task);
    assert_eq!(sent.message.properties.priority, 7);
    assert_eq!(
        sent.message.properties.correlation_id.as_deref(),
        Some(status.task_id.as_str())
    );

    let envelope: TaskEnvelope = serde_json::from_slice(&sent.message.payload).unwrap();
    assert_eq!(envelope.content, "Hello World");
    assert!(envelope.task_id.starts_with("work:"));
}

#[tokio::test]
async fn test_zero_timeout_returns_pending() {
    let dispatcher = dispatcher();
    dispatcher.create_task_queue("orders", "work").await.unwrap();

    let status = dispatcher
        .publish_task("orders", "work", "job", Some(Duration::ZERO), 0)
        .await
        .unwrap();

    assert_eq!(status.current_state, TaskState::Pending);
    let stored = dispatcher
        .get_status("orders", &status.task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.current_state, TaskState::Pending);
}

#[tokio::test]
async fn test_response_completes_waiting_caller() {
    let dispatcher = dispatcher();
    dispatcher.create_task_queue("orders", "work").await.unwrap();
    start_worker(&dispatcher, "work", Duration::ZERO, "Response").await;

    let status = dispatcher
        .publish_task("orders", "work", "Hello World", Some(Duration::from_secs(5)), 0)
        .await
        .unwrap();

    assert_eq!(status.current_state, TaskState::Completed);
    assert_eq!(status.output, vec!["Response"]);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_then_complete_is_visible() {
    let dispatcher = dispatcher();
    dispatcher.create_task_queue("orders", "work").await.unwrap();
    start_worker(&dispatcher, "work", Duration::from_millis(4000), "late").await;

    let status = dispatcher
        .publish_task("orders", "work", "slow", Some(Duration::from_millis(2000)), 0)
        .await
        .unwrap();
    assert_ne!(status.current_state, TaskState::Completed);

    tokio::time::sleep(Duration::from_millis(3000)).await;

    let later = dispatcher
        .get_status("orders", &status.task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(later.current_state, TaskState::Completed);
    assert_eq!(later.output, vec!["late"]);
}

#[tokio::test]
async fn test_complete_without_waiter_is_stored() {
    let dispatcher = dispatcher();

    let mut status = TaskStatus::new("work:abc");
    status.transition(TaskState::Completed);
    status.add_output("done");

    let outcome = dispatcher
        .complete_task("orders", "work", &status)
        .await
        .unwrap();
    assert_eq!(outcome, Completion::Stored);

    // A stale report does not regress the stored record
    let mut stale = TaskStatus::new("work:abc");
    stale.transition(TaskState::Pending);
    dispatcher
        .complete_task("orders", "work", &stale)
        .await
        .unwrap();

    let stored = dispatcher
        .get_status("orders", "work:abc")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.current_state, TaskState::Completed);
    assert_eq!(stored.output, vec!["done"]);
}

#[tokio::test]
async fn test_watcher_ignores_tasks_issued_elsewhere() {
    let registry = Arc::new(ExchangeRegistry::in_memory(TransportFactory::new()));
    let first = TaskDispatcher::new(
        Arc::clone(&registry),
        Arc::new(InMemoryStatusStore::new()),
        DispatcherConfig::default(),
    );
    let second = TaskDispatcher::new(
        registry,
        Arc::new(InMemoryStatusStore::new()),
        DispatcherConfig::default(),
    );
    first.create_task_queue("orders", "work").await.unwrap();
    start_worker(&first, "work", Duration::ZERO, "done").await;

    // Both dispatchers now watch work-response
    let own = second
        .publish_task("orders", "work", "mine", Some(Duration::from_secs(5)), 0)
        .await
        .unwrap();
    assert_eq!(own.current_state, TaskState::Completed);

    let theirs = first
        .publish_task("orders", "work", "theirs", Some(Duration::from_secs(5)), 0)
        .await
        .unwrap();
    assert_eq!(theirs.current_state, TaskState::Completed);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(second
        .get_status("orders", &theirs.task_id)
        .await
        .unwrap()
        .is_none());
    assert!(second.get_status("orders", &own.task_id).await.unwrap().is_some());
    assert_eq!(second.list_tasks("orders").await.unwrap().len(), 1);
    assert!(!first.is_issued(&theirs.task_id).await);
    assert!(!second.is_issued(&own.task_id).await);
}

#[tokio::test]
async fn test_late_report_is_kept_until_terminal() {
    let dispatcher = dispatcher();
    dispatcher.create_task_queue("orders", "work").await.unwrap();
    start_worker(&dispatcher, "work", Duration::from_millis(150), "slow").await;

    let status = dispatcher
        .publish_task("orders", "work", "x", Some(Duration::ZERO), 0)
        .await
        .unwrap();
    assert!(dispatcher.is_issued(&status.task_id).await);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let stored = dispatcher
        .get_status("orders", &status.task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.current_state, TaskState::Completed);
    assert!(!dispatcher.is_issued(&status.task_id).await);
}

#[tokio::test]
async fn test_list_tasks_includes_in_flight_and_stored() {
    let dispatcher = dispatcher();
    dispatcher.create_task_queue("orders", "work").await.unwrap();

    let first = dispatcher
        .publish_task("orders", "work", "one", Some(Duration::ZERO), 0)
        .await
        .unwrap();

    let waiting = Arc::clone(&dispatcher);
    let pending = tokio::spawn(async move {
        waiting
            .publish_task("orders", "work", "two", Some(Duration::from_millis(200)), 0)
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let listed = dispatcher.list_tasks("orders").await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().any(|t| t.task_id == first.task_id));
    assert!(dispatcher.list_tasks("billing").await.unwrap().is_empty());

    pending.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_remove_task_queue() {
    let dispatcher = dispatcher();
    dispatcher.create_task_queue("orders", "work").await.unwrap();
    dispatcher
        .publish_task("orders", "work", "x", Some(Duration::ZERO), 0)
        .await
        .unwrap();

    assert!(dispatcher.remove_task_queue("orders", "work").await.unwrap());

    let entry = dispatcher.registry().domain("orders").await.unwrap();
    assert!(!entry.has_queue("orders", "work").await);
    assert!(!entry.has_queue("orders", "work-response").await);
}
