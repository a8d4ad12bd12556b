//! Request/reply over an asynchronous transport.
//!
//! `RpcClient` sends `{fnName, params}` to a named queue on the default
//! exchange and waits for the reply carrying the same correlation id on its
//! private reply queue. One reply queue and one reply consumer exist per
//! client; concurrent calls share them.
//!
//! `RpcServer` consumes requests from a queue, runs an `RpcHandler` and
//! answers on the request's `reply_to` queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{oneshot, Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatch::JSON_CONTENT_TYPE;
use crate::transport::{
    ConsumerOptions, ConsumerTag, Delivery, HandlerError, Message, MessageKind, QueueHandler,
    TransportError, TransportHandler, DEFAULT_EXCHANGE,
};

/// Consumer group shared by every server instance of a queue.
const SERVER_GROUP: &str = "rpc-server";
/// Consumer group of a client's reply consumer.
const REPLY_GROUP: &str = "rpc-reply";

/// Parameters and results of an RPC call.
pub type RpcParams = Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("RPC '{function}' on '{queue}' timed out after {timeout:?}")]
    Timeout {
        queue: String,
        function: String,
        timeout: Duration,
    },

    #[error("RPC cancelled")]
    Cancelled,

    #[error("Transport closed while waiting for reply")]
    TransportClosed,

    #[error("Remote handler failed: {0}")]
    Remote(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Registry(#[from] crate::exchange::RegistryError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, RpcError>;

/// Request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcEnvelope {
    pub fn_name: String,
    #[serde(default)]
    pub params: RpcParams,
}

type PendingReplies = Arc<Mutex<HashMap<String, oneshot::Sender<Arc<Delivery>>>>>;

struct ReplyChannel {
    queue: String,
    tag: ConsumerTag,
}

/// Client side of the RPC pattern.
pub struct RpcClient {
    transport: Arc<dyn TransportHandler>,
    reply: OnceCell<ReplyChannel>,
    pending: PendingReplies,
    closed: CancellationToken,
}

impl RpcClient {
    pub fn new(transport: Arc<dyn TransportHandler>) -> Self {
        Self {
            transport,
            reply: OnceCell::new(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            closed: CancellationToken::new(),
        }
    }

    /// Name of the reply queue, once the first call has created it.
    pub fn reply_queue(&self) -> Option<&str> {
        self.reply.get().map(|r| r.queue.as_str())
    }

    /// Number of calls waiting for a reply.
    pub async fn in_flight(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Call `function` on the server consuming `queue`.
    pub async fn call(
        &self,
        queue: &str,
        function: &str,
        params: RpcParams,
        timeout: Duration,
    ) -> Result<RpcParams> {
        self.call_with_cancel(queue, function, params, timeout, &CancellationToken::new())
            .await
    }

    /// Like `call`, but gives up with `RpcError::Cancelled` when `cancel` fires.
    #[tracing::instrument(name = "rpc.call", skip_all, fields(queue = %queue, function = %function))]
    pub async fn call_with_cancel(
        &self,
        queue: &str,
        function: &str,
        params: RpcParams,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<RpcParams> {
        if self.closed.is_cancelled() {
            return Err(RpcError::TransportClosed);
        }
        let reply = self.reply.get_or_try_init(|| self.open_reply_channel()).await?;

        let correlation_id = uuid::Uuid::new_v4().to_string();
        let payload = serde_json::to_vec(&RpcEnvelope {
            fn_name: function.to_string(),
            params,
        })?;

        let (sender, receiver) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(correlation_id.clone(), sender);

        let message = Message::of_kind(MessageKind::RpcRequest, payload)
            .with_content_type(JSON_CONTENT_TYPE)
            .with_correlation_id(&correlation_id)
            .with_reply_to(&reply.queue);

        if let Err(e) = self.transport.publish(DEFAULT_EXCHANGE, queue, message).await {
            self.pending.lock().await.remove(&correlation_id);
            return Err(e.into());
        }
        debug!(correlation_id = %correlation_id, "RPC request sent");

        let shutdown = self.transport.shutdown_token();
        let outcome = tokio::select! {
            reply = receiver => reply.map_err(|_| RpcError::TransportClosed),
            _ = tokio::time::sleep(timeout) => Err(RpcError::Timeout {
                queue: queue.to_string(),
                function: function.to_string(),
                timeout,
            }),
            _ = cancel.cancelled() => Err(RpcError::Cancelled),
            _ = shutdown.cancelled() => Err(RpcError::TransportClosed),
            _ = self.closed.cancelled() => Err(RpcError::TransportClosed),
        };
        self.pending.lock().await.remove(&correlation_id);

        let delivery = outcome?;
        decode_reply(&delivery)
    }

    /// Stop the reply consumer and delete the reply queue.
    ///
    /// Later calls fail with `RpcError::TransportClosed`.
    pub async fn close(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        if let Some(reply) = self.reply.get() {
            self.transport.stop_consuming(&reply.tag).await?;
            self.transport
                .delete_queue(DEFAULT_EXCHANGE, &reply.queue)
                .await?;
        }
        // Waiters observe a dropped sender
        self.pending.lock().await.clear();
        Ok(())
    }

    async fn open_reply_channel(&self) -> Result<ReplyChannel> {
        let queue = self.transport.declare_private_queue().await?;
        let handler = Arc::new(ReplyHandler {
            pending: Arc::clone(&self.pending),
        });
        let tag = self
            .transport
            .start_consuming(
                DEFAULT_EXCHANGE,
                &queue,
                ConsumerOptions::group(REPLY_GROUP).with_concurrency(1).ephemeral(),
                handler,
            )
            .await?;
        info!(queue = %queue, "RPC reply queue ready");
        Ok(ReplyChannel { queue, tag })
    }
}

fn decode_reply(delivery: &Delivery) -> Result<RpcParams> {
    let body: RpcParams = serde_json::from_slice(&delivery.payload)?;
    if delivery.properties.kind == MessageKind::RpcFault {
        let message = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(RpcError::Remote(message));
    }
    Ok(body)
}

/// Hands each reply to the call waiting on its correlation id.
struct ReplyHandler {
    pending: PendingReplies,
}

impl QueueHandler for ReplyHandler {
    fn handle(
        &self,
        delivery: Arc<Delivery>,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        let pending = Arc::clone(&self.pending);
        Box::pin(async move {
            let Some(correlation_id) = delivery.properties.correlation_id.clone() else {
                debug!("Reply without correlation id dropped");
                return Ok(());
            };
            let waiter = pending.lock().await.remove(&correlation_id);
            match waiter {
                Some(sender) => {
                    if sender.send(delivery).is_err() {
                        debug!(correlation_id = %correlation_id, "Caller stopped waiting");
                    }
                }
                None => debug!(correlation_id = %correlation_id, "Unmatched reply dropped"),
            }
            Ok(())
        })
    }
}

/// Server-side function dispatch.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn call(&self, function: &str, params: RpcParams) -> std::result::Result<RpcParams, HandlerError>;
}

/// Serves RPC requests from named queues.
pub struct RpcServer {
    transport: Arc<dyn TransportHandler>,
    served: Mutex<HashMap<String, ConsumerTag>>,
}

impl RpcServer {
    pub fn new(transport: Arc<dyn TransportHandler>) -> Self {
        Self {
            transport,
            served: Mutex::new(HashMap::new()),
        }
    }

    /// Start answering requests sent to `queue`.
    ///
    /// Several servers on one queue compete for requests.
    pub async fn serve(
        &self,
        queue: &str,
        handler: Arc<dyn RpcHandler>,
        concurrency: usize,
    ) -> Result<ConsumerTag> {
        let mut served = self.served.lock().await;
        if let Some(tag) = served.get(queue) {
            warn!(queue = %queue, "Queue already served");
            return Ok(tag.clone());
        }

        let responder = Arc::new(RequestHandler {
            transport: Arc::clone(&self.transport),
            handler,
        });
        let tag = self
            .transport
            .start_consuming(
                DEFAULT_EXCHANGE,
                queue,
                ConsumerOptions::group(SERVER_GROUP).with_concurrency(concurrency),
                responder,
            )
            .await?;
        info!(queue = %queue, consumer = %tag, "RPC server started");
        served.insert(queue.to_string(), tag.clone());
        Ok(tag)
    }

    /// Stop serving `queue`. Returns `false` if it was not served.
    pub async fn stop(&self, queue: &str) -> Result<bool> {
        let tag = self.served.lock().await.remove(queue);
        match tag {
            Some(tag) => {
                self.transport.stop_consuming(&tag).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn stop_all(&self) {
        let all: Vec<_> = self.served.lock().await.drain().collect();
        for (queue, tag) in all {
            if let Err(e) = self.transport.stop_consuming(&tag).await {
                warn!(queue = %queue, error = %e, "Failed to stop RPC server");
            }
        }
    }
}

struct RequestHandler {
    transport: Arc<dyn TransportHandler>,
    handler: Arc<dyn RpcHandler>,
}

impl QueueHandler for RequestHandler {
    fn handle(
        &self,
        delivery: Arc<Delivery>,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        let transport = Arc::clone(&self.transport);
        let handler = Arc::clone(&self.handler);
        Box::pin(async move {
            let (Some(reply_to), Some(correlation_id)) = (
                delivery.properties.reply_to.clone(),
                delivery.properties.correlation_id.clone(),
            ) else {
                return Err(HandlerError::Failed(
                    "RPC request without reply_to or correlation id".to_string(),
                ));
            };

            let envelope: RpcEnvelope = serde_json::from_slice(&delivery.payload)?;
            let (kind, body) = match handler.call(&envelope.fn_name, envelope.params).await {
                Ok(result) => (MessageKind::RpcReply, result),
                Err(e) => {
                    warn!(function = %envelope.fn_name, error = %e, "RPC handler failed");
                    let mut fault = RpcParams::new();
                    fault.insert("error".to_string(), Value::String(e.to_string()));
                    (MessageKind::RpcFault, fault)
                }
            };

            let reply = Message::of_kind(kind, serde_json::to_vec(&body)?)
                .with_content_type(JSON_CONTENT_TYPE)
                .with_correlation_id(correlation_id);
            transport.publish(DEFAULT_EXCHANGE, &reply_to, reply).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryBroker, MemoryTransport};
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl RpcHandler for Echo {
        async fn call(
            &self,
            function: &str,
            params: RpcParams,
        ) -> std::result::Result<RpcParams, HandlerError> {
            match function {
                "echo" => Ok(params),
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(params)
                }
                other => Err(HandlerError::Failed(format!("no function {}", other))),
            }
        }
    }

    fn params(value: Value) -> RpcParams {
        match value {
            Value::Object(map) => map,
            _ => RpcParams::new(),
        }
    }

    async fn setup() -> (RpcClient, RpcServer) {
        let broker = MemoryBroker::new();
        let client = RpcClient::new(Arc::new(MemoryTransport::connect(&broker)));
        let server = RpcServer::new(Arc::new(MemoryTransport::connect(&broker)));
        server.serve("calc", Arc::new(Echo), 4).await.unwrap();
        (client, server)
    }

    #[test]
    fn test_envelope_shape() {
        let envelope = RpcEnvelope {
            fn_name: "echo".to_string(),
            params: params(json!({"a": 1})),
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value, json!({"fnName": "echo", "params": {"a": 1}}));
    }

    #[tokio::test]
    async fn test_call_returns_reply() {
        let (client, _server) = setup().await;

        let reply = client
            .call("calc", "echo", params(json!({"x": 42})), Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(reply.get("x"), Some(&json!(42)));
        assert_eq!(client.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_get_their_own_replies() {
        let (client, _server) = setup().await;

        let (a, b) = tokio::join!(
            client.call("calc", "echo", params(json!({"who": "a"})), Duration::from_secs(2)),
            client.call("calc", "echo", params(json!({"who": "b"})), Duration::from_secs(2)),
        );

        assert_eq!(a.unwrap().get("who"), Some(&json!("a")));
        assert_eq!(b.unwrap().get("who"), Some(&json!("b")));
    }

    #[tokio::test]
    async fn test_remote_failure() {
        let (client, _server) = setup().await;

        let result = client
            .call("calc", "missing", RpcParams::new(), Duration::from_secs(2))
            .await;

        assert!(matches!(result, Err(RpcError::Remote(msg)) if msg.contains("no function missing")));
    }

    #[tokio::test]
    async fn test_timeout_and_late_reply_dropped() {
        let (client, _server) = setup().await;

        let result = client
            .call("calc", "slow", RpcParams::new(), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(RpcError::Timeout { .. })));
        assert_eq!(client.in_flight().await, 0);

        // The late reply arrives and is dropped; the next call is unaffected
        tokio::time::sleep(Duration::from_millis(600)).await;
        let reply = client
            .call("calc", "echo", params(json!({"n": 2})), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply.get("n"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let (client, _server) = setup().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = client
            .call_with_cancel("calc", "slow", RpcParams::new(), Duration::from_secs(5), &cancel)
            .await;

        assert!(matches!(result, Err(RpcError::Cancelled)));
    }

    #[tokio::test]
    async fn test_transport_close_wakes_caller() {
        let broker = MemoryBroker::new();
        let transport: Arc<dyn TransportHandler> = Arc::new(MemoryTransport::connect(&broker));
        let client = Arc::new(RpcClient::new(Arc::clone(&transport)));

        // Nobody serves this queue; the call can only end by shutdown
        let caller = Arc::clone(&client);
        let call = tokio::spawn(async move {
            caller
                .call("nobody", "echo", RpcParams::new(), Duration::from_secs(10))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.close().await.unwrap();

        let result = call.await.unwrap();
        assert!(matches!(result, Err(RpcError::TransportClosed)));
    }

    #[tokio::test]
    async fn test_call_after_close_fails_fast() {
        let (client, _server) = setup().await;
        client
            .call("calc", "echo", RpcParams::new(), Duration::from_secs(2))
            .await
            .unwrap();

        client.close().await.unwrap();
        let result = client
            .call("calc", "echo", RpcParams::new(), Duration::from_secs(10))
            .await;

        assert!(matches!(result, Err(RpcError::TransportClosed)));
        assert_eq!(client.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_reply_queue_shared_across_calls() {
        let (client, _server) = setup().await;
        client
            .call("calc", "echo", RpcParams::new(), Duration::from_secs(2))
            .await
            .unwrap();
        let first = client.reply_queue().map(str::to_string);
        client
            .call("calc", "echo", RpcParams::new(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(client.reply_queue().map(str::to_string), first);
    }
}
