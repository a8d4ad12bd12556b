//! Courier - pluggable task, queue and topic dispatch
//!
//! Independent processes exchange tasks, broadcast events, topic messages and
//! RPC calls through named exchanges, over an in-memory broker, AMQP or
//! Google Pub/Sub.

pub mod config;
pub mod dispatch;
pub mod exchange;
pub mod pipeline;
pub mod rpc;
pub mod subscriber;
pub mod task;
pub mod topic;
pub mod transport;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::CourierConfig;
pub use dispatch::{Completion, DispatchError, DispatcherConfig, TaskDispatcher};
pub use exchange::{ExchangeDefinition, ExchangeRegistry, ExchangeType, QueueDefinition};
pub use pipeline::Pipeline;
pub use rpc::{RpcClient, RpcError, RpcHandler, RpcParams, RpcServer};
pub use subscriber::{Subscriber, SubscriberRegistry};
pub use task::{Task, TaskRequest, TaskState, TaskStatus, TaskStatusStore};
pub use topic::TopicBus;
pub use transport::{
    HandlerError, MemoryBroker, TopicHandle, TopicMessage, TopicMessageHandler, TransportError,
    TransportFactory, TransportHandler, TransportKind, TransportSettings,
};
