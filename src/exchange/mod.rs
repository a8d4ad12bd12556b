//! Exchange and queue topology.
//!
//! An exchange is a named routing domain. It owns queues, each bound with zero
//! or more routing keys. Definitions are plain values: they are handed to a
//! transport, which declares them idempotently.

pub mod registry;

use std::fmt;

use serde::Deserialize;

use crate::transport::routing::binding_matches;

pub use registry::{DomainEntry, ExchangeRegistry, RegistryError};

/// Queue names starting with this prefix get a transport-generated underlying name.
pub const ANONYMOUS_PREFIX: &str = "anon.";

/// How an exchange routes a message to its queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    /// Every bound queue receives every message.
    Fanout,
    /// Routing key must equal a binding key.
    #[default]
    Direct,
    /// Routing key is matched against `*`/`#` patterns.
    Topic,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fanout => "fanout",
            Self::Direct => "direct",
            Self::Topic => "topic",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queue and its route bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub name: String,
    pub bindings: Vec<String>,
}

impl QueueDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bindings: Vec::new(),
        }
    }

    /// A queue bound with its own name as routing key.
    pub fn routed_by_name(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            bindings: vec![name.clone()],
            name,
        }
    }

    pub fn with_binding(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        if !self.bindings.contains(&key) {
            self.bindings.push(key);
        }
        self
    }

    pub fn is_anonymous(&self) -> bool {
        self.name.starts_with(ANONYMOUS_PREFIX)
    }

    /// Whether a message published with `routing_key` reaches this queue.
    pub fn accepts(&self, exchange_type: ExchangeType, routing_key: &str) -> bool {
        binding_matches(exchange_type, &self.bindings, routing_key)
    }
}

/// An exchange and the queues bound to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub name: String,
    pub exchange_type: ExchangeType,
    pub queues: Vec<QueueDefinition>,
}

impl ExchangeDefinition {
    pub fn new(name: impl Into<String>, exchange_type: ExchangeType) -> Self {
        Self {
            name: name.into(),
            exchange_type,
            queues: Vec::new(),
        }
    }

    /// The exchange every domain starts with: DIRECT, named after the domain.
    pub fn standard_direct(domain: &str) -> Self {
        Self::new(domain, ExchangeType::Direct)
    }

    pub fn with_queue(mut self, queue: QueueDefinition) -> Self {
        self.add_queue(queue);
        self
    }

    pub fn queue(&self, name: &str) -> Option<&QueueDefinition> {
        self.queues.iter().find(|q| q.name == name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.queue(name).is_some()
    }

    /// Add a queue, or merge new bindings into an existing one of the same name.
    ///
    /// Returns `true` if the topology changed.
    pub fn add_queue(&mut self, queue: QueueDefinition) -> bool {
        match self.queues.iter_mut().find(|q| q.name == queue.name) {
            Some(existing) => {
                let mut changed = false;
                for key in queue.bindings {
                    if !existing.bindings.contains(&key) {
                        existing.bindings.push(key);
                        changed = true;
                    }
                }
                changed
            }
            None => {
                self.queues.push(queue);
                true
            }
        }
    }

    pub fn remove_queue(&mut self, name: &str) -> Option<QueueDefinition> {
        let idx = self.queues.iter().position(|q| q.name == name)?;
        Some(self.queues.remove(idx))
    }

    /// Queues a message published with `routing_key` is routed to.
    pub fn route<'a>(&'a self, routing_key: &'a str) -> impl Iterator<Item = &'a QueueDefinition> {
        self.queues
            .iter()
            .filter(move |q| q.accepts(self.exchange_type, routing_key))
    }
}
