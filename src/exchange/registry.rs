//! Domain to transport mapping.
//!
//! Each domain owns one transport connection and the exchange topology
//! declared through it. Connections are opened lazily on first use.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{ExchangeDefinition, ExchangeType, QueueDefinition};
use crate::transport::{TransportError, TransportFactory, TransportHandler, TransportSettings};

/// Errors raised while resolving a domain or changing its topology.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("No transport configured for domain '{0}'")]
    UnknownDomain(String),

    #[error("Exchange '{exchange}' is {existing}, cannot redeclare as {requested}")]
    ExchangeTypeMismatch {
        exchange: String,
        existing: ExchangeType,
        requested: ExchangeType,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// A connected domain: its transport and the exchanges declared through it.
pub struct DomainEntry {
    name: String,
    transport: Arc<dyn TransportHandler>,
    exchanges: Mutex<HashMap<String, ExchangeDefinition>>,
}

impl DomainEntry {
    fn new(name: &str, transport: Arc<dyn TransportHandler>) -> Self {
        Self {
            name: name.to_string(),
            transport,
            exchanges: Mutex::new(HashMap::new()),
        }
    }

    /// Domain name. Also the name of the domain's standard exchange.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport(&self) -> &Arc<dyn TransportHandler> {
        &self.transport
    }

    /// Declare an exchange, merging its queues into what is already known.
    ///
    /// The merged definition is handed to the transport on every call so new
    /// bindings take effect.
    pub async fn declare_exchange(&self, definition: ExchangeDefinition) -> Result<()> {
        let mut exchanges = self.exchanges.lock().await;
        let merged = match exchanges.get(&definition.name) {
            Some(existing) if existing.exchange_type != definition.exchange_type => {
                return Err(RegistryError::ExchangeTypeMismatch {
                    exchange: definition.name,
                    existing: existing.exchange_type,
                    requested: definition.exchange_type,
                });
            }
            Some(existing) => {
                let mut merged = existing.clone();
                for queue in definition.queues {
                    merged.add_queue(queue);
                }
                merged
            }
            None => definition,
        };

        self.transport.declare_exchange(&merged).await?;
        debug!(
            domain = %self.name,
            exchange = %merged.name,
            queues = merged.queues.len(),
            "Exchange declared"
        );
        exchanges.insert(merged.name.clone(), merged);
        Ok(())
    }

    /// Add queues to an already-known exchange.
    pub async fn add_queues(&self, exchange: &str, queues: Vec<QueueDefinition>) -> Result<()> {
        let exchange_type = self
            .exchange(exchange)
            .await
            .map(|e| e.exchange_type)
            .unwrap_or_default();
        let mut definition = ExchangeDefinition::new(exchange, exchange_type);
        for queue in queues {
            definition.add_queue(queue);
        }
        self.declare_exchange(definition).await
    }

    /// Remove a queue from the topology and the transport.
    ///
    /// Returns `false` if the queue was not declared.
    pub async fn remove_queue(&self, exchange: &str, queue: &str) -> Result<bool> {
        let removed = {
            let mut exchanges = self.exchanges.lock().await;
            exchanges
                .get_mut(exchange)
                .and_then(|e| e.remove_queue(queue))
                .is_some()
        };
        if removed {
            self.transport.delete_queue(exchange, queue).await?;
            info!(domain = %self.name, exchange = %exchange, queue = %queue, "Queue removed");
        }
        Ok(removed)
    }

    pub async fn has_queue(&self, exchange: &str, queue: &str) -> bool {
        self.exchanges
            .lock()
            .await
            .get(exchange)
            .is_some_and(|e| e.has_queue(queue))
    }

    pub async fn exchange(&self, name: &str) -> Option<ExchangeDefinition> {
        self.exchanges.lock().await.get(name).cloned()
    }

    /// Remove an exchange and its queues.
    pub async fn tear_down_exchange(&self, name: &str) -> Result<()> {
        self.exchanges.lock().await.remove(name);
        self.transport.tear_down_exchange(name).await?;
        Ok(())
    }
}

/// Maps logical domains to transport connections.
///
/// Domains are configured up front (by settings) or registered later; the
/// connection is opened by `ensure_domain` the first time a domain is used.
pub struct ExchangeRegistry {
    factory: TransportFactory,
    settings: RwLock<HashMap<String, TransportSettings>>,
    fallback: Option<TransportSettings>,
    domains: RwLock<HashMap<String, Arc<DomainEntry>>>,
    connect_lock: Mutex<()>,
}

impl ExchangeRegistry {
    pub fn new(factory: TransportFactory, settings: HashMap<String, TransportSettings>) -> Self {
        Self {
            factory,
            settings: RwLock::new(settings),
            fallback: None,
            domains: RwLock::new(HashMap::new()),
            connect_lock: Mutex::new(()),
        }
    }

    /// Registry where every domain, configured or not, uses the in-memory transport.
    pub fn in_memory(factory: TransportFactory) -> Self {
        Self::new(factory, HashMap::new()).with_fallback(TransportSettings::memory())
    }

    /// Settings used for domains with no explicit configuration.
    pub fn with_fallback(mut self, settings: TransportSettings) -> Self {
        self.fallback = Some(settings);
        self
    }

    pub fn factory(&self) -> &TransportFactory {
        &self.factory
    }

    /// Configure a domain. Takes effect the next time the domain connects.
    pub async fn register_domain(&self, domain: &str, settings: TransportSettings) {
        self.settings
            .write()
            .await
            .insert(domain.to_string(), settings);
    }

    /// Attach an existing transport to a domain, replacing any previous entry.
    pub async fn register_transport(
        &self,
        domain: &str,
        transport: Arc<dyn TransportHandler>,
    ) -> Result<Arc<DomainEntry>> {
        let entry = Arc::new(DomainEntry::new(domain, transport));
        entry
            .declare_exchange(ExchangeDefinition::standard_direct(domain))
            .await?;
        let previous = self
            .domains
            .write()
            .await
            .insert(domain.to_string(), Arc::clone(&entry));
        if let Some(previous) = previous {
            warn!(domain = %domain, "Replacing transport for domain");
            if let Err(e) = previous.transport.close().await {
                warn!(domain = %domain, error = %e, "Failed to close replaced transport");
            }
        }
        Ok(entry)
    }

    /// The entry for an already-connected domain.
    pub async fn domain(&self, domain: &str) -> Option<Arc<DomainEntry>> {
        self.domains.read().await.get(domain).cloned()
    }

    /// The entry for a domain, connecting it if needed.
    ///
    /// Connection failures are returned to the caller and not cached: the next
    /// call tries again.
    pub async fn ensure_domain(&self, domain: &str) -> Result<Arc<DomainEntry>> {
        if let Some(entry) = self.domain(domain).await {
            return Ok(entry);
        }

        let _guard = self.connect_lock.lock().await;
        if let Some(entry) = self.domain(domain).await {
            return Ok(entry);
        }

        let settings = self
            .settings
            .read()
            .await
            .get(domain)
            .cloned()
            .or_else(|| self.fallback.clone())
            .ok_or_else(|| RegistryError::UnknownDomain(domain.to_string()))?;

        let transport = self.factory.connect(&settings).await?;
        let entry = Arc::new(DomainEntry::new(domain, transport));
        entry
            .declare_exchange(ExchangeDefinition::standard_direct(domain))
            .await?;

        info!(domain = %domain, transport = %settings.kind, "Domain connected");
        self.domains
            .write()
            .await
            .insert(domain.to_string(), Arc::clone(&entry));
        Ok(entry)
    }

    /// Names of connected domains.
    pub async fn domains(&self) -> Vec<String> {
        let mut names: Vec<String> = self.domains.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Close every domain's transport.
    pub async fn close_all(&self) {
        let entries: Vec<_> = self.domains.write().await.drain().collect();
        for (domain, entry) in entries {
            if let Err(e) = entry.transport.close().await {
                warn!(domain = %domain, error = %e, "Failed to close transport");
            }
        }
    }
}
