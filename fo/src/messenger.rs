//! Messenger - one instance's complete view of the fanout layer
//!
//! Wires a handler registry, a pending table, a connection, a correlator and a
//! dispatcher together. Every piece is owned by the messenger, so any number
//! of messengers can live in one process (one per simulated instance in tests).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use procbus::ProcessManager;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::Config;
use crate::connection::ConnectionManager;
use crate::correlator::{Correlator, CorrelatorMetrics, GetMessagesOptions, PendingTable};
use crate::dispatcher::Dispatcher;
use crate::error::{FanoutResult, HandlerError};
use crate::identity::Identity;
use crate::registry::HandlerRegistry;

/// Scatter-gather messaging for one instance
pub struct Messenger {
    registry: HandlerRegistry,
    connection: Arc<ConnectionManager>,
    correlator: Correlator,
    dispatcher: Arc<Dispatcher>,
}

impl Messenger {
    /// Create a messenger using the configured default timeout
    pub fn new(identity: Identity, manager: Arc<dyn ProcessManager>, config: &Config) -> Self {
        Self::with_timeout(identity, manager, config.timeout())
    }

    /// Create a messenger with an explicit default timeout
    pub fn with_timeout(identity: Identity, manager: Arc<dyn ProcessManager>, default_timeout: Duration) -> Self {
        debug!(?identity, ?default_timeout, "Messenger::with_timeout: called");
        let registry = HandlerRegistry::new();
        let pending = PendingTable::new();
        let connection = Arc::new(ConnectionManager::new(manager, identity, pending.clone()));
        let correlator = Correlator::new(registry.clone(), connection.clone(), pending, default_timeout);
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), connection.clone()));

        Self {
            registry,
            connection,
            correlator,
            dispatcher,
        }
    }

    pub fn identity(&self) -> &Identity {
        self.connection.identity()
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Register (or replace) the async handler for a topic
    pub fn on_message<F, Fut>(&self, topic: impl Into<String>, handler: F) -> FanoutResult<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.registry.on_message(topic, handler)
    }

    /// Register (or replace) a synchronous handler for a topic
    pub fn on_message_sync<F>(&self, topic: impl Into<String>, handler: F) -> FanoutResult<()>
    where
        F: Fn(Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.registry.on_message_sync(topic, handler)
    }

    pub async fn connect(&self) -> FanoutResult<()> {
        self.connection.connect().await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub async fn disconnect(&self) -> FanoutResult<()> {
        self.connection.disconnect().await
    }

    /// Ask every same-named instance (self included) with default options
    pub async fn get_messages(&self, topic: &str, payload: Value) -> FanoutResult<Vec<Value>> {
        self.correlator
            .get_messages(topic, payload, GetMessagesOptions::default())
            .await
    }

    pub async fn get_messages_with(
        &self,
        topic: &str,
        payload: Value,
        options: GetMessagesOptions,
    ) -> FanoutResult<Vec<Value>> {
        self.correlator.get_messages(topic, payload, options).await
    }

    pub async fn get_messages_as<T>(&self, topic: &str, payload: Value, options: GetMessagesOptions) -> FanoutResult<Vec<T>>
    where
        T: DeserializeOwned,
    {
        self.correlator.get_messages_as(topic, payload, options).await
    }

    /// Answer requests arriving in this instance's inbox until it closes
    pub fn serve(&self, inbox: mpsc::UnboundedReceiver<Value>) -> JoinHandle<()> {
        self.dispatcher.clone().spawn(inbox)
    }

    pub fn metrics(&self) -> CorrelatorMetrics {
        self.correlator.metrics()
    }
}
