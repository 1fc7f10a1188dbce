//! Handler registry - topic to response-producing function

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use crate::error::{FanoutError, FanoutResult, HandlerError};

/// A registered message handler
pub type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, HandlerError>> + Send + Sync>;

/// Mapping from topic to handler
///
/// Cloning shares the underlying table. Entries are only ever replaced by
/// another registration for the same topic, never removed.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Handler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the async handler for a topic
    pub fn on_message<F, Fut>(&self, topic: impl Into<String>, handler: F) -> FanoutResult<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |payload| handler(payload).boxed());
        self.insert(topic.into(), handler)
    }

    /// Register (or replace) a synchronous handler for a topic
    pub fn on_message_sync<F>(&self, topic: impl Into<String>, handler: F) -> FanoutResult<()>
    where
        F: Fn(Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(move |payload| futures::future::ready(handler(payload)).boxed());
        self.insert(topic.into(), handler)
    }

    fn insert(&self, topic: String, handler: Handler) -> FanoutResult<()> {
        if topic.is_empty() {
            return Err(FanoutError::EmptyTopic);
        }
        debug!(%topic, "HandlerRegistry: registering handler");
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(topic.clone(), handler)
            .is_some();
        if replaced {
            debug!(%topic, "HandlerRegistry: replaced previous handler");
        }
        Ok(())
    }

    /// Look up the handler for a topic
    pub fn get(&self, topic: &str) -> Option<Handler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned()
    }

    /// Whether a handler is registered for the topic
    pub fn contains(&self, topic: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(topic)
    }

    /// Registered topics, sorted
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        topics.sort();
        topics
    }

    /// Call the handler for a topic
    pub async fn invoke(&self, topic: &str, payload: Value) -> FanoutResult<Value> {
        let handler = self
            .get(topic)
            .ok_or_else(|| FanoutError::HandlerNotFound(topic.to_string()))?;
        debug!(%topic, "HandlerRegistry::invoke: calling handler");
        handler(payload).await.map_err(|source| FanoutError::Handler {
            topic: topic.to_string(),
            source,
        })
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry").field("topics", &self.topics()).finish()
    }
}
