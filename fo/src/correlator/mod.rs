//! Request correlator - scatter a request to sibling instances, gather the replies
//!
//! One `get_messages` call:
//! - **Plan:** snapshot the process list and split eligible instances into self and remote
//! - **Scatter:** invoke self directly, send one request per remote target
//! - **Gather:** wait until every target answered, or the deadline passes

mod options;
mod pending;
mod plan;

use std::sync::Arc;
use std::time::Duration;

use procbus::ProcessDescriptor;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::connection::ConnectionManager;
use crate::envelope::{RequestEnvelope, RequestId};
use crate::error::{FanoutError, FanoutResult};
use crate::identity::Identity;
use crate::registry::HandlerRegistry;

pub use options::{GetMessagesOptions, ProcessFilter};
pub(crate) use pending::PendingGuard;
pub use pending::{CorrelatorMetrics, Demux, PendingTable};
pub use plan::TargetPlan;

/// Default aggregation timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Runs scatter-gather calls over a connection
pub struct Correlator {
    registry: HandlerRegistry,
    connection: Arc<ConnectionManager>,
    pending: PendingTable,
    default_timeout: Duration,
}

impl Correlator {
    pub fn new(
        registry: HandlerRegistry,
        connection: Arc<ConnectionManager>,
        pending: PendingTable,
        default_timeout: Duration,
    ) -> Self {
        debug!(?default_timeout, "Correlator::new: called");
        Self {
            registry,
            connection,
            pending,
            default_timeout,
        }
    }

    pub fn identity(&self) -> &Identity {
        self.connection.identity()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn metrics(&self) -> CorrelatorMetrics {
        self.pending.metrics()
    }

    /// Ask every eligible instance for `topic` and collect all replies
    ///
    /// All-or-nothing: either one result per target (self results first, then
    /// remote replies in arrival order) or an error.
    pub async fn get_messages(
        &self,
        topic: &str,
        payload: Value,
        options: GetMessagesOptions,
    ) -> FanoutResult<Vec<Value>> {
        debug!(%topic, ?options, "Correlator::get_messages: called");
        if !self.connection.is_connected() {
            return Err(FanoutError::NotConnected);
        }

        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;
        let guard = PendingGuard::new(self.pending.clone(), RequestId::generate());

        // timeout_at polls the gather future before its timer, so a call whose
        // last reply already claimed the pending entry is never reported as timed out
        match tokio::time::timeout_at(deadline, self.gather(topic, &payload, &options, &guard)).await {
            Ok(result) => result,
            Err(_) => {
                let outstanding = guard.expire();
                Err(FanoutError::Timeout {
                    topic: topic.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    outstanding,
                })
            }
        }
    }

    /// Like [`get_messages`](Self::get_messages), decoding every result as `T`
    pub async fn get_messages_as<T>(&self, topic: &str, payload: Value, options: GetMessagesOptions) -> FanoutResult<Vec<T>>
    where
        T: DeserializeOwned,
    {
        self.get_messages(topic, payload, options)
            .await?
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(FanoutError::from))
            .collect()
    }

    async fn gather(
        &self,
        topic: &str,
        payload: &Value,
        options: &GetMessagesOptions,
        guard: &PendingGuard,
    ) -> FanoutResult<Vec<Value>> {
        let processes = self
            .connection
            .manager()
            .list_processes()
            .await
            .map_err(FanoutError::Discovery)?;

        let identity = self.identity();
        let plan = match &options.filter {
            Some(filter) => TargetPlan::partition(&processes, identity, |p| filter(p), options.include_self_if_unmanaged),
            None => TargetPlan::partition(
                &processes,
                identity,
                |p| same_name(identity, p),
                options.include_self_if_unmanaged,
            ),
        };
        debug!(%topic, local = plan.local, remote = ?plan.remote, "Correlator: planned targets");

        if plan.is_empty() {
            debug!(%topic, "Correlator: no eligible targets");
            return Ok(Vec::new());
        }

        // Self cannot answer, so nothing may reach the bus for this call
        if plan.local && !self.registry.contains(topic) {
            return Err(FanoutError::HandlerNotFound(topic.to_string()));
        }

        let (remote, local) = tokio::try_join!(
            self.scatter(topic, payload, &plan.remote, guard),
            self.resolve_local(topic, payload, plan.local, guard),
        )?;

        let mut results = Vec::with_capacity(plan.expected_results());
        results.extend(local);
        results.extend(remote);
        info!(%topic, results = results.len(), request_id = %guard.request_id(), "Correlator: gathered replies");
        Ok(results)
    }

    async fn resolve_local(
        &self,
        topic: &str,
        payload: &Value,
        local: bool,
        guard: &PendingGuard,
    ) -> FanoutResult<Option<Value>> {
        if !local {
            return Ok(None);
        }
        debug!(%topic, "Correlator: resolving self directly");
        guard.set_local_outstanding(true);
        let result = self.registry.invoke(topic, payload.clone()).await;
        guard.set_local_outstanding(false);
        result.map(Some)
    }

    async fn scatter(&self, topic: &str, payload: &Value, targets: &[u32], guard: &PendingGuard) -> FanoutResult<Vec<Value>> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        // Register before sending so no reply can beat its entry into the table
        let done = guard.register(topic, targets)?;
        let request = RequestEnvelope::new(
            topic,
            self.identity().instance_id,
            payload.clone(),
            guard.request_id().clone(),
        );
        let packet = request.to_packet()?;

        let manager = self.connection.manager();
        for &instance_id in targets {
            manager
                .send_to_instance(instance_id, packet.clone())
                .await
                .map_err(|source| FanoutError::Delivery { instance_id, source })?;
        }
        debug!(%topic, request_id = %guard.request_id(), targets = targets.len(), "Correlator: requests sent");

        match done.await {
            Ok(replies) => Ok(replies),
            // An entry only leaves the table unanswered through this call's guard,
            // so there is nothing left to do but wait for the deadline
            Err(_) => std::future::pending().await,
        }
    }
}

fn same_name(identity: &Identity, process: &ProcessDescriptor) -> bool {
    identity
        .instance_name
        .as_deref()
        .is_some_and(|name| process.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use procbus::LocalCluster;
    use serde_json::json;

    fn correlator_for(cluster: &LocalCluster, identity: Identity, registry: HandlerRegistry) -> Correlator {
        let pending = PendingTable::new();
        let client: Arc<dyn procbus::ProcessManager> = match identity.instance_id {
            Some(_) => cluster.spawn(identity.instance_name.clone().unwrap_or_default()).client,
            None => Arc::new(cluster.client()),
        };
        let connection = Arc::new(ConnectionManager::new(client, identity, pending.clone()));
        Correlator::new(registry, connection, pending, DEFAULT_TIMEOUT)
    }

    #[tokio::test]
    async fn test_not_connected_fails_immediately() {
        let cluster = LocalCluster::new();
        let correlator = correlator_for(&cluster, Identity::managed(0, "svc"), HandlerRegistry::new());

        let started = std::time::Instant::now();
        let err = correlator
            .get_messages("ping", Value::Null, GetMessagesOptions::new().with_timeout(Duration::from_secs(5)))
            .await
            .unwrap_err();

        assert!(matches!(err, FanoutError::NotConnected));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_lone_instance_resolves_itself() {
        let cluster = LocalCluster::new();
        let registry = HandlerRegistry::new();
        registry.on_message_sync("ping", |_| Ok(json!("pong"))).unwrap();
        let correlator = correlator_for(&cluster, Identity::managed(0, "svc"), registry);
        correlator.connection.connect().await.unwrap();

        let results = correlator
            .get_messages("ping", Value::Null, GetMessagesOptions::new())
            .await
            .unwrap();
        assert_eq!(results, vec![json!("pong")]);
        assert!(correlator.pending.is_empty());
        assert_eq!(correlator.metrics().requests_started, 0);
    }

    #[tokio::test]
    async fn test_missing_local_handler_fails_call() {
        let cluster = LocalCluster::new();
        let correlator = correlator_for(&cluster, Identity::managed(0, "svc"), HandlerRegistry::new());
        correlator.connection.connect().await.unwrap();

        let err = correlator
            .get_messages("ping", Value::Null, GetMessagesOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FanoutError::HandlerNotFound(_)));
    }

    #[tokio::test]
    async fn test_slow_self_counts_as_outstanding() {
        let cluster = LocalCluster::new();
        let registry = HandlerRegistry::new();
        registry
            .on_message("slow", |_| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(json!("late"))
            })
            .unwrap();
        let correlator = correlator_for(&cluster, Identity::managed(0, "svc"), registry);
        correlator.connection.connect().await.unwrap();

        let err = correlator
            .get_messages("slow", Value::Null, GetMessagesOptions::new().with_timeout(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert!(matches!(err, FanoutError::Timeout { outstanding: 1, .. }));
        assert!(err.to_string().contains("(1 replies outstanding)"));
    }

    #[tokio::test]
    async fn test_unmanaged_caller_with_no_targets() {
        let cluster = LocalCluster::new();
        let registry = HandlerRegistry::new();
        registry.on_message_sync("ping", |_| Ok(json!("local"))).unwrap();
        let correlator = correlator_for(&cluster, Identity::unmanaged(Some("svc".to_string())), registry);
        correlator.connection.connect().await.unwrap();

        let none = correlator
            .get_messages("ping", Value::Null, GetMessagesOptions::new())
            .await
            .unwrap();
        assert!(none.is_empty());

        let with_self = correlator
            .get_messages("ping", Value::Null, GetMessagesOptions::new().include_self_if_unmanaged(true))
            .await
            .unwrap();
        assert_eq!(with_self, vec![json!("local")]);
    }

    #[tokio::test]
    async fn test_typed_results() {
        let cluster = LocalCluster::new();
        let registry = HandlerRegistry::new();
        registry.on_message_sync("count", |_| Ok(json!(41))).unwrap();
        let correlator = correlator_for(&cluster, Identity::managed(0, "svc"), registry);
        correlator.connection.connect().await.unwrap();

        let counts: Vec<u64> = correlator
            .get_messages_as("count", Value::Null, GetMessagesOptions::new())
            .await
            .unwrap();
        assert_eq!(counts, vec![41]);

        let err = correlator
            .get_messages_as::<String>("count", Value::Null, GetMessagesOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FanoutError::Codec(_)));
    }
}
