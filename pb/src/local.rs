//! In-process process manager
//!
//! `LocalCluster` plays the role of the manager daemon: it assigns instance ids,
//! owns every instance's inbox sender, and fans bus packets out to subscribers.
//! Each simulated instance talks to it through its own [`LocalClient`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::descriptor::{ProcessDescriptor, ProcessStatus};
use crate::error::{BusError, BusResult};
use crate::manager::{BusReceiver, ProcessManager};

/// Environment variable carrying the instance id
pub const ID_ENV: &str = "pm_id";

/// Environment variable carrying the instance name
pub const NAME_ENV: &str = "name";

struct ProcessEntry {
    descriptor: ProcessDescriptor,
    inbox: Option<mpsc::UnboundedSender<Value>>,
}

#[derive(Default)]
struct ClusterState {
    unreachable: bool,
    next_id: u32,
    processes: BTreeMap<u32, ProcessEntry>,
    channels: HashMap<String, Vec<mpsc::UnboundedSender<Value>>>,
}

/// Shared in-process manager state
///
/// Cheap to clone; all clones see the same cluster.
#[derive(Clone, Default)]
pub struct LocalCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl LocalCluster {
    /// Create an empty cluster
    pub fn new() -> Self {
        debug!("LocalCluster::new: called");
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a managed instance with the given name
    ///
    /// Ids are assigned sequentially from 0, like a fresh manager daemon.
    pub fn spawn(&self, name: impl Into<String>) -> LocalInstance {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;

        let descriptor = ProcessDescriptor {
            instance_id: Some(id),
            name: name.clone(),
            pid: Some(std::process::id()),
            status: ProcessStatus::Online,
        };
        state.processes.insert(
            id,
            ProcessEntry {
                descriptor: descriptor.clone(),
                inbox: Some(tx),
            },
        );
        drop(state);

        info!(instance_id = id, %name, "LocalCluster: instance started");
        LocalInstance {
            id,
            descriptor,
            client: Arc::new(LocalClient::new(self.clone(), Some(id))),
            inbox: rx,
        }
    }

    /// Client for a process that is not supervised by this cluster
    pub fn client(&self) -> LocalClient {
        debug!("LocalCluster::client: creating unmanaged client");
        LocalClient::new(self.clone(), None)
    }

    /// Mark an instance stopped; it stays listed but stops accepting messages
    ///
    /// Returns false if the id is unknown.
    pub fn stop(&self, instance_id: u32) -> bool {
        let mut state = self.lock();
        match state.processes.get_mut(&instance_id) {
            Some(entry) => {
                entry.descriptor.status = ProcessStatus::Stopped;
                entry.inbox = None;
                info!(instance_id, "LocalCluster: instance stopped");
                true
            }
            None => false,
        }
    }

    /// Simulate the manager daemon going away (or coming back)
    pub fn set_reachable(&self, reachable: bool) {
        debug!(reachable, "LocalCluster::set_reachable: called");
        self.lock().unreachable = !reachable;
    }

    /// Current process table
    pub fn processes(&self) -> Vec<ProcessDescriptor> {
        self.lock().processes.values().map(|e| e.descriptor.clone()).collect()
    }

    /// Publish a packet on a bus channel
    ///
    /// Fire-and-forget: with no subscribers the packet is dropped.
    /// Returns the number of subscribers it was delivered to.
    pub fn publish(&self, channel: &str, packet: Value) -> usize {
        let mut state = self.lock();
        let Some(subscribers) = state.channels.get_mut(channel) else {
            debug!(%channel, "LocalCluster::publish: no subscribers");
            return 0;
        };

        subscribers.retain(|tx| !tx.is_closed());
        let mut delivered = 0;
        for tx in subscribers.iter() {
            if tx.send(packet.clone()).is_ok() {
                delivered += 1;
            }
        }
        debug!(%channel, delivered, "LocalCluster::publish: delivered");
        delivered
    }

    /// Number of live subscriptions on a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.lock()
            .channels
            .get(channel)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn ensure_reachable(&self) -> BusResult<()> {
        if self.lock().unreachable {
            return Err(BusError::Unreachable("manager daemon is not responding".to_string()));
        }
        Ok(())
    }

    fn add_subscriber(&self, channel: &str) -> BusReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().channels.entry(channel.to_string()).or_default().push(tx);
        rx
    }

    fn deliver(&self, instance_id: u32, packet: Value) -> BusResult<()> {
        let state = self.lock();
        let entry = state
            .processes
            .get(&instance_id)
            .ok_or(BusError::UnknownInstance(instance_id))?;
        let inbox = entry.inbox.as_ref().ok_or(BusError::InstanceOffline(instance_id))?;
        inbox.send(packet).map_err(|_| BusError::InstanceOffline(instance_id))
    }

    fn is_online(&self, instance_id: u32) -> bool {
        self.lock()
            .processes
            .get(&instance_id)
            .is_some_and(|e| e.descriptor.is_online())
    }
}

/// Connection from one process to the [`LocalCluster`]
pub struct LocalClient {
    cluster: LocalCluster,
    instance_id: Option<u32>,
    connected: AtomicBool,
}

impl LocalClient {
    fn new(cluster: LocalCluster, instance_id: Option<u32>) -> Self {
        Self {
            cluster,
            instance_id,
            connected: AtomicBool::new(false),
        }
    }

    /// Id of the instance this client belongs to (None if unmanaged)
    pub fn instance_id(&self) -> Option<u32> {
        self.instance_id
    }

    /// Whether `connect_bus` has been called without a matching `disconnect_bus`
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn ensure_session(&self) -> BusResult<()> {
        if !self.is_connected() {
            return Err(BusError::NotConnected);
        }
        self.cluster.ensure_reachable()
    }
}

#[async_trait]
impl ProcessManager for LocalClient {
    async fn connect_bus(&self) -> BusResult<()> {
        debug!(instance_id = ?self.instance_id, "LocalClient::connect_bus: called");
        self.cluster.ensure_reachable()?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect_bus(&self) -> BusResult<()> {
        debug!(instance_id = ?self.instance_id, "LocalClient::disconnect_bus: called");
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn list_processes(&self) -> BusResult<Vec<ProcessDescriptor>> {
        self.ensure_session()?;
        Ok(self.cluster.processes())
    }

    async fn subscribe(&self, channel: &str) -> BusResult<BusReceiver> {
        debug!(instance_id = ?self.instance_id, %channel, "LocalClient::subscribe: called");
        self.ensure_session()?;
        Ok(self.cluster.add_subscriber(channel))
    }

    async fn send_to_instance(&self, instance_id: u32, packet: Value) -> BusResult<()> {
        self.ensure_session()?;
        self.cluster.deliver(instance_id, packet)
    }

    async fn send_to_parent(&self, packet: Value) -> BusResult<()> {
        let instance_id = self.instance_id.ok_or(BusError::NoParent)?;
        self.cluster.ensure_reachable()?;
        if !self.cluster.is_online(instance_id) {
            return Err(BusError::InstanceOffline(instance_id));
        }

        let channel = packet
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| BusError::MalformedPacket("missing string field `type`".to_string()))?
            .to_string();

        if self.cluster.publish(&channel, packet) == 0 {
            warn!(instance_id, %channel, "LocalClient::send_to_parent: nobody listening");
        }
        Ok(())
    }
}

/// A managed instance: its descriptor, its client, and its inbox
pub struct LocalInstance {
    id: u32,
    pub descriptor: ProcessDescriptor,
    pub client: Arc<LocalClient>,
    pub inbox: mpsc::UnboundedReceiver<Value>,
}

impl LocalInstance {
    /// Manager-assigned id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Declared name
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// Environment the manager would hand to this process
    pub fn env(&self) -> HashMap<String, String> {
        HashMap::from([
            (ID_ENV.to_string(), self.id.to_string()),
            (NAME_ENV.to_string(), self.descriptor.name.clone()),
        ])
    }
}
