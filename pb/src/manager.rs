//! The process manager trait

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::descriptor::ProcessDescriptor;
use crate::error::BusResult;

/// Receiving end of a bus subscription
///
/// Dropping the receiver releases the subscription.
pub type BusReceiver = mpsc::UnboundedReceiver<Value>;

/// Client-side view of a cluster process manager
///
/// Delivery on the bus is at-most-once and best-effort within the host.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    /// Open a session with the manager (required for discovery, bus and direct sends)
    async fn connect_bus(&self) -> BusResult<()>;

    /// Close the session
    async fn disconnect_bus(&self) -> BusResult<()>;

    /// Snapshot of every instance the manager knows about
    async fn list_processes(&self) -> BusResult<Vec<ProcessDescriptor>>;

    /// Subscribe to one bus channel
    async fn subscribe(&self, channel: &str) -> BusResult<BusReceiver>;

    /// Deliver a packet into one instance's inbox
    async fn send_to_instance(&self, instance_id: u32, packet: Value) -> BusResult<()>;

    /// Deliver a packet from this instance to its supervising parent
    ///
    /// The parent republishes it on the bus channel named by the packet's `type` field.
    async fn send_to_parent(&self, packet: Value) -> BusResult<()>;
}
