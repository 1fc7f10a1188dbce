//! ProcBus - boundary with the cluster process manager
//!
//! A pm2-style process manager gives every supervised instance three things:
//!
//! - **Discovery:** a snapshot of the running instances ([`ProcessDescriptor`])
//! - **Bus:** a shared publish/subscribe transport keyed by channel name
//! - **Direct channel:** point-to-point delivery into one instance's inbox, and
//!   from an instance back to its supervising parent (which republishes on the bus)
//!
//! [`ProcessManager`] is that boundary as an async trait. [`LocalCluster`] is an
//! in-process implementation on tokio channels, used for tests and demos.
//!
//! # Example
//!
//! ```ignore
//! use procbus::{LocalCluster, ProcessManager};
//!
//! let cluster = LocalCluster::new();
//! let a = cluster.spawn("svc");
//! let mut b = cluster.spawn("svc");
//!
//! a.client.connect_bus().await?;
//! a.client.send_to_instance(b.id(), serde_json::json!({"topic": "ping"})).await?;
//! let packet = b.inbox.recv().await;
//! ```

mod descriptor;
mod error;
mod local;
mod manager;

pub use descriptor::{ProcessDescriptor, ProcessStatus};
pub use error::{BusError, BusResult};
pub use local::{ID_ENV, LocalClient, LocalCluster, LocalInstance, NAME_ENV};
pub use manager::{BusReceiver, ProcessManager};
