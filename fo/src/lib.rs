//! Fanout - scatter-gather messaging between sibling cluster instances
//!
//! One instance broadcasts a named request to its siblings (and optionally
//! itself) and collects every reply into a single result, bounded by a timeout.
//! Fanout sits on top of a pm2-style process manager ([`procbus::ProcessManager`])
//! that provides discovery, a pub/sub bus and direct instance channels.
//!
//! # Modules
//!
//! - [`registry`] - topic to handler mapping
//! - [`identity`] - who this instance is, read once from the environment
//! - [`connection`] - bus session and the single reply subscription
//! - [`correlator`] - `get_messages`: plan, scatter, gather, time out
//! - [`dispatcher`] - answers requests from siblings
//! - [`envelope`] - JSON wire format
//! - [`messenger`] - facade wiring it all together
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface
//!
//! # Example
//!
//! ```ignore
//! use fanout::{Config, Identity, Messenger};
//!
//! let identity = Identity::from_env(&config.identity);
//! let messenger = Messenger::new(identity, manager, &config);
//! messenger.on_message_sync("ping", |_| Ok(serde_json::json!("pong")))?;
//! messenger.connect().await?;
//! let pongs = messenger.get_messages("ping", serde_json::Value::Null).await?;
//! ```

pub mod cli;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod messenger;
pub mod registry;

// Re-export commonly used types
pub use config::{Config, IdentityConfig};
pub use connection::ConnectionManager;
pub use correlator::{
    Correlator, CorrelatorMetrics, DEFAULT_TIMEOUT, Demux, GetMessagesOptions, PendingTable, ProcessFilter, TargetPlan,
};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use envelope::{RequestEnvelope, RequestId, ResponseEnvelope};
pub use error::{FanoutError, FanoutResult, HandlerError};
pub use identity::Identity;
pub use messenger::Messenger;
pub use registry::{Handler, HandlerRegistry};
