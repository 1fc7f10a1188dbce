//! Process manager error types

use thiserror::Error;

/// Failures reported by a process manager
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Process manager unreachable: {0}")]
    Unreachable(String),

    #[error("Not connected to the process manager")]
    NotConnected,

    #[error("Unknown instance: {0}")]
    UnknownInstance(u32),

    #[error("Instance {0} is not accepting messages")]
    InstanceOffline(u32),

    #[error("No parent channel: process is not managed")]
    NoParent,

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),
}

/// Result alias for process manager operations
pub type BusResult<T> = Result<T, BusError>;
