//! Discovery snapshot rows

use serde::{Deserialize, Serialize};

/// Lifecycle state reported by the process manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    #[default]
    Online,
    Stopped,
    Errored,
}

/// One running (or recently running) instance as seen by the process manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    /// Manager-assigned instance id (absent for rows the manager cannot address)
    #[serde(rename = "pm_id")]
    pub instance_id: Option<u32>,

    /// Declared name from the start command
    pub name: String,

    /// OS process id, when known
    #[serde(default)]
    pub pid: Option<u32>,

    #[serde(default)]
    pub status: ProcessStatus,
}

impl ProcessDescriptor {
    /// Create an online descriptor
    pub fn new(instance_id: u32, name: impl Into<String>) -> Self {
        Self {
            instance_id: Some(instance_id),
            name: name.into(),
            pid: None,
            status: ProcessStatus::Online,
        }
    }

    /// Whether the manager reports this instance as online
    pub fn is_online(&self) -> bool {
        self.status == ProcessStatus::Online
    }
}
