//! Per-process identity
//!
//! The process manager tells each instance who it is through environment
//! variables. Identity is read once at startup and never re-derived.

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::IdentityConfig;

/// Bus channel suffix used as reply address by processes without an id
pub const UNMANAGED_CHANNEL: &str = "unmanaged";

/// Immutable facts about this instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Identity {
    /// Manager-assigned id; absent when the process is not managed
    #[serde(rename = "instance-id")]
    pub instance_id: Option<u32>,

    /// Declared name from the start command
    #[serde(rename = "instance-name")]
    pub instance_name: Option<String>,
}

impl Identity {
    /// Identity of a managed instance
    pub fn managed(instance_id: u32, instance_name: impl Into<String>) -> Self {
        Self {
            instance_id: Some(instance_id),
            instance_name: Some(instance_name.into()),
        }
    }

    /// Identity of a process the manager does not supervise
    pub fn unmanaged(instance_name: Option<String>) -> Self {
        Self {
            instance_id: None,
            instance_name,
        }
    }

    /// Read identity from the process environment
    pub fn from_env(config: &IdentityConfig) -> Self {
        Self::from_lookup(config, |key| std::env::var(key).ok())
    }

    /// Read identity through an arbitrary variable lookup
    ///
    /// A missing or non-numeric id means the process is unmanaged.
    pub fn from_lookup<F>(config: &IdentityConfig, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let instance_id = match lookup(&config.id_env) {
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(var = %config.id_env, %raw, error = %e, "Identity: ignoring non-numeric instance id");
                    None
                }
            },
            None => None,
        };
        let instance_name = lookup(&config.name_env).filter(|name| !name.is_empty());

        debug!(?instance_id, ?instance_name, "Identity::from_lookup: resolved");
        Self {
            instance_id,
            instance_name,
        }
    }

    /// Whether the process manager supervises this process
    pub fn is_managed(&self) -> bool {
        self.instance_id.is_some()
    }

    /// Bus channel on which replies to this instance are published
    pub fn reply_channel(&self) -> String {
        reply_channel(self.instance_id)
    }
}

/// Reply channel for a requester id (`process:<id>`)
pub fn reply_channel(instance_id: Option<u32>) -> String {
    match instance_id {
        Some(id) => format!("process:{}", id),
        None => format!("process:{}", UNMANAGED_CHANNEL),
    }
}
