//! Wire format for requests and replies
//!
//! Requests travel over the direct channel into a target's inbox; replies go
//! to the target's parent, which republishes them on the requester's bus
//! channel (`process:<requesterId>`).

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FanoutResult;
use crate::identity::reply_channel;

/// Per-call correlation token (128 random bits, lowercase hex)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Mint a fresh random id
    pub fn generate() -> Self {
        Self(format!("{:032x}", rand::random::<u128>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Request sent to one target instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub topic: String,

    /// Requester's own id: the reply-to address
    #[serde(rename = "targetInstanceId")]
    pub target_instance_id: Option<u32>,

    #[serde(default)]
    pub payload: Value,

    #[serde(rename = "requestId")]
    pub request_id: RequestId,
}

impl RequestEnvelope {
    pub fn new(topic: impl Into<String>, reply_to: Option<u32>, payload: Value, request_id: RequestId) -> Self {
        Self {
            topic: topic.into(),
            target_instance_id: reply_to,
            payload,
            request_id,
        }
    }

    pub fn to_packet(&self) -> FanoutResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_packet(packet: Value) -> FanoutResult<Self> {
        Ok(serde_json::from_value(packet)?)
    }

    /// Build the reply to this request
    pub fn reply(&self, responder: Option<u32>, message: Value) -> ResponseEnvelope {
        ResponseEnvelope {
            kind: reply_channel(self.target_instance_id),
            instance_id: responder,
            message,
            request_id: self.request_id.clone(),
        }
    }
}

/// Reply sent back over the parent channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Bus channel of the requester (`process:<requesterId>`)
    #[serde(rename = "type")]
    pub kind: String,

    /// Responder's id, used to demultiplex
    #[serde(rename = "instanceId")]
    pub instance_id: Option<u32>,

    #[serde(default)]
    pub message: Value,

    #[serde(rename = "requestId")]
    pub request_id: RequestId,
}

impl ResponseEnvelope {
    pub fn to_packet(&self) -> FanoutResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_packet(packet: Value) -> FanoutResult<Self> {
        Ok(serde_json::from_value(packet)?)
    }
}
