//! Wire payloads exchanged between the dispatcher and capture workers.
//!
//! Both payloads are JSON with stable field names so that dispatchers and
//! workers of different builds can share a bus.

use crate::metadata::Metadata;
use crate::BusError;
use serde::{Deserialize, Serialize};

/// Topic every capture job is published to.
pub const JOB_TOPIC: &str = "shot_request";

/// Consumer group shared by all capture workers.
pub const CAPTURE_GROUP: &str = "capture";

/// A capture request for one URL. The reply address travels in the bus
/// envelope, not in the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub url: String,
}

impl Job {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, BusError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Worker answer to a [`Job`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CaptureReply {
    pub fn success(record: Metadata) -> Self {
        Self {
            success: true,
            record: Some(record),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            record: None,
            error: Some(error.into()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, BusError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self, BusError> {
        Ok(serde_json::from_slice(payload)?)
    }
}
