use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::envelope::Message;
use crate::payload::MapPayload;
use crate::types::{BranchId, TenantId};

/// Errors raised while parsing inbound device frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed device frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("device frame field is empty: {0}")]
    EmptyField(&'static str),
}

/// Inbound telemetry frame as emitted by field devices:
/// `{id, tenant, branch, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceFrame {
    pub id: String,
    pub tenant: String,
    pub branch: String,
    pub data: Map<String, Value>,
}

impl DeviceFrame {
    /// Parses and schema-validates a raw frame.
    ///
    /// Required: non-empty device id, tenant, and branch, plus the payload
    /// map. Malformed frames are dropped at the ingest boundary and never
    /// propagated into the pipeline.
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        let frame: DeviceFrame = serde_json::from_slice(bytes)?;
        frame.validate()?;
        Ok(frame)
    }

    fn validate(&self) -> Result<(), FrameError> {
        if self.id.trim().is_empty() {
            return Err(FrameError::EmptyField("id"));
        }
        if self.tenant.trim().is_empty() {
            return Err(FrameError::EmptyField("tenant"));
        }
        if self.branch.trim().is_empty() {
            return Err(FrameError::EmptyField("branch"));
        }
        Ok(())
    }

    /// Converts an accepted frame into the in-process message republished on
    /// the configured ingest topic.
    pub fn into_message(self, ingest_topic: &str) -> Message {
        let tenant = TenantId::new(self.tenant.clone());
        let branch = BranchId::new(self.branch.clone());
        let mut payload = MapPayload::new();
        payload.insert("id", Value::String(self.id));
        payload.insert("tenant", Value::String(self.tenant));
        payload.insert("branch", Value::String(self.branch));
        payload.insert("data", Value::Object(self.data));
        Message::new(ingest_topic, tenant, branch, payload, "deviceData")
    }
}
