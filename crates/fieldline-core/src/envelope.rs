use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::payload::{MapPayload, Payload, PayloadError};
use crate::types::{BranchId, MessageId, TenantId, UserId};

/// Errors raised while encoding or decoding wire envelopes.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("envelope encoding failed: {0}")]
    Encode(serde_json::Error),
    #[error("envelope decoding failed: {0}")]
    Decode(serde_json::Error),
    #[error("envelope payload missing required field: {0}")]
    MissingField(&'static str),
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// Delivery status of a published message.
///
/// A message with persistence enabled transitions `Pending` to exactly one of
/// `Sent` or `Failed` before the publish call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }
}

/// In-process message owned by the bus for the duration of a publish call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub tenant: TenantId,
    pub branch: BranchId,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user: Option<UserId>,
    pub topic: String,
    pub payload: MapPayload,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    pub event: String,
    pub status: DeliveryStatus,
}

impl Message {
    /// Builds a message with a freshly generated id and a current timestamp.
    pub fn new(
        topic: impl Into<String>,
        tenant: TenantId,
        branch: BranchId,
        payload: MapPayload,
        event: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            tenant,
            branch,
            user: None,
            topic: topic.into(),
            payload,
            timestamp: now_millis(),
            event: event.into(),
            status: DeliveryStatus::Pending,
        }
    }

    pub fn with_user(mut self, user: UserId) -> Self {
        self.user = Some(user);
        self
    }

    /// Reconstructs a message from its wire envelope.
    ///
    /// The envelope carries only `{id, topic, data, timestamp, event}`; the
    /// tenant and branch are recovered from the payload map, where every
    /// ingest frame records them. The reconstructed message is marked `Sent`
    /// since it was observed after transmission.
    pub fn from_envelope(envelope: &WireEnvelope) -> Result<Self, CodecError> {
        let payload = MapPayload::from_bytes(&envelope.data)?;
        let tenant = payload
            .get_str("tenant")
            .map(TenantId::new)
            .ok_or(CodecError::MissingField("tenant"))?;
        let branch = payload
            .get_str("branch")
            .map(BranchId::new)
            .ok_or(CodecError::MissingField("branch"))?;
        let user = payload.get_str("user").map(UserId::new);
        Ok(Self {
            id: envelope.id.clone(),
            tenant,
            branch,
            user,
            topic: envelope.topic.clone(),
            payload,
            timestamp: envelope.timestamp,
            event: envelope.event.clone(),
            status: DeliveryStatus::Sent,
        })
    }
}

/// Serialized wire form of a message, the only shape that crosses the
/// transport boundary. `data` is the nested JSON-encoded payload; consumers
/// re-decode it according to the topic's schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub id: MessageId,
    pub topic: String,
    pub data: Vec<u8>,
    pub timestamp: u64,
    pub event: String,
}

impl WireEnvelope {
    /// Derives the wire envelope from a message at publish time.
    pub fn from_message(message: &Message) -> Result<Self, CodecError> {
        Ok(Self {
            id: message.id.clone(),
            topic: message.topic.clone(),
            data: message.payload.to_bytes()?,
            timestamp: message.timestamp,
            event: message.event.clone(),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(self).map_err(CodecError::Encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::Decode)
    }
}

/// Current unix time in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
