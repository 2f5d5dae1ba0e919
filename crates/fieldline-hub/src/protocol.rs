use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Requests a live client may send over its WebSocket:
/// `{"type": "subscribe", "content": {"subject": "sensor-1"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "camelCase")]
pub enum ClientRequest {
    Subscribe { subject: String },
    Unsubscribe { subject: String },
    GetValue { subject: String },
}

impl ClientRequest {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Messages the node pushes to live clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    SubscribeConfirmed {
        subject: String,
    },
    UnsubscribeConfirmed {
        subject: String,
    },
    CurrentValueResponse {
        subject: String,
        value: Option<Value>,
    },
    #[serde(rename = "measure_update")]
    MeasureUpdate {
        subject: String,
        payload: Value,
    },
    #[serde(rename = "direct_message")]
    DirectMessage {
        payload: Value,
    },
    Broadcast {
        payload: Value,
    },
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
