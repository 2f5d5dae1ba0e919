use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

use fieldline_core::{DeliveryStatus, Message, MessageId, TenantId};

/// Errors returned by message ledger implementations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger record not found: {0}")]
    NotFound(MessageId),
    #[error("ledger storage failure: {0}")]
    Storage(String),
}

/// Durable, append-only form of a published message, kept for audit and
/// replay and keyed by message id.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: MessageId,
    pub tenant: TenantId,
    pub topic: String,
    pub payload: Vec<u8>,
    pub timestamp: u64,
    pub event: String,
    pub status: DeliveryStatus,
}

impl StoredRecord {
    /// Builds the pending record written before a transmission attempt.
    pub fn pending(message: &Message, payload: Vec<u8>) -> Self {
        Self {
            id: message.id.clone(),
            tenant: message.tenant.clone(),
            topic: message.topic.clone(),
            payload,
            timestamp: message.timestamp,
            event: message.event.clone(),
            status: DeliveryStatus::Pending,
        }
    }
}

/// Pluggable ledger collaborator used by the durable bus.
pub trait MessageLedger: Send + Sync {
    fn append(&self, record: &StoredRecord) -> Result<(), LedgerError>;
    fn update_status(&self, id: &MessageId, status: DeliveryStatus) -> Result<(), LedgerError>;
    fn get(&self, id: &MessageId) -> Result<StoredRecord, LedgerError>;
    /// Records currently holding `status`, for replay tooling.
    fn with_status(&self, status: DeliveryStatus) -> Result<Vec<StoredRecord>, LedgerError>;
}

/// In-memory ledger for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryLedger {
    records: Mutex<HashMap<MessageId, StoredRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MessageLedger for MemoryLedger {
    fn append(&self, record: &StoredRecord) -> Result<(), LedgerError> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn update_status(&self, id: &MessageId, status: DeliveryStatus) -> Result<(), LedgerError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let record = records
            .get_mut(id)
            .ok_or_else(|| LedgerError::NotFound(id.clone()))?;
        record.status = status;
        Ok(())
    }

    fn get(&self, id: &MessageId) -> Result<StoredRecord, LedgerError> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(id.clone()))
    }

    fn with_status(&self, status: DeliveryStatus) -> Result<Vec<StoredRecord>, LedgerError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect())
    }
}
