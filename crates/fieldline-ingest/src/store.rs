use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use thiserror::Error;

use fieldline_core::Message;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("telemetry storage failure: {0}")]
    Storage(String),
}

/// Batch sink for accepted telemetry. A batch either lands whole or fails
/// whole; the writer does not retry failed batches.
pub trait TelemetryStore: Send + Sync {
    fn store_batch(&self, batch: &[Message]) -> Result<(), StoreError>;
}

/// In-memory store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStore {
    batches: Mutex<Vec<Vec<Message>>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent writes fail, for failure-path tests.
    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::Relaxed);
    }

    /// Batches stored so far, in write order.
    pub fn batches(&self) -> Vec<Vec<Message>> {
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Total messages stored across all batches.
    pub fn total(&self) -> usize {
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(Vec::len)
            .sum()
    }
}

impl TelemetryStore for MemoryStore {
    fn store_batch(&self, batch: &[Message]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StoreError::Storage("simulated write failure".to_string()));
        }
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(batch.to_vec());
        Ok(())
    }
}
