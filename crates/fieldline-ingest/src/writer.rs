use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fieldline_bus::{BusError, DurableBus};
use fieldline_core::Message;

use crate::store::{StoreError, TelemetryStore};

#[derive(Debug, Error)]
pub enum WriterError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

#[derive(Debug, Clone)]
pub struct BatchWriterConfig {
    pub ingest_topic: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

struct WriterInner {
    store: Arc<dyn TelemetryStore>,
    config: BatchWriterConfig,
    buffer: Mutex<Vec<Message>>,
}

impl WriterInner {
    /// Appends a message; a full buffer is swapped out under the lock and
    /// written outside it.
    fn append(&self, message: Message) -> Result<(), WriterError> {
        let batch = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            buffer.push(message);
            if buffer.len() < self.config.batch_size {
                return Ok(());
            }
            std::mem::take(&mut *buffer)
        };
        debug!(len = batch.len(), "writing full telemetry batch");
        self.store.store_batch(&batch)?;
        Ok(())
    }

    /// Writes out whatever is buffered. Empty buffer is a no-op.
    fn flush(&self) -> Result<(), WriterError> {
        let batch = std::mem::take(&mut *self.buffer.lock().unwrap_or_else(|e| e.into_inner()));
        if batch.is_empty() {
            return Ok(());
        }
        debug!(len = batch.len(), "flushing telemetry batch");
        self.store.store_batch(&batch)?;
        Ok(())
    }
}

/// Drains the ingest topic into a `TelemetryStore` in batches.
///
/// Messages accumulate in a single mutex-guarded buffer; a batch is written
/// when the buffer reaches `batch_size` or when the periodic flush timer
/// fires, whichever comes first. Delivery is at-least-once up to storage: a
/// failed batch write drops that batch.
pub struct BatchWriter {
    bus: Arc<DurableBus>,
    inner: Arc<WriterInner>,
    timer: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
}

impl BatchWriter {
    pub fn new(
        bus: Arc<DurableBus>,
        store: Arc<dyn TelemetryStore>,
        config: BatchWriterConfig,
    ) -> Self {
        Self {
            bus,
            inner: Arc::new(WriterInner {
                store,
                config,
                buffer: Mutex::new(Vec::new()),
            }),
            timer: Mutex::new(None),
        }
    }

    /// Subscribes to the ingest topic and spawns the flush timer. Must be
    /// called inside a tokio runtime.
    pub fn start(&self) -> Result<(), WriterError> {
        let inner = Arc::clone(&self.inner);
        self.bus.subscribe(
            &self.inner.config.ingest_topic,
            Arc::new(move |envelope| {
                let message = Message::from_envelope(&envelope)?;
                inner.append(message)?;
                Ok(())
            }),
        )?;

        let inner = Arc::clone(&self.inner);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        if let Err(err) = inner.flush() {
                            warn!(error = %err, "periodic flush failed, batch dropped");
                        }
                    }
                }
            }
        });
        *self.timer.lock().unwrap_or_else(|e| e.into_inner()) = Some((shutdown_tx, handle));
        info!(
            topic = %self.inner.config.ingest_topic,
            batch_size = self.inner.config.batch_size,
            "batch writer started"
        );
        Ok(())
    }

    /// Flushes the current buffer immediately.
    pub fn flush(&self) -> Result<(), WriterError> {
        self.inner.flush()
    }

    /// Stops the timer, performs a final flush, and unsubscribes.
    pub async fn stop(&self) -> Result<(), WriterError> {
        let timer = self.timer.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((shutdown_tx, handle)) = timer {
            let _ = shutdown_tx.send(());
            let _ = handle.await;
        }
        self.inner.flush()?;
        self.bus.unsubscribe(&self.inner.config.ingest_topic)?;
        info!("batch writer stopped");
        Ok(())
    }
}
