//! Device ingest boundary: frame validation, republish onto the internal
//! bus, and the batched storage writer.

pub mod adapter;
pub mod store;
pub mod writer;

pub use adapter::{AcceptedHandler, IngestAdapter, IngestConfig, IngestError};
pub use store::{MemoryStore, StoreError, TelemetryStore};
pub use writer::{BatchWriter, BatchWriterConfig, WriterError};
