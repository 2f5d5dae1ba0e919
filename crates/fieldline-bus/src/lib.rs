//! Durable publish bus for fieldline.
//!
//! Wraps a pub/sub transport with persistence-then-transmit semantics: a
//! published message is recorded in the ledger as `Pending` before the
//! transmission attempt and settles to `Sent` or `Failed` before the publish
//! call returns.

pub mod bus;
pub mod ledger;
pub mod sqlite;

pub use bus::{BusError, BusHandler, DurableBus};
pub use ledger::{LedgerError, MemoryLedger, MessageLedger, StoredRecord};
pub use sqlite::SqliteLedger;
