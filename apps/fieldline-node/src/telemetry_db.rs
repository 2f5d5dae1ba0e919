use std::fs;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};

use fieldline_core::{Message, Payload};
use fieldline_ingest::{StoreError, TelemetryStore};

/// SQLite-backed telemetry sink. Each batch lands in one transaction.
pub struct SqliteTelemetryStore {
    conn: Mutex<Connection>,
}

impl SqliteTelemetryStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Storage(format!("open telemetry db: {e}")))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;
             CREATE TABLE IF NOT EXISTS telemetry (
               id TEXT PRIMARY KEY,
               tenant TEXT NOT NULL,
               branch TEXT NOT NULL,
               topic TEXT NOT NULL,
               payload BLOB NOT NULL,
               timestamp INTEGER NOT NULL,
               event TEXT NOT NULL
             );",
        )
        .map_err(|e| StoreError::Storage(format!("init telemetry db: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row("SELECT COUNT(*) FROM telemetry", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as u64)
        .map_err(|e| StoreError::Storage(format!("count telemetry: {e}")))
    }
}

impl TelemetryStore for SqliteTelemetryStore {
    fn store_batch(&self, batch: &[Message]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::Storage(format!("begin batch: {e}")))?;
        for message in batch {
            let payload = message
                .payload
                .to_bytes()
                .map_err(|e| StoreError::Storage(format!("encode payload: {e}")))?;
            tx.execute(
                "INSERT OR REPLACE INTO telemetry (id, tenant, branch, topic, payload, timestamp, event)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    message.id.0,
                    message.tenant.0,
                    message.branch.0,
                    message.topic,
                    payload,
                    message.timestamp as i64,
                    message.event
                ],
            )
            .map_err(|e| StoreError::Storage(format!("insert telemetry: {e}")))?;
        }
        tx.commit()
            .map_err(|e| StoreError::Storage(format!("commit batch: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use fieldline_core::{BranchId, MapPayload, Message, TenantId};
    use fieldline_ingest::TelemetryStore;

    use super::SqliteTelemetryStore;

    fn sample_message(n: usize) -> Message {
        let mut payload = MapPayload::new();
        payload.insert("tenant", json!("acme"));
        payload.insert("branch", json!("hq"));
        payload.insert("data", json!({"seq": n}));
        Message::new(
            "ingest/deviceData",
            TenantId::new("acme"),
            BranchId::new("hq"),
            payload,
            "deviceData",
        )
    }

    #[test]
    fn batches_persist_across_reopen() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("telemetry.db");

        {
            let store = SqliteTelemetryStore::open(&path).expect("store should open");
            let batch: Vec<_> = (0..3).map(sample_message).collect();
            store.store_batch(&batch).expect("batch should store");
        }

        let reopened = SqliteTelemetryStore::open(&path).expect("store should reopen");
        assert_eq!(reopened.count().expect("count should succeed"), 3);
    }
}
