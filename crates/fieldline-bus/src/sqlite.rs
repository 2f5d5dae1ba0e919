use std::fs;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use fieldline_core::{DeliveryStatus, MessageId, TenantId};

use crate::ledger::{LedgerError, MessageLedger, StoredRecord};

/// SQLite-backed message ledger.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)
            .map_err(|e| LedgerError::Storage(format!("open ledger db: {e}")))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=5000;
             CREATE TABLE IF NOT EXISTS messages (
               id TEXT PRIMARY KEY,
               tenant TEXT NOT NULL,
               topic TEXT NOT NULL,
               payload BLOB NOT NULL,
               timestamp INTEGER NOT NULL,
               event TEXT NOT NULL,
               status TEXT NOT NULL
             );",
        )
        .map_err(|e| LedgerError::Storage(format!("init ledger db: {e}")))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRecord> {
        let status: String = row.get(6)?;
        Ok(StoredRecord {
            id: MessageId::new(row.get::<_, String>(0)?),
            tenant: TenantId::new(row.get::<_, String>(1)?),
            topic: row.get(2)?,
            payload: row.get(3)?,
            timestamp: row.get::<_, i64>(4)? as u64,
            event: row.get(5)?,
            status: parse_status(&status),
        })
    }
}

fn parse_status(raw: &str) -> DeliveryStatus {
    match raw {
        "sent" => DeliveryStatus::Sent,
        "failed" => DeliveryStatus::Failed,
        _ => DeliveryStatus::Pending,
    }
}

impl MessageLedger for SqliteLedger {
    fn append(&self, record: &StoredRecord) -> Result<(), LedgerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR REPLACE INTO messages (id, tenant, topic, payload, timestamp, event, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id.0,
                record.tenant.0,
                record.topic,
                record.payload,
                record.timestamp as i64,
                record.event,
                record.status.as_str()
            ],
        )
        .map(|_| ())
        .map_err(|e| LedgerError::Storage(format!("append({}): {e}", record.id)))
    }

    fn update_status(&self, id: &MessageId, status: DeliveryStatus) -> Result<(), LedgerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let changed = conn
            .execute(
                "UPDATE messages SET status=?2 WHERE id=?1",
                params![id.0, status.as_str()],
            )
            .map_err(|e| LedgerError::Storage(format!("update_status({id}): {e}")))?;
        if changed == 0 {
            return Err(LedgerError::NotFound(id.clone()));
        }
        Ok(())
    }

    fn get(&self, id: &MessageId) -> Result<StoredRecord, LedgerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT id, tenant, topic, payload, timestamp, event, status
             FROM messages WHERE id=?1",
            [&id.0],
            Self::row_to_record,
        )
        .optional()
        .map_err(|e| LedgerError::Storage(format!("get({id}): {e}")))?
        .ok_or_else(|| LedgerError::NotFound(id.clone()))
    }

    fn with_status(&self, status: DeliveryStatus) -> Result<Vec<StoredRecord>, LedgerError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare(
                "SELECT id, tenant, topic, payload, timestamp, event, status
                 FROM messages WHERE status=?1 ORDER BY timestamp ASC",
            )
            .map_err(|e| LedgerError::Storage(format!("with_status prepare: {e}")))?;
        let rows = stmt
            .query_map([status.as_str()], Self::row_to_record)
            .map_err(|e| LedgerError::Storage(format!("with_status query: {e}")))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| LedgerError::Storage(format!("with_status row: {e}")))?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use fieldline_core::{BranchId, DeliveryStatus, MapPayload, Message, TenantId};
    use serde_json::json;

    use super::SqliteLedger;
    use crate::ledger::{MessageLedger, StoredRecord};

    fn sample_record() -> StoredRecord {
        let mut payload = MapPayload::new();
        payload.insert("tenant", json!("acme"));
        payload.insert("branch", json!("hq"));
        let message = Message::new(
            "ingest/deviceData",
            TenantId::new("acme"),
            BranchId::new("hq"),
            payload,
            "deviceData",
        );
        StoredRecord::pending(&message, b"{\"k\":1}".to_vec())
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("ledger.db");
        let record = sample_record();

        {
            let ledger = SqliteLedger::open(&path).expect("ledger should open");
            ledger.append(&record).expect("append should succeed");
            ledger
                .update_status(&record.id, DeliveryStatus::Sent)
                .expect("update should succeed");
        }

        let reopened = SqliteLedger::open(&path).expect("ledger should reopen");
        let loaded = reopened.get(&record.id).expect("record should load");
        assert_eq!(loaded.status, DeliveryStatus::Sent);
        assert_eq!(loaded.payload, record.payload);
        assert_eq!(loaded.topic, record.topic);
    }

    #[test]
    fn status_queries_and_missing_records() {
        let dir = tempfile::tempdir().expect("temp dir");
        let ledger = SqliteLedger::open(&dir.path().join("ledger.db")).expect("ledger open");

        let record = sample_record();
        ledger.append(&record).expect("append should succeed");
        assert_eq!(
            ledger
                .with_status(DeliveryStatus::Pending)
                .expect("query should succeed")
                .len(),
            1
        );

        let other = sample_record();
        assert!(ledger.get(&other.id).is_err());
        assert!(ledger
            .update_status(&other.id, DeliveryStatus::Failed)
            .is_err());
    }
}
