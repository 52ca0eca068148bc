//! JSONL file warehouse.
//!
//! Streams telemetry rows as one JSON object per line, giving the local
//! runner a durable record without a real columnar backend. Append-only;
//! partial failures cannot happen, a write error fails the whole batch and
//! the buffer's retry machinery takes over.

use crate::core::ports::{InsertOutcome, Warehouse};
use crate::core::types::{TelemetryRow, WarehouseError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub struct JsonlWarehouse {
    path: PathBuf,
    // One writer at a time keeps lines whole.
    write_gate: Mutex<()>,
}

impl JsonlWarehouse {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_gate: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Warehouse for JsonlWarehouse {
    async fn insert(
        &self,
        _table: &str,
        rows: &[TelemetryRow],
    ) -> Result<InsertOutcome, WarehouseError> {
        let _guard = self.write_gate.lock().await;

        let mut buf = Vec::with_capacity(rows.len() * 256);
        for row in rows {
            serde_json::to_writer(&mut buf, row)
                .map_err(|e| WarehouseError::Insert(e.to_string()))?;
            buf.push(b'\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| WarehouseError::Insert(e.to_string()))?;
        file.write_all(&buf)
            .await
            .map_err(|e| WarehouseError::Insert(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| WarehouseError::Insert(e.to_string()))?;

        Ok(InsertOutcome::Ok)
    }

    async fn query(
        &self,
        _sql: &str,
        _params: &[serde_json::Value],
    ) -> Result<Vec<serde_json::Value>, WarehouseError> {
        Err(WarehouseError::Query(
            "JSONL warehouse does not support queries".into(),
        ))
    }
}
