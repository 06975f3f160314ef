//! ResultExporter (C7): emit every CheckpointStore row as a stable-column
//! tabular file (spec Section 4.7).
//!
//! Read-only over the store; may run concurrently with an in-progress
//! `resolve run` since SQLite's WAL mode supports concurrent readers.

use crate::store::{CheckpointStore, StoreError};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("csv write error: {0}")]
    Csv(#[from] csv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Column order is part of the contract — never reorder (spec Section
/// 4.7).
const COLUMNS: &[&str] = &[
    "input_id",
    "resolved_id",
    "official_name",
    "confidence",
    "method",
    "alternatives",
    "error",
];

/// Write every row in the store to `out_path` as delimited text. Successes
/// and error rows are both included.
pub async fn export(store: &CheckpointStore, out_path: &Path) -> Result<usize, ExportError> {
    let rows = store.all_rows().await?;
    let mut writer = csv::Writer::from_path(out_path)?;
    writer.write_record(COLUMNS)?;

    for row in &rows {
        let result = &row.result;
        let alternatives = serde_json::to_string(&result.alternatives).unwrap_or_else(|_| "[]".to_string());
        writer.write_record([
            result.input_id.as_str(),
            result.resolved_establishment_id.as_deref().unwrap_or(""),
            result.official_name.as_deref().unwrap_or(""),
            &result.confidence.to_string(),
            result.method.as_str(),
            &alternatives,
            result.error.as_deref().unwrap_or(""),
        ])?;
    }
    writer.flush()?;
    Ok(rows.len())
}
