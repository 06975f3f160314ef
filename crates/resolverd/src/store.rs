//! CheckpointStore (C5): an embedded, transactional, at-most-once result
//! store keyed by `input_id` (spec Section 4.5).
//!
//! Built on `sqlx` + SQLite in WAL mode, the same persistence stack the
//! teacher's own daemon uses. Schema is a single table plus an index on
//! the error column for fast retry-discovery (spec Section 6).

use resolver_core::types::{CheckpointRow, MatchResult, Method};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, StoreError>;

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS checkpoints (
    input_id TEXT PRIMARY KEY,
    result_json TEXT NOT NULL,
    method TEXT NOT NULL,
    updated_at_ms INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_checkpoints_method ON checkpoints(method);
";

/// Durable, serialized-write result store. Many readers (`processed_ids`
/// bootstrap, export) may run concurrently with the single writer the
/// coordinator owns (spec Section 5).
pub struct CheckpointStore {
    pool: Pool<Sqlite>,
    path: PathBuf,
}

impl CheckpointStore {
    /// Open (creating if absent) the store at `configured_path`. Falls
    /// back to a platform temp-dir path if the configured location is not
    /// writable, logging the substitution once (spec Section 4.5's
    /// "Portability of location").
    pub async fn open(configured_path: &Path) -> Result<Self> {
        let path = match Self::probe_writable(configured_path) {
            true => configured_path.to_path_buf(),
            false => {
                let fallback = std::env::temp_dir().join(
                    configured_path
                        .file_name()
                        .unwrap_or_else(|| std::ffi::OsStr::new("checkpoint.db")),
                );
                tracing::warn!(
                    configured = %configured_path.display(),
                    fallback = %fallback.display(),
                    "checkpoint path not writable, falling back to temp dir"
                );
                fallback
            }
        };

        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let db_url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new().max_connections(5).connect(&db_url).await?;
        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

        for statement in SCHEMA_SQL.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed).execute(&pool).await?;
            }
        }

        Ok(Self { pool, path })
    }

    fn probe_writable(path: &Path) -> bool {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        if std::fs::create_dir_all(parent).is_err() {
            return false;
        }
        let probe = parent.join(".resolver_write_probe");
        match std::fs::write(&probe, b"x") {
            Ok(()) => {
                let _ = std::fs::remove_file(&probe);
                true
            }
            Err(_) => false,
        }
    }

    /// The path actually in use (post-fallback). The export step reads
    /// from whichever path won.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Idempotent upsert keyed by `input_id`. Does not commit by itself —
    /// callers batch and call [`Self::commit`] (here a no-op marker since
    /// SQLite autocommits each statement; kept as a distinct call so the
    /// coordinator's cadence logic has one thing to call regardless of
    /// backend).
    pub async fn upsert(&self, result: &MatchResult, updated_at_ms: i64) -> Result<()> {
        let result_json = serde_json::to_string(result)?;
        sqlx::query(
            "INSERT INTO checkpoints (input_id, result_json, method, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(input_id) DO UPDATE SET
                result_json = excluded.result_json,
                method = excluded.method,
                updated_at_ms = excluded.updated_at_ms",
        )
        .bind(&result.input_id)
        .bind(&result_json)
        .bind(result.method.as_str())
        .bind(updated_at_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Batches are committed atomically by wrapping N upserts in a single
    /// SQLite transaction; `upsert` above is called outside a transaction
    /// for simplicity and this method exists for call sites that already
    /// hold a batch of pending rows.
    pub async fn commit_batch(
        &self,
        rows: &[(MatchResult, i64)],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (result, updated_at_ms) in rows {
            let result_json = serde_json::to_string(result)?;
            sqlx::query(
                "INSERT INTO checkpoints (input_id, result_json, method, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(input_id) DO UPDATE SET
                    result_json = excluded.result_json,
                    method = excluded.method,
                    updated_at_ms = excluded.updated_at_ms",
            )
            .bind(&result.input_id)
            .bind(&result_json)
            .bind(result.method.as_str())
            .bind(*updated_at_ms)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// `input_id`s already recorded, as a raw building block for the
    /// coordinator's skip-set. `include_errors=false` excludes rows whose
    /// method is `ERROR`. `include_errors=true` returns every checkpointed
    /// row, `ERROR` included. The coordinator (not this method) decides
    /// which of the two means "already done": a default run wants
    /// `ERROR` rows in the skip-set, `retry_errors` wants them excluded
    /// from it so they get reprocessed — see `Coordinator::plan`.
    pub async fn processed_ids(&self, include_errors: bool) -> Result<std::collections::HashSet<String>> {
        let rows = if include_errors {
            sqlx::query("SELECT input_id FROM checkpoints")
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query("SELECT input_id FROM checkpoints WHERE method != ?1")
                .bind(Method::Error.as_str())
                .fetch_all(&self.pool)
                .await?
        };
        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("input_id"))
            .collect())
    }

    /// Full iteration for export, in `input_id` order for a stable file.
    pub async fn all_rows(&self) -> Result<Vec<CheckpointRow>> {
        let rows = sqlx::query("SELECT result_json, updated_at_ms FROM checkpoints ORDER BY input_id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let result_json: String = row.get("result_json");
                let updated_at_ms: i64 = row.get("updated_at_ms");
                let result: MatchResult = serde_json::from_str(&result_json)?;
                Ok(CheckpointRow {
                    result,
                    updated_at_ms,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn result(input_id: &str, method: Method) -> MatchResult {
        match method {
            Method::Error => MatchResult::error(input_id.to_string(), "Kind", "message"),
            Method::NotFound => MatchResult::not_found(input_id.to_string(), BTreeMap::new()),
            _ => MatchResult::direct_id(input_id.to_string(), "50113813700013".into(), "X".into()),
        }
    }

    #[tokio::test]
    async fn upsert_then_read_back_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(&dir.path().join("checkpoint.db")).await.unwrap();
        store.upsert(&result("A", Method::DirectId), 1000).await.unwrap();
        let rows = store.all_rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].result.input_id, "A");
    }

    #[tokio::test]
    async fn upsert_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(&dir.path().join("checkpoint.db")).await.unwrap();
        store.upsert(&result("A", Method::DirectId), 1000).await.unwrap();
        store.upsert(&result("A", Method::DirectId), 2000).await.unwrap();
        let rows = store.all_rows().await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn processed_ids_excludes_errors_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(&dir.path().join("checkpoint.db")).await.unwrap();
        store.upsert(&result("A", Method::DirectId), 1000).await.unwrap();
        store.upsert(&result("B", Method::Error), 1000).await.unwrap();

        let resumable = store.processed_ids(false).await.unwrap();
        assert!(resumable.contains("A"));
        assert!(!resumable.contains("B"));

        let all = store.processed_ids(true).await.unwrap();
        assert!(all.contains("B"));
    }

    #[tokio::test]
    async fn commit_batch_is_atomic_over_its_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::open(&dir.path().join("checkpoint.db")).await.unwrap();
        let batch = vec![
            (result("A", Method::DirectId), 1000),
            (result("B", Method::NotFound), 1000),
        ];
        store.commit_batch(&batch).await.unwrap();
        let rows = store.all_rows().await.unwrap();
        assert_eq!(rows.len(), 2);
    }
}
