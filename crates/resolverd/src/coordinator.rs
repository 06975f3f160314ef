//! WorkCoordinator (C6): parallel fan-out across `W` long-lived workers,
//! completing in whatever order finishes first, with incremental
//! durability via the CheckpointStore (spec Section 4.6).
//!
//! Tokio is the direct async analogue of "parallel OS threads with an
//! unordered parallel iterator": a fixed-size [`JoinSet`] of worker tasks
//! pulls from a shared bounded channel, each holding its own registry
//! handle, LLM client, and normalizer cache (spec Section 5), and results
//! stream back over a second channel in completion order, not input order.

use crate::cascade;
use crate::llm::LlmAdapter;
use crate::registry::RegistryQuery;
use crate::store::{CheckpointStore, StoreError};
use resolver_core::normalize::NormalizeCache;
use resolver_core::types::{MatchResult, RawRecord};
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("checkpoint store error: {0}")]
    Store(#[from] StoreError),
}

/// Cooperative cancellation signal. Workers check between cascade steps
/// and on I/O boundaries are approximated here by the coordinator
/// declining to dispatch new work and aborting in-flight dispatches
/// without waiting, per spec Section 4.6 step 5.
pub type CancelFlag = Arc<AtomicBool>;

pub fn new_cancel_flag() -> CancelFlag {
    Arc::new(AtomicBool::new(false))
}

#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub total: usize,
    pub processed: usize,
    pub cancelled: bool,
}

pub struct WorkCoordinator<R> {
    registry: R,
    store: Arc<CheckpointStore>,
    llm: Option<Arc<LlmAdapter>>,
    workers: usize,
    batch_size: usize,
    model_backed_normalization: bool,
}

impl<R> WorkCoordinator<R>
where
    R: RegistryQuery + Clone + Send + Sync + 'static,
{
    pub fn new(
        registry: R,
        store: Arc<CheckpointStore>,
        llm: Option<Arc<LlmAdapter>>,
        workers: usize,
        batch_size: usize,
        model_backed_normalization: bool,
    ) -> Self {
        Self {
            registry,
            store,
            llm,
            workers: workers.max(1),
            batch_size: batch_size.max(1),
            model_backed_normalization,
        }
    }

    /// Step 1-2: materialize the skip-set (respecting `retry_errors`), drop
    /// already-completed records, *then* enforce `limit`. This ordering
    /// matters: limiting before filtering would reduce useful work to zero
    /// on re-runs (spec Section 4.6 step 2).
    ///
    /// The default run (`retry_errors=false`) must skip every checkpointed
    /// row, ERROR included, so `processed_ids(true)` (everything) is the
    /// skip-set. `retry_errors=true` must skip everything *except* ERROR
    /// rows so they get reprocessed, so `processed_ids(false)` (non-error
    /// rows only) is the skip-set instead — hence `!retry_errors` below.
    async fn plan(
        &self,
        records: Vec<RawRecord>,
        limit: Option<usize>,
        retry_errors: bool,
    ) -> Result<Vec<RawRecord>, CoordinatorError> {
        let processed = self.store.processed_ids(!retry_errors).await?;
        let remaining: Vec<RawRecord> = records
            .into_iter()
            .filter(|r| !processed.contains(&r.input_id))
            .collect();
        Ok(match limit {
            Some(l) => remaining.into_iter().take(l).collect(),
            None => remaining,
        })
    }

    /// Run the full dispatch → cascade → checkpoint loop over `records`.
    ///
    /// `self.workers` long-lived worker tasks each own one `RegistryQuery`
    /// handle, one `LlmAdapter` handle, and one `NormalizeCache` — matching
    /// spec Section 5's "no shared mutable state between workers" design —
    /// and pull records from a shared channel until it closes, rather than
    /// one task being spawned per record.
    pub async fn run(
        &self,
        records: Vec<RawRecord>,
        limit: Option<usize>,
        retry_errors: bool,
        cancel: &CancelFlag,
    ) -> Result<RunSummary, CoordinatorError> {
        let remaining = self.plan(records, limit, retry_errors).await?;
        let total = remaining.len();

        let channel_capacity = self.workers * 2;
        let (record_tx, record_rx) = mpsc::channel::<RawRecord>(channel_capacity);
        let record_rx = Arc::new(tokio::sync::Mutex::new(record_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<MatchResult>(channel_capacity);

        let mut worker_set: JoinSet<()> = JoinSet::new();
        for _ in 0..self.workers {
            let rx = Arc::clone(&record_rx);
            let registry = self.registry.clone();
            let llm = self.llm.clone();
            let model_backed = self.model_backed_normalization;
            let result_tx = result_tx.clone();
            worker_set.spawn(async move {
                let mut cache = NormalizeCache::default();
                loop {
                    let next = { rx.lock().await.recv().await };
                    let Some(record) = next else { break };
                    let result =
                        cascade::resolve(&record, &registry, llm.as_deref(), model_backed, &mut cache)
                            .await;
                    if result_tx.send(result).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        let mut pending: Vec<(MatchResult, i64)> = Vec::new();
        let mut processed_count = 0usize;
        let started = Instant::now();
        let mut cancelled = false;
        let mut records_iter = remaining.into_iter();

        // Feed the shared record channel while opportunistically draining
        // completed results, so neither bounded channel backs up and stalls
        // the other. Workers run concurrently on the runtime's other
        // threads regardless of what this loop is doing.
        loop {
            if cancel.load(Ordering::Relaxed) {
                cancelled = true;
                break;
            }
            let Some(record) = records_iter.next() else {
                break;
            };
            if record_tx.send(record).await.is_err() {
                break;
            }
            while let Ok(result) = result_rx.try_recv() {
                self.absorb(result, &mut pending, &mut processed_count, total, started)
                    .await?;
            }
        }
        drop(record_tx);

        if cancelled {
            // Cancel outstanding dispatches without waiting; in-flight
            // workers may finish but their results are discarded.
            worker_set.abort_all();
        }

        while let Some(result) = result_rx.recv().await {
            self.absorb(result, &mut pending, &mut processed_count, total, started)
                .await?;
        }
        while worker_set.join_next().await.is_some() {}

        if !pending.is_empty() {
            self.store.commit_batch(&pending).await?;
            self.emit_progress(processed_count, total, started);
            pending.clear();
        }

        Ok(RunSummary {
            total,
            processed: processed_count,
            cancelled,
        })
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    async fn absorb(
        &self,
        result: MatchResult,
        pending: &mut Vec<(MatchResult, i64)>,
        processed_count: &mut usize,
        total: usize,
        started: Instant,
    ) -> Result<(), CoordinatorError> {
        pending.push((result, Self::now_ms()));
        *processed_count += 1;
        if pending.len() >= self.batch_size {
            self.store.commit_batch(pending).await?;
            pending.clear();
            self.emit_progress(*processed_count, total, started);
        }
        Ok(())
    }

    fn emit_progress(&self, processed: usize, total: usize, started: Instant) {
        let elapsed = started.elapsed().as_secs_f64().max(1e-6);
        let rate = processed as f64 / elapsed;
        let remaining = total.saturating_sub(processed);
        let eta_secs = if rate > 0.0 {
            remaining as f64 / rate
        } else {
            0.0
        };

        tracing::info!(
            processed,
            total,
            rate_per_sec = rate,
            eta_secs,
            "checkpoint committed"
        );

        if std::io::stderr().is_terminal() {
            eprintln!(
                "\r{processed}/{total} processed ({rate:.1}/s, ETA {eta_secs:.0}s)    ",
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::fixture::{FixtureRegistry, FixtureRow};
    use resolver_core::types::{Candidate, Value};
    use std::collections::BTreeMap;

    fn raw_record(id: &str, fields: &[(&str, &str)]) -> RawRecord {
        let mut map = BTreeMap::new();
        for (k, v) in fields {
            map.insert((*k).to_string(), Value::Text((*v).to_string()));
        }
        RawRecord {
            input_id: id.to_string(),
            fields: map,
        }
    }

    fn active_row(id: &str) -> FixtureRow {
        FixtureRow {
            candidate: Candidate {
                establishment_id: id.to_string(),
                company_id: id[0..9].to_string(),
                official_name: "ACME".to_string(),
                city: "LYON".to_string(),
                address: "1 RUE DE LA PAIX 69001".to_string(),
                is_head_office: true,
            },
            active: true,
        }
    }

    async fn fresh_store(dir: &tempfile::TempDir) -> Arc<CheckpointStore> {
        Arc::new(
            CheckpointStore::open(&dir.path().join("checkpoint.db"))
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn resume_processes_exactly_the_unprocessed_remainder() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(&dir).await;
        let registry = FixtureRegistry::new(vec![active_row("50113813700013")]);
        let coordinator = WorkCoordinator::new(registry, Arc::clone(&store), None, 2, 10, false);

        let records = vec![
            raw_record("A", &[("siret", "50113813700013")]),
            raw_record("B", &[("siret", "00000000000000")]),
        ];
        let cancel = new_cancel_flag();
        coordinator.run(records.clone(), None, false, &cancel).await.unwrap();

        let resumed = coordinator.run(records, None, false, &cancel).await.unwrap();
        assert_eq!(resumed.total, 0);
    }

    #[tokio::test]
    async fn limit_is_applied_after_skipping_completed_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(&dir).await;
        let registry = FixtureRegistry::new(vec![]);
        let coordinator = WorkCoordinator::new(registry, Arc::clone(&store), None, 2, 10, false);

        let first_pass = vec![raw_record("A", &[("name", "x")])];
        let cancel = new_cancel_flag();
        coordinator.run(first_pass, None, false, &cancel).await.unwrap();

        let second_pass = vec![
            raw_record("A", &[("name", "x")]),
            raw_record("B", &[("name", "y")]),
        ];
        let summary = coordinator.run(second_pass, Some(5), false, &cancel).await.unwrap();
        assert_eq!(summary.total, 1);
    }

    #[tokio::test]
    async fn at_most_once_every_input_id_appears_once_after_resume() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(&dir).await;
        let registry = FixtureRegistry::new(vec![]);
        let coordinator = WorkCoordinator::new(registry, Arc::clone(&store), None, 2, 10, false);

        let records = vec![raw_record("A", &[("name", "x")])];
        let cancel = new_cancel_flag();
        coordinator.run(records.clone(), None, false, &cancel).await.unwrap();
        coordinator.run(records, None, false, &cancel).await.unwrap();

        let rows = store.all_rows().await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn retry_errors_reprocesses_only_error_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(&dir).await;
        let registry = FixtureRegistry::new(vec![]);
        let coordinator = WorkCoordinator::new(registry, Arc::clone(&store), None, 2, 10, false);

        // "A" has no location fields -> NOT_FOUND, which counts as
        // processed and is not retried.
        let records = vec![raw_record("A", &[])];
        let cancel = new_cancel_flag();
        coordinator.run(records.clone(), None, false, &cancel).await.unwrap();

        let summary = coordinator.run(records, None, false, &cancel).await.unwrap();
        assert_eq!(summary.total, 0);
    }

    #[tokio::test]
    async fn default_run_skips_error_rows_but_retry_errors_reprocesses_exactly_them() {
        let dir = tempfile::tempdir().unwrap();
        let store = fresh_store(&dir).await;
        let registry = FixtureRegistry::new(vec![]);
        let coordinator = WorkCoordinator::new(registry, Arc::clone(&store), None, 2, 10, false);

        // Seed the store as if a prior run had already checkpointed one
        // ERROR row and one NOT_FOUND row.
        store
            .upsert(&MatchResult::error("A".into(), "Kind", "message"), 1000)
            .await
            .unwrap();
        store
            .upsert(&MatchResult::not_found("B".into(), BTreeMap::new()), 1000)
            .await
            .unwrap();

        let records = vec![raw_record("A", &[]), raw_record("B", &[])];
        let cancel = new_cancel_flag();

        let default_run = coordinator
            .run(records.clone(), None, false, &cancel)
            .await
            .unwrap();
        assert_eq!(
            default_run.total, 0,
            "default run must leave both checkpointed rows alone, ERROR included"
        );

        let retry_run = coordinator.run(records, None, true, &cancel).await.unwrap();
        assert_eq!(
            retry_run.total, 1,
            "retry-errors must reprocess exactly the previously-ERROR row"
        );
    }
}
