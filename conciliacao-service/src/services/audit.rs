//! Sync run audit trail.
//!
//! Wraps the persisted `sync_logs` row for one reconciliation run.
//! Progress writes are rate limited so a bulk run over thousands of
//! invoices does not turn the audit table into a hot row; the final
//! write is never rate limited.

use crate::models::{
    ItemOutcome, NewConciliationLog, RunCounters, RunSummary, SyncRunStatus, SyncType,
};
use crate::services::database::LedgerStore;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{instrument, warn};
use uuid::Uuid;

/// Minimum interval between persisted progress updates.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum per-item outcomes retained in the run summary.
const SAMPLE_CAP: usize = 50;

struct RunState {
    counters: RunCounters,
    sample: Vec<ItemOutcome>,
    total: u32,
    last_flush: Option<Instant>,
}

/// Live audit handle for one sync run.
///
/// Created by [`SyncRunLog::start`], which persists the `running`
/// row; [`SyncRunLog::finish`] must be called on every exit path,
/// including the fatal one.
pub struct SyncRunLog {
    store: Arc<dyn LedgerStore>,
    sync_log_id: Uuid,
    sync_type: SyncType,
    state: Mutex<RunState>,
}

impl SyncRunLog {
    /// Persist the `running` row and return the live handle.
    #[instrument(skip(store), fields(clinic_id = %clinic_id, sync_type = sync_type.as_str()))]
    pub async fn start(
        store: Arc<dyn LedgerStore>,
        clinic_id: Uuid,
        sync_type: SyncType,
    ) -> Result<Self, AppError> {
        let sync_log_id = store.create_sync_log(clinic_id, sync_type).await?;
        Ok(Self {
            store,
            sync_log_id,
            sync_type,
            state: Mutex::new(RunState {
                counters: RunCounters::default(),
                sample: Vec::new(),
                total: 0,
                last_flush: None,
            }),
        })
    }

    pub fn sync_log_id(&self) -> Uuid {
        self.sync_log_id
    }

    pub async fn set_total(&self, total: u32) {
        let mut state = self.state.lock().await;
        state.total = total;
    }

    /// Record one item outcome and append its conciliation log row.
    /// The progress write to `sync_logs` itself is throttled; the
    /// per-item detail row is not, it is the audit trail.
    pub async fn record_item(
        &self,
        counters: RunCounters,
        item: Option<ItemOutcome>,
        detail: Option<NewConciliationLog>,
    ) {
        if let Some(entry) = detail {
            if let Err(e) = self.store.append_conciliation_log(&entry).await {
                warn!(sync_log_id = %self.sync_log_id, error = %e, "Failed to append conciliation log");
            }
        }

        let flush = {
            let mut state = self.state.lock().await;
            state.counters = counters;
            if let Some(item) = item {
                if state.sample.len() < SAMPLE_CAP {
                    state.sample.push(item);
                }
            }
            let due = state
                .last_flush
                .map_or(true, |at| at.elapsed() >= PROGRESS_INTERVAL);
            if due {
                state.last_flush = Some(Instant::now());
                Some((state.counters.processed, state.total))
            } else {
                None
            }
        };

        if let Some((processed, total)) = flush {
            if let Err(e) = self
                .store
                .update_sync_progress(self.sync_log_id, processed as i32, total as i32)
                .await
            {
                warn!(sync_log_id = %self.sync_log_id, error = %e, "Failed to update sync progress");
            }
        }
    }

    /// Finalize the run row. Called exactly once per run, on success
    /// and on fatal failure alike; a failure to persist the final
    /// state is logged but not propagated, the run result stands.
    #[instrument(skip(self), fields(sync_log_id = %self.sync_log_id, status = status.as_str()))]
    pub async fn finish(
        &self,
        status: SyncRunStatus,
        error_message: Option<&str>,
    ) -> RunSummary {
        let (counters, sample, total) = {
            let state = self.state.lock().await;
            (state.counters, state.sample.clone(), state.total)
        };

        let detail = serde_json::json!({
            "total": total,
            "counters": counters,
            "sample": sample,
        });

        if let Err(e) = self
            .store
            .update_sync_progress(self.sync_log_id, counters.processed as i32, total as i32)
            .await
        {
            warn!(sync_log_id = %self.sync_log_id, error = %e, "Failed final progress write");
        }

        if let Err(e) = self
            .store
            .finish_sync_log(self.sync_log_id, status, detail, error_message)
            .await
        {
            warn!(sync_log_id = %self.sync_log_id, error = %e, "Failed to finalize sync log");
        }

        crate::services::metrics::record_sync_run(self.sync_type.as_str(), status.as_str());

        RunSummary {
            sync_log_id: self.sync_log_id,
            sync_type: self.sync_type,
            status,
            counters,
            sample,
        }
    }
}
