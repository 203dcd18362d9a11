//! Sync run audit models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// The sync operation that produced a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    FetchPaidInvoices,
    SyncAllPending,
    ImportFromLytex,
    ImportExternalPaidInvoices,
    FixContributionTypes,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FetchPaidInvoices => "fetch_paid_invoices",
            Self::SyncAllPending => "sync_all_pending",
            Self::ImportFromLytex => "import_from_lytex",
            Self::ImportExternalPaidInvoices => "import_external_paid_invoices",
            Self::FixContributionTypes => "fix_contribution_types",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    Running,
    Completed,
    Failed,
}

impl SyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Running,
        }
    }
}

/// One row per reconciliation run. Created `running` at run start,
/// updated incrementally, finalized exactly once at run end.
#[derive(Debug, Clone, FromRow)]
pub struct SyncLog {
    pub sync_log_id: Uuid,
    pub clinic_id: Uuid,
    pub sync_type: String,
    pub status: String,
    pub processed: i32,
    pub total: i32,
    pub detail: serde_json::Value,
    pub error_message: Option<String>,
    pub started_utc: DateTime<Utc>,
    pub finished_utc: Option<DateTime<Utc>>,
}

/// Per-item outcome of a conciliation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConciliationOutcome {
    Conciliated,
    Error,
    Skipped,
}

impl ConciliationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conciliated => "conciliated",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }
}

/// Append-only record of a single contribution transition performed by
/// a run. Never mutated after insert.
#[derive(Debug, Clone)]
pub struct NewConciliationLog {
    pub sync_log_id: Uuid,
    pub contribution_id: Option<Uuid>,
    pub lytex_invoice_id: Option<String>,
    pub previous_status: Option<String>,
    pub new_status: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub paid_value_cents: Option<i64>,
    pub payment_method: Option<String>,
    pub fee_cents: Option<i64>,
    pub net_value_cents: Option<i64>,
    pub integration_source: Option<String>,
    pub outcome: ConciliationOutcome,
    pub reason: Option<String>,
    pub raw_invoice: Option<serde_json::Value>,
}

/// Counters accumulated over a run and persisted into the sync log
/// detail. Callers receive these even on partial failure.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunCounters {
    pub processed: u32,
    pub conciliated: u32,
    pub already_conciliated: u32,
    pub still_pending: u32,
    pub unresolved: u32,
    pub created: u32,
    pub skipped: u32,
    pub errors: u32,
}

/// Capped per-item sample entry surfaced in the run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub lytex_invoice_id: Option<String>,
    pub contribution_id: Option<Uuid>,
    pub outcome: ConciliationOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Structured result of a run, consumable by the operator dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub sync_log_id: Uuid,
    pub sync_type: SyncType,
    pub status: SyncRunStatus,
    pub counters: RunCounters,
    pub sample: Vec<ItemOutcome>,
}
