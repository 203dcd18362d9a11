//! Reconciliation run handlers.
//!
//! Each POST endpoint starts one synchronous run and returns its
//! summary; the persisted sync log is retrievable afterwards via
//! `GET /sync/logs/{id}`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::models::RunSummary;
use crate::services::database::LedgerStore;
use crate::startup::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct SyncRequest {
    #[validate(length(min = 1, message = "clinic_id is required"))]
    pub clinic_id: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ImportRequest {
    #[validate(length(min = 1, message = "clinic_id is required"))]
    pub clinic_id: String,
    /// Optional provider-side status filter for the listing, e.g.
    /// "paid" or "pending".
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub sync_log_id: Uuid,
    pub sync_type: String,
    pub status: String,
    pub counters: crate::models::RunCounters,
    pub sample: Vec<crate::models::ItemOutcome>,
}

impl From<RunSummary> for SyncResponse {
    fn from(summary: RunSummary) -> Self {
        Self {
            sync_log_id: summary.sync_log_id,
            sync_type: summary.sync_type.as_str().to_string(),
            status: summary.status.as_str().to_string(),
            counters: summary.counters,
            sample: summary.sample,
        }
    }
}

fn parse_clinic_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw.trim())
        .map_err(|_| AppError::BadRequest(anyhow::anyhow!("clinic_id must be a valid UUID")))
}

/// Targeted run: conciliate paid invoices only.
pub async fn fetch_paid_invoices(
    State(state): State<AppState>,
    Json(payload): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, AppError> {
    payload.validate()?;
    let clinic_id = parse_clinic_id(&payload.clinic_id)?;
    tracing::info!(clinic_id = %clinic_id, "Starting fetch-paid-invoices run");

    let summary = state.engine.fetch_paid_invoices(clinic_id).await?;
    Ok(Json(SyncResponse::from(summary)))
}

/// Targeted run: refresh every pending contribution's status.
pub async fn sync_all_pending(
    State(state): State<AppState>,
    Json(payload): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, AppError> {
    payload.validate()?;
    let clinic_id = parse_clinic_id(&payload.clinic_id)?;
    tracing::info!(clinic_id = %clinic_id, "Starting sync-all-pending run");

    let summary = state.engine.sync_all_pending(clinic_id).await?;
    Ok(Json(SyncResponse::from(summary)))
}

/// Bulk discovery run over the provider's invoice listing.
pub async fn import_from_lytex(
    State(state): State<AppState>,
    Json(payload): Json<ImportRequest>,
) -> Result<Json<SyncResponse>, AppError> {
    payload.validate()?;
    let clinic_id = parse_clinic_id(&payload.clinic_id)?;
    tracing::info!(
        clinic_id = %clinic_id,
        status_filter = payload.status.as_deref().unwrap_or("<none>"),
        "Starting import-from-lytex run"
    );

    let summary = state
        .engine
        .import_from_lytex(clinic_id, payload.status)
        .await?;
    Ok(Json(SyncResponse::from(summary)))
}

/// Bulk discovery run restricted to invoices paid outside the ledger.
pub async fn import_external_paid_invoices(
    State(state): State<AppState>,
    Json(payload): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, AppError> {
    payload.validate()?;
    let clinic_id = parse_clinic_id(&payload.clinic_id)?;
    tracing::info!(clinic_id = %clinic_id, "Starting import-external-paid-invoices run");

    let summary = state.engine.import_external_paid_invoices(clinic_id).await?;
    Ok(Json(SyncResponse::from(summary)))
}

/// Re-classify contributions carrying the default contribution type.
pub async fn fix_contribution_types(
    State(state): State<AppState>,
    Json(payload): Json<SyncRequest>,
) -> Result<Json<SyncResponse>, AppError> {
    payload.validate()?;
    let clinic_id = parse_clinic_id(&payload.clinic_id)?;
    tracing::info!(clinic_id = %clinic_id, "Starting fix-contribution-types run");

    let summary = state.engine.fix_contribution_types(clinic_id).await?;
    Ok(Json(SyncResponse::from(summary)))
}

/// Fetch one persisted sync log by id.
pub async fn get_sync_log(
    State(state): State<AppState>,
    Path(sync_log_id): Path<Uuid>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let log = state
        .db
        .get_sync_log(sync_log_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Sync log not found")))?;

    Ok((
        StatusCode::OK,
        Json(json!({
            "sync_log_id": log.sync_log_id,
            "clinic_id": log.clinic_id,
            "sync_type": log.sync_type,
            "status": log.status,
            "processed": log.processed,
            "total": log.total,
            "detail": log.detail,
            "error_message": log.error_message,
            "started_utc": log.started_utc,
            "finished_utc": log.finished_utc,
        })),
    ))
}
