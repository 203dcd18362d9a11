//! Common test utilities for conciliacao-service integration tests.
//!
//! The engine is exercised against in-memory implementations of the
//! storage and gateway seams, so these tests need neither Postgres nor
//! network access.

use async_trait::async_trait;
use chrono::Utc;
use conciliacao_service::models::{
    Contribution, ContributionStatus, ContributionType, Employer, IntegrationSource,
    NewConciliationLog, NewContribution, SyncLog, SyncRunStatus, SyncType,
};
use conciliacao_service::services::database::PaidUpdate;
use conciliacao_service::services::{FetchedInvoice, InvoiceGateway, InvoicePage, LedgerStore};
use serde_json::Value;
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, Once};
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,conciliacao_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

#[derive(Debug, Clone)]
pub struct SyncLogRecord {
    pub clinic_id: Uuid,
    pub sync_type: String,
    pub status: String,
    pub processed: i32,
    pub total: i32,
    pub detail: Value,
    pub error_message: Option<String>,
    pub finished: bool,
}

#[derive(Default)]
struct StoreState {
    contributions: Vec<Contribution>,
    employers: Vec<Employer>,
    types: Vec<ContributionType>,
    sync_logs: HashMap<Uuid, SyncLogRecord>,
    conciliation_logs: Vec<NewConciliationLog>,
    progress_writes: u32,
}

/// In-memory [`LedgerStore`] mirroring the Postgres semantics the
/// engine relies on, including the never-demote-paid upsert guard.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
    pub fail_listing: bool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_listing() -> Self {
        Self {
            fail_listing: true,
            ..Self::default()
        }
    }

    pub fn seed_type(&self, clinic_id: Uuid, code: &str, description: &str, is_default: bool) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().unwrap().types.push(ContributionType {
            contribution_type_id: id,
            clinic_id,
            code: code.to_string(),
            description: description.to_string(),
            is_default,
            created_utc: Utc::now(),
        });
        id
    }

    pub fn seed_contribution(
        &self,
        clinic_id: Uuid,
        contribution_type_id: Uuid,
        invoice_id: &str,
        status: ContributionStatus,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.state.lock().unwrap().contributions.push(Contribution {
            contribution_id: id,
            clinic_id,
            employer_id: Uuid::new_v4(),
            contribution_type_id,
            competence_month: 1,
            competence_year: 2026,
            due_date: chrono::NaiveDate::from_ymd_opt(2026, 2, 10).unwrap(),
            value_cents: 15_000,
            status: status.as_str().to_string(),
            lytex_invoice_id: Some(invoice_id.to_string()),
            lytex_transaction_id: None,
            paid_at: None,
            paid_value_cents: None,
            payment_method: None,
            fee_cents: None,
            net_value_cents: None,
            is_reconciled: false,
            reconciled_at: None,
            origin: "manual".to_string(),
            integration_source: None,
            created_utc: now,
            updated_utc: now,
        });
        id
    }

    pub fn contribution(&self, contribution_id: Uuid) -> Option<Contribution> {
        self.state
            .lock()
            .unwrap()
            .contributions
            .iter()
            .find(|c| c.contribution_id == contribution_id)
            .cloned()
    }

    pub fn contributions(&self) -> Vec<Contribution> {
        self.state.lock().unwrap().contributions.clone()
    }

    pub fn sync_log_record(&self, sync_log_id: Uuid) -> Option<SyncLogRecord> {
        self.state
            .lock()
            .unwrap()
            .sync_logs
            .get(&sync_log_id)
            .cloned()
    }

    pub fn conciliation_log_count(&self) -> usize {
        self.state.lock().unwrap().conciliation_logs.len()
    }

    /// The single sync log of a one-run test.
    pub fn get_only_sync_log(&self) -> Option<SyncLogRecord> {
        let state = self.state.lock().unwrap();
        let mut logs = state.sync_logs.values();
        let record = logs.next().cloned();
        assert!(logs.next().is_none(), "expected exactly one sync log");
        record
    }

    pub fn progress_write_count(&self) -> u32 {
        self.state.lock().unwrap().progress_writes
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn list_contributions_with_invoice(
        &self,
        clinic_id: Uuid,
    ) -> Result<Vec<Contribution>, AppError> {
        if self.fail_listing {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "listing unavailable"
            )));
        }
        Ok(self
            .state
            .lock()
            .unwrap()
            .contributions
            .iter()
            .filter(|c| c.clinic_id == clinic_id && c.lytex_invoice_id.is_some())
            .cloned()
            .collect())
    }

    async fn mark_contribution_paid(
        &self,
        contribution_id: Uuid,
        update: &PaidUpdate,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        let contribution = state
            .contributions
            .iter_mut()
            .find(|c| c.contribution_id == contribution_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("contribution not found")))?;
        contribution.status = ContributionStatus::Paid.as_str().to_string();
        contribution.paid_at = update.paid_at;
        contribution.paid_value_cents = update.paid_value_cents;
        contribution.payment_method = update.payment_method.clone();
        contribution.fee_cents = update.fee_cents;
        contribution.net_value_cents = update.net_value_cents;
        contribution.lytex_transaction_id = update
            .lytex_transaction_id
            .clone()
            .or(contribution.lytex_transaction_id.take());
        contribution.integration_source = Some(update.integration_source.clone());
        contribution.is_reconciled = true;
        contribution.reconciled_at = Some(Utc::now());
        Ok(())
    }

    async fn update_contribution_status(
        &self,
        contribution_id: Uuid,
        status: ContributionStatus,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state
            .contributions
            .iter_mut()
            .find(|c| c.contribution_id == contribution_id)
        {
            if c.status != ContributionStatus::Paid.as_str() {
                c.status = status.as_str().to_string();
            }
        }
        Ok(())
    }

    async fn upsert_contributions(&self, rows: &[NewContribution]) -> Result<u32, AppError> {
        let mut state = self.state.lock().unwrap();
        let mut affected = 0u32;
        for row in rows {
            let key = (
                row.clinic_id,
                row.employer_id,
                row.contribution_type_id,
                row.competence_month,
                row.competence_year,
            );
            let existing = state.contributions.iter_mut().find(|c| {
                (
                    c.clinic_id,
                    c.employer_id,
                    c.contribution_type_id,
                    c.competence_month,
                    c.competence_year,
                ) == key
            });
            match existing {
                Some(c) => {
                    let demotes_paid = c.status == ContributionStatus::Paid.as_str()
                        && row.status != ContributionStatus::Paid;
                    if demotes_paid {
                        continue;
                    }
                    c.status = row.status.as_str().to_string();
                    c.due_date = row.due_date;
                    c.value_cents = row.value_cents;
                    c.lytex_invoice_id = Some(row.lytex_invoice_id.clone());
                    c.paid_at = row.paid_at;
                    c.paid_value_cents = row.paid_value_cents;
                    c.integration_source = Some(row.integration_source.as_str().to_string());
                    affected += 1;
                }
                None => {
                    let now = Utc::now();
                    state.contributions.push(Contribution {
                        contribution_id: Uuid::new_v4(),
                        clinic_id: row.clinic_id,
                        employer_id: row.employer_id,
                        contribution_type_id: row.contribution_type_id,
                        competence_month: row.competence_month,
                        competence_year: row.competence_year,
                        due_date: row.due_date,
                        value_cents: row.value_cents,
                        status: row.status.as_str().to_string(),
                        lytex_invoice_id: Some(row.lytex_invoice_id.clone()),
                        lytex_transaction_id: row.lytex_transaction_id.clone(),
                        paid_at: row.paid_at,
                        paid_value_cents: row.paid_value_cents,
                        payment_method: row.payment_method.clone(),
                        fee_cents: row.fee_cents,
                        net_value_cents: row.net_value_cents,
                        is_reconciled: row.status == ContributionStatus::Paid,
                        reconciled_at: row.paid_at.map(|_| now),
                        origin: "lytex-import".to_string(),
                        integration_source: Some(row.integration_source.as_str().to_string()),
                        created_utc: now,
                        updated_utc: now,
                    });
                    affected += 1;
                }
            }
        }
        Ok(affected)
    }

    async fn list_default_type_contributions(
        &self,
        clinic_id: Uuid,
    ) -> Result<Vec<Contribution>, AppError> {
        let state = self.state.lock().unwrap();
        let default_types: HashSet<Uuid> = state
            .types
            .iter()
            .filter(|t| t.is_default)
            .map(|t| t.contribution_type_id)
            .collect();
        Ok(state
            .contributions
            .iter()
            .filter(|c| {
                c.clinic_id == clinic_id
                    && c.lytex_invoice_id.is_some()
                    && default_types.contains(&c.contribution_type_id)
            })
            .cloned()
            .collect())
    }

    async fn update_contribution_type(
        &self,
        contribution_id: Uuid,
        contribution_type_id: Uuid,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        if let Some(c) = state
            .contributions
            .iter_mut()
            .find(|c| c.contribution_id == contribution_id)
        {
            c.contribution_type_id = contribution_type_id;
        }
        Ok(())
    }

    async fn find_or_create_employer(
        &self,
        clinic_id: Uuid,
        name: &str,
        cnpj: &str,
    ) -> Result<Employer, AppError> {
        let mut state = self.state.lock().unwrap();
        if let Some(e) = state
            .employers
            .iter()
            .find(|e| e.clinic_id == clinic_id && e.cnpj == cnpj)
        {
            return Ok(e.clone());
        }
        let now = Utc::now();
        let employer = Employer {
            employer_id: Uuid::new_v4(),
            clinic_id,
            name: name.to_string(),
            cnpj: cnpj.to_string(),
            created_utc: now,
            updated_utc: now,
        };
        state.employers.push(employer.clone());
        Ok(employer)
    }

    async fn list_contribution_types(
        &self,
        clinic_id: Uuid,
    ) -> Result<Vec<ContributionType>, AppError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .types
            .iter()
            .filter(|t| t.clinic_id == clinic_id)
            .cloned()
            .collect())
    }

    async fn find_or_create_default_type(
        &self,
        clinic_id: Uuid,
    ) -> Result<ContributionType, AppError> {
        let mut state = self.state.lock().unwrap();
        if let Some(t) = state
            .types
            .iter()
            .find(|t| t.clinic_id == clinic_id && t.is_default)
        {
            return Ok(t.clone());
        }
        let created = ContributionType {
            contribution_type_id: Uuid::new_v4(),
            clinic_id,
            code: "999".to_string(),
            description: "CONTRIBUICAO DIVERSA".to_string(),
            is_default: true,
            created_utc: Utc::now(),
        };
        state.types.push(created.clone());
        Ok(created)
    }

    async fn create_sync_log(
        &self,
        clinic_id: Uuid,
        sync_type: SyncType,
    ) -> Result<Uuid, AppError> {
        let sync_log_id = Uuid::new_v4();
        self.state.lock().unwrap().sync_logs.insert(
            sync_log_id,
            SyncLogRecord {
                clinic_id,
                sync_type: sync_type.as_str().to_string(),
                status: SyncRunStatus::Running.as_str().to_string(),
                processed: 0,
                total: 0,
                detail: Value::Null,
                error_message: None,
                finished: false,
            },
        );
        Ok(sync_log_id)
    }

    async fn update_sync_progress(
        &self,
        sync_log_id: Uuid,
        processed: i32,
        total: i32,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        state.progress_writes += 1;
        if let Some(record) = state.sync_logs.get_mut(&sync_log_id) {
            record.processed = processed;
            record.total = total;
        }
        Ok(())
    }

    async fn finish_sync_log(
        &self,
        sync_log_id: Uuid,
        status: SyncRunStatus,
        detail: Value,
        error_message: Option<&str>,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.sync_logs.get_mut(&sync_log_id) {
            record.status = status.as_str().to_string();
            record.detail = detail;
            record.error_message = error_message.map(|s| s.to_string());
            record.finished = true;
        }
        Ok(())
    }

    async fn append_conciliation_log(&self, entry: &NewConciliationLog) -> Result<(), AppError> {
        self.state
            .lock()
            .unwrap()
            .conciliation_logs
            .push(entry.clone());
        Ok(())
    }

    async fn get_sync_log(&self, sync_log_id: Uuid) -> Result<Option<SyncLog>, AppError> {
        let state = self.state.lock().unwrap();
        Ok(state.sync_logs.get(&sync_log_id).map(|r| SyncLog {
            sync_log_id,
            clinic_id: r.clinic_id,
            sync_type: r.sync_type.clone(),
            status: r.status.clone(),
            processed: r.processed,
            total: r.total,
            detail: r.detail.clone(),
            error_message: r.error_message.clone(),
            started_utc: Utc::now(),
            finished_utc: r.finished.then(Utc::now),
        }))
    }
}

#[derive(Default)]
struct GatewayState {
    primary: HashMap<String, Value>,
    secondary: HashMap<String, Value>,
    primary_errors: HashSet<String>,
    auth_error: bool,
    /// (slot, invoice id) pairs in lookup order.
    lookups: Vec<(IntegrationSource, String)>,
}

/// In-memory [`InvoiceGateway`] with the same fallback contract as the
/// HTTP client: the secondary slot is consulted only when the primary
/// slot reports not-found.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<GatewayState>,
    pub has_secondary: bool,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secondary() -> Self {
        Self {
            has_secondary: true,
            ..Self::default()
        }
    }

    pub fn put_primary(&self, invoice_id: &str, raw: Value) {
        self.state
            .lock()
            .unwrap()
            .primary
            .insert(invoice_id.to_string(), raw);
    }

    pub fn put_secondary(&self, invoice_id: &str, raw: Value) {
        self.state
            .lock()
            .unwrap()
            .secondary
            .insert(invoice_id.to_string(), raw);
    }

    pub fn fail_authentication(&self) {
        self.state.lock().unwrap().auth_error = true;
    }

    pub fn fail_primary(&self, invoice_id: &str) {
        self.state
            .lock()
            .unwrap()
            .primary_errors
            .insert(invoice_id.to_string());
    }

    pub fn lookups(&self) -> Vec<(IntegrationSource, String)> {
        self.state.lock().unwrap().lookups.clone()
    }
}

#[async_trait]
impl InvoiceGateway for FakeGateway {
    async fn authenticate_primary(&self) -> Result<(), AppError> {
        if self.state.lock().unwrap().auth_error {
            return Err(AppError::GatewayError(anyhow::anyhow!(
                "token exchange rejected (500)"
            )));
        }
        Ok(())
    }

    async fn find_invoice(&self, invoice_id: &str) -> Result<Option<FetchedInvoice>, AppError> {
        let mut state = self.state.lock().unwrap();
        state
            .lookups
            .push((IntegrationSource::Primary, invoice_id.to_string()));

        if state.primary_errors.contains(invoice_id) {
            return Err(AppError::GatewayError(anyhow::anyhow!(
                "provider returned 500"
            )));
        }
        if let Some(raw) = state.primary.get(invoice_id) {
            return Ok(Some(FetchedInvoice {
                raw: raw.clone(),
                source: IntegrationSource::Primary,
            }));
        }
        if !self.has_secondary {
            return Ok(None);
        }

        state
            .lookups
            .push((IntegrationSource::Secondary, invoice_id.to_string()));
        Ok(state.secondary.get(invoice_id).map(|raw| FetchedInvoice {
            raw: raw.clone(),
            source: IntegrationSource::Secondary,
        }))
    }

    async fn list_invoices(
        &self,
        source: IntegrationSource,
        _status: Option<&str>,
        page: u32,
        limit: u32,
    ) -> Result<InvoicePage, AppError> {
        let state = self.state.lock().unwrap();
        let slot = match source {
            IntegrationSource::Primary => &state.primary,
            IntegrationSource::Secondary => &state.secondary,
        };
        let mut all: Vec<(&String, &Value)> = slot.iter().collect();
        all.sort_by_key(|(id, _)| (*id).clone());
        let start = ((page - 1) * limit) as usize;
        let invoices: Vec<Value> = all
            .into_iter()
            .skip(start)
            .take(limit as usize)
            .map(|(_, v)| v.clone())
            .collect();
        let has_more = invoices.len() as u32 == limit;
        Ok(InvoicePage { invoices, has_more })
    }

    async fn available_sources(&self) -> Vec<IntegrationSource> {
        if self.has_secondary {
            vec![IntegrationSource::Primary, IntegrationSource::Secondary]
        } else {
            vec![IntegrationSource::Primary]
        }
    }
}
