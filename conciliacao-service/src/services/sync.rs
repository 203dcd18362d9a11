//! Reconciliation engine.
//!
//! Two families of runs over the same machinery:
//!
//! * targeted: walk ledger contributions that already carry a provider
//!   invoice id and refresh them from the provider;
//! * bulk discovery: page through the provider's invoice listing and
//!   upsert ledger rows for everything found there.
//!
//! Item failures never abort a run. Gateway calls are issued in chunks
//! with bounded concurrency; chunks themselves run sequentially so a
//! slow provider degrades throughput instead of connection counts.

use crate::models::{
    ConciliationOutcome, Contribution, ContributionStatus, ContributionType, ItemOutcome,
    NewConciliationLog, NewContribution, RunCounters, RunSummary, SyncRunStatus, SyncType,
};
use crate::services::audit::SyncRunLog;
use crate::services::competence::{self, resolve_competence};
use crate::services::database::{LedgerStore, PaidUpdate};
use crate::services::lytex::{FetchedInvoice, InvoiceGateway};
use crate::services::metrics::{record_error, record_sync_item};
use crate::services::status::{
    self, extract_paid_fields, extract_total_value_cents, extract_transaction_id, map_status,
};
use chrono::{NaiveDate, Utc};
use futures::future::join_all;
use serde_json::Value;
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::SyncConfig;

const INVOICE_ID_PATHS: &[&str] = &["_id", "id", "invoiceId", "invoice_id"];
const PAYER_NAME_PATHS: &[&str] = &[
    "client.name",
    "customer.name",
    "payer.name",
    "clientName",
    "name",
];
const PAYER_TAX_ID_PATHS: &[&str] = &[
    "client.cpfCnpj",
    "client.cnpj",
    "client.document",
    "customer.cpfCnpj",
    "payer.document",
    "cpfCnpj",
];
const DESCRIPTION_PATHS: &[&str] = &[
    "description",
    "items.0.description",
    "referenceDescription",
    "observation",
];

fn extract_invoice_id(raw: &Value) -> Option<String> {
    status::first_present(raw, INVOICE_ID_PATHS)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn extract_payer_name(raw: &Value) -> Option<String> {
    status::first_present(raw, PAYER_NAME_PATHS)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn extract_payer_tax_id(raw: &Value) -> Option<String> {
    status::first_present(raw, PAYER_TAX_ID_PATHS)
        .and_then(|v| v.as_str())
        .map(normalize_tax_id)
        .filter(|s| !s.is_empty())
}

fn extract_description(raw: &Value) -> Option<String> {
    status::first_present(raw, DESCRIPTION_PATHS)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Payer documents arrive formatted ("12.345.678/0001-90") or bare;
/// only the digits participate in identity.
fn normalize_tax_id(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    Conciliated,
    AlreadyConciliated,
    StillPending,
    Unresolved,
    Created,
    Skipped,
    Error,
}

impl ItemKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Conciliated => "conciliated",
            Self::AlreadyConciliated => "already_conciliated",
            Self::StillPending => "still_pending",
            Self::Unresolved => "unresolved",
            Self::Created => "created",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }

    fn outcome(&self) -> ConciliationOutcome {
        match self {
            Self::Conciliated | Self::Created => ConciliationOutcome::Conciliated,
            Self::Error => ConciliationOutcome::Error,
            _ => ConciliationOutcome::Skipped,
        }
    }
}

struct ItemReport {
    kind: ItemKind,
    item: ItemOutcome,
    detail: Option<NewConciliationLog>,
}

impl ItemReport {
    fn new(
        kind: ItemKind,
        lytex_invoice_id: Option<String>,
        contribution_id: Option<Uuid>,
        reason: Option<String>,
    ) -> Self {
        Self {
            kind,
            item: ItemOutcome {
                lytex_invoice_id,
                contribution_id,
                outcome: kind.outcome(),
                reason,
            },
            detail: None,
        }
    }

    fn with_detail(mut self, detail: NewConciliationLog) -> Self {
        self.detail = Some(detail);
        self
    }
}

fn apply_counters(counters: &mut RunCounters, kind: ItemKind) {
    counters.processed += 1;
    match kind {
        ItemKind::Conciliated => counters.conciliated += 1,
        ItemKind::AlreadyConciliated => counters.already_conciliated += 1,
        ItemKind::StillPending => counters.still_pending += 1,
        ItemKind::Unresolved => counters.unresolved += 1,
        ItemKind::Created => counters.created += 1,
        ItemKind::Skipped => counters.skipped += 1,
        ItemKind::Error => counters.errors += 1,
    }
}

/// Reconciliation engine service.
pub struct SyncEngine {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn InvoiceGateway>,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn InvoiceGateway>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }

    /// Targeted run that only applies the paid transition; everything
    /// else is reported and left untouched.
    #[instrument(skip(self), fields(clinic_id = %clinic_id))]
    pub async fn fetch_paid_invoices(&self, clinic_id: Uuid) -> Result<RunSummary, AppError> {
        self.run_targeted(clinic_id, SyncType::FetchPaidInvoices, false)
            .await
    }

    /// Targeted run that applies every mapped status, not just paid.
    #[instrument(skip(self), fields(clinic_id = %clinic_id))]
    pub async fn sync_all_pending(&self, clinic_id: Uuid) -> Result<RunSummary, AppError> {
        self.run_targeted(clinic_id, SyncType::SyncAllPending, true)
            .await
    }

    /// Bulk discovery over the provider listing, optionally narrowed
    /// by a provider-side status filter.
    #[instrument(skip(self), fields(clinic_id = %clinic_id))]
    pub async fn import_from_lytex(
        &self,
        clinic_id: Uuid,
        status_filter: Option<String>,
    ) -> Result<RunSummary, AppError> {
        self.run_bulk(
            clinic_id,
            SyncType::ImportFromLytex,
            status_filter.as_deref(),
            false,
        )
        .await
    }

    /// Bulk discovery restricted to invoices that map to paid. Used to
    /// backfill payments collected outside the ledger's own billing.
    #[instrument(skip(self), fields(clinic_id = %clinic_id))]
    pub async fn import_external_paid_invoices(
        &self,
        clinic_id: Uuid,
    ) -> Result<RunSummary, AppError> {
        self.run_bulk(
            clinic_id,
            SyncType::ImportExternalPaidInvoices,
            Some("paid"),
            true,
        )
        .await
    }

    /// Re-classify contributions stuck on the default type by reading
    /// their invoice description again.
    #[instrument(skip(self), fields(clinic_id = %clinic_id))]
    pub async fn fix_contribution_types(&self, clinic_id: Uuid) -> Result<RunSummary, AppError> {
        let run =
            SyncRunLog::start(self.store.clone(), clinic_id, SyncType::FixContributionTypes)
                .await?;
        match self.fix_types_inner(&run, clinic_id).await {
            Ok(()) => Ok(run.finish(SyncRunStatus::Completed, None).await),
            Err(e) => {
                record_error("fix_contribution_types");
                run.finish(SyncRunStatus::Failed, Some(&e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn run_targeted(
        &self,
        clinic_id: Uuid,
        sync_type: SyncType,
        apply_all_statuses: bool,
    ) -> Result<RunSummary, AppError> {
        let run = SyncRunLog::start(self.store.clone(), clinic_id, sync_type).await?;
        match self
            .targeted_inner(&run, clinic_id, sync_type, apply_all_statuses)
            .await
        {
            Ok(()) => Ok(run.finish(SyncRunStatus::Completed, None).await),
            Err(e) => {
                record_error(sync_type.as_str());
                run.finish(SyncRunStatus::Failed, Some(&e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn targeted_inner(
        &self,
        run: &SyncRunLog,
        clinic_id: Uuid,
        sync_type: SyncType,
        apply_all_statuses: bool,
    ) -> Result<(), AppError> {
        self.gateway.authenticate_primary().await?;
        let contributions = self.store.list_contributions_with_invoice(clinic_id).await?;
        run.set_total(contributions.len() as u32).await;
        info!(
            clinic_id = %clinic_id,
            total = contributions.len(),
            sync_type = sync_type.as_str(),
            "Targeted reconciliation started"
        );

        let today = Utc::now().date_naive();
        let mut counters = RunCounters::default();

        for chunk in contributions.chunks(self.config.chunk_size) {
            let reports = join_all(chunk.iter().map(|contribution| {
                self.process_targeted_item(
                    run.sync_log_id(),
                    contribution,
                    today,
                    apply_all_statuses,
                )
            }))
            .await;

            for report in reports {
                apply_counters(&mut counters, report.kind);
                record_sync_item(sync_type.as_str(), report.kind.as_str());
                run.record_item(counters, Some(report.item), report.detail)
                    .await;
            }
        }

        info!(
            clinic_id = %clinic_id,
            processed = counters.processed,
            conciliated = counters.conciliated,
            errors = counters.errors,
            "Targeted reconciliation finished"
        );
        Ok(())
    }

    /// One targeted item, isolated: every failure mode becomes a
    /// report, never an early return.
    async fn process_targeted_item(
        &self,
        sync_log_id: Uuid,
        contribution: &Contribution,
        today: NaiveDate,
        apply_all_statuses: bool,
    ) -> ItemReport {
        let invoice_id = match contribution.lytex_invoice_id.clone() {
            Some(id) => id,
            None => {
                return ItemReport::new(
                    ItemKind::Unresolved,
                    None,
                    Some(contribution.contribution_id),
                    Some("contribution has no invoice id".to_string()),
                )
            }
        };

        if contribution.is_durably_paid() {
            return ItemReport::new(
                ItemKind::AlreadyConciliated,
                Some(invoice_id),
                Some(contribution.contribution_id),
                None,
            );
        }

        let fetched = match self.gateway.find_invoice(&invoice_id).await {
            Ok(Some(fetched)) => fetched,
            Ok(None) => {
                return ItemReport::new(
                    ItemKind::Unresolved,
                    Some(invoice_id),
                    Some(contribution.contribution_id),
                    Some("invoice not found on any integration source".to_string()),
                )
            }
            Err(e) => {
                warn!(
                    invoice_id = %invoice_id,
                    contribution_id = %contribution.contribution_id,
                    error = %e,
                    "Invoice lookup failed"
                );
                return ItemReport::new(
                    ItemKind::Error,
                    Some(invoice_id),
                    Some(contribution.contribution_id),
                    Some(e.to_string()),
                );
            }
        };

        let mapped = map_status(&fetched.raw, today);

        if mapped == ContributionStatus::Paid {
            let fields = extract_paid_fields(&fetched.raw, mapped);
            let update = PaidUpdate {
                paid_at: fields.paid_at,
                paid_value_cents: fields.paid_value_cents,
                payment_method: fields.payment_method.clone(),
                fee_cents: fields.fee_cents,
                net_value_cents: fields.net_value_cents,
                lytex_transaction_id: extract_transaction_id(&fetched.raw),
                integration_source: fetched.source.as_str().to_string(),
            };
            return match self
                .store
                .mark_contribution_paid(contribution.contribution_id, &update)
                .await
            {
                Ok(()) => ItemReport::new(
                    ItemKind::Conciliated,
                    Some(invoice_id.clone()),
                    Some(contribution.contribution_id),
                    None,
                )
                .with_detail(NewConciliationLog {
                    sync_log_id,
                    contribution_id: Some(contribution.contribution_id),
                    lytex_invoice_id: Some(invoice_id),
                    previous_status: Some(contribution.status.clone()),
                    new_status: Some(ContributionStatus::Paid.as_str().to_string()),
                    paid_at: fields.paid_at,
                    paid_value_cents: fields.paid_value_cents,
                    payment_method: fields.payment_method,
                    fee_cents: fields.fee_cents,
                    net_value_cents: fields.net_value_cents,
                    integration_source: Some(fetched.source.as_str().to_string()),
                    outcome: ConciliationOutcome::Conciliated,
                    reason: None,
                    raw_invoice: Some(fetched.raw),
                }),
                Err(e) => ItemReport::new(
                    ItemKind::Error,
                    Some(invoice_id),
                    Some(contribution.contribution_id),
                    Some(e.to_string()),
                ),
            };
        }

        // Not paid. In all-statuses mode, persist the transition when
        // the provider disagrees with the ledger.
        if apply_all_statuses && mapped != contribution.status() {
            if let Err(e) = self
                .store
                .update_contribution_status(contribution.contribution_id, mapped)
                .await
            {
                return ItemReport::new(
                    ItemKind::Error,
                    Some(invoice_id),
                    Some(contribution.contribution_id),
                    Some(e.to_string()),
                );
            }
            return ItemReport::new(
                ItemKind::StillPending,
                Some(invoice_id.clone()),
                Some(contribution.contribution_id),
                Some(format!("status updated to {}", mapped.as_str())),
            )
            .with_detail(NewConciliationLog {
                sync_log_id,
                contribution_id: Some(contribution.contribution_id),
                lytex_invoice_id: Some(invoice_id),
                previous_status: Some(contribution.status.clone()),
                new_status: Some(mapped.as_str().to_string()),
                paid_at: None,
                paid_value_cents: None,
                payment_method: None,
                fee_cents: None,
                net_value_cents: None,
                integration_source: Some(fetched.source.as_str().to_string()),
                outcome: ConciliationOutcome::Skipped,
                reason: Some("status transition without payment".to_string()),
                raw_invoice: Some(fetched.raw),
            });
        }

        ItemReport::new(
            ItemKind::StillPending,
            Some(invoice_id),
            Some(contribution.contribution_id),
            Some(format!("provider status maps to {}", mapped.as_str())),
        )
    }

    async fn run_bulk(
        &self,
        clinic_id: Uuid,
        sync_type: SyncType,
        provider_status: Option<&str>,
        paid_only: bool,
    ) -> Result<RunSummary, AppError> {
        let run = SyncRunLog::start(self.store.clone(), clinic_id, sync_type).await?;
        match self
            .bulk_inner(&run, clinic_id, sync_type, provider_status, paid_only)
            .await
        {
            Ok(()) => Ok(run.finish(SyncRunStatus::Completed, None).await),
            Err(e) => {
                record_error(sync_type.as_str());
                run.finish(SyncRunStatus::Failed, Some(&e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn bulk_inner(
        &self,
        run: &SyncRunLog,
        clinic_id: Uuid,
        sync_type: SyncType,
        provider_status: Option<&str>,
        paid_only: bool,
    ) -> Result<(), AppError> {
        self.gateway.authenticate_primary().await?;
        let candidates = self.discover_invoices(provider_status).await?;
        run.set_total(candidates.len() as u32).await;
        info!(
            clinic_id = %clinic_id,
            discovered = candidates.len(),
            sync_type = sync_type.as_str(),
            "Bulk discovery started"
        );

        let types = self.store.list_contribution_types(clinic_id).await?;
        let known_codes: HashSet<String> = types.iter().map(|t| t.code.clone()).collect();
        let mut type_by_code: HashMap<String, Uuid> = types
            .iter()
            .map(|t| (t.code.clone(), t.contribution_type_id))
            .collect();

        let today = Utc::now().date_naive();
        let mut counters = RunCounters::default();
        // Highest status rank wins when two invoices collapse onto the
        // same (employer, type, competence) key within the run.
        let mut by_key: HashMap<(Uuid, Uuid, i32, i32), NewContribution> = HashMap::new();

        for fetched in candidates {
            let report = self
                .build_bulk_row(
                    clinic_id,
                    &fetched,
                    today,
                    paid_only,
                    &known_codes,
                    &mut type_by_code,
                )
                .await;

            match report {
                Ok(row) => {
                    let key = (
                        row.employer_id,
                        row.contribution_type_id,
                        row.competence_month,
                        row.competence_year,
                    );
                    match by_key.get(&key) {
                        Some(existing) if existing.status.rank() >= row.status.rank() => {
                            apply_counters(&mut counters, ItemKind::Skipped);
                            record_sync_item(sync_type.as_str(), ItemKind::Skipped.as_str());
                            run.record_item(
                                counters,
                                Some(ItemOutcome {
                                    lytex_invoice_id: Some(row.lytex_invoice_id),
                                    contribution_id: None,
                                    outcome: ConciliationOutcome::Skipped,
                                    reason: Some(
                                        "duplicate competence key with lower status rank"
                                            .to_string(),
                                    ),
                                }),
                                None,
                            )
                            .await;
                        }
                        _ => {
                            by_key.insert(key, row);
                            apply_counters(&mut counters, ItemKind::Created);
                            record_sync_item(sync_type.as_str(), ItemKind::Created.as_str());
                            run.record_item(counters, None, None).await;
                        }
                    }
                }
                Err(report) => {
                    apply_counters(&mut counters, report.kind);
                    record_sync_item(sync_type.as_str(), report.kind.as_str());
                    run.record_item(counters, Some(report.item), report.detail)
                        .await;
                }
            }
        }

        let rows: Vec<NewContribution> = by_key.into_values().collect();
        let mut upserted = 0u32;
        for chunk in rows.chunks(self.config.chunk_size) {
            upserted += self.store.upsert_contributions(chunk).await?;
        }
        // Rows that lost the never-demote-paid guard in the store do
        // not count as created.
        counters.created = upserted;
        run.record_item(counters, None, None).await;

        info!(
            clinic_id = %clinic_id,
            processed = counters.processed,
            created = counters.created,
            skipped = counters.skipped,
            errors = counters.errors,
            "Bulk discovery finished"
        );
        Ok(())
    }

    /// Page through every available source, deduplicating by invoice
    /// id across sources; the primary slot is listed first and wins.
    async fn discover_invoices(
        &self,
        provider_status: Option<&str>,
    ) -> Result<Vec<FetchedInvoice>, AppError> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut out: Vec<FetchedInvoice> = Vec::new();

        for source in self.gateway.available_sources().await {
            let mut page = 1u32;
            loop {
                let listing = self
                    .gateway
                    .list_invoices(source, provider_status, page, self.config.page_limit)
                    .await?;
                let more = listing.has_more;
                for raw in listing.invoices {
                    if let Some(id) = extract_invoice_id(&raw) {
                        if seen.insert(id) {
                            out.push(FetchedInvoice { raw, source });
                        }
                    }
                }
                if !more {
                    break;
                }
                page += 1;
            }
        }

        Ok(out)
    }

    /// Turn one discovered invoice into a ledger row, or a report
    /// explaining why it cannot become one.
    async fn build_bulk_row(
        &self,
        clinic_id: Uuid,
        fetched: &FetchedInvoice,
        today: NaiveDate,
        paid_only: bool,
        known_codes: &HashSet<String>,
        type_by_code: &mut HashMap<String, Uuid>,
    ) -> Result<NewContribution, ItemReport> {
        let raw = &fetched.raw;
        let invoice_id = extract_invoice_id(raw).unwrap_or_default();
        let skipped = |reason: &str| {
            ItemReport::new(
                ItemKind::Skipped,
                Some(invoice_id.clone()),
                None,
                Some(reason.to_string()),
            )
        };

        let mapped = map_status(raw, today);
        if paid_only && mapped != ContributionStatus::Paid {
            return Err(skipped("does not map to paid"));
        }

        let due_date_str = match status::extract_due_date(raw) {
            Some(s) => s,
            None => return Err(skipped("no due date")),
        };
        let due_date = match NaiveDate::parse_from_str(&due_date_str, "%Y-%m-%d") {
            Ok(d) => d,
            Err(_) => return Err(skipped("unparseable due date")),
        };
        let competence = match resolve_competence(&due_date_str) {
            Some(c) => c,
            None => return Err(skipped("no competence")),
        };
        let value_cents = match extract_total_value_cents(raw) {
            Some(v) => v,
            None => return Err(skipped("no invoice value")),
        };
        let payer_tax_id = match extract_payer_tax_id(raw) {
            Some(id) => id,
            None => return Err(skipped("no payer document")),
        };
        let payer_name = extract_payer_name(raw).unwrap_or_else(|| payer_tax_id.clone());

        let employer = match self
            .store
            .find_or_create_employer(clinic_id, &payer_name, &payer_tax_id)
            .await
        {
            Ok(e) => e,
            Err(e) => {
                return Err(ItemReport::new(
                    ItemKind::Error,
                    Some(invoice_id),
                    None,
                    Some(e.to_string()),
                ))
            }
        };

        let description = extract_description(raw).unwrap_or_default();
        let contribution_type_id = match competence::classify_code(&description, known_codes)
            .and_then(|code| type_by_code.get(&code).copied())
        {
            Some(id) => id,
            None => match self.default_type(clinic_id, type_by_code).await {
                Ok(id) => id,
                Err(e) => {
                    return Err(ItemReport::new(
                        ItemKind::Error,
                        Some(invoice_id),
                        None,
                        Some(e.to_string()),
                    ))
                }
            },
        };

        let fields = extract_paid_fields(raw, mapped);
        Ok(NewContribution {
            clinic_id,
            employer_id: employer.employer_id,
            contribution_type_id,
            competence_month: competence.month as i32,
            competence_year: competence.year,
            due_date,
            value_cents,
            status: mapped,
            lytex_invoice_id: invoice_id,
            lytex_transaction_id: extract_transaction_id(raw),
            paid_at: fields.paid_at,
            paid_value_cents: fields.paid_value_cents,
            payment_method: fields.payment_method,
            fee_cents: fields.fee_cents,
            net_value_cents: fields.net_value_cents,
            integration_source: fetched.source,
        })
    }

    async fn default_type(
        &self,
        clinic_id: Uuid,
        type_by_code: &mut HashMap<String, Uuid>,
    ) -> Result<Uuid, AppError> {
        if let Some(id) = type_by_code.get(competence::DEFAULT_TYPE_CODE) {
            return Ok(*id);
        }
        let created: ContributionType = self.store.find_or_create_default_type(clinic_id).await?;
        type_by_code.insert(created.code.clone(), created.contribution_type_id);
        Ok(created.contribution_type_id)
    }

    async fn fix_types_inner(&self, run: &SyncRunLog, clinic_id: Uuid) -> Result<(), AppError> {
        self.gateway.authenticate_primary().await?;
        let contributions = self.store.list_default_type_contributions(clinic_id).await?;
        run.set_total(contributions.len() as u32).await;

        let types = self.store.list_contribution_types(clinic_id).await?;
        let known_codes: HashSet<String> = types.iter().map(|t| t.code.clone()).collect();
        let type_by_code: HashMap<String, Uuid> = types
            .iter()
            .map(|t| (t.code.clone(), t.contribution_type_id))
            .collect();

        let mut counters = RunCounters::default();

        for chunk in contributions.chunks(self.config.chunk_size) {
            let reports = join_all(chunk.iter().map(|contribution| {
                self.fix_one_type(contribution, &known_codes, &type_by_code)
            }))
            .await;

            for report in reports {
                apply_counters(&mut counters, report.kind);
                record_sync_item(SyncType::FixContributionTypes.as_str(), report.kind.as_str());
                run.record_item(counters, Some(report.item), report.detail)
                    .await;
            }
        }

        info!(
            clinic_id = %clinic_id,
            processed = counters.processed,
            reclassified = counters.conciliated,
            "Type fix finished"
        );
        Ok(())
    }

    async fn fix_one_type(
        &self,
        contribution: &Contribution,
        known_codes: &HashSet<String>,
        type_by_code: &HashMap<String, Uuid>,
    ) -> ItemReport {
        let invoice_id = match contribution.lytex_invoice_id.clone() {
            Some(id) => id,
            None => {
                return ItemReport::new(
                    ItemKind::Unresolved,
                    None,
                    Some(contribution.contribution_id),
                    Some("contribution has no invoice id".to_string()),
                )
            }
        };

        let fetched = match self.gateway.find_invoice(&invoice_id).await {
            Ok(Some(fetched)) => fetched,
            Ok(None) => {
                return ItemReport::new(
                    ItemKind::Unresolved,
                    Some(invoice_id),
                    Some(contribution.contribution_id),
                    Some("invoice not found on any integration source".to_string()),
                )
            }
            Err(e) => {
                return ItemReport::new(
                    ItemKind::Error,
                    Some(invoice_id),
                    Some(contribution.contribution_id),
                    Some(e.to_string()),
                )
            }
        };

        let description = match extract_description(&fetched.raw) {
            Some(d) => d,
            None => {
                return ItemReport::new(
                    ItemKind::Skipped,
                    Some(invoice_id),
                    Some(contribution.contribution_id),
                    Some("invoice has no description".to_string()),
                )
            }
        };

        let code = competence::classify_code(&description, known_codes);
        let target = code
            .as_deref()
            .filter(|c| *c != competence::DEFAULT_TYPE_CODE)
            .and_then(|c| type_by_code.get(c).copied());

        match target {
            Some(type_id) if type_id != contribution.contribution_type_id => {
                match self
                    .store
                    .update_contribution_type(contribution.contribution_id, type_id)
                    .await
                {
                    Ok(()) => ItemReport::new(
                        ItemKind::Conciliated,
                        Some(invoice_id),
                        Some(contribution.contribution_id),
                        code.map(|c| format!("reclassified to code {}", c)),
                    ),
                    Err(e) => ItemReport::new(
                        ItemKind::Error,
                        Some(invoice_id),
                        Some(contribution.contribution_id),
                        Some(e.to_string()),
                    ),
                }
            }
            _ => ItemReport::new(
                ItemKind::Skipped,
                Some(invoice_id),
                Some(contribution.contribution_id),
                Some("description does not classify beyond default".to_string()),
            ),
        }
    }
}
