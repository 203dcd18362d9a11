//! Database service for conciliacao-service.

use crate::models::{
    Contribution, ContributionStatus, ContributionType, Employer, NewConciliationLog,
    NewContribution, SyncLog, SyncRunStatus, SyncType,
};
use crate::services::competence::{DEFAULT_TYPE_CODE, DEFAULT_TYPE_DESCRIPTION};
use crate::services::metrics::DB_QUERY_DURATION;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

/// Financial field set written when a contribution is conciliated as
/// paid.
#[derive(Debug, Clone)]
pub struct PaidUpdate {
    pub paid_at: Option<DateTime<Utc>>,
    pub paid_value_cents: Option<i64>,
    pub payment_method: Option<String>,
    pub fee_cents: Option<i64>,
    pub net_value_cents: Option<i64>,
    pub lytex_transaction_id: Option<String>,
    pub integration_source: String,
}

/// Storage seam for the reconciliation engine. The uniqueness
/// constraint on (clinic, employer, type, competence) is the actual
/// arbiter of correctness under concurrent or repeated runs;
/// everything here leans on it.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn list_contributions_with_invoice(
        &self,
        clinic_id: Uuid,
    ) -> Result<Vec<Contribution>, AppError>;

    async fn mark_contribution_paid(
        &self,
        contribution_id: Uuid,
        update: &PaidUpdate,
    ) -> Result<(), AppError>;

    async fn update_contribution_status(
        &self,
        contribution_id: Uuid,
        status: ContributionStatus,
    ) -> Result<(), AppError>;

    /// Set-based upsert keyed on the uniqueness constraint. A second
    /// run against the same data is a no-op beyond refreshing
    /// already-correct fields; a paid row is never demoted.
    async fn upsert_contributions(&self, rows: &[NewContribution]) -> Result<u32, AppError>;

    async fn list_default_type_contributions(
        &self,
        clinic_id: Uuid,
    ) -> Result<Vec<Contribution>, AppError>;

    async fn update_contribution_type(
        &self,
        contribution_id: Uuid,
        contribution_type_id: Uuid,
    ) -> Result<(), AppError>;

    async fn find_or_create_employer(
        &self,
        clinic_id: Uuid,
        name: &str,
        cnpj: &str,
    ) -> Result<Employer, AppError>;

    async fn list_contribution_types(
        &self,
        clinic_id: Uuid,
    ) -> Result<Vec<ContributionType>, AppError>;

    async fn find_or_create_default_type(
        &self,
        clinic_id: Uuid,
    ) -> Result<ContributionType, AppError>;

    async fn create_sync_log(&self, clinic_id: Uuid, sync_type: SyncType)
        -> Result<Uuid, AppError>;

    async fn update_sync_progress(
        &self,
        sync_log_id: Uuid,
        processed: i32,
        total: i32,
    ) -> Result<(), AppError>;

    async fn finish_sync_log(
        &self,
        sync_log_id: Uuid,
        status: SyncRunStatus,
        detail: serde_json::Value,
        error_message: Option<&str>,
    ) -> Result<(), AppError>;

    async fn append_conciliation_log(&self, entry: &NewConciliationLog) -> Result<(), AppError>;

    async fn get_sync_log(&self, sync_log_id: Uuid) -> Result<Option<SyncLog>, AppError>;
}

const CONTRIBUTION_COLUMNS: &str = "contribution_id, clinic_id, employer_id, contribution_type_id, competence_month, competence_year, due_date, value_cents, status, lytex_invoice_id, lytex_transaction_id, paid_at, paid_value_cents, payment_method, fee_cents, net_value_cents, is_reconciled, reconciled_at, origin, integration_source, created_utc, updated_utc";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "conciliacao-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for Database {
    #[instrument(skip(self), fields(clinic_id = %clinic_id))]
    async fn list_contributions_with_invoice(
        &self,
        clinic_id: Uuid,
    ) -> Result<Vec<Contribution>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_contributions_with_invoice"])
            .start_timer();

        let contributions = sqlx::query_as::<_, Contribution>(&format!(
            r#"
            SELECT {CONTRIBUTION_COLUMNS}
            FROM contributions
            WHERE clinic_id = $1 AND lytex_invoice_id IS NOT NULL
            ORDER BY due_date, contribution_id
            "#,
        ))
        .bind(clinic_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list contributions: {}", e))
        })?;

        timer.observe_duration();
        Ok(contributions)
    }

    #[instrument(skip(self, update), fields(contribution_id = %contribution_id))]
    async fn mark_contribution_paid(
        &self,
        contribution_id: Uuid,
        update: &PaidUpdate,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_contribution_paid"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE contributions
            SET status = $2,
                paid_at = $3,
                paid_value_cents = $4,
                payment_method = $5,
                fee_cents = $6,
                net_value_cents = $7,
                lytex_transaction_id = COALESCE($8, lytex_transaction_id),
                integration_source = $9,
                is_reconciled = TRUE,
                reconciled_at = NOW(),
                updated_utc = NOW()
            WHERE contribution_id = $1
            "#,
        )
        .bind(contribution_id)
        .bind(ContributionStatus::Paid.as_str())
        .bind(update.paid_at)
        .bind(update.paid_value_cents)
        .bind(&update.payment_method)
        .bind(update.fee_cents)
        .bind(update.net_value_cents)
        .bind(&update.lytex_transaction_id)
        .bind(&update.integration_source)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to mark contribution paid: {}", e))
        })?;

        timer.observe_duration();
        info!(contribution_id = %contribution_id, "Contribution conciliated as paid");
        Ok(())
    }

    #[instrument(skip(self), fields(contribution_id = %contribution_id))]
    async fn update_contribution_status(
        &self,
        contribution_id: Uuid,
        status: ContributionStatus,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_contribution_status"])
            .start_timer();

        // Paid is terminal for this statement; it is only reachable
        // through mark_contribution_paid with the full field set.
        sqlx::query(
            r#"
            UPDATE contributions
            SET status = $2, updated_utc = NOW()
            WHERE contribution_id = $1 AND status <> 'paid'
            "#,
        )
        .bind(contribution_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update status: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, rows), fields(count = rows.len()))]
    async fn upsert_contributions(&self, rows: &[NewContribution]) -> Result<u32, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["upsert_contributions"])
            .start_timer();

        let mut affected = 0u32;
        for row in rows {
            let result = sqlx::query(
                r#"
                INSERT INTO contributions (
                    contribution_id, clinic_id, employer_id, contribution_type_id,
                    competence_month, competence_year, due_date, value_cents, status,
                    lytex_invoice_id, lytex_transaction_id, paid_at, paid_value_cents,
                    payment_method, fee_cents, net_value_cents, is_reconciled,
                    reconciled_at, origin, integration_source
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                        $15, $16, $17, $18, $19, $20)
                ON CONFLICT (clinic_id, employer_id, contribution_type_id, competence_month, competence_year)
                DO UPDATE SET
                    status = EXCLUDED.status,
                    due_date = EXCLUDED.due_date,
                    value_cents = EXCLUDED.value_cents,
                    lytex_invoice_id = EXCLUDED.lytex_invoice_id,
                    lytex_transaction_id = EXCLUDED.lytex_transaction_id,
                    paid_at = EXCLUDED.paid_at,
                    paid_value_cents = EXCLUDED.paid_value_cents,
                    payment_method = EXCLUDED.payment_method,
                    fee_cents = EXCLUDED.fee_cents,
                    net_value_cents = EXCLUDED.net_value_cents,
                    is_reconciled = EXCLUDED.is_reconciled,
                    reconciled_at = EXCLUDED.reconciled_at,
                    integration_source = EXCLUDED.integration_source,
                    updated_utc = NOW()
                WHERE contributions.status <> 'paid' OR EXCLUDED.status = 'paid'
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(row.clinic_id)
            .bind(row.employer_id)
            .bind(row.contribution_type_id)
            .bind(row.competence_month)
            .bind(row.competence_year)
            .bind(row.due_date)
            .bind(row.value_cents)
            .bind(row.status.as_str())
            .bind(&row.lytex_invoice_id)
            .bind(&row.lytex_transaction_id)
            .bind(row.paid_at)
            .bind(row.paid_value_cents)
            .bind(&row.payment_method)
            .bind(row.fee_cents)
            .bind(row.net_value_cents)
            .bind(row.status == ContributionStatus::Paid)
            .bind(row.paid_at.map(|_| Utc::now()))
            .bind("lytex-import")
            .bind(row.integration_source.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to upsert contribution: {}", e))
            })?;
            affected += result.rows_affected() as u32;
        }

        timer.observe_duration();
        info!(count = rows.len(), affected = affected, "Contributions upserted");
        Ok(affected)
    }

    #[instrument(skip(self), fields(clinic_id = %clinic_id))]
    async fn list_default_type_contributions(
        &self,
        clinic_id: Uuid,
    ) -> Result<Vec<Contribution>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_default_type_contributions"])
            .start_timer();

        let contributions = sqlx::query_as::<_, Contribution>(&format!(
            r#"
            SELECT {}
            FROM contributions c
            INNER JOIN contribution_types t ON t.contribution_type_id = c.contribution_type_id
            WHERE c.clinic_id = $1 AND t.is_default = TRUE AND c.lytex_invoice_id IS NOT NULL
            "#,
            CONTRIBUTION_COLUMNS
                .split(", ")
                .map(|col| format!("c.{}", col))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(clinic_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!(
                "Failed to list default-type contributions: {}",
                e
            ))
        })?;

        timer.observe_duration();
        Ok(contributions)
    }

    #[instrument(skip(self), fields(contribution_id = %contribution_id))]
    async fn update_contribution_type(
        &self,
        contribution_id: Uuid,
        contribution_type_id: Uuid,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_contribution_type"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE contributions
            SET contribution_type_id = $2, updated_utc = NOW()
            WHERE contribution_id = $1
            "#,
        )
        .bind(contribution_id)
        .bind(contribution_type_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update contribution type: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(clinic_id = %clinic_id, cnpj = %cnpj))]
    async fn find_or_create_employer(
        &self,
        clinic_id: Uuid,
        name: &str,
        cnpj: &str,
    ) -> Result<Employer, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_or_create_employer"])
            .start_timer();

        let employer = sqlx::query_as::<_, Employer>(
            r#"
            INSERT INTO employers (employer_id, clinic_id, name, cnpj)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (clinic_id, cnpj)
            DO UPDATE SET name = EXCLUDED.name, updated_utc = NOW()
            RETURNING employer_id, clinic_id, name, cnpj, created_utc, updated_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(clinic_id)
        .bind(name)
        .bind(cnpj)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to resolve employer: {}", e))
        })?;

        timer.observe_duration();
        Ok(employer)
    }

    #[instrument(skip(self), fields(clinic_id = %clinic_id))]
    async fn list_contribution_types(
        &self,
        clinic_id: Uuid,
    ) -> Result<Vec<ContributionType>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_contribution_types"])
            .start_timer();

        let types = sqlx::query_as::<_, ContributionType>(
            r#"
            SELECT contribution_type_id, clinic_id, code, description, is_default, created_utc
            FROM contribution_types
            WHERE clinic_id = $1
            ORDER BY code
            "#,
        )
        .bind(clinic_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to list contribution types: {}", e))
        })?;

        timer.observe_duration();
        Ok(types)
    }

    #[instrument(skip(self), fields(clinic_id = %clinic_id))]
    async fn find_or_create_default_type(
        &self,
        clinic_id: Uuid,
    ) -> Result<ContributionType, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_or_create_default_type"])
            .start_timer();

        let contribution_type = sqlx::query_as::<_, ContributionType>(
            r#"
            INSERT INTO contribution_types (contribution_type_id, clinic_id, code, description, is_default)
            VALUES ($1, $2, $3, $4, TRUE)
            ON CONFLICT (clinic_id, code)
            DO UPDATE SET is_default = TRUE
            RETURNING contribution_type_id, clinic_id, code, description, is_default, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(clinic_id)
        .bind(DEFAULT_TYPE_CODE)
        .bind(DEFAULT_TYPE_DESCRIPTION)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to resolve default type: {}", e))
        })?;

        timer.observe_duration();
        Ok(contribution_type)
    }

    #[instrument(skip(self), fields(clinic_id = %clinic_id, sync_type = sync_type.as_str()))]
    async fn create_sync_log(
        &self,
        clinic_id: Uuid,
        sync_type: SyncType,
    ) -> Result<Uuid, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_sync_log"])
            .start_timer();

        let sync_log_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO sync_logs (sync_log_id, clinic_id, sync_type, status, processed, total, detail)
            VALUES ($1, $2, $3, $4, 0, 0, '{}'::jsonb)
            "#,
        )
        .bind(sync_log_id)
        .bind(clinic_id)
        .bind(sync_type.as_str())
        .bind(SyncRunStatus::Running.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to create sync log: {}", e))
        })?;

        timer.observe_duration();
        info!(sync_log_id = %sync_log_id, sync_type = sync_type.as_str(), "Sync run started");
        Ok(sync_log_id)
    }

    #[instrument(skip(self), fields(sync_log_id = %sync_log_id))]
    async fn update_sync_progress(
        &self,
        sync_log_id: Uuid,
        processed: i32,
        total: i32,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_sync_progress"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE sync_logs
            SET processed = $2, total = $3
            WHERE sync_log_id = $1 AND status = 'running'
            "#,
        )
        .bind(sync_log_id)
        .bind(processed)
        .bind(total)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to update sync progress: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self, detail), fields(sync_log_id = %sync_log_id, status = status.as_str()))]
    async fn finish_sync_log(
        &self,
        sync_log_id: Uuid,
        status: SyncRunStatus,
        detail: serde_json::Value,
        error_message: Option<&str>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["finish_sync_log"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE sync_logs
            SET status = $2, detail = $3, error_message = $4, finished_utc = NOW()
            WHERE sync_log_id = $1
            "#,
        )
        .bind(sync_log_id)
        .bind(status.as_str())
        .bind(detail)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to finish sync log: {}", e))
        })?;

        timer.observe_duration();
        info!(sync_log_id = %sync_log_id, status = status.as_str(), "Sync run finalized");
        Ok(())
    }

    #[instrument(skip(self, entry), fields(sync_log_id = %entry.sync_log_id))]
    async fn append_conciliation_log(&self, entry: &NewConciliationLog) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["append_conciliation_log"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO conciliation_logs (
                conciliation_log_id, sync_log_id, contribution_id, lytex_invoice_id,
                previous_status, new_status, paid_at, paid_value_cents, payment_method,
                fee_cents, net_value_cents, integration_source, outcome, reason, raw_invoice
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.sync_log_id)
        .bind(entry.contribution_id)
        .bind(&entry.lytex_invoice_id)
        .bind(&entry.previous_status)
        .bind(&entry.new_status)
        .bind(entry.paid_at)
        .bind(entry.paid_value_cents)
        .bind(&entry.payment_method)
        .bind(entry.fee_cents)
        .bind(entry.net_value_cents)
        .bind(&entry.integration_source)
        .bind(entry.outcome.as_str())
        .bind(&entry.reason)
        .bind(&entry.raw_invoice)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to append conciliation log: {}", e))
        })?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(sync_log_id = %sync_log_id))]
    async fn get_sync_log(&self, sync_log_id: Uuid) -> Result<Option<SyncLog>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_sync_log"])
            .start_timer();

        let log = sqlx::query_as::<_, SyncLog>(
            r#"
            SELECT sync_log_id, clinic_id, sync_type, status, processed, total, detail,
                   error_message, started_utc, finished_utc
            FROM sync_logs
            WHERE sync_log_id = $1
            "#,
        )
        .bind(sync_log_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get sync log: {}", e)))?;

        timer.observe_duration();
        Ok(log)
    }
}
