//! Contribution ledger models.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Closed status vocabulary for a ledger contribution.
///
/// External provider vocabularies are normalized into this enum by the
/// status mapper; nothing else in the system derives status directly
/// from provider strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContributionStatus {
    Pending,
    #[serde(rename = "confirmed-processing")]
    Processing,
    Overdue,
    Paid,
    Cancelled,
}

impl ContributionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "confirmed-processing",
            Self::Overdue => "overdue",
            Self::Paid => "paid",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "confirmed-processing" => Self::Processing,
            "overdue" => Self::Overdue,
            "paid" => Self::Paid,
            "cancelled" => Self::Cancelled,
            _ => Self::Pending,
        }
    }

    /// Total order used when two invoices collapse onto the same
    /// idempotency key within a run: the higher rank wins, so a stale
    /// cancelled duplicate can never overwrite a paid record.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Paid => 5,
            Self::Overdue => 4,
            Self::Processing => 3,
            Self::Pending => 2,
            Self::Cancelled => 1,
        }
    }
}

/// Which credential pair answered for an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationSource {
    Primary,
    Secondary,
}

impl IntegrationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

/// A ledger entry: one billable obligation per employer, contribution
/// type and competence period.
#[derive(Debug, Clone, FromRow)]
pub struct Contribution {
    pub contribution_id: Uuid,
    pub clinic_id: Uuid,
    pub employer_id: Uuid,
    pub contribution_type_id: Uuid,
    pub competence_month: i32,
    pub competence_year: i32,
    pub due_date: NaiveDate,
    pub value_cents: i64,
    pub status: String,
    pub lytex_invoice_id: Option<String>,
    pub lytex_transaction_id: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub paid_value_cents: Option<i64>,
    pub payment_method: Option<String>,
    pub fee_cents: Option<i64>,
    pub net_value_cents: Option<i64>,
    pub is_reconciled: bool,
    pub reconciled_at: Option<DateTime<Utc>>,
    pub origin: String,
    pub integration_source: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Contribution {
    pub fn status(&self) -> ContributionStatus {
        ContributionStatus::parse(&self.status)
    }

    /// Idempotence short-circuit: durably paid rows need no network
    /// call at all.
    pub fn is_durably_paid(&self) -> bool {
        self.status() == ContributionStatus::Paid && self.paid_at.is_some()
    }
}

/// A contribution row produced by bulk discovery, keyed for the
/// set-based upsert.
#[derive(Debug, Clone)]
pub struct NewContribution {
    pub clinic_id: Uuid,
    pub employer_id: Uuid,
    pub contribution_type_id: Uuid,
    pub competence_month: i32,
    pub competence_year: i32,
    pub due_date: NaiveDate,
    pub value_cents: i64,
    pub status: ContributionStatus,
    pub lytex_invoice_id: String,
    pub lytex_transaction_id: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub paid_value_cents: Option<i64>,
    pub payment_method: Option<String>,
    pub fee_cents: Option<i64>,
    pub net_value_cents: Option<i64>,
    pub integration_source: IntegrationSource,
}

impl NewContribution {
    /// The uniqueness key the storage layer enforces.
    pub fn idempotency_key(&self) -> (Uuid, Uuid, i32, i32) {
        (
            self.employer_id,
            self.contribution_type_id,
            self.competence_month,
            self.competence_year,
        )
    }
}

/// Reference row for the paying employer, resolved or created by bulk
/// import from invoice metadata.
#[derive(Debug, Clone, FromRow)]
pub struct Employer {
    pub employer_id: Uuid,
    pub clinic_id: Uuid,
    pub name: String,
    /// Digits-only CNPJ, unique per clinic.
    pub cnpj: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ContributionType {
    pub contribution_type_id: Uuid,
    pub clinic_id: Uuid,
    /// 3-digit numeric code, unique per clinic.
    pub code: String,
    pub description: String,
    pub is_default: bool,
    pub created_utc: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_as_str() {
        for status in [
            ContributionStatus::Pending,
            ContributionStatus::Processing,
            ContributionStatus::Overdue,
            ContributionStatus::Paid,
            ContributionStatus::Cancelled,
        ] {
            assert_eq!(ContributionStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn unknown_status_defaults_to_pending() {
        assert_eq!(
            ContributionStatus::parse("something-else"),
            ContributionStatus::Pending
        );
    }

    #[test]
    fn rank_orders_paid_above_everything_and_cancelled_below() {
        let mut statuses = [
            ContributionStatus::Cancelled,
            ContributionStatus::Paid,
            ContributionStatus::Pending,
            ContributionStatus::Overdue,
            ContributionStatus::Processing,
        ];
        statuses.sort_by_key(|s| s.rank());
        assert_eq!(statuses[0], ContributionStatus::Cancelled);
        assert_eq!(statuses[4], ContributionStatus::Paid);
        assert_eq!(statuses[3], ContributionStatus::Overdue);
    }
}
