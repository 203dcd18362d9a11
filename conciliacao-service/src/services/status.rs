//! Status normalization and defensive field extraction for raw Lytex
//! invoice payloads.
//!
//! Provider payloads are heterogeneous: field names vary across API
//! versions and across the two credential integrations. Every logical
//! field is therefore read through an ordered candidate-path list,
//! tried in sequence until one yields a non-empty value. The lists are
//! data, not branching, so the precedence is visible and testable.

use crate::models::ContributionStatus;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde_json::Value;

// Candidate paths per logical field, in lookup order. Dotted segments
// descend into objects; numeric segments index arrays.
const DUE_DATE_PATHS: &[&str] = &["dueDate", "due_date", "vencimento", "expirationDate"];
const PAID_AT_PATHS: &[&str] = &[
    "paidAt",
    "paid_at",
    "paymentDate",
    "payment.date",
    "payments.0.date",
    "payments.0.paidAt",
];
const PAID_VALUE_PATHS: &[&str] = &["paidValue", "paid_value", "valuePaid", "amountPaid"];
const TOTAL_VALUE_PATHS: &[&str] = &["totalValue", "total_value", "value", "amount"];
const PAYMENT_METHOD_PATHS: &[&str] = &["paymentMethod", "payment_method", "method", "payments.0.method"];
// Fee precedence: flat fee field, then nested fee object, then the
// legacy "taxas" object. First present value wins.
const FEE_PATHS: &[&str] = &["fee", "fees.total", "taxas.total"];
const TRANSACTION_ID_PATHS: &[&str] = &["transactionId", "transaction_id", "txid"];
const UPDATED_AT_PATHS: &[&str] = &["updatedAt", "updated_at"];

const PAID_KEYWORDS: &[&str] = &[
    "paid", "pago", "paga", "liquidado", "liquidada", "settled", "compensado", "received",
    "recebido",
];
const CANCELLED_KEYWORDS: &[&str] = &[
    "canceled",
    "cancelled",
    "cancelado",
    "cancelada",
    "expired",
    "expirado",
    "refunded",
    "estornado",
];
const PROCESSING_KEYWORDS: &[&str] = &[
    "processing",
    "processando",
    "confirmed",
    "confirmado",
    "scheduled",
    "agendado",
    "em processamento",
    "in process",
];
const OVERDUE_KEYWORDS: &[&str] = &["overdue", "vencido", "vencida", "atrasado", "late"];

/// Resolve a dotted candidate path inside a raw JSON payload.
/// Returns `None` for missing fields, JSON null and empty strings.
pub fn json_lookup<'a>(raw: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = raw;
    for segment in path.split('.') {
        current = match segment.parse::<usize>() {
            Ok(index) => current.get(index)?,
            Err(_) => current.get(segment)?,
        };
    }
    match current {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        other => Some(other),
    }
}

/// First non-empty value across an ordered candidate-path list.
pub fn first_present<'a>(raw: &'a Value, paths: &[&str]) -> Option<&'a Value> {
    paths.iter().find_map(|path| json_lookup(raw, path))
}

fn first_string(raw: &Value, paths: &[&str]) -> Option<String> {
    first_present(raw, paths).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn value_as_cents(v: &Value) -> Option<i64> {
    // Provider values are already minor currency units; never
    // re-multiplied here. Floats only appear through JSON number
    // widening and are rounded back to the integer they encode.
    if let Some(n) = v.as_i64() {
        return Some(n);
    }
    v.as_f64().map(|f| f.round() as i64)
}

fn first_cents(raw: &Value, paths: &[&str]) -> Option<i64> {
    first_present(raw, paths).and_then(value_as_cents)
}

/// Normalize a raw provider status: trim, lowercase, collapse
/// `-`/`_`/`/` separators and repeated whitespace into single spaces.
pub fn normalize_status(raw: &str) -> String {
    let replaced: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if matches!(c, '-' | '_' | '/') { ' ' } else { c })
        .collect();
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Keyword match against a normalized status. Single-word keywords
/// must match a whole token ("unpaid" never matches "paid");
/// multi-word keywords match as a phrase.
fn matches_any(normalized: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| {
        if kw.contains(' ') {
            normalized.contains(kw)
        } else {
            normalized.split(' ').any(|token| token == *kw)
        }
    })
}

/// Only the literal `paid` boolean and the direct `paidAt`/`paid_at`
/// timestamps count as the explicit settlement flag. Nested payment
/// records can carry dates for in-flight payments, so they must not
/// short-circuit the status keywords.
fn has_paid_flag(raw: &Value) -> bool {
    raw.get("paid").and_then(Value::as_bool).unwrap_or(false)
        || first_present(raw, &["paidAt", "paid_at"]).is_some()
}

/// Extract the invoice due date as its raw `YYYY-MM-DD` components.
/// Kept as a string on purpose: parsing into a timestamp invites
/// timezone-induced day shifts.
pub fn extract_due_date(raw: &Value) -> Option<String> {
    first_string(raw, DUE_DATE_PATHS).map(|s| s.chars().take(10).collect())
}

/// Map a raw invoice to the closed internal status vocabulary.
///
/// Precedence is total and must not be reordered:
/// paid flag/keywords, then cancelled, then processing, then
/// textual-overdue or past due date, else pending. A record that is
/// both "scheduled" and past due classifies processing, never overdue.
pub fn map_status(raw: &Value, today: NaiveDate) -> ContributionStatus {
    let normalized = raw
        .get("status")
        .and_then(Value::as_str)
        .map(normalize_status)
        .unwrap_or_default();

    if has_paid_flag(raw) || matches_any(&normalized, PAID_KEYWORDS) {
        return ContributionStatus::Paid;
    }
    if matches_any(&normalized, CANCELLED_KEYWORDS) {
        return ContributionStatus::Cancelled;
    }
    if matches_any(&normalized, PROCESSING_KEYWORDS) {
        return ContributionStatus::Processing;
    }

    let past_due = extract_due_date(raw)
        .map(|due| due.as_str() < today.format("%Y-%m-%d").to_string().as_str())
        .unwrap_or(false);
    if matches_any(&normalized, OVERDUE_KEYWORDS) || past_due {
        return ContributionStatus::Overdue;
    }

    ContributionStatus::Pending
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Dates without a time component settle on midnight UTC.
    NaiveDate::parse_from_str(&s.chars().take(10).collect::<String>(), "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
}

/// Paid timestamp: direct fields, else the first payment sub-record's
/// date, else (only for an already-paid status) the record's
/// last-update timestamp as a controlled fallback.
pub fn extract_paid_at(raw: &Value, status: ContributionStatus) -> Option<DateTime<Utc>> {
    if let Some(ts) = first_present(raw, PAID_AT_PATHS)
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
    {
        return Some(ts);
    }
    if status == ContributionStatus::Paid {
        return first_present(raw, UPDATED_AT_PATHS)
            .and_then(Value::as_str)
            .and_then(parse_timestamp);
    }
    None
}

/// Paid value in minor currency units. The direct field is already in
/// minor units and must not be re-multiplied; a paid invoice without
/// one falls back to the total value, then to the sum of the payments
/// array.
pub fn extract_paid_value_cents(raw: &Value, status: ContributionStatus) -> Option<i64> {
    if let Some(v) = first_cents(raw, PAID_VALUE_PATHS) {
        return Some(v);
    }
    if status == ContributionStatus::Paid {
        if let Some(v) = first_cents(raw, TOTAL_VALUE_PATHS) {
            return Some(v);
        }
    }
    let payments = raw.get("payments").and_then(Value::as_array)?;
    let total: i64 = payments
        .iter()
        .filter_map(|p| p.get("value").and_then(value_as_cents))
        .sum();
    (total > 0).then_some(total)
}

/// Payment method: direct field, else first payment sub-record, else
/// inferred from the presence of pix/boleto sub-objects.
pub fn extract_payment_method(raw: &Value) -> Option<String> {
    if let Some(m) = first_string(raw, PAYMENT_METHOD_PATHS) {
        return Some(m);
    }
    if json_lookup(raw, "pix").is_some() {
        return Some("pix".to_string());
    }
    if json_lookup(raw, "boleto").is_some() {
        return Some("boleto".to_string());
    }
    None
}

pub fn extract_fee_cents(raw: &Value) -> Option<i64> {
    first_cents(raw, FEE_PATHS)
}

/// Face value of the invoice, already in minor units on the wire.
pub fn extract_total_value_cents(raw: &Value) -> Option<i64> {
    first_cents(raw, TOTAL_VALUE_PATHS)
}

pub fn extract_transaction_id(raw: &Value) -> Option<String> {
    first_string(raw, TRANSACTION_ID_PATHS)
}

/// Net value: paid value minus whatever fee representation is present.
pub fn net_value_cents(paid_value_cents: i64, fee_cents: Option<i64>) -> i64 {
    paid_value_cents - fee_cents.unwrap_or(0)
}

/// Full financial field set for a paid invoice, computed in one place
/// so targeted and bulk modes agree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaidFields {
    pub paid_at: Option<DateTime<Utc>>,
    pub paid_value_cents: Option<i64>,
    pub payment_method: Option<String>,
    pub fee_cents: Option<i64>,
    pub net_value_cents: Option<i64>,
}

pub fn extract_paid_fields(raw: &Value, status: ContributionStatus) -> PaidFields {
    let paid_value_cents = extract_paid_value_cents(raw, status);
    let fee_cents = extract_fee_cents(raw);
    PaidFields {
        paid_at: extract_paid_at(raw, status),
        paid_value_cents,
        payment_method: extract_payment_method(raw),
        fee_cents,
        net_value_cents: paid_value_cents.map(|v| net_value_cents(v, fee_cents)),
    }
}
