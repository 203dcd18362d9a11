//! Competence-period resolution and contribution-type classification.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// The accounting period a charge is attributed to, distinct from its
/// due date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Competence {
    pub month: u32,
    pub year: i32,
}

/// Derive the competence period from a `YYYY-MM-DD` due date.
///
/// Administrative convention: a charge due in month M bills for month
/// M-1; a January due date rolls back to December of the prior year.
/// Arithmetic runs on the raw string components, never on a parsed
/// timestamp, so timezone shifts can never move the day.
pub fn resolve_competence(due_date: &str) -> Option<Competence> {
    let mut parts = due_date.splitn(3, '-');
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u32 = parts.next()?.parse().ok()?;
    if !(1..=12).contains(&month) {
        return None;
    }
    Some(if month == 1 {
        Competence { month: 12, year: year - 1 }
    } else {
        Competence { month: month - 1, year }
    })
}

/// The generic union-dues code used inconsistently by historical data
/// sources; it must be redirected to a specific sub-code by keyword.
pub const REMAP_CODE: &str = "756";

/// Designated fallback type, created on demand when classification
/// resolves nothing concrete.
pub const DEFAULT_TYPE_CODE: &str = "999";
pub const DEFAULT_TYPE_DESCRIPTION: &str = "CONTRIBUICAO DIVERSA";

static LEADING_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(\d{3})\b").expect("leading-code regex"));

// Keyword rules for the free-text fallback, first match wins.
const KEYWORD_RULES: &[(&str, &[&str])] = &[
    ("125", &["taxa negocial mercado", "mercado"]),
    ("126", &["taxa negocial varejo", "varejo"]),
    ("124", &["mensalidade sindical", "mensalidade"]),
    ("127", &["assistencial"]),
    ("128", &["confederativa"]),
];

fn keyword_code(description_lower: &str) -> Option<&'static str> {
    KEYWORD_RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|kw| description_lower.contains(kw)))
        .map(|(code, _)| *code)
}

fn remap_generic_dues(description_lower: &str) -> &'static str {
    if description_lower.contains("mercado") {
        "125"
    } else if description_lower.contains("varejo") {
        "126"
    } else {
        "124"
    }
}

/// Classify a free-text line-item description into a contribution-type
/// code.
///
/// Cascade, in this exact order because descriptions are inconsistent
/// across historical data sources: leading 3-digit code; the generic
/// dues code re-derived by keyword; the parsed code when it is a known
/// type; keyword search over the whole description; `None` for the
/// designated default type.
pub fn classify_code(description: &str, known_codes: &HashSet<String>) -> Option<String> {
    let lower = description.to_lowercase();

    if let Some(captures) = LEADING_CODE.captures(description) {
        let code = &captures[1];
        if code == REMAP_CODE {
            let remapped = remap_generic_dues(&lower);
            if known_codes.contains(remapped) {
                return Some(remapped.to_string());
            }
        } else if known_codes.contains(code) {
            return Some(code.to_string());
        }
    }

    keyword_code(&lower)
        .filter(|code| known_codes.contains(*code))
        .map(|code| code.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known() -> HashSet<String> {
        ["124", "125", "126", "127"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn competence_is_previous_month() {
        assert_eq!(
            resolve_competence("2026-07-15"),
            Some(Competence { month: 6, year: 2026 })
        );
    }

    #[test]
    fn january_due_date_rolls_back_to_december() {
        assert_eq!(
            resolve_competence("2026-01-12"),
            Some(Competence { month: 12, year: 2025 })
        );
    }

    #[test]
    fn malformed_due_dates_resolve_nothing() {
        assert_eq!(resolve_competence("not-a-date"), None);
        assert_eq!(resolve_competence("2026-13-01"), None);
        assert_eq!(resolve_competence(""), None);
    }

    #[test]
    fn direct_code_classifies_when_known() {
        assert_eq!(
            classify_code("125 - TAXA NEGOCIAL MERCADOS JANEIRO/2026", &known()),
            Some("125".to_string())
        );
    }

    #[test]
    fn generic_dues_code_is_remapped_by_keyword() {
        assert_eq!(
            classify_code("756 - MENSALIDADE SINDICAL FEVEREIRO/2026", &known()),
            Some("124".to_string())
        );
        assert_eq!(
            classify_code("756 - TAXA NEGOCIAL MERCADOS MARCO/2026", &known()),
            Some("125".to_string())
        );
        assert_eq!(
            classify_code("756 - TAXA NEGOCIAL VAREJO MARCO/2026", &known()),
            Some("126".to_string())
        );
    }

    #[test]
    fn unknown_leading_code_falls_back_to_keywords() {
        assert_eq!(
            classify_code("401 - CONTRIBUICAO ASSISTENCIAL ABRIL/2026", &known()),
            Some("127".to_string())
        );
    }

    #[test]
    fn keyword_search_without_any_code() {
        assert_eq!(
            classify_code("MENSALIDADE SINDICAL JUNHO/2026", &known()),
            Some("124".to_string())
        );
    }

    #[test]
    fn unclassifiable_descriptions_resolve_to_none() {
        assert_eq!(classify_code("ACORDO JUDICIAL 2026", &known()), None);
    }
}
