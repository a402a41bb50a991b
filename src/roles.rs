use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::advisory::Advisor;
use crate::models::{ColumnRole, ColumnRoleMapping, ColumnSuggestion, MappingSource};
use crate::tabular::Grid;

/// Pattern scores at or below this never assign a role.
pub const MIN_PATTERN_SCORE: f64 = 0.3;
const SAMPLE_ROWS: usize = 5;

/// Role vocabularies in resolution order. Earlier roles win ties.
const VOCABULARY: &[(ColumnRole, &[&str])] = &[
    (
        ColumnRole::AccountNumber,
        &["konto", "kontonummer", "sachkonto", "account", "zeile", "line"],
    ),
    (
        ColumnRole::Description,
        &[
            "beschriftung",
            "bezeichnung",
            "beschreibung",
            "kontobezeichnung",
            "zeilen-/kontobezeichnung",
            "line_description",
            "account_description",
            "description",
            "name",
            "text",
        ],
    ),
    (
        ColumnRole::Amount,
        &[
            "betrag",
            "saldo",
            "balance",
            "eb-wert",
            "wert",
            "amount",
            "opening_balance",
            "ending_balance",
            "total",
            "summe",
        ],
    ),
    (
        ColumnRole::DebitCredit,
        &["s", "h", "soll", "haben", "debit", "credit", "s.1", "h.1", "sollsaldo", "habensaldo"],
    ),
    (
        ColumnRole::Period,
        &["period", "periode", "month", "monat", "date", "datum"],
    ),
    (
        ColumnRole::Currency,
        &["währung", "waehrung", "whg", "currency", "cur"],
    ),
];

/// Exact match scores 1.0; a substring scores its share of the header length.
pub fn role_score(header: &str, role: ColumnRole) -> f64 {
    let h = header.trim().to_lowercase();
    if h.is_empty() {
        return 0.0;
    }
    let Some((_, patterns)) = VOCABULARY.iter().find(|(r, _)| *r == role) else {
        return 0.0;
    };
    let header_len = h.chars().count() as f64;
    patterns
        .iter()
        .map(|p| {
            if h == *p {
                1.0
            } else if h.contains(p) {
                p.chars().count() as f64 / header_len
            } else {
                0.0
            }
        })
        .fold(0.0, f64::max)
}

/// Roles for one header, best first, above the minimum score.
fn ranked_roles(header: &str) -> Vec<(ColumnRole, f64)> {
    let mut ranked: Vec<(ColumnRole, f64)> = VOCABULARY
        .iter()
        .map(|(role, _)| (*role, role_score(header, *role)))
        .filter(|(_, score)| *score > MIN_PATTERN_SCORE)
        .collect();
    // stable sort keeps vocabulary order on ties
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
}

/// Deterministic left-to-right assignment. Each header takes its best role
/// that is still free.
pub fn pattern_mapping(headers: &[String]) -> ColumnRoleMapping {
    let mut mapping = ColumnRoleMapping::empty(MappingSource::Pattern);
    fill_from_patterns(&mut mapping, headers);
    mapping
}

fn fill_from_patterns(mapping: &mut ColumnRoleMapping, headers: &[String]) {
    for (column, header) in headers.iter().enumerate() {
        if mapping.role_of(column).is_some() {
            continue;
        }
        for (role, score) in ranked_roles(header) {
            if mapping.assign(header, column, role, score) {
                break;
            }
        }
    }
}

pub fn is_description_header(header: &str) -> bool {
    role_score(header, ColumnRole::Description) > MIN_PATTERN_SCORE
}

fn find_column(headers: &[String], labels: &[String], wanted: &str) -> Option<usize> {
    let wanted = wanted.trim();
    headers
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case(wanted))
        .or_else(|| labels.iter().position(|l| l.eq_ignore_ascii_case(wanted)))
}

/// Builds a mapping from an advisory suggestion. `None` when the
/// suggestion names none of the actual headers.
pub fn mapping_from_suggestion(headers: &[String], suggestion: &ColumnSuggestion) -> Option<ColumnRoleMapping> {
    let mut mapping = ColumnRoleMapping::empty(MappingSource::Advisory);
    for (header, role) in &suggestion.mapping {
        if let Some(column) = find_column(headers, &[], header) {
            mapping.assign(&headers[column], column, *role, suggestion.confidence);
        }
    }
    (!mapping.assignments.is_empty()).then_some(mapping)
}

/// Caller-pinned roles first, then patterns for whatever is left.
pub fn custom_mapping(
    headers: &[String],
    labels: &[String],
    custom: &BTreeMap<ColumnRole, String>,
) -> ColumnRoleMapping {
    let mut mapping = ColumnRoleMapping::empty(MappingSource::Custom);
    for (role, wanted) in custom {
        match find_column(headers, labels, wanted) {
            Some(column) => {
                mapping.assign(&headers[column], column, *role, 1.0);
            }
            None => warn!(role = role.key(), header = %wanted, "custom mapping names an unknown header"),
        }
    }
    fill_from_patterns(&mut mapping, headers);
    mapping
}

/// Outcome of resolving one sheet.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub mapping: ColumnRoleMapping,
    /// A fresh advisory answer, to be persisted for reruns.
    pub new_suggestion: Option<ColumnSuggestion>,
}

pub struct ColumnRoleResolver {
    advisor: Option<Arc<dyn Advisor>>,
    timeout: Duration,
    min_confidence: f64,
}

impl ColumnRoleResolver {
    pub fn new(advisor: Option<Arc<dyn Advisor>>, timeout: Duration, min_confidence: f64) -> Self {
        Self {
            advisor,
            timeout,
            min_confidence,
        }
    }

    pub fn deterministic() -> Self {
        Self::new(None, Duration::from_secs(0), 0.7)
    }

    /// Custom mapping wins outright. Otherwise a stored hint (or a fresh
    /// advisory call when there is none) replaces the pattern mapping only
    /// when its confidence exceeds the threshold.
    pub fn resolve(
        &self,
        grid: &Grid,
        stored_hint: Option<&ColumnSuggestion>,
        custom: Option<&BTreeMap<ColumnRole, String>>,
    ) -> Resolution {
        if let Some(custom) = custom.filter(|c| !c.is_empty()) {
            return Resolution {
                mapping: custom_mapping(&grid.headers, &grid.labels, custom),
                new_suggestion: None,
            };
        }

        let mut new_suggestion = None;
        let suggestion = match stored_hint {
            Some(hint) => Some(hint.clone()),
            None => self.ask_advisor(grid).inspect(|s| new_suggestion = Some(s.clone())),
        };

        if let Some(s) = suggestion.filter(|s| s.confidence > self.min_confidence) {
            if let Some(mapping) = mapping_from_suggestion(&grid.headers, &s) {
                info!(sheet = %grid.sheet, confidence = s.confidence, "using advisory column mapping");
                return Resolution {
                    mapping,
                    new_suggestion,
                };
            }
        }

        let mapping = pattern_mapping(&grid.headers);
        debug!(sheet = %grid.sheet, roles = mapping.assignments.len(), "pattern column mapping");
        Resolution {
            mapping,
            new_suggestion,
        }
    }

    fn ask_advisor(&self, grid: &Grid) -> Option<ColumnSuggestion> {
        let advisor = self.advisor.as_ref()?;
        let sample: Vec<Vec<String>> = grid
            .rows
            .iter()
            .take(SAMPLE_ROWS)
            .map(|r| r.cells.clone())
            .collect();
        match advisor.resolve_columns(&grid.headers, &sample, self.timeout) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(advisor = advisor.name(), error = %e, "column advisory failed, using patterns");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::{AdvisoryError, StaticAdvisor};
    use crate::tabular::GridRow;
    use uuid::Uuid;

    fn headers(h: &[&str]) -> Vec<String> {
        h.iter().map(|s| s.to_string()).collect()
    }

    fn grid(h: &[&str]) -> Grid {
        let headers = headers(h);
        Grid {
            sheet: "Sheet1".to_string(),
            labels: crate::tabular::normalize_labels(&headers),
            headers,
            rows: vec![GridRow {
                raw_row_id: Uuid::new_v4(),
                row_number: 2,
                cells: vec!["1000".into(), "Kasse".into(), "5,00".into()],
            }],
        }
    }

    struct FailingAdvisor;

    impl Advisor for FailingAdvisor {
        fn resolve_columns(
            &self,
            _headers: &[String],
            _sample: &[Vec<String>],
            timeout: Duration,
        ) -> Result<ColumnSuggestion, AdvisoryError> {
            Err(AdvisoryError::Timeout(timeout))
        }

        fn infer_descriptions(
            &self,
            _accounts: &[String],
            timeout: Duration,
        ) -> Result<BTreeMap<String, String>, AdvisoryError> {
            Err(AdvisoryError::Timeout(timeout))
        }
    }

    fn suggestion(pairs: &[(&str, ColumnRole)], confidence: f64) -> ColumnSuggestion {
        ColumnSuggestion {
            mapping: pairs.iter().map(|(h, r)| (h.to_string(), *r)).collect(),
            confidence,
            recommendations: vec![],
        }
    }

    #[test]
    fn test_role_scores() {
        assert_eq!(role_score("Konto", ColumnRole::AccountNumber), 1.0);
        assert_eq!(role_score("Kontobezeichnung", ColumnRole::Description), 1.0);
        assert!(role_score("Kontobezeichnung", ColumnRole::AccountNumber) < 0.35);
        assert_eq!(role_score("", ColumnRole::Amount), 0.0);
        assert_eq!(role_score("Saldo", ColumnRole::Unknown), 0.0);
    }

    #[test]
    fn test_pattern_mapping_german_headers() {
        let m = pattern_mapping(&headers(&["Konto", "Bezeichnung", "Saldo"]));
        assert_eq!(m.column_for(ColumnRole::AccountNumber), Some(0));
        assert_eq!(m.column_for(ColumnRole::Description), Some(1));
        assert_eq!(m.column_for(ColumnRole::Amount), Some(2));
        assert_eq!(m.source, MappingSource::Pattern);
    }

    #[test]
    fn test_first_match_wins_for_a_role() {
        let m = pattern_mapping(&headers(&["Konto", "Sachkonto", "Saldo", "Betrag"]));
        assert_eq!(m.column_for(ColumnRole::AccountNumber), Some(0));
        assert_eq!(m.column_for(ColumnRole::Amount), Some(2));
        assert_eq!(m.role_of(1), None);
        assert_eq!(m.role_of(3), None);
    }

    #[test]
    fn test_indicator_and_period_headers() {
        let m = pattern_mapping(&headers(&["Konto", "Text", "Betrag", "S/H", "Periode", "Währung"]));
        assert_eq!(m.column_for(ColumnRole::Description), Some(1));
        assert_eq!(m.column_for(ColumnRole::Period), Some(4));
        assert_eq!(m.column_for(ColumnRole::Currency), Some(5));
        assert_eq!(m.column_for(ColumnRole::DebitCredit), Some(3));
    }

    #[test]
    fn test_unrecognized_headers_stay_unmapped() {
        let m = pattern_mapping(&headers(&["Column_1", "Column_2"]));
        assert!(m.assignments.is_empty());
    }

    #[test]
    fn test_advisory_accepted_above_threshold() {
        let advisor = StaticAdvisor {
            columns: Some(suggestion(
                &[("A", ColumnRole::AccountNumber), ("B", ColumnRole::Description), ("C", ColumnRole::Amount)],
                0.9,
            )),
            ..Default::default()
        };
        let resolver = ColumnRoleResolver::new(Some(Arc::new(advisor)), Duration::from_secs(1), 0.7);
        let r = resolver.resolve(&grid(&["A", "B", "C"]), None, None);
        assert_eq!(r.mapping.source, MappingSource::Advisory);
        assert_eq!(r.mapping.column_for(ColumnRole::Amount), Some(2));
        assert!(r.new_suggestion.is_some());
    }

    #[test]
    fn test_advisory_rejected_at_or_below_threshold() {
        let advisor = StaticAdvisor {
            columns: Some(suggestion(&[("Konto", ColumnRole::Amount)], 0.7)),
            ..Default::default()
        };
        let resolver = ColumnRoleResolver::new(Some(Arc::new(advisor)), Duration::from_secs(1), 0.7);
        let r = resolver.resolve(&grid(&["Konto", "Bezeichnung", "Saldo"]), None, None);
        assert_eq!(r.mapping.source, MappingSource::Pattern);
        assert_eq!(r.mapping.column_for(ColumnRole::AccountNumber), Some(0));
        // still persisted so reruns do not ask again
        assert!(r.new_suggestion.is_some());
    }

    #[test]
    fn test_advisory_failure_falls_back() {
        let resolver = ColumnRoleResolver::new(Some(Arc::new(FailingAdvisor)), Duration::from_millis(10), 0.7);
        let r = resolver.resolve(&grid(&["Konto", "Bezeichnung", "Saldo"]), None, None);
        assert_eq!(r.mapping.source, MappingSource::Pattern);
        assert_eq!(r.mapping.assignments.len(), 3);
        assert!(r.new_suggestion.is_none());
    }

    #[test]
    fn test_stored_hint_skips_advisor() {
        let resolver = ColumnRoleResolver::new(Some(Arc::new(FailingAdvisor)), Duration::from_millis(10), 0.7);
        let hint = suggestion(&[("X", ColumnRole::AccountNumber), ("Y", ColumnRole::Amount)], 0.95);
        let r = resolver.resolve(&grid(&["X", "Y"]), Some(&hint), None);
        assert_eq!(r.mapping.source, MappingSource::Advisory);
        assert!(r.new_suggestion.is_none());
    }

    #[test]
    fn test_custom_mapping_overrides() {
        let custom = BTreeMap::from([
            (ColumnRole::Amount, "Betrag".to_string()),
            (ColumnRole::Description, "Account_Description".to_string()),
        ]);
        let g = grid(&["Konto", "Bezeichnung", "Saldo", "Betrag"]);
        let r = ColumnRoleResolver::deterministic().resolve(&g, None, Some(&custom));
        assert_eq!(r.mapping.source, MappingSource::Custom);
        assert_eq!(r.mapping.column_for(ColumnRole::Amount), Some(3));
        assert_eq!(r.mapping.column_for(ColumnRole::Description), Some(1));
        assert_eq!(r.mapping.column_for(ColumnRole::AccountNumber), Some(0));
        assert_eq!(r.mapping.role_of(2), None);
    }
}
