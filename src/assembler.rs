use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::models::{row_identity, AccountType, ColumnRole, ColumnRoleMapping, NormalizedRow, RowStatus};
use crate::numeric::{
    account_shape, looks_like_amount, normalize_account_number, normalize_currency_code,
    normalize_period, parse_amount, Indicator, Period,
};
use crate::roles::is_description_header;
use crate::tabular::{Grid, GridRow};

pub const DESCRIPTION_MAX_CHARS: usize = 255;
const ACCOUNT_SCAN_CELLS: usize = 3;

// Weights in tenths: account 0.4, description 0.3, amount 0.3.
const WEIGHT_ACCOUNT: u8 = 4;
const WEIGHT_DESCRIPTION: u8 = 3;
const WEIGHT_AMOUNT: u8 = 3;

static NUMERIC_ONLY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9.,-]+$").unwrap());
static SHORT_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9A-Za-z]{1,4}$").unwrap());
static ACCOUNT_CELL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9A-Za-z]{2,15}$").unwrap());

/// Per-file inputs shared by every row of a run.
#[derive(Debug, Clone)]
pub struct AssemblyContext<'a> {
    pub file_id: Uuid,
    pub entity_id: Uuid,
    pub filename: &'a str,
    pub default_period: Period,
    pub default_currency: &'a str,
    /// Advisory descriptions by account number.
    pub inferred_descriptions: &'a BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Assembled {
    Row(Box<NormalizedRow>),
    /// No resolvable account number; not an error.
    Dropped { row_number: usize },
}

/// `sha256("{entity}_{account}_{description}_{filename}")`, first 16 hex chars.
pub fn source_hash(entity_id: Uuid, account: &str, description: Option<&str>, filename: &str) -> String {
    let key = format!("{entity_id}_{account}_{}_{filename}", description.unwrap_or(""));
    let digest = Sha256::digest(key.as_bytes());
    let mut hex = hex::encode(digest);
    hex.truncate(16);
    hex
}

/// Only directly mapped fields count.
pub fn extraction_confidence(account_mapped: bool, description_mapped: bool, amount_mapped: bool) -> f64 {
    let mut score = 0u8;
    if account_mapped {
        score += WEIGHT_ACCOUNT;
    }
    if description_mapped {
        score += WEIGHT_DESCRIPTION;
    }
    if amount_mapped {
        score += WEIGHT_AMOUNT;
    }
    f64::from(score) / 10.0
}

fn cell<'r>(row: &'r GridRow, column: Option<usize>) -> Option<&'r str> {
    column
        .and_then(|c| row.cells.get(c))
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Turns grid rows into normalized records.
pub struct RowAssembler<'a> {
    grid: &'a Grid,
    mapping: &'a ColumnRoleMapping,
    ctx: AssemblyContext<'a>,
}

impl<'a> RowAssembler<'a> {
    pub fn new(grid: &'a Grid, mapping: &'a ColumnRoleMapping, ctx: AssemblyContext<'a>) -> Self {
        Self { grid, mapping, ctx }
    }

    pub fn assemble_all(&self) -> Vec<Assembled> {
        self.grid.rows.iter().map(|r| self.assemble(r)).collect()
    }

    pub fn assemble(&self, row: &GridRow) -> Assembled {
        let Some((account, account_column, account_mapped)) = self.account(row) else {
            debug!(sheet = %self.grid.sheet, row = row.row_number, "no account number, dropping row");
            return Assembled::Dropped {
                row_number: row.row_number,
            };
        };

        let (description, description_mapped) = match self.description(row, account_column) {
            Some((d, mapped)) => (Some(d), mapped),
            None => (
                self.ctx
                    .inferred_descriptions
                    .get(&account)
                    .map(|d| truncate_chars(d, DESCRIPTION_MAX_CHARS)),
                false,
            ),
        };

        let mut failure_reason = None;
        let (amount, amount_mapped) = match self.mapping.column_for(ColumnRole::Amount) {
            Some(column) => match cell(row, Some(column)) {
                Some(raw) => match parse_amount(raw) {
                    Some(value) => (Some(value), true),
                    None => {
                        failure_reason = Some(format!("unparsable amount {raw:?}"));
                        (None, false)
                    }
                },
                None => (None, false),
            },
            None => (self.scan_amount(row, account_column), false),
        };
        let amount = match (amount, self.indicator(row)) {
            (Some(value), Some(indicator)) => Some(indicator.apply(value)),
            (value, _) => value,
        };

        let period = cell(row, self.mapping.column_for(ColumnRole::Period))
            .and_then(normalize_period)
            .unwrap_or(self.ctx.default_period);
        let currency_code = match cell(row, self.mapping.column_for(ColumnRole::Currency)) {
            Some(raw) => normalize_currency_code(raw, self.ctx.default_currency),
            None => self.ctx.default_currency.to_string(),
        };

        let status = if failure_reason.is_some() {
            RowStatus::Failed
        } else {
            RowStatus::Pending
        };

        Assembled::Row(Box::new(NormalizedRow {
            id: row_identity(self.ctx.file_id, &self.grid.sheet, row.row_number),
            file_id: self.ctx.file_id,
            raw_row_id: row.raw_row_id,
            entity_id: self.ctx.entity_id,
            sheet: self.grid.sheet.clone(),
            row_number: row.row_number,
            source_hash: source_hash(
                self.ctx.entity_id,
                &account,
                description.as_deref(),
                self.ctx.filename,
            ),
            account_type: AccountType::classify(&account),
            account_number: account,
            description,
            amount,
            currency_code,
            period_key: period.key(),
            period_start: period.start(),
            period_end: period.end(),
            as_of_date: period.end(),
            extraction_confidence: extraction_confidence(account_mapped, description_mapped, amount_mapped),
            status,
            failure_reason,
        }))
    }

    /// (account, column it came from, came from the mapped column)
    ///
    /// A non-empty mapped cell is always taken; one that does not normalize
    /// is kept verbatim (uppercased) for the validator to reject.
    fn account(&self, row: &GridRow) -> Option<(String, usize, bool)> {
        if let Some(column) = self.mapping.column_for(ColumnRole::AccountNumber) {
            if let Some(raw) = cell(row, Some(column)) {
                let account = normalize_account_number(raw).unwrap_or_else(|| raw.to_uppercase());
                return Some((account, column, true));
            }
        }
        row.cells
            .iter()
            .take(ACCOUNT_SCAN_CELLS)
            .enumerate()
            .find_map(|(i, c)| {
                let c = c.trim();
                if ACCOUNT_CELL.is_match(c) && account_shape(&c.to_uppercase()).is_some() {
                    normalize_account_number(c).map(|a| (a, i, false))
                } else {
                    None
                }
            })
    }

    fn description(&self, row: &GridRow, account_column: usize) -> Option<(String, bool)> {
        if let Some(d) = cell(row, self.mapping.column_for(ColumnRole::Description)) {
            return Some((truncate_chars(d, DESCRIPTION_MAX_CHARS), true));
        }

        let unmapped = |i: &usize| self.mapping.role_of(*i).is_none() && *i != account_column;

        let by_header = (0..row.cells.len())
            .filter(unmapped)
            .filter(|i| self.grid.headers.get(*i).is_some_and(|h| is_description_header(h)))
            .filter_map(|i| cell(row, Some(i)))
            .find(|v| v.chars().count() > 2 && !NUMERIC_ONLY.is_match(v));
        if let Some(d) = by_header {
            return Some((truncate_chars(d, DESCRIPTION_MAX_CHARS), false));
        }

        (0..row.cells.len())
            .filter(unmapped)
            .filter_map(|i| cell(row, Some(i)))
            .find(|v| v.chars().count() > 5 && !NUMERIC_ONLY.is_match(v) && !SHORT_CODE.is_match(v))
            .map(|d| (truncate_chars(d, DESCRIPTION_MAX_CHARS), false))
    }

    fn scan_amount(&self, row: &GridRow, account_column: usize) -> Option<rust_decimal::Decimal> {
        row.cells
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != account_column && self.mapping.role_of(*i).is_none())
            .map(|(_, c)| c.trim())
            .find(|c| looks_like_amount(c))
            .and_then(parse_amount)
    }

    fn indicator(&self, row: &GridRow) -> Option<Indicator> {
        cell(row, self.mapping.column_for(ColumnRole::DebitCredit)).and_then(Indicator::parse)
    }
}

/// Accounts whose rows still lack a description, in first-seen order.
pub fn accounts_missing_descriptions(assembled: &[Assembled]) -> Vec<String> {
    let mut seen = Vec::new();
    for a in assembled {
        if let Assembled::Row(row) = a {
            if row.description.is_none() && !seen.contains(&row.account_number) {
                seen.push(row.account_number.clone());
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MappingSource;
    use crate::roles::pattern_mapping;
    use rust_decimal_macros::dec;

    fn grid(headers: &[&str], rows: &[&[&str]]) -> Grid {
        let headers: Vec<String> = headers.iter().map(|s| s.to_string()).collect();
        Grid {
            sheet: "Sheet1".to_string(),
            labels: crate::tabular::normalize_labels(&headers),
            headers,
            rows: rows
                .iter()
                .enumerate()
                .map(|(i, cells)| GridRow {
                    raw_row_id: Uuid::new_v4(),
                    row_number: i + 2,
                    cells: cells.iter().map(|s| s.to_string()).collect(),
                })
                .collect(),
        }
    }

    fn ctx<'a>(inferred: &'a BTreeMap<String, String>) -> AssemblyContext<'a> {
        AssemblyContext {
            file_id: Uuid::nil(),
            entity_id: Uuid::nil(),
            filename: "tb.csv",
            default_period: Period::new(2023, 12).unwrap(),
            default_currency: "EUR",
            inferred_descriptions: inferred,
        }
    }

    fn rows(grid: &Grid, mapping: &ColumnRoleMapping, inferred: &BTreeMap<String, String>) -> Vec<NormalizedRow> {
        RowAssembler::new(grid, mapping, ctx(inferred))
            .assemble_all()
            .into_iter()
            .filter_map(|a| match a {
                Assembled::Row(r) => Some(*r),
                Assembled::Dropped { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_fully_mapped_rows() {
        let g = grid(&["Konto", "Bezeichnung", "Saldo"], &[&["1000", "Kasse", "1.234,56"], &["1600", "Bank", "(500,00)"]]);
        let m = pattern_mapping(&g.headers);
        let out = rows(&g, &m, &BTreeMap::new());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].account_number, "1000");
        assert_eq!(out[0].description.as_deref(), Some("Kasse"));
        assert_eq!(out[0].amount, Some(dec!(1234.56)));
        assert_eq!(out[1].amount, Some(dec!(-500.00)));
        assert_eq!(out[0].currency_code, "EUR");
        assert_eq!(out[0].extraction_confidence, 1.0);
        assert_eq!(out[0].account_type, AccountType::BalanceSheet);
        assert_eq!(out[0].period_key, 202312);
        assert_eq!(out[0].status, RowStatus::Pending);
    }

    #[test]
    fn test_rows_without_account_are_dropped() {
        let g = grid(&["Konto", "Bezeichnung", "Saldo"], &[&["", "Summe Aktiva", ""], &["1000", "Kasse", "1,00"]]);
        let m = pattern_mapping(&g.headers);
        let assembled = RowAssembler::new(&g, &m, ctx(&BTreeMap::new())).assemble_all();
        assert!(matches!(assembled[0], Assembled::Dropped { row_number: 2 }));
        assert!(matches!(assembled[1], Assembled::Row(_)));
    }

    #[test]
    fn test_invalid_mapped_account_is_kept() {
        let g = grid(&["Konto", "Bezeichnung", "Saldo"], &[&["x", "Ungueltig", "5,00"]]);
        let m = pattern_mapping(&g.headers);
        let out = rows(&g, &m, &BTreeMap::new());
        assert_eq!(out[0].account_number, "X");
        assert_eq!(out[0].account_type, AccountType::Unclassified);
        assert_eq!(out[0].description.as_deref(), Some("Ungueltig"));
    }

    #[test]
    fn test_fallbacks_do_not_count_toward_confidence() {
        let g = grid(&["Column_1", "Column_2", "Column_3"], &[&["4400", "Erlöse 19% USt", "12.000,00"]]);
        let m = ColumnRoleMapping::empty(MappingSource::Pattern);
        let out = rows(&g, &m, &BTreeMap::new());
        assert_eq!(out[0].account_number, "4400");
        assert_eq!(out[0].description.as_deref(), Some("Erlöse 19% USt"));
        assert_eq!(out[0].amount, Some(dec!(12000.00)));
        assert_eq!(out[0].extraction_confidence, 0.0);
        assert_eq!(out[0].account_type, AccountType::ProfitAndLoss);
    }

    #[test]
    fn test_description_from_unmapped_description_header() {
        let g = grid(&["Konto", "Saldo", "Name"], &[&["1000", "5,00", "Kas"]]);
        let mut m = ColumnRoleMapping::empty(MappingSource::Custom);
        m.assign("Konto", 0, ColumnRole::AccountNumber, 1.0);
        m.assign("Saldo", 1, ColumnRole::Amount, 1.0);
        let out = rows(&g, &m, &BTreeMap::new());
        assert_eq!(out[0].description.as_deref(), Some("Kas"));
        assert!((out[0].extraction_confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_inferred_description_used_last() {
        let g = grid(&["Konto", "Saldo"], &[&["1000", "5,00"]]);
        let m = pattern_mapping(&g.headers);
        let inferred = BTreeMap::from([("1000".to_string(), "Kasse".to_string())]);
        let out = rows(&g, &m, &inferred);
        assert_eq!(out[0].description.as_deref(), Some("Kasse"));
        assert!((out[0].extraction_confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_unparsable_mapped_amount_fails_row() {
        let g = grid(&["Konto", "Bezeichnung", "Saldo"], &[&["1000", "Kasse", "n/a"]]);
        let m = pattern_mapping(&g.headers);
        let out = rows(&g, &m, &BTreeMap::new());
        assert_eq!(out[0].status, RowStatus::Failed);
        assert!(out[0].failure_reason.as_deref().unwrap().contains("n/a"));
        assert_eq!(out[0].amount, None);
    }

    #[test]
    fn test_empty_mapped_amount_is_missing_not_failed() {
        let g = grid(&["Konto", "Bezeichnung", "Saldo"], &[&["1000", "Kasse", ""]]);
        let m = pattern_mapping(&g.headers);
        let out = rows(&g, &m, &BTreeMap::new());
        assert_eq!(out[0].status, RowStatus::Pending);
        assert_eq!(out[0].amount, None);
    }

    #[test]
    fn test_empty_mapped_amount_does_not_scan_other_cells() {
        let g = grid(&["Konto", "Bezeichnung", "Saldo", "Vorjahr"], &[&["1000", "Kasse", "", "50,00"]]);
        let m = pattern_mapping(&g.headers);
        assert_eq!(m.role_of(3), None);
        let out = rows(&g, &m, &BTreeMap::new());
        assert_eq!(out[0].amount, None);
        assert_eq!(out[0].status, RowStatus::Pending);

        // Without an amount column the same cell is picked up by the scan.
        let g = grid(&["Konto", "Bezeichnung", "Vorjahr"], &[&["1000", "Kasse", "50,00"]]);
        let m = pattern_mapping(&g.headers);
        let out = rows(&g, &m, &BTreeMap::new());
        assert_eq!(out[0].amount, Some(dec!(50.00)));
    }

    #[test]
    fn test_credit_indicator_and_period_and_currency() {
        let g = grid(
            &["Konto", "Bezeichnung", "Betrag", "S/H", "Periode", "Währung"],
            &[&["1600", "Bank", "500,00", "H", "11/2023", "€"], &["1000", "Kasse", "100,00", "S", "", "usd"]],
        );
        let m = pattern_mapping(&g.headers);
        let out = rows(&g, &m, &BTreeMap::new());
        assert_eq!(out[0].amount, Some(dec!(-500.00)));
        assert_eq!(out[0].period_key, 202311);
        assert_eq!(out[0].currency_code, "EUR");
        assert_eq!(out[1].amount, Some(dec!(100.00)));
        assert_eq!(out[1].period_key, 202312);
        assert_eq!(out[1].currency_code, "USD");
    }

    #[test]
    fn test_source_hash_is_stable() {
        let a = source_hash(Uuid::nil(), "1000", Some("Kasse"), "tb.csv");
        let b = source_hash(Uuid::nil(), "1000", Some("Kasse"), "tb.csv");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, source_hash(Uuid::nil(), "1000", Some("Bank"), "tb.csv"));
    }

    #[test]
    fn test_description_truncated() {
        let long = "x".repeat(300);
        let g = grid(&["Konto", "Bezeichnung", "Saldo"], &[&["1000", &long, "1"]]);
        let m = pattern_mapping(&g.headers);
        let out = rows(&g, &m, &BTreeMap::new());
        assert_eq!(out[0].description.as_ref().unwrap().chars().count(), DESCRIPTION_MAX_CHARS);
    }

    #[test]
    fn test_accounts_missing_descriptions() {
        let g = grid(&["Konto", "Saldo"], &[&["1000", "1"], &["1000", "2"], &["1600", "3"]]);
        let m = pattern_mapping(&g.headers);
        let assembled = RowAssembler::new(&g, &m, ctx(&BTreeMap::new())).assemble_all();
        assert_eq!(accounts_missing_descriptions(&assembled), vec!["1000", "1600"]);
    }
}
