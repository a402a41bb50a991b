use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use chrono::{Duration, NaiveDate};
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{AccountType, NormalizedRow};

pub const KNOWN_CURRENCIES: &[&str] = &["EUR", "USD", "GBP", "CHF", "JPY", "CAD", "AUD"];
const EXTREME_AMOUNT: i64 = 10_000_000_000;
const FUTURE_TOLERANCE_DAYS: i64 = 30;
const MIN_DISTINCT_ACCOUNTS: usize = 5;
const MAX_REPORTED_FAILURES: usize = 10;

// Wider than the shapes the assembler recovers: any stored code of 2-20 word characters passes.
static VALID_ACCOUNT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9A-Za-z_-]{2,20}$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    InvalidAccountNumber,
    MissingAmount,
    ExtremeAmount,
    UnknownCurrency,
    DuplicateCombination,
    MissingDescriptions,
    InvalidPeriodRange,
    FutureAsOfDate,
    MixedCurrencies,
    FewAccounts,
    MissingAccountClass,
    AllAmountsZero,
    PossiblyBalanced,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_number: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl ValidationIssue {
    fn new(kind: IssueKind, message: String) -> Self {
        Self {
            kind,
            message,
            row_number: None,
            account: None,
            count: None,
        }
    }

    fn at(mut self, row: &NormalizedRow) -> Self {
        self.row_number = Some(row.row_number);
        self.account = Some(row.account_number.clone());
        self
    }

    fn counted(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub total_rows: usize,
    pub unique_accounts: usize,
    pub accounts_with_descriptions: usize,
    pub total_amount: Decimal,
    pub min_amount: Option<Decimal>,
    pub max_amount: Option<Decimal>,
    pub currencies: BTreeMap<String, usize>,
    pub entity_count: usize,
}

/// Errors block a clean result; warnings only lower the score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub score: u32,
    pub summary: SummaryStats,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn warnings_of(&self, kind: IssueKind) -> impl Iterator<Item = &ValidationIssue> {
        self.warnings.iter().filter(move |w| w.kind == kind)
    }
}

/// `100 - min(10*errors, 50) - min(2*warnings, 30)`, never below zero.
pub fn score(error_count: usize, warning_count: usize) -> u32 {
    let error_penalty = (10 * error_count).min(50);
    let warning_penalty = (2 * warning_count).min(30);
    100usize.saturating_sub(error_penalty + warning_penalty) as u32
}

pub struct QualityValidator {
    today: NaiveDate,
}

impl QualityValidator {
    pub fn new(today: NaiveDate) -> Self {
        Self { today }
    }

    pub fn validate(&self, rows: &[NormalizedRow]) -> ValidationReport {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        self.field_checks(rows, &mut errors, &mut warnings);
        self.business_checks(rows, &mut warnings);
        self.consistency_checks(rows, &mut errors, &mut warnings);
        self.trial_balance_checks(rows, &mut warnings);

        ValidationReport {
            score: score(errors.len(), warnings.len()),
            errors,
            warnings,
            summary: summarize(rows),
        }
    }

    fn field_checks(&self, rows: &[NormalizedRow], errors: &mut Vec<ValidationIssue>, warnings: &mut Vec<ValidationIssue>) {
        let extreme = Decimal::from(EXTREME_AMOUNT);
        for row in rows {
            if !VALID_ACCOUNT.is_match(&row.account_number) {
                errors.push(
                    ValidationIssue::new(
                        IssueKind::InvalidAccountNumber,
                        format!("account number {:?} has an invalid format", row.account_number),
                    )
                    .at(row),
                );
            }
            match row.amount {
                None => warnings.push(
                    ValidationIssue::new(
                        IssueKind::MissingAmount,
                        format!("account {} has no amount", row.account_number),
                    )
                    .at(row),
                ),
                Some(amount) if amount.abs() > extreme => warnings.push(
                    ValidationIssue::new(
                        IssueKind::ExtremeAmount,
                        format!("account {} has an unusually large amount {amount}", row.account_number),
                    )
                    .at(row),
                ),
                Some(_) => {}
            }
            if !KNOWN_CURRENCIES.contains(&row.currency_code.as_str()) {
                warnings.push(
                    ValidationIssue::new(
                        IssueKind::UnknownCurrency,
                        format!("unknown currency code {}", row.currency_code),
                    )
                    .at(row),
                );
            }
        }
    }

    fn business_checks(&self, rows: &[NormalizedRow], warnings: &mut Vec<ValidationIssue>) {
        let mut combos: BTreeMap<(Uuid, &str, u32), usize> = BTreeMap::new();
        for row in rows {
            *combos
                .entry((row.entity_id, row.account_number.as_str(), row.period_key))
                .or_default() += 1;
        }
        for ((_, account, period), count) in combos.into_iter().filter(|(_, c)| *c > 1) {
            let mut issue = ValidationIssue::new(
                IssueKind::DuplicateCombination,
                format!("account {account} appears {count} times in period {period}"),
            )
            .counted(count);
            issue.account = Some(account.to_string());
            warnings.push(issue);
        }

        let missing = rows.iter().filter(|r| r.description.is_none()).count();
        if missing > 0 {
            warnings.push(
                ValidationIssue::new(
                    IssueKind::MissingDescriptions,
                    format!("{missing} rows have no account description"),
                )
                .counted(missing),
            );
        }
    }

    fn consistency_checks(&self, rows: &[NormalizedRow], errors: &mut Vec<ValidationIssue>, warnings: &mut Vec<ValidationIssue>) {
        let horizon = self.today + Duration::days(FUTURE_TOLERANCE_DAYS);
        for row in rows {
            if row.period_start > row.period_end {
                errors.push(
                    ValidationIssue::new(
                        IssueKind::InvalidPeriodRange,
                        format!("period start {} is after period end {}", row.period_start, row.period_end),
                    )
                    .at(row),
                );
            }
            if row.as_of_date > horizon {
                warnings.push(
                    ValidationIssue::new(
                        IssueKind::FutureAsOfDate,
                        format!("as-of date {} is more than {FUTURE_TOLERANCE_DAYS} days ahead", row.as_of_date),
                    )
                    .at(row),
                );
            }
        }

        let mut currencies: BTreeMap<Uuid, BTreeSet<&str>> = BTreeMap::new();
        for row in rows {
            currencies.entry(row.entity_id).or_default().insert(&row.currency_code);
        }
        for (entity, codes) in currencies.into_iter().filter(|(_, c)| c.len() > 1) {
            let codes: Vec<&str> = codes.into_iter().collect();
            warnings.push(
                ValidationIssue::new(
                    IssueKind::MixedCurrencies,
                    format!("entity {entity} mixes currencies {}", codes.join(", ")),
                )
                .counted(codes.len()),
            );
        }
    }

    fn trial_balance_checks(&self, rows: &[NormalizedRow], warnings: &mut Vec<ValidationIssue>) {
        let accounts: BTreeSet<&str> = rows.iter().map(|r| r.account_number.as_str()).collect();
        if accounts.len() < MIN_DISTINCT_ACCOUNTS {
            warnings.push(
                ValidationIssue::new(
                    IssueKind::FewAccounts,
                    format!("only {} distinct accounts", accounts.len()),
                )
                .counted(accounts.len()),
            );
        }

        let has_pl = rows.iter().any(|r| r.account_type == AccountType::ProfitAndLoss);
        let has_bs = rows.iter().any(|r| r.account_type == AccountType::BalanceSheet);
        if !rows.is_empty() && !(has_pl && has_bs) {
            let missing = match (has_pl, has_bs) {
                (false, false) => "P&L and balance-sheet",
                (false, true) => "P&L",
                _ => "balance-sheet",
            };
            warnings.push(ValidationIssue::new(
                IssueKind::MissingAccountClass,
                format!("no {missing} accounts found"),
            ));
        }

        let amounts: Vec<Decimal> = rows.iter().filter_map(|r| r.amount).collect();
        if !amounts.is_empty() && amounts.iter().all(|a| a.is_zero()) {
            warnings.push(ValidationIssue::new(
                IssueKind::AllAmountsZero,
                "all amounts are zero".to_string(),
            ));
        }

        let non_zero: Vec<Decimal> = amounts.into_iter().filter(|a| !a.is_zero()).collect();
        if !non_zero.is_empty() {
            let total: Decimal = non_zero.iter().sum();
            let mean_abs = non_zero.iter().map(|a| a.abs()).sum::<Decimal>() / Decimal::from(non_zero.len());
            if total.abs() < mean_abs * Decimal::new(1, 1) {
                warnings.push(ValidationIssue::new(
                    IssueKind::PossiblyBalanced,
                    format!("amounts total {total}, the trial balance may be balanced"),
                ));
            }
        }
    }
}

pub fn summarize(rows: &[NormalizedRow]) -> SummaryStats {
    let accounts: BTreeSet<&str> = rows.iter().map(|r| r.account_number.as_str()).collect();
    let described: BTreeSet<&str> = rows
        .iter()
        .filter(|r| r.description.is_some())
        .map(|r| r.account_number.as_str())
        .collect();
    let amounts: Vec<Decimal> = rows.iter().filter_map(|r| r.amount).collect();
    let mut currencies = BTreeMap::new();
    for row in rows {
        *currencies.entry(row.currency_code.clone()).or_insert(0) += 1;
    }
    let entities: BTreeSet<Uuid> = rows.iter().map(|r| r.entity_id).collect();

    SummaryStats {
        total_rows: rows.len(),
        unique_accounts: accounts.len(),
        accounts_with_descriptions: described.len(),
        total_amount: amounts.iter().sum(),
        min_amount: amounts.iter().min().copied(),
        max_amount: amounts.iter().max().copied(),
        currencies,
        entity_count: entities.len(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowFailure {
    pub sheet: String,
    pub row_number: usize,
    pub reason: String,
}

/// Run-level quality figures reported next to the validation report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    /// Successful rows as a percentage of data rows.
    pub completeness_pct: f64,
    /// `100 - 10*errors`, floored at zero.
    pub accuracy_score: u32,
    pub summary: SummaryStats,
    /// First failures only.
    pub row_failures: Vec<RowFailure>,
}

pub fn quality_report(
    report: &ValidationReport,
    data_rows: usize,
    success_rows: usize,
    failures: &[RowFailure],
) -> QualityReport {
    let completeness_pct = if data_rows == 0 {
        0.0
    } else {
        (success_rows as f64 / data_rows as f64 * 10_000.0).round() / 100.0
    };
    QualityReport {
        completeness_pct,
        accuracy_score: 100u32.saturating_sub(10 * report.errors.len() as u32),
        summary: report.summary.clone(),
        row_failures: failures.iter().take(MAX_REPORTED_FAILURES).cloned().collect(),
    }
}
