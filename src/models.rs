use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IngestError, Result};
use crate::numeric::Period;

/// Namespace for deterministic row identities (UUIDv5).
pub const ROW_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6f, 0x1d, 0x2b, 0x8e, 0x4a, 0x53, 0x4c, 0x1e, 0x9b, 0x07, 0x3e, 0x55, 0xa1, 0xc4, 0x72, 0x10,
]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Csv,
    Xlsx,
    Xls,
    Pdf,
}

impl FileKind {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Xlsx => "xlsx",
            Self::Xls => "xls",
            Self::Pdf => "pdf",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "csv" => Some(Self::Csv),
            "xlsx" => Some(Self::Xlsx),
            "xls" => Some(Self::Xls),
            "pdf" => Some(Self::Pdf),
            _ => None,
        }
    }

    /// Smallest plausible payload for this kind, in bytes.
    pub fn min_size(&self) -> usize {
        match self {
            Self::Pdf => 100,
            Self::Xlsx | Self::Xls => 500,
            Self::Csv => 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Uploaded,
    Parsed,
    Error,
    Consumed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Parsed => "parsed",
            Self::Error => "error",
            Self::Consumed => "consumed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "uploaded" => Some(Self::Uploaded),
            "parsed" => Some(Self::Parsed),
            "error" => Some(Self::Error),
            "consumed" => Some(Self::Consumed),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: FileStatus) -> bool {
        use FileStatus::*;
        matches!(
            (self, next),
            (Uploaded, Parsed)
                | (Uploaded, Error)
                | (Parsed, Consumed)
                | (Parsed, Error)
                | (Consumed, Consumed)
                | (Consumed, Error)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStatus {
    Pending,
    Success,
    Failed,
    Skipped,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// Success and Skipped are terminal; Failed only reopens through retry.
    pub fn can_transition_to(&self, next: RowStatus) -> bool {
        use RowStatus::*;
        matches!(
            (self, next),
            (Pending, _) | (Failed, Pending)
        )
    }
}

pub fn check_row_transition(from: RowStatus, to: RowStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(IngestError::InvalidState {
            entity: "normalized row".to_string(),
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        })
    }
}

/// A file as submitted, before interpretation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFile {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub filename: String,
    pub size_bytes: u64,
    pub content_hash: String,
    pub kind: FileKind,
    pub status: FileStatus,
    /// Sheet or table the normalization phase reads; `None` means every sheet.
    pub primary_sheet: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub advisory_hints: AdvisoryHints,
}

/// One captured row, exactly as it appeared in the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub id: Uuid,
    pub file_id: Uuid,
    pub sheet: String,
    /// Position of the sheet within the file, used to keep capture order.
    pub sheet_index: usize,
    /// 1-based, order-preserving within its sheet.
    pub row_number: usize,
    pub cells: Vec<String>,
    pub is_header: bool,
}

impl RawRow {
    pub fn new(
        file_id: Uuid,
        sheet: &str,
        sheet_index: usize,
        row_number: usize,
        cells: Vec<String>,
        is_header: bool,
    ) -> Self {
        Self {
            id: row_identity(file_id, sheet, row_number),
            file_id,
            sheet: sheet.to_string(),
            sheet_index,
            row_number,
            cells,
            is_header,
        }
    }
}

/// Stable identity for a (file, sheet, row) triple.
pub fn row_identity(file_id: Uuid, sheet: &str, row_number: usize) -> Uuid {
    Uuid::new_v5(&ROW_NAMESPACE, format!("{file_id}:{sheet}:{row_number}").as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnRole {
    AccountNumber,
    Description,
    Amount,
    Period,
    DebitCredit,
    Currency,
    Unknown,
}

impl ColumnRole {
    pub fn key(&self) -> &'static str {
        match self {
            Self::AccountNumber => "account_number",
            Self::Description => "description",
            Self::Amount => "amount",
            Self::Period => "period",
            Self::DebitCredit => "debit_credit",
            Self::Currency => "currency",
            Self::Unknown => "unknown",
        }
    }

    /// Accepts the canonical keys plus the aliases advisory services tend to emit.
    pub fn from_key(key: &str) -> Option<Self> {
        match key.trim().to_lowercase().as_str() {
            "account_number" | "account" => Some(Self::AccountNumber),
            "description" | "account_description" => Some(Self::Description),
            "amount" | "amounts" | "balance" => Some(Self::Amount),
            "period" | "periods" => Some(Self::Period),
            "debit_credit" | "debit_credit_indicator" => Some(Self::DebitCredit),
            "currency" | "currency_code" => Some(Self::Currency),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub header: String,
    pub column: usize,
    pub role: ColumnRole,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingSource {
    Pattern,
    Advisory,
    Custom,
}

/// Header-to-role assignment for one sheet. At most one column per role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnRoleMapping {
    pub assignments: Vec<RoleAssignment>,
    pub source: MappingSource,
}

impl ColumnRoleMapping {
    pub fn empty(source: MappingSource) -> Self {
        Self {
            assignments: Vec::new(),
            source,
        }
    }

    pub fn column_for(&self, role: ColumnRole) -> Option<usize> {
        self.assignments
            .iter()
            .find(|a| a.role == role)
            .map(|a| a.column)
    }

    pub fn role_of(&self, column: usize) -> Option<ColumnRole> {
        self.assignments
            .iter()
            .find(|a| a.column == column)
            .map(|a| a.role)
    }

    pub fn has_role(&self, role: ColumnRole) -> bool {
        self.column_for(role).is_some()
    }

    /// Adds an assignment unless the role or the column is already taken.
    pub fn assign(&mut self, header: &str, column: usize, role: ColumnRole, confidence: f64) -> bool {
        if role == ColumnRole::Unknown || self.has_role(role) || self.role_of(column).is_some() {
            return false;
        }
        self.assignments.push(RoleAssignment {
            header: header.to_string(),
            column,
            role,
            confidence: confidence.clamp(0.0, 1.0),
        });
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    BalanceSheet,
    ProfitAndLoss,
    Unclassified,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BalanceSheet => "bs",
            Self::ProfitAndLoss => "pl",
            Self::Unclassified => "unclassified",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "bs" => Self::BalanceSheet,
            "pl" => Self::ProfitAndLoss,
            _ => Self::Unclassified,
        }
    }

    /// Account classes 0-3 are balance-sheet accounts, 4-9 profit and loss.
    pub fn classify(account_number: &str) -> Self {
        match account_number.chars().next().and_then(|c| c.to_digit(10)) {
            Some(0..=3) => Self::BalanceSheet,
            Some(_) => Self::ProfitAndLoss,
            None => Self::Unclassified,
        }
    }
}

/// A canonical trial-balance line produced from one raw row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRow {
    pub id: Uuid,
    pub file_id: Uuid,
    pub raw_row_id: Uuid,
    pub entity_id: Uuid,
    pub sheet: String,
    pub row_number: usize,
    pub account_number: String,
    pub description: Option<String>,
    pub account_type: AccountType,
    pub amount: Option<Decimal>,
    pub currency_code: String,
    /// YYYYMM
    pub period_key: u32,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub as_of_date: NaiveDate,
    pub source_hash: String,
    pub extraction_confidence: f64,
    pub status: RowStatus,
    pub failure_reason: Option<String>,
}

/// Advisory output captured per file so reruns never need the service again.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryHints {
    #[serde(default)]
    pub column_suggestions: BTreeMap<String, ColumnSuggestion>,
    #[serde(default)]
    pub descriptions: BTreeMap<String, String>,
    /// Accounts already sent for description inference.
    #[serde(default)]
    pub inference_attempted: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnSuggestion {
    /// header label -> role
    pub mapping: BTreeMap<String, ColumnRole>,
    pub confidence: f64,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

/// Normalized-row counts per lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.success + self.failed + self.skipped
    }

    pub fn add(&mut self, status: RowStatus, n: usize) {
        match status {
            RowStatus::Pending => self.pending += n,
            RowStatus::Success => self.success += n,
            RowStatus::Failed => self.failed += n,
            RowStatus::Skipped => self.skipped += n,
        }
    }
}

/// Caller choices for one normalization run. Stored with the run so a retry
/// can repeat them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizeOptions {
    /// Persist even when the validation report has errors.
    #[serde(default)]
    pub force: bool,
    /// role -> header label, overriding automatic resolution.
    #[serde(default)]
    pub custom_mapping: BTreeMap<ColumnRole, String>,
    /// Period for sheets without a period column.
    #[serde(default)]
    pub period: Option<Period>,
}
