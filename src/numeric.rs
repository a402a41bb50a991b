use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{Datelike, NaiveDate};
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Amounts
// ---------------------------------------------------------------------------

const CURRENCY_SYMBOLS: &[char] = &['€', '$', '£', '¥', '₹'];

static AMOUNT_SHAPES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"^-?[\d.,\s]+$").unwrap(),
        Regex::new(r"^\([\d.,\s]+\)$").unwrap(),
        Regex::new(r"(?i)^[\d.,\s]+CR$").unwrap(),
        Regex::new(r"(?i)^[\d.,\s]+DR$").unwrap(),
    ]
});

/// Parse a locale-ambiguous amount string.
///
/// Parentheses, a leading `-` or a trailing `CR` mark the value negative. A
/// trailing `DR` is dropped without touching the sign. When both `,` and `.`
/// appear the later one is the decimal separator; a lone `,` is decimal only
/// when one or two digits follow it. Returns `None` when nothing parses.
pub fn parse_amount(raw: &str) -> Option<Decimal> {
    let mut s = raw.trim();
    let mut negative = false;

    if let Some(inner) = s.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
        negative = true;
        s = inner.trim();
    }

    let lower = s.to_ascii_lowercase();
    if lower.ends_with("cr") {
        negative = true;
        s = s[..s.len() - 2].trim_end();
    } else if lower.ends_with("dr") {
        s = s[..s.len() - 2].trim_end();
    }

    if let Some(rest) = s.strip_prefix('-') {
        negative = true;
        s = rest.trim_start();
    }

    let cleaned: String = s
        .chars()
        .filter(|c| !CURRENCY_SYMBOLS.contains(c) && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let canonical = resolve_separators(&cleaned);
    let value = Decimal::from_str(&canonical).ok()?;
    if negative && !value.is_zero() {
        Some(-value)
    } else {
        Some(value)
    }
}

fn resolve_separators(s: &str) -> String {
    match (s.rfind(','), s.rfind('.')) {
        (Some(comma), Some(dot)) => {
            if comma > dot {
                s.replace('.', "").replace(',', ".")
            } else {
                s.replace(',', "")
            }
        }
        (Some(_), None) => {
            let parts: Vec<&str> = s.split(',').collect();
            let decimal = parts.len() == 2
                && (1..=2).contains(&parts[1].len())
                && parts[1].chars().all(|c| c.is_ascii_digit());
            if decimal {
                s.replace(',', ".")
            } else {
                s.replace(',', "")
            }
        }
        _ => s.to_string(),
    }
}

/// True when the cell has the outward shape of an amount.
pub fn looks_like_amount(raw: &str) -> bool {
    let s = raw.trim();
    s.chars().any(|c| c.is_ascii_digit()) && AMOUNT_SHAPES.iter().any(|re| re.is_match(s))
}

// ---------------------------------------------------------------------------
// Account numbers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountShape {
    /// 3-8 digits, e.g. `1000`
    Numeric,
    /// digits then letters, e.g. `120A`
    NumericSuffix,
    /// letters then digits, e.g. `GL4400`
    Prefixed,
    /// any 2-15 character alphanumeric
    Generic,
}

static ACCOUNT_SHAPES: LazyLock<Vec<(AccountShape, Regex)>> = LazyLock::new(|| {
    vec![
        (AccountShape::Numeric, Regex::new(r"^[0-9]{3,8}$").unwrap()),
        (AccountShape::NumericSuffix, Regex::new(r"^[0-9]{1,4}[A-Z]{1,3}$").unwrap()),
        (AccountShape::Prefixed, Regex::new(r"^[A-Z]{1,3}[0-9]{1,6}$").unwrap()),
        (AccountShape::Generic, Regex::new(r"^[0-9A-Z]{2,15}$").unwrap()),
    ]
});

pub fn account_shape(account: &str) -> Option<AccountShape> {
    ACCOUNT_SHAPES
        .iter()
        .find(|(_, re)| re.is_match(account))
        .map(|(shape, _)| *shape)
}

/// Uppercase, drop `-`, `.` and whitespace, then accept only known shapes.
pub fn normalize_account_number(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .trim()
        .to_uppercase()
        .chars()
        .filter(|c| !matches!(c, '-' | '.') && !c.is_whitespace())
        .collect();
    account_shape(&cleaned).map(|_| cleaned)
}

// ---------------------------------------------------------------------------
// Periods
// ---------------------------------------------------------------------------

/// A calendar month a trial balance refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (2000..=2099).contains(&year) && (1..=12).contains(&month) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    pub fn of_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// YYYYMM
    pub fn key(&self) -> u32 {
        self.year as u32 * 100 + self.month
    }

    pub fn from_key(key: u32) -> Option<Self> {
        Self::new((key / 100) as i32, key % 100)
    }

    pub fn label(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }

    pub fn start(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or_default()
    }

    pub fn end(&self) -> NaiveDate {
        let (y, m) = if self.month == 12 {
            (self.year + 1, 1)
        } else {
            (self.year, self.month + 1)
        };
        NaiveDate::from_ymd_opt(y, m, 1)
            .and_then(|d| d.pred_opt())
            .unwrap_or_default()
    }
}

static PERIOD_YEAR_FIRST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})[-./](\d{1,2})$").unwrap());
static PERIOD_MONTH_FIRST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})[-./](\d{4})$").unwrap());
static PERIOD_COMPACT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d{4})(\d{2})$").unwrap());
static DATE_ISO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{1,2})-(\d{1,2})").unwrap());
static DATE_GERMAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})\.(\d{1,2})\.(\d{4})$").unwrap());

/// Accepts `2023-12`, `2023.12`, `12/2023`, `12-2023`, `202312` and full dates.
pub fn normalize_period(raw: &str) -> Option<Period> {
    let s = raw.trim();
    let pick = |re: &Regex, y: usize, m: usize| -> Option<Period> {
        let caps = re.captures(s)?;
        Period::new(caps[y].parse().ok()?, caps[m].parse().ok()?)
    };
    pick(&DATE_ISO, 1, 2)
        .or_else(|| pick(&DATE_GERMAN, 3, 2))
        .or_else(|| pick(&PERIOD_YEAR_FIRST, 1, 2))
        .or_else(|| pick(&PERIOD_MONTH_FIRST, 2, 1))
        .or_else(|| pick(&PERIOD_COMPACT, 1, 2))
}

// ---------------------------------------------------------------------------
// Currency and debit/credit indicators
// ---------------------------------------------------------------------------

pub fn normalize_currency_code(raw: &str, default: &str) -> String {
    let s = raw.trim().to_uppercase();
    match s.as_str() {
        "€" | "EUR" | "EURO" | "EUROS" => "EUR".to_string(),
        "$" | "USD" | "DOLLAR" | "DOLLARS" => "USD".to_string(),
        "£" | "GBP" | "POUND" | "POUNDS" => "GBP".to_string(),
        "¥" | "JPY" | "YEN" => "JPY".to_string(),
        _ if s.len() == 3 && s.chars().all(|c| c.is_ascii_alphabetic()) => s,
        _ => default.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    Debit,
    Credit,
}

impl Indicator {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "S" | "SOLL" | "D" | "DR" | "DEBIT" => Some(Self::Debit),
            "H" | "HABEN" | "C" | "CR" | "CREDIT" => Some(Self::Credit),
            _ => None,
        }
    }

    /// Credit turns a positive amount negative; debit leaves it alone.
    pub fn apply(&self, amount: Decimal) -> Decimal {
        match self {
            Self::Credit if amount > Decimal::ZERO => -amount,
            _ => amount,
        }
    }
}
