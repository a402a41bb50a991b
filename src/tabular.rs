use std::collections::HashMap;

use tracing::debug;
use uuid::Uuid;

use crate::error::{IngestError, Result};
use crate::models::{FileKind, RawRow};

/// Sheet-name terms, strongest first.
pub const SHEET_PRIORITY: &[&str] = &[
    "summen", "saldi", "trial", "balance", "tb", "guv", "bwa", "bilanz", "konto", "saldo", "soll",
    "haben",
];

pub const HEADER_TERMS: &[&str] = &[
    "konto", "account", "bezeichnung", "description", "saldo", "balance", "soll", "haben", "debit",
    "credit", "betrag", "amount",
];

const HEADER_SCAN_ROWS: usize = 10;
const DELIMITERS: &[u8] = b";,\t|";

/// One sheet (or extracted table) as a plain grid of strings.
#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    pub name: String,
    /// 1-based number of `rows[0]` within the source sheet.
    pub first_row: usize,
    pub rows: Vec<Vec<String>>,
    /// Text-line fallbacks carry no header row.
    pub detect_header: bool,
}

impl Sheet {
    pub fn new(name: &str, rows: Vec<Vec<String>>) -> Self {
        Self {
            name: name.to_string(),
            first_row: 1,
            rows,
            detect_header: true,
        }
    }

    /// Index into `rows` of the header row, if one was found.
    pub fn header_index(&self) -> Option<usize> {
        if self.detect_header {
            detect_header(&self.rows)
        } else {
            None
        }
    }

    /// Flatten into storable raw rows, flagging the header.
    pub fn to_raw_rows(&self, file_id: Uuid, sheet_index: usize) -> Vec<RawRow> {
        let header = self.header_index();
        self.rows
            .iter()
            .enumerate()
            .map(|(i, cells)| {
                RawRow::new(
                    file_id,
                    &self.name,
                    sheet_index,
                    self.first_row + i,
                    cells.clone(),
                    header == Some(i),
                )
            })
            .collect()
    }
}

/// All sheets of a tabular upload plus the one normalization should read.
#[derive(Debug, Clone)]
pub struct Workbook {
    pub sheets: Vec<Sheet>,
    pub primary: usize,
}

impl Workbook {
    pub fn primary_sheet(&self) -> Option<&Sheet> {
        self.sheets.get(self.primary)
    }
}

pub fn read_tabular(bytes: &[u8], kind: FileKind) -> Result<Workbook> {
    match kind {
        FileKind::Csv => {
            let rows = read_delimited(bytes)?;
            Ok(Workbook {
                sheets: vec![Sheet::new("Sheet1", rows)],
                primary: 0,
            })
        }
        FileKind::Xlsx | FileKind::Xls => read_workbook(bytes),
        FileKind::Pdf => Err(IngestError::UnsupportedFileType(
            "pdf is not a tabular format".to_string(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Delimited text
// ---------------------------------------------------------------------------

/// UTF-8 (BOM stripped) when valid, otherwise Windows-1252.
pub fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| cp1252_char(b)).collect(),
    }
}

fn cp1252_char(b: u8) -> char {
    const HIGH: [char; 32] = [
        '€', '\u{81}', '‚', 'ƒ', '„', '…', '†', '‡', 'ˆ', '‰', 'Š', '‹', 'Œ', '\u{8D}', 'Ž',
        '\u{8F}', '\u{90}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}', '•', '–', '—', '˜',
        '™', 'š', '›', 'œ', '\u{9D}', 'ž', 'Ÿ',
    ];
    match b {
        0x80..=0x9F => HIGH[(b - 0x80) as usize],
        _ => b as char,
    }
}

/// Picks the delimiter with the best average count times consistency over
/// the first five non-empty lines. Falls back to `,`.
pub fn detect_delimiter(text: &str) -> u8 {
    let lines: Vec<&str> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(5)
        .collect();
    if lines.is_empty() {
        return b',';
    }

    let mut best = (b',', 0.0_f64);
    for &delim in DELIMITERS {
        let counts: Vec<usize> = lines
            .iter()
            .map(|l| l.bytes().filter(|&b| b == delim).count())
            .collect();
        let max = counts.iter().copied().max().unwrap_or(0);
        if max == 0 {
            continue;
        }
        let min = counts.iter().copied().min().unwrap_or(0);
        let avg = counts.iter().sum::<usize>() as f64 / counts.len() as f64;
        let score = avg * (min as f64 / max as f64);
        if score > best.1 {
            best = (delim, score);
        }
    }
    best.0
}

pub fn read_delimited(bytes: &[u8]) -> Result<Vec<Vec<String>>> {
    let text = decode_text(bytes);
    let delimiter = detect_delimiter(&text);
    debug!(delimiter = %(delimiter as char).escape_default(), "reading delimited text");

    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_reader(text.as_bytes());
    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result?;
        rows.push(record.iter().map(|f| f.to_string()).collect());
    }
    Ok(rows)
}

// ---------------------------------------------------------------------------
// Spreadsheets
// ---------------------------------------------------------------------------

#[cfg(feature = "xlsx")]
fn read_workbook(bytes: &[u8]) -> Result<Workbook> {
    use calamine::Reader;

    let cursor = std::io::Cursor::new(bytes.to_vec());
    let mut workbook = calamine::open_workbook_auto_from_rs(cursor)
        .map_err(|e| IngestError::ParseFailure(format!("Failed to open workbook: {e}")))?;

    let names = workbook.sheet_names().to_vec();
    if names.is_empty() {
        return Err(IngestError::ParseFailure("workbook has no sheets".to_string()));
    }

    let mut sheets = Vec::with_capacity(names.len());
    for name in &names {
        let range = workbook
            .worksheet_range(name)
            .map_err(|e| IngestError::ParseFailure(format!("sheet {name}: {e}")))?;
        let (row_offset, col_offset) = range
            .start()
            .map(|(r, c)| (r as usize, c as usize))
            .unwrap_or((0, 0));
        let rows = range
            .rows()
            .map(|row| {
                let mut cells = vec![String::new(); col_offset];
                cells.extend(row.iter().map(render_cell));
                cells
            })
            .collect();
        sheets.push(Sheet {
            name: name.clone(),
            first_row: row_offset + 1,
            rows,
            detect_header: true,
        });
    }

    let primary = select_sheet(&names);
    debug!(sheet = %names[primary], total = names.len(), "selected primary sheet");
    Ok(Workbook { sheets, primary })
}

#[cfg(not(feature = "xlsx"))]
fn read_workbook(_bytes: &[u8]) -> Result<Workbook> {
    Err(IngestError::UnsupportedFileType(
        "spreadsheet support not compiled in (enable the `xlsx` feature)".to_string(),
    ))
}

#[cfg(feature = "xlsx")]
fn render_cell(cell: &calamine::Data) -> String {
    use calamine::Data;
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Int(i) => i.to_string(),
        Data::Float(f) => render_float(*f),
        Data::DateTime(dt) => excel_serial_to_date(dt.as_f64()),
        other => other.to_string(),
    }
}

/// Whole floats lose their trailing `.0`.
pub fn render_float(f: f64) -> String {
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        f.to_string()
    }
}

pub fn excel_serial_to_date(serial: f64) -> String {
    // Excel epoch is 1899-12-30 (accounting for the 1900 leap year bug)
    let Some(base) = chrono::NaiveDate::from_ymd_opt(1899, 12, 30) else {
        return render_float(serial);
    };
    let date = base + chrono::Duration::days(serial as i64);
    date.format("%Y-%m-%d").to_string()
}

/// First sheet whose name contains the strongest matching priority term.
pub fn select_sheet(names: &[String]) -> usize {
    let lowered: Vec<String> = names.iter().map(|n| n.to_lowercase()).collect();
    for term in SHEET_PRIORITY {
        if let Some(i) = lowered.iter().position(|n| n.contains(term)) {
            return i;
        }
    }
    0
}

// ---------------------------------------------------------------------------
// Header detection and labels
// ---------------------------------------------------------------------------

pub fn is_blank(cells: &[String]) -> bool {
    cells.iter().all(|c| c.trim().is_empty())
}

/// One award per cell: 5 for an exact term, else 2 for a contained term.
fn header_score(cells: &[String]) -> Option<usize> {
    let non_empty: Vec<String> = cells
        .iter()
        .map(|c| c.trim().to_lowercase())
        .filter(|c| !c.is_empty())
        .collect();
    if non_empty.len() < 2 {
        return None;
    }
    let score = non_empty
        .iter()
        .map(|cell| {
            if HEADER_TERMS.iter().any(|t| cell == t) {
                5
            } else if HEADER_TERMS.iter().any(|t| cell.contains(t)) {
                2
            } else {
                0
            }
        })
        .sum();
    Some(score)
}

/// Scores the first ten non-blank rows; the earliest row with the highest
/// positive score wins. Without any match the first non-blank row is the header.
pub fn detect_header(rows: &[Vec<String>]) -> Option<usize> {
    let mut candidates = rows
        .iter()
        .enumerate()
        .filter(|(_, r)| !is_blank(r))
        .take(HEADER_SCAN_ROWS)
        .peekable();
    let (first, _) = *candidates.peek()?;
    let mut best = (first, 0);
    for (i, row) in candidates {
        if let Some(score) = header_score(row) {
            if score > best.1 {
                best = (i, score);
            }
        }
    }
    Some(best.0)
}

pub fn normalize_label(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "Unknown_Column".to_string();
    }
    let canonical = match trimmed.to_lowercase().as_str() {
        "konto" | "kontonummer" | "sachkonto" => "Account_Number",
        "bezeichnung" | "kontobezeichnung" | "beschreibung" => "Account_Description",
        "saldo" => "Balance",
        "endsaldo" => "Ending_Balance",
        "anfangssaldo" => "Opening_Balance",
        "soll" => "Debit",
        "sollsaldo" => "Debit_Balance",
        "haben" => "Credit",
        "habensaldo" => "Credit_Balance",
        "betrag" => "Amount",
        "summe" => "Total",
        "periode" => "Period",
        "monat" => "Month",
        "jahr" => "Year",
        "währung" | "waehrung" => "Currency",
        "datum" => "Date",
        _ => return trimmed.split_whitespace().collect::<Vec<_>>().join("_"),
    };
    canonical.to_string()
}

/// Canonical labels with `_2`, `_3` suffixes on repeats.
pub fn normalize_labels(headers: &[String]) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    headers
        .iter()
        .map(|h| {
            let label = normalize_label(h);
            let count = seen.entry(label.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                label
            } else {
                format!("{label}_{count}")
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Grids rebuilt from stored raw rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct GridRow {
    pub raw_row_id: Uuid,
    pub row_number: usize,
    pub cells: Vec<String>,
}

/// A sheet ready for interpretation: header cells, labels, and data rows
/// below the header.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub sheet: String,
    pub headers: Vec<String>,
    pub labels: Vec<String>,
    pub rows: Vec<GridRow>,
}

impl Grid {
    pub fn width(&self) -> usize {
        self.labels.len()
    }
}

/// Rebuilds one sheet's grid. Rows above the flagged header and blank rows
/// are dropped; without a header, columns are labelled `Column_N`.
pub fn build_grid(sheet: &str, raw_rows: &[RawRow]) -> Grid {
    let mut rows: Vec<&RawRow> = raw_rows.iter().filter(|r| r.sheet == sheet).collect();
    rows.sort_by_key(|r| r.row_number);

    let header_pos = rows.iter().position(|r| r.is_header);
    let body_start = header_pos.map_or(0, |p| p + 1);
    let body: Vec<GridRow> = rows[body_start..]
        .iter()
        .filter(|r| !is_blank(&r.cells))
        .map(|r| GridRow {
            raw_row_id: r.id,
            row_number: r.row_number,
            cells: r.cells.clone(),
        })
        .collect();

    let width = body
        .iter()
        .map(|r| r.cells.len())
        .chain(header_pos.map(|p| rows[p].cells.len()))
        .max()
        .unwrap_or(0);

    let headers: Vec<String> = match header_pos {
        Some(p) => (0..width)
            .map(|i| rows[p].cells.get(i).map(|c| c.trim().to_string()).unwrap_or_default())
            .collect(),
        None => (1..=width).map(|i| format!("Column_{i}")).collect(),
    };
    let labels = if header_pos.is_some() {
        normalize_labels(&headers)
    } else {
        headers.clone()
    };

    Grid {
        sheet: sheet.to_string(),
        headers,
        labels,
        rows: body,
    }
}
