use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::error::{IngestError, Result};
use crate::tabular::Sheet;

/// A positioned piece of a document page.
#[derive(Debug, Clone, PartialEq)]
pub enum PageElement {
    Table(TableElement),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableElement {
    /// Row/column export when the reader recovered the table structure.
    pub cells: Option<Vec<Vec<String>>>,
    /// The table as plain text lines.
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub number: usize,
    pub elements: Vec<PageElement>,
}

impl Page {
    pub fn text_lines(&self) -> Vec<&str> {
        self.elements
            .iter()
            .flat_map(|e| match e {
                PageElement::Table(t) => t.text.lines(),
                PageElement::Text(s) => s.lines(),
            })
            .collect()
    }
}

/// Turns document bytes into pages of classified elements.
pub trait DocumentReader: Send + Sync {
    fn read_pages(&self, bytes: &[u8]) -> Result<Vec<Page>>;
}

/// Text-layer reader backed by `pdf-extract`. Runs of aligned lines become
/// table elements; everything else stays text.
#[cfg(feature = "pdf")]
pub struct PdfTextReader;

#[cfg(feature = "pdf")]
impl DocumentReader for PdfTextReader {
    fn read_pages(&self, bytes: &[u8]) -> Result<Vec<Page>> {
        let page_texts = pdf_extract::extract_text_from_mem_by_pages(bytes)
            .map_err(|e| IngestError::ParseFailure(format!("PDF parsing failed: {e}")))?;
        Ok(page_texts
            .iter()
            .enumerate()
            .map(|(i, text)| Page {
                number: i + 1,
                elements: segment_page_text(text),
            })
            .collect())
    }
}

/// Stand-in when PDF support is compiled out.
pub struct UnavailableReader;

impl DocumentReader for UnavailableReader {
    fn read_pages(&self, _bytes: &[u8]) -> Result<Vec<Page>> {
        Err(IngestError::UnsupportedFileType(
            "pdf support not compiled in (enable the `pdf` feature)".to_string(),
        ))
    }
}

pub fn default_reader() -> Box<dyn DocumentReader> {
    #[cfg(feature = "pdf")]
    {
        Box::new(PdfTextReader)
    }
    #[cfg(not(feature = "pdf"))]
    {
        Box::new(UnavailableReader)
    }
}

// ---------------------------------------------------------------------------
// Page segmentation
// ---------------------------------------------------------------------------

/// Tabs, two or more pipes, or two or more gaps of 3+ spaces.
pub fn is_tabular_line(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.len() < 5 {
        return false;
    }
    trimmed.matches('\t').count() >= 1
        || trimmed.matches('|').count() >= 2
        || count_multi_space_gaps(trimmed) >= 2
}

fn count_multi_space_gaps(text: &str) -> usize {
    let mut count = 0;
    let mut gap_len = 0;
    for ch in text.chars() {
        if ch == ' ' {
            gap_len += 1;
            if gap_len == 3 {
                count += 1;
            }
        } else {
            gap_len = 0;
        }
    }
    count
}

/// Groups two or more consecutive tabular lines into a table element.
pub fn segment_page_text(text: &str) -> Vec<PageElement> {
    let mut elements = Vec::new();
    let mut table: Vec<&str> = Vec::new();
    let mut prose: Vec<&str> = Vec::new();

    fn flush_table<'a>(
        table: &mut Vec<&'a str>,
        prose: &mut Vec<&'a str>,
        out: &mut Vec<PageElement>,
    ) {
        if table.len() >= 2 {
            if !prose.is_empty() {
                out.push(PageElement::Text(prose.join("\n")));
                prose.clear();
            }
            out.push(PageElement::Table(TableElement {
                cells: None,
                text: table.join("\n"),
            }));
        } else {
            prose.append(table);
        }
        table.clear();
    }

    for line in text.lines() {
        if is_tabular_line(line) {
            table.push(line);
        } else {
            flush_table(&mut table, &mut prose, &mut elements);
            prose.push(line);
        }
    }
    flush_table(&mut table, &mut prose, &mut elements);
    if prose.iter().any(|l| !l.trim().is_empty()) {
        elements.push(PageElement::Text(prose.join("\n")));
    }
    elements
}

// ---------------------------------------------------------------------------
// Table extraction
// ---------------------------------------------------------------------------

static CELL_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\|\s*|\t+| {2,}").unwrap());

pub fn split_table_line(line: &str) -> Vec<String> {
    CELL_SPLIT
        .split(line.trim())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Extracts one sheet per table (`p{page}-t{n}`), or a single `text`
/// sheet of account-looking lines when the document has no tables at all.
/// Row numbers are line positions within the table or page.
pub fn extract_tables(pages: &[Page]) -> Result<Vec<Sheet>> {
    let mut sheets = Vec::new();

    for page in pages {
        let tables = page.elements.iter().filter_map(|e| match e {
            PageElement::Table(t) => Some(t),
            PageElement::Text(_) => None,
        });
        for (t, table) in tables.enumerate() {
            let name = format!("p{}-t{}", page.number, t + 1);
            match table.cells.as_ref().filter(|c| !c.is_empty()) {
                Some(cells) => sheets.push(Sheet::new(&name, cells.clone())),
                None => {
                    let rows: Vec<(usize, Vec<String>)> = table
                        .text
                        .lines()
                        .enumerate()
                        .map(|(i, line)| (i + 1, split_table_line(line)))
                        .filter(|(_, tokens)| tokens.len() >= 2)
                        .collect();
                    if let Some(sheet) = numbered_sheet(&name, rows) {
                        sheets.push(sheet);
                    }
                }
            }
        }
    }

    if sheets.is_empty() {
        debug!(pages = pages.len(), "no tables found, scanning text lines");
        for page in pages {
            let rows: Vec<(usize, Vec<String>)> = page
                .text_lines()
                .into_iter()
                .enumerate()
                .filter_map(|(i, line)| account_line(line).map(|cells| (i + 1, cells)))
                .collect();
            if let Some(sheet) = numbered_sheet(&format!("p{}-text", page.number), rows) {
                sheets.push(sheet);
            }
        }
    }

    if sheets.is_empty() {
        return Err(IngestError::ParseFailure(
            "document contains no tables or account lines".to_string(),
        ));
    }
    Ok(sheets)
}

/// `1000 Kasse 1.234,56` -> ["1000", "Kasse 1.234,56"] when the first token has a digit.
fn account_line(line: &str) -> Option<Vec<String>> {
    let trimmed = line.trim();
    let (first, rest) = match trimmed.split_once(char::is_whitespace) {
        Some((first, rest)) => (first, rest.trim()),
        None => (trimmed, ""),
    };
    if first.is_empty() || !first.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(vec![first.to_string(), rest.to_string()])
}

/// Keeps source line numbers so provenance survives into raw storage.
fn numbered_sheet(name: &str, rows: Vec<(usize, Vec<String>)>) -> Option<Sheet> {
    if rows.is_empty() {
        return None;
    }
    // Fill gaps with empty rows so row_number == line number.
    let last = rows.last().map(|(n, _)| *n).unwrap_or(0);
    let mut grid = vec![Vec::new(); last];
    for (n, cells) in rows {
        grid[n - 1] = cells;
    }
    Some(Sheet {
        name: name.to_string(),
        first_row: 1,
        rows: grid,
        detect_header: false,
    })
}
