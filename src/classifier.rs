use std::path::Path;

use tracing::debug;

use crate::error::{IngestError, Result};
use crate::models::FileKind;

/// What the byte-signature detector concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signature {
    Supported(FileKind),
    /// Recognized, but not something we ingest (images, plain archives).
    Other(&'static str),
}

const PDF_MAGIC: &[u8] = b"%PDF";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0];
const SAMPLE_BYTES: usize = 8192;

pub fn detect_by_extension(filename: &str) -> Option<FileKind> {
    let ext = Path::new(filename)
        .extension()?
        .to_string_lossy()
        .to_lowercase();
    match ext.as_str() {
        "csv" | "tsv" => Some(FileKind::Csv),
        "xlsx" | "xlsm" => Some(FileKind::Xlsx),
        "xls" => Some(FileKind::Xls),
        "pdf" => Some(FileKind::Pdf),
        _ => None,
    }
}

pub fn detect_by_signature(bytes: &[u8]) -> Option<Signature> {
    match bytes {
        [0x25, 0x50, 0x44, 0x46, ..] => Some(Signature::Supported(FileKind::Pdf)),
        [0x50, 0x4B, 0x03, 0x04, ..] => {
            // OOXML workbooks keep their parts under xl/
            if contains(bytes, b"xl/") {
                Some(Signature::Supported(FileKind::Xlsx))
            } else {
                Some(Signature::Other("zip"))
            }
        }
        [0xD0, 0xCF, 0x11, 0xE0, ..] => Some(Signature::Supported(FileKind::Xls)),
        [0x89, 0x50, 0x4E, 0x47, ..] => Some(Signature::Other("png")),
        [0xFF, 0xD8, 0xFF, ..] => Some(Signature::Other("jpeg")),
        [0x47, 0x49, 0x46, 0x38, ..] => Some(Signature::Other("gif")),
        _ => None,
    }
}

/// Structural guess for payloads with neither a signature nor a known extension.
pub fn detect_by_content(bytes: &[u8]) -> Option<FileKind> {
    let head = &bytes[..bytes.len().min(SAMPLE_BYTES)];
    if head.starts_with(PDF_MAGIC) {
        return Some(FileKind::Pdf);
    }
    if head.starts_with(ZIP_MAGIC) || head.starts_with(OLE_MAGIC) {
        return Some(FileKind::Xlsx);
    }
    if !is_likely_text(head) {
        return None;
    }
    let text = String::from_utf8_lossy(head);
    let semicolons = text.matches(';').count();
    let commas = text.matches(',').count();
    let tabs = text.matches('\t').count();
    let lines = text.lines().filter(|l| !l.trim().is_empty()).count();
    if semicolons > 5 || commas > 5 || tabs > 3 || lines > 2 {
        Some(FileKind::Csv)
    } else {
        None
    }
}

/// Signature wins, then extension, then content heuristics.
pub fn classify(bytes: &[u8], filename: &str) -> Result<FileKind> {
    if bytes.is_empty() {
        return Err(IngestError::UnsupportedFileType(format!("{filename}: empty file")));
    }

    let signature = detect_by_signature(bytes);
    let extension = detect_by_extension(filename);
    debug!(filename, ?signature, ?extension, "classifying upload");

    match signature {
        Some(Signature::Supported(kind)) => Ok(kind),
        Some(Signature::Other(name)) => Err(IngestError::UnsupportedFileType(format!(
            "{filename}: detected {name} content"
        ))),
        None => extension
            .or_else(|| detect_by_content(bytes))
            .ok_or_else(|| {
                IngestError::UnsupportedFileType(format!("{filename}: unrecognized content"))
            }),
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// No NUL bytes and under 5% control characters.
fn is_likely_text(sample: &[u8]) -> bool {
    if sample.is_empty() || sample.contains(&0) {
        return false;
    }
    let control = sample
        .iter()
        .filter(|&&b| (b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r')) || b == 0x7F)
        .count();
    (control as f64) / (sample.len() as f64) < 0.05
}
