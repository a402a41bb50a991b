use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use rayon::prelude::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::advisory::Advisor;
use crate::assembler::{accounts_missing_descriptions, Assembled, AssemblyContext, RowAssembler};
use crate::classifier::classify;
use crate::db::{NormalizationRun, RecordStore};
use crate::document::{default_reader, extract_tables, DocumentReader};
use crate::error::{IngestError, Result};
use crate::models::{
    AdvisoryHints, ColumnRoleMapping, FileKind, FileStatus, NormalizeOptions, NormalizedRow, RawFile,
    RawRow, RowStatus, StatusCounts,
};
use crate::numeric::Period;
use crate::roles::ColumnRoleResolver;
use crate::settings::Settings;
use crate::tabular::{build_grid, is_blank, read_tabular, Grid, Sheet};
use crate::validator::{quality_report, QualityReport, QualityValidator, RowFailure, ValidationReport};

/// What a normalization run did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NormalizationSummary {
    pub run_id: Option<Uuid>,
    /// Rows that produced a record without failing.
    pub normalized_count: usize,
    pub failed_count: usize,
    /// Rows without an account plus duplicates of already persisted rows.
    pub skipped_count: usize,
    /// Rows moved to `success`.
    pub persisted_count: usize,
    pub validation_report: ValidationReport,
    pub quality: QualityReport,
}

/// Which normalized rows a run may write.
enum Scope {
    /// Rows with no record yet or a pending one.
    Open,
    /// Exactly these row ids (a retry).
    Only(HashSet<Uuid>),
}

impl Scope {
    fn admits(&self, id: Uuid, existing: Option<&NormalizedRow>) -> bool {
        match self {
            Scope::Open => existing.map_or(true, |e| e.status == RowStatus::Pending),
            Scope::Only(ids) => ids.contains(&id),
        }
    }
}

/// Sequences classification, capture, role resolution, assembly and
/// validation for one file at a time.
pub struct Pipeline {
    store: Arc<dyn RecordStore>,
    settings: Settings,
    advisor: Option<Arc<dyn Advisor>>,
    reader: Box<dyn DocumentReader>,
}

impl Pipeline {
    pub fn new(store: Arc<dyn RecordStore>, settings: Settings) -> Self {
        Self {
            store,
            settings,
            advisor: None,
            reader: default_reader(),
        }
    }

    pub fn with_advisor(mut self, advisor: Box<dyn Advisor>) -> Self {
        self.advisor = Some(Arc::from(advisor));
        self
    }

    pub fn with_reader(mut self, reader: Box<dyn DocumentReader>) -> Self {
        self.reader = reader;
        self
    }

    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    fn advisory_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.advisory.timeout_secs)
    }

    // -----------------------------------------------------------------------
    // Raw capture
    // -----------------------------------------------------------------------

    /// Classifies and captures a file as raw rows. Identical bytes under the
    /// same name and entity return the existing file id.
    pub fn submit(&self, bytes: &[u8], filename: &str, entity_id: Uuid) -> Result<Uuid> {
        let limit = self.settings.max_file_size_bytes();
        if bytes.len() as u64 > limit {
            return Err(IngestError::ParseFailure(format!(
                "{filename} is larger than {} MB",
                self.settings.max_file_size_mb
            )));
        }

        let kind = classify(bytes, filename)?;
        if bytes.len() < kind.min_size() {
            return Err(IngestError::ParseFailure(format!(
                "{filename} is too small to be a valid {} file ({} bytes)",
                kind.key(),
                bytes.len()
            )));
        }

        let content_hash = hex::encode(Sha256::digest(bytes));
        let sheets = self.read_sheets(bytes, kind);
        let primary_sheet = match &sheets {
            Ok((_, primary)) => primary.clone(),
            Err(_) => None,
        };
        let candidate = RawFile {
            id: Uuid::new_v4(),
            entity_id,
            filename: filename.to_string(),
            size_bytes: bytes.len() as u64,
            content_hash,
            kind,
            status: FileStatus::Uploaded,
            primary_sheet,
            uploaded_at: Utc::now(),
            error_message: None,
            advisory_hints: AdvisoryHints::default(),
        };
        let file = self.store.claim_raw_file(&candidate)?;
        if file.status != FileStatus::Uploaded {
            info!(file_id = %file.id, filename, "file already captured (duplicate checksum)");
            return Ok(file.id);
        }
        if file.id != candidate.id {
            // An earlier capture stopped half way; finish it under the same id.
            debug!(file_id = %file.id, filename, "resuming raw capture");
        }

        let captured = sheets.and_then(|(sheets, _)| self.capture(&file, &sheets));
        match captured {
            Ok(row_count) => {
                self.store.set_file_status(file.id, FileStatus::Parsed, None)?;
                info!(file_id = %file.id, filename, kind = kind.key(), rows = row_count, "raw capture complete");
                Ok(file.id)
            }
            Err(e) => {
                let err = match e {
                    IngestError::ParseFailure(_) | IngestError::UnsupportedFileType(_) => e,
                    other => IngestError::ParseFailure(other.to_string()),
                };
                warn!(file_id = %file.id, filename, error = %err, "raw capture failed");
                self.store
                    .set_file_status(file.id, FileStatus::Error, Some(&err.to_string()))?;
                Err(err)
            }
        }
    }

    /// Submits several files in parallel. Each file succeeds or fails on its own.
    pub fn submit_many(&self, files: &[(String, Vec<u8>)], entity_id: Uuid) -> Vec<Result<Uuid>> {
        files
            .par_iter()
            .map(|(filename, bytes)| self.submit(bytes, filename, entity_id))
            .collect()
    }

    fn read_sheets(&self, bytes: &[u8], kind: FileKind) -> Result<(Vec<Sheet>, Option<String>)> {
        if kind == FileKind::Pdf {
            let pages = self.reader.read_pages(bytes)?;
            return Ok((extract_tables(&pages)?, None));
        }
        let workbook = read_tabular(bytes, kind)?;
        let primary = workbook.primary_sheet().map(|s| s.name.clone());
        Ok((workbook.sheets, primary))
    }

    fn capture(&self, file: &RawFile, sheets: &[Sheet]) -> Result<usize> {
        let has_data = sheets.iter().any(|s| s.rows.iter().any(|r| !is_blank(r)));
        if !has_data {
            return Err(IngestError::ParseFailure(format!("{} contains no rows", file.filename)));
        }
        let rows: Vec<_> = sheets
            .iter()
            .enumerate()
            .flat_map(|(i, sheet)| sheet.to_raw_rows(file.id, i))
            .collect();
        let inserted = self.store.insert_raw_rows(&rows)?;
        debug!(file_id = %file.id, sheets = sheets.len(), rows = rows.len(), inserted, "stored raw rows");
        Ok(rows.len())
    }

    // -----------------------------------------------------------------------
    // Normalization
    // -----------------------------------------------------------------------

    pub fn normalize(&self, file_id: Uuid, entity_id: Uuid, options: &NormalizeOptions) -> Result<NormalizationSummary> {
        let file = self.normalizable_file(file_id)?;
        if file.entity_id != entity_id {
            return Err(IngestError::Other(format!(
                "file {file_id} does not belong to entity {entity_id}"
            )));
        }
        self.run(&file, options, Scope::Open, false)
    }

    pub fn status(&self, file_id: Uuid) -> Result<StatusCounts> {
        if self.store.get_raw_file(file_id)?.is_none() {
            return Err(IngestError::UnknownFile(file_id));
        }
        self.store.status_counts(file_id)
    }

    /// Reopens failed rows and normalizes only those, with the options of
    /// the last run and persistence forced.
    pub fn retry(&self, file_id: Uuid) -> Result<NormalizationSummary> {
        let file = self.normalizable_file(file_id)?;
        let failed = self.store.normalized_rows_by_status(Some(file_id), RowStatus::Failed)?;
        if failed.is_empty() {
            info!(file_id = %file_id, "no failed rows to retry");
            return Ok(NormalizationSummary::default());
        }

        let mut ids = HashSet::new();
        for row in failed {
            ids.insert(row.id);
            let reopened = NormalizedRow {
                status: RowStatus::Pending,
                failure_reason: None,
                ..row
            };
            self.store.upsert_normalized_row(&reopened)?;
        }

        let mut options = self
            .store
            .runs_for_file(file_id)?
            .into_iter()
            .next_back()
            .map(|run| run.options)
            .unwrap_or_default();
        options.force = true;

        info!(file_id = %file_id, rows = ids.len(), "retrying failed rows");
        self.run(&file, &options, Scope::Only(ids), true)
    }

    fn normalizable_file(&self, file_id: Uuid) -> Result<RawFile> {
        let file = self
            .store
            .get_raw_file(file_id)?
            .ok_or(IngestError::UnknownFile(file_id))?;
        match file.status {
            FileStatus::Parsed | FileStatus::Consumed => Ok(file),
            other => Err(IngestError::InvalidState {
                entity: format!("file {file_id}"),
                from: other.as_str().to_string(),
                to: FileStatus::Consumed.as_str().to_string(),
            }),
        }
    }

    fn sheets_to_read(&self, file: &RawFile, raw_rows: &[RawRow]) -> Vec<String> {
        if let Some(primary) = &file.primary_sheet {
            return vec![primary.clone()];
        }
        let mut names: Vec<String> = Vec::new();
        for row in raw_rows {
            if !names.contains(&row.sheet) {
                names.push(row.sheet.clone());
            }
        }
        names
    }

    fn run(&self, file: &RawFile, options: &NormalizeOptions, scope: Scope, is_retry: bool) -> Result<NormalizationSummary> {
        let started_at = Utc::now();
        let raw_rows = self.store.raw_rows_for_file(file.id)?;
        let existing: HashMap<Uuid, NormalizedRow> = self
            .store
            .normalized_rows_for_file(file.id)?
            .into_iter()
            .map(|r| (r.id, r))
            .collect();

        let mut hints = file.advisory_hints.clone();
        let mut hints_changed = false;
        let resolver = ColumnRoleResolver::new(
            self.advisor.clone(),
            self.advisory_timeout(),
            self.settings.advisory.min_confidence,
        );

        let mut resolved: Vec<(Grid, ColumnRoleMapping)> = Vec::new();
        for sheet in self.sheets_to_read(file, &raw_rows) {
            let grid = build_grid(&sheet, &raw_rows);
            let resolution = resolver.resolve(
                &grid,
                hints.column_suggestions.get(&sheet),
                Some(&options.custom_mapping),
            );
            if let Some(suggestion) = resolution.new_suggestion {
                hints.column_suggestions.insert(sheet.clone(), suggestion);
                hints_changed = true;
            }
            resolved.push((grid, resolution.mapping));
        }

        let default_period = options
            .period
            .unwrap_or_else(|| Period::of_date(file.uploaded_at.date_naive()));
        let assemble = |descriptions: &BTreeMap<String, String>| -> Vec<Assembled> {
            let mut out = Vec::new();
            for (grid, mapping) in &resolved {
                let ctx = AssemblyContext {
                    file_id: file.id,
                    entity_id: file.entity_id,
                    filename: &file.filename,
                    default_period,
                    default_currency: &self.settings.default_currency,
                    inferred_descriptions: descriptions,
                };
                let assembler = RowAssembler::new(grid, mapping, ctx);
                for (row, assembled) in grid.rows.iter().zip(assembler.assemble_all()) {
                    if scope.admits(row.raw_row_id, existing.get(&row.raw_row_id)) {
                        out.push(assembled);
                    }
                }
            }
            out
        };

        let mut assembled = assemble(&hints.descriptions);
        if self.infer_missing_descriptions(&assembled, &mut hints) {
            hints_changed = true;
            assembled = assemble(&hints.descriptions);
        }
        if hints_changed {
            self.store.set_advisory_hints(file.id, &hints)?;
        }

        let data_rows = assembled.len();
        let mut rows: Vec<NormalizedRow> = Vec::new();
        let mut dropped = 0usize;
        for a in assembled {
            match a {
                Assembled::Row(row) => rows.push(*row),
                Assembled::Dropped { .. } => dropped += 1,
            }
        }

        let candidates: Vec<NormalizedRow> = rows
            .iter()
            .filter(|r| r.status != RowStatus::Failed)
            .cloned()
            .collect();
        let today: NaiveDate = Utc::now().date_naive();
        let report = QualityValidator::new(today).validate(&candidates);
        let persist = report.is_valid() || options.force;
        if !persist {
            info!(
                file_id = %file.id,
                errors = report.errors.len(),
                "validation failed, rows left pending (use force to persist)"
            );
        }

        let mut summary = NormalizationSummary {
            skipped_count: dropped,
            ..Default::default()
        };
        let mut failures: Vec<RowFailure> = Vec::new();
        for mut row in rows {
            if row.status != RowStatus::Failed {
                row.status = if !persist {
                    RowStatus::Pending
                } else if self.is_duplicate(&row)? {
                    RowStatus::Skipped
                } else {
                    RowStatus::Success
                };
            }

            if let Err(e) = self.store.upsert_normalized_row(&row) {
                warn!(file_id = %file.id, sheet = %row.sheet, row = row.row_number, error = %e, "could not store row");
                row.status = RowStatus::Failed;
                row.failure_reason = Some(e.to_string());
                if let Err(e) = self.store.upsert_normalized_row(&row) {
                    warn!(row = row.row_number, error = %e, "could not record row failure");
                }
            }

            match row.status {
                RowStatus::Failed => {
                    summary.failed_count += 1;
                    let reason = row.failure_reason.clone().unwrap_or_default();
                    debug!(sheet = %row.sheet, row = row.row_number, reason = %reason, "row failed");
                    failures.push(RowFailure {
                        sheet: row.sheet.clone(),
                        row_number: row.row_number,
                        reason,
                    });
                }
                RowStatus::Skipped => {
                    summary.normalized_count += 1;
                    summary.skipped_count += 1;
                }
                RowStatus::Success => {
                    summary.normalized_count += 1;
                    summary.persisted_count += 1;
                }
                RowStatus::Pending => summary.normalized_count += 1,
            }
        }

        summary.quality = quality_report(&report, data_rows, summary.persisted_count, &failures);
        summary.validation_report = report;

        let run = NormalizationRun {
            id: Uuid::new_v4(),
            file_id: file.id,
            started_at,
            is_retry,
            options: options.clone(),
            normalized_count: summary.normalized_count,
            failed_count: summary.failed_count,
            skipped_count: summary.skipped_count,
            persisted_count: summary.persisted_count,
            report: summary.validation_report.clone(),
            quality: summary.quality.clone(),
        };
        self.store.record_run(&run)?;
        summary.run_id = Some(run.id);

        let counts = self.store.status_counts(file.id)?;
        if counts.total() > 0 && counts.pending == 0 && counts.failed == 0 {
            self.store.set_file_status(file.id, FileStatus::Consumed, None)?;
        }

        info!(
            file_id = %file.id,
            normalized = summary.normalized_count,
            failed = summary.failed_count,
            skipped = summary.skipped_count,
            persisted = summary.persisted_count,
            score = summary.validation_report.score,
            "normalization run complete"
        );
        Ok(summary)
    }

    fn is_duplicate(&self, row: &NormalizedRow) -> Result<bool> {
        Ok(self
            .store
            .find_success_by_hash(&row.source_hash)?
            .is_some_and(|other| other.id != row.id))
    }

    /// Asks the advisor once for accounts still lacking a description.
    /// Returns whether the hints changed.
    fn infer_missing_descriptions(&self, assembled: &[Assembled], hints: &mut AdvisoryHints) -> bool {
        let Some(advisor) = &self.advisor else {
            return false;
        };
        let missing: Vec<String> = accounts_missing_descriptions(assembled)
            .into_iter()
            .filter(|a| !hints.inference_attempted.contains(a))
            .collect();
        if missing.is_empty() {
            return false;
        }

        match advisor.infer_descriptions(&missing, self.advisory_timeout()) {
            Ok(found) => {
                debug!(asked = missing.len(), found = found.len(), "inferred descriptions");
                hints.descriptions.extend(found);
            }
            Err(e) => warn!(advisor = advisor.name(), error = %e, "description inference failed"),
        }
        hints.inference_attempted.extend(missing);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisory::{AdvisoryError, StaticAdvisor};
    use crate::db::SqliteStore;
    use crate::document::{Page, PageElement};
    use crate::models::{ColumnRole, ColumnSuggestion};
    use rust_decimal_macros::dec;

    const KONTEN: &str = "Konto;Bezeichnung;Saldo\n1000;Kasse;1.234,56\n1600;Bank;(500,00)\n";

    fn test_store() -> (tempfile::TempDir, Arc<SqliteStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("test.db")).unwrap();
        (dir, Arc::new(store))
    }

    fn pipeline() -> (tempfile::TempDir, Pipeline) {
        let (dir, store) = test_store();
        (dir, Pipeline::new(store, Settings::default()))
    }

    fn forced() -> NormalizeOptions {
        NormalizeOptions {
            force: true,
            period: Period::new(2023, 12),
            ..Default::default()
        }
    }

    fn success_rows(p: &Pipeline, file_id: Uuid) -> Vec<NormalizedRow> {
        p.store()
            .normalized_rows_by_status(Some(file_id), RowStatus::Success)
            .unwrap()
    }

    #[test]
    fn test_end_to_end_german_csv() {
        let (_dir, p) = pipeline();
        let entity = Uuid::new_v4();
        let file_id = p.submit(KONTEN.as_bytes(), "saldenliste.csv", entity).unwrap();

        let summary = p.normalize(file_id, entity, &forced()).unwrap();
        assert_eq!(summary.normalized_count, 2);
        assert_eq!(summary.failed_count, 0);
        assert_eq!(summary.persisted_count, 2);

        let rows = p.store().normalized_rows_for_file(file_id).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].account_number, "1000");
        assert_eq!(rows[0].description.as_deref(), Some("Kasse"));
        assert_eq!(rows[0].amount, Some(dec!(1234.56)));
        assert_eq!(rows[1].account_number, "1600");
        assert_eq!(rows[1].description.as_deref(), Some("Bank"));
        assert_eq!(rows[1].amount, Some(dec!(-500.00)));
        for row in &rows {
            assert_eq!(row.currency_code, "EUR");
            assert_eq!(row.extraction_confidence, 1.0);
            assert_eq!(row.status, RowStatus::Success);
            assert_eq!(row.period_key, 202312);
        }

        let file = p.store().get_raw_file(file_id).unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Consumed);
    }

    #[test]
    fn test_raw_capture_preserves_cells_and_order() {
        let (_dir, p) = pipeline();
        let file_id = p.submit(KONTEN.as_bytes(), "tb.csv", Uuid::new_v4()).unwrap();
        let raw = p.store().raw_rows_for_file(file_id).unwrap();
        let cells: Vec<Vec<String>> = raw.iter().map(|r| r.cells.clone()).collect();
        assert_eq!(
            cells,
            vec![
                vec!["Konto", "Bezeichnung", "Saldo"],
                vec!["1000", "Kasse", "1.234,56"],
                vec!["1600", "Bank", "(500,00)"],
            ]
        );
        assert!(raw[0].is_header);
        assert_eq!(raw.iter().map(|r| r.row_number).collect::<Vec<_>>(), vec![1, 2, 3]);
        let file = p.store().get_raw_file(file_id).unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Parsed);
        assert_eq!(file.primary_sheet.as_deref(), Some("Sheet1"));
    }

    #[test]
    fn test_resubmission_returns_same_file() {
        let (_dir, p) = pipeline();
        let entity = Uuid::new_v4();
        let first = p.submit(KONTEN.as_bytes(), "tb.csv", entity).unwrap();
        let second = p.submit(KONTEN.as_bytes(), "tb.csv", entity).unwrap();
        assert_eq!(first, second);
        let other_entity = p.submit(KONTEN.as_bytes(), "tb.csv", Uuid::new_v4()).unwrap();
        assert_ne!(first, other_entity);
    }

    #[test]
    fn test_unsupported_file_stores_nothing() {
        let (_dir, p) = pipeline();
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        let err = p.submit(&png, "scan.png", Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedFileType(_)));
        assert!(p.store().list_raw_files().unwrap().is_empty());
    }

    #[test]
    fn test_size_guards() {
        let (_dir, store) = test_store();
        let settings = Settings {
            max_file_size_mb: 0,
            ..Settings::default()
        };
        let p = Pipeline::new(store, settings);
        let err = p.submit(KONTEN.as_bytes(), "tb.csv", Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, IngestError::ParseFailure(_)));

        let (_dir, p) = pipeline();
        let err = p.submit(b"a;b", "tiny.csv", Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, IngestError::ParseFailure(_)));
    }

    #[test]
    fn test_parse_failure_marks_file_error() {
        let (_dir, p) = pipeline();
        let blank = ";;;\n;;;\n;;;\n;;;\n";
        let err = p.submit(blank.as_bytes(), "empty.csv", Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, IngestError::ParseFailure(_)));
        let files = p.store().list_raw_files().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].status, FileStatus::Error);
        assert!(files[0].error_message.is_some());

        let err = p.normalize(files[0].id, files[0].entity_id, &forced()).unwrap_err();
        assert!(matches!(err, IngestError::InvalidState { .. }));
    }

    #[test]
    fn test_unknown_file() {
        let (_dir, p) = pipeline();
        let id = Uuid::new_v4();
        assert!(matches!(p.status(id), Err(IngestError::UnknownFile(_))));
        assert!(matches!(p.retry(id), Err(IngestError::UnknownFile(_))));
        assert!(matches!(
            p.normalize(id, Uuid::new_v4(), &NormalizeOptions::default()),
            Err(IngestError::UnknownFile(_))
        ));
    }

    #[test]
    fn test_invalid_report_leaves_rows_pending() {
        let (_dir, p) = pipeline();
        let entity = Uuid::new_v4();
        let csv = "Konto;Bezeichnung;Saldo\n1000;Kasse;100,00\nX;Ungueltig;5,00\n";
        let file_id = p.submit(csv.as_bytes(), "tb.csv", entity).unwrap();
        let options = NormalizeOptions {
            period: Period::new(2023, 12),
            ..Default::default()
        };
        let summary = p.normalize(file_id, entity, &options).unwrap();
        assert!(!summary.validation_report.is_valid());
        assert_eq!(summary.persisted_count, 0);
        assert_eq!(p.status(file_id).unwrap().pending, 2);

        let summary = p.normalize(file_id, entity, &forced()).unwrap();
        assert_eq!(summary.persisted_count, 2);
        let counts = p.status(file_id).unwrap();
        assert_eq!(counts.success, 2);
        assert_eq!(counts.pending, 0);
    }

    #[test]
    fn test_success_rows_are_never_rewritten() {
        let (_dir, p) = pipeline();
        let entity = Uuid::new_v4();
        let file_id = p.submit(KONTEN.as_bytes(), "tb.csv", entity).unwrap();
        p.normalize(file_id, entity, &forced()).unwrap();
        let again = p.normalize(file_id, entity, &forced()).unwrap();
        assert_eq!(again.normalized_count, 0);
        assert_eq!(again.persisted_count, 0);
        assert_eq!(p.status(file_id).unwrap().success, 2);
        assert_eq!(p.store().runs_for_file(file_id).unwrap().len(), 2);
    }

    #[test]
    fn test_duplicate_hash_is_skipped() {
        let (_dir, p) = pipeline();
        let entity = Uuid::new_v4();
        let csv = "Konto;Bezeichnung;Saldo\n1000;Kasse;100,00\n1000;Kasse;100,00\n";
        let file_id = p.submit(csv.as_bytes(), "tb.csv", entity).unwrap();
        let summary = p.normalize(file_id, entity, &forced()).unwrap();
        assert_eq!(summary.persisted_count, 1);
        assert_eq!(summary.skipped_count, 1);
        let counts = p.status(file_id).unwrap();
        assert_eq!(counts.success, 1);
        assert_eq!(counts.skipped, 1);
        assert_eq!(
            summary
                .validation_report
                .warnings_of(crate::validator::IssueKind::DuplicateCombination)
                .count(),
            1
        );
    }

    #[test]
    fn test_rows_without_account_are_skipped() {
        let (_dir, p) = pipeline();
        let entity = Uuid::new_v4();
        let csv = "Konto;Bezeichnung;Saldo\n1000;Kasse;100,00\n;Summe Aktiva;100,00\n";
        let file_id = p.submit(csv.as_bytes(), "tb.csv", entity).unwrap();
        let summary = p.normalize(file_id, entity, &forced()).unwrap();
        assert_eq!(summary.normalized_count, 1);
        assert_eq!(summary.skipped_count, 1);
    }

    #[test]
    fn test_failed_row_then_retry() {
        let (_dir, p) = pipeline();
        let entity = Uuid::new_v4();
        let csv = "Konto;Bezeichnung;Saldo\n1000;Kasse;100,00\n1600;Bank;n/a\n";
        let file_id = p.submit(csv.as_bytes(), "tb.csv", entity).unwrap();
        let summary = p.normalize(file_id, entity, &forced()).unwrap();
        assert_eq!(summary.failed_count, 1);
        assert_eq!(summary.quality.row_failures.len(), 1);
        assert!(summary.quality.row_failures[0].reason.contains("n/a"));
        assert_eq!(summary.quality.completeness_pct, 50.0);

        let file = p.store().get_raw_file(file_id).unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Parsed);

        // Same raw row, same result: the failure is reproduced, nothing else touched.
        let retried = p.retry(file_id).unwrap();
        assert_eq!(retried.failed_count, 1);
        assert_eq!(retried.normalized_count, 0);
        let counts = p.status(file_id).unwrap();
        assert_eq!(counts.success, 1);
        assert_eq!(counts.failed, 1);

        let runs = p.store().runs_for_file(file_id).unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs[1].is_retry);
        assert_eq!(runs[1].options.period, Period::new(2023, 12));
    }

    #[test]
    fn test_retry_without_failures_is_noop() {
        let (_dir, p) = pipeline();
        let entity = Uuid::new_v4();
        let file_id = p.submit(KONTEN.as_bytes(), "tb.csv", entity).unwrap();
        p.normalize(file_id, entity, &forced()).unwrap();
        let summary = p.retry(file_id).unwrap();
        assert!(summary.run_id.is_none());
        assert_eq!(summary.normalized_count, 0);
    }

    #[test]
    fn test_custom_mapping_overrides_patterns() {
        let (_dir, p) = pipeline();
        let entity = Uuid::new_v4();
        let csv = "Konto;Bezeichnung;Soll;Saldo\n1000;Kasse;1,00;250,00\n";
        let file_id = p.submit(csv.as_bytes(), "tb.csv", entity).unwrap();
        let mut options = forced();
        options.custom_mapping.insert(ColumnRole::Amount, "Saldo".to_string());
        p.normalize(file_id, entity, &options).unwrap();
        let rows = success_rows(&p, file_id);
        assert_eq!(rows[0].amount, Some(dec!(250.00)));
    }

    #[test]
    fn test_entity_mismatch_rejected() {
        let (_dir, p) = pipeline();
        let file_id = p.submit(KONTEN.as_bytes(), "tb.csv", Uuid::new_v4()).unwrap();
        assert!(p.normalize(file_id, Uuid::new_v4(), &forced()).is_err());
    }

    #[test]
    fn test_advisory_suggestion_persisted_as_hint() {
        let (_dir, store) = test_store();
        let mut mapping = BTreeMap::new();
        mapping.insert("Nr".to_string(), ColumnRole::AccountNumber);
        mapping.insert("Text".to_string(), ColumnRole::Description);
        mapping.insert("Wert".to_string(), ColumnRole::Amount);
        let advisor = StaticAdvisor {
            columns: Some(ColumnSuggestion {
                mapping,
                confidence: 0.9,
                recommendations: vec![],
            }),
            descriptions: BTreeMap::new(),
        };
        let p = Pipeline::new(store, Settings::default()).with_advisor(Box::new(advisor));
        let entity = Uuid::new_v4();
        let csv = "Nr;Text;Wert\n1000;Kasse;10,00\n1200;Forderungen;20,00\n";
        let file_id = p.submit(csv.as_bytes(), "tb.csv", entity).unwrap();
        p.normalize(file_id, entity, &forced()).unwrap();

        let rows = success_rows(&p, file_id);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].description.as_deref(), Some("Forderungen"));
        assert_eq!(rows[1].amount, Some(dec!(20.00)));
        let file = p.store().get_raw_file(file_id).unwrap().unwrap();
        assert!(file.advisory_hints.column_suggestions.contains_key("Sheet1"));
    }

    struct FailingAdvisor;

    impl Advisor for FailingAdvisor {
        fn resolve_columns(
            &self,
            _headers: &[String],
            _sample: &[Vec<String>],
            timeout: Duration,
        ) -> std::result::Result<ColumnSuggestion, AdvisoryError> {
            Err(AdvisoryError::Timeout(timeout))
        }

        fn infer_descriptions(
            &self,
            _accounts: &[String],
            timeout: Duration,
        ) -> std::result::Result<BTreeMap<String, String>, AdvisoryError> {
            Err(AdvisoryError::Timeout(timeout))
        }
    }

    #[test]
    fn test_advisor_failure_falls_back_to_patterns() {
        let (_dir, store) = test_store();
        let p = Pipeline::new(store, Settings::default()).with_advisor(Box::new(FailingAdvisor));
        let entity = Uuid::new_v4();
        let file_id = p.submit(KONTEN.as_bytes(), "tb.csv", entity).unwrap();
        let summary = p.normalize(file_id, entity, &forced()).unwrap();
        assert_eq!(summary.persisted_count, 2);
        assert_eq!(success_rows(&p, file_id)[0].extraction_confidence, 1.0);
    }

    #[test]
    fn test_descriptions_inferred_once() {
        let (_dir, store) = test_store();
        let mut descriptions = BTreeMap::new();
        descriptions.insert("1000".to_string(), "Kasse".to_string());
        let advisor = StaticAdvisor {
            columns: None,
            descriptions,
        };
        let p = Pipeline::new(store, Settings::default()).with_advisor(Box::new(advisor));
        let entity = Uuid::new_v4();
        let csv = "Konto;Saldo\n1000;10,00\n1600;20,00\n";
        let file_id = p.submit(csv.as_bytes(), "tb.csv", entity).unwrap();
        p.normalize(file_id, entity, &forced()).unwrap();

        let rows = p.store().normalized_rows_for_file(file_id).unwrap();
        assert_eq!(rows[0].description.as_deref(), Some("Kasse"));
        assert_eq!(rows[1].description, None);
        let hints = p.store().get_raw_file(file_id).unwrap().unwrap().advisory_hints;
        assert_eq!(hints.inference_attempted, vec!["1000".to_string(), "1600".to_string()]);
    }

    struct FixedPages(Vec<Page>);

    impl DocumentReader for FixedPages {
        fn read_pages(&self, _bytes: &[u8]) -> Result<Vec<Page>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_pdf_text_fallback() {
        let (_dir, store) = test_store();
        let page = Page {
            number: 1,
            elements: vec![PageElement::Text(
                "Summen und Saldenliste\n1000 Kasse\n1200 Bank Girokonto\n".to_string(),
            )],
        };
        let p = Pipeline::new(store, Settings::default()).with_reader(Box::new(FixedPages(vec![page])));
        let entity = Uuid::new_v4();
        let mut pdf = b"%PDF-1.4\n".to_vec();
        pdf.resize(200, b' ');
        let file_id = p.submit(&pdf, "liste.pdf", entity).unwrap();

        let file = p.store().get_raw_file(file_id).unwrap().unwrap();
        assert_eq!(file.kind, FileKind::Pdf);
        assert_eq!(file.primary_sheet, None);

        let summary = p.normalize(file_id, entity, &forced()).unwrap();
        assert_eq!(summary.normalized_count, 2);
        let rows = p.store().normalized_rows_for_file(file_id).unwrap();
        assert_eq!(rows[0].account_number, "1000");
        assert_eq!(rows[1].description.as_deref(), Some("Bank Girokonto"));
    }

    #[test]
    fn test_submit_many_dedups_identical_files() {
        let (_dir, p) = pipeline();
        let entity = Uuid::new_v4();
        let files = vec![
            ("tb.csv".to_string(), KONTEN.as_bytes().to_vec()),
            ("tb.csv".to_string(), KONTEN.as_bytes().to_vec()),
            ("tb.csv".to_string(), KONTEN.as_bytes().to_vec()),
        ];
        let ids: Vec<Uuid> = p.submit_many(&files, entity).into_iter().map(|r| r.unwrap()).collect();
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(p.store().list_raw_files().unwrap().len(), 1);
        assert_eq!(p.store().get_raw_file(ids[0]).unwrap().unwrap().status, FileStatus::Parsed);
    }

    #[test]
    fn test_submit_many_isolates_failures() {
        let (_dir, p) = pipeline();
        let files = vec![
            ("a.csv".to_string(), KONTEN.as_bytes().to_vec()),
            ("b.png".to_string(), vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]),
        ];
        let results = p.submit_many(&files, Uuid::new_v4());
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}
