use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{IngestError, Result};
use crate::models::{
    check_row_transition, AccountType, AdvisoryHints, FileKind, FileStatus, NormalizeOptions,
    NormalizedRow, RawFile, RawRow, RowStatus, StatusCounts,
};
use crate::validator::{QualityReport, ValidationReport};

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS raw_files (
    id TEXT PRIMARY KEY,
    entity_id TEXT NOT NULL,
    filename TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    kind TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'uploaded',
    primary_sheet TEXT,
    uploaded_at TEXT NOT NULL,
    error_message TEXT,
    advisory_hints TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_raw_files_hash ON raw_files(entity_id, content_hash);
CREATE UNIQUE INDEX IF NOT EXISTS idx_raw_files_live
    ON raw_files(entity_id, content_hash, filename) WHERE status != 'error';

CREATE TABLE IF NOT EXISTS raw_rows (
    id TEXT PRIMARY KEY,
    file_id TEXT NOT NULL,
    sheet TEXT NOT NULL,
    sheet_index INTEGER NOT NULL,
    row_number INTEGER NOT NULL,
    cells TEXT NOT NULL,
    is_header INTEGER NOT NULL DEFAULT 0,
    UNIQUE (file_id, sheet, row_number),
    FOREIGN KEY (file_id) REFERENCES raw_files(id)
);

CREATE TABLE IF NOT EXISTS normalized_rows (
    id TEXT PRIMARY KEY,
    file_id TEXT NOT NULL,
    raw_row_id TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    sheet TEXT NOT NULL,
    row_number INTEGER NOT NULL,
    account_number TEXT NOT NULL,
    description TEXT,
    account_type TEXT NOT NULL,
    amount TEXT,
    currency_code TEXT NOT NULL,
    period_key INTEGER NOT NULL,
    period_start TEXT NOT NULL,
    period_end TEXT NOT NULL,
    as_of_date TEXT NOT NULL,
    source_hash TEXT NOT NULL,
    extraction_confidence REAL NOT NULL,
    status TEXT NOT NULL,
    failure_reason TEXT,
    updated_at TEXT DEFAULT (datetime('now')),
    FOREIGN KEY (file_id) REFERENCES raw_files(id),
    FOREIGN KEY (raw_row_id) REFERENCES raw_rows(id)
);

CREATE INDEX IF NOT EXISTS idx_normalized_hash ON normalized_rows(source_hash, status);
CREATE INDEX IF NOT EXISTS idx_normalized_file ON normalized_rows(file_id, status);

CREATE TABLE IF NOT EXISTS normalization_runs (
    id TEXT PRIMARY KEY,
    file_id TEXT NOT NULL,
    started_at TEXT NOT NULL,
    is_retry INTEGER NOT NULL DEFAULT 0,
    options TEXT NOT NULL,
    normalized_count INTEGER NOT NULL,
    failed_count INTEGER NOT NULL,
    skipped_count INTEGER NOT NULL,
    persisted_count INTEGER NOT NULL,
    score INTEGER NOT NULL,
    report TEXT NOT NULL,
    quality TEXT NOT NULL,
    FOREIGN KEY (file_id) REFERENCES raw_files(id)
);
";

pub fn get_connection(db_path: &Path) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// One recorded pass of the normalization phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationRun {
    pub id: Uuid,
    pub file_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub is_retry: bool,
    pub options: NormalizeOptions,
    pub normalized_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub persisted_count: usize,
    pub report: ValidationReport,
    pub quality: QualityReport,
}

/// Durable home for raw captures, normalized rows and run history.
///
/// Writes are keyed by stable ids so repeating any of them is harmless.
pub trait RecordStore: Send + Sync {
    /// Stores `file` unless a non-errored file with the same entity, content
    /// hash and filename exists; returns whichever record is now on file.
    /// Lookup and insert happen in one transaction.
    fn claim_raw_file(&self, file: &RawFile) -> Result<RawFile>;
    fn get_raw_file(&self, id: Uuid) -> Result<Option<RawFile>>;
    fn list_raw_files(&self) -> Result<Vec<RawFile>>;
    fn set_file_status(&self, id: Uuid, status: FileStatus, error: Option<&str>) -> Result<()>;
    fn set_advisory_hints(&self, id: Uuid, hints: &AdvisoryHints) -> Result<()>;

    /// Returns how many rows were new.
    fn insert_raw_rows(&self, rows: &[RawRow]) -> Result<usize>;
    /// Ordered by sheet position, then row number.
    fn raw_rows_for_file(&self, file_id: Uuid) -> Result<Vec<RawRow>>;

    fn get_normalized_row(&self, id: Uuid) -> Result<Option<NormalizedRow>>;
    /// Rejects illegal status transitions against the stored row.
    fn upsert_normalized_row(&self, row: &NormalizedRow) -> Result<()>;
    fn normalized_rows_for_file(&self, file_id: Uuid) -> Result<Vec<NormalizedRow>>;
    fn normalized_rows_by_status(&self, file_id: Option<Uuid>, status: RowStatus) -> Result<Vec<NormalizedRow>>;
    fn find_success_by_hash(&self, source_hash: &str) -> Result<Option<NormalizedRow>>;
    fn status_counts(&self, file_id: Uuid) -> Result<StatusCounts>;

    fn record_run(&self, run: &NormalizationRun) -> Result<()>;
    fn runs_for_file(&self, file_id: Uuid) -> Result<Vec<NormalizationRun>>;
}

// ---------------------------------------------------------------------------
// Column conversions
// ---------------------------------------------------------------------------

fn bad_value(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, msg)),
    )
}

fn uuid_at(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Uuid> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s).map_err(|e| bad_value(idx, e.to_string()))
}

fn date_at(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<NaiveDate> {
    let s: String = row.get(idx)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| bad_value(idx, e.to_string()))
}

fn timestamp_at(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| bad_value(idx, e.to_string()))
}

fn json_at<T: serde::de::DeserializeOwned>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| bad_value(idx, e.to_string()))
}

const RAW_FILE_COLUMNS: &str = "id, entity_id, filename, size_bytes, content_hash, kind, status, \
     primary_sheet, uploaded_at, error_message, advisory_hints";

fn map_raw_file(row: &rusqlite::Row) -> rusqlite::Result<RawFile> {
    let kind: String = row.get(5)?;
    let status: String = row.get(6)?;
    Ok(RawFile {
        id: uuid_at(row, 0)?,
        entity_id: uuid_at(row, 1)?,
        filename: row.get(2)?,
        size_bytes: row.get::<_, i64>(3)? as u64,
        content_hash: row.get(4)?,
        kind: FileKind::from_key(&kind).ok_or_else(|| bad_value(5, format!("unknown kind {kind}")))?,
        status: FileStatus::parse(&status).ok_or_else(|| bad_value(6, format!("unknown status {status}")))?,
        primary_sheet: row.get(7)?,
        uploaded_at: timestamp_at(row, 8)?,
        error_message: row.get(9)?,
        advisory_hints: json_at(row, 10)?,
    })
}

const RAW_ROW_COLUMNS: &str = "id, file_id, sheet, sheet_index, row_number, cells, is_header";

fn map_raw_row(row: &rusqlite::Row) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: uuid_at(row, 0)?,
        file_id: uuid_at(row, 1)?,
        sheet: row.get(2)?,
        sheet_index: row.get::<_, i64>(3)? as usize,
        row_number: row.get::<_, i64>(4)? as usize,
        cells: json_at(row, 5)?,
        is_header: row.get(6)?,
    })
}

const NORMALIZED_COLUMNS: &str = "id, file_id, raw_row_id, entity_id, sheet, row_number, \
     account_number, description, account_type, amount, currency_code, period_key, period_start, \
     period_end, as_of_date, source_hash, extraction_confidence, status, failure_reason";

fn map_normalized(row: &rusqlite::Row) -> rusqlite::Result<NormalizedRow> {
    let account_type: String = row.get(8)?;
    let amount: Option<String> = row.get(9)?;
    let status: String = row.get(17)?;
    Ok(NormalizedRow {
        id: uuid_at(row, 0)?,
        file_id: uuid_at(row, 1)?,
        raw_row_id: uuid_at(row, 2)?,
        entity_id: uuid_at(row, 3)?,
        sheet: row.get(4)?,
        row_number: row.get::<_, i64>(5)? as usize,
        account_number: row.get(6)?,
        description: row.get(7)?,
        account_type: AccountType::parse(&account_type),
        amount: amount
            .map(|a| Decimal::from_str(&a).map_err(|e| bad_value(9, e.to_string())))
            .transpose()?,
        currency_code: row.get(10)?,
        period_key: row.get(11)?,
        period_start: date_at(row, 12)?,
        period_end: date_at(row, 13)?,
        as_of_date: date_at(row, 14)?,
        source_hash: row.get(15)?,
        extraction_confidence: row.get(16)?,
        status: RowStatus::parse(&status).ok_or_else(|| bad_value(17, format!("unknown status {status}")))?,
        failure_reason: row.get(18)?,
    })
}

fn map_run(row: &rusqlite::Row) -> rusqlite::Result<NormalizationRun> {
    Ok(NormalizationRun {
        id: uuid_at(row, 0)?,
        file_id: uuid_at(row, 1)?,
        started_at: timestamp_at(row, 2)?,
        is_retry: row.get(3)?,
        options: json_at(row, 4)?,
        normalized_count: row.get::<_, i64>(5)? as usize,
        failed_count: row.get::<_, i64>(6)? as usize,
        skipped_count: row.get::<_, i64>(7)? as usize,
        persisted_count: row.get::<_, i64>(8)? as usize,
        report: json_at(row, 9)?,
        quality: json_at(row, 10)?,
    })
}

/// Fixed-width so text order is time order.
fn timestamp_str(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn date_str(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = get_connection(db_path)?;
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| IngestError::Other("record store lock poisoned".to_string()))
    }
}

fn find_live_file(conn: &Connection, entity_id: Uuid, content_hash: &str, filename: &str) -> Result<Option<RawFile>> {
    let file = conn
        .query_row(
            &format!(
                "SELECT {RAW_FILE_COLUMNS} FROM raw_files
                 WHERE entity_id = ?1 AND content_hash = ?2 AND filename = ?3 AND status != 'error'
                 ORDER BY uploaded_at LIMIT 1"
            ),
            rusqlite::params![entity_id.to_string(), content_hash, filename],
            map_raw_file,
        )
        .optional()?;
    Ok(file)
}

impl RecordStore for SqliteStore {
    fn claim_raw_file(&self, file: &RawFile) -> Result<RawFile> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        if let Some(existing) = find_live_file(&tx, file.entity_id, &file.content_hash, &file.filename)? {
            return Ok(existing);
        }
        tx.execute(
            &format!("INSERT INTO raw_files ({RAW_FILE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
            rusqlite::params![
                file.id.to_string(),
                file.entity_id.to_string(),
                file.filename,
                file.size_bytes as i64,
                file.content_hash,
                file.kind.key(),
                file.status.as_str(),
                file.primary_sheet,
                timestamp_str(file.uploaded_at),
                file.error_message,
                serde_json::to_string(&file.advisory_hints)?,
            ],
        )?;
        tx.commit()?;
        Ok(file.clone())
    }

    fn get_raw_file(&self, id: Uuid) -> Result<Option<RawFile>> {
        let conn = self.conn()?;
        let file = conn
            .query_row(
                &format!("SELECT {RAW_FILE_COLUMNS} FROM raw_files WHERE id = ?1"),
                [id.to_string()],
                map_raw_file,
            )
            .optional()?;
        Ok(file)
    }

    fn list_raw_files(&self) -> Result<Vec<RawFile>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RAW_FILE_COLUMNS} FROM raw_files ORDER BY uploaded_at DESC"
        ))?;
        let files = stmt
            .query_map([], map_raw_file)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(files)
    }

    fn set_file_status(&self, id: Uuid, status: FileStatus, error: Option<&str>) -> Result<()> {
        let conn = self.conn()?;
        let current: Option<String> = conn
            .query_row("SELECT status FROM raw_files WHERE id = ?1", [id.to_string()], |r| r.get(0))
            .optional()?;
        let current = current.ok_or(IngestError::UnknownFile(id))?;
        let current = FileStatus::parse(&current)
            .ok_or_else(|| IngestError::Other(format!("stored file status {current} is invalid")))?;
        if current == status {
            return Ok(());
        }
        if !current.can_transition_to(status) {
            return Err(IngestError::InvalidState {
                entity: format!("file {id}"),
                from: current.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }
        conn.execute(
            "UPDATE raw_files SET status = ?1, error_message = COALESCE(?2, error_message) WHERE id = ?3",
            rusqlite::params![status.as_str(), error, id.to_string()],
        )?;
        Ok(())
    }

    fn set_advisory_hints(&self, id: Uuid, hints: &AdvisoryHints) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE raw_files SET advisory_hints = ?1 WHERE id = ?2",
            rusqlite::params![serde_json::to_string(hints)?, id.to_string()],
        )?;
        if updated == 0 {
            return Err(IngestError::UnknownFile(id));
        }
        Ok(())
    }

    fn insert_raw_rows(&self, rows: &[RawRow]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare_cached(&format!(
                "INSERT OR IGNORE INTO raw_rows ({RAW_ROW_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ))?;
            for row in rows {
                inserted += stmt.execute(rusqlite::params![
                    row.id.to_string(),
                    row.file_id.to_string(),
                    row.sheet,
                    row.sheet_index as i64,
                    row.row_number as i64,
                    serde_json::to_string(&row.cells)?,
                    row.is_header,
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn raw_rows_for_file(&self, file_id: Uuid) -> Result<Vec<RawRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RAW_ROW_COLUMNS} FROM raw_rows WHERE file_id = ?1 ORDER BY sheet_index, row_number"
        ))?;
        let rows = stmt
            .query_map([file_id.to_string()], map_raw_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn get_normalized_row(&self, id: Uuid) -> Result<Option<NormalizedRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {NORMALIZED_COLUMNS} FROM normalized_rows WHERE id = ?1"),
                [id.to_string()],
                map_normalized,
            )
            .optional()?;
        Ok(row)
    }

    fn upsert_normalized_row(&self, row: &NormalizedRow) -> Result<()> {
        let conn = self.conn()?;
        let current: Option<String> = conn
            .query_row(
                "SELECT status FROM normalized_rows WHERE id = ?1",
                [row.id.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        if let Some(current) = current.as_deref().and_then(RowStatus::parse) {
            check_row_transition(current, row.status)?;
        }
        conn.execute(
            &format!(
                "INSERT INTO normalized_rows ({NORMALIZED_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
                 ON CONFLICT(id) DO UPDATE SET
                    account_number = excluded.account_number,
                    description = excluded.description,
                    account_type = excluded.account_type,
                    amount = excluded.amount,
                    currency_code = excluded.currency_code,
                    period_key = excluded.period_key,
                    period_start = excluded.period_start,
                    period_end = excluded.period_end,
                    as_of_date = excluded.as_of_date,
                    source_hash = excluded.source_hash,
                    extraction_confidence = excluded.extraction_confidence,
                    status = excluded.status,
                    failure_reason = excluded.failure_reason,
                    updated_at = datetime('now')"
            ),
            rusqlite::params![
                row.id.to_string(),
                row.file_id.to_string(),
                row.raw_row_id.to_string(),
                row.entity_id.to_string(),
                row.sheet,
                row.row_number as i64,
                row.account_number,
                row.description,
                row.account_type.as_str(),
                row.amount.map(|a| a.to_string()),
                row.currency_code,
                row.period_key,
                date_str(row.period_start),
                date_str(row.period_end),
                date_str(row.as_of_date),
                row.source_hash,
                row.extraction_confidence,
                row.status.as_str(),
                row.failure_reason,
            ],
        )?;
        Ok(())
    }

    fn normalized_rows_for_file(&self, file_id: Uuid) -> Result<Vec<NormalizedRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NORMALIZED_COLUMNS} FROM normalized_rows
             WHERE file_id = ?1
             ORDER BY (SELECT sheet_index FROM raw_rows r WHERE r.id = raw_row_id), row_number"
        ))?;
        let rows = stmt
            .query_map([file_id.to_string()], map_normalized)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn normalized_rows_by_status(&self, file_id: Option<Uuid>, status: RowStatus) -> Result<Vec<NormalizedRow>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NORMALIZED_COLUMNS} FROM normalized_rows
             WHERE status = ?1 AND (?2 IS NULL OR file_id = ?2)
             ORDER BY file_id, sheet, row_number"
        ))?;
        let rows = stmt
            .query_map(
                rusqlite::params![status.as_str(), file_id.map(|f| f.to_string())],
                map_normalized,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn find_success_by_hash(&self, source_hash: &str) -> Result<Option<NormalizedRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {NORMALIZED_COLUMNS} FROM normalized_rows
                     WHERE source_hash = ?1 AND status = 'success' LIMIT 1"
                ),
                [source_hash],
                map_normalized,
            )
            .optional()?;
        Ok(row)
    }

    fn status_counts(&self, file_id: Uuid) -> Result<StatusCounts> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT status, count(*) FROM normalized_rows WHERE file_id = ?1 GROUP BY status")?;
        let mut counts = StatusCounts::default();
        let grouped = stmt
            .query_map([file_id.to_string()], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for (status, n) in grouped {
            if let Some(status) = RowStatus::parse(&status) {
                counts.add(status, n as usize);
            }
        }
        Ok(counts)
    }

    fn record_run(&self, run: &NormalizationRun) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO normalization_runs (id, file_id, started_at, is_retry, options,
                normalized_count, failed_count, skipped_count, persisted_count, score, report, quality)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            rusqlite::params![
                run.id.to_string(),
                run.file_id.to_string(),
                timestamp_str(run.started_at),
                run.is_retry,
                serde_json::to_string(&run.options)?,
                run.normalized_count as i64,
                run.failed_count as i64,
                run.skipped_count as i64,
                run.persisted_count as i64,
                run.report.score,
                serde_json::to_string(&run.report)?,
                serde_json::to_string(&run.quality)?,
            ],
        )?;
        Ok(())
    }

    fn runs_for_file(&self, file_id: Uuid) -> Result<Vec<NormalizationRun>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, file_id, started_at, is_retry, options, normalized_count, failed_count,
                    skipped_count, persisted_count, report, quality
             FROM normalization_runs WHERE file_id = ?1 ORDER BY started_at, rowid",
        )?;
        let runs = stmt
            .query_map([file_id.to_string()], map_run)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(runs)
    }
}
