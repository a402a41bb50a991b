pub mod files;
pub mod init;
pub mod normalize;
pub mod retry;
pub mod rows;
pub mod status;
pub mod submit;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use colored::{ColoredString, Colorize};
use uuid::Uuid;

use tbingest::advisory::HttpAdvisor;
use tbingest::db::SqliteStore;
use tbingest::models::{ColumnRole, FileStatus, RowStatus};
use tbingest::numeric::{normalize_period, Period};
use tbingest::pipeline::Pipeline;
use tbingest::settings::load_settings;

#[derive(Parser)]
#[command(name = "tbingest", version, about = "Capture and normalize trial-balance exports.")]
pub struct Cli {
    /// Log pipeline detail to stderr
    #[arg(long, short, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Choose a data directory and initialize the database.
    Init {
        /// Path for tbingest data (default: ~/Documents/tbingest)
        #[arg(long = "data-dir")]
        data_dir: Option<String>,
    },
    /// Classify files and capture their rows unchanged.
    Submit {
        /// CSV, XLSX, XLS or PDF files
        #[arg(required = true)]
        files: Vec<String>,
        /// Entity the files belong to
        #[arg(long)]
        entity: Uuid,
    },
    /// Turn a captured file into validated trial-balance rows.
    Normalize {
        /// File id (shown by `tbingest files`)
        file_id: Uuid,
        /// Entity the file belongs to
        #[arg(long)]
        entity: Uuid,
        /// Persist rows even when validation reports errors
        #[arg(long)]
        force: bool,
        /// Column roles as JSON, e.g. '{"amount": "Saldo"}'
        #[arg(long)]
        mapping: Option<String>,
        /// Period for files without a period column: YYYY-MM
        #[arg(long)]
        period: Option<String>,
    },
    /// Show row counts per status for a file.
    Status {
        file_id: Uuid,
    },
    /// Re-run normalization on the failed rows of a file.
    Retry {
        file_id: Uuid,
    },
    /// List captured files.
    Files,
    /// List normalized rows of a file.
    Rows {
        file_id: Uuid,
        /// Only rows in this status: pending, success, failed, skipped
        #[arg(long)]
        status: Option<String>,
    },
    /// Print shell completions.
    Completions {
        shell: clap_complete::Shell,
    },
}

pub(crate) fn open_pipeline() -> anyhow::Result<Pipeline> {
    let settings = load_settings();
    let db_path = settings.db_path();
    if !db_path.exists() {
        bail!(
            "No database found at {}\nRun `tbingest init` to create one.",
            db_path.display()
        );
    }
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("opening {}", db_path.display()))?;
    let mut pipeline = Pipeline::new(Arc::new(store), settings.clone());
    if let Some(advisor) = HttpAdvisor::from_settings(&settings.advisory) {
        pipeline = pipeline.with_advisor(Box::new(advisor));
    }
    Ok(pipeline)
}

pub(crate) fn parse_period_arg(raw: &Option<String>) -> anyhow::Result<Option<Period>> {
    match raw {
        Some(p) => normalize_period(p)
            .map(Some)
            .ok_or_else(|| anyhow!("invalid period {p:?}, expected YYYY-MM")),
        None => Ok(None),
    }
}

/// `{"amount": "Saldo"}` -> role -> header label.
pub(crate) fn parse_mapping_arg(raw: &Option<String>) -> anyhow::Result<BTreeMap<ColumnRole, String>> {
    let Some(raw) = raw else {
        return Ok(BTreeMap::new());
    };
    let entries: BTreeMap<String, String> =
        serde_json::from_str(raw).context("--mapping must be a JSON object of role to header")?;
    entries
        .into_iter()
        .map(|(role, header)| {
            ColumnRole::from_key(&role)
                .filter(|r| *r != ColumnRole::Unknown)
                .map(|r| (r, header))
                .ok_or_else(|| anyhow!("unknown column role {role:?}"))
        })
        .collect()
}

pub(crate) fn row_status_label(status: RowStatus) -> ColoredString {
    match status {
        RowStatus::Pending => status.as_str().yellow(),
        RowStatus::Success => status.as_str().green(),
        RowStatus::Failed => status.as_str().red(),
        RowStatus::Skipped => status.as_str().dimmed(),
    }
}

pub(crate) fn file_status_label(status: FileStatus) -> ColoredString {
    match status {
        FileStatus::Uploaded => status.as_str().yellow(),
        FileStatus::Parsed => status.as_str().cyan(),
        FileStatus::Consumed => status.as_str().green(),
        FileStatus::Error => status.as_str().red(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mapping_arg() {
        let mapping = parse_mapping_arg(&Some(r#"{"amount": "Saldo", "account": "Nr"}"#.to_string())).unwrap();
        assert_eq!(mapping.get(&ColumnRole::Amount).map(String::as_str), Some("Saldo"));
        assert_eq!(mapping.get(&ColumnRole::AccountNumber).map(String::as_str), Some("Nr"));
        assert!(parse_mapping_arg(&None).unwrap().is_empty());
        assert!(parse_mapping_arg(&Some(r#"{"bogus": "x"}"#.to_string())).is_err());
        assert!(parse_mapping_arg(&Some("not json".to_string())).is_err());
    }

    #[test]
    fn test_parse_period_arg() {
        assert_eq!(parse_period_arg(&Some("2023-12".to_string())).unwrap(), Period::new(2023, 12));
        assert_eq!(parse_period_arg(&None).unwrap(), None);
        assert!(parse_period_arg(&Some("13/2023".to_string())).is_err());
    }

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
        let cli = Cli::try_parse_from([
            "tbingest",
            "normalize",
            "00000000-0000-0000-0000-000000000001",
            "--entity",
            "00000000-0000-0000-0000-000000000002",
            "--force",
            "--period",
            "2023-12",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Normalize { force: true, .. }));
    }
}
