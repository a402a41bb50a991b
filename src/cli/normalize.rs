use colored::Colorize;
use comfy_table::{Cell, Table};
use uuid::Uuid;

use tbingest::models::NormalizeOptions;
use tbingest::pipeline::NormalizationSummary;
use tbingest::validator::ValidationIssue;

use super::{open_pipeline, parse_mapping_arg, parse_period_arg};

pub fn run(
    file_id: Uuid,
    entity: Uuid,
    force: bool,
    mapping: &Option<String>,
    period: &Option<String>,
) -> anyhow::Result<()> {
    let options = NormalizeOptions {
        force,
        custom_mapping: parse_mapping_arg(mapping)?,
        period: parse_period_arg(period)?,
    };
    let pipeline = open_pipeline()?;
    let summary = pipeline.normalize(file_id, entity, &options)?;
    print_summary(&summary);
    if !summary.validation_report.is_valid() && !force {
        println!();
        println!("Rows were kept pending. Fix the source or re-run with --force to persist them.");
    }
    Ok(())
}

fn issue_table(title: &str, issues: &[ValidationIssue]) -> Option<String> {
    if issues.is_empty() {
        return None;
    }
    let mut table = Table::new();
    table.set_header(vec!["Check", "Row", "Account", "Message"]);
    for issue in issues {
        table.add_row(vec![
            Cell::new(format!("{:?}", issue.kind)),
            Cell::new(issue.row_number.map(|r| r.to_string()).unwrap_or_default()),
            Cell::new(issue.account.clone().unwrap_or_default()),
            Cell::new(&issue.message),
        ]);
    }
    Some(format!("{title}\n{table}"))
}

pub(crate) fn print_summary(summary: &NormalizationSummary) {
    let report = &summary.validation_report;
    println!(
        "{} normalized, {} persisted, {} failed, {} skipped",
        summary.normalized_count,
        summary.persisted_count,
        summary.failed_count,
        summary.skipped_count
    );

    let score = format!("{}/100", report.score);
    let score = if report.is_valid() { score.green() } else { score.red() };
    println!(
        "Quality score: {score}  completeness {:.2}%  accuracy {}",
        summary.quality.completeness_pct, summary.quality.accuracy_score
    );

    if let Some(table) = issue_table("Errors", &report.errors) {
        println!("\n{table}");
    }
    if let Some(table) = issue_table("Warnings", &report.warnings) {
        println!("\n{table}");
    }

    if !summary.quality.row_failures.is_empty() {
        let mut table = Table::new();
        table.set_header(vec!["Sheet", "Row", "Reason"]);
        for f in &summary.quality.row_failures {
            table.add_row(vec![Cell::new(&f.sheet), Cell::new(f.row_number), Cell::new(&f.reason)]);
        }
        println!("\nFailed rows\n{table}");
    }
}
