use anyhow::anyhow;
use comfy_table::{Cell, CellAlignment, Table};
use uuid::Uuid;

use tbingest::fmt::money_opt;
use tbingest::models::RowStatus;

use super::{open_pipeline, row_status_label};

pub fn run(file_id: Uuid, status: &Option<String>) -> anyhow::Result<()> {
    let status = match status {
        Some(s) => Some(RowStatus::parse(s).ok_or_else(|| anyhow!("unknown row status {s:?}"))?),
        None => None,
    };

    let pipeline = open_pipeline()?;
    pipeline.status(file_id)?;
    let store = pipeline.store();
    let rows = match status {
        Some(s) => store.normalized_rows_by_status(Some(file_id), s)?,
        None => store.normalized_rows_for_file(file_id)?,
    };
    if rows.is_empty() {
        println!("No normalized rows.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec![
        "Sheet", "Row", "Account", "Type", "Description", "Amount", "Period", "Conf.", "Status", "Reason",
    ]);
    for row in &rows {
        table.add_row(vec![
            Cell::new(&row.sheet),
            Cell::new(row.row_number),
            Cell::new(&row.account_number),
            Cell::new(row.account_type.as_str()),
            Cell::new(row.description.as_deref().unwrap_or("")),
            Cell::new(money_opt(row.amount, &row.currency_code)).set_alignment(CellAlignment::Right),
            Cell::new(row.period_key),
            Cell::new(format!("{:.1}", row.extraction_confidence)),
            Cell::new(row_status_label(row.status)),
            Cell::new(row.failure_reason.as_deref().unwrap_or("")),
        ]);
    }
    println!("{table}");
    Ok(())
}
