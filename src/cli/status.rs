use uuid::Uuid;

use tbingest::fmt::format_bytes;

use super::{file_status_label, open_pipeline};

pub fn run(file_id: Uuid) -> anyhow::Result<()> {
    let pipeline = open_pipeline()?;
    let counts = pipeline.status(file_id)?;
    let store = pipeline.store();
    let file = store
        .get_raw_file(file_id)?
        .ok_or(tbingest::error::IngestError::UnknownFile(file_id))?;

    println!("File:       {}", file.filename);
    println!("Kind:       {}", file.kind.key());
    println!("Size:       {}", format_bytes(file.size_bytes));
    println!("Status:     {}", file_status_label(file.status));
    println!("Entity:     {}", file.entity_id);
    println!("Sheet:      {}", file.primary_sheet.as_deref().unwrap_or("(all tables)"));
    if let Some(err) = &file.error_message {
        println!("Error:      {err}");
    }

    println!();
    println!("Pending:    {}", counts.pending);
    println!("Success:    {}", counts.success);
    println!("Failed:     {}", counts.failed);
    println!("Skipped:    {}", counts.skipped);

    let runs = store.runs_for_file(file_id)?;
    if let Some(last) = runs.last() {
        println!();
        println!(
            "Runs:       {} (last {}, score {}, completeness {:.2}%)",
            runs.len(),
            last.started_at.format("%Y-%m-%d %H:%M"),
            last.report.score,
            last.quality.completeness_pct
        );
    }
    Ok(())
}
