use comfy_table::{Cell, Table};

use tbingest::fmt::format_bytes;

use super::{file_status_label, open_pipeline};

pub fn run() -> anyhow::Result<()> {
    let pipeline = open_pipeline()?;
    let store = pipeline.store();
    let files = store.list_raw_files()?;
    if files.is_empty() {
        println!("No files captured yet. Use `tbingest submit <file> --entity <id>`.");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["ID", "Filename", "Kind", "Size", "Status", "Uploaded", "Rows"]);
    for file in files {
        let counts = store.status_counts(file.id)?;
        table.add_row(vec![
            Cell::new(file.id),
            Cell::new(&file.filename),
            Cell::new(file.kind.key()),
            Cell::new(format_bytes(file.size_bytes)),
            Cell::new(file_status_label(file.status)),
            Cell::new(file.uploaded_at.format("%Y-%m-%d %H:%M")),
            Cell::new(format!("{}/{}", counts.success, counts.total())),
        ]);
    }
    println!("Files\n{table}");
    Ok(())
}
