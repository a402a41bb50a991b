use std::path::Path;

use anyhow::Context;
use uuid::Uuid;

use super::open_pipeline;

pub fn run(files: &[String], entity: Uuid) -> anyhow::Result<()> {
    let pipeline = open_pipeline()?;

    let mut uploads = Vec::with_capacity(files.len());
    for file in files {
        let path = Path::new(file);
        let bytes = std::fs::read(path).with_context(|| format!("reading {file}"))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| file.clone());
        uploads.push((name, bytes));
    }

    let results = pipeline.submit_many(&uploads, entity);
    let mut failed = 0usize;
    for ((name, _), result) in uploads.iter().zip(results) {
        match result {
            Ok(file_id) => println!("{name}: captured as {file_id}"),
            Err(e) => {
                failed += 1;
                eprintln!("{name}: {e}");
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} files could not be captured", uploads.len());
    }
    Ok(())
}
