use uuid::Uuid;

use super::normalize::print_summary;
use super::open_pipeline;

pub fn run(file_id: Uuid) -> anyhow::Result<()> {
    let pipeline = open_pipeline()?;
    let summary = pipeline.retry(file_id)?;
    if summary.run_id.is_none() {
        println!("No failed rows to retry.");
        return Ok(());
    }
    print_summary(&summary);
    Ok(())
}
