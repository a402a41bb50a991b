use std::path::PathBuf;

use tbingest::db::{get_connection, init_db};
use tbingest::settings::{load_settings, save_settings, shellexpand_path};

pub fn run(data_dir: Option<String>) -> anyhow::Result<()> {
    let mut settings = load_settings();
    if let Some(dir) = data_dir {
        settings.data_dir = shellexpand_path(&dir);
    }
    save_settings(&settings)?;

    let resolved = PathBuf::from(&settings.data_dir);
    std::fs::create_dir_all(&resolved)?;

    let conn = get_connection(&settings.db_path())?;
    init_db(&conn)?;

    println!("Initialized tbingest at {}", resolved.display());
    if settings.advisory.enabled {
        println!("Advisory service: {} ({})", settings.advisory.endpoint, settings.advisory.model);
    }
    Ok(())
}
