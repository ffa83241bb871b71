use std::error::Error;

use duckdb::Connection;
use log::info;

use siete::db::prod_db::ProdDb;
use siete::secrets::{Credentials, EnvSecretStore};

/// Run this job monthly, a few days after INE publishes the new month.
fn main() -> Result<(), Box<dyn Error>> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();
    let _ = dotenvy::dotenv();

    let credentials = Credentials::load(&EnvSecretStore)?;
    let archive = ProdDb::bcch_unemployment();
    let conn = Connection::open(&archive.duckdb_path)?;
    archive.create_table(&conn)?;

    let outcome = archive.sync(&conn, &credentials)?;
    info!(
        "done: {} new observations, {} skipped",
        outcome.written.len(),
        outcome.skipped
    );

    Ok(())
}
