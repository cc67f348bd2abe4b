pub mod entities;
pub mod migration;

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Statement};
use std::time::Duration;

/// Opens the single writable handle to the store. Single-writer discipline
/// (spec §5) is enforced by opening exactly one connection pool for the
/// process lifetime and relying on SQLite's own WAL + busy_timeout to
/// serialize writers rather than an in-process mutex.
pub async fn connect(database_url: &str) -> anyhow::Result<DatabaseConnection> {
    let mut opts = ConnectOptions::new(database_url.to_owned());
    opts.max_connections(8)
        .min_connections(1)
        .connect_timeout(Duration::from_secs(10))
        .sqlx_logging(false);

    let db = Database::connect(opts).await?;

    for pragma in [
        "PRAGMA journal_mode=WAL",
        "PRAGMA busy_timeout=5000",
        "PRAGMA foreign_keys=ON",
    ] {
        db.execute(Statement::from_string(db.get_database_backend(), pragma))
            .await?;
    }

    tracing::info!("Connected to store at {}", database_url);
    Ok(db)
}
