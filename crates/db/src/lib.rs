mod delivery_orders;
mod platforms;

use sqlx::{migrate::Migrator, MySql, MySqlPool, Pool};
use std::path::Path;

pub type DbPool = MySqlPool;

pub use delivery_orders::*;
pub use platforms::*;

pub async fn connect(database_url: &str) -> Result<DbPool, sqlx::Error> {
    Pool::<MySql>::connect(database_url).await
}

/// Run migrations from the workspace `migrations/` directory.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    // migrations/ is at workspace root: crates/db -> ../../migrations
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| ".".into());
    let migrations_path = Path::new(&manifest_dir).join("../../migrations");
    let migrator = Migrator::new(migrations_path).await?;
    migrator.run(pool).await?;
    Ok(())
}
