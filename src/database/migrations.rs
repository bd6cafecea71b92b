//! # Schema Migrations
//!
//! Migrations live in `migrations/` as `YYYYMMDDHHMMSS_description.sql` and
//! are embedded at compile time. `sqlx` serializes concurrent runners with an
//! advisory lock and records applied versions in `_sqlx_migrations`, so
//! calling [`run`] from several processes at startup is safe.

use sqlx::migrate::Migrator;
use sqlx::PgPool;
use tracing::info;

use crate::error::{StoreError, StoreResult};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Apply every pending migration
pub async fn run(pool: &PgPool) -> StoreResult<()> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| StoreError::database("migrate", e))?;
    info!(migrations = MIGRATOR.iter().count(), "schema up to date");
    Ok(())
}
