use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::{StoreError, StoreResult};

/// Open a connection pool sized by configuration
pub async fn connect(config: &DatabaseConfig) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout())
        .connect(&config.url)
        .await
        .map_err(|e| StoreError::database("connect", e))?;
    info!(max_connections = config.max_connections, "database pool ready");
    Ok(pool)
}

pub async fn health_check(pool: &PgPool) -> StoreResult<bool> {
    let (health,): (i32,) = sqlx::query_as("SELECT 1")
        .fetch_one(pool)
        .await
        .map_err(|e| StoreError::database("health_check", e))?;
    Ok(health == 1)
}
