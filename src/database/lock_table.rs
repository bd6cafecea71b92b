use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::models::LockRecord;
use crate::storage::{LockAttempt, LockTable};

/// Attempts before giving up on a lock that keeps vanishing between the
/// conditional insert and the read of its holder
const ACQUIRE_ROUNDS: usize = 3;

#[derive(Debug, FromRow)]
struct LockRow {
    name: String,
    holder: String,
    acquired_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl From<LockRow> for LockRecord {
    fn from(row: LockRow) -> Self {
        LockRecord {
            name: row.name,
            holder: row.holder,
            acquired_at: row.acquired_at,
            expires_at: row.expires_at,
        }
    }
}

/// Lock rows in `engine_locks`. A row whose `expires_at` has passed is free
/// for the taking; the current holder extends it with `renew`.
#[derive(Debug, Clone)]
pub struct PgLockTable {
    pool: PgPool,
}

impl PgLockTable {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockTable for PgLockTable {
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<LockAttempt> {
        for _ in 0..ACQUIRE_ROUNDS {
            let acquired = sqlx::query_as::<_, LockRow>(
                r#"
                INSERT INTO engine_locks (name, holder, acquired_at, expires_at)
                VALUES ($1, $2, now(), now() + $3::double precision * interval '1 millisecond')
                ON CONFLICT (name) DO UPDATE
                SET holder = EXCLUDED.holder,
                    acquired_at = EXCLUDED.acquired_at,
                    expires_at = EXCLUDED.expires_at
                WHERE engine_locks.expires_at <= now()
                RETURNING name, holder, acquired_at, expires_at
                "#,
            )
            .bind(name)
            .bind(holder)
            .bind(ttl.as_millis() as f64)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::database("try_acquire_lock", e))?;

            if let Some(row) = acquired {
                debug!(lock = name, holder, "lock row written");
                return Ok(LockAttempt::Acquired(row.into()));
            }
            if let Some(current) = self.current(name).await? {
                return Ok(LockAttempt::Held(current));
            }
        }
        Err(StoreError::database(
            "try_acquire_lock",
            format!("lock '{name}' changed hands {ACQUIRE_ROUNDS} times during acquisition"),
        ))
    }

    async fn renew(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE engine_locks SET expires_at = now() + $3::double precision * interval '1 millisecond' \
             WHERE name = $1 AND holder = $2",
        )
        .bind(name)
        .bind(holder)
        .bind(ttl.as_millis() as f64)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("renew_lock", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn release(&self, name: &str, holder: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM engine_locks WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::database("release_lock", e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn current(&self, name: &str) -> StoreResult<Option<LockRecord>> {
        Ok(sqlx::query_as::<_, LockRow>(
            "SELECT name, holder, acquired_at, expires_at FROM engine_locks WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::database("current_lock", e))?
        .map(LockRecord::from))
    }
}
