use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use tracing::{debug, instrument};

use crate::error::{StoreError, StoreResult};
use crate::messaging::{QueuedMessage, WorkMessage, WorkQueue};

#[derive(Debug, FromRow)]
struct MessageRow {
    id: i64,
    queue: String,
    payload: serde_json::Value,
    read_count: i32,
    enqueued_at: DateTime<Utc>,
}

/// Queue backed by `work_queue_messages`. Reads lease rows by pushing
/// `visible_at` forward; concurrent readers skip rows another reader holds.
#[derive(Debug, Clone)]
pub struct PgWorkQueue {
    pool: PgPool,
}

impl PgWorkQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkQueue for PgWorkQueue {
    async fn send(&self, queue: &str, message: &WorkMessage) -> StoreResult<i64> {
        let payload = message.to_json().map_err(|e| StoreError::queue(queue, e))?;
        let (id,): (i64,) =
            sqlx::query_as("INSERT INTO work_queue_messages (queue, payload) VALUES ($1, $2) RETURNING id")
                .bind(queue)
                .bind(payload)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StoreError::queue(queue, e))?;
        debug!(queue, message_id = id, kind = message.kind(), "message enqueued");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn read(
        &self,
        queue: &str,
        visibility_timeout: Duration,
        limit: usize,
    ) -> StoreResult<Vec<QueuedMessage>> {
        let mut rows = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE work_queue_messages m
            SET visible_at = now() + $2::double precision * interval '1 millisecond',
                read_count = m.read_count + 1
            WHERE m.id IN (
                SELECT id FROM work_queue_messages
                WHERE queue = $1 AND visible_at <= now()
                ORDER BY id
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING m.id, m.queue, m.payload, m.read_count, m.enqueued_at
            "#,
        )
        .bind(queue)
        .bind(visibility_timeout.as_millis() as f64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::queue(queue, e))?;
        rows.sort_by_key(|row| row.id);

        rows.into_iter()
            .map(|row| {
                let message: WorkMessage =
                    serde_json::from_value(row.payload).map_err(|e| StoreError::queue(queue, e))?;
                Ok(QueuedMessage {
                    id: row.id,
                    queue: row.queue,
                    message,
                    read_count: row.read_count,
                    enqueued_at: row.enqueued_at,
                })
            })
            .collect()
    }

    async fn delete(&self, queue: &str, message_id: i64) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM work_queue_messages WHERE queue = $1 AND id = $2")
            .bind(queue)
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::queue(queue, e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn depth(&self, queue: &str) -> StoreResult<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM work_queue_messages WHERE queue = $1")
            .bind(queue)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::queue(queue, e))?;
        Ok(count as usize)
    }
}
