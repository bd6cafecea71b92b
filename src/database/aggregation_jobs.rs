use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use crate::error::{StoreError, StoreResult};
use crate::models::{AffectedTimeRange, AggregationJob, AggregationJobStatus, GroupQueueEntry};
use crate::storage::AggregationJobRepository;

const JOB_COLUMNS: &str = "id, tenant_id, pipeline_id, group_context_id, time_from, time_to, \
     groups_queue, status, status_message, created_at, updated_at";

#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    tenant_id: String,
    pipeline_id: String,
    group_context_id: String,
    time_from: NaiveDate,
    time_to: NaiveDate,
    groups_queue: Json<Vec<GroupQueueEntry>>,
    status: String,
    status_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for AggregationJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(AggregationJob {
            id: row.id,
            tenant_id: row.tenant_id,
            pipeline_id: row.pipeline_id,
            group_context_id: row.group_context_id,
            time_range: AffectedTimeRange {
                from: row.time_from,
                to: row.time_to,
            },
            groups_queue: row.groups_queue.0,
            status: row
                .status
                .parse::<AggregationJobStatus>()
                .map_err(|message| StoreError::Serialization { message })?,
            status_message: row.status_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgAggregationJobRepository {
    pool: PgPool,
}

impl PgAggregationJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Distinguish "no such job" from "job exists but rejected the write"
    async fn rejection(&self, job_id: &str, action: &str) -> StoreError {
        match self.get(job_id).await {
            Ok(Some(job)) => StoreError::invalid_state(
                "aggregation job",
                job_id,
                format!("cannot {action} a {} job", job.status),
            ),
            Ok(None) => StoreError::not_found("aggregation job", job_id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl AggregationJobRepository for PgAggregationJobRepository {
    async fn create(&self, job: &AggregationJob) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO aggregation_jobs
                (id, tenant_id, pipeline_id, group_context_id, time_from, time_to,
                 groups_queue, status, status_message, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&job.id)
        .bind(&job.tenant_id)
        .bind(&job.pipeline_id)
        .bind(&job.group_context_id)
        .bind(job.time_range.from)
        .bind(job.time_range.to)
        .bind(Json(&job.groups_queue))
        .bind(job.status.as_str())
        .bind(&job.status_message)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("create_aggregation_job", e))?;
        Ok(())
    }

    async fn get(&self, job_id: &str) -> StoreResult<Option<AggregationJob>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM aggregation_jobs WHERE id = $1");
        sqlx::query_as::<_, JobRow>(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::database("get_aggregation_job", e))?
            .map(AggregationJob::try_from)
            .transpose()
    }

    async fn update(&self, job: &AggregationJob) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE aggregation_jobs SET time_from = $2, time_to = $3, groups_queue = $4, updated_at = now() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(&job.id)
        .bind(job.time_range.from)
        .bind(job.time_range.to)
        .bind(Json(&job.groups_queue))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("update_aggregation_job", e))?;
        if result.rows_affected() == 0 {
            return Err(self.rejection(&job.id, "modify").await);
        }
        Ok(())
    }

    async fn set_status(
        &self,
        job_id: &str,
        status: AggregationJobStatus,
        message: Option<String>,
    ) -> StoreResult<AggregationJob> {
        let query = format!(
            "UPDATE aggregation_jobs SET status = $2, status_message = $3, updated_at = now() \
             WHERE id = $1 AND status NOT IN ('succeeded', 'failed') RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(job_id)
            .bind(status.as_str())
            .bind(message)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::database("set_aggregation_job_status", e))?;
        match row {
            Some(row) => row.try_into(),
            None => Err(self.rejection(job_id, "update").await),
        }
    }

    async fn claim(&self, job_id: &str) -> StoreResult<Option<AggregationJob>> {
        let query = format!(
            "UPDATE aggregation_jobs SET status = 'running', updated_at = now() \
             WHERE id = $1 AND status = 'pending' RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::database("claim_aggregation_job", e))?;
        match row {
            Some(row) => Ok(Some(row.try_into()?)),
            None if self.get(job_id).await?.is_some() => Ok(None),
            None => Err(StoreError::not_found("aggregation job", job_id)),
        }
    }

    async fn find_pending(&self, tenant_id: &str, pipeline_id: &str) -> StoreResult<Vec<AggregationJob>> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM aggregation_jobs \
             WHERE tenant_id = $1 AND pipeline_id = $2 AND status = 'pending' ORDER BY created_at"
        );
        sqlx::query_as::<_, JobRow>(&query)
            .bind(tenant_id)
            .bind(pipeline_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::database("find_pending_aggregation_jobs", e))?
            .into_iter()
            .map(AggregationJob::try_from)
            .collect()
    }
}
