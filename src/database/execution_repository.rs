use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::models::{ExecutionTransition, InputReference, PipelineExecution};
use crate::state_machine::{ExecutionStatus, OrchestratorStage};
use crate::storage::ExecutionRepository;

const EXECUTION_COLUMNS: &str = "execution_id, pipeline_id, tenant_id, group_context_id, input_key, \
     status, status_message, audit_version, created_at, updated_at, started_at";

#[derive(Debug, FromRow)]
struct ExecutionRow {
    execution_id: String,
    pipeline_id: String,
    tenant_id: String,
    group_context_id: String,
    input_key: String,
    status: String,
    status_message: Option<String>,
    audit_version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
}

impl TryFrom<ExecutionRow> for PipelineExecution {
    type Error = StoreError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<ExecutionStatus>()
            .map_err(|message| StoreError::Serialization { message })?;
        Ok(PipelineExecution {
            pipeline_id: row.pipeline_id,
            execution_id: row.execution_id,
            tenant_id: row.tenant_id,
            group_context_id: row.group_context_id,
            input: InputReference::new(row.input_key),
            status,
            status_message: row.status_message,
            audit_version: row.audit_version,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct TransitionRow {
    execution_id: String,
    from_stage: Option<String>,
    to_stage: String,
    sort_key: i32,
    most_recent: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransitionRow> for ExecutionTransition {
    type Error = StoreError;

    fn try_from(row: TransitionRow) -> Result<Self, Self::Error> {
        let parse = |s: &str| {
            s.parse::<OrchestratorStage>()
                .map_err(|message| StoreError::Serialization { message })
        };
        Ok(ExecutionTransition {
            execution_id: row.execution_id,
            from_stage: row.from_stage.as_deref().map(parse).transpose()?,
            to_stage: parse(&row.to_stage)?,
            sort_key: row.sort_key,
            most_recent: row.most_recent,
            created_at: row.created_at,
        })
    }
}

/// `pipeline_executions` and `execution_transitions`
#[derive(Debug, Clone)]
pub struct PgExecutionRepository {
    pool: PgPool,
}

impl PgExecutionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn missing(execution_id: &str) -> StoreError {
        StoreError::not_found("pipeline execution", execution_id)
    }
}

#[async_trait]
impl ExecutionRepository for PgExecutionRepository {
    async fn create(&self, execution: &PipelineExecution) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO pipeline_executions
                (execution_id, pipeline_id, tenant_id, group_context_id, input_key,
                 status, status_message, audit_version, created_at, updated_at, started_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (execution_id) DO NOTHING
            "#,
        )
        .bind(&execution.execution_id)
        .bind(&execution.pipeline_id)
        .bind(&execution.tenant_id)
        .bind(&execution.group_context_id)
        .bind(&execution.input.key)
        .bind(execution.status.as_str())
        .bind(&execution.status_message)
        .bind(execution.audit_version)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .bind(execution.started_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("create_execution", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::invalid_state(
                "pipeline execution",
                &execution.execution_id,
                "already exists",
            ));
        }
        Ok(())
    }

    async fn get(&self, execution_id: &str) -> StoreResult<Option<PipelineExecution>> {
        let query = format!("SELECT {EXECUTION_COLUMNS} FROM pipeline_executions WHERE execution_id = $1");
        sqlx::query_as::<_, ExecutionRow>(&query)
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::database("get_execution", e))?
            .map(PipelineExecution::try_from)
            .transpose()
    }

    async fn update_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        message: Option<String>,
    ) -> StoreResult<PipelineExecution> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM pipeline_executions WHERE execution_id = $1 FOR UPDATE")
                .bind(execution_id)
                .fetch_optional(&mut *tx)
                .await?;
        let current = current
            .ok_or_else(|| Self::missing(execution_id))?
            .0
            .parse::<ExecutionStatus>()
            .map_err(|message| StoreError::Serialization { message })?;
        if !current.can_transition_to(status) {
            return Err(StoreError::invalid_state(
                "pipeline execution",
                execution_id,
                format!("{current} -> {status}"),
            ));
        }

        let query = format!(
            "UPDATE pipeline_executions \
             SET status = $2, status_message = COALESCE($3, status_message), \
                 audit_version = audit_version + 1, updated_at = now() \
             WHERE execution_id = $1 RETURNING {EXECUTION_COLUMNS}"
        );
        let row = sqlx::query_as::<_, ExecutionRow>(&query)
            .bind(execution_id)
            .bind(status.as_str())
            .bind(message)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| StoreError::database("update_execution_status", e))?;
        tx.commit().await?;

        debug!(execution_id, from = %current, to = %status, "execution status updated");
        row.try_into()
    }

    async fn amend_status_message(&self, execution_id: &str, message: &str) -> StoreResult<PipelineExecution> {
        let query = format!(
            "UPDATE pipeline_executions SET status_message = $2, updated_at = now() \
             WHERE execution_id = $1 RETURNING {EXECUTION_COLUMNS}"
        );
        sqlx::query_as::<_, ExecutionRow>(&query)
            .bind(execution_id)
            .bind(message)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::database("amend_status_message", e))?
            .ok_or_else(|| Self::missing(execution_id))?
            .try_into()
    }

    async fn claim(&self, execution_id: &str, at: DateTime<Utc>) -> StoreResult<Option<PipelineExecution>> {
        let query = format!(
            "UPDATE pipeline_executions \
             SET status = $3, started_at = COALESCE(started_at, $2), \
                 audit_version = audit_version + 1, updated_at = now() \
             WHERE execution_id = $1 AND status = $4 RETURNING {EXECUTION_COLUMNS}"
        );
        let claimed = sqlx::query_as::<_, ExecutionRow>(&query)
            .bind(execution_id)
            .bind(at)
            .bind(ExecutionStatus::InProgress.as_str())
            .bind(ExecutionStatus::Waiting.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::database("claim_execution", e))?;
        match claimed {
            Some(row) => Ok(Some(row.try_into()?)),
            None if self.get(execution_id).await?.is_some() => Ok(None),
            None => Err(Self::missing(execution_id)),
        }
    }

    async fn record_transition(
        &self,
        execution_id: &str,
        from: Option<OrchestratorStage>,
        to: OrchestratorStage,
    ) -> StoreResult<ExecutionTransition> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE execution_transitions SET most_recent = false \
             WHERE execution_id = $1 AND most_recent",
        )
        .bind(execution_id)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, TransitionRow>(
            r#"
            INSERT INTO execution_transitions (execution_id, sort_key, from_stage, to_stage, most_recent)
            SELECT $1, COALESCE(MAX(sort_key), 0) + 1, $2, $3, true
            FROM execution_transitions WHERE execution_id = $1
            RETURNING execution_id, from_stage, to_stage, sort_key, most_recent, created_at
            "#,
        )
        .bind(execution_id)
        .bind(from.map(|s| s.as_str()))
        .bind(to.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::database("record_transition", e))?;
        tx.commit().await?;
        row.try_into()
    }

    async fn transitions(&self, execution_id: &str) -> StoreResult<Vec<ExecutionTransition>> {
        sqlx::query_as::<_, TransitionRow>(
            "SELECT execution_id, from_stage, to_stage, sort_key, most_recent, created_at \
             FROM execution_transitions WHERE execution_id = $1 ORDER BY sort_key",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::database("transitions", e))?
        .into_iter()
        .map(ExecutionTransition::try_from)
        .collect()
    }
}
