use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;

use crate::error::{StoreError, StoreResult};
use crate::models::{MetricDefinition, PipelineDefinition};
use crate::storage::{MetricCatalog, PipelineCatalog};

/// Pipeline and metric definitions stored as `jsonb` documents
#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn put_pipeline(&self, pipeline: &PipelineDefinition) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO pipeline_definitions (tenant_id, pipeline_id, definition) VALUES ($1, $2, $3) \
             ON CONFLICT (tenant_id, pipeline_id) DO UPDATE \
             SET definition = EXCLUDED.definition, updated_at = now()",
        )
        .bind(&pipeline.tenant_id)
        .bind(&pipeline.id)
        .bind(Json(pipeline))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("put_pipeline", e))?;
        Ok(())
    }

    pub async fn put_metric(&self, metric: &MetricDefinition) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO metric_definitions (tenant_id, name, definition) VALUES ($1, $2, $3) \
             ON CONFLICT (tenant_id, name) DO UPDATE \
             SET definition = EXCLUDED.definition, updated_at = now()",
        )
        .bind(&metric.tenant_id)
        .bind(&metric.name)
        .bind(Json(metric))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database("put_metric", e))?;
        Ok(())
    }
}

#[async_trait]
impl PipelineCatalog for PgCatalog {
    async fn pipeline(&self, tenant_id: &str, pipeline_id: &str) -> StoreResult<Option<PipelineDefinition>> {
        let row: Option<(Json<PipelineDefinition>,)> = sqlx::query_as(
            "SELECT definition FROM pipeline_definitions WHERE tenant_id = $1 AND pipeline_id = $2",
        )
        .bind(tenant_id)
        .bind(pipeline_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::database("pipeline", e))?;
        Ok(row.map(|(Json(definition),)| definition))
    }
}

#[async_trait]
impl MetricCatalog for PgCatalog {
    async fn metrics(&self, tenant_id: &str) -> StoreResult<Vec<MetricDefinition>> {
        let rows: Vec<(Json<MetricDefinition>,)> =
            sqlx::query_as("SELECT definition FROM metric_definitions WHERE tenant_id = $1 ORDER BY name")
                .bind(tenant_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::database("metrics", e))?;
        Ok(rows.into_iter().map(|(Json(definition),)| definition).collect())
    }

    async fn metric(&self, tenant_id: &str, name: &str) -> StoreResult<Option<MetricDefinition>> {
        let row: Option<(Json<MetricDefinition>,)> = sqlx::query_as(
            "SELECT definition FROM metric_definitions WHERE tenant_id = $1 AND name = $2",
        )
        .bind(tenant_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::database("metric", e))?;
        Ok(row.map(|(Json(definition),)| definition))
    }
}
