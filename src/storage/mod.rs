//! # Storage Collaborators
//!
//! Every store the engine talks to is a trait here, with an in-memory
//! implementation in [`memory`] and a PostgreSQL implementation in
//! `crate::database`.
//!
//! - [`ObjectStore`]: input objects, calculation outputs and chunk markers
//! - [`ActivityStore`] / [`StagingSession`]: staging areas and canonical activities
//! - [`MetricStore`]: day aggregation and time-unit rollups
//! - [`ExecutionRepository`], [`AggregationJobRepository`]: lifecycle records
//! - [`PipelineCatalog`], [`MetricCatalog`]: read-only definitions
//! - [`LockTable`]: conditional put/delete with expiry

pub mod hierarchy;
pub mod local_fs;
pub mod memory;
pub mod object_store;

pub use hierarchy::{GroupHierarchy, PathGroupHierarchy};
pub use local_fs::LocalFsObjectStore;
pub use memory::{
    MemoryAggregationJobRepository, MemoryCatalog, MemoryExecutionRepository, MemoryLockTable,
    MemoryRelationalStore,
};
pub use object_store::{
    MemoryObjectStore, ObjectKeys, ObjectMeta, ObjectStore, WritePrecondition, WriteResult,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{StorageBackendKind, StorageConfig};
use crate::error::StoreResult;
use crate::models::{
    ActivityRecord, AffectedTimeRange, AggregatedActivity, AggregationJob, AggregationJobStatus, ExecutionTransition, LockRecord,
    MetricDefinition, MetricValue, PipelineDefinition, PipelineExecution, PipelineInput, TimeUnit,
};
use crate::state_machine::{ExecutionStatus, OrchestratorStage};

/// Build the object store selected by configuration
pub fn object_store_from_config(config: &StorageConfig) -> Arc<dyn ObjectStore> {
    match config.backend {
        StorageBackendKind::Memory => Arc::new(MemoryObjectStore::new()),
        StorageBackendKind::LocalFs => Arc::new(LocalFsObjectStore::new(&config.root)),
    }
}

/// Identity of one chunk's transient staging area
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StagingKey {
    pub pipeline_id: String,
    pub execution_id: String,
    pub sequence: u32,
}

impl StagingKey {
    pub fn new(pipeline_id: impl Into<String>, execution_id: impl Into<String>, sequence: u32) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            execution_id: execution_id.into(),
            sequence,
        }
    }

    /// `activity_{executionId}_{digest}_{sequence}`. The execution id is
    /// restricted to identifier characters; the digest of the raw id keeps
    /// ids that sanitize alike (`E-1`, `e_1`) apart.
    pub fn table_name(&self) -> String {
        format!(
            "{}{}",
            Self::execution_table_prefix(&self.execution_id),
            self.sequence
        )
    }

    /// Prefix shared by every staging table of an execution
    pub fn execution_table_prefix(execution_id: &str) -> String {
        format!(
            "activity_{}_{}_",
            sanitize_identifier(execution_id),
            execution_digest(execution_id)
        )
    }
}

/// 32-bit FNV-1a of the raw id, as eight hex digits
fn execution_digest(execution_id: &str) -> String {
    let hash = execution_id
        .bytes()
        .fold(0x811c_9dc5u32, |h, b| (h ^ u32::from(b)).wrapping_mul(0x0100_0193));
    format!("{hash:08x}")
}

pub(crate) fn sanitize_identifier(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// Row counts produced by one canonical migration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationSummary {
    pub activities_upserted: u64,
    pub number_values: u64,
    pub string_values: u64,
    pub boolean_values: u64,
}

impl MigrationSummary {
    pub fn values_written(&self) -> u64 {
        self.number_values + self.string_values + self.boolean_values
    }
}

/// One chunk's hold on the relational store. Dropping the session releases
/// its connection.
#[async_trait]
pub trait StagingSession: Send {
    async fn create_staging_area(&mut self, key: &StagingKey) -> StoreResult<()>;

    /// Bulk-load an artifact into the staging area. Returns the number of
    /// rows copied; zero rows is `StoreError::ZeroRowsCopied`.
    async fn copy_from_artifact(&mut self, key: &StagingKey, artifact: &[u8]) -> StoreResult<u64>;

    /// Move staged records, then their values, into the canonical store in
    /// one transaction
    async fn migrate(&mut self, key: &StagingKey) -> StoreResult<MigrationSummary>;

    async fn close(self: Box<Self>) -> StoreResult<()>;
}

#[async_trait]
pub trait ActivityStore: Send + Sync {
    async fn open_session(&self) -> StoreResult<Box<dyn StagingSession>>;

    async fn staging_area_count(&self, execution_id: &str) -> StoreResult<usize>;

    /// Drop every staging area of the execution, returning how many existed
    async fn drop_staging_areas(&self, execution_id: &str) -> StoreResult<usize>;

    /// Point the latest-value snapshot at this execution's values
    async fn refresh_latest_values(&self, pipeline_id: &str, execution_id: &str) -> StoreResult<u64>;

    /// Date span of the activities the execution wrote values for
    async fn affected_time_range(
        &self,
        pipeline_id: &str,
        execution_id: &str,
    ) -> StoreResult<Option<AffectedTimeRange>>;

    /// Distinct groups of the activities the execution wrote values for
    async fn group_leaves(&self, pipeline_id: &str, execution_id: &str) -> StoreResult<Vec<String>>;

    async fn activity_count(&self, pipeline_id: &str) -> StoreResult<u64>;

    /// Raw activities of the pipeline at or below `group_id` dated within
    /// `range`, each carrying its latest values
    async fn latest_activities(
        &self,
        pipeline_id: &str,
        group_id: &str,
        range: &AffectedTimeRange,
    ) -> StoreResult<Vec<ActivityRecord>>;

    /// Insert or replace rows keyed by `(pipeline, group, date, group_key)`
    async fn upsert_aggregated_activities(&self, rows: &[AggregatedActivity]) -> StoreResult<u64>;

    async fn aggregated_activities(
        &self,
        pipeline_id: &str,
        group_id: &str,
        range: &AffectedTimeRange,
    ) -> StoreResult<Vec<AggregatedActivity>>;
}

/// Recompute day cells of one metric at one group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayAggregation {
    pub metric_id: String,
    pub input_pipelines: Vec<PipelineInput>,
    pub input_metric_ids: Vec<String>,
    pub group_id: String,
    pub range: AffectedTimeRange,
    pub pipeline_id: String,
    pub execution_id: String,
}

/// Roll `from_unit` cells up into `to_unit` buckets over an already widened range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rollup {
    pub metric_id: String,
    pub group_id: String,
    pub from_unit: TimeUnit,
    pub to_unit: TimeUnit,
    pub range: AffectedTimeRange,
    pub pipeline_id: String,
    pub execution_id: String,
}

/// Aggregated metric cells. Every write is an upsert.
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Returns the number of cells written
    async fn aggregate_day(&self, request: &DayAggregation) -> StoreResult<u64>;

    async fn rollup(&self, request: &Rollup) -> StoreResult<u64>;

    async fn metric_values(
        &self,
        metric_id: &str,
        group_id: &str,
        unit: TimeUnit,
        range: &AffectedTimeRange,
    ) -> StoreResult<Vec<MetricValue>>;
}

#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn create(&self, execution: &PipelineExecution) -> StoreResult<()>;

    async fn get(&self, execution_id: &str) -> StoreResult<Option<PipelineExecution>>;

    /// Applies a lifecycle transition. `message: None` keeps the current
    /// message. Illegal transitions are `StoreError::InvalidState`.
    async fn update_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        message: Option<String>,
    ) -> StoreResult<PipelineExecution>;

    /// The only write allowed once an execution is terminal
    async fn amend_status_message(&self, execution_id: &str, message: &str) -> StoreResult<PipelineExecution>;

    /// Move a `waiting` execution to `in_progress`, stamping `started_at` on
    /// first claim. `None` when the execution is past `waiting`, so exactly
    /// one run wins an execution.
    async fn claim(&self, execution_id: &str, at: DateTime<Utc>) -> StoreResult<Option<PipelineExecution>>;

    async fn record_transition(
        &self,
        execution_id: &str,
        from: Option<OrchestratorStage>,
        to: OrchestratorStage,
    ) -> StoreResult<ExecutionTransition>;

    async fn transitions(&self, execution_id: &str) -> StoreResult<Vec<ExecutionTransition>>;
}

#[async_trait]
pub trait AggregationJobRepository: Send + Sync {
    async fn create(&self, job: &AggregationJob) -> StoreResult<()>;

    async fn get(&self, job_id: &str) -> StoreResult<Option<AggregationJob>>;

    /// Replace a pending job's range and group queue
    async fn update(&self, job: &AggregationJob) -> StoreResult<()>;

    /// Terminal jobs reject further changes with `StoreError::InvalidState`
    async fn set_status(
        &self,
        job_id: &str,
        status: AggregationJobStatus,
        message: Option<String>,
    ) -> StoreResult<AggregationJob>;

    /// Move a `pending` job to `running` and return it as stored at that
    /// moment. `None` when the job is no longer pending.
    async fn claim(&self, job_id: &str) -> StoreResult<Option<AggregationJob>>;

    async fn find_pending(&self, tenant_id: &str, pipeline_id: &str) -> StoreResult<Vec<AggregationJob>>;
}

#[async_trait]
pub trait PipelineCatalog: Send + Sync {
    async fn pipeline(&self, tenant_id: &str, pipeline_id: &str) -> StoreResult<Option<PipelineDefinition>>;
}

#[async_trait]
pub trait MetricCatalog: Send + Sync {
    async fn metrics(&self, tenant_id: &str) -> StoreResult<Vec<MetricDefinition>>;

    async fn metric(&self, tenant_id: &str, name: &str) -> StoreResult<Option<MetricDefinition>> {
        Ok(self
            .metrics(tenant_id)
            .await?
            .into_iter()
            .find(|m| m.name == name))
    }
}

/// Outcome of one acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired(LockRecord),
    Held(LockRecord),
}

#[async_trait]
pub trait LockTable: Send + Sync {
    /// Take the lock if it is free or expired. A holder already owning the
    /// lock is refused like any other.
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<LockAttempt>;

    /// Push the expiry of a lock `holder` still owns to `ttl` from now
    async fn renew(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<bool>;

    /// Delete the lock only if `holder` still owns it
    async fn release(&self, name: &str, holder: &str) -> StoreResult<bool>;

    async fn current(&self, name: &str) -> StoreResult<Option<LockRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_table_names_are_identifiers() {
        let key = StagingKey::new("p1", "2F6B-aa01", 4);
        let name = key.table_name();
        assert!(name.starts_with("activity_2f6b_aa01_"));
        assert!(name.ends_with("_4"));
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        assert!(name.starts_with(&StagingKey::execution_table_prefix("2F6B-aa01")));
        assert_eq!(name, StagingKey::new("p2", "2F6B-aa01", 4).table_name());
    }

    #[test]
    fn test_ids_that_sanitize_alike_do_not_share_tables() {
        let upper = StagingKey::new("p1", "E-1", 0);
        let lower = StagingKey::new("p1", "e_1", 0);
        assert_ne!(upper.table_name(), lower.table_name());
        assert!(!lower
            .table_name()
            .starts_with(&StagingKey::execution_table_prefix("E-1")));
        assert!(!upper
            .table_name()
            .starts_with(&StagingKey::execution_table_prefix("e_1")));
    }
}
