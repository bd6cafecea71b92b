//! # Bulk Loader
//!
//! Moves one chunk's calculated output into the canonical relational store.
//!
//! The terminal [`ChunkMarker`] at `output/{sequence}.json` is the
//! idempotency key for `(executionId, sequence)`: a marker that already
//! exists short-circuits to [`LoadOutcome::Duplicate`], and every other
//! outcome is recorded by writing the marker with a `DoesNotExist`
//! precondition, so a redelivery racing this one also ends as a duplicate.
//!
//! A copy that moves zero rows is ambiguous. The loader re-reads the first
//! records of the artifact: records with values mean the load mechanism
//! broke (`failed`), no such records mean there was nothing to load
//! (`success` with `no_activities_processed`).

use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::config::LoaderConfig;
use crate::constants::status_messages;
use crate::error::{Result, StoreError};
use crate::logging::log_chunk_operation;
use crate::models::activity::probe_records;
use crate::models::{CalculationResult, ChunkMarker, ChunkStage, ExecutionContext};
use crate::storage::{
    ActivityStore, MigrationSummary, ObjectKeys, ObjectStore, StagingKey, StagingSession,
    WritePrecondition, WriteResult,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Success {
        rows_loaded: u64,
        no_activities_processed: bool,
    },
    Failed {
        message: String,
    },
    /// A terminal marker already existed; nothing was touched
    Duplicate,
}

impl LoadOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, LoadOutcome::Failed { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoadOutcome::Success { .. } => "success",
            LoadOutcome::Failed { .. } => "failed",
            LoadOutcome::Duplicate => "duplicate",
        }
    }
}

impl fmt::Display for LoadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct BulkLoader {
    objects: Arc<dyn ObjectStore>,
    activities: Arc<dyn ActivityStore>,
    keys: ObjectKeys,
    config: LoaderConfig,
}

impl BulkLoader {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        activities: Arc<dyn ActivityStore>,
        keys: ObjectKeys,
        config: LoaderConfig,
    ) -> Self {
        Self {
            objects,
            activities,
            keys,
            config,
        }
    }

    /// Load the output of one calculated chunk. A failed calculation is
    /// recorded as a failure marker without touching the relational store.
    ///
    /// Only object store errors are returned as `Err`; everything that goes
    /// wrong inside the staging session becomes a `failed` outcome.
    #[instrument(skip(self, result), fields(execution_id = %context.execution_id, sequence = result.sequence))]
    pub async fn load(&self, context: &ExecutionContext, result: &CalculationResult) -> Result<LoadOutcome> {
        let sequence = result.sequence;
        if self.marker_exists(context, sequence).await? {
            log_chunk_operation("load", &context.execution_id, sequence, "duplicate", None);
            return Ok(LoadOutcome::Duplicate);
        }
        if result.is_failed() {
            return self.record_calculation_failure(context, result).await;
        }

        let output_key = result.output_ref.clone().unwrap_or_else(|| {
            self.keys
                .chunk_output(&context.pipeline_id, &context.execution_id, sequence)
        });
        let outcome = match self.objects.head(&output_key).await? {
            None => LoadOutcome::Failed {
                message: format!("calculated output '{output_key}' does not exist"),
            },
            Some(meta) => self.stage_and_migrate(context, sequence, &output_key, meta.size).await?,
        };

        let marker = match &outcome {
            LoadOutcome::Success {
                rows_loaded,
                no_activities_processed,
            } => ChunkMarker::success(
                sequence,
                *rows_loaded,
                *no_activities_processed || result.no_activities_processed,
            ),
            LoadOutcome::Failed { message } => ChunkMarker::failed(sequence, ChunkStage::Load, message.clone()),
            LoadOutcome::Duplicate => return Ok(LoadOutcome::Duplicate),
        };
        self.finish(context, marker, outcome).await
    }

    /// Write a failure marker for a chunk whose calculation failed
    pub async fn record_calculation_failure(
        &self,
        context: &ExecutionContext,
        result: &CalculationResult,
    ) -> Result<LoadOutcome> {
        let message = if result.errors.is_empty() {
            "calculation failed".to_string()
        } else {
            result.errors.join("; ")
        };
        let marker = ChunkMarker::failed(result.sequence, ChunkStage::Calculation, message.clone());
        self.finish(context, marker, LoadOutcome::Failed { message }).await
    }

    async fn marker_exists(&self, context: &ExecutionContext, sequence: u32) -> Result<bool> {
        let key = self
            .keys
            .chunk_marker(&context.pipeline_id, &context.execution_id, sequence);
        Ok(self.objects.head(&key).await?.is_some())
    }

    async fn finish(
        &self,
        context: &ExecutionContext,
        marker: ChunkMarker,
        outcome: LoadOutcome,
    ) -> Result<LoadOutcome> {
        let sequence = marker.sequence;
        let key = self
            .keys
            .chunk_marker(&context.pipeline_id, &context.execution_id, sequence);
        match self
            .objects
            .put(&key, marker.to_bytes()?, WritePrecondition::DoesNotExist)
            .await?
        {
            WriteResult::Success { .. } => {
                let details = match &outcome {
                    LoadOutcome::Failed { message } => Some(message.as_str()),
                    _ => None,
                };
                log_chunk_operation("load", &context.execution_id, sequence, outcome.as_str(), details);
                Ok(outcome)
            }
            WriteResult::PreconditionFailed { .. } => {
                debug!(sequence, "marker written concurrently by another delivery");
                log_chunk_operation("load", &context.execution_id, sequence, "duplicate", None);
                Ok(LoadOutcome::Duplicate)
            }
        }
    }

    async fn stage_and_migrate(
        &self,
        context: &ExecutionContext,
        sequence: u32,
        output_key: &str,
        size: u64,
    ) -> Result<LoadOutcome> {
        let artifact = self.objects.get(output_key).await?;
        let staging = StagingKey::new(&context.pipeline_id, &context.execution_id, sequence);

        let mut session = match self.activities.open_session().await {
            Ok(session) => session,
            Err(e) => return Ok(Self::load_failure(&staging, &e)),
        };
        let migrated = Self::run_session(session.as_mut(), &staging, &artifact).await;
        if let Err(e) = session.close().await {
            warn!(table = %staging.table_name(), error = %e, "failed to close staging session");
        }

        match migrated {
            Ok(summary) => Ok(LoadOutcome::Success {
                rows_loaded: summary.values_written(),
                no_activities_processed: summary.values_written() == 0,
            }),
            Err(e) if e.is_zero_rows_copied() => self.probe_zero_rows(output_key, size).await,
            Err(e) => Ok(Self::load_failure(&staging, &e)),
        }
    }

    async fn run_session(
        session: &mut dyn StagingSession,
        key: &StagingKey,
        artifact: &[u8],
    ) -> std::result::Result<MigrationSummary, StoreError> {
        session.create_staging_area(key).await?;
        let copied = session.copy_from_artifact(key, artifact).await?;
        debug!(table = %key.table_name(), copied, "artifact staged");
        session.migrate(key).await
    }

    /// Distinguish an empty artifact from a copy that silently lost rows
    async fn probe_zero_rows(&self, output_key: &str, size: u64) -> Result<LoadOutcome> {
        let prefix = if size == 0 {
            Vec::new()
        } else {
            self.objects
                .get_range(output_key, 0..self.config.probe_bytes.min(size))
                .await?
        };
        let records = probe_records(&prefix, self.config.probe_records);
        if records.iter().any(|r| r.has_values()) {
            warn!(output_key, probed = records.len(), "zero rows copied from an artifact with data");
            return Ok(LoadOutcome::Failed {
                message: format!("{}: no rows copied from '{output_key}'", status_messages::INSERT_ERROR),
            });
        }
        Ok(LoadOutcome::Success {
            rows_loaded: 0,
            no_activities_processed: true,
        })
    }

    fn load_failure(key: &StagingKey, error: &StoreError) -> LoadOutcome {
        warn!(table = %key.table_name(), error = %error, "chunk load failed");
        LoadOutcome::Failed {
            message: format!("{}: {error}", status_messages::INSERT_ERROR),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActivityRecord, ActivityValue, CalculationCallback, CompletionToken};
    use crate::storage::{MemoryObjectStore, MemoryRelationalStore};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn context() -> ExecutionContext {
        ExecutionContext {
            tenant_id: "t1".into(),
            pipeline_id: "p1".into(),
            execution_id: "e1".into(),
            group_context_id: "/acme".into(),
        }
    }

    fn record(name: &str, co2: Option<f64>) -> ActivityRecord {
        let mut values = BTreeMap::new();
        if let Some(v) = co2 {
            values.insert("co2".to_string(), ActivityValue::Number(v));
        }
        ActivityRecord {
            activity_type: "raw".into(),
            name: name.into(),
            date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            group_id: "/acme".into(),
            values,
        }
    }

    fn calculated(sequence: u32, output: &str) -> CalculationResult {
        CalculationResult::from_callback(
            sequence,
            CalculationCallback::success(CompletionToken::generate(), output),
            1,
        )
    }

    async fn put(store: &MemoryObjectStore, key: &str, data: Vec<u8>) {
        store.put(key, data, WritePrecondition::None).await.unwrap();
    }

    fn loader(objects: Arc<MemoryObjectStore>, activities: Arc<dyn ActivityStore>) -> BulkLoader {
        BulkLoader::new(objects, activities, ObjectKeys::default(), LoaderConfig::default())
    }

    #[tokio::test]
    async fn test_second_delivery_is_duplicate_and_leaves_store_unchanged() {
        let objects = Arc::new(MemoryObjectStore::new());
        let relational = Arc::new(MemoryRelationalStore::new());
        let artifact = crate::models::activity::encode_artifact(&[record("boiler", Some(4.0))]).unwrap();
        put(&objects, "out/0", artifact).await;
        let loader = loader(Arc::clone(&objects), relational.clone());

        let first = loader.load(&context(), &calculated(0, "out/0")).await.unwrap();
        assert_eq!(
            first,
            LoadOutcome::Success {
                rows_loaded: 1,
                no_activities_processed: false
            }
        );
        let values = relational.value_count();

        let second = loader.load(&context(), &calculated(0, "out/0")).await.unwrap();
        assert_eq!(second, LoadOutcome::Duplicate);
        assert_eq!(relational.value_count(), values);
    }

    #[tokio::test]
    async fn test_missing_artifact_is_a_failure_marker() {
        let objects = Arc::new(MemoryObjectStore::new());
        let loader = loader(Arc::clone(&objects), Arc::new(MemoryRelationalStore::new()));
        let outcome = loader.load(&context(), &calculated(1, "out/missing")).await.unwrap();
        assert!(outcome.is_failed());

        let marker_key = ObjectKeys::default().chunk_marker("p1", "e1", 1);
        let marker = ChunkMarker::from_bytes(&objects.get(&marker_key).await.unwrap()).unwrap();
        assert_eq!(marker.failed_stage, Some(ChunkStage::Load));
    }

    #[tokio::test]
    async fn test_empty_artifact_is_benign_no_op() {
        let objects = Arc::new(MemoryObjectStore::new());
        put(&objects, "out/2", Vec::new()).await;
        let loader = loader(Arc::clone(&objects), Arc::new(MemoryRelationalStore::new()));
        let outcome = loader.load(&context(), &calculated(2, "out/2")).await.unwrap();
        assert_eq!(
            outcome,
            LoadOutcome::Success {
                rows_loaded: 0,
                no_activities_processed: true
            }
        );
    }

    #[tokio::test]
    async fn test_calculation_failure_writes_marker() {
        let objects = Arc::new(MemoryObjectStore::new());
        let loader = loader(Arc::clone(&objects), Arc::new(MemoryRelationalStore::new()));
        let failed = CalculationResult::failed(3, vec!["row 7: unknown unit".into()], 6);
        let outcome = loader.load(&context(), &failed).await.unwrap();
        assert!(outcome.is_failed());

        let key = ObjectKeys::default().chunk_marker("p1", "e1", 3);
        let marker = ChunkMarker::from_bytes(&objects.get(&key).await.unwrap()).unwrap();
        assert_eq!(marker.failed_stage, Some(ChunkStage::Calculation));
        assert_eq!(marker.message.as_deref(), Some("row 7: unknown unit"));
    }

    /// Staging that never copies anything
    struct LossyStore;

    struct LossySession;

    #[async_trait]
    impl StagingSession for LossySession {
        async fn create_staging_area(&mut self, _key: &StagingKey) -> crate::error::StoreResult<()> {
            Ok(())
        }
        async fn copy_from_artifact(&mut self, key: &StagingKey, _artifact: &[u8]) -> crate::error::StoreResult<u64> {
            Err(StoreError::ZeroRowsCopied { table: key.table_name() })
        }
        async fn migrate(&mut self, _key: &StagingKey) -> crate::error::StoreResult<MigrationSummary> {
            Ok(MigrationSummary::default())
        }
        async fn close(self: Box<Self>) -> crate::error::StoreResult<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl ActivityStore for LossyStore {
        async fn open_session(&self) -> crate::error::StoreResult<Box<dyn StagingSession>> {
            Ok(Box::new(LossySession))
        }
        async fn staging_area_count(&self, _execution_id: &str) -> crate::error::StoreResult<usize> {
            Ok(0)
        }
        async fn drop_staging_areas(&self, _execution_id: &str) -> crate::error::StoreResult<usize> {
            Ok(0)
        }
        async fn refresh_latest_values(&self, _p: &str, _e: &str) -> crate::error::StoreResult<u64> {
            Ok(0)
        }
        async fn affected_time_range(
            &self,
            _p: &str,
            _e: &str,
        ) -> crate::error::StoreResult<Option<crate::models::AffectedTimeRange>> {
            Ok(None)
        }
        async fn group_leaves(&self, _p: &str, _e: &str) -> crate::error::StoreResult<Vec<String>> {
            Ok(Vec::new())
        }
        async fn activity_count(&self, _p: &str) -> crate::error::StoreResult<u64> {
            Ok(0)
        }
        async fn latest_activities(
            &self,
            _p: &str,
            _g: &str,
            _range: &crate::models::AffectedTimeRange,
        ) -> crate::error::StoreResult<Vec<ActivityRecord>> {
            Ok(Vec::new())
        }
        async fn upsert_aggregated_activities(
            &self,
            _rows: &[crate::models::AggregatedActivity],
        ) -> crate::error::StoreResult<u64> {
            Ok(0)
        }
        async fn aggregated_activities(
            &self,
            _p: &str,
            _g: &str,
            _range: &crate::models::AffectedTimeRange,
        ) -> crate::error::StoreResult<Vec<crate::models::AggregatedActivity>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_zero_rows_with_data_in_artifact_fails() {
        let objects = Arc::new(MemoryObjectStore::new());
        let artifact = crate::models::activity::encode_artifact(&[record("truck", Some(1.5))]).unwrap();
        put(&objects, "out/0", artifact).await;
        let loader = loader(Arc::clone(&objects), Arc::new(LossyStore));

        let outcome = loader.load(&context(), &calculated(0, "out/0")).await.unwrap();
        match outcome {
            LoadOutcome::Failed { message } => assert!(message.starts_with(status_messages::INSERT_ERROR)),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_zero_rows_with_valueless_records_succeeds() {
        let objects = Arc::new(MemoryObjectStore::new());
        let artifact = crate::models::activity::encode_artifact(&[record("idle", None)]).unwrap();
        put(&objects, "out/0", artifact).await;
        let loader = loader(Arc::clone(&objects), Arc::new(LossyStore));

        let outcome = loader.load(&context(), &calculated(0, "out/0")).await.unwrap();
        assert_eq!(
            outcome,
            LoadOutcome::Success {
                rows_loaded: 0,
                no_activities_processed: true
            }
        );
    }
}
