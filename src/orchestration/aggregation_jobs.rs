//! # Deferred Aggregation Jobs
//!
//! When a pipeline does not trigger metric aggregation inline, the
//! orchestrator records what the execution touched as an [`AggregationJob`]
//! and hands it to the deferred-work queue. Pending jobs of the same
//! pipeline whose group leaves overlap are merged instead of duplicated:
//! their time ranges are unioned and their leaves merged.
//!
//! [`AggregationJobWorker`] consumes the queue and runs the same
//! [`MetricAggregationEngine`] under the `aggregation:{pipelineId}` lock.
//! The job is claimed (`pending` to `running`) only once the lock is held and
//! the pass is planned from the claimed row, so executions merged while the
//! worker waited are part of the run.

use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::lock_manager::LockManager;
use super::metric_aggregation::MetricAggregationEngine;
use crate::config::{AggregationConfig, ConfigurationError};
use crate::constants::{lock_resources, status_messages};
use crate::error::{LockError, PipelineError, Result, StoreError};
use crate::logging::log_aggregation_operation;
use crate::messaging::{WorkMessage, WorkQueue};
use crate::models::{AggregationJob, AggregationJobStatus, ExecutionContext, LockKey};
use crate::storage::hierarchy::merge_group_leaves;
use crate::storage::{ActivityStore, AggregationJobRepository, PipelineCatalog};

pub struct AggregationJobService {
    jobs: Arc<dyn AggregationJobRepository>,
    activities: Arc<dyn ActivityStore>,
    queue: Arc<dyn WorkQueue>,
    config: AggregationConfig,
}

impl AggregationJobService {
    pub fn new(
        jobs: Arc<dyn AggregationJobRepository>,
        activities: Arc<dyn ActivityStore>,
        queue: Arc<dyn WorkQueue>,
        config: AggregationConfig,
    ) -> Self {
        Self {
            jobs,
            activities,
            queue,
            config,
        }
    }

    /// Record the execution's affected range and groups as pending work.
    ///
    /// Returns `None` when the execution wrote no dated values.
    #[instrument(skip(self), fields(execution_id = %context.execution_id))]
    pub async fn save_for_execution(&self, context: &ExecutionContext) -> Result<Option<AggregationJob>> {
        let Some(time_range) = self
            .activities
            .affected_time_range(&context.pipeline_id, &context.execution_id)
            .await?
        else {
            info!(pipeline_id = %context.pipeline_id, "no affected dates, no aggregation job saved");
            return Ok(None);
        };

        let mut leaves = self
            .activities
            .group_leaves(&context.pipeline_id, &context.execution_id)
            .await?;
        if leaves.is_empty() {
            leaves.push(context.group_context_id.clone());
        }
        let leaves = merge_group_leaves(&[], &leaves);

        let job = match self.merge_into_pending(context, &time_range, &leaves).await? {
            Some(job) => job,
            None => {
                let job = AggregationJob::new(
                    &context.tenant_id,
                    &context.pipeline_id,
                    &context.group_context_id,
                    time_range,
                    &leaves,
                );
                self.jobs.create(&job).await?;
                info!(job_id = %job.id, groups = leaves.len(), "aggregation job created");
                job
            }
        };

        let message = WorkMessage::AggregationJob {
            job_id: job.id.clone(),
            tenant_id: job.tenant_id.clone(),
            pipeline_id: job.pipeline_id.clone(),
        };
        self.queue.send(&self.config.queue_name, &message).await?;
        log_aggregation_operation("save_job", &context.pipeline_id, None, None, "queued", None);
        Ok(Some(job))
    }

    async fn merge_into_pending(
        &self,
        context: &ExecutionContext,
        time_range: &crate::models::AffectedTimeRange,
        leaves: &[String],
    ) -> Result<Option<AggregationJob>> {
        let pending = self
            .jobs
            .find_pending(&context.tenant_id, &context.pipeline_id)
            .await?;
        let Some(mut job) = pending.into_iter().find(|job| job.overlaps(leaves)) else {
            return Ok(None);
        };
        job.absorb(time_range, leaves);
        match self.jobs.update(&job).await {
            Ok(()) => {
                info!(job_id = %job.id, "execution merged into pending aggregation job");
                Ok(Some(job))
            }
            // a worker picked the job up between lookup and update
            Err(StoreError::InvalidState { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// What one `process_next` call did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded { job_id: String },
    Failed { job_id: String, message: String },
    /// The message pointed at a job that no longer exists
    Missing { job_id: String },
    /// The job was already finished by an earlier message
    Skipped { job_id: String },
    /// The lock was busy; the message becomes visible again later
    Deferred { job_id: String },
}

pub struct AggregationJobWorker {
    queue: Arc<dyn WorkQueue>,
    jobs: Arc<dyn AggregationJobRepository>,
    pipelines: Arc<dyn PipelineCatalog>,
    engine: Arc<MetricAggregationEngine>,
    locks: LockManager,
    config: AggregationConfig,
    worker_id: String,
}

impl AggregationJobWorker {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        jobs: Arc<dyn AggregationJobRepository>,
        pipelines: Arc<dyn PipelineCatalog>,
        engine: Arc<MetricAggregationEngine>,
        locks: LockManager,
        config: AggregationConfig,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            jobs,
            pipelines,
            engine,
            locks,
            config,
            worker_id: worker_id.into(),
        }
    }

    /// Handle at most one queued job. `None` means the queue was empty.
    pub async fn process_next(&self) -> Result<Option<JobOutcome>> {
        let mut messages = self
            .queue
            .read(&self.config.queue_name, self.config.visibility_timeout(), 1)
            .await?;
        let Some(queued) = messages.pop() else {
            return Ok(None);
        };

        let WorkMessage::AggregationJob { job_id, .. } = queued.message else {
            warn!(message_id = queued.id, kind = queued.message.kind(), "unexpected message on aggregation queue");
            self.queue.delete(&self.config.queue_name, queued.id).await?;
            return Ok(None);
        };

        let outcome = self.process_job(&job_id).await?;
        if !matches!(outcome, JobOutcome::Deferred { .. }) {
            self.queue.delete(&self.config.queue_name, queued.id).await?;
        }
        Ok(Some(outcome))
    }

    /// Process jobs until the queue is empty, returning how many messages
    /// were handled
    pub async fn drain(&self) -> Result<usize> {
        let mut handled = 0;
        while let Some(outcome) = self.process_next().await? {
            handled += 1;
            if matches!(outcome, JobOutcome::Deferred { .. }) {
                break;
            }
        }
        Ok(handled)
    }

    #[instrument(skip(self))]
    async fn process_job(&self, job_id: &str) -> Result<JobOutcome> {
        let Some(job) = self.jobs.get(job_id).await? else {
            warn!(job_id, "aggregation job not found, dropping message");
            return Ok(JobOutcome::Missing {
                job_id: job_id.to_string(),
            });
        };
        if job.status != AggregationJobStatus::Pending {
            return Ok(JobOutcome::Skipped {
                job_id: job_id.to_string(),
            });
        }

        let key = LockKey::new(&job.tenant_id, lock_resources::aggregation(&job.pipeline_id));
        let guard = match self.locks.acquire(&key, &self.worker_id).await {
            Ok(guard) => guard,
            Err(LockError::Timeout { .. }) => {
                warn!(job_id, lock = %key, "aggregation lock busy, deferring job");
                return Ok(JobOutcome::Deferred {
                    job_id: job_id.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let claimed = self.jobs.claim(job_id).await;
        let result = match &claimed {
            Ok(Some(job)) => self.run_job(job).await,
            _ => Ok(()),
        };
        if let Err(e) = guard.release().await {
            warn!(job_id, error = %e, "aggregation lock release failed, expiry will reclaim it");
        }
        let Some(job) = claimed? else {
            info!(job_id, "aggregation job claimed by another worker");
            return Ok(JobOutcome::Skipped {
                job_id: job_id.to_string(),
            });
        };

        match result {
            Ok(()) => {
                self.jobs
                    .set_status(job_id, AggregationJobStatus::Succeeded, None)
                    .await?;
                log_aggregation_operation("run_job", &job.pipeline_id, None, None, "succeeded", None);
                Ok(JobOutcome::Succeeded {
                    job_id: job_id.to_string(),
                })
            }
            Err(e) => {
                let message = format!("{}: {e}", status_messages::AGGREGATION_ERROR);
                self.jobs
                    .set_status(job_id, AggregationJobStatus::Failed, Some(message.clone()))
                    .await?;
                log_aggregation_operation("run_job", &job.pipeline_id, None, None, "failed", None);
                Ok(JobOutcome::Failed {
                    job_id: job_id.to_string(),
                    message,
                })
            }
        }
    }

    async fn run_job(&self, job: &AggregationJob) -> Result<()> {
        let pipeline = self
            .pipelines
            .pipeline(&job.tenant_id, &job.pipeline_id)
            .await?
            .ok_or_else(|| {
                PipelineError::from(ConfigurationError::PipelineNotFound {
                    pipeline_id: job.pipeline_id.clone(),
                })
            })?;
        let queue = self.engine.metric_queue(&job.tenant_id, &pipeline).await?;
        let step = self.engine.plan_job(job, &job.id, queue);
        self.engine.run_to_completion(step).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;
    use crate::messaging::MemoryWorkQueue;
    use crate::models::activity::encode_artifact;
    use crate::models::{
        ActivityRecord, ActivityValue, AffectedTimeRange, MetricDefinition, OutputType,
        PipelineDefinition, PipelineInput, ProcessorOptions, TimeUnit, TransformerOutput,
    };
    use crate::storage::{
        MemoryAggregationJobRepository, MemoryCatalog, MemoryLockTable, MemoryRelationalStore,
        MetricStore, PathGroupHierarchy, StagingKey,
    };
    use chrono::NaiveDate;
    use std::collections::BTreeMap;

    fn context(execution_id: &str) -> ExecutionContext {
        ExecutionContext {
            tenant_id: "t1".into(),
            pipeline_id: "p1".into(),
            execution_id: execution_id.into(),
            group_context_id: "/acme".into(),
        }
    }

    async fn seed(store: &MemoryRelationalStore, execution_id: &str, day: u32, group: &str) {
        let record = ActivityRecord {
            activity_type: "raw".into(),
            name: format!("asset-{execution_id}"),
            date: NaiveDate::from_ymd_opt(2024, 5, day).unwrap(),
            group_id: group.into(),
            values: BTreeMap::from([("co2".to_string(), ActivityValue::Number(1.0))]),
        };
        let key = StagingKey::new("p1", execution_id, 0);
        let mut session = store.open_session().await.unwrap();
        session.create_staging_area(&key).await.unwrap();
        session
            .copy_from_artifact(&key, &encode_artifact(&[record]).unwrap())
            .await
            .unwrap();
        session.migrate(&key).await.unwrap();
        session.close().await.unwrap();
        store.refresh_latest_values("p1", execution_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_overlapping_pending_jobs_are_merged() {
        let store = MemoryRelationalStore::new();
        let jobs = Arc::new(MemoryAggregationJobRepository::new());
        let queue = Arc::new(MemoryWorkQueue::new());
        let service = AggregationJobService::new(
            jobs.clone(),
            Arc::new(store.clone()),
            queue.clone(),
            AggregationConfig::default(),
        );

        seed(&store, "e1", 2, "/acme/a").await;
        seed(&store, "e2", 9, "/acme/a/x").await;
        seed(&store, "e3", 4, "/other").await;

        let first = service.save_for_execution(&context("e1")).await.unwrap().unwrap();
        let merged = service.save_for_execution(&context("e2")).await.unwrap().unwrap();
        assert_eq!(first.id, merged.id);
        assert_eq!(merged.group_leaves(), vec!["/acme/a/x".to_string()]);
        assert_eq!(merged.time_range.from, NaiveDate::from_ymd_opt(2024, 5, 2).unwrap());
        assert_eq!(merged.time_range.to, NaiveDate::from_ymd_opt(2024, 5, 9).unwrap());

        let separate = service.save_for_execution(&context("e3")).await.unwrap().unwrap();
        assert_ne!(separate.id, first.id);
        assert_eq!(jobs.len(), 2);
        assert_eq!(queue.depth("metric_aggregation_jobs").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_worker_runs_job_and_skips_repeated_messages() {
        let store = MemoryRelationalStore::new();
        let jobs = Arc::new(MemoryAggregationJobRepository::new());
        let queue = Arc::new(MemoryWorkQueue::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let service = AggregationJobService::new(
            jobs.clone(),
            Arc::new(store.clone()),
            queue.clone(),
            AggregationConfig::default(),
        );
        seed(&store, "e1", 2, "/acme/a").await;
        seed(&store, "e2", 3, "/acme/a").await;
        let job = service.save_for_execution(&context("e1")).await.unwrap().unwrap();
        service.save_for_execution(&context("e2")).await.unwrap();

        let engine = Arc::new(MetricAggregationEngine::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            catalog.clone(),
            Arc::new(PathGroupHierarchy),
        ));
        let worker = AggregationJobWorker::new(
            queue.clone(),
            jobs.clone(),
            catalog,
            engine,
            LockManager::new(Arc::new(MemoryLockTable::new()), LockConfig::default()),
            AggregationConfig::default(),
            "worker-1",
        );

        // the pipeline is not in the catalog, so the job fails with a message
        let first = worker.process_next().await.unwrap().unwrap();
        assert!(matches!(first, JobOutcome::Failed { ref message, .. } if message.contains("not found")));
        let second = worker.process_next().await.unwrap().unwrap();
        assert_eq!(second, JobOutcome::Skipped { job_id: job.id.clone() });
        assert!(worker.process_next().await.unwrap().is_none());

        let stored = jobs.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AggregationJobStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execution_merged_while_worker_waits_for_lock_is_aggregated() {
        let store = MemoryRelationalStore::new();
        let jobs = Arc::new(MemoryAggregationJobRepository::new());
        let queue = Arc::new(MemoryWorkQueue::new());
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.insert_pipeline(PipelineDefinition {
            id: "p1".into(),
            tenant_id: "t1".into(),
            name: "fleet".into(),
            version: 1,
            outputs: vec![TransformerOutput {
                key: "co2".into(),
                output_type: OutputType::Number,
                metrics: vec!["emissions".into()],
                aggregate: None,
            }],
            processor_options: ProcessorOptions::default(),
        });
        catalog.insert_metric(MetricDefinition {
            id: "m-emissions".into(),
            tenant_id: "t1".into(),
            name: "emissions".into(),
            time_unit: TimeUnit::Day,
            input_metrics: vec![],
            input_pipelines: vec![PipelineInput {
                pipeline_id: "p1".into(),
                output: "co2".into(),
            }],
        });
        let service = AggregationJobService::new(
            jobs.clone(),
            Arc::new(store.clone()),
            queue.clone(),
            AggregationConfig::default(),
        );
        let locks = LockManager::new(
            Arc::new(MemoryLockTable::new()),
            LockConfig {
                acquire_timeout_seconds: 600,
                ..LockConfig::default()
            },
        );
        let worker = Arc::new(AggregationJobWorker::new(
            queue.clone(),
            jobs.clone(),
            catalog.clone(),
            Arc::new(MetricAggregationEngine::new(
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                catalog,
                Arc::new(PathGroupHierarchy),
            )),
            locks.clone(),
            AggregationConfig::default(),
            "worker-1",
        ));

        seed(&store, "e1", 2, "/acme/a").await;
        let job = service.save_for_execution(&context("e1")).await.unwrap().unwrap();

        let inline = locks
            .acquire(&LockKey::new("t1", lock_resources::aggregation("p1")), "e-inline")
            .await
            .unwrap();
        let running = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.process_next().await })
        };
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;

        seed(&store, "e2", 20, "/acme/a").await;
        let merged = service.save_for_execution(&context("e2")).await.unwrap().unwrap();
        assert_eq!(merged.id, job.id);
        inline.release().await.unwrap();

        let outcome = running.await.unwrap().unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::Succeeded { job_id: job.id.clone() });
        let day_20 = store
            .metric_values(
                "emissions",
                "/acme/a",
                TimeUnit::Day,
                &AffectedTimeRange::single_day(NaiveDate::from_ymd_opt(2024, 5, 20).unwrap()),
            )
            .await
            .unwrap();
        assert_eq!(day_20.len(), 1);
        assert_eq!(day_20[0].group_value, 1.0);
    }

    #[tokio::test]
    async fn test_missing_job_drops_message() {
        let queue = Arc::new(MemoryWorkQueue::new());
        queue
            .send(
                "metric_aggregation_jobs",
                &WorkMessage::AggregationJob {
                    job_id: "gone".into(),
                    tenant_id: "t1".into(),
                    pipeline_id: "p1".into(),
                },
            )
            .await
            .unwrap();
        let store = MemoryRelationalStore::new();
        let catalog = Arc::new(MemoryCatalog::new());
        let worker = AggregationJobWorker::new(
            queue.clone(),
            Arc::new(MemoryAggregationJobRepository::new()),
            catalog.clone(),
            Arc::new(MetricAggregationEngine::new(
                Arc::new(store.clone()),
                Arc::new(store),
                catalog,
                Arc::new(PathGroupHierarchy),
            )),
            LockManager::new(Arc::new(MemoryLockTable::new()), LockConfig::default()),
            AggregationConfig::default(),
            "worker-1",
        );
        let outcome = worker.process_next().await.unwrap().unwrap();
        assert_eq!(outcome, JobOutcome::Missing { job_id: "gone".into() });
        assert_eq!(queue.depth("metric_aggregation_jobs").await.unwrap(), 0);
    }
}
