//! # Orchestrator
//!
//! Sequences one pipeline execution through its lifecycle:
//!
//! ```text
//! received → verified → locked → calculated → loaded → aggregated → released → succeeded
//!     └────────────┴─────────┴──────────┴──────────┴──────────┴───────────→ failed
//! ```
//!
//! The pipeline's write lock is held from `locked` until `released` and is
//! released on every exit path. Stage changes are appended to the
//! execution's transition log as they happen.
//!
//! Stage-local problems (bad input, failed chunks, lock timeout, budget
//! exhaustion) end the execution as `failed` with a status message and
//! `run` returns `Ok(ExecutionStatus::Failed)`. Configuration and store
//! errors also fail the execution first, then are returned as `Err`.
//!
//! Under the lock the execution is claimed (`waiting` to `in_progress`);
//! a run that loses the claim leaves the execution to the run that won it.
//! From the claim on, the execution budget is a runtime deadline: dispatch,
//! retries, callback waits and gate polling all stop when it passes.

use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use super::aggregation_jobs::{AggregationJobService, AggregationJobWorker};
use super::bulk_loader::BulkLoader;
use super::chunked_calculator::{CalculationWorker, ChunkedCalculator};
use super::completion_registry::CompletionRegistry;
use super::lock_manager::{LockGuard, LockManager};
use super::metric_aggregation::MetricAggregationEngine;
use super::output_aggregation::OutputAggregator;
use super::result_aggregator::{GateReport, GateStatus, ResultAggregator};
use crate::config::{ConfigurationError, EngineConfig};
use crate::constants::{lock_resources, status_messages};
use crate::error::{LockError, PipelineError, Result, StoreError};
use crate::logging::log_execution_operation;
use crate::messaging::{MemoryWorkQueue, WorkQueue};
use crate::models::{
    CalculationCallback, CalculationResult, ChunkPlan, ExecutionContext, LockKey,
    NewPipelineExecution, PipelineDefinition, PipelineExecution, SourceContext,
};
use crate::state_machine::{ExecutionStatus, OrchestratorStage, StageTracker};
use crate::storage::{
    ActivityStore, AggregationJobRepository, ExecutionRepository, GroupHierarchy, LockTable,
    MemoryAggregationJobRepository, MemoryCatalog, MemoryExecutionRepository, MemoryLockTable,
    MemoryObjectStore, MemoryRelationalStore, MetricCatalog, MetricStore, ObjectKeys, ObjectStore,
    PathGroupHierarchy, PipelineCatalog,
};

/// Every collaborator the engine talks to
#[derive(Clone)]
pub struct EngineStores {
    pub objects: Arc<dyn ObjectStore>,
    pub activities: Arc<dyn ActivityStore>,
    pub metrics: Arc<dyn MetricStore>,
    pub executions: Arc<dyn ExecutionRepository>,
    pub jobs: Arc<dyn AggregationJobRepository>,
    pub pipelines: Arc<dyn PipelineCatalog>,
    pub metric_catalog: Arc<dyn MetricCatalog>,
    pub locks: Arc<dyn LockTable>,
    pub queue: Arc<dyn WorkQueue>,
    pub hierarchy: Arc<dyn GroupHierarchy>,
}

impl EngineStores {
    /// Fresh in-memory collaborators. The catalog is shared between
    /// pipelines and metrics and returned so callers can register definitions.
    pub fn in_memory() -> (Self, Arc<MemoryCatalog>) {
        let relational = MemoryRelationalStore::new();
        let catalog = Arc::new(MemoryCatalog::new());
        let stores = Self {
            objects: Arc::new(MemoryObjectStore::new()),
            activities: Arc::new(relational.clone()),
            metrics: Arc::new(relational),
            executions: Arc::new(MemoryExecutionRepository::new()),
            jobs: Arc::new(MemoryAggregationJobRepository::new()),
            pipelines: catalog.clone(),
            metric_catalog: catalog.clone(),
            locks: Arc::new(MemoryLockTable::new()),
            queue: Arc::new(MemoryWorkQueue::new()),
            hierarchy: Arc::new(PathGroupHierarchy),
        };
        (stores, catalog)
    }
}

/// Budgets reaching further out are waited on for this long at most
const MAX_BUDGET_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// How a sequence of stages ended without an error
enum StageOutcome {
    Completed,
    Failed(String),
    /// Another run claimed the execution first; carries its current status
    AlreadyClaimed(ExecutionStatus),
}

pub struct Orchestrator {
    stores: EngineStores,
    config: EngineConfig,
    locks: LockManager,
    calculator: ChunkedCalculator,
    loader: BulkLoader,
    gate: ResultAggregator,
    outputs: OutputAggregator,
    aggregation: Arc<MetricAggregationEngine>,
    jobs: AggregationJobService,
}

impl Orchestrator {
    pub fn new(stores: EngineStores, worker: Arc<dyn CalculationWorker>, config: EngineConfig) -> Self {
        let keys = ObjectKeys::new(&config.storage.prefix);
        let registry = Arc::new(CompletionRegistry::new());
        let locks = LockManager::new(Arc::clone(&stores.locks), config.lock.clone());
        let calculator = ChunkedCalculator::new(worker, registry, config.calculation.clone(), keys.clone());
        let loader = BulkLoader::new(
            Arc::clone(&stores.objects),
            Arc::clone(&stores.activities),
            keys.clone(),
            config.loader.clone(),
        );
        let gate = ResultAggregator::new(
            Arc::clone(&stores.objects),
            Arc::clone(&stores.activities),
            Arc::clone(&stores.executions),
            keys,
            config.gate.clone(),
        );
        let outputs = OutputAggregator::new(Arc::clone(&stores.activities));
        let aggregation = Arc::new(MetricAggregationEngine::new(
            Arc::clone(&stores.activities),
            Arc::clone(&stores.metrics),
            Arc::clone(&stores.metric_catalog),
            Arc::clone(&stores.hierarchy),
        ));
        let jobs = AggregationJobService::new(
            Arc::clone(&stores.jobs),
            Arc::clone(&stores.activities),
            Arc::clone(&stores.queue),
            config.aggregation.clone(),
        );
        Self {
            stores,
            config,
            locks,
            calculator,
            loader,
            gate,
            outputs,
            aggregation,
            jobs,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<CompletionRegistry> {
        self.calculator.registry()
    }

    /// Inbound worker callback
    pub fn complete(&self, callback: CalculationCallback) -> Result<()> {
        self.calculator.complete(callback)
    }

    /// A consumer for the deferred aggregation jobs this orchestrator queues
    pub fn aggregation_worker(&self, worker_id: impl Into<String>) -> AggregationJobWorker {
        AggregationJobWorker::new(
            Arc::clone(&self.stores.queue),
            Arc::clone(&self.stores.jobs),
            Arc::clone(&self.stores.pipelines),
            Arc::clone(&self.aggregation),
            self.locks.clone(),
            self.config.aggregation.clone(),
            worker_id,
        )
    }

    /// Persist a new execution in `waiting`
    pub async fn submit(&self, request: NewPipelineExecution) -> Result<PipelineExecution> {
        let execution = request.into_execution();
        self.stores.executions.create(&execution).await?;
        log_execution_operation(
            "submit",
            &execution.pipeline_id,
            &execution.execution_id,
            execution.status.as_str(),
            None,
        );
        Ok(execution)
    }

    /// Drive the execution to a terminal status
    #[instrument(skip(self))]
    pub async fn run(&self, execution_id: &str) -> Result<ExecutionStatus> {
        let execution = self
            .stores
            .executions
            .get(execution_id)
            .await?
            .ok_or_else(|| StoreError::not_found("pipeline execution", execution_id))?;
        if execution.status.is_terminal() {
            info!(status = %execution.status, "execution already terminal");
            return Ok(execution.status);
        }
        if execution.status != ExecutionStatus::Waiting {
            info!(status = %execution.status, "execution already claimed by another run");
            return Ok(execution.status);
        }
        log_execution_operation("run", &execution.pipeline_id, execution_id, "started", None);

        let mut tracker = StageTracker::new();
        self.stores
            .executions
            .record_transition(execution_id, None, OrchestratorStage::Received)
            .await?;

        let mut guard: Option<LockGuard> = None;
        let outcome = self.run_stages(&execution, &mut tracker, &mut guard).await;

        // the lock goes back before anything else, whatever happened
        if let Some(guard) = guard.take() {
            if let Err(e) = guard.release().await {
                warn!(error = %e, "pipeline lock release failed, expiry will reclaim it");
            }
        }

        match outcome {
            Ok(StageOutcome::Completed) => {
                self.advance(&mut tracker, execution_id, OrchestratorStage::Released).await?;
                self.stores
                    .executions
                    .update_status(execution_id, ExecutionStatus::Success, None)
                    .await?;
                self.advance(&mut tracker, execution_id, OrchestratorStage::Succeeded).await?;
                log_execution_operation("run", &execution.pipeline_id, execution_id, "success", None);
                Ok(ExecutionStatus::Success)
            }
            Ok(StageOutcome::Failed(message)) => {
                self.fail(&mut tracker, &execution, &message).await?;
                Ok(ExecutionStatus::Failed)
            }
            Ok(StageOutcome::AlreadyClaimed(status)) => {
                info!(%status, "execution claimed by another run while waiting for the lock");
                Ok(status)
            }
            Err(err) => {
                let message = Self::failure_message(tracker.current(), &err);
                self.fail(&mut tracker, &execution, &message).await?;
                if err.is_propagated() {
                    error!(error = %err, "execution aborted");
                    Err(err)
                } else {
                    Ok(ExecutionStatus::Failed)
                }
            }
        }
    }

    async fn run_stages(
        &self,
        execution: &PipelineExecution,
        tracker: &mut StageTracker,
        guard: &mut Option<LockGuard>,
    ) -> Result<StageOutcome> {
        let id = execution.execution_id.as_str();

        // verified
        let (pipeline, input_size) = match self.verify(execution).await? {
            Ok(verified) => verified,
            Err(message) => return Ok(StageOutcome::Failed(message)),
        };
        self.advance(tracker, id, OrchestratorStage::Verified).await?;

        // locked
        let key = LockKey::new(&execution.tenant_id, lock_resources::pipeline(&execution.pipeline_id));
        *guard = Some(self.locks.acquire(&key, id).await?);
        let Some(execution) = self.stores.executions.claim(id, Utc::now()).await? else {
            let current = self.stores.executions.get(id).await?;
            return Ok(StageOutcome::AlreadyClaimed(
                current.map_or(execution.status, |e| e.status),
            ));
        };
        self.advance(tracker, id, OrchestratorStage::Locked).await?;
        let deadline = self.budget_deadline(&execution);

        // calculated
        let context = execution.context();
        let chunk_size = pipeline.chunk_size_bytes(self.config.calculation.chunk_size_bytes);
        let plan = ChunkPlan::plan(&execution.input.key, input_size, chunk_size)?;
        let source = SourceContext {
            input_key: execution.input.key.clone(),
            object_size: input_size,
            pipeline_version: pipeline.version,
            outputs: pipeline.outputs.clone(),
        };
        let results = self.calculator.dispatch(&context, &plan, &source, deadline).await;
        self.advance(tracker, id, OrchestratorStage::Calculated).await?;

        if Instant::now() >= deadline {
            let report = self.gate.gate_expired(&execution, plan.expected_chunk_count()).await?;
            return Ok(StageOutcome::Failed(Self::gate_message(report)));
        }

        // loaded
        self.load_results(&context, &results).await?;
        let report = self
            .await_gate(&execution, plan.expected_chunk_count(), deadline)
            .await?;
        if report.status() == GateStatus::Failed {
            return Ok(StageOutcome::Failed(Self::gate_message(report)));
        }
        self.stores
            .activities
            .refresh_latest_values(&context.pipeline_id, &context.execution_id)
            .await?;
        self.advance(tracker, id, OrchestratorStage::Loaded).await?;

        // aggregated
        self.outputs.aggregate(&context, &pipeline).await?;
        if pipeline.triggers_metric_aggregations() {
            let key = LockKey::new(&context.tenant_id, lock_resources::aggregation(&context.pipeline_id));
            self.locks
                .with_lock(&key, id, || async {
                    let step = self.aggregation.plan(&context, &pipeline).await?;
                    self.aggregation.run_to_completion(step).await
                })
                .await?;
        } else {
            self.jobs.save_for_execution(&context).await?;
        }
        self.advance(tracker, id, OrchestratorStage::Aggregated).await?;

        Ok(StageOutcome::Completed)
    }

    /// Runtime instant at which the execution's budget, counted from its
    /// first claim, runs out
    fn budget_deadline(&self, execution: &PipelineExecution) -> Instant {
        let spent = Utc::now()
            .signed_duration_since(execution.budget_start())
            .to_std()
            .unwrap_or_default();
        let remaining = self
            .config
            .gate
            .execution_timeout()
            .saturating_sub(spent)
            .min(MAX_BUDGET_WAIT);
        Instant::now() + remaining
    }

    /// Load at most `calculation.max_concurrency` results at a time
    async fn load_results(&self, context: &ExecutionContext, results: &[CalculationResult]) -> Result<()> {
        for batch in results.chunks(self.config.calculation.max_concurrency.max(1)) {
            let mut loads = Vec::with_capacity(batch.len());
            for result in batch {
                loads.push(self.loader.load(context, result));
            }
            for outcome in join_all(loads).await {
                outcome?;
            }
        }
        Ok(())
    }

    fn gate_message(report: GateReport) -> String {
        report
            .decision
            .message
            .unwrap_or_else(|| status_messages::INSERT_ERROR.to_string())
    }

    /// Outer `Err` is a store failure; inner `Err` is the status message of
    /// a verification failure
    async fn verify(
        &self,
        execution: &PipelineExecution,
    ) -> Result<std::result::Result<(PipelineDefinition, u64), String>> {
        if execution.input.key.trim().is_empty() {
            return Ok(Err("execution has no input reference".to_string()));
        }
        let Some(pipeline) = self
            .stores
            .pipelines
            .pipeline(&execution.tenant_id, &execution.pipeline_id)
            .await?
        else {
            let missing = ConfigurationError::PipelineNotFound {
                pipeline_id: execution.pipeline_id.clone(),
            };
            return Ok(Err(missing.to_string()));
        };
        match self.stores.objects.head(&execution.input.key).await? {
            None => Ok(Err(format!("input object '{}' does not exist", execution.input.key))),
            Some(meta) if meta.size == 0 => Ok(Err(format!("input object '{}' is empty", execution.input.key))),
            Some(meta) => Ok(Ok((pipeline, meta.size))),
        }
    }

    async fn await_gate(&self, execution: &PipelineExecution, expected: u32, deadline: Instant) -> Result<GateReport> {
        loop {
            let report = if Instant::now() >= deadline {
                self.gate.gate_expired(execution, expected).await?
            } else {
                self.gate.gate(execution, expected).await?
            };
            if report.status().is_terminal() {
                return Ok(report);
            }
            let next_poll = Instant::now() + self.config.gate.poll_interval();
            tokio::time::sleep_until(next_poll.min(deadline)).await;
        }
    }

    async fn advance(&self, tracker: &mut StageTracker, execution_id: &str, next: OrchestratorStage) -> Result<()> {
        let previous = tracker.advance(next)?;
        self.stores
            .executions
            .record_transition(execution_id, Some(previous), next)
            .await?;
        Ok(())
    }

    async fn fail(&self, tracker: &mut StageTracker, execution: &PipelineExecution, message: &str) -> Result<()> {
        warn!(
            execution_id = %execution.execution_id,
            stage = %tracker.current(),
            message,
            "execution failed"
        );
        self.stores
            .executions
            .update_status(&execution.execution_id, ExecutionStatus::Failed, Some(message.to_string()))
            .await?;
        self.advance(tracker, &execution.execution_id, OrchestratorStage::Failed)
            .await?;
        log_execution_operation(
            "run",
            &execution.pipeline_id,
            &execution.execution_id,
            "failed",
            Some(message),
        );
        Ok(())
    }

    /// `stage` is the last stage reached before the error
    fn failure_message(stage: OrchestratorStage, err: &PipelineError) -> String {
        match (stage, err) {
            (_, PipelineError::Lock(LockError::Timeout { .. })) => {
                format!("{}: {err}", status_messages::LOCK_ERROR)
            }
            (OrchestratorStage::Locked, _) => format!("{}: {err}", status_messages::CALCULATION_ERROR),
            (OrchestratorStage::Calculated, _) => format!("{}: {err}", status_messages::INSERT_ERROR),
            (OrchestratorStage::Loaded, _) => format!("{}: {err}", status_messages::AGGREGATION_ERROR),
            _ => format!("{stage} stage failed: {err}"),
        }
    }
}
