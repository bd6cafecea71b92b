//! # Orchestration Engine
//!
//! Runs one pipeline execution end to end: chunked calculation through an
//! external worker, bulk loading of the produced activities, the result
//! gate, and metric aggregation (inline, or deferred to aggregation jobs).
//!
//! ## Core Components
//!
//! - **Orchestrator**: sequences the stages and owns the pipeline lock
//! - **ChunkedCalculator**: fans chunk requests out to a [`CalculationWorker`]
//!   and waits for their completion callbacks
//! - **BulkLoader**: stages and migrates one chunk's output, then writes its marker
//! - **ResultAggregator**: evaluates chunk markers against the execution budget
//!   and garbage-collects staging areas and outputs
//! - **OutputAggregator**: folds raw activities into per-date, per-group-by rows
//! - **MetricAggregationEngine**: day aggregation plus rollups, one metric per step
//! - **AggregationJobService / AggregationJobWorker**: deferred aggregation
//! - **LockManager**: named leases over a [`crate::storage::LockTable`]

pub mod aggregation_jobs;
pub mod bulk_loader;
pub mod chunked_calculator;
pub mod completion_registry;
pub mod lock_manager;
pub mod metric_aggregation;
pub mod metric_dependency;
pub mod orchestrator;
pub mod output_aggregation;
pub mod result_aggregator;
pub mod retry;

pub use aggregation_jobs::{AggregationJobService, AggregationJobWorker, JobOutcome};
pub use bulk_loader::{BulkLoader, LoadOutcome};
pub use chunked_calculator::{
    CalculationWorker, ChunkedCalculator, QueueCalculationWorker, WorkerError,
};
pub use completion_registry::CompletionRegistry;
pub use lock_manager::{LockGuard, LockManager};
pub use metric_aggregation::{AggregationStep, MetricAggregationEngine, StepStatus};
pub use metric_dependency::{resolve_metric_queue, MetricGraph};
pub use orchestrator::{EngineStores, Orchestrator};
pub use output_aggregation::{fold_outputs, OutputAggregator};
pub use result_aggregator::{
    evaluate_gate, GarbageCollection, GateDecision, GateReport, GateStatus, ResultAggregator,
};
pub use retry::RetryPolicy;
