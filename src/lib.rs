#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Pipeline Engine
//!
//! Multi-tenant pipeline execution engine. An execution takes one input
//! object through four stages:
//!
//! 1. **Calculate**: the input is split into byte-range chunks that are
//!    dispatched to an external calculation worker with bounded concurrency.
//!    The worker reports back through a completion token.
//! 2. **Load**: each chunk's output artifact is bulk-copied into a staging
//!    area and migrated into canonical activity tables. A terminal marker per
//!    chunk makes loading idempotent.
//! 3. **Gate**: chunk markers are evaluated against the expected count and the
//!    execution's wall-clock budget. Staging areas and outputs are
//!    garbage-collected once the gate is terminal.
//! 4. **Aggregate**: metrics fed by the pipeline are recomputed in dependency
//!    order for every affected group, leaf to root, then rolled up from days
//!    to weeks, months, quarters and years. Aggregation runs inline or is
//!    deferred to an aggregation job.
//!
//! A pipeline-scoped lease serializes executions of the same pipeline.
//!
//! ## Module Organization
//!
//! - [`orchestration`] - the orchestrator and its stage components
//! - [`storage`] - collaborator traits with in-memory implementations
//! - [`database`] - PostgreSQL implementations (feature `postgres`)
//! - [`messaging`] - deferred-work queue
//! - [`models`] - executions, chunks, activities, metrics, jobs
//! - [`state_machine`] - execution status and orchestrator stages
//! - [`config`] - layered configuration
//! - [`error`] - error taxonomy
//! - [`logging`] - structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pipeline_engine::config::EngineConfig;
//! use pipeline_engine::models::NewPipelineExecution;
//! use pipeline_engine::orchestration::{EngineStores, Orchestrator, QueueCalculationWorker};
//!
//! # async fn example() -> pipeline_engine::Result<()> {
//! let config = EngineConfig::default();
//! let (stores, _catalog) = EngineStores::in_memory();
//! let worker = Arc::new(QueueCalculationWorker::new(
//!     stores.queue.clone(),
//!     config.queue.calculation_queue_name.clone(),
//! ));
//! let orchestrator = Orchestrator::new(stores, worker, config);
//!
//! let execution = orchestrator
//!     .submit(NewPipelineExecution {
//!         pipeline_id: "p1".into(),
//!         tenant_id: "t1".into(),
//!         group_context_id: "/acme".into(),
//!         input_key: "inputs/p1/data.csv".into(),
//!     })
//!     .await?;
//! let status = orchestrator.run(&execution.execution_id).await?;
//! println!("execution finished as {status}");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
#[cfg(feature = "postgres")]
pub mod database;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod orchestration;
pub mod state_machine;
pub mod storage;

pub use config::{ConfigManager, ConfigurationError, EngineConfig};
pub use error::{ErrorCategory, PipelineError, Result, StoreError};
pub use orchestration::{EngineStores, Orchestrator};
pub use state_machine::{ExecutionStatus, OrchestratorStage};
