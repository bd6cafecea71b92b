//! # Database Operations
//!
//! PostgreSQL implementations of the storage collaborators, on one `sqlx`
//! pool.
//!
//! ## Key Components
//!
//! - [`connection`] - pool construction and health check
//! - [`migrations`] - embedded schema migrations
//! - [`relational_store`] - staging tables, canonical activities and metric cells
//! - [`execution_repository`], [`aggregation_jobs`] - lifecycle records
//! - [`lock_table`], [`work_queue`], [`catalog`]
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use pipeline_engine::config::EngineConfig;
//! use pipeline_engine::database;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::default();
//! let pool = database::connect(&config.database).await?;
//! database::run_migrations(&pool).await?;
//! let stores = database::postgres_stores(pool, &config.storage);
//! # let _ = stores;
//! # Ok(())
//! # }
//! ```

pub mod aggregation_jobs;
pub mod catalog;
pub mod connection;
pub mod execution_repository;
pub mod lock_table;
pub mod migrations;
pub mod relational_store;
pub mod work_queue;

pub use aggregation_jobs::PgAggregationJobRepository;
pub use catalog::PgCatalog;
pub use connection::{connect, health_check};
pub use execution_repository::PgExecutionRepository;
pub use lock_table::PgLockTable;
pub use migrations::run as run_migrations;
pub use relational_store::{PgRelationalStore, PgStagingSession};
pub use work_queue::PgWorkQueue;

use sqlx::PgPool;
use std::sync::Arc;

use crate::config::StorageConfig;
use crate::orchestration::EngineStores;
use crate::storage::{object_store_from_config, PathGroupHierarchy};

/// Every relational collaborator on `pool`; objects come from `storage`
pub fn postgres_stores(pool: PgPool, storage: &StorageConfig) -> EngineStores {
    let relational = PgRelationalStore::new(pool.clone());
    let catalog = Arc::new(PgCatalog::new(pool.clone()));
    EngineStores {
        objects: object_store_from_config(storage),
        activities: Arc::new(relational.clone()),
        metrics: Arc::new(relational),
        executions: Arc::new(PgExecutionRepository::new(pool.clone())),
        jobs: Arc::new(PgAggregationJobRepository::new(pool.clone())),
        pipelines: catalog.clone(),
        metric_catalog: catalog,
        locks: Arc::new(PgLockTable::new(pool.clone())),
        queue: Arc::new(PgWorkQueue::new(pool)),
        hierarchy: Arc::new(PathGroupHierarchy),
    }
}
