//! # Messaging Module
//!
//! Deferred-work queue used to hand aggregation jobs and calculation requests
//! to asynchronous consumers. `crate::database::PgWorkQueue` provides the
//! PostgreSQL-backed queue.

pub mod message;
pub mod work_queue;

pub use message::{QueuedMessage, WorkMessage};
pub use work_queue::{MemoryWorkQueue, WorkQueue};
