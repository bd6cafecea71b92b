//! # System Constants
//!
//! Operational defaults and user-visible status strings shared by the engine
//! components.

/// Defaults used when configuration does not override them
pub mod defaults {
    /// Semaphore capacity for concurrent chunk dispatch
    pub const MAX_CONCURRENT_CHUNKS: usize = 10;
    /// One chunk per megabyte of input
    pub const CHUNK_SIZE_BYTES: u64 = BYTES_PER_MB;
    pub const BYTES_PER_MB: u64 = 1_000_000;

    pub const RETRY_MAX_ATTEMPTS: u32 = 6;
    pub const RETRY_BASE_DELAY_MS: u64 = 2_000;
    pub const RETRY_BACKOFF_RATE: f64 = 2.0;

    /// Two hours from execution start
    pub const EXECUTION_TIMEOUT_SECONDS: u64 = 7_200;
    /// Execution budget plus a quarter hour of slack for release
    pub const LOCK_TTL_SECONDS: u64 = EXECUTION_TIMEOUT_SECONDS + 900;

    /// Zero-row probe: bytes read from the head of the artifact
    pub const PROBE_BYTES: u64 = 1_000;
    /// Zero-row probe: records inspected
    pub const PROBE_RECORDS: usize = 5;
}

/// Status messages written onto failed executions
pub mod status_messages {
    pub const CALCULATION_ERROR: &str =
        "error when performing calculation, review the pipeline execution error log for further info";
    pub const INSERT_ERROR: &str = "error when inserting activities to database";
    pub const AGGREGATION_ERROR: &str = "error when aggregating metrics";
    pub const LOCK_ERROR: &str = "could not acquire the pipeline write lock";
}

/// Lock resource names
pub mod lock_resources {
    pub fn pipeline(pipeline_id: &str) -> String {
        format!("pipeline:{pipeline_id}")
    }

    pub fn aggregation(pipeline_id: &str) -> String {
        format!("aggregation:{pipeline_id}")
    }
}

/// Root of every group hierarchy
pub const ROOT_GROUP: &str = "/";
