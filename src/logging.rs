//! # Structured Logging Module
//!
//! Environment-aware structured logging for the engine. Console output is
//! human-readable in development and JSON in production (or whenever
//! `PIPELINE_ENGINE_LOG_FORMAT=json`).

use chrono::Utc;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| get_log_level(&environment));
        let json = use_json_format(&environment);

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(false)
                .json()
                .with_filter(EnvFilter::new(filter))
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true)
                .with_filter(EnvFilter::new(filter))
                .boxed()
        };

        // A host application may already own the global subscriber
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = process::id(),
            environment = %environment,
            json = json,
            "Structured logging initialized"
        );
    });
}

fn get_environment() -> String {
    std::env::var("PIPELINE_ENGINE_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

fn use_json_format(environment: &str) -> bool {
    match std::env::var("PIPELINE_ENGINE_LOG_FORMAT") {
        Ok(format) => format.eq_ignore_ascii_case("json"),
        Err(_) => environment == "production",
    }
}

/// Log structured data for execution lifecycle operations
pub fn log_execution_operation(
    operation: &str,
    pipeline_id: &str,
    execution_id: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        pipeline_id = %pipeline_id,
        execution_id = %execution_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "EXECUTION_OPERATION"
    );
}

/// Log structured data for per-chunk operations
pub fn log_chunk_operation(
    operation: &str,
    execution_id: &str,
    sequence: u32,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        execution_id = %execution_id,
        sequence = sequence,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "CHUNK_OPERATION"
    );
}

/// Log structured data for metric aggregation operations
pub fn log_aggregation_operation(
    operation: &str,
    pipeline_id: &str,
    metric: Option<&str>,
    group_id: Option<&str>,
    status: &str,
    duration_ms: Option<u64>,
) {
    tracing::info!(
        operation = %operation,
        pipeline_id = %pipeline_id,
        metric = metric,
        group_id = group_id,
        status = %status,
        duration_ms = duration_ms,
        timestamp = %Utc::now().to_rfc3339(),
        "AGGREGATION_OPERATION"
    );
}

/// Log structured data for lock operations
pub fn log_lock_operation(operation: &str, name: &str, holder: &str, status: &str) {
    tracing::debug!(
        operation = %operation,
        lock = %name,
        holder = %holder,
        status = %status,
        timestamp = %Utc::now().to_rfc3339(),
        "LOCK_OPERATION"
    );
}
