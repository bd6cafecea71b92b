//! # Error Types
//!
//! Crate-wide error handling built on `thiserror`. Component errors
//! (`StoreError`, `LockError`, `DependencyError`, `ConfigurationError`) nest
//! into [`PipelineError`] through `#[from]` conversions so `?` works across
//! layer boundaries.
//!
//! Every error maps onto one [`ErrorCategory`]. The orchestrator uses the
//! category to decide between translating a failure into the execution's
//! status message and propagating it to its caller.

use std::fmt;
use thiserror::Error;

pub use crate::config::error::ConfigurationError;

/// Coarse classification used by the orchestrator's propagation policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Throttling, dropped connections; retried where they occur
    Transient,
    /// Malformed/empty artifacts and per-record calculation errors
    Data,
    /// Wall-clock budget or bounded wait exceeded
    Timeout,
    /// Operator-correctable misconfiguration, never retried
    Configuration,
    /// Duplicate delivery, a success no-op
    Idempotency,
    /// Unrecoverable persistence failure
    Store,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Data => "data",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Idempotency => "idempotency",
            ErrorCategory::Store => "store",
        };
        f.write_str(label)
    }
}

/// Failures raised by object, relational and queue stores
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error during {operation}: {message}")]
    Database { operation: String, message: String },

    #[error("Object not found: {key}")]
    ObjectNotFound { key: String },

    #[error("Invalid byte range for '{key}': {message}")]
    InvalidRange { key: String, message: String },

    #[error("Import into {table} failed, 0 rows were copied")]
    ZeroRowsCopied { table: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Invalid state change for {entity} {id}: {message}")]
    InvalidState {
        entity: String,
        id: String,
        message: String,
    },

    #[error("Queue operation failed: {queue}: {message}")]
    Queue { queue: String, message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("I/O error on '{path}': {message}")]
    Io { path: String, message: String },
}

impl StoreError {
    pub fn database<O: Into<String>, E: fmt::Display>(operation: O, error: E) -> Self {
        Self::Database {
            operation: operation.into(),
            message: error.to_string(),
        }
    }

    pub fn not_found<E: Into<String>, I: Into<String>>(entity: E, id: I) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn invalid_state<E: Into<String>, I: Into<String>, M: Into<String>>(
        entity: E,
        id: I,
        message: M,
    ) -> Self {
        Self::InvalidState {
            entity: entity.into(),
            id: id.into(),
            message: message.into(),
        }
    }

    pub fn queue<Q: Into<String>, E: fmt::Display>(queue: Q, error: E) -> Self {
        Self::Queue {
            queue: queue.into(),
            message: error.to_string(),
        }
    }

    pub fn io<P: Into<String>, E: fmt::Display>(path: P, error: E) -> Self {
        Self::Io {
            path: path.into(),
            message: error.to_string(),
        }
    }

    pub fn is_zero_rows_copied(&self) -> bool {
        matches!(self, StoreError::ZeroRowsCopied { .. })
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::database("query", err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization {
            message: err.to_string(),
        }
    }
}

/// Lock acquisition failures
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Timed out after {waited_ms}ms waiting for lock '{name}' (held by {holder:?})")]
    Timeout {
        name: String,
        holder: Option<String>,
        waited_ms: u64,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Metric dependency graph errors. All of them abort the aggregation pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DependencyError {
    #[error("Metric '{metric}' already referenced but discovered again in metric dependency path via '{via}'")]
    Duplicated { metric: String, via: String },

    #[error("Metric '{metric}' lists itself as an input metric")]
    SelfReference { metric: String },

    #[error("Metric '{metric}' referenced by '{referenced_by}' is not defined")]
    UnknownMetric {
        metric: String,
        referenced_by: String,
    },
}

/// Crate-level error
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Metric dependency error: {0}")]
    Dependency(#[from] DependencyError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Duplicate delivery: {0}")]
    Duplicate(String),

    #[error("Unknown or already used completion token: {0}")]
    UnknownToken(String),

    #[error("State transition error: {0}")]
    StateTransition(String),
}

impl PipelineError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    pub fn data<S: Into<String>>(message: S) -> Self {
        Self::Data(message.into())
    }

    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::Transient(message.into())
    }

    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout(message.into())
    }

    pub fn state_transition<S: Into<String>>(message: S) -> Self {
        Self::StateTransition(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::Configuration(_) | PipelineError::Dependency(_) => {
                ErrorCategory::Configuration
            }
            PipelineError::Store(_) | PipelineError::Lock(LockError::Store(_)) => {
                ErrorCategory::Store
            }
            PipelineError::Lock(LockError::Timeout { .. }) | PipelineError::Timeout(_) => {
                ErrorCategory::Timeout
            }
            PipelineError::Validation(_)
            | PipelineError::Data(_)
            | PipelineError::StateTransition(_) => ErrorCategory::Data,
            PipelineError::Transient(_) => ErrorCategory::Transient,
            PipelineError::Duplicate(_) | PipelineError::UnknownToken(_) => {
                ErrorCategory::Idempotency
            }
        }
    }

    /// Whether the orchestrator returns this error to its caller instead of
    /// folding it into the execution's status message.
    pub fn is_propagated(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Configuration | ErrorCategory::Store
        )
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Store(err.into())
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Store(err.into())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

pub type StoreResult<T> = std::result::Result<T, StoreError>;
