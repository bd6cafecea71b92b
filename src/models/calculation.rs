//! Calculation worker contract types: the outbound request, the inbound
//! callback and the per-chunk result the dispatcher hands to the loader.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::chunk::Chunk;
use super::execution::ExecutionContext;
use super::pipeline::TransformerOutput;

/// Single-use token a worker presents to resume the suspended chunk
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompletionToken(String);

impl CompletionToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CompletionToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the worker needs to find and interpret the input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceContext {
    pub input_key: String,
    pub object_size: u64,
    pub pipeline_version: i32,
    pub outputs: Vec<TransformerOutput>,
}

/// `{chunk, sourceContext, completionToken}` sent to a calculation worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationRequest {
    pub context: ExecutionContext,
    pub chunk: Chunk,
    pub source: SourceContext,
    /// Where the worker is expected to write its output artifact
    pub output_key: String,
    pub completion_token: CompletionToken,
}

/// `{completionToken, outputArtifactRef, errors[]}` reported by a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculationCallback {
    pub completion_token: CompletionToken,
    pub output_ref: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub no_activities_processed: bool,
}

impl CalculationCallback {
    pub fn success(token: CompletionToken, output_ref: impl Into<String>) -> Self {
        Self {
            completion_token: token,
            output_ref: Some(output_ref.into()),
            errors: Vec::new(),
            no_activities_processed: false,
        }
    }

    pub fn failure(token: CompletionToken, errors: Vec<String>) -> Self {
        Self {
            completion_token: token,
            output_ref: None,
            errors,
            no_activities_processed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculationStatus {
    Succeeded,
    Failed,
}

/// Outcome of calculating one chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalculationResult {
    pub sequence: u32,
    pub status: CalculationStatus,
    pub output_ref: Option<String>,
    pub errors: Vec<String>,
    pub no_activities_processed: bool,
    /// Worker invocations made, including the successful one
    pub attempts: u32,
}

impl CalculationResult {
    pub fn from_callback(sequence: u32, callback: CalculationCallback, attempts: u32) -> Self {
        let status = if callback.errors.is_empty() && callback.output_ref.is_some() {
            CalculationStatus::Succeeded
        } else {
            CalculationStatus::Failed
        };
        let mut errors = callback.errors;
        if status == CalculationStatus::Failed && errors.is_empty() {
            errors.push("worker reported completion without an output artifact".into());
        }
        Self {
            sequence,
            status,
            output_ref: callback.output_ref,
            errors,
            no_activities_processed: callback.no_activities_processed,
            attempts,
        }
    }

    pub fn failed(sequence: u32, errors: Vec<String>, attempts: u32) -> Self {
        Self {
            sequence,
            status: CalculationStatus::Failed,
            output_ref: None,
            errors,
            no_activities_processed: false,
            attempts,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == CalculationStatus::Failed
    }
}

/// Dispatcher-side record of a chunk awaiting its callback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCall {
    pub token: CompletionToken,
    pub execution_id: String,
    pub chunk: Chunk,
    pub issued_at: DateTime<Utc>,
}
