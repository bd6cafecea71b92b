//! # Queue Message Formats
//!
//! Payloads handed off through the deferred-work queue. Messages are stored
//! as JSON with a `type` tag so one queue table can carry both kinds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::CalculationRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkMessage {
    /// A deferred metric aggregation job is ready to run
    AggregationJob {
        job_id: String,
        tenant_id: String,
        pipeline_id: String,
    },
    /// A chunk to be calculated by an out-of-process worker
    CalculationRequest(CalculationRequest),
}

impl WorkMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkMessage::AggregationJob { .. } => "aggregation_job",
            WorkMessage::CalculationRequest(_) => "calculation_request",
        }
    }

    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self)
    }
}

/// A message leased from a queue. It stays invisible to other readers until
/// its visibility timeout lapses or it is deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub id: i64,
    pub queue: String,
    pub message: WorkMessage,
    /// Deliveries so far, including this one
    pub read_count: i32,
    pub enqueued_at: DateTime<Utc>,
}
