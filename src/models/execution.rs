//! # Pipeline Execution Model
//!
//! One run of a pipeline over one input object. The orchestrator owns the
//! record and mutates it at every stage change; once `success` or `failed` it
//! only accepts status-message amendments.
//!
//! Every stage change is also appended to an [`ExecutionTransition`] audit
//! trail, with `most_recent` marking the current row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::{ExecutionStatus, OrchestratorStage};

/// Reference to the raw input object in the object store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputReference {
    pub key: String,
}

impl InputReference {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineExecution {
    pub pipeline_id: String,
    pub execution_id: String,
    pub tenant_id: String,
    pub group_context_id: String,
    pub input: InputReference,
    pub status: ExecutionStatus,
    pub status_message: Option<String>,
    pub audit_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the write lock is first obtained; the gate's budget runs
    /// from here.
    pub started_at: Option<DateTime<Utc>>,
}

impl PipelineExecution {
    pub fn context(&self) -> ExecutionContext {
        ExecutionContext {
            tenant_id: self.tenant_id.clone(),
            pipeline_id: self.pipeline_id.clone(),
            execution_id: self.execution_id.clone(),
            group_context_id: self.group_context_id.clone(),
        }
    }

    /// Start of the execution's wall-clock budget
    pub fn budget_start(&self) -> DateTime<Utc> {
        self.started_at.unwrap_or(self.created_at)
    }
}

/// Request to create a new execution in `waiting`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPipelineExecution {
    pub pipeline_id: String,
    pub tenant_id: String,
    pub group_context_id: String,
    pub input_key: String,
}

impl NewPipelineExecution {
    pub fn into_execution(self) -> PipelineExecution {
        let now = Utc::now();
        PipelineExecution {
            pipeline_id: self.pipeline_id,
            execution_id: Uuid::new_v4().to_string(),
            tenant_id: self.tenant_id,
            group_context_id: self.group_context_id,
            input: InputReference::new(self.input_key),
            status: ExecutionStatus::Waiting,
            status_message: None,
            audit_version: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
        }
    }
}

/// Identity and tenant scope handed to every component of one execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub tenant_id: String,
    pub pipeline_id: String,
    pub execution_id: String,
    pub group_context_id: String,
}

/// Audit row for an orchestrator stage change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTransition {
    pub execution_id: String,
    pub from_stage: Option<OrchestratorStage>,
    pub to_stage: OrchestratorStage,
    pub sort_key: i32,
    pub most_recent: bool,
    pub created_at: DateTime<Utc>,
}
