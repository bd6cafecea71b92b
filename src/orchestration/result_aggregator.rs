//! # Result Aggregator
//!
//! The poll-driven gate over an execution's chunk markers.
//!
//! [`evaluate_gate`] is a pure function of persisted state (expected chunk
//! count, the markers present, the execution's start time and the clock), so
//! it can be re-invoked cheaply until it returns a terminal status. The wall
//! clock budget is checked before anything else: a stalled execution fails
//! even if every chunk that did report succeeded.
//!
//! [`ResultAggregator::gate`] wraps the decision with its side effects. On a
//! terminal status it drops the execution's staging areas and deletes the
//! per-chunk calculation outputs in one batch; markers are kept. On success
//! it moves the execution to `calculating_metrics`. While in progress it
//! changes nothing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::config::GateConfig;
use crate::constants::status_messages;
use crate::error::Result;
use crate::logging::log_execution_operation;
use crate::models::{ChunkMarker, ChunkOutcome, ChunkStage, PipelineExecution};
use crate::state_machine::ExecutionStatus;
use crate::storage::{ActivityStore, ExecutionRepository, ObjectKeys, ObjectStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    InProgress,
    Succeeded,
    Failed,
}

impl GateStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GateStatus::InProgress)
    }
}

impl fmt::Display for GateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateStatus::InProgress => f.write_str("in_progress"),
            GateStatus::Succeeded => f.write_str("succeeded"),
            GateStatus::Failed => f.write_str("failed"),
        }
    }
}

/// Result of one gate evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    pub status: GateStatus,
    /// Recorded outcome per sequence, for the markers that exist
    pub outcomes: BTreeMap<u32, ChunkOutcome>,
    pub no_activities_chunks: usize,
    pub timed_out: bool,
    /// Human-readable failure summary, set when `status` is `failed`
    pub message: Option<String>,
}

/// Decide the gate from persisted state alone.
///
/// Markers outside `0..expected` and repeated sequences are ignored.
pub fn evaluate_gate(
    expected: u32,
    markers: &[ChunkMarker],
    started_at: DateTime<Utc>,
    now: DateTime<Utc>,
    timeout: Duration,
) -> GateDecision {
    let mut by_sequence: BTreeMap<u32, &ChunkMarker> = BTreeMap::new();
    for marker in markers.iter().filter(|m| m.sequence < expected) {
        by_sequence.entry(marker.sequence).or_insert(marker);
    }
    let outcomes: BTreeMap<u32, ChunkOutcome> =
        by_sequence.iter().map(|(seq, m)| (*seq, m.outcome)).collect();
    let no_activities_chunks = by_sequence
        .values()
        .filter(|m| !m.is_failed() && m.no_activities_processed)
        .count();

    let elapsed = now.signed_duration_since(started_at);
    let budget = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::weeks(52_000));
    if elapsed >= budget {
        let unfinished: Vec<u32> = (0..expected)
            .filter(|seq| outcomes.get(seq) != Some(&ChunkOutcome::Success))
            .collect();
        let mut message = format!("execution exceeded its {}s budget", timeout.as_secs());
        if !unfinished.is_empty() {
            message.push_str(&format!(" (chunks {})", join_sequences(&unfinished)));
        }
        return GateDecision {
            status: GateStatus::Failed,
            outcomes,
            no_activities_chunks,
            timed_out: true,
            message: Some(message),
        };
    }

    if (by_sequence.len() as u32) < expected {
        return GateDecision {
            status: GateStatus::InProgress,
            outcomes,
            no_activities_chunks,
            timed_out: false,
            message: None,
        };
    }

    let failed_in = |stage: ChunkStage| -> Vec<u32> {
        by_sequence
            .values()
            .filter(|m| m.is_failed() && m.failed_stage.unwrap_or(ChunkStage::Load) == stage)
            .map(|m| m.sequence)
            .collect()
    };
    let calculation = failed_in(ChunkStage::Calculation);
    let load = failed_in(ChunkStage::Load);

    let mut parts = Vec::new();
    if !calculation.is_empty() {
        parts.push(format!(
            "{} (chunks {})",
            status_messages::CALCULATION_ERROR,
            join_sequences(&calculation)
        ));
    }
    if !load.is_empty() {
        parts.push(format!(
            "{} (chunks {})",
            status_messages::INSERT_ERROR,
            join_sequences(&load)
        ));
    }

    let status = if parts.is_empty() {
        GateStatus::Succeeded
    } else {
        GateStatus::Failed
    };
    GateDecision {
        status,
        outcomes,
        no_activities_chunks,
        timed_out: false,
        message: (!parts.is_empty()).then(|| parts.join("; ")),
    }
}

fn join_sequences(sequences: &[u32]) -> String {
    sequences
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// What a terminal gate cleaned up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GarbageCollection {
    pub staging_areas_dropped: usize,
    pub artifacts_deleted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateReport {
    pub decision: GateDecision,
    /// Set once the gate is terminal
    pub garbage_collected: Option<GarbageCollection>,
}

impl GateReport {
    pub fn status(&self) -> GateStatus {
        self.decision.status
    }
}

pub struct ResultAggregator {
    objects: Arc<dyn ObjectStore>,
    activities: Arc<dyn ActivityStore>,
    executions: Arc<dyn ExecutionRepository>,
    keys: ObjectKeys,
    config: GateConfig,
}

impl ResultAggregator {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        activities: Arc<dyn ActivityStore>,
        executions: Arc<dyn ExecutionRepository>,
        keys: ObjectKeys,
        config: GateConfig,
    ) -> Self {
        Self {
            objects,
            activities,
            executions,
            keys,
            config,
        }
    }

    pub async fn gate(&self, execution: &PipelineExecution, expected: u32) -> Result<GateReport> {
        self.gate_at(execution, expected, Utc::now()).await
    }

    /// Gate an execution whose budget ran out while the engine was still
    /// dispatching. The clock is pinned to at least the end of the budget so
    /// the decision is the timeout even if wall time lags the runtime timer.
    pub async fn gate_expired(&self, execution: &PipelineExecution, expected: u32) -> Result<GateReport> {
        let budget = chrono::Duration::from_std(self.config.execution_timeout())
            .unwrap_or_else(|_| chrono::Duration::weeks(52_000));
        let budget_end = execution
            .budget_start()
            .checked_add_signed(budget)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.gate_at(execution, expected, Utc::now().max(budget_end)).await
    }

    /// [`gate`](Self::gate) evaluated against an explicit clock
    #[instrument(skip(self, execution), fields(execution_id = %execution.execution_id))]
    pub async fn gate_at(
        &self,
        execution: &PipelineExecution,
        expected: u32,
        now: DateTime<Utc>,
    ) -> Result<GateReport> {
        let markers = self.read_markers(execution).await?;
        let decision = evaluate_gate(
            expected,
            &markers,
            execution.budget_start(),
            now,
            self.config.execution_timeout(),
        );

        if !decision.status.is_terminal() {
            debug!(
                reported = decision.outcomes.len(),
                expected,
                "gate still waiting on chunks"
            );
            return Ok(GateReport {
                decision,
                garbage_collected: None,
            });
        }

        let garbage_collected = self.collect_garbage(execution).await?;
        if decision.status == GateStatus::Succeeded {
            self.executions
                .update_status(&execution.execution_id, ExecutionStatus::CalculatingMetrics, None)
                .await?;
        }
        log_execution_operation(
            "gate",
            &execution.pipeline_id,
            &execution.execution_id,
            &decision.status.to_string(),
            decision.message.as_deref(),
        );
        Ok(GateReport {
            decision,
            garbage_collected: Some(garbage_collected),
        })
    }

    async fn read_markers(&self, execution: &PipelineExecution) -> Result<Vec<ChunkMarker>> {
        let prefix = self
            .keys
            .markers_prefix(&execution.pipeline_id, &execution.execution_id);
        let mut markers = Vec::new();
        for meta in self.objects.list(&prefix).await? {
            let bytes = self.objects.get(&meta.key).await?;
            markers.push(ChunkMarker::from_bytes(&bytes)?);
        }
        Ok(markers)
    }

    async fn collect_garbage(&self, execution: &PipelineExecution) -> Result<GarbageCollection> {
        let staging_areas_dropped = self
            .activities
            .drop_staging_areas(&execution.execution_id)
            .await?;
        let prefix = self
            .keys
            .chunk_outputs_prefix(&execution.pipeline_id, &execution.execution_id);
        let keys: Vec<String> = self
            .objects
            .list(&prefix)
            .await?
            .into_iter()
            .map(|m| m.key)
            .collect();
        let artifacts_deleted = if keys.is_empty() {
            0
        } else {
            self.objects.delete_batch(&keys).await?
        };
        info!(
            execution_id = %execution.execution_id,
            staging_areas_dropped,
            artifacts_deleted,
            "transient chunk resources reclaimed"
        );
        Ok(GarbageCollection {
            staging_areas_dropped,
            artifacts_deleted,
        })
    }
}
