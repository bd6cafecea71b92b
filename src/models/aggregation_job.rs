//! # Deferred Aggregation Jobs
//!
//! When a pipeline does not trigger metric aggregation inline, the execution
//! leaves behind a job capturing its affected time range and group leaves.
//! Pending jobs of the same pipeline whose leaves overlap are merged instead
//! of queued twice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::time_range::AffectedTimeRange;
use crate::storage::hierarchy::{is_ancestor_or_self, merge_group_leaves};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationJobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl AggregationJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for AggregationJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AggregationJobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid aggregation job status: {s}")),
        }
    }
}

/// One position in a job's group processing queue (1-based)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupQueueEntry {
    pub order: u32,
    pub group: String,
}

pub fn groups_queue(leaves: &[String]) -> Vec<GroupQueueEntry> {
    leaves
        .iter()
        .enumerate()
        .map(|(i, group)| GroupQueueEntry {
            order: i as u32 + 1,
            group: group.clone(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationJob {
    pub id: String,
    pub tenant_id: String,
    pub pipeline_id: String,
    pub group_context_id: String,
    pub time_range: AffectedTimeRange,
    pub groups_queue: Vec<GroupQueueEntry>,
    pub status: AggregationJobStatus,
    pub status_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AggregationJob {
    pub fn new(
        tenant_id: impl Into<String>,
        pipeline_id: impl Into<String>,
        group_context_id: impl Into<String>,
        time_range: AffectedTimeRange,
        leaves: &[String],
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.into(),
            pipeline_id: pipeline_id.into(),
            group_context_id: group_context_id.into(),
            time_range,
            groups_queue: groups_queue(leaves),
            status: AggregationJobStatus::Pending,
            status_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn group_leaves(&self) -> Vec<String> {
        self.groups_queue.iter().map(|g| g.group.clone()).collect()
    }

    /// Two jobs overlap when any leaf of one equals or contains a leaf of the other
    pub fn overlaps(&self, leaves: &[String]) -> bool {
        self.groups_queue.iter().any(|existing| {
            leaves.iter().any(|leaf| {
                is_ancestor_or_self(&existing.group, leaf) || is_ancestor_or_self(leaf, &existing.group)
            })
        })
    }

    /// Fold another execution's range and leaves into this pending job
    pub fn absorb(&mut self, time_range: &AffectedTimeRange, leaves: &[String]) {
        let merged = merge_group_leaves(&self.group_leaves(), leaves);
        self.groups_queue = groups_queue(&merged);
        self.time_range = self.time_range.union(time_range);
        self.updated_at = Utc::now();
    }
}
