use serde::{Deserialize, Serialize};
use std::fmt;

/// Persisted lifecycle status of a pipeline execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, not yet picked up
    Waiting,
    /// Lock held, chunks being calculated and loaded
    InProgress,
    /// All chunks loaded, metrics being aggregated
    CalculatingMetrics,
    /// Finished successfully
    Success,
    /// Finished with an error
    Failed,
}

impl ExecutionStatus {
    /// Check if this is a terminal state (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a legal lifecycle step.
    /// Re-writing the current non-terminal status is allowed so re-entrant
    /// stages can be replayed.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (from, to) if *from == to => true,
            (_, Failed) => true,
            (Waiting, InProgress) => true,
            (InProgress, CalculatingMetrics) => true,
            (CalculatingMetrics, Success) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::InProgress => "in_progress",
            Self::CalculatingMetrics => "calculating_metrics",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "in_progress" => Ok(Self::InProgress),
            "calculating_metrics" => Ok(Self::CalculatingMetrics),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid execution status: {s}")),
        }
    }
}

/// Orchestrator stages, in the only order they may be visited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorStage {
    Received,
    Verified,
    Locked,
    Calculated,
    Loaded,
    Aggregated,
    Released,
    Succeeded,
    Failed,
}

impl OrchestratorStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Forward-only: any later stage is reachable, `failed` from anywhere
    /// non-terminal, `succeeded` only after `released`.
    pub fn can_advance_to(&self, next: OrchestratorStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed => true,
            Self::Succeeded => *self == Self::Released,
            _ => next > *self,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Verified => "verified",
            Self::Locked => "locked",
            Self::Calculated => "calculated",
            Self::Loaded => "loaded",
            Self::Aggregated => "aggregated",
            Self::Released => "released",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for OrchestratorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrchestratorStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "received" => Ok(Self::Received),
            "verified" => Ok(Self::Verified),
            "locked" => Ok(Self::Locked),
            "calculated" => Ok(Self::Calculated),
            "loaded" => Ok(Self::Loaded),
            "aggregated" => Ok(Self::Aggregated),
            "released" => Ok(Self::Released),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid orchestrator stage: {s}")),
        }
    }
}
