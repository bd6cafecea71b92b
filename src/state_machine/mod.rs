// Execution lifecycle states and the orchestrator's one-directional stage tracker.

pub mod states;

pub use states::{ExecutionStatus, OrchestratorStage};

use crate::error::{PipelineError, Result};

/// Tracks the orchestrator's position and rejects any backwards step
#[derive(Debug, Clone)]
pub struct StageTracker {
    current: OrchestratorStage,
    history: Vec<OrchestratorStage>,
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            current: OrchestratorStage::Received,
            history: vec![OrchestratorStage::Received],
        }
    }

    pub fn current(&self) -> OrchestratorStage {
        self.current
    }

    pub fn history(&self) -> &[OrchestratorStage] {
        &self.history
    }

    /// Move to `next`, returning the stage that was left
    pub fn advance(&mut self, next: OrchestratorStage) -> Result<OrchestratorStage> {
        if !self.current.can_advance_to(next) {
            return Err(PipelineError::state_transition(format!(
                "cannot move from {} to {}",
                self.current, next
            )));
        }
        let previous = self.current;
        self.current = next;
        self.history.push(next);
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_records_history_and_rejects_revisits() {
        let mut tracker = StageTracker::new();
        tracker.advance(OrchestratorStage::Verified).unwrap();
        tracker.advance(OrchestratorStage::Locked).unwrap();
        assert!(tracker.advance(OrchestratorStage::Verified).is_err());
        let left = tracker.advance(OrchestratorStage::Failed).unwrap();
        assert_eq!(left, OrchestratorStage::Locked);
        assert!(tracker.advance(OrchestratorStage::Released).is_err());
        assert_eq!(tracker.history().len(), 4);
    }
}
