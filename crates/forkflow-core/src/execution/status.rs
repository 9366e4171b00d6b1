use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status shared by execution, branch and step contexts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Context was created
    Created,
    /// Scheduled for execution
    Scheduled,
    /// Waiting for a dependency, e.g. parked at a merge point
    Waiting,
    /// Currently running
    Running,
    /// Paused by the orchestrator
    Paused,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Cancelled before finishing
    Cancelled,
}

impl ExecutionStatus {
    /// Whether no further status change is permitted
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;

        match (self, next) {
            (Created, Scheduled | Running | Cancelled | Failed) => true,
            (Scheduled, Waiting | Running | Cancelled | Failed) => true,
            (Waiting, Running | Cancelled | Failed) => true,
            (Running, Paused | Waiting | Completed | Failed | Cancelled) => true,
            (Paused, Running | Cancelled | Failed) => true,
            _ => false,
        }
    }
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        Self::Created
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
