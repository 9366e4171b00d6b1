use crate::execution::status::ExecutionStatus;
use crate::types::{BranchPath, ExecutionId, StepId};
use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// Domain event trait for all lifecycle events of an execution
pub trait DomainEvent: Debug + Send + Sync {
    /// Returns the type of the event as a string
    fn event_type(&self) -> &'static str;

    /// Returns the execution ID this event is associated with
    fn execution_id(&self) -> &ExecutionId;

    /// Returns the timestamp when the event occurred
    fn timestamp(&self) -> DateTime<Utc>;
}

macro_rules! domain_event {
    ($ty:ident, $name:literal) => {
        impl DomainEvent for $ty {
            fn event_type(&self) -> &'static str {
                $name
            }

            fn execution_id(&self) -> &ExecutionId {
                &self.execution_id
            }

            fn timestamp(&self) -> DateTime<Utc> {
                self.timestamp
            }
        }
    };
}

/// Event: execution status changed
#[derive(Debug, Clone)]
pub struct ExecutionStatusChanged {
    /// The execution
    pub execution_id: ExecutionId,
    /// Previous status
    pub from: ExecutionStatus,
    /// New status
    pub to: ExecutionStatus,
    /// Error message, set only on Failed
    pub error: Option<String>,
    /// The timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
}

domain_event!(ExecutionStatusChanged, "execution.status_changed");

/// Event: branch status changed
#[derive(Debug, Clone)]
pub struct BranchStatusChanged {
    /// The execution
    pub execution_id: ExecutionId,
    /// The branch
    pub branch_path: BranchPath,
    /// Previous status
    pub from: ExecutionStatus,
    /// New status
    pub to: ExecutionStatus,
    /// Error message, set only on Failed
    pub error: Option<String>,
    /// The timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
}

domain_event!(BranchStatusChanged, "branch.status_changed");

/// Event: step status changed
#[derive(Debug, Clone)]
pub struct StepStatusChanged {
    /// The execution
    pub execution_id: ExecutionId,
    /// The branch
    pub branch_path: BranchPath,
    /// The step
    pub step_id: StepId,
    /// Retry attempt of the invocation
    pub attempt: u32,
    /// Previous status
    pub from: ExecutionStatus,
    /// New status
    pub to: ExecutionStatus,
    /// The timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
}

domain_event!(StepStatusChanged, "step.status_changed");

/// Event: a branch was forked from a parent step
#[derive(Debug, Clone)]
pub struct BranchForked {
    /// The execution
    pub execution_id: ExecutionId,
    /// The new branch
    pub branch_path: BranchPath,
    /// Branch it was forked from
    pub parent_branch: BranchPath,
    /// Step whose completion forked it
    pub parent_step: StepId,
    /// The timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
}

domain_event!(BranchForked, "branch.forked");

/// Event: a join point resolved its merge
#[derive(Debug, Clone)]
pub struct BranchMerged {
    /// The execution
    pub execution_id: ExecutionId,
    /// Branch containing the join point
    pub target_branch: BranchPath,
    /// Position of the join step
    pub target_step_position: u32,
    /// Branches whose output was adopted
    pub adopted: Vec<BranchPath>,
    /// Branches cancelled by the merge
    pub cancelled: Vec<BranchPath>,
    /// The timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
}

domain_event!(BranchMerged, "branch.merged");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_metadata() {
        let now = Utc::now();
        let event = BranchForked {
            execution_id: ExecutionId::from("exec-1"),
            branch_path: BranchPath::from("branchA"),
            parent_branch: BranchPath::main(),
            parent_step: StepId::from("s0"),
            timestamp: now,
        };

        assert_eq!(event.event_type(), "branch.forked");
        assert_eq!(event.execution_id(), &ExecutionId::from("exec-1"));
        assert_eq!(event.timestamp(), now);
    }
}
