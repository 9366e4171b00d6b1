use crate::domain::error_handling::ErrorStrategy;
use crate::types::{BranchPath, ExecutionId, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A step failure wrapped for the recovery pipeline.
///
/// Step-level errors never reach recovery unwrapped; the orchestrator builds
/// one of these with the code, component, type and timestamp of the fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Unique id of this error occurrence
    pub error_id: String,

    /// Stable error code
    pub code: String,

    /// Component that raised the error
    pub component: String,

    /// Error type, e.g. `Timeout` or `Io`
    pub error_type: String,

    /// Human-readable message
    pub message: String,

    /// When the error happened
    pub timestamp: DateTime<Utc>,

    /// Execution the error belongs to
    pub execution_id: ExecutionId,

    /// Branch the failing step belongs to
    #[serde(default)]
    pub branch_path: Option<BranchPath>,

    /// Failing step
    #[serde(default)]
    pub step_id: Option<StepId>,

    /// Attempts already made on the failing step, starting at 1
    #[serde(default)]
    pub attempt: u32,

    /// Policy configured for the failing step
    #[serde(default)]
    pub policy: ErrorStrategy,

    /// Whether the fault is transient (timeout, I/O, socket) and eligible for retry
    #[serde(default)]
    pub transient: bool,
}

impl ErrorContext {
    /// Create an error context
    pub fn new(
        execution_id: ExecutionId,
        code: impl Into<String>,
        component: impl Into<String>,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error_id: uuid::Uuid::new_v4().to_string(),
            code: code.into(),
            component: component.into(),
            error_type: error_type.into(),
            message: message.into(),
            timestamp: Utc::now(),
            execution_id,
            branch_path: None,
            step_id: None,
            attempt: 1,
            policy: ErrorStrategy::default(),
            transient: false,
        }
    }

    /// Attach the failing step
    pub fn at_step(mut self, branch_path: BranchPath, step_id: StepId) -> Self {
        self.branch_path = Some(branch_path);
        self.step_id = Some(step_id);
        self
    }

    /// Set the attempt number
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Set the configured policy
    pub fn with_policy(mut self, policy: ErrorStrategy) -> Self {
        self.policy = policy;
        self
    }

    /// Mark the fault transient
    pub fn transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }

    /// Override the timestamp
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}
