use crate::types::{BranchPath, StepId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// What to do when a step fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorStrategy {
    /// Fail the branch straight away
    FailImmediately,
    /// Retry the step up to the configured bound
    Retry,
    /// Mark the step skipped and continue with the next one
    SkipAndContinue,
    /// Run compensating actions, then fail
    CompensateAndFail,
    /// Run compensating actions, then continue
    CompensateAndContinue,
}

impl Default for ErrorStrategy {
    fn default() -> Self {
        Self::FailImmediately
    }
}

/// An undo operation attached to a step or branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensatingAction {
    /// Kind of action, interpreted by the compensation handler
    pub action_type: String,

    /// Opaque action configuration
    #[serde(default)]
    pub config: serde_json::Value,

    /// Step being compensated
    pub step_id: StepId,

    /// Branch being compensated
    pub branch_path: BranchPath,

    /// Sequencing among actions attached to the same failure point
    #[serde(default)]
    pub execution_order: u32,
}

impl CompensatingAction {
    /// Create a compensating action for a step
    pub fn new(action_type: impl Into<String>, step_id: impl Into<String>, branch_path: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            config: serde_json::Value::Null,
            step_id: StepId(step_id.into()),
            branch_path: BranchPath(branch_path.into()),
            execution_order: 0,
        }
    }

    /// Set the execution order
    pub fn with_order(mut self, order: u32) -> Self {
        self.execution_order = order;
        self
    }

    /// Set the action configuration
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

/// Flow-wide error-handling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorHandlingConfig {
    /// Strategy used when a step has no override
    #[serde(default)]
    pub default_strategy: ErrorStrategy,

    /// Retry bound
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base retry delay in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Upper bound on a single retry delay in milliseconds
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    /// Whether delays grow exponentially with the attempt number
    #[serde(default = "default_true")]
    pub exponential_backoff: bool,

    /// Per-step strategy overrides
    #[serde(default)]
    pub step_overrides: HashMap<StepId, ErrorStrategy>,

    /// Ordered compensating actions
    #[serde(default)]
    pub compensating_actions: Vec<CompensatingAction>,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        Self {
            default_strategy: ErrorStrategy::default(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            exponential_backoff: true,
            step_overrides: HashMap::new(),
            compensating_actions: Vec::new(),
        }
    }
}

impl ErrorHandlingConfig {
    /// Strategy that applies to a step
    pub fn strategy_for(&self, step_id: &StepId) -> ErrorStrategy {
        self.step_overrides
            .get(step_id)
            .copied()
            .unwrap_or(self.default_strategy)
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let base = self.retry_delay_ms;
        let delay_ms = if self.exponential_backoff {
            let exponent = attempt.saturating_sub(1).min(31);
            base.saturating_mul(1u64 << exponent)
        } else {
            base
        };
        Duration::from_millis(delay_ms.min(self.max_retry_delay_ms))
    }

    /// Compensating actions attached to a step, ordered by execution order
    pub fn actions_for_step(&self, branch_path: &BranchPath, step_id: &StepId) -> Vec<CompensatingAction> {
        let mut actions: Vec<CompensatingAction> = self
            .compensating_actions
            .iter()
            .filter(|a| &a.step_id == step_id && &a.branch_path == branch_path)
            .cloned()
            .collect();
        actions.sort_by_key(|a| a.execution_order);
        actions
    }
}
