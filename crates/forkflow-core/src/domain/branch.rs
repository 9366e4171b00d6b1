use crate::types::{BranchPath, StepId};
use serde::{Deserialize, Serialize};

/// Default resource-allocation priority of a branch
pub const DEFAULT_BRANCH_PRIORITY: u32 = 100;

fn default_priority() -> u32 {
    DEFAULT_BRANCH_PRIORITY
}

/// Policy for resolving concurrent branches at a join point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergeStrategy {
    /// Target step blocks until every contributing branch completed
    WaitForAll,
    /// Target proceeds on the first completed branch, the rest are cancelled
    FirstComplete,
    /// A predicate over the strategy configuration picks the adopted branch
    Conditional,
    /// Highest-priority completed branch wins, ties go to the earliest completion
    PriorityBased,
}

impl Default for MergeStrategy {
    fn default() -> Self {
        Self::WaitForAll
    }
}

/// How a forked branch rejoins its parent (or another branch)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Branch the fork merges into
    pub target_branch: BranchPath,

    /// Position of the step in the target branch that acts as the join point
    pub target_step_position: u32,

    /// Resolution strategy
    #[serde(default)]
    pub strategy: MergeStrategy,

    /// Strategy-specific configuration, opaque to the model
    #[serde(default)]
    pub strategy_config: Option<String>,
}

impl MergeConfig {
    /// Create a merge configuration
    pub fn new(target_branch: impl Into<String>, target_step_position: u32, strategy: MergeStrategy) -> Self {
        Self {
            target_branch: BranchPath(target_branch.into()),
            target_step_position,
            strategy,
            strategy_config: None,
        }
    }

    /// Attach strategy-specific configuration
    pub fn with_strategy_config(mut self, config: impl Into<String>) -> Self {
        self.strategy_config = Some(config.into());
        self
    }
}

/// An independently schedulable sequence of steps.
///
/// The ordered step list of a branch is derived from the owning flow
/// (see [`crate::domain::flow::Flow::branch_steps`]), so the flow's step
/// list is the single source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowBranch {
    /// Unique path of the branch within its flow
    pub path: BranchPath,

    /// Branch this one forks from, `None` only for the root
    #[serde(default)]
    pub parent_branch: Option<BranchPath>,

    /// Step of the parent branch whose completion forks this branch
    #[serde(default)]
    pub parent_step: Option<StepId>,

    /// Resource-allocation priority
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// How this branch resolves back into a target branch
    #[serde(default)]
    pub merge: Option<MergeConfig>,
}

impl FlowBranch {
    /// The root branch
    pub fn main() -> Self {
        Self::root(BranchPath::main().0)
    }

    /// A root branch with a custom path
    pub fn root(path: impl Into<String>) -> Self {
        Self {
            path: BranchPath(path.into()),
            parent_branch: None,
            parent_step: None,
            priority: DEFAULT_BRANCH_PRIORITY,
            merge: None,
        }
    }

    /// A branch forked from `parent_branch` when `parent_step` completes
    pub fn forked(
        path: impl Into<String>,
        parent_branch: impl Into<String>,
        parent_step: impl Into<String>,
    ) -> Self {
        Self {
            path: BranchPath(path.into()),
            parent_branch: Some(BranchPath(parent_branch.into())),
            parent_step: Some(StepId(parent_step.into())),
            priority: DEFAULT_BRANCH_PRIORITY,
            merge: None,
        }
    }

    /// Set the branch priority
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the merge configuration
    pub fn with_merge(mut self, merge: MergeConfig) -> Self {
        self.merge = Some(merge);
        self
    }

    /// Whether this branch is a fork of another branch
    pub fn is_fork(&self) -> bool {
        self.parent_branch.is_some()
    }

    /// Whether this branch merges into the given join point
    pub fn merges_into(&self, target_branch: &BranchPath, position: u32) -> bool {
        self.merge
            .as_ref()
            .map(|m| &m.target_branch == target_branch && m.target_step_position == position)
            .unwrap_or(false)
    }
}
