//! Join points: where forked branches merge back into a target step.

use chrono::Utc;
use forkflow_core::{
    BranchExecutionContext, BranchPath, ExecutionContext, ExecutionStatus, Flow, FlowBranch, MergeCandidate,
    MergeDecision, MergeStrategy,
};

use crate::EngineError;

/// Branch parameter holding the data of the branch's last completed step
pub const OUTPUT_PARAMETER: &str = "output";

/// A target step and every branch merging into it
#[derive(Debug, Clone, PartialEq)]
pub struct JoinPoint {
    /// Branch owning the target step
    pub target_branch: BranchPath,
    /// Position of the target step
    pub target_step_position: u32,
    /// Strategy shared by all contributors
    pub strategy: MergeStrategy,
    /// Strategy configuration shared by all contributors
    pub strategy_config: Option<String>,
    /// Contributing branches in declaration order
    pub contributors: Vec<FlowBranch>,
}

impl JoinPoint {
    /// The join point at a step, if any branch merges into it
    pub fn at(flow: &Flow, target_branch: &BranchPath, position: u32) -> Option<Self> {
        let contributors: Vec<FlowBranch> = flow
            .merging_into(target_branch, position)
            .into_iter()
            .cloned()
            .collect();

        let merge = contributors.first()?.merge.clone()?;
        Some(Self {
            target_branch: target_branch.clone(),
            target_step_position: position,
            strategy: merge.strategy,
            strategy_config: merge.strategy_config,
            contributors,
        })
    }

    /// Current state of every contributor; branches not forked yet count as Created
    pub fn candidates(&self, context: &ExecutionContext) -> Vec<MergeCandidate> {
        self.contributors
            .iter()
            .map(|branch| match context.branch(&branch.path) {
                Some(instance) => candidate_of(instance),
                None => MergeCandidate::new(branch.path.0.clone(), branch.priority, ExecutionStatus::Created),
            })
            .collect()
    }
}

fn candidate_of(instance: &BranchExecutionContext) -> MergeCandidate {
    let status = instance.status();
    let mut candidate = MergeCandidate::new(instance.branch_path.0.clone(), instance.priority, status);
    if status == ExecutionStatus::Completed {
        candidate = candidate.completed(instance.lifecycle.ended_at.unwrap_or_else(Utc::now));
    }
    candidate.output_address = instance
        .last_output_address()
        .or(instance.memory_address.as_ref())
        .cloned();
    candidate.with_data(
        instance
            .parameters
            .get(OUTPUT_PARAMETER)
            .cloned()
            .unwrap_or(serde_json::Value::Null),
    )
}

/// Metric label of a decision
pub fn decision_label(decision: &MergeDecision) -> &'static str {
    match decision {
        MergeDecision::Pending => "pending",
        MergeDecision::Proceed { .. } => "proceed",
        MergeDecision::NoMatch { .. } => "no_match",
    }
}

/// Metric label of a strategy
pub fn strategy_label(strategy: MergeStrategy) -> &'static str {
    match strategy {
        MergeStrategy::WaitForAll => "wait_for_all",
        MergeStrategy::FirstComplete => "first_complete",
        MergeStrategy::Conditional => "conditional",
        MergeStrategy::PriorityBased => "priority_based",
    }
}

/// Reject flows whose merge topology cannot be run.
///
/// On top of the publishing checks: a fork merging back into its parent
/// branch must target a step after its fork point, contributors to one join
/// point must agree on the strategy, and a Conditional join needs its
/// configuration.
pub fn check_topology(flow: &Flow) -> Result<(), EngineError> {
    flow.validate_for_publish()
        .map_err(|e| EngineError::InvalidFlow(e.to_string()))?;

    for branch in &flow.branches {
        if !reaches_root(flow, branch) {
            return Err(EngineError::InvalidFlow(format!(
                "Branch {} is not reachable from a root branch",
                branch.path
            )));
        }

        let merge = match &branch.merge {
            Some(merge) => merge,
            None => continue,
        };

        if let (Some(parent), Some(parent_step)) = (&branch.parent_branch, &branch.parent_step) {
            let fork_position = flow.step(parent_step).map(|s| s.position);
            if parent == &merge.target_branch
                && fork_position.map_or(false, |p| merge.target_step_position <= p)
            {
                return Err(EngineError::InvalidFlow(format!(
                    "Branch {} merges into {} at position {}, not after its fork point {}",
                    branch.path, parent, merge.target_step_position, parent_step
                )));
            }
        }

        if merge.strategy == MergeStrategy::Conditional && merge.strategy_config.is_none() {
            return Err(EngineError::InvalidFlow(format!(
                "Branch {} uses a Conditional merge without a configuration",
                branch.path
            )));
        }

        if let Some(join) = JoinPoint::at(flow, &merge.target_branch, merge.target_step_position) {
            if join.strategy != merge.strategy || join.strategy_config != merge.strategy_config {
                return Err(EngineError::InvalidFlow(format!(
                    "Branches merging into {} at position {} disagree on the merge strategy",
                    merge.target_branch, merge.target_step_position
                )));
            }
        }
    }

    Ok(())
}

fn reaches_root(flow: &Flow, branch: &FlowBranch) -> bool {
    let mut current = branch;
    for _ in 0..=flow.branches.len() {
        match current.parent_branch.as_ref() {
            None => return true,
            Some(parent) => match flow.branch(parent) {
                Some(next) => current = next,
                None => return false,
            },
        }
    }
    false
}
