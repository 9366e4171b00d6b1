//! Merge resolution at a join point.
//!
//! [`resolve_merge`] is a pure function over the current state of every
//! branch declaring the join point as its merge target. The orchestrator
//! calls it whenever one of those branches changes status and acts on the
//! returned [`MergeDecision`].

use crate::domain::branch::MergeStrategy;
use crate::execution::status::ExecutionStatus;
use crate::types::{BranchPath, MemoryAddress};
use crate::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// State of one contributing branch at a join point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeCandidate {
    /// Contributing branch
    pub branch_path: BranchPath,

    /// Branch priority
    pub priority: u32,

    /// Current branch status
    pub status: ExecutionStatus,

    /// When the branch completed
    pub completed_at: Option<DateTime<Utc>>,

    /// Address holding the branch output
    pub output_address: Option<MemoryAddress>,

    /// Free-form view of the branch exposed to Conditional predicates
    #[serde(default)]
    pub data: serde_json::Value,
}

impl MergeCandidate {
    /// Create a candidate in the given status
    pub fn new(branch_path: impl Into<String>, priority: u32, status: ExecutionStatus) -> Self {
        Self {
            branch_path: BranchPath(branch_path.into()),
            priority,
            status,
            completed_at: None,
            output_address: None,
            data: serde_json::Value::Null,
        }
    }

    /// Mark the candidate completed at the given time
    pub fn completed(mut self, at: DateTime<Utc>) -> Self {
        self.status = ExecutionStatus::Completed;
        self.completed_at = Some(at);
        self
    }

    /// Set the predicate data
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    fn is_completed(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    /// JSON document a predicate is evaluated against
    pub fn predicate_view(&self) -> serde_json::Value {
        json!({
            "branch": self.branch_path.0,
            "priority": self.priority,
            "status": self.status,
            "output_address": self.output_address.as_ref().map(|a| a.0.clone()),
            "data": self.data,
        })
    }
}

/// Outcome of resolving a join point
#[derive(Debug, Clone, PartialEq)]
pub enum MergeDecision {
    /// Not decidable yet, keep waiting
    Pending,

    /// The target step may run
    Proceed {
        /// Branches whose output is adopted, in adoption order
        adopted: Vec<BranchPath>,
        /// Branches that must be cancelled
        cancel: Vec<BranchPath>,
    },

    /// The join point can never be satisfied
    NoMatch {
        /// Why
        reason: String,
    },
}

/// Evaluates the opaque configuration of the Conditional strategy
#[cfg_attr(test, mockall::automock)]
pub trait MergePredicate: Send + Sync {
    /// Whether the candidate satisfies the expression
    fn matches(&self, expression: &str, candidate: &MergeCandidate) -> Result<bool, CoreError>;
}

/// Conditional predicate interpreting the configuration as a JMESPath
/// expression over [`MergeCandidate::predicate_view`]
#[derive(Debug, Clone, Copy, Default)]
pub struct JmesPathMergePredicate;

impl MergePredicate for JmesPathMergePredicate {
    fn matches(&self, expression: &str, candidate: &MergeCandidate) -> Result<bool, CoreError> {
        let compiled = jmespath::compile(expression).map_err(|e| {
            CoreError::ExpressionError(format!(
                "Failed to compile JMESPath expression: {}: {}",
                expression, e
            ))
        })?;

        let view = candidate.predicate_view();
        let result = compiled.search(&view).map_err(|e| {
            CoreError::ExpressionError(format!(
                "Failed to evaluate JMESPath expression: {}: {}",
                expression, e
            ))
        })?;

        Ok(result.is_truthy())
    }
}

/// Completed candidates ordered by completion time, declaration order breaking ties
fn completed_in_order(candidates: &[MergeCandidate]) -> Vec<&MergeCandidate> {
    let mut completed: Vec<&MergeCandidate> = candidates.iter().filter(|c| c.is_completed()).collect();
    completed.sort_by_key(|c| c.completed_at);
    completed
}

fn all_terminal(candidates: &[MergeCandidate]) -> bool {
    candidates.iter().all(|c| c.status.is_terminal())
}

/// Resolve a join point with the given strategy
pub fn resolve_merge(
    strategy: MergeStrategy,
    strategy_config: Option<&str>,
    candidates: &[MergeCandidate],
    predicate: Option<&dyn MergePredicate>,
) -> Result<MergeDecision, CoreError> {
    if candidates.is_empty() {
        return Err(CoreError::MergeError(
            "Join point has no contributing branches".to_string(),
        ));
    }

    let decision = match strategy {
        MergeStrategy::WaitForAll => {
            if let Some(failed) = candidates
                .iter()
                .find(|c| c.status.is_terminal() && !c.is_completed())
            {
                MergeDecision::NoMatch {
                    reason: format!(
                        "Branch {} ended in {:?} before the join point",
                        failed.branch_path, failed.status
                    ),
                }
            } else if candidates.iter().all(|c| c.is_completed()) {
                MergeDecision::Proceed {
                    adopted: completed_in_order(candidates)
                        .into_iter()
                        .map(|c| c.branch_path.clone())
                        .collect(),
                    cancel: Vec::new(),
                }
            } else {
                MergeDecision::Pending
            }
        }

        MergeStrategy::FirstComplete => match completed_in_order(candidates).first() {
            Some(winner) => MergeDecision::Proceed {
                adopted: vec![winner.branch_path.clone()],
                cancel: candidates
                    .iter()
                    .filter(|c| !c.status.is_terminal())
                    .map(|c| c.branch_path.clone())
                    .collect(),
            },
            None if all_terminal(candidates) => MergeDecision::NoMatch {
                reason: "No contributing branch completed".to_string(),
            },
            None => MergeDecision::Pending,
        },

        MergeStrategy::PriorityBased => {
            if !all_terminal(candidates) {
                MergeDecision::Pending
            } else {
                // Stable sort keeps completion order among equal priorities
                let mut completed = completed_in_order(candidates);
                completed.sort_by(|a, b| b.priority.cmp(&a.priority));
                match completed.first() {
                    Some(winner) => MergeDecision::Proceed {
                        adopted: vec![winner.branch_path.clone()],
                        cancel: Vec::new(),
                    },
                    None => MergeDecision::NoMatch {
                        reason: "No contributing branch completed".to_string(),
                    },
                }
            }
        }

        MergeStrategy::Conditional => {
            let expression = strategy_config.ok_or_else(|| {
                CoreError::MergeError("Conditional merge requires a strategy configuration".to_string())
            })?;
            let predicate = predicate.ok_or_else(|| {
                CoreError::MergeError("Conditional merge requires a predicate evaluator".to_string())
            })?;

            if !all_terminal(candidates) {
                MergeDecision::Pending
            } else {
                let mut winner = None;
                for candidate in completed_in_order(candidates) {
                    if predicate.matches(expression, candidate)? {
                        winner = Some(candidate.branch_path.clone());
                        break;
                    }
                }
                match winner {
                    Some(branch) => MergeDecision::Proceed {
                        adopted: vec![branch],
                        cancel: Vec::new(),
                    },
                    None => MergeDecision::NoMatch {
                        reason: format!("No contributing branch satisfies: {}", expression),
                    },
                }
            }
        }
    };

    Ok(decision)
}
