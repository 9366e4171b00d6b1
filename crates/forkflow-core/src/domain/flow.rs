use crate::domain::branch::{FlowBranch, MergeStrategy};
use crate::domain::error_handling::ErrorHandlingConfig;
use crate::types::{BranchPath, FlowId, StepId};
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Kind of work a step performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepKind {
    /// Brings data into the flow
    Import,
    /// Transforms data
    Process,
    /// Sends data out of the flow
    Export,
}

/// A step in a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStep {
    /// ID of the step
    pub id: StepId,

    /// Branch the step belongs to
    pub branch_path: BranchPath,

    /// Step kind
    pub kind: StepKind,

    /// Position within the branch, unique per branch
    pub position: u32,

    /// Reference to the component executing the step
    pub component: String,

    /// Opaque configuration for the component
    #[serde(default)]
    pub config: serde_json::Value,
}

impl FlowStep {
    /// Create a new step
    pub fn new(
        id: impl Into<String>,
        branch_path: impl Into<String>,
        kind: StepKind,
        position: u32,
        component: impl Into<String>,
    ) -> Self {
        Self {
            id: StepId(id.into()),
            branch_path: BranchPath(branch_path.into()),
            kind,
            position,
            component: component.into(),
            config: serde_json::Value::Null,
        }
    }

    /// Attach configuration
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }
}

/// Structural rule carried with the flow, evaluated by publishing tooling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationRule {
    /// Rule name
    pub name: String,

    /// Rule expression
    pub expression: String,

    /// Whether a violation blocks publishing
    #[serde(default)]
    pub blocking: bool,
}

/// Flow-wide merge defaults
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MergeStrategyConfig {
    /// Strategy assumed by tooling when a branch does not name one
    #[serde(default)]
    pub default_strategy: MergeStrategy,

    /// Upper bound on the time a join point waits for its branches
    #[serde(default)]
    pub merge_timeout_ms: Option<u64>,
}

/// A declarative workflow: steps, branches and merge/error configuration.
///
/// Execution only ever reads a flow; changes go through
/// [`crate::domain::versioned::Versioned`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    /// ID of the flow
    pub id: FlowId,

    /// The flow version
    pub version: u32,

    /// Human-readable name of the flow
    pub name: String,

    /// Description of the flow
    #[serde(default)]
    pub description: Option<String>,

    /// Steps of all branches
    pub steps: Vec<FlowStep>,

    /// Declared branches, the root included
    pub branches: Vec<FlowBranch>,

    /// Opaque validation rules
    #[serde(default)]
    pub validation_rules: Vec<ValidationRule>,

    /// Error handling
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,

    /// Merge defaults
    #[serde(default)]
    pub merge_strategy: MergeStrategyConfig,
}

impl Flow {
    /// Create an empty flow
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: FlowId(id.into()),
            version: 1,
            name: name.into(),
            description: None,
            steps: Vec::new(),
            branches: Vec::new(),
            validation_rules: Vec::new(),
            error_handling: ErrorHandlingConfig::default(),
            merge_strategy: MergeStrategyConfig::default(),
        }
    }

    /// Add a step
    pub fn with_step(mut self, step: FlowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Add a branch
    pub fn with_branch(mut self, branch: FlowBranch) -> Self {
        self.branches.push(branch);
        self
    }

    /// Replace the error handling configuration
    pub fn with_error_handling(mut self, config: ErrorHandlingConfig) -> Self {
        self.error_handling = config;
        self
    }

    /// Boolean form of [`Flow::check_invariants`]
    pub fn validate(&self) -> bool {
        self.check_invariants().is_ok()
    }

    /// Check the five structural invariants in order, stopping at the first violation
    pub fn check_invariants(&self) -> Result<(), CoreError> {
        if self.steps.is_empty() {
            return Err(CoreError::ValidationError(
                "Flow must have at least one step".to_string(),
            ));
        }

        if self.branches.is_empty() {
            return Err(CoreError::ValidationError(
                "Flow must have at least one branch".to_string(),
            ));
        }

        let branch_paths: HashSet<&BranchPath> = self.branches.iter().map(|b| &b.path).collect();

        if let Some(step) = self
            .steps
            .iter()
            .find(|s| !branch_paths.contains(&s.branch_path))
        {
            return Err(CoreError::ValidationError(format!(
                "Step {} references non-existent branch: {}",
                step.id, step.branch_path
            )));
        }

        let populated: HashSet<&BranchPath> = self.steps.iter().map(|s| &s.branch_path).collect();
        if let Some(branch) = self.branches.iter().find(|b| !populated.contains(&b.path)) {
            return Err(CoreError::ValidationError(format!(
                "Branch {} has no steps",
                branch.path
            )));
        }

        for branch in &self.branches {
            if let Some(merge) = &branch.merge {
                if !branch_paths.contains(&merge.target_branch) {
                    return Err(CoreError::ValidationError(format!(
                        "Branch {} merges into non-existent branch: {}",
                        branch.path, merge.target_branch
                    )));
                }
            }
        }

        Ok(())
    }

    /// Full check run before a flow is published: the structural invariants plus
    /// identifier uniqueness, unique positions per branch, and resolvable fork points
    pub fn validate_for_publish(&self) -> Result<(), CoreError> {
        self.check_invariants()?;

        // ':' separates flow id and branch path in memory owner keys
        if self.id.0.contains(':') {
            return Err(CoreError::ValidationError(format!(
                "Flow ID must not contain ':': {}",
                self.id
            )));
        }

        let mut step_ids = HashSet::new();
        for step in &self.steps {
            if !step_ids.insert(&step.id) {
                return Err(CoreError::ValidationError(format!(
                    "Duplicate step ID: {}",
                    step.id
                )));
            }
        }

        let mut branch_paths = HashSet::new();
        for branch in &self.branches {
            if !branch_paths.insert(&branch.path) {
                return Err(CoreError::ValidationError(format!(
                    "Duplicate branch path: {}",
                    branch.path
                )));
            }
        }

        let mut positions = HashSet::new();
        for step in &self.steps {
            if !positions.insert((&step.branch_path, step.position)) {
                return Err(CoreError::ValidationError(format!(
                    "Duplicate position {} in branch {}",
                    step.position, step.branch_path
                )));
            }
        }

        for branch in &self.branches {
            match (&branch.parent_branch, &branch.parent_step) {
                (None, None) => {}
                (Some(parent), Some(step_id)) => {
                    let forks_from_parent = self
                        .step(step_id)
                        .map(|s| &s.branch_path == parent)
                        .unwrap_or(false);
                    if !forks_from_parent {
                        return Err(CoreError::ValidationError(format!(
                            "Branch {} forks from step {} which is not in branch {}",
                            branch.path, step_id, parent
                        )));
                    }
                }
                _ => {
                    return Err(CoreError::ValidationError(format!(
                        "Branch {} must set both parent branch and parent step, or neither",
                        branch.path
                    )));
                }
            }

            if let Some(merge) = &branch.merge {
                let target_exists = self.steps.iter().any(|s| {
                    s.branch_path == merge.target_branch && s.position == merge.target_step_position
                });
                if !target_exists {
                    return Err(CoreError::ValidationError(format!(
                        "Branch {} merges into missing step position {} of branch {}",
                        branch.path, merge.target_step_position, merge.target_branch
                    )));
                }
            }
        }

        Ok(())
    }

    /// Look up a branch by path
    pub fn branch(&self, path: &BranchPath) -> Option<&FlowBranch> {
        self.branches.iter().find(|b| &b.path == path)
    }

    /// Look up a step by id
    pub fn step(&self, id: &StepId) -> Option<&FlowStep> {
        self.steps.iter().find(|s| &s.id == id)
    }

    /// Steps of a branch ordered by position
    pub fn branch_steps(&self, path: &BranchPath) -> Vec<&FlowStep> {
        let mut steps: Vec<&FlowStep> = self.steps.iter().filter(|s| &s.branch_path == path).collect();
        steps.sort_by_key(|s| s.position);
        steps
    }

    /// Root branches (no parent)
    pub fn root_branches(&self) -> Vec<&FlowBranch> {
        self.branches.iter().filter(|b| !b.is_fork()).collect()
    }

    /// Branches forked by the completion of the given step
    pub fn forks_of(&self, branch: &BranchPath, step_id: &StepId) -> Vec<&FlowBranch> {
        self.branches
            .iter()
            .filter(|b| b.parent_branch.as_ref() == Some(branch) && b.parent_step.as_ref() == Some(step_id))
            .collect()
    }

    /// Branches whose merge configuration targets the given join point
    pub fn merging_into(&self, branch: &BranchPath, position: u32) -> Vec<&FlowBranch> {
        self.branches
            .iter()
            .filter(|b| b.merges_into(branch, position))
            .collect()
    }
}
