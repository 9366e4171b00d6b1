use forkflow_core::{BranchPath, FlowId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::MemoryError;

/// Owner of a memory address: a whole flow or one branch of it.
///
/// Encoded as `"{flowId}"` or `"{flowId}:{branchPath}"`; parsing splits on
/// the first `:`. Publishing rejects flow ids that contain one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MemoryOwner {
    /// Owned by the flow
    Flow(FlowId),
    /// Owned by one branch of the flow
    Branch(FlowId, BranchPath),
}

impl MemoryOwner {
    /// Owner for a branch
    pub fn branch(flow_id: &FlowId, branch_path: &BranchPath) -> Self {
        Self::Branch(flow_id.clone(), branch_path.clone())
    }

    /// Owner for a flow
    pub fn flow(flow_id: &FlowId) -> Self {
        Self::Flow(flow_id.clone())
    }

    /// Flow part of the owner
    pub fn flow_id(&self) -> &FlowId {
        match self {
            Self::Flow(flow_id) | Self::Branch(flow_id, _) => flow_id,
        }
    }

    /// Branch part of the owner, if any
    pub fn branch_path(&self) -> Option<&BranchPath> {
        match self {
            Self::Flow(_) => None,
            Self::Branch(_, branch) => Some(branch),
        }
    }

    /// Encoded form
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for MemoryOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flow(flow_id) => write!(f, "{}", flow_id),
            Self::Branch(flow_id, branch) => write!(f, "{}:{}", flow_id, branch),
        }
    }
}

impl FromStr for MemoryOwner {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            None if !s.is_empty() => Ok(Self::Flow(FlowId(s.to_string()))),
            Some((flow, branch)) if !flow.is_empty() && !branch.is_empty() => Ok(Self::Branch(
                FlowId(flow.to_string()),
                BranchPath(branch.to_string()),
            )),
            _ => Err(MemoryError::InvalidOwner(s.to_string())),
        }
    }
}

impl TryFrom<String> for MemoryOwner {
    type Error = MemoryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MemoryOwner> for String {
    fn from(owner: MemoryOwner) -> Self {
        owner.to_string()
    }
}
