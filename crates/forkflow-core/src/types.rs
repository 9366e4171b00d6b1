//! Identifier value objects shared by every Forkflow crate.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Conventional path of the root branch of every flow
pub const MAIN_BRANCH: &str = "main";

/// Value object: Flow ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(pub String);

/// Value object: Branch path, unique within a flow
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchPath(pub String);

/// Value object: Step ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

/// Value object: Execution ID, fresh for each flow run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

/// Value object: opaque address of a unit of distributed intermediate data
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemoryAddress(pub String);

impl BranchPath {
    /// The root branch path
    pub fn main() -> Self {
        Self(MAIN_BRANCH.to_string())
    }

    /// Whether this is the root branch
    pub fn is_main(&self) -> bool {
        self.0 == MAIN_BRANCH
    }
}

impl ExecutionId {
    /// Generate a fresh execution id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl MemoryAddress {
    /// Generate a fresh memory address
    pub fn generate() -> Self {
        Self(format!("mem-{}", Uuid::new_v4()))
    }
}

macro_rules! impl_display {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl From<&str> for $ty {
                fn from(value: &str) -> Self {
                    Self(value.to_string())
                }
            }
        )*
    };
}

impl_display!(FlowId, BranchPath, StepId, ExecutionId, MemoryAddress);
