//!
//! Forkflow Core - model and execution tree of the Forkflow runtime
//!
//! This crate defines flows, branches and steps, their validation, the
//! execution context tree with its state machine, merge resolution and
//! runtime configuration. It is the foundation for all other crates.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - flows, branches, error handling and events
pub mod domain;

/// Execution layer - contexts, status and merge resolution
pub mod execution;

/// Identifier types
pub mod types;

/// Error types
pub mod error;

/// Runtime configuration
pub mod config;

// Re-export key types
pub use config::{CacheDefaults, ClusterConfig, EvictionPolicy, RecoveryConfig, RuntimeConfig};
pub use error::CoreError;
pub use types::{BranchPath, ExecutionId, FlowId, MemoryAddress, StepId, MAIN_BRANCH};

pub use domain::branch::{FlowBranch, MergeConfig, MergeStrategy, DEFAULT_BRANCH_PRIORITY};
pub use domain::error_context::ErrorContext;
pub use domain::error_handling::{CompensatingAction, ErrorHandlingConfig, ErrorStrategy};
pub use domain::events::DomainEvent;
pub use domain::flow::{Flow, FlowStep, MergeStrategyConfig, StepKind, ValidationRule};
pub use domain::repository::FlowRepository;
pub use domain::versioned::Versioned;

pub use execution::context::{
    BranchExecutionContext, ExecutionContext, StepExecutionContext, StepLogLevel,
};
pub use execution::merge::{
    resolve_merge, JmesPathMergePredicate, MergeCandidate, MergeDecision, MergePredicate,
};
pub use execution::status::ExecutionStatus;
