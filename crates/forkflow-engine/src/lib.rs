//!
//! Forkflow Engine - branch orchestration
//!
//! [`BranchOrchestrator`] runs a flow: every branch is a concurrent task
//! executing its steps in order, forks start when their parent step
//! completes, join points are resolved with the flow's merge strategies,
//! and failed steps are routed through the recovery framework. Step
//! business logic is supplied through [`StepExecutor`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod executor;
pub mod join;
pub mod orchestrator;

pub use config::EngineConfig;
pub use error::EngineError;
pub use executor::{ComponentRegistry, StepExecutor, StepFailure, StepInvocation, StepOutput};
pub use join::{JoinPoint, OUTPUT_PARAMETER};
pub use orchestrator::BranchOrchestrator;
