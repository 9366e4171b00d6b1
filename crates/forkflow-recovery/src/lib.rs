//!
//! Forkflow Recovery - failure handling for flow runs
//!
//! Step errors are wrapped in an [`forkflow_core::ErrorContext`] and handed
//! to [`RecoveryFramework::recover`], which gates on a per-execution circuit
//! breaker, correlates the error with the execution's history, applies the
//! highest-priority applicable strategy and runs compensating actions in
//! reverse order when recovery does not succeed.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit_breaker;
pub mod compensation;
pub mod correlation;
pub mod error;
pub mod framework;
pub mod retry;
pub mod strategy;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use compensation::{
    CompensatingActionManager, CompensationHandler, CompensationReport, LoggingCompensationHandler,
};
pub use correlation::{CorrelatedErrorGroup, CorrelationType, ErrorCorrelationEngine};
pub use error::RecoveryError;
pub use framework::RecoveryFramework;
pub use retry::{retry_with_backoff, with_timeout, RetryError, RetryPolicy, TimeoutError};
pub use strategy::{
    CompensateAndFailStrategy, RecoveryDirective, RecoveryOutcome, RecoveryResult, RecoveryStrategy,
    RetryStrategy, SkipStepStrategy, StrategyManager,
};
