//! Recovery strategies and their selection.

use async_trait::async_trait;
use forkflow_core::{ErrorContext, ErrorHandlingConfig, ErrorStrategy, ExecutionContext};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::correlation::CorrelatedErrorGroup;
use crate::retry::RetryPolicy;
use crate::RecoveryError;

/// Outcome category of a recovery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryOutcome {
    /// A strategy recovered from the error
    Recovered,
    /// The circuit breaker rejected the attempt
    CircuitBreakerOpen,
    /// No registered strategy applies
    NoStrategyFound,
    /// The chosen strategy did not recover
    StrategyFailed,
    /// The recovery pipeline itself faulted
    RecoveryFrameworkError,
}

impl RecoveryOutcome {
    /// Metric label
    pub fn as_label(self) -> &'static str {
        match self {
            RecoveryOutcome::Recovered => "recovered",
            RecoveryOutcome::CircuitBreakerOpen => "circuit_breaker_open",
            RecoveryOutcome::NoStrategyFound => "no_strategy_found",
            RecoveryOutcome::StrategyFailed => "strategy_failed",
            RecoveryOutcome::RecoveryFrameworkError => "recovery_framework_error",
        }
    }
}

impl fmt::Display for RecoveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// What the orchestrator should do with the failed step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryDirective {
    /// Run the step again after the delay
    RetryAfter(Duration),
    /// Skip the step and continue the branch
    Continue,
    /// Compensation has run, continue the branch
    CompensateAndContinue,
    /// Fail the branch
    Abort,
}

/// Result of a recovery attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryResult {
    /// Whether the error was recovered from
    pub is_successful: bool,
    /// Strategy that was applied, if any
    pub recovery_strategy: Option<String>,
    /// Human-readable explanation
    pub message: String,
    /// Outcome category
    pub outcome: RecoveryOutcome,
    /// Instruction for the orchestrator
    pub directive: RecoveryDirective,
}

impl RecoveryResult {
    /// A successful recovery by `strategy`
    pub fn recovered(strategy: &str, directive: RecoveryDirective, message: impl Into<String>) -> Self {
        Self {
            is_successful: true,
            recovery_strategy: Some(strategy.to_string()),
            message: message.into(),
            outcome: RecoveryOutcome::Recovered,
            directive,
        }
    }

    /// A failed recovery that aborts the branch
    pub fn failed(strategy: Option<&str>, outcome: RecoveryOutcome, message: impl Into<String>) -> Self {
        Self {
            is_successful: false,
            recovery_strategy: strategy.map(str::to_string),
            message: message.into(),
            outcome,
            directive: RecoveryDirective::Abort,
        }
    }
}

/// A pluggable way of recovering from an error
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    /// Strategy name
    fn name(&self) -> &str;

    /// Higher priorities are consulted first
    fn priority(&self) -> i32;

    /// Whether the strategy handles this error
    fn is_applicable(&self, error: &ErrorContext, correlated: &[CorrelatedErrorGroup]) -> bool;

    /// Apply the strategy. `Ok` with an unsuccessful result means the
    /// strategy ran and did not recover; `Err` is a fault of the strategy.
    async fn apply(
        &self,
        error: &ErrorContext,
        context: &ExecutionContext,
    ) -> Result<RecoveryResult, RecoveryError>;
}

/// Selects the strategy for an error
#[derive(Default, Clone)]
pub struct StrategyManager {
    strategies: Vec<Arc<dyn RecoveryStrategy>>,
}

impl StrategyManager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager with the built-in strategies for a flow's error handling
    pub fn with_defaults(error_handling: &ErrorHandlingConfig) -> Self {
        let mut manager = Self::new();
        manager.register(Arc::new(RetryStrategy::new(RetryPolicy::from(error_handling))));
        manager.register(Arc::new(SkipStepStrategy));
        manager.register(Arc::new(CompensateAndFailStrategy));
        manager
    }

    /// Register a strategy. Order is kept stable by descending priority,
    /// equal priorities stay in registration order.
    pub fn register(&mut self, strategy: Arc<dyn RecoveryStrategy>) {
        debug!(strategy = strategy.name(), priority = strategy.priority(), "Registering recovery strategy");
        self.strategies.push(strategy);
        self.strategies.sort_by_key(|s| std::cmp::Reverse(s.priority()));
    }

    /// The first strategy, by descending priority, that applies to the error
    pub fn find_strategy(
        &self,
        error: &ErrorContext,
        correlated: &[CorrelatedErrorGroup],
    ) -> Option<Arc<dyn RecoveryStrategy>> {
        self.strategies
            .iter()
            .find(|s| s.is_applicable(error, correlated))
            .cloned()
    }

    /// Registered strategy names in consultation order
    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.name().to_string()).collect()
    }
}

/// Retries transient faults of steps whose policy is Retry until the bound is reached
pub struct RetryStrategy {
    policy: RetryPolicy,
}

impl RetryStrategy {
    /// Create the strategy
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl RecoveryStrategy for RetryStrategy {
    fn name(&self) -> &str {
        "retry"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn is_applicable(&self, error: &ErrorContext, _correlated: &[CorrelatedErrorGroup]) -> bool {
        error.policy == ErrorStrategy::Retry && error.transient && self.policy.allows_retry(error.attempt)
    }

    async fn apply(
        &self,
        error: &ErrorContext,
        _context: &ExecutionContext,
    ) -> Result<RecoveryResult, RecoveryError> {
        let delay = self.policy.delay_for(error.attempt);
        Ok(RecoveryResult::recovered(
            self.name(),
            RecoveryDirective::RetryAfter(delay),
            format!(
                "Retry {}/{} of step after {:?}",
                error.attempt, self.policy.max_retries, delay
            ),
        ))
    }
}

/// Skips the failed step, with or without compensation
pub struct SkipStepStrategy;

#[async_trait]
impl RecoveryStrategy for SkipStepStrategy {
    fn name(&self) -> &str {
        "skip_step"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn is_applicable(&self, error: &ErrorContext, _correlated: &[CorrelatedErrorGroup]) -> bool {
        matches!(
            error.policy,
            ErrorStrategy::SkipAndContinue | ErrorStrategy::CompensateAndContinue
        )
    }

    async fn apply(
        &self,
        error: &ErrorContext,
        _context: &ExecutionContext,
    ) -> Result<RecoveryResult, RecoveryError> {
        let directive = if error.policy == ErrorStrategy::CompensateAndContinue {
            RecoveryDirective::CompensateAndContinue
        } else {
            RecoveryDirective::Continue
        };
        Ok(RecoveryResult::recovered(
            self.name(),
            directive,
            format!("Skipping step after {}: {}", error.code, error.message),
        ))
    }
}

/// Gives up so that compensation runs and the branch fails
pub struct CompensateAndFailStrategy;

#[async_trait]
impl RecoveryStrategy for CompensateAndFailStrategy {
    fn name(&self) -> &str {
        "compensate_and_fail"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn is_applicable(&self, error: &ErrorContext, _correlated: &[CorrelatedErrorGroup]) -> bool {
        error.policy == ErrorStrategy::CompensateAndFail
    }

    async fn apply(
        &self,
        error: &ErrorContext,
        _context: &ExecutionContext,
    ) -> Result<RecoveryResult, RecoveryError> {
        Ok(RecoveryResult::failed(
            Some(self.name()),
            RecoveryOutcome::StrategyFailed,
            format!("Compensating after {}: {}", error.code, error.message),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkflow_core::{ExecutionId, FlowId};

    struct Named {
        name: &'static str,
        priority: i32,
        applicable: bool,
    }

    #[async_trait]
    impl RecoveryStrategy for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn is_applicable(&self, _error: &ErrorContext, _correlated: &[CorrelatedErrorGroup]) -> bool {
            self.applicable
        }

        async fn apply(
            &self,
            _error: &ErrorContext,
            _context: &ExecutionContext,
        ) -> Result<RecoveryResult, RecoveryError> {
            Ok(RecoveryResult::recovered(self.name, RecoveryDirective::Continue, "ok"))
        }
    }

    fn named(name: &'static str, priority: i32, applicable: bool) -> Arc<dyn RecoveryStrategy> {
        Arc::new(Named {
            name,
            priority,
            applicable,
        })
    }

    fn error(policy: ErrorStrategy, attempt: u32) -> ErrorContext {
        ErrorContext::new(ExecutionId::generate(), "E1", "import", "Io", "boom")
            .with_policy(policy)
            .with_attempt(attempt)
            .transient(true)
    }

    #[test]
    fn test_selection_by_priority_then_registration_order() {
        let mut manager = StrategyManager::new();
        manager.register(named("low", 1, true));
        manager.register(named("first-high", 10, true));
        manager.register(named("second-high", 10, true));
        manager.register(named("highest-not-applicable", 99, false));

        assert_eq!(
            manager.strategy_names(),
            vec!["highest-not-applicable", "first-high", "second-high", "low"]
        );

        let chosen = manager.find_strategy(&error(ErrorStrategy::Retry, 1), &[]).unwrap();
        assert_eq!(chosen.name(), "first-high");
    }

    #[test]
    fn test_no_strategy_for_fail_immediately() {
        let manager = StrategyManager::with_defaults(&ErrorHandlingConfig::default());
        assert!(manager
            .find_strategy(&error(ErrorStrategy::FailImmediately, 1), &[])
            .is_none());
    }

    #[tokio::test]
    async fn test_retry_strategy_respects_bound() {
        let config = ErrorHandlingConfig {
            max_retries: 2,
            retry_delay_ms: 100,
            ..Default::default()
        };
        let manager = StrategyManager::with_defaults(&config);
        let context = ExecutionContext::new(FlowId::from("f1"), 1);

        let strategy = manager.find_strategy(&error(ErrorStrategy::Retry, 2), &[]).unwrap();
        let result = strategy.apply(&error(ErrorStrategy::Retry, 2), &context).await.unwrap();
        assert!(result.is_successful);
        assert_eq!(result.directive, RecoveryDirective::RetryAfter(Duration::from_millis(200)));

        assert!(manager.find_strategy(&error(ErrorStrategy::Retry, 3), &[]).is_none());
    }

    #[test]
    fn test_permanent_fault_is_not_retried() {
        let manager = StrategyManager::with_defaults(&ErrorHandlingConfig::default());
        let panicked = ErrorContext::new(ExecutionId::generate(), "STEP_PANIC", "import", "Panic", "index out of range")
            .with_policy(ErrorStrategy::Retry)
            .with_attempt(1)
            .transient(false);

        assert!(manager.find_strategy(&panicked, &[]).is_none());
    }

    #[tokio::test]
    async fn test_skip_and_compensate_directives() {
        let manager = StrategyManager::with_defaults(&ErrorHandlingConfig::default());
        let context = ExecutionContext::new(FlowId::from("f1"), 1);

        let cases = vec![
            (ErrorStrategy::SkipAndContinue, true, RecoveryDirective::Continue),
            (ErrorStrategy::CompensateAndContinue, true, RecoveryDirective::CompensateAndContinue),
            (ErrorStrategy::CompensateAndFail, false, RecoveryDirective::Abort),
        ];

        for (policy, successful, directive) in cases {
            let err = error(policy, 1);
            let strategy = manager.find_strategy(&err, &[]).unwrap();
            let result = strategy.apply(&err, &context).await.unwrap();
            assert_eq!(result.is_successful, successful, "{:?}", policy);
            assert_eq!(result.directive, directive, "{:?}", policy);
        }
    }
}
