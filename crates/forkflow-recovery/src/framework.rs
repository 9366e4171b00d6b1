//! The recovery framework: one entry point that gates on the circuit
//! breaker, correlates the error, picks and applies a strategy, and runs
//! compensating actions when recovery does not succeed.

use forkflow_core::{ErrorContext, ErrorHandlingConfig, ExecutionContext, ExecutionId, RecoveryConfig};
use forkflow_monitoring::RecoveryMetrics;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
use crate::compensation::{CompensatingActionManager, CompensationHandler};
use crate::correlation::ErrorCorrelationEngine;
use crate::strategy::{RecoveryDirective, RecoveryOutcome, RecoveryResult, StrategyManager};
use crate::RecoveryError;

/// Composition root of the recovery components
pub struct RecoveryFramework {
    breakers: CircuitBreakerRegistry,
    correlation: ErrorCorrelationEngine,
    strategies: StrategyManager,
    compensations: Arc<CompensatingActionManager>,
    shutdown: CancellationToken,
}

impl RecoveryFramework {
    /// Assemble a framework from its parts
    pub fn new(
        config: &RecoveryConfig,
        strategies: StrategyManager,
        compensations: Arc<CompensatingActionManager>,
    ) -> Self {
        info!(strategies = ?strategies.strategy_names(), "Creating recovery framework");
        Self {
            breakers: CircuitBreakerRegistry::new(CircuitBreakerConfig::from(config)),
            correlation: ErrorCorrelationEngine::from_config(config),
            strategies,
            compensations,
            shutdown: CancellationToken::new(),
        }
    }

    /// Framework with the built-in strategies for a flow's error handling
    pub fn with_default_strategies(
        config: &RecoveryConfig,
        error_handling: &ErrorHandlingConfig,
        handler: Arc<dyn CompensationHandler>,
    ) -> Self {
        let compensations = Arc::new(CompensatingActionManager::new(handler, config.compensation_timeout()));
        Self::new(config, StrategyManager::with_defaults(error_handling), compensations)
    }

    /// Circuit breakers
    pub fn circuit_breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Correlation engine
    pub fn correlation(&self) -> &ErrorCorrelationEngine {
        &self.correlation
    }

    /// Compensating action registry
    pub fn compensations(&self) -> &Arc<CompensatingActionManager> {
        &self.compensations
    }

    /// Cancel in-flight compensation passes
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Recover from a step error.
    ///
    /// Never fails and never panics: faults inside the pipeline come back as
    /// a [`RecoveryOutcome::RecoveryFrameworkError`] result and count as a
    /// breaker failure.
    pub async fn recover(&self, error: &ErrorContext, context: &ExecutionContext) -> RecoveryResult {
        let started = Instant::now();
        let execution_id = &error.execution_id;

        let result = if self.breakers.is_open(execution_id) {
            warn!(execution_id = %execution_id, code = %error.code, "Circuit breaker open, rejecting recovery");
            RecoveryResult::failed(
                None,
                RecoveryOutcome::CircuitBreakerOpen,
                format!("Circuit breaker open for execution {}", execution_id),
            )
        } else {
            match AssertUnwindSafe(self.run_pipeline(error, context))
                .catch_unwind()
                .await
            {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => self.framework_fault(execution_id, e.to_string()),
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    self.framework_fault(execution_id, reason)
                }
            }
        };

        RecoveryMetrics::record_recovery(result.outcome.as_label(), started.elapsed());
        info!(
            execution_id = %execution_id,
            code = %error.code,
            outcome = %result.outcome,
            strategy = ?result.recovery_strategy,
            "Recovery finished"
        );
        result
    }

    async fn run_pipeline(
        &self,
        error: &ErrorContext,
        context: &ExecutionContext,
    ) -> Result<RecoveryResult, RecoveryError> {
        let execution_id = &error.execution_id;
        let correlated = self.correlation.correlate_errors(error);

        let strategy = match self.strategies.find_strategy(error, &correlated) {
            Some(strategy) => strategy,
            None => {
                debug!(execution_id = %execution_id, policy = ?error.policy, "No applicable recovery strategy");
                // A half-open trial must be settled or the breaker never closes again
                if self.breakers.state(execution_id) == CircuitState::HalfOpen {
                    self.breakers.record_failure(execution_id);
                }
                return Ok(RecoveryResult::failed(
                    None,
                    RecoveryOutcome::NoStrategyFound,
                    format!("No recovery strategy for {}: {}", error.code, error.message),
                ));
            }
        };

        debug!(execution_id = %execution_id, strategy = strategy.name(), "Applying recovery strategy");
        let mut result = strategy.apply(error, context).await?;

        if result.is_successful {
            self.breakers.record_success(execution_id);
            if result.directive == RecoveryDirective::CompensateAndContinue {
                self.run_compensation(execution_id).await;
            }
        } else {
            self.breakers.record_failure(execution_id);
            result.outcome = RecoveryOutcome::StrategyFailed;
            result.directive = RecoveryDirective::Abort;
            self.run_compensation(execution_id).await;
        }
        Ok(result)
    }

    async fn run_compensation(&self, execution_id: &ExecutionId) {
        let report = self.compensations.compensate(execution_id, &self.shutdown).await;
        if !report.is_clean() {
            warn!(
                execution_id = %execution_id,
                failed = report.failed.len(),
                attempted = report.attempted(),
                "Compensation finished with failures"
            );
        }
    }

    fn framework_fault(&self, execution_id: &ExecutionId, reason: String) -> RecoveryResult {
        error!(execution_id = %execution_id, reason = %reason, "Recovery framework fault");
        self.breakers.record_failure(execution_id);
        RecoveryResult::failed(
            None,
            RecoveryOutcome::RecoveryFrameworkError,
            format!("Recovery framework error: {}", reason),
        )
    }

    /// Drop all per-execution state of a finished execution
    pub fn forget_execution(&self, execution_id: &ExecutionId) {
        self.breakers.remove(execution_id);
        self.correlation.clear_history(execution_id);
        self.compensations.discard(execution_id);
    }
}
