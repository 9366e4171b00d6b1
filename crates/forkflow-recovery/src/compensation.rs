//! Compensating actions.
//!
//! Actions are registered per execution as steps complete. A compensation
//! pass removes the execution's whole list in one step, so actions
//! registered while it runs go into a fresh list, and then runs the taken
//! actions newest first. A failing action is logged and the pass moves on.

use async_trait::async_trait;
use dashmap::DashMap;
use forkflow_core::{CompensatingAction, ExecutionId};
use forkflow_monitoring::RecoveryMetrics;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::retry::{with_timeout, TimeoutError};
use crate::RecoveryError;

/// Executes one compensating action
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompensationHandler: Send + Sync {
    /// Undo the effect the action describes
    async fn compensate(
        &self,
        execution_id: &ExecutionId,
        action: &CompensatingAction,
    ) -> Result<(), RecoveryError>;
}

/// Handler that only logs the actions it is given
pub struct LoggingCompensationHandler;

#[async_trait]
impl CompensationHandler for LoggingCompensationHandler {
    async fn compensate(
        &self,
        execution_id: &ExecutionId,
        action: &CompensatingAction,
    ) -> Result<(), RecoveryError> {
        info!(
            execution_id = %execution_id,
            action_type = %action.action_type,
            step_id = %action.step_id,
            branch_path = %action.branch_path,
            "Compensating action"
        );
        Ok(())
    }
}

/// Outcome of a compensation pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompensationReport {
    /// Actions that ran successfully, in execution order
    pub completed: Vec<CompensatingAction>,
    /// Actions that failed, with the error
    pub failed: Vec<(CompensatingAction, RecoveryError)>,
}

impl CompensationReport {
    /// Number of actions attempted
    pub fn attempted(&self) -> usize {
        self.completed.len() + self.failed.len()
    }

    /// Whether every action succeeded
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Registers compensating actions and runs them in reverse order
pub struct CompensatingActionManager {
    handler: Arc<dyn CompensationHandler>,
    action_timeout: Duration,
    actions: DashMap<ExecutionId, Vec<CompensatingAction>>,
}

impl CompensatingActionManager {
    /// Create a manager; each action gets at most `action_timeout`
    pub fn new(handler: Arc<dyn CompensationHandler>, action_timeout: Duration) -> Self {
        Self {
            handler,
            action_timeout,
            actions: DashMap::new(),
        }
    }

    /// Register an action for an execution
    pub fn register(&self, execution_id: &ExecutionId, action: CompensatingAction) {
        debug!(
            execution_id = %execution_id,
            action_type = %action.action_type,
            step_id = %action.step_id,
            "Registered compensating action"
        );
        self.actions
            .entry(execution_id.clone())
            .or_default()
            .push(action);
    }

    /// Actions waiting for an execution, in registration order
    pub fn pending(&self, execution_id: &ExecutionId) -> Vec<CompensatingAction> {
        self.actions
            .get(execution_id)
            .map(|actions| actions.clone())
            .unwrap_or_default()
    }

    /// Drop the actions of an execution without running them
    pub fn discard(&self, execution_id: &ExecutionId) -> usize {
        self.actions
            .remove(execution_id)
            .map(|(_, actions)| actions.len())
            .unwrap_or(0)
    }

    /// Run every registered action of the execution, newest first
    pub async fn compensate(&self, execution_id: &ExecutionId, token: &CancellationToken) -> CompensationReport {
        let actions = match self.actions.remove(execution_id) {
            Some((_, actions)) => actions,
            None => return CompensationReport::default(),
        };

        info!(execution_id = %execution_id, count = actions.len(), "Running compensating actions");

        let mut report = CompensationReport::default();
        for action in actions.into_iter().rev() {
            let outcome = with_timeout(
                self.action_timeout,
                token,
                self.handler.compensate(execution_id, &action),
            )
            .await;

            let result = match outcome {
                Ok(result) => result,
                Err(TimeoutError::TimedOut(after)) => Err(RecoveryError::Timeout(after.as_millis() as u64)),
                Err(TimeoutError::Cancelled) => Err(RecoveryError::Cancelled),
            };

            match result {
                Ok(()) => report.completed.push(action),
                Err(e) => {
                    error!(
                        execution_id = %execution_id,
                        action_type = %action.action_type,
                        step_id = %action.step_id,
                        error = %e,
                        "Compensating action failed"
                    );
                    report.failed.push((action, e));
                }
            }
        }

        RecoveryMetrics::record_compensation(report.attempted(), report.failed.len());
        report
    }
}
