//! Error correlation.
//!
//! Keeps a bounded history of errors per execution and groups a new error
//! with earlier ones that share its code, component or type, or that
//! happened close to it in time.

use dashmap::DashMap;
use forkflow_core::{ErrorContext, ExecutionId, RecoveryConfig};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

/// How a group of errors relates to the error being correlated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CorrelationType {
    /// Same error code
    SameErrorCode,
    /// Same originating component
    SameComponent,
    /// Same error type
    SameErrorType,
    /// Occurred within the correlation window
    TimeProximity,
}

impl CorrelationType {
    /// Fixed strength of the correlation
    pub fn strength(self) -> f64 {
        match self {
            CorrelationType::SameErrorCode => 0.8,
            CorrelationType::SameComponent => 0.6,
            CorrelationType::SameErrorType => 0.5,
            CorrelationType::TimeProximity => 0.4,
        }
    }
}

/// Earlier errors related to a new error in one way
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelatedErrorGroup {
    /// Kind of relation
    pub correlation_type: CorrelationType,
    /// Strength of the relation
    pub strength: f64,
    /// Related errors, oldest first
    pub errors: Vec<ErrorContext>,
}

/// Correlates errors of the same execution
pub struct ErrorCorrelationEngine {
    history_limit: usize,
    window: Duration,
    histories: DashMap<ExecutionId, VecDeque<ErrorContext>>,
}

impl ErrorCorrelationEngine {
    /// Create an engine keeping at most `history_limit` errors per execution
    pub fn new(history_limit: usize, window: Duration) -> Self {
        Self {
            history_limit: history_limit.max(1),
            window,
            histories: DashMap::new(),
        }
    }

    /// Create an engine from the recovery settings
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self::new(config.history_limit, config.correlation_window())
    }

    /// Record `error` and return the groups of earlier errors related to it.
    ///
    /// Groups overlap: one earlier error can appear in several of them.
    /// Empty groups are left out.
    pub fn correlate_errors(&self, error: &ErrorContext) -> Vec<CorrelatedErrorGroup> {
        let others: Vec<ErrorContext> = {
            let mut history = self
                .histories
                .entry(error.execution_id.clone())
                .or_default();
            history.push_back(error.clone());
            while history.len() > self.history_limit {
                history.pop_front();
            }
            history
                .iter()
                .filter(|e| e.error_id != error.error_id)
                .cloned()
                .collect()
        };

        let window_ms = self.window.as_millis() as i64;
        let related = |kind: CorrelationType, other: &ErrorContext| match kind {
            CorrelationType::SameErrorCode => other.code == error.code,
            CorrelationType::SameComponent => other.component == error.component,
            CorrelationType::SameErrorType => other.error_type == error.error_type,
            CorrelationType::TimeProximity => {
                (error.timestamp - other.timestamp).num_milliseconds().abs() <= window_ms
            }
        };

        let groups: Vec<CorrelatedErrorGroup> = [
            CorrelationType::SameErrorCode,
            CorrelationType::SameComponent,
            CorrelationType::SameErrorType,
            CorrelationType::TimeProximity,
        ]
        .into_iter()
        .filter_map(|kind| {
            let errors: Vec<ErrorContext> = others
                .iter()
                .filter(|other| related(kind, other))
                .cloned()
                .collect();
            (!errors.is_empty()).then(|| CorrelatedErrorGroup {
                correlation_type: kind,
                strength: kind.strength(),
                errors,
            })
        })
        .collect();

        debug!(
            execution_id = %error.execution_id,
            code = %error.code,
            groups = groups.len(),
            "Correlated error"
        );
        groups
    }

    /// Errors recorded for an execution, oldest first
    pub fn history(&self, execution_id: &ExecutionId) -> Vec<ErrorContext> {
        self.histories
            .get(execution_id)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget the errors of an execution
    pub fn clear_history(&self, execution_id: &ExecutionId) {
        self.histories.remove(execution_id);
    }
}
