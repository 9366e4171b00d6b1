//! Error types for the recovery framework

use forkflow_core::CoreError;
use thiserror::Error;

/// Recovery layer error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecoveryError {
    /// A strategy could not be applied
    #[error("Strategy error: {0}")]
    StrategyError(String),

    /// A compensating action failed
    #[error("Compensation error: {0}")]
    CompensationError(String),

    /// An operation did not finish in time
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Error from the core model
    #[error("Core error: {0}")]
    Core(String),
}

impl From<CoreError> for RecoveryError {
    fn from(err: CoreError) -> Self {
        RecoveryError::Core(err.to_string())
    }
}

impl From<RecoveryError> for CoreError {
    fn from(err: RecoveryError) -> Self {
        CoreError::Other(err.to_string())
    }
}
