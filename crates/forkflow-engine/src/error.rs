//! Error types for the branch orchestrator

use forkflow_core::CoreError;
use forkflow_memory::MemoryError;
use thiserror::Error;

/// Orchestration error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// The flow cannot be run
    #[error("Invalid flow: {0}")]
    InvalidFlow(String),

    /// Error from the model or the execution tree
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Error from the isolation or memory layer
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// The run was cancelled
    #[error("Execution cancelled")]
    Cancelled,

    /// Unexpected orchestration fault
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<EngineError> for CoreError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Core(inner) => inner,
            other => CoreError::Other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_errors_round_trip() {
        let err = EngineError::from(CoreError::BranchNotFound("audit".to_string()));
        assert_eq!(err.to_string(), "Branch not found: audit");
        assert_eq!(
            CoreError::from(err),
            CoreError::BranchNotFound("audit".to_string())
        );
    }

    #[test]
    fn test_memory_errors_convert() {
        let err = EngineError::from(MemoryError::AddressNotFound("mem-1".to_string()));
        match CoreError::from(err) {
            CoreError::Other(message) => assert!(message.contains("mem-1")),
            other => panic!("Expected Other, got {:?}", other),
        }
    }
}
