use thiserror::Error;

/// Core error type for the Forkflow model and execution tree
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Flow not found
    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    /// Branch not found
    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    /// Step not found
    #[error("Step not found: {0}")]
    StepNotFound(String),

    /// Structural validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Status change rejected by the execution state machine
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// Merge resolution error
    #[error("Merge error: {0}")]
    MergeError(String),

    /// Repository error
    #[error("State store error: {0}")]
    StateStoreError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Expression evaluation error
    #[error("Expression evaluation error: {0}")]
    ExpressionError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        CoreError::ConfigurationError(err.to_string())
    }
}

impl From<String> for CoreError {
    fn from(err: String) -> Self {
        CoreError::Other(err)
    }
}

impl From<&str> for CoreError {
    fn from(err: &str) -> Self {
        CoreError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let errors = vec![
            (CoreError::FlowNotFound("f1".to_string()), "Flow not found: f1"),
            (CoreError::BranchNotFound("main".to_string()), "Branch not found: main"),
            (CoreError::StepNotFound("s1".to_string()), "Step not found: s1"),
            (CoreError::ValidationError("bad".to_string()), "Validation error: bad"),
            (
                CoreError::InvalidStateTransition("Completed -> Running".to_string()),
                "Invalid state transition: Completed -> Running",
            ),
            (CoreError::MergeError("none".to_string()), "Merge error: none"),
            (CoreError::StateStoreError("db".to_string()), "State store error: db"),
            (CoreError::SerializationError("ser".to_string()), "Serialization error: ser"),
            (CoreError::ExpressionError("expr".to_string()), "Expression evaluation error: expr"),
            (CoreError::ConfigurationError("cfg".to_string()), "Configuration error: cfg"),
            (CoreError::Other("other".to_string()), "other"),
        ];

        for (error, expected_msg) in errors {
            assert_eq!(error.to_string(), expected_msg);
        }
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let error: CoreError = json_error.into();

        match error {
            CoreError::SerializationError(msg) => {
                assert!(msg.contains("expected value"));
            }
            _ => panic!("Expected SerializationError variant"),
        }
    }

    #[test]
    fn test_from_str() {
        let error: CoreError = "test error message".into();
        assert_eq!(error, CoreError::Other("test error message".to_string()));
    }
}
