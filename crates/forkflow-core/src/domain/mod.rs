/// Flow, step and validation model
pub mod flow;

/// Branch topology and merge configuration
pub mod branch;

/// Error handling configuration and compensating actions
pub mod error_handling;

/// Error contexts handed to recovery
pub mod error_context;

/// Lifecycle events
pub mod events;

/// Versioned entity wrapper
pub mod versioned;

/// Repository interfaces
pub mod repository;
