/// Lifecycle status and transition table
pub mod status;

/// Execution, branch and step contexts
pub mod context;

/// Merge resolution at join points
pub mod merge;
