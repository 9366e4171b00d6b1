//! Error types for branch isolation, memory and caches

use forkflow_core::CoreError;
use thiserror::Error;

/// Memory layer error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// No block is registered at the address
    #[error("Memory address not found: {0}")]
    AddressNotFound(String),

    /// Access outside the allocated block
    #[error("Access out of bounds at {address}: offset {offset} + length {length} exceeds size {size}")]
    OutOfBounds {
        /// Address accessed
        address: String,
        /// Requested offset
        offset: usize,
        /// Requested length
        length: usize,
        /// Allocated size
        size: usize,
    },

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Ownership string that is neither `{flow}` nor `{flow}:{branch}`
    #[error("Invalid memory owner: {0}")]
    InvalidOwner(String),

    /// Isolation context already exists
    #[error("Isolation context already exists: {0}")]
    IsolationContextExists(String),

    /// Isolation context not found
    #[error("Isolation context not found: {0}")]
    IsolationContextNotFound(String),

    /// Lock not obtained within the timeout
    #[error("Timed out after {timeout_ms}ms waiting for lock on {address}")]
    LockTimeout {
        /// Address being locked
        address: String,
        /// Timeout used
        timeout_ms: u64,
    },

    /// Lock already held by this owner, locks are not reentrant
    #[error("Lock on {0} is already held by this branch")]
    LockAlreadyHeld(String),

    /// Releasing a lock that is not held by the caller
    #[error("Lock not held: {0}")]
    LockNotHeld(String),

    /// Cache already exists
    #[error("Cache already exists: {0}")]
    CacheExists(String),

    /// Cache not found
    #[error("Cache not found: {0}")]
    CacheNotFound(String),

    /// Failure reported by the distributed store
    #[error("Distributed store error: {0}")]
    StoreError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        MemoryError::SerializationError(err.to_string())
    }
}

impl From<MemoryError> for CoreError {
    fn from(err: MemoryError) -> Self {
        CoreError::StateStoreError(err.to_string())
    }
}
