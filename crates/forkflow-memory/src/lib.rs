//! Forkflow Memory - branch isolation and distributed intermediate data
//!
//! Everything here sits on the [`DistributedStore`] capability interface:
//! branch isolation contexts with address locks, addressed memory blocks
//! owned by flows or branches, and named caches with idle reclamation.
//! [`InMemoryCluster`] is the in-process store used by single-node
//! deployments and tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod error;
pub mod in_memory;
pub mod isolation;
pub mod memory;
pub mod ownership;
pub mod store;

pub use cache::{CacheInfo, CacheLifecycleManager, CacheSettings};
pub use error::MemoryError;
pub use in_memory::InMemoryCluster;
pub use isolation::{BranchIsolationInfo, BranchIsolationProvider, HeldLock, IsolationLevel, LockMode};
pub use memory::{DistributedMemoryManager, MemoryBlock};
pub use ownership::MemoryOwner;
pub use store::DistributedStore;
