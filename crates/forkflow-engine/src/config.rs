//! Orchestrator settings

use forkflow_memory::IsolationLevel;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings of a [`crate::BranchOrchestrator`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long a step waits for the lock on its branch memory, in milliseconds
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Isolation level of every branch
    #[serde(default)]
    pub isolation_level: IsolationLevel,

    /// Size of the block allocated for each branch, in bytes
    #[serde(default = "default_branch_memory_size")]
    pub branch_memory_size: usize,

    /// Free every branch's memory once the run is terminal
    #[serde(default = "default_true")]
    pub release_memory_on_completion: bool,
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_branch_memory_size() -> usize {
    4_096
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            isolation_level: IsolationLevel::default(),
            branch_memory_size: default_branch_memory_size(),
            release_memory_on_completion: default_true(),
        }
    }
}

impl EngineConfig {
    /// Lock timeout
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}
