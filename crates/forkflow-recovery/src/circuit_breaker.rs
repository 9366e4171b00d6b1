//! Per-execution circuit breakers.
//!
//! Every execution id has its own Closed / Open / HalfOpen breaker. State is
//! kept in a concurrent map so reads and writes for one execution id are
//! linearizable while different execution ids never contend on a single lock.

use dashmap::DashMap;
use forkflow_core::{ExecutionId, RecoveryConfig};
use forkflow_monitoring::RecoveryMetrics;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Failures are being counted, recovery proceeds
    Closed,
    /// Recovery is rejected until the reset timeout elapses
    Open,
    /// A single trial is allowed through
    HalfOpen,
}

impl CircuitState {
    fn as_label(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Breaker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Time an open breaker waits before allowing a trial
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::from(&RecoveryConfig::default())
    }
}

impl From<&RecoveryConfig> for CircuitBreakerConfig {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            reset_timeout_ms: config.reset_timeout_ms,
        }
    }
}

#[derive(Debug)]
struct BreakerEntry {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
}

impl BreakerEntry {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
    }
}

/// Registry of breakers keyed by execution id
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<ExecutionId, BreakerEntry>,
}

impl CircuitBreakerRegistry {
    /// Create a registry
    pub fn new(config: CircuitBreakerConfig) -> Self {
        debug!(?config, "Creating circuit breaker registry");
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.config.reset_timeout_ms)
    }

    /// Whether recovery for the execution must be rejected.
    ///
    /// An open breaker whose reset timeout has elapsed moves to HalfOpen and
    /// lets exactly one caller through; later calls are rejected until that
    /// trial is recorded as a success or failure.
    pub fn is_open(&self, execution_id: &ExecutionId) -> bool {
        let Some(mut entry) = self.breakers.get_mut(execution_id) else {
            return false;
        };

        match entry.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = entry.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed >= self.reset_timeout() {
                    entry.state = CircuitState::HalfOpen;
                    RecoveryMetrics::record_breaker_transition(CircuitState::HalfOpen.as_label());
                    info!(execution_id = %execution_id, ?elapsed, "Circuit breaker half-open, allowing one trial");
                    false
                } else {
                    debug!(execution_id = %execution_id, ?elapsed, "Circuit breaker open");
                    true
                }
            }
            // The trial is in flight
            CircuitState::HalfOpen => true,
        }
    }

    /// Record a failed recovery
    pub fn record_failure(&self, execution_id: &ExecutionId) {
        let mut entry = self
            .breakers
            .entry(execution_id.clone())
            .or_insert_with(BreakerEntry::closed);

        entry.failure_count = entry.failure_count.saturating_add(1);
        match entry.state {
            CircuitState::Closed => {
                if entry.failure_count >= self.config.failure_threshold {
                    entry.open();
                    RecoveryMetrics::record_breaker_transition(CircuitState::Open.as_label());
                    warn!(
                        execution_id = %execution_id,
                        failures = entry.failure_count,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                entry.open();
                RecoveryMetrics::record_breaker_transition(CircuitState::Open.as_label());
                warn!(execution_id = %execution_id, "Circuit breaker trial failed, reopening");
            }
            CircuitState::Open => {}
        }
    }

    /// Record a successful recovery
    pub fn record_success(&self, execution_id: &ExecutionId) {
        let Some(mut entry) = self.breakers.get_mut(execution_id) else {
            return;
        };

        match entry.state {
            CircuitState::HalfOpen => {
                *entry = BreakerEntry::closed();
                RecoveryMetrics::record_breaker_transition(CircuitState::Closed.as_label());
                info!(execution_id = %execution_id, "Circuit breaker closed");
            }
            CircuitState::Closed => entry.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    /// Current state, Closed for unknown executions
    pub fn state(&self, execution_id: &ExecutionId) -> CircuitState {
        self.breakers
            .get(execution_id)
            .map(|entry| entry.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Consecutive failures counted so far
    pub fn failure_count(&self, execution_id: &ExecutionId) -> u32 {
        self.breakers
            .get(execution_id)
            .map(|entry| entry.failure_count)
            .unwrap_or(0)
    }

    /// Drop the breaker of a finished execution
    pub fn remove(&self, execution_id: &ExecutionId) {
        self.breakers.remove(execution_id);
    }
}
