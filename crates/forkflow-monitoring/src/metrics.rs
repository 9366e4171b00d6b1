//! Metric names and recording helpers.
//!
//! Each runtime area gets a zero-sized recorder type whose functions wrap the
//! `metrics` macros, so names and label sets stay in one place.

use std::time::Duration;

/// Recovery attempts, labelled by outcome
pub const RECOVERY_ATTEMPTS_TOTAL: &str = "forkflow_recovery_attempts_total";
/// Recovery duration, labelled by outcome
pub const RECOVERY_DURATION_SECONDS: &str = "forkflow_recovery_duration_seconds";
/// Circuit breaker state changes, labelled by target state
pub const CIRCUIT_BREAKER_TRANSITIONS_TOTAL: &str = "forkflow_circuit_breaker_transitions_total";
/// Compensation passes
pub const COMPENSATION_RUNS_TOTAL: &str = "forkflow_compensation_runs_total";
/// Compensating actions that failed, labelled by action type
pub const COMPENSATION_FAILURES_TOTAL: &str = "forkflow_compensation_failures_total";

/// Lock acquisitions, labelled by mode
pub const LOCK_ACQUISITIONS_TOTAL: &str = "forkflow_lock_acquisitions_total";
/// Lock acquisitions that timed out
pub const LOCK_TIMEOUTS_TOTAL: &str = "forkflow_lock_timeouts_total";
/// Lock releases
pub const LOCK_RELEASES_TOTAL: &str = "forkflow_lock_releases_total";
/// Memory blocks allocated
pub const MEMORY_ALLOCATIONS_TOTAL: &str = "forkflow_memory_allocations_total";
/// Memory blocks freed
pub const MEMORY_FREES_TOTAL: &str = "forkflow_memory_frees_total";
/// Idle caches reclaimed
pub const CACHES_RECLAIMED_TOTAL: &str = "forkflow_caches_reclaimed_total";

/// Terminal branch states, labelled by status
pub const BRANCH_COMPLETIONS_TOTAL: &str = "forkflow_branch_completions_total";
/// Terminal step states, labelled by status
pub const STEP_COMPLETIONS_TOTAL: &str = "forkflow_step_completions_total";
/// Resolved join points, labelled by strategy and decision
pub const MERGES_TOTAL: &str = "forkflow_merges_total";
/// Execution duration, labelled by final status
pub const EXECUTION_DURATION_SECONDS: &str = "forkflow_execution_duration_seconds";

/// Register descriptions with the installed recorder
pub fn describe_metrics() {
    ::metrics::describe_counter!(RECOVERY_ATTEMPTS_TOTAL, "Recovery attempts by outcome");
    ::metrics::describe_histogram!(RECOVERY_DURATION_SECONDS, "Time spent in recovery");
    ::metrics::describe_counter!(
        CIRCUIT_BREAKER_TRANSITIONS_TOTAL,
        "Circuit breaker state transitions"
    );
    ::metrics::describe_counter!(COMPENSATION_RUNS_TOTAL, "Compensation passes");
    ::metrics::describe_counter!(COMPENSATION_FAILURES_TOTAL, "Failed compensating actions");
    ::metrics::describe_counter!(LOCK_ACQUISITIONS_TOTAL, "Branch lock acquisitions");
    ::metrics::describe_counter!(LOCK_TIMEOUTS_TOTAL, "Branch lock acquisition timeouts");
    ::metrics::describe_counter!(LOCK_RELEASES_TOTAL, "Branch lock releases");
    ::metrics::describe_counter!(MEMORY_ALLOCATIONS_TOTAL, "Memory blocks allocated");
    ::metrics::describe_counter!(MEMORY_FREES_TOTAL, "Memory blocks freed");
    ::metrics::describe_counter!(CACHES_RECLAIMED_TOTAL, "Idle caches reclaimed");
    ::metrics::describe_counter!(BRANCH_COMPLETIONS_TOTAL, "Branches reaching a terminal status");
    ::metrics::describe_counter!(STEP_COMPLETIONS_TOTAL, "Steps reaching a terminal status");
    ::metrics::describe_counter!(MERGES_TOTAL, "Resolved join points");
    ::metrics::describe_histogram!(EXECUTION_DURATION_SECONDS, "Flow run duration");
}

/// Recovery framework metrics
pub struct RecoveryMetrics;

impl RecoveryMetrics {
    /// Record a finished recovery attempt
    pub fn record_recovery(outcome: &str, duration: Duration) {
        ::metrics::counter!(RECOVERY_ATTEMPTS_TOTAL, 1, "outcome" => outcome.to_string());
        ::metrics::histogram!(
            RECOVERY_DURATION_SECONDS,
            duration.as_secs_f64(),
            "outcome" => outcome.to_string()
        );
    }

    /// Record a circuit breaker state change
    pub fn record_breaker_transition(to_state: &'static str) {
        ::metrics::counter!(CIRCUIT_BREAKER_TRANSITIONS_TOTAL, 1, "state" => to_state);
    }

    /// Record a compensation pass
    pub fn record_compensation(actions: usize, failures: usize) {
        ::metrics::counter!(COMPENSATION_RUNS_TOTAL, 1);
        if failures > 0 {
            ::metrics::counter!(
                COMPENSATION_FAILURES_TOTAL,
                failures as u64,
                "actions" => actions.to_string()
            );
        }
    }
}

/// Branch isolation, memory and cache metrics
pub struct MemoryMetrics;

impl MemoryMetrics {
    /// Record a lock acquisition
    pub fn record_lock_acquired(mode: &'static str) {
        ::metrics::counter!(LOCK_ACQUISITIONS_TOTAL, 1, "mode" => mode);
    }

    /// Record a lock timeout
    pub fn record_lock_timeout() {
        ::metrics::counter!(LOCK_TIMEOUTS_TOTAL, 1);
    }

    /// Record lock releases
    pub fn record_lock_released(count: usize) {
        ::metrics::counter!(LOCK_RELEASES_TOTAL, count as u64);
    }

    /// Record a block allocation
    pub fn record_allocation() {
        ::metrics::counter!(MEMORY_ALLOCATIONS_TOTAL, 1);
    }

    /// Record freed blocks
    pub fn record_free(count: usize) {
        ::metrics::counter!(MEMORY_FREES_TOTAL, count as u64);
    }

    /// Record reclaimed caches
    pub fn record_caches_reclaimed(count: usize) {
        ::metrics::counter!(CACHES_RECLAIMED_TOTAL, count as u64);
    }
}

/// Orchestration metrics
pub struct EngineMetrics;

impl EngineMetrics {
    /// Record a branch reaching a terminal status
    pub fn record_branch_finished(status: &str) {
        ::metrics::counter!(BRANCH_COMPLETIONS_TOTAL, 1, "status" => status.to_string());
    }

    /// Record a step reaching a terminal status
    pub fn record_step_finished(status: &str) {
        ::metrics::counter!(STEP_COMPLETIONS_TOTAL, 1, "status" => status.to_string());
    }

    /// Record a resolved join point
    pub fn record_merge(strategy: &str, decision: &'static str) {
        ::metrics::counter!(
            MERGES_TOTAL,
            1,
            "strategy" => strategy.to_string(),
            "decision" => decision
        );
    }

    /// Record a finished flow run
    pub fn record_execution(status: &str, duration: Duration) {
        ::metrics::histogram!(
            EXECUTION_DURATION_SECONDS,
            duration.as_secs_f64(),
            "status" => status.to_string()
        );
    }
}
