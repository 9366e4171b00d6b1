//! Execution context tree: one [`ExecutionContext`] per flow run, one
//! [`BranchExecutionContext`] per branch instance and one
//! [`StepExecutionContext`] per step invocation.
//!
//! Every status change goes through `update_status`, which consults the
//! transition table in [`ExecutionStatus::can_transition_to`], stamps
//! timestamps and records a lifecycle event.

use crate::domain::events::{
    BranchStatusChanged, DomainEvent, ExecutionStatusChanged, StepStatusChanged,
};
use crate::domain::flow::Flow;
use crate::execution::status::ExecutionStatus;
use crate::types::{BranchPath, ExecutionId, FlowId, MemoryAddress, StepId};
use crate::CoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Pending lifecycle events of a context.
///
/// Events are not cloned: a cloned context is a snapshot and starts with an
/// empty log.
#[derive(Default)]
pub struct EventLog(Vec<Box<dyn DomainEvent>>);

impl EventLog {
    fn record(&mut self, event: Box<dyn DomainEvent>) {
        self.0.push(event);
    }

    fn take(&mut self) -> Vec<Box<dyn DomainEvent>> {
        std::mem::take(&mut self.0)
    }

    /// Number of pending events
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no pending events
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Clone for EventLog {
    fn clone(&self) -> Self {
        Self(Vec::new())
    }
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.0.iter().map(|e| e.event_type()))
            .finish()
    }
}

/// Status and timestamps shared by every context level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lifecycle {
    /// Current status
    pub status: ExecutionStatus,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// First time the context entered Running
    pub started_at: Option<DateTime<Utc>>,

    /// Stamped when a terminal status is reached
    pub ended_at: Option<DateTime<Utc>>,

    /// Error message, only ever set by a transition to Failed
    pub error_message: Option<String>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            status: ExecutionStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            error_message: None,
        }
    }

    /// Apply a transition and return the previous status
    fn transition(
        &mut self,
        what: &str,
        next: ExecutionStatus,
        error: Option<String>,
    ) -> Result<ExecutionStatus, CoreError> {
        let previous = self.status;
        if !previous.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition(format!(
                "Cannot move {} from {:?} to {:?}",
                what, previous, next
            )));
        }

        let now = Utc::now();
        self.status = next;
        if next == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.ended_at = Some(now);
        }
        if next == ExecutionStatus::Failed {
            self.error_message = error;
        }

        Ok(previous)
    }

    fn ensure_open(&self, what: &str) -> Result<(), CoreError> {
        if self.status.is_terminal() {
            return Err(CoreError::InvalidStateTransition(format!(
                "Cannot modify {} in terminal state: {:?}",
                what, self.status
            )));
        }
        Ok(())
    }

    /// Time between start and end, when both are known
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// Log severity of a step log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepLogLevel {
    /// Debug
    Debug,
    /// Info
    Info,
    /// Warn
    Warn,
    /// Error
    Error,
}

/// One accumulated step log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLogEntry {
    /// When it was logged
    pub timestamp: DateTime<Utc>,
    /// Severity
    pub level: StepLogLevel,
    /// Message
    pub message: String,
}

/// Runtime record of one step invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionContext {
    /// Owning execution
    pub execution_id: ExecutionId,

    /// Owning branch
    pub branch_path: BranchPath,

    /// Step being invoked
    pub step_id: StepId,

    /// Status and timestamps
    #[serde(flatten)]
    pub lifecycle: Lifecycle,

    /// Address the step reads from
    pub input_address: Option<MemoryAddress>,

    /// Address the step wrote its output to
    pub output_address: Option<MemoryAddress>,

    /// Retry attempt, 0 for the first invocation
    pub retry_attempt: u32,

    /// Accumulated log lines
    pub logs: Vec<StepLogEntry>,

    /// Accumulated metrics
    pub metrics: HashMap<String, f64>,

    #[serde(skip)]
    events: EventLog,
}

impl StepExecutionContext {
    /// Create a step context for an invocation
    pub fn new(
        execution_id: ExecutionId,
        branch_path: BranchPath,
        step_id: StepId,
        retry_attempt: u32,
    ) -> Self {
        Self {
            execution_id,
            branch_path,
            step_id,
            lifecycle: Lifecycle::new(),
            input_address: None,
            output_address: None,
            retry_attempt,
            logs: Vec::new(),
            metrics: HashMap::new(),
            events: EventLog::default(),
        }
    }

    /// Current status
    pub fn status(&self) -> ExecutionStatus {
        self.lifecycle.status
    }

    /// Change the status
    pub fn update_status(
        &mut self,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<(), CoreError> {
        let what = format!("step {}", self.step_id);
        let from = self.lifecycle.transition(&what, status, error)?;
        self.events.record(Box::new(StepStatusChanged {
            execution_id: self.execution_id.clone(),
            branch_path: self.branch_path.clone(),
            step_id: self.step_id.clone(),
            attempt: self.retry_attempt,
            from,
            to: status,
            timestamp: Utc::now(),
        }));
        Ok(())
    }

    /// Set the input address
    pub fn set_input_address(&mut self, address: Option<MemoryAddress>) {
        self.input_address = address;
    }

    /// Set the output address
    pub fn set_output_address(&mut self, address: MemoryAddress) -> Result<(), CoreError> {
        self.lifecycle.ensure_open("step")?;
        self.output_address = Some(address);
        Ok(())
    }

    /// Append a log line
    pub fn log(&mut self, level: StepLogLevel, message: impl Into<String>) {
        self.logs.push(StepLogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        });
    }

    /// Record a metric
    pub fn add_metric(&mut self, name: impl Into<String>, value: f64) {
        self.metrics.insert(name.into(), value);
    }
}

/// Runtime record of one branch instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchExecutionContext {
    /// Owning execution
    pub execution_id: ExecutionId,

    /// Branch path
    pub branch_path: BranchPath,

    /// Branch this instance was forked from
    pub parent_branch_path: Option<BranchPath>,

    /// Step whose completion forked this instance
    pub parent_step_id: Option<StepId>,

    /// Resource-allocation priority copied from the model
    pub priority: u32,

    /// Status and timestamps
    #[serde(flatten)]
    pub lifecycle: Lifecycle,

    /// Step currently being executed
    pub current_step: Option<StepId>,

    /// Distributed memory address for branch-local data
    pub memory_address: Option<MemoryAddress>,

    /// Step invocations in order
    pub steps: Vec<StepExecutionContext>,

    /// Free-form parameters
    pub parameters: HashMap<String, serde_json::Value>,

    /// Free-form metrics
    pub metrics: HashMap<String, f64>,

    /// Free-form tags
    pub tags: HashMap<String, String>,

    #[serde(skip)]
    events: EventLog,
}

impl BranchExecutionContext {
    /// Create a root branch context
    pub fn new(execution_id: ExecutionId, branch_path: BranchPath, priority: u32) -> Self {
        Self {
            execution_id,
            branch_path,
            parent_branch_path: None,
            parent_step_id: None,
            priority,
            lifecycle: Lifecycle::new(),
            current_step: None,
            memory_address: None,
            steps: Vec::new(),
            parameters: HashMap::new(),
            metrics: HashMap::new(),
            tags: HashMap::new(),
            events: EventLog::default(),
        }
    }

    /// Mark this context as forked from a parent step
    pub fn forked_from(mut self, parent_branch: BranchPath, parent_step: StepId) -> Self {
        self.parent_branch_path = Some(parent_branch);
        self.parent_step_id = Some(parent_step);
        self
    }

    /// Current status
    pub fn status(&self) -> ExecutionStatus {
        self.lifecycle.status
    }

    /// Change the status
    pub fn update_status(
        &mut self,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<(), CoreError> {
        let what = format!("branch {}", self.branch_path);
        let from = self.lifecycle.transition(&what, status, error.clone())?;
        self.events.record(Box::new(BranchStatusChanged {
            execution_id: self.execution_id.clone(),
            branch_path: self.branch_path.clone(),
            from,
            to: status,
            error: if status == ExecutionStatus::Failed { error } else { None },
            timestamp: Utc::now(),
        }));
        Ok(())
    }

    /// Record a new step invocation and make it the current step
    pub fn add_step_execution_context(
        &mut self,
        step: StepExecutionContext,
    ) -> Result<(), CoreError> {
        self.lifecycle.ensure_open("branch")?;
        if step.branch_path != self.branch_path {
            return Err(CoreError::ValidationError(format!(
                "Step {} belongs to branch {}, not {}",
                step.step_id, step.branch_path, self.branch_path
            )));
        }
        self.current_step = Some(step.step_id.clone());
        self.steps.push(step);
        Ok(())
    }

    /// Latest invocation of a step
    pub fn step(&self, step_id: &StepId) -> Option<&StepExecutionContext> {
        self.steps.iter().rev().find(|s| &s.step_id == step_id)
    }

    /// Latest invocation of a step, mutable
    pub fn step_mut(&mut self, step_id: &StepId) -> Option<&mut StepExecutionContext> {
        self.steps.iter_mut().rev().find(|s| &s.step_id == step_id)
    }

    /// Assign the branch-local memory address
    pub fn set_memory_address(&mut self, address: MemoryAddress) {
        self.memory_address = Some(address);
    }

    /// Output address of the last completed step, if any
    pub fn last_output_address(&self) -> Option<&MemoryAddress> {
        self.steps
            .iter()
            .rev()
            .filter(|s| s.status() == ExecutionStatus::Completed)
            .find_map(|s| s.output_address.as_ref())
    }

    /// Add a parameter
    pub fn add_parameter(&mut self, key: impl Into<String>, value: serde_json::Value) -> Result<(), CoreError> {
        self.lifecycle.ensure_open("branch")?;
        self.parameters.insert(key.into(), value);
        Ok(())
    }

    /// Add a metric
    pub fn add_metric(&mut self, key: impl Into<String>, value: f64) -> Result<(), CoreError> {
        self.lifecycle.ensure_open("branch")?;
        self.metrics.insert(key.into(), value);
        Ok(())
    }

    /// Add a tag
    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<(), CoreError> {
        self.lifecycle.ensure_open("branch")?;
        self.tags.insert(key.into(), value.into());
        Ok(())
    }

    fn drain_events(&mut self, into: &mut Vec<Box<dyn DomainEvent>>) {
        into.extend(self.events.take());
        for step in &mut self.steps {
            into.extend(step.events.take());
        }
    }
}

/// Runtime record of one flow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Fresh id of this run
    pub execution_id: ExecutionId,

    /// Flow being run
    pub flow_id: FlowId,

    /// Version of the flow being run
    pub flow_version: u32,

    /// Parent run when this is a sub-flow
    pub parent_execution_id: Option<ExecutionId>,

    /// Status and timestamps
    #[serde(flatten)]
    pub lifecycle: Lifecycle,

    /// Branch instances, in creation order
    pub branches: Vec<BranchExecutionContext>,

    /// Free-form parameters
    pub parameters: HashMap<String, serde_json::Value>,

    /// Free-form metrics
    pub metrics: HashMap<String, f64>,

    /// Free-form tags
    pub tags: HashMap<String, String>,

    #[serde(skip)]
    events: EventLog,
}

impl ExecutionContext {
    /// Create a context for a new run of a flow
    pub fn new(flow_id: FlowId, flow_version: u32) -> Self {
        Self {
            execution_id: ExecutionId::generate(),
            flow_id,
            flow_version,
            parent_execution_id: None,
            lifecycle: Lifecycle::new(),
            branches: Vec::new(),
            parameters: HashMap::new(),
            metrics: HashMap::new(),
            tags: HashMap::new(),
            events: EventLog::default(),
        }
    }

    /// Create a context for a run of the given flow
    pub fn for_flow(flow: &Flow) -> Self {
        Self::new(flow.id.clone(), flow.version)
    }

    /// Mark this run as a sub-flow of another run
    pub fn with_parent(mut self, parent: ExecutionId) -> Self {
        self.parent_execution_id = Some(parent);
        self
    }

    /// Current status
    pub fn status(&self) -> ExecutionStatus {
        self.lifecycle.status
    }

    /// Whether the run reached a terminal status
    pub fn is_terminal(&self) -> bool {
        self.lifecycle.status.is_terminal()
    }

    /// The single mutation entry point for the run status
    pub fn update_status(
        &mut self,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<(), CoreError> {
        let what = format!("execution {}", self.execution_id);
        let from = self.lifecycle.transition(&what, status, error.clone())?;
        self.events.record(Box::new(ExecutionStatusChanged {
            execution_id: self.execution_id.clone(),
            from,
            to: status,
            error: if status == ExecutionStatus::Failed { error } else { None },
            timestamp: Utc::now(),
        }));
        Ok(())
    }

    /// Attach a branch instance
    pub fn add_branch_execution_context(
        &mut self,
        branch: BranchExecutionContext,
    ) -> Result<(), CoreError> {
        self.lifecycle.ensure_open("execution")?;
        if branch.execution_id != self.execution_id {
            return Err(CoreError::ValidationError(format!(
                "Branch {} belongs to execution {}, not {}",
                branch.branch_path, branch.execution_id, self.execution_id
            )));
        }
        if self.branch(&branch.branch_path).is_some() {
            return Err(CoreError::ValidationError(format!(
                "Branch {} already has an execution context",
                branch.branch_path
            )));
        }
        self.branches.push(branch);
        Ok(())
    }

    /// Look up a branch instance
    pub fn branch(&self, path: &BranchPath) -> Option<&BranchExecutionContext> {
        self.branches.iter().find(|b| &b.branch_path == path)
    }

    /// Look up a branch instance, mutable
    pub fn branch_mut(&mut self, path: &BranchPath) -> Result<&mut BranchExecutionContext, CoreError> {
        self.branches
            .iter_mut()
            .find(|b| &b.branch_path == path)
            .ok_or_else(|| CoreError::BranchNotFound(path.to_string()))
    }

    /// Whether every branch instance reached a terminal status
    pub fn all_branches_terminal(&self) -> bool {
        self.branches.iter().all(|b| b.status().is_terminal())
    }

    /// Branch instances that failed
    pub fn failed_branches(&self) -> Vec<&BranchExecutionContext> {
        self.branches
            .iter()
            .filter(|b| b.status() == ExecutionStatus::Failed)
            .collect()
    }

    /// Add a parameter
    pub fn add_parameter(&mut self, key: impl Into<String>, value: serde_json::Value) -> Result<(), CoreError> {
        self.lifecycle.ensure_open("execution")?;
        self.parameters.insert(key.into(), value);
        Ok(())
    }

    /// Add a metric
    pub fn add_metric(&mut self, key: impl Into<String>, value: f64) -> Result<(), CoreError> {
        self.lifecycle.ensure_open("execution")?;
        self.metrics.insert(key.into(), value);
        Ok(())
    }

    /// Add a tag
    pub fn add_tag(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<(), CoreError> {
        self.lifecycle.ensure_open("execution")?;
        self.tags.insert(key.into(), value.into());
        Ok(())
    }

    /// Record an externally built lifecycle event, e.g. a fork or merge
    pub fn record_event(&mut self, event: Box<dyn DomainEvent>) {
        self.events.record(event);
    }

    /// Get and clear all pending events of the whole tree
    pub fn take_events(&mut self) -> Vec<Box<dyn DomainEvent>> {
        let mut events = self.events.take();
        for branch in &mut self.branches {
            branch.drain_events(&mut events);
        }
        events.sort_by_key(|e| e.timestamp());
        events
    }
}
