//! The boundary to step business logic.
//!
//! The orchestrator never looks at payloads. A step receives the addresses
//! of its inputs and the memory manager, and answers with the address of
//! its output or a typed failure.

use async_trait::async_trait;
use forkflow_core::{BranchPath, ExecutionId, FlowId, FlowStep, MemoryAddress};
use forkflow_memory::{DistributedMemoryManager, MemoryOwner};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// One invocation of a step
#[derive(Debug, Clone, PartialEq)]
pub struct StepInvocation {
    /// Run the step belongs to
    pub execution_id: ExecutionId,
    /// Flow being run
    pub flow_id: FlowId,
    /// Branch running the step
    pub branch_path: BranchPath,
    /// The step definition
    pub step: FlowStep,
    /// 1-based attempt number
    pub attempt: u32,
    /// Owner to allocate output memory for
    pub owner: MemoryOwner,
    /// Branch-local memory block, locked exclusively for the invocation
    pub branch_memory: MemoryAddress,
    /// Output of the previous step, or the fork input for a branch's first step
    pub input_address: Option<MemoryAddress>,
    /// Outputs adopted from merged branches, in adoption order
    pub merged_inputs: Vec<MemoryAddress>,
}

/// Result of a successful invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    /// Where the step left its output
    pub output_address: Option<MemoryAddress>,
    /// Small summary exposed to merge predicates
    pub data: Option<serde_json::Value>,
}

impl StepOutput {
    /// Output stored at `address`
    pub fn at(address: MemoryAddress) -> Self {
        Self {
            output_address: Some(address),
            data: None,
        }
    }

    /// Attach predicate data
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Typed failure of a step
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{code} ({error_type}): {message}")]
pub struct StepFailure {
    /// Error code
    pub code: String,
    /// Error category, e.g. `Timeout` or `Validation`
    pub error_type: String,
    /// Human-readable message
    pub message: String,
    /// Whether trying again may succeed
    pub transient: bool,
}

impl StepFailure {
    /// A failure that will not go away on retry
    pub fn permanent(code: impl Into<String>, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            error_type: error_type.into(),
            message: message.into(),
            transient: false,
        }
    }

    /// A failure that may go away on retry
    pub fn transient(code: impl Into<String>, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            transient: true,
            ..Self::permanent(code, error_type, message)
        }
    }
}

/// Executes the business logic of a step
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Run one invocation
    async fn execute(
        &self,
        invocation: &StepInvocation,
        memory: &DistributedMemoryManager,
    ) -> Result<StepOutput, StepFailure>;
}

/// Dispatches invocations to executors registered by component name
#[derive(Default, Clone)]
pub struct ComponentRegistry {
    components: HashMap<String, Arc<dyn StepExecutor>>,
}

impl ComponentRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the executor of a component, replacing any previous one
    pub fn register(mut self, component: impl Into<String>, executor: Arc<dyn StepExecutor>) -> Self {
        self.components.insert(component.into(), executor);
        self
    }

    /// Registered component names, sorted
    pub fn components(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.components.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl StepExecutor for ComponentRegistry {
    async fn execute(
        &self,
        invocation: &StepInvocation,
        memory: &DistributedMemoryManager,
    ) -> Result<StepOutput, StepFailure> {
        match self.components.get(&invocation.step.component) {
            Some(executor) => executor.execute(invocation, memory).await,
            None => {
                warn!(
                    component = %invocation.step.component,
                    step_id = %invocation.step.id,
                    "No executor registered for component"
                );
                Err(StepFailure::permanent(
                    "COMPONENT_NOT_FOUND",
                    "Configuration",
                    format!("No executor registered for component {}", invocation.step.component),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkflow_core::{CacheDefaults, StepKind};
    use forkflow_memory::{CacheLifecycleManager, InMemoryCluster};

    fn memory() -> DistributedMemoryManager {
        let store = Arc::new(InMemoryCluster::new());
        DistributedMemoryManager::new(store.clone(), CacheLifecycleManager::new(store, CacheDefaults::default()))
    }

    fn invocation(component: &str) -> StepInvocation {
        let flow_id = FlowId::from("orders");
        StepInvocation {
            execution_id: ExecutionId::generate(),
            flow_id: flow_id.clone(),
            branch_path: BranchPath::main(),
            step: FlowStep::new("s0", "main", StepKind::Import, 0, component),
            attempt: 1,
            owner: MemoryOwner::branch(&flow_id, &BranchPath::main()),
            branch_memory: MemoryAddress::from("mem-branch"),
            input_address: None,
            merged_inputs: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_registry_dispatches_by_component() {
        let mut reader = MockStepExecutor::new();
        reader
            .expect_execute()
            .withf(|invocation, _| invocation.step.component == "csv-reader")
            .times(1)
            .returning(|_, _| Ok(StepOutput::at(MemoryAddress::from("mem-out"))));

        let registry = ComponentRegistry::new().register("csv-reader", Arc::new(reader));
        assert_eq!(registry.components(), vec!["csv-reader"]);

        let output = registry.execute(&invocation("csv-reader"), &memory()).await.unwrap();
        assert_eq!(output.output_address, Some(MemoryAddress::from("mem-out")));
    }

    #[tokio::test]
    async fn test_unknown_component_is_permanent_failure() {
        let registry = ComponentRegistry::new();

        let failure = registry.execute(&invocation("missing"), &memory()).await.unwrap_err();
        assert_eq!(failure.code, "COMPONENT_NOT_FOUND");
        assert!(!failure.transient);
    }

    #[test]
    fn test_failure_display() {
        let failure = StepFailure::transient("E504", "Timeout", "upstream slow");
        assert!(failure.transient);
        assert_eq!(failure.to_string(), "E504 (Timeout): upstream slow");
    }
}
