use async_trait::async_trait;
use forkflow_core::{
    BranchPath, CompensatingAction, CoreError, ErrorHandlingConfig, ErrorStrategy, ExecutionContext, ExecutionId,
    ExecutionStatus, Flow, FlowBranch, FlowStep, MemoryAddress, MergeCandidate, MergeConfig, MergePredicate,
    MergeStrategy, RuntimeConfig, StepId, StepKind,
};
use forkflow_engine::{
    BranchOrchestrator, EngineConfig, EngineError, StepExecutor, StepFailure, StepInvocation, StepOutput,
};
use forkflow_memory::{DistributedMemoryManager, InMemoryCluster, MemoryOwner};
use forkflow_recovery::{CompensationHandler, RecoveryError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("forkflow_engine=debug".parse().unwrap()),
        )
        .with_test_writer()
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// How a scripted step behaves
#[derive(Debug, Clone, Default)]
struct Behaviour {
    delay_ms: u64,
    transient_failures: u32,
    always_fail: bool,
    data: Option<Value>,
}

#[derive(Debug, Clone)]
struct Call {
    step: String,
    attempt: u32,
    merged_payloads: Vec<Vec<u8>>,
}

/// Writes the step id as its output and records every invocation
#[derive(Default)]
struct ScriptedExecutor {
    behaviours: HashMap<String, Behaviour>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedExecutor {
    fn with(mut self, step: &str, behaviour: Behaviour) -> Self {
        self.behaviours.insert(step.to_string(), behaviour);
        self
    }

    fn called_steps(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|c| c.step.clone()).collect()
    }

    fn call(&self, step: &str) -> Call {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|c| c.step == step)
            .cloned()
            .unwrap_or_else(|| panic!("Step {} was never called", step))
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        invocation: &StepInvocation,
        memory: &DistributedMemoryManager,
    ) -> Result<StepOutput, StepFailure> {
        let mut merged_payloads = Vec::new();
        for address in &invocation.merged_inputs {
            merged_payloads.push(memory.read_all(address).await.unwrap());
        }
        self.calls.lock().unwrap().push(Call {
            step: invocation.step.id.0.clone(),
            attempt: invocation.attempt,
            merged_payloads,
        });

        let behaviour = self
            .behaviours
            .get(&invocation.step.id.0)
            .cloned()
            .unwrap_or_default();
        if behaviour.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(behaviour.delay_ms)).await;
        }
        if behaviour.always_fail {
            return Err(StepFailure::permanent(
                "E500",
                "Io",
                format!("{} lost its sink", invocation.step.id),
            ));
        }
        if invocation.attempt <= behaviour.transient_failures {
            return Err(StepFailure::transient("E503", "Timeout", "upstream busy"));
        }

        let address = memory
            .allocate_with(&invocation.owner, invocation.step.id.0.as_bytes())
            .await
            .map_err(|e| StepFailure::permanent("MEMORY", "Memory", e.to_string()))?;
        let mut output = StepOutput::at(address);
        if let Some(data) = behaviour.data {
            output = output.with_data(data);
        }
        Ok(output)
    }
}

#[derive(Default)]
struct RecordingCompensation {
    ran: Mutex<Vec<String>>,
}

#[async_trait]
impl CompensationHandler for RecordingCompensation {
    async fn compensate(
        &self,
        _execution_id: &ExecutionId,
        action: &CompensatingAction,
    ) -> Result<(), RecoveryError> {
        self.ran.lock().unwrap().push(action.action_type.clone());
        Ok(())
    }
}

/// `main` runs s0 then s1; `branchA` forks at s0 and merges into s1
fn fork_join_flow(strategy: MergeStrategy) -> Flow {
    Flow::new("orders", "Order import")
        .with_step(FlowStep::new("s0", "main", StepKind::Import, 0, "reader"))
        .with_step(FlowStep::new("s1", "main", StepKind::Export, 1, "writer"))
        .with_step(FlowStep::new("a0", "branchA", StepKind::Process, 0, "auditor"))
        .with_branch(FlowBranch::main())
        .with_branch(
            FlowBranch::forked("branchA", "main", "s0").with_merge(MergeConfig::new("main", 1, strategy)),
        )
}

fn linear_flow(error_handling: ErrorHandlingConfig) -> Flow {
    Flow::new("billing", "Billing export")
        .with_step(FlowStep::new("s0", "main", StepKind::Import, 0, "reader"))
        .with_step(FlowStep::new("s1", "main", StepKind::Process, 1, "pricer"))
        .with_step(FlowStep::new("s2", "main", StepKind::Export, 2, "writer"))
        .with_branch(FlowBranch::main())
        .with_error_handling(error_handling)
}

fn orchestrator(flow: Flow, executor: Arc<ScriptedExecutor>) -> (Arc<InMemoryCluster>, BranchOrchestrator) {
    let store = Arc::new(InMemoryCluster::new());
    let orchestrator = BranchOrchestrator::new(
        flow,
        store.clone(),
        executor,
        &RuntimeConfig::default(),
        EngineConfig::default(),
    )
    .unwrap();
    (store, orchestrator)
}

fn branch_status(context: &ExecutionContext, path: &str) -> ExecutionStatus {
    context.branch(&BranchPath::from(path)).unwrap().status()
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_all_completes_after_every_branch() {
    init_test_tracing();

    let executor = Arc::new(ScriptedExecutor::default().with(
        "a0",
        Behaviour {
            delay_ms: 50,
            ..Default::default()
        },
    ));
    let (store, orchestrator) = orchestrator(fork_join_flow(MergeStrategy::WaitForAll), executor.clone());

    let mut context = assert_ok!(orchestrator.run(CancellationToken::new()).await);

    // Step 1: both branches and the run completed
    assert_eq!(context.status(), ExecutionStatus::Completed);
    assert_eq!(branch_status(&context, "main"), ExecutionStatus::Completed);
    assert_eq!(branch_status(&context, "branchA"), ExecutionStatus::Completed);

    // Step 2: the run ended only after both branches ended
    let ended = context.lifecycle.ended_at.unwrap();
    for branch in &context.branches {
        assert!(branch.lifecycle.ended_at.unwrap() <= ended);
    }

    // Step 3: s1 ran after a0 and received its output
    let main = context.branch(&BranchPath::main()).unwrap();
    let audit = context.branch(&BranchPath::from("branchA")).unwrap();
    let a0_ended = audit.step(&StepId::from("a0")).unwrap().lifecycle.ended_at.unwrap();
    let s1_started = main.step(&StepId::from("s1")).unwrap().lifecycle.started_at.unwrap();
    assert!(a0_ended <= s1_started);
    assert_eq!(executor.call("s1").merged_payloads, vec![b"a0".to_vec()]);
    assert_eq!(audit.parent_step_id, Some(StepId::from("s0")));

    // Step 4: fork and merge were recorded
    let event_types: Vec<&str> = context.take_events().iter().map(|e| e.event_type()).collect();
    assert!(event_types.contains(&"branch.forked"));
    assert!(event_types.contains(&"branch.merged"));

    // Step 5: no lock or isolation record outlives the run, memory was released
    assert_eq!(store.held_lock_count(), 0);
    for path in ["main", "branchA"] {
        let isolation = orchestrator
            .isolation()
            .get_isolation_context(&orchestrator.flow().id, &BranchPath::from(path))
            .await
            .unwrap();
        assert!(isolation.is_none());
        let owner = MemoryOwner::branch(&orchestrator.flow().id, &BranchPath::from(path));
        assert!(orchestrator.memory().addresses_of(&owner).await.unwrap().is_empty());
    }
}

#[tokio::test(start_paused = true)]
async fn test_first_complete_cancels_slower_branches() {
    let flow = Flow::new("quotes", "Quote race")
        .with_step(FlowStep::new("s0", "main", StepKind::Import, 0, "reader"))
        .with_step(FlowStep::new("s1", "main", StepKind::Export, 1, "writer"))
        .with_step(FlowStep::new("f0", "fast", StepKind::Process, 0, "cache"))
        .with_step(FlowStep::new("w0", "slow", StepKind::Process, 0, "mainframe"))
        .with_step(FlowStep::new("w1", "slow", StepKind::Process, 1, "mainframe"))
        .with_branch(FlowBranch::main())
        .with_branch(
            FlowBranch::forked("fast", "main", "s0")
                .with_merge(MergeConfig::new("main", 1, MergeStrategy::FirstComplete)),
        )
        .with_branch(
            FlowBranch::forked("slow", "main", "s0")
                .with_merge(MergeConfig::new("main", 1, MergeStrategy::FirstComplete)),
        );
    let executor = Arc::new(
        ScriptedExecutor::default()
            .with(
                "f0",
                Behaviour {
                    delay_ms: 10,
                    ..Default::default()
                },
            )
            .with(
                "w0",
                Behaviour {
                    delay_ms: 10_000,
                    ..Default::default()
                },
            ),
    );
    let (_store, orchestrator) = orchestrator(flow, executor.clone());

    let context = orchestrator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(context.status(), ExecutionStatus::Completed);
    assert_eq!(branch_status(&context, "fast"), ExecutionStatus::Completed);
    assert_eq!(branch_status(&context, "slow"), ExecutionStatus::Cancelled);
    assert_eq!(executor.call("s1").merged_payloads, vec![b"f0".to_vec()]);
    assert!(!executor.called_steps().contains(&"w1".to_string()));

    let slow = context.branch(&BranchPath::from("slow")).unwrap();
    assert_eq!(slow.step(&StepId::from("w0")).unwrap().status(), ExecutionStatus::Cancelled);
}

/// `low` and `high` fork at s0 and merge into s1 when their score exceeds 5
fn scoring_flow() -> Flow {
    Flow::new("scoring", "Scoring")
        .with_step(FlowStep::new("s0", "main", StepKind::Import, 0, "reader"))
        .with_step(FlowStep::new("s1", "main", StepKind::Export, 1, "writer"))
        .with_step(FlowStep::new("lo0", "low", StepKind::Process, 0, "model-a"))
        .with_step(FlowStep::new("hi0", "high", StepKind::Process, 0, "model-b"))
        .with_branch(FlowBranch::main())
        .with_branch(FlowBranch::forked("low", "main", "s0").with_merge(
            MergeConfig::new("main", 1, MergeStrategy::Conditional).with_strategy_config("data.score > `5`"),
        ))
        .with_branch(FlowBranch::forked("high", "main", "s0").with_merge(
            MergeConfig::new("main", 1, MergeStrategy::Conditional).with_strategy_config("data.score > `5`"),
        ))
}

fn scoring_executor() -> ScriptedExecutor {
    ScriptedExecutor::default()
        .with(
            "lo0",
            Behaviour {
                data: Some(json!({"score": 2})),
                ..Default::default()
            },
        )
        .with(
            "hi0",
            Behaviour {
                data: Some(json!({"score": 9})),
                ..Default::default()
            },
        )
}

/// Adopts the named branch whatever the expression says
struct AdoptBranch(&'static str);

impl MergePredicate for AdoptBranch {
    fn matches(&self, _expression: &str, candidate: &MergeCandidate) -> Result<bool, CoreError> {
        Ok(candidate.branch_path == BranchPath::from(self.0))
    }
}

#[tokio::test]
async fn test_conditional_merge_adopts_matching_branch() {
    let executor = Arc::new(scoring_executor());
    let (_store, orchestrator) = orchestrator(scoring_flow(), executor.clone());

    let context = orchestrator.run(CancellationToken::new()).await.unwrap();

    // JMESPath decides without any predicate configured
    assert_eq!(context.status(), ExecutionStatus::Completed);
    assert_eq!(executor.call("s1").merged_payloads, vec![b"hi0".to_vec()]);
}

#[tokio::test]
async fn test_conditional_merge_uses_configured_predicate() {
    let executor = Arc::new(scoring_executor());
    let (_store, orchestrator) = orchestrator(scoring_flow(), executor.clone());
    let orchestrator = orchestrator.with_merge_predicate(Arc::new(AdoptBranch("low")));

    let context = orchestrator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(context.status(), ExecutionStatus::Completed);
    assert_eq!(executor.call("s1").merged_payloads, vec![b"lo0".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn test_priority_merge_adopts_highest_priority_branch() {
    let flow = Flow::new("pricing", "Tiered pricing")
        .with_step(FlowStep::new("s0", "main", StepKind::Import, 0, "reader"))
        .with_step(FlowStep::new("s1", "main", StepKind::Export, 1, "writer"))
        .with_step(FlowStep::new("b0", "bronze", StepKind::Process, 0, "pricer"))
        .with_step(FlowStep::new("g0", "gold", StepKind::Process, 0, "pricer"))
        .with_branch(FlowBranch::main())
        .with_branch(
            FlowBranch::forked("bronze", "main", "s0")
                .with_priority(100)
                .with_merge(MergeConfig::new("main", 1, MergeStrategy::PriorityBased)),
        )
        .with_branch(
            FlowBranch::forked("gold", "main", "s0")
                .with_priority(200)
                .with_merge(MergeConfig::new("main", 1, MergeStrategy::PriorityBased)),
        );
    // gold finishes last so arrival order cannot pick it
    let executor = Arc::new(ScriptedExecutor::default().with(
        "g0",
        Behaviour {
            delay_ms: 500,
            ..Default::default()
        },
    ));
    let (_store, orchestrator) = orchestrator(flow, executor.clone());

    let context = orchestrator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(context.status(), ExecutionStatus::Completed);
    assert_eq!(branch_status(&context, "bronze"), ExecutionStatus::Completed);
    assert_eq!(branch_status(&context, "gold"), ExecutionStatus::Completed);
    assert_eq!(executor.call("s1").merged_payloads, vec![b"g0".to_vec()]);
}

#[tokio::test(start_paused = true)]
async fn test_merge_timeout_fails_target_step() {
    let mut flow = fork_join_flow(MergeStrategy::WaitForAll);
    flow.merge_strategy.merge_timeout_ms = Some(100);
    let executor = Arc::new(ScriptedExecutor::default().with(
        "a0",
        Behaviour {
            delay_ms: 10_000,
            ..Default::default()
        },
    ));
    let (_store, orchestrator) = orchestrator(flow, executor.clone());

    let context = orchestrator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(context.status(), ExecutionStatus::Failed);
    assert_eq!(branch_status(&context, "main"), ExecutionStatus::Failed);
    // The fork itself was not affected
    assert_eq!(branch_status(&context, "branchA"), ExecutionStatus::Completed);
    assert!(!executor.called_steps().contains(&"s1".to_string()));

    let main = context.branch(&BranchPath::main()).unwrap();
    let s1 = main.step(&StepId::from("s1")).unwrap();
    assert!(s1.lifecycle.error_message.as_deref().unwrap().contains("MERGE_NO_MATCH"));
}

#[tokio::test]
async fn test_failure_fails_run_and_cancels_unforked_branches() {
    let executor = Arc::new(ScriptedExecutor::default().with(
        "s0",
        Behaviour {
            always_fail: true,
            ..Default::default()
        },
    ));
    let (store, orchestrator) = orchestrator(fork_join_flow(MergeStrategy::WaitForAll), executor.clone());

    let context = orchestrator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(context.status(), ExecutionStatus::Failed);
    let message = context.lifecycle.error_message.clone().unwrap();
    assert!(message.contains("main"), "{}", message);
    assert!(message.contains("lost its sink"), "{}", message);

    assert_eq!(branch_status(&context, "main"), ExecutionStatus::Failed);
    assert_eq!(branch_status(&context, "branchA"), ExecutionStatus::Cancelled);
    assert_eq!(executor.called_steps(), vec!["s0"]);
    assert_eq!(store.held_lock_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let error_handling = ErrorHandlingConfig {
        default_strategy: ErrorStrategy::Retry,
        max_retries: 3,
        retry_delay_ms: 10,
        ..Default::default()
    };
    let executor = Arc::new(ScriptedExecutor::default().with(
        "s1",
        Behaviour {
            transient_failures: 2,
            ..Default::default()
        },
    ));
    let (_store, orchestrator) = orchestrator(linear_flow(error_handling), executor.clone());

    let context = orchestrator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(context.status(), ExecutionStatus::Completed);
    let main = context.branch(&BranchPath::main()).unwrap();
    let attempts: Vec<(u32, ExecutionStatus)> = main
        .steps
        .iter()
        .filter(|s| s.step_id == StepId::from("s1"))
        .map(|s| (s.retry_attempt, s.status()))
        .collect();
    assert_eq!(
        attempts,
        vec![
            (0, ExecutionStatus::Failed),
            (1, ExecutionStatus::Failed),
            (2, ExecutionStatus::Completed),
        ]
    );
    assert_eq!(executor.call("s1").attempt, 3);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_is_not_retried() {
    let error_handling = ErrorHandlingConfig {
        default_strategy: ErrorStrategy::Retry,
        max_retries: 3,
        retry_delay_ms: 10,
        ..Default::default()
    };
    let executor = Arc::new(ScriptedExecutor::default().with(
        "s1",
        Behaviour {
            always_fail: true,
            ..Default::default()
        },
    ));
    let (_store, orchestrator) = orchestrator(linear_flow(error_handling), executor.clone());

    let context = orchestrator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(context.status(), ExecutionStatus::Failed);
    assert_eq!(executor.called_steps(), vec!["s0", "s1"]);
    assert_eq!(executor.call("s1").attempt, 1);
    let main = context.branch(&BranchPath::main()).unwrap();
    let s1_runs = main.steps.iter().filter(|s| s.step_id == StepId::from("s1")).count();
    assert_eq!(s1_runs, 1);
}

#[tokio::test]
async fn test_skip_and_continue_runs_remaining_steps() {
    let mut error_handling = ErrorHandlingConfig::default();
    error_handling
        .step_overrides
        .insert(StepId::from("s1"), ErrorStrategy::SkipAndContinue);
    let executor = Arc::new(ScriptedExecutor::default().with(
        "s1",
        Behaviour {
            always_fail: true,
            ..Default::default()
        },
    ));
    let (_store, orchestrator) = orchestrator(linear_flow(error_handling), executor.clone());

    let context = orchestrator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(context.status(), ExecutionStatus::Completed);
    assert_eq!(executor.called_steps(), vec!["s0", "s1", "s2"]);
    let main = context.branch(&BranchPath::main()).unwrap();
    assert_eq!(main.step(&StepId::from("s1")).unwrap().status(), ExecutionStatus::Failed);
    assert_eq!(main.step(&StepId::from("s2")).unwrap().status(), ExecutionStatus::Completed);
}

#[tokio::test]
async fn test_compensate_and_fail_undoes_completed_steps() {
    let mut error_handling = ErrorHandlingConfig {
        compensating_actions: vec![
            CompensatingAction::new("undo-s0", "s0", "main"),
            CompensatingAction::new("undo-s1", "s1", "main"),
        ],
        ..Default::default()
    };
    error_handling
        .step_overrides
        .insert(StepId::from("s2"), ErrorStrategy::CompensateAndFail);
    let executor = Arc::new(ScriptedExecutor::default().with(
        "s2",
        Behaviour {
            always_fail: true,
            ..Default::default()
        },
    ));
    let handler = Arc::new(RecordingCompensation::default());
    let (_store, orchestrator) = orchestrator(linear_flow(error_handling), executor);
    let orchestrator = orchestrator.with_compensation_handler(handler.clone());

    let context = orchestrator.run(CancellationToken::new()).await.unwrap();

    assert_eq!(context.status(), ExecutionStatus::Failed);
    assert_eq!(*handler.ran.lock().unwrap(), vec!["undo-s1", "undo-s0"]);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_running_branches() {
    let executor = Arc::new(ScriptedExecutor::default().with(
        "s0",
        Behaviour {
            delay_ms: 60_000,
            ..Default::default()
        },
    ));
    let (store, orchestrator) = orchestrator(fork_join_flow(MergeStrategy::WaitForAll), executor);
    let token = CancellationToken::new();

    let canceller = token.clone();
    let (result, _) = tokio::join!(orchestrator.run(token), async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });
    let context = result.unwrap();

    assert_eq!(context.status(), ExecutionStatus::Cancelled);
    assert_eq!(branch_status(&context, "main"), ExecutionStatus::Cancelled);
    assert_eq!(branch_status(&context, "branchA"), ExecutionStatus::Cancelled);
    let main = context.branch(&BranchPath::main()).unwrap();
    assert_eq!(main.step(&StepId::from("s0")).unwrap().status(), ExecutionStatus::Cancelled);
    assert_eq!(store.held_lock_count(), 0);
}

#[tokio::test]
async fn test_memory_kept_when_release_disabled() {
    let store = Arc::new(InMemoryCluster::new());
    let orchestrator = BranchOrchestrator::new(
        linear_flow(ErrorHandlingConfig::default()),
        store,
        Arc::new(ScriptedExecutor::default()),
        &RuntimeConfig::default(),
        EngineConfig {
            release_memory_on_completion: false,
            ..Default::default()
        },
    )
    .unwrap();

    let context = orchestrator.run(CancellationToken::new()).await.unwrap();

    let main = context.branch(&BranchPath::main()).unwrap();
    let output = main.last_output_address().cloned().unwrap();
    assert_eq!(orchestrator.memory().read_all(&output).await.unwrap(), b"s2".to_vec());

    let owner = MemoryOwner::branch(&orchestrator.flow().id, &BranchPath::main());
    // Branch block plus one output per step
    assert_eq!(orchestrator.memory().addresses_of(&owner).await.unwrap().len(), 4);
    let branch_block: &MemoryAddress = main.memory_address.as_ref().unwrap();
    assert_eq!(orchestrator.memory().read_all(branch_block).await.unwrap().len(), 4_096);
}

#[test]
fn test_unrunnable_flow_rejected() {
    let flow = Flow::new("empty", "Empty").with_branch(FlowBranch::main());
    let result = BranchOrchestrator::new(
        flow,
        Arc::new(InMemoryCluster::new()),
        Arc::new(ScriptedExecutor::default()),
        &RuntimeConfig::default(),
        EngineConfig::default(),
    );

    match result {
        Err(EngineError::InvalidFlow(_)) => {}
        Err(other) => panic!("Expected InvalidFlow, got {:?}", other),
        Ok(_) => panic!("Expected InvalidFlow, got an orchestrator"),
    }
}
