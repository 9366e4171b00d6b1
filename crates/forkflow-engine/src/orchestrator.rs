//! The branch orchestrator.
//!
//! Every branch instance runs as its own tokio task and executes its steps in
//! order. The execution tree of a run lives behind one async mutex; a
//! `Notify` wakes join points and the run loop whenever a branch reaches a
//! terminal status. Each branch has a cancellation token that is a child of
//! its parent branch's token, so cancelling the run or a merge loser also
//! cancels everything forked from it.

use chrono::Utc;
use forkflow_core::domain::events::{BranchForked, BranchMerged};
use forkflow_core::{
    resolve_merge, BranchExecutionContext, BranchPath, CoreError, ErrorContext, ExecutionContext, ExecutionId,
    ExecutionStatus, Flow, FlowBranch, FlowStep, JmesPathMergePredicate, MemoryAddress, MergeDecision,
    MergePredicate, RecoveryConfig, RuntimeConfig, StepExecutionContext, StepId, StepLogLevel,
};
use forkflow_memory::{
    BranchIsolationProvider, CacheLifecycleManager, DistributedMemoryManager, DistributedStore, LockMode,
    MemoryError, MemoryOwner,
};
use forkflow_monitoring::{EngineMetrics, LogExt};
use forkflow_recovery::{CompensationHandler, LoggingCompensationHandler, RecoveryDirective, RecoveryFramework};
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::EngineConfig;
use crate::executor::{StepExecutor, StepFailure, StepInvocation, StepOutput};
use crate::join::{check_topology, decision_label, strategy_label, JoinPoint, OUTPUT_PARAMETER};
use crate::EngineError;

/// Runs flows: forks, merges, per-step error policies and memory hand-off
pub struct BranchOrchestrator {
    flow: Arc<Flow>,
    executor: Arc<dyn StepExecutor>,
    memory: DistributedMemoryManager,
    isolation: BranchIsolationProvider,
    recovery: Arc<RecoveryFramework>,
    recovery_config: RecoveryConfig,
    predicate: Arc<dyn MergePredicate>,
    config: EngineConfig,
}

impl BranchOrchestrator {
    /// Create an orchestrator for a flow.
    ///
    /// Fails when the flow does not pass the publishing checks or has a merge
    /// topology that cannot be run.
    pub fn new(
        flow: Flow,
        store: Arc<dyn DistributedStore>,
        executor: Arc<dyn StepExecutor>,
        runtime: &RuntimeConfig,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        check_topology(&flow)?;
        runtime.validate()?;

        let caches = CacheLifecycleManager::new(store.clone(), runtime.cache.clone());
        let recovery = RecoveryFramework::with_default_strategies(
            &runtime.recovery,
            &flow.error_handling,
            Arc::new(LoggingCompensationHandler),
        );

        info!(flow_id = %flow.id, branches = flow.branches.len(), steps = flow.steps.len(), "Creating branch orchestrator");
        Ok(Self {
            flow: Arc::new(flow),
            executor,
            memory: DistributedMemoryManager::new(store.clone(), caches),
            isolation: BranchIsolationProvider::new(store),
            recovery: Arc::new(recovery),
            recovery_config: runtime.recovery.clone(),
            predicate: Arc::new(JmesPathMergePredicate),
            config,
        })
    }

    /// Run compensating actions through `handler`
    pub fn with_compensation_handler(mut self, handler: Arc<dyn CompensationHandler>) -> Self {
        self.recovery = Arc::new(RecoveryFramework::with_default_strategies(
            &self.recovery_config,
            &self.flow.error_handling,
            handler,
        ));
        self
    }

    /// Evaluate Conditional merges with `predicate` instead of JMESPath
    pub fn with_merge_predicate(mut self, predicate: Arc<dyn MergePredicate>) -> Self {
        self.predicate = predicate;
        self
    }

    /// The flow being run
    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    /// Memory manager shared with step executors
    pub fn memory(&self) -> &DistributedMemoryManager {
        &self.memory
    }

    /// Isolation provider
    pub fn isolation(&self) -> &BranchIsolationProvider {
        &self.isolation
    }

    /// Recovery framework
    pub fn recovery(&self) -> &Arc<RecoveryFramework> {
        &self.recovery
    }

    /// Run the flow once to a terminal status.
    ///
    /// The returned context is terminal and carries the lifecycle events of
    /// the run. Step and branch failures are reported through its status;
    /// `Err` means the run could not be set up.
    pub async fn run(&self, token: CancellationToken) -> Result<ExecutionContext, EngineError> {
        let context = ExecutionContext::for_flow(&self.flow);
        let span = info_span!("flow_execution", execution_id = %context.execution_id, flow_id = %self.flow.id);
        self.run_context(context, token).instrument(span).await
    }

    async fn run_context(
        &self,
        context: ExecutionContext,
        token: CancellationToken,
    ) -> Result<ExecutionContext, EngineError> {
        let started = std::time::Instant::now();
        let state = Arc::new(RunState {
            execution_id: context.execution_id.clone(),
            flow: self.flow.clone(),
            executor: self.executor.clone(),
            memory: self.memory.clone(),
            isolation: self.isolation.clone(),
            recovery: self.recovery.clone(),
            predicate: self.predicate.clone(),
            config: self.config.clone(),
            tokens: branch_tokens(&self.flow, &token),
            context: Mutex::new(context),
            changed: Notify::new(),
        });

        let roots: Vec<FlowBranch> = self.flow.root_branches().into_iter().cloned().collect();
        {
            let mut context = state.context.lock().await;
            context.update_status(ExecutionStatus::Scheduled, None)?;
            context.update_status(ExecutionStatus::Running, None)?;
            for branch in &roots {
                let mut instance =
                    BranchExecutionContext::new(state.execution_id.clone(), branch.path.clone(), branch.priority);
                instance.update_status(ExecutionStatus::Scheduled, None)?;
                context.add_branch_execution_context(instance)?;
            }
        }

        info!(roots = roots.len(), "Starting flow execution");
        for branch in roots {
            spawn_branch(state.clone(), branch, None);
        }

        state.wait_until_all_terminal().await;
        state.finish(&token, started).await
    }
}

/// Cancellation tokens for every branch, each a child of its parent's token
fn branch_tokens(flow: &Flow, run: &CancellationToken) -> HashMap<BranchPath, CancellationToken> {
    let mut tokens = HashMap::new();
    let mut pending: Vec<&FlowBranch> = flow.root_branches();
    for root in &pending {
        tokens.insert(root.path.clone(), run.child_token());
    }

    while let Some(parent) = pending.pop() {
        let parent_token = match tokens.get(&parent.path) {
            Some(token) => token.clone(),
            None => continue,
        };
        for child in flow
            .branches
            .iter()
            .filter(|b| b.parent_branch.as_ref() == Some(&parent.path))
        {
            tokens.insert(child.path.clone(), parent_token.child_token());
            pending.push(child);
        }
    }
    tokens
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn spawn_branch(state: Arc<RunState>, branch: FlowBranch, input: Option<MemoryAddress>) {
    let span = info_span!("branch", branch = %branch.path);
    tokio::spawn(
        async move {
            let outcome = match AssertUnwindSafe(state.clone().run_branch(branch.clone(), input))
                .catch_unwind()
                .await
            {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => BranchOutcome::Failed(e.to_string()),
                Err(panic) => BranchOutcome::Failed(format!("Branch task panicked: {}", panic_message(&*panic))),
            };
            state.finish_branch(&branch, outcome).await;
        }
        .instrument(span),
    );
}

#[derive(Debug, Clone, PartialEq)]
enum BranchOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

#[derive(Debug)]
enum StepOutcome {
    Completed {
        output_address: Option<MemoryAddress>,
        forks: Vec<FlowBranch>,
    },
    Skipped,
    Failed(String),
    Cancelled,
}

#[derive(Debug)]
enum Attempt {
    Succeeded(StepOutput),
    Failed(StepFailure),
    Cancelled,
}

#[derive(Debug)]
enum JoinOutcome {
    Proceed(Vec<MemoryAddress>),
    NoMatch(String),
    Cancelled,
}

/// Per-branch data shared by its steps
struct BranchRun {
    branch: FlowBranch,
    token: CancellationToken,
    owner: MemoryOwner,
    memory: MemoryAddress,
}

/// State of one run
struct RunState {
    execution_id: ExecutionId,
    flow: Arc<Flow>,
    executor: Arc<dyn StepExecutor>,
    memory: DistributedMemoryManager,
    isolation: BranchIsolationProvider,
    recovery: Arc<RecoveryFramework>,
    predicate: Arc<dyn MergePredicate>,
    config: EngineConfig,
    tokens: HashMap<BranchPath, CancellationToken>,
    context: Mutex<ExecutionContext>,
    changed: Notify,
}

impl RunState {
    async fn wait_until_all_terminal(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let context = self.context.lock().await;
                let done = self.flow.branches.iter().all(|branch| {
                    context
                        .branch(&branch.path)
                        .map_or(false, |instance| instance.status().is_terminal())
                });
                if done {
                    return;
                }
            }

            notified.await;
        }
    }

    /// Settle the execution status once every branch is terminal
    async fn finish(
        &self,
        token: &CancellationToken,
        started: std::time::Instant,
    ) -> Result<ExecutionContext, EngineError> {
        let mut context = self.context.lock().await;

        let failures: Vec<String> = context
            .failed_branches()
            .iter()
            .map(|b| match &b.lifecycle.error_message {
                Some(message) => format!("{}: {}", b.branch_path, message),
                None => b.branch_path.to_string(),
            })
            .collect();

        let (status, error) = if !failures.is_empty() {
            (
                ExecutionStatus::Failed,
                Some(format!("Branches failed: {}", failures.join("; "))),
            )
        } else if token.is_cancelled() {
            (ExecutionStatus::Cancelled, None)
        } else {
            (ExecutionStatus::Completed, None)
        };
        context.update_status(status, error)?;

        let events = context.take_events();
        let mut result = context.clone();
        drop(context);
        for event in events {
            result.record_event(event);
        }

        self.recovery.forget_execution(&self.execution_id);
        if self.config.release_memory_on_completion {
            for branch in &self.flow.branches {
                let owner = MemoryOwner::branch(&self.flow.id, &branch.path);
                let _ = self
                    .memory
                    .free_all_for_owner(&owner)
                    .await
                    .log_warn("Failed to free branch memory");
            }
        }

        let elapsed = started.elapsed();
        EngineMetrics::record_execution(&status.to_string(), elapsed);
        info!(status = %status, ?elapsed, "Flow execution finished");
        Ok(result)
    }

    async fn run_branch(
        self: Arc<Self>,
        branch: FlowBranch,
        input: Option<MemoryAddress>,
    ) -> Result<BranchOutcome, EngineError> {
        let token = self
            .tokens
            .get(&branch.path)
            .cloned()
            .ok_or_else(|| EngineError::Internal(format!("No cancellation token for branch {}", branch.path)))?;

        self.isolation
            .create_isolation_context(&self.flow.id, &branch.path, self.config.isolation_level)
            .await?;
        let owner = MemoryOwner::branch(&self.flow.id, &branch.path);
        let memory = self.memory.allocate(&owner, self.config.branch_memory_size).await?;

        {
            let mut context = self.context.lock().await;
            let instance = context.branch_mut(&branch.path)?;
            instance.set_memory_address(memory.clone());
            instance.update_status(ExecutionStatus::Running, None)?;
        }
        debug!(memory = %memory, "Branch started");

        let run = BranchRun {
            branch,
            token,
            owner,
            memory,
        };

        let mut input_address = input;
        let steps: Vec<FlowStep> = self.flow.branch_steps(&run.branch.path).into_iter().cloned().collect();
        for step in steps {
            if run.token.is_cancelled() {
                return Ok(BranchOutcome::Cancelled);
            }

            let span = info_span!("step", step_id = %step.id, position = step.position);
            match self.run_step(&run, &step, input_address.clone()).instrument(span).await? {
                StepOutcome::Completed { output_address, forks } => {
                    for fork in forks {
                        spawn_branch(self.clone(), fork, output_address.clone());
                    }
                    if output_address.is_some() {
                        input_address = output_address;
                    }
                }
                StepOutcome::Skipped => {}
                StepOutcome::Failed(message) => return Ok(BranchOutcome::Failed(message)),
                StepOutcome::Cancelled => return Ok(BranchOutcome::Cancelled),
            }
        }

        Ok(BranchOutcome::Completed)
    }

    /// Run a step until it completes, is skipped, fails for good or is cancelled
    async fn run_step(
        &self,
        run: &BranchRun,
        step: &FlowStep,
        input_address: Option<MemoryAddress>,
    ) -> Result<StepOutcome, EngineError> {
        let policy = self.flow.error_handling.strategy_for(&step.id);
        let join = JoinPoint::at(&self.flow, &run.branch.path, step.position);
        let mut merged_inputs: Option<Vec<MemoryAddress>> = None;
        let mut attempt = 1;

        loop {
            let outcome = self
                .attempt(run, step, attempt, &input_address, join.as_ref(), &mut merged_inputs)
                .await?;

            let failure = match outcome {
                Attempt::Succeeded(output) => return self.complete_step(run, step, output).await,
                Attempt::Cancelled => {
                    self.set_step_status(run, &step.id, ExecutionStatus::Cancelled, None).await?;
                    return Ok(StepOutcome::Cancelled);
                }
                Attempt::Failed(failure) => failure,
            };

            warn!(attempt, code = %failure.code, error = %failure.message, "Step failed");
            self.set_step_status(run, &step.id, ExecutionStatus::Failed, Some(failure.to_string()))
                .await?;

            let error = ErrorContext::new(
                self.execution_id.clone(),
                failure.code.clone(),
                step.component.clone(),
                failure.error_type.clone(),
                failure.message.clone(),
            )
            .at_step(run.branch.path.clone(), step.id.clone())
            .with_attempt(attempt)
            .with_policy(policy)
            .transient(failure.transient);

            let snapshot = self.context.lock().await.clone();
            let result = self.recovery.recover(&error, &snapshot).await;

            match result.directive {
                RecoveryDirective::RetryAfter(delay) => {
                    debug!(attempt, ?delay, "Retrying step");
                    tokio::select! {
                        _ = run.token.cancelled() => return Ok(StepOutcome::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                RecoveryDirective::Continue | RecoveryDirective::CompensateAndContinue => {
                    info!(strategy = ?result.recovery_strategy, "Skipping failed step");
                    self.cancel_forks_of(&run.branch.path, &step.id).await;
                    return Ok(StepOutcome::Skipped);
                }
                RecoveryDirective::Abort => {
                    return Ok(StepOutcome::Failed(format!(
                        "Step {} failed: {}; {}",
                        step.id, failure, result.message
                    )));
                }
            }
        }
    }

    /// One invocation of a step, preceded by its join point on first reach
    async fn attempt(
        &self,
        run: &BranchRun,
        step: &FlowStep,
        attempt: u32,
        input_address: &Option<MemoryAddress>,
        join: Option<&JoinPoint>,
        merged_inputs: &mut Option<Vec<MemoryAddress>>,
    ) -> Result<Attempt, EngineError> {
        {
            let mut context = self.context.lock().await;
            let mut step_context = StepExecutionContext::new(
                self.execution_id.clone(),
                run.branch.path.clone(),
                step.id.clone(),
                attempt - 1,
            );
            step_context.set_input_address(input_address.clone());
            context.branch_mut(&run.branch.path)?.add_step_execution_context(step_context)?;
        }

        let merged = match (join, merged_inputs.clone()) {
            (None, _) => Vec::new(),
            (Some(_), Some(adopted)) => adopted,
            (Some(join), None) => match self.wait_for_merge(run, join).await? {
                JoinOutcome::Proceed(adopted) => {
                    *merged_inputs = Some(adopted.clone());
                    adopted
                }
                JoinOutcome::NoMatch(reason) => {
                    return Ok(Attempt::Failed(StepFailure::permanent("MERGE_NO_MATCH", "Merge", reason)));
                }
                JoinOutcome::Cancelled => return Ok(Attempt::Cancelled),
            },
        };

        self.set_step_status(run, &step.id, ExecutionStatus::Running, None).await?;

        let timeout = self.config.lock_timeout();
        match self
            .isolation
            .acquire_lock(&self.flow.id, &run.branch.path, &run.memory, LockMode::Exclusive, timeout)
            .await
        {
            Ok(()) => {}
            Err(MemoryError::LockTimeout { address, timeout_ms }) => {
                return Ok(Attempt::Failed(StepFailure::transient(
                    "LOCK_TIMEOUT",
                    "Timeout",
                    format!("Lock on {} not obtained within {}ms", address, timeout_ms),
                )));
            }
            Err(e) => return Err(e.into()),
        }

        let invocation = StepInvocation {
            execution_id: self.execution_id.clone(),
            flow_id: self.flow.id.clone(),
            branch_path: run.branch.path.clone(),
            step: step.clone(),
            attempt,
            owner: run.owner.clone(),
            branch_memory: run.memory.clone(),
            input_address: input_address.clone(),
            merged_inputs: merged,
        };

        let outcome = tokio::select! {
            biased;
            _ = run.token.cancelled() => Attempt::Cancelled,
            result = AssertUnwindSafe(self.executor.execute(&invocation, &self.memory)).catch_unwind() => match result {
                Ok(Ok(output)) => Attempt::Succeeded(output),
                Ok(Err(failure)) => Attempt::Failed(failure),
                Err(panic) => Attempt::Failed(StepFailure::permanent("STEP_PANIC", "Panic", panic_message(&*panic))),
            },
        };

        let _ = self
            .isolation
            .release_lock(&self.flow.id, &run.branch.path, &run.memory)
            .await
            .log_warn("Failed to release branch memory lock");

        Ok(outcome)
    }

    /// Park the branch at a join point until the merge is decided
    async fn wait_for_merge(&self, run: &BranchRun, join: &JoinPoint) -> Result<JoinOutcome, EngineError> {
        self.context
            .lock()
            .await
            .branch_mut(&run.branch.path)?
            .update_status(ExecutionStatus::Waiting, None)?;
        info!(
            strategy = strategy_label(join.strategy),
            contributors = join.contributors.len(),
            "Waiting at join point"
        );

        let deadline = self
            .flow
            .merge_strategy
            .merge_timeout_ms
            .map(|ms| (ms, tokio::time::Instant::now() + Duration::from_millis(ms)));

        let outcome = loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let decision = {
                let context = self.context.lock().await;
                resolve_merge(
                    join.strategy,
                    join.strategy_config.as_deref(),
                    &join.candidates(&context),
                    Some(self.predicate.as_ref()),
                )
            };

            let decision = match decision {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(error = %e, "Merge resolution failed");
                    break JoinOutcome::NoMatch(e.to_string());
                }
            };
            debug!(decision = decision_label(&decision), "Evaluated join point");

            match decision {
                MergeDecision::Pending => {}
                MergeDecision::Proceed { adopted, cancel } => {
                    break self.adopt(join, adopted, cancel).await;
                }
                MergeDecision::NoMatch { reason } => {
                    EngineMetrics::record_merge(strategy_label(join.strategy), "no_match");
                    warn!(reason = %reason, "Join point cannot be satisfied");
                    break JoinOutcome::NoMatch(reason);
                }
            }

            let expired = async {
                match deadline {
                    Some((_, at)) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = run.token.cancelled() => break JoinOutcome::Cancelled,
                _ = &mut notified => {}
                _ = expired => {
                    let waited_ms = deadline.map(|(ms, _)| ms).unwrap_or_default();
                    EngineMetrics::record_merge(strategy_label(join.strategy), "timeout");
                    warn!(waited_ms, "Join point timed out");
                    break JoinOutcome::NoMatch(format!("Join point timed out after {}ms", waited_ms));
                }
            }
        };

        if let JoinOutcome::Proceed(_) = outcome {
            self.context
                .lock()
                .await
                .branch_mut(&run.branch.path)?
                .update_status(ExecutionStatus::Running, None)?;
        }
        Ok(outcome)
    }

    /// Cancel the merge losers and collect the adopted outputs
    async fn adopt(&self, join: &JoinPoint, adopted: Vec<BranchPath>, cancel: Vec<BranchPath>) -> JoinOutcome {
        for path in &cancel {
            if let Some(token) = self.tokens.get(path) {
                token.cancel();
            }
        }

        let addresses = {
            let mut context = self.context.lock().await;
            let addresses: Vec<MemoryAddress> = adopted
                .iter()
                .filter_map(|path| context.branch(path))
                .filter_map(|instance| {
                    instance
                        .last_output_address()
                        .or(instance.memory_address.as_ref())
                        .cloned()
                })
                .collect();
            context.record_event(Box::new(BranchMerged {
                execution_id: self.execution_id.clone(),
                target_branch: join.target_branch.clone(),
                target_step_position: join.target_step_position,
                adopted: adopted.clone(),
                cancelled: cancel.clone(),
                timestamp: Utc::now(),
            }));
            addresses
        };

        EngineMetrics::record_merge(strategy_label(join.strategy), "proceed");
        info!(adopted = ?adopted, cancelled = ?cancel, "Join point resolved");
        JoinOutcome::Proceed(addresses)
    }

    /// Record a successful invocation and schedule the branches it forks
    async fn complete_step(
        &self,
        run: &BranchRun,
        step: &FlowStep,
        output: StepOutput,
    ) -> Result<StepOutcome, EngineError> {
        let forks: Vec<FlowBranch> = self
            .flow
            .forks_of(&run.branch.path, &step.id)
            .into_iter()
            .cloned()
            .collect();

        {
            let mut context = self.context.lock().await;
            {
                let instance = context.branch_mut(&run.branch.path)?;
                if let Some(data) = &output.data {
                    instance.add_parameter(OUTPUT_PARAMETER, data.clone())?;
                }
                let step_context = instance
                    .step_mut(&step.id)
                    .ok_or_else(|| CoreError::StepNotFound(step.id.to_string()))?;
                if let Some(address) = &output.output_address {
                    step_context.set_output_address(address.clone())?;
                }
                step_context.log(StepLogLevel::Info, "Step completed");
                step_context.update_status(ExecutionStatus::Completed, None)?;
            }

            for fork in &forks {
                let mut instance =
                    BranchExecutionContext::new(self.execution_id.clone(), fork.path.clone(), fork.priority)
                        .forked_from(run.branch.path.clone(), step.id.clone());
                instance.update_status(ExecutionStatus::Scheduled, None)?;
                context.add_branch_execution_context(instance)?;
                context.record_event(Box::new(BranchForked {
                    execution_id: self.execution_id.clone(),
                    branch_path: fork.path.clone(),
                    parent_branch: run.branch.path.clone(),
                    parent_step: step.id.clone(),
                    timestamp: Utc::now(),
                }));
            }
        }
        EngineMetrics::record_step_finished("Completed");

        for action in self.flow.error_handling.actions_for_step(&run.branch.path, &step.id) {
            self.recovery.compensations().register(&self.execution_id, action);
        }

        if !forks.is_empty() {
            info!(forks = ?forks.iter().map(|f| f.path.0.as_str()).collect::<Vec<_>>(), "Forking branches");
        }
        Ok(StepOutcome::Completed {
            output_address: output.output_address,
            forks,
        })
    }

    async fn set_step_status(
        &self,
        run: &BranchRun,
        step_id: &StepId,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        let mut context = self.context.lock().await;
        let step_context = context
            .branch_mut(&run.branch.path)?
            .step_mut(step_id)
            .ok_or_else(|| CoreError::StepNotFound(step_id.to_string()))?;
        if let Some(message) = &error {
            step_context.log(StepLogLevel::Error, message.clone());
        }
        step_context.update_status(status, error)?;
        drop(context);

        if status.is_terminal() {
            EngineMetrics::record_step_finished(&status.to_string());
        }
        Ok(())
    }

    /// Forks of a skipped step never start
    async fn cancel_forks_of(&self, branch: &BranchPath, step_id: &StepId) {
        let mut context = self.context.lock().await;
        self.cancel_unforked(&mut context, branch, Some(step_id));
        drop(context);
        self.changed.notify_waiters();
    }

    /// Give every branch below `parent` that was never forked a Cancelled
    /// context, so join points and the run loop stop waiting for it
    fn cancel_unforked(&self, context: &mut ExecutionContext, parent: &BranchPath, step_id: Option<&StepId>) {
        let mut pending: Vec<&FlowBranch> = self
            .flow
            .branches
            .iter()
            .filter(|b| b.parent_branch.as_ref() == Some(parent))
            .filter(|b| step_id.map_or(true, |id| b.parent_step.as_ref() == Some(id)))
            .collect();

        while let Some(branch) = pending.pop() {
            if context.branch(&branch.path).is_some() {
                continue;
            }
            let (parent_branch, parent_step) = match (&branch.parent_branch, &branch.parent_step) {
                (Some(parent_branch), Some(parent_step)) => (parent_branch.clone(), parent_step.clone()),
                _ => continue,
            };

            let mut instance = BranchExecutionContext::new(self.execution_id.clone(), branch.path.clone(), branch.priority)
                .forked_from(parent_branch, parent_step);
            let recorded = instance
                .update_status(ExecutionStatus::Cancelled, None)
                .and_then(|_| context.add_branch_execution_context(instance));
            match recorded {
                Ok(()) => debug!(branch = %branch.path, "Cancelled branch that was never forked"),
                Err(e) => warn!(branch = %branch.path, error = %e, "Failed to record unforked branch"),
            }

            pending.extend(
                self.flow
                    .branches
                    .iter()
                    .filter(|b| b.parent_branch.as_ref() == Some(&branch.path)),
            );
        }
    }

    /// Tear down the branch and move it to its terminal status
    async fn finish_branch(&self, branch: &FlowBranch, outcome: BranchOutcome) {
        match self
            .isolation
            .destroy_isolation_context(&self.flow.id, &branch.path)
            .await
        {
            Ok(()) | Err(MemoryError::IsolationContextNotFound(_)) => {}
            Err(e) => warn!(error = %e, "Failed to destroy isolation context"),
        }

        let (status, error) = match outcome {
            BranchOutcome::Completed => (ExecutionStatus::Completed, None),
            BranchOutcome::Failed(message) => (ExecutionStatus::Failed, Some(message)),
            BranchOutcome::Cancelled => (ExecutionStatus::Cancelled, None),
        };

        let mut context = self.context.lock().await;
        let final_status = match context.branch_mut(&branch.path) {
            Ok(instance) => {
                if !instance.status().is_terminal() {
                    if let Err(e) = instance.update_status(status, error) {
                        warn!(error = %e, "Branch status change rejected, failing branch");
                        let _ = instance
                            .update_status(ExecutionStatus::Failed, Some(e.to_string()))
                            .log_err("Failed to fail branch");
                    }
                }
                instance.status()
            }
            Err(e) => {
                warn!(error = %e, "Finished branch has no execution context");
                status
            }
        };
        self.cancel_unforked(&mut context, &branch.path, None);
        drop(context);

        EngineMetrics::record_branch_finished(&final_status.to_string());
        info!(status = %final_status, "Branch finished");
        self.changed.notify_waiters();
    }
}
