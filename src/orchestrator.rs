//! Workflow orchestrator: executes a workflow to a terminal state honouring
//! dependencies, retries, timeouts, and compensation (spec §4.1).

use crate::collaborators::{FeasibilityChecker, PermissiveFeasibilityChecker, PermissivePolicyGuard, PolicyGuard, Principal, Tool, ToolContext};
use crate::config::KernelConfig;
use crate::coordinator::Coordinator;
use crate::crv::{Commit, GateChain, NoopRecoveryExecutor, RecoveryExecutor, RecoveryStrategy};
use crate::error::{ErrorCode, KernelError, KernelResult};
use crate::event_log::{EventLog, EventRecord, EventType, InMemoryEventLog};
use crate::outbox::{idempotency_key_for, Executor, InMemoryOutbox, Outbox};
use crate::snapshot::{InMemorySnapshotStore, SnapshotStore};
use crate::state_store::{InMemoryStateStore, StateStore};
use crate::task::{RiskTier, TaskSpec, TaskState, TaskStateMap, TaskStatus};
use crate::workflow::{WorkflowOutcome, WorkflowResult, WorkflowSpec};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Releases every lock it acquired when dropped, regardless of which exit
/// path a task takes (spec §4.1 step 10, "always, on all exit paths").
struct LockGuard {
    coordinator: Arc<Coordinator>,
    agent: String,
    held: Vec<String>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        for resource in &self.held {
            self.coordinator.release_lock(resource, &self.agent);
        }
    }
}

/// Bundles the collaborators the orchestrator depends on, so they can be
/// swapped independently of the orchestrator's own construction.
pub struct OrchestratorDeps {
    pub state_store: Arc<dyn StateStore>,
    pub event_log: Arc<dyn EventLog>,
    pub snapshot_store: Arc<dyn SnapshotStore>,
    pub outbox: Arc<dyn Outbox>,
    pub coordinator: Arc<Coordinator>,
    pub policy_guard: Arc<dyn PolicyGuard>,
    pub feasibility_checker: Arc<dyn FeasibilityChecker>,
    pub tools: HashMap<String, Arc<dyn Tool>>,
    pub crv_chain: Option<Arc<GateChain>>,
    pub recovery_executor: Arc<dyn RecoveryExecutor>,
}

impl OrchestratorDeps {
    /// In-memory defaults, with permissive policy/feasibility collaborators
    /// and no registered tools or CRV chain.
    pub fn in_memory(config: &KernelConfig) -> Self {
        Self {
            state_store: InMemoryStateStore::shared(),
            event_log: Arc::new(InMemoryEventLog::new()),
            snapshot_store: Arc::new(InMemorySnapshotStore::new()),
            outbox: InMemoryOutbox::shared(config.outbox.clone()),
            coordinator: Coordinator::shared(config.coordinator.clone()),
            policy_guard: Arc::new(PermissivePolicyGuard),
            feasibility_checker: Arc::new(PermissiveFeasibilityChecker),
            tools: HashMap::new(),
            crv_chain: None,
            recovery_executor: Arc::new(NoopRecoveryExecutor),
        }
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.insert(tool.id().to_string(), tool);
        self
    }

    pub fn with_crv_chain(mut self, chain: GateChain) -> Self {
        self.crv_chain = Some(Arc::new(chain));
        self
    }

    pub fn with_recovery_executor(mut self, executor: Arc<dyn RecoveryExecutor>) -> Self {
        self.recovery_executor = executor;
        self
    }
}

/// Outcome of a single attempt at running one task.
enum AttemptOutcome {
    Completed(serde_json::Value),
    Failed(KernelError),
}

pub struct WorkflowOrchestrator {
    deps: OrchestratorDeps,
    config: KernelConfig,
}

impl WorkflowOrchestrator {
    pub fn new(deps: OrchestratorDeps, config: KernelConfig) -> Self {
        Self { deps, config }
    }

    /// Execute `workflow` to a terminal state (spec §4.1 "executeWorkflow").
    pub async fn execute_workflow(
        &self,
        workflow: &WorkflowSpec,
        principal: &Principal,
    ) -> KernelResult<WorkflowResult> {
        workflow.validate()?;

        let mut task_states: TaskStateMap = workflow
            .tasks
            .iter()
            .map(|t| (t.id.clone(), TaskState::new(t.id.clone())))
            .collect();

        let mut completed: HashSet<String> = HashSet::new();
        let mut completed_order: Vec<String> = Vec::new();
        let mut failed: Vec<String> = Vec::new();
        let skipped: Vec<String> = Vec::new();
        let mut hard_failure: Option<KernelError> = None;

        loop {
            let eligible: Vec<String> = workflow
                .eligible_tasks(&completed)
                .into_iter()
                .map(|t| t.id.clone())
                .collect();
            if eligible.is_empty() {
                break;
            }

            for task_id in eligible {
                let task = workflow.task(&task_id).expect("eligible task must exist");
                let state = task_states.get_mut(&task_id).expect("state must exist");

                match self.run_task_with_retries(workflow, task, state, principal).await {
                    Ok(output) => {
                        state.status = TaskStatus::Completed;
                        state.output = Some(output);
                        state.ended_at = Some(Utc::now());
                        completed.insert(task_id.clone());
                        completed_order.push(task_id.clone());
                    }
                    Err(e) => {
                        state.status = TaskStatus::Failed;
                        state.last_error = Some(e.to_string());
                        state.ended_at = Some(Utc::now());
                        failed.push(task_id.clone());
                        hard_failure = Some(e);
                        break;
                    }
                }
            }

            if hard_failure.is_some() {
                break;
            }
        }

        if hard_failure.is_some() {
            let compensated = self.run_compensation(workflow, &completed_order).await;
            let outcome = if compensated.len() == completed_order.len() {
                WorkflowOutcome::Compensated
            } else {
                WorkflowOutcome::PartiallyCompensated
            };
            return Ok(WorkflowResult {
                workflow_id: workflow.id.clone(),
                status: outcome,
                completed: completed_order,
                failed,
                compensated,
                skipped,
            });
        }

        Ok(WorkflowResult {
            workflow_id: workflow.id.clone(),
            status: WorkflowOutcome::Completed,
            completed: completed_order,
            failed,
            compensated: Vec::new(),
            skipped,
        })
    }

    /// Retry loop around one task: retriable failures (`TOOL_ERROR`,
    /// `CONFLICT`, timeouts) re-enter at lock acquisition after backoff,
    /// until `maxAttempts` is reached (spec §4.1 "Retry policy").
    async fn run_task_with_retries(
        &self,
        workflow: &WorkflowSpec,
        task: &TaskSpec,
        state: &mut TaskState,
        principal: &Principal,
    ) -> KernelResult<serde_json::Value> {
        state.status = TaskStatus::Running;
        state.started_at = Some(Utc::now());

        let max_attempts = task.retry_policy.max_attempts.max(1);
        let mut last_err = None;

        for attempt in 1..=max_attempts {
            state.attempt = attempt;
            match self.run_task_once(workflow, task, attempt, principal).await {
                AttemptOutcome::Completed(output) => return Ok(output),
                AttemptOutcome::Failed(e) => {
                    let retriable = e.code().is_retriable() && attempt < max_attempts;
                    last_err = Some(e);
                    if !retriable {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(task.retry_policy.backoff_ms)).await;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            KernelError::classified(ErrorCode::ToolError, "task failed with no recorded error", None)
        }))
    }

    /// Steps 1-10 of the per-task protocol for a single attempt.
    async fn run_task_once(
        &self,
        workflow: &WorkflowSpec,
        task: &TaskSpec,
        attempt: u32,
        principal: &Principal,
    ) -> AttemptOutcome {
        // 1. Policy gate.
        let decision = self.deps.policy_guard.evaluate(principal, task, &workflow.id).await;
        if !decision.allowed {
            return AttemptOutcome::Failed(KernelError::classified(
                ErrorCode::PolicyViolation,
                decision.reason,
                Some("request elevated permissions or adjust the task's risk tier".into()),
            ));
        }

        // 2. Feasibility check.
        let feasibility = self.deps.feasibility_checker.check_feasibility(task).await;
        if !feasibility.feasible {
            return AttemptOutcome::Failed(KernelError::classified(
                ErrorCode::OutOfScope,
                format!("task not feasible: {}", feasibility.reasons.join("; ")),
                Some("address the listed feasibility reasons before retrying".into()),
            ));
        }

        // 3. Lock acquisition.
        let agent = format!("{}:{}", workflow.id, task.id);
        let mut guard = LockGuard {
            coordinator: self.deps.coordinator.clone(),
            agent: agent.clone(),
            held: Vec::new(),
        };
        for req in &task.shared_resources {
            match self
                .deps
                .coordinator
                .acquire_lock(&req.resource_id, &agent, &workflow.id, req.mode)
                .await
            {
                Ok(true) => guard.held.push(req.resource_id.clone()),
                Ok(false) | Err(_) => {
                    return AttemptOutcome::Failed(KernelError::classified(
                        ErrorCode::Conflict,
                        format!("could not acquire lock on '{}'", req.resource_id),
                        Some("retry after the contending holder releases the resource".into()),
                    ));
                }
            }
        }

        self.deps
            .event_log
            .append(EventRecord::new(workflow.id.clone(), EventType::TaskStarted).with_task(task.id.clone()))
            .await;

        // 4. Pre-snapshot.
        let world_state = self.deps.state_store.snapshot().await;
        let snapshot = match self
            .deps
            .snapshot_store
            .create_snapshot(&workflow.id, &task.id, attempt, world_state, HashMap::new(), true, HashMap::new())
            .await
        {
            Ok(s) => s,
            Err(e) => return AttemptOutcome::Failed(e),
        };

        // 5-6. Outbox routing + tool invocation.
        let output = match self.invoke_tool(workflow, task, attempt).await {
            Ok(v) => v,
            Err(e) => {
                self.record_task_failed(workflow, task, attempt, &snapshot.id.to_string(), &e).await;
                return AttemptOutcome::Failed(e);
            }
        };

        // 7. CRV gate chain.
        if let Some(chain) = &self.deps.crv_chain {
            let commit = Commit::new(task.id.clone(), output.clone());
            let result = chain.run_with_recovery(&commit, self.deps.recovery_executor.as_ref()).await;

            for gate_result in &result.gate_results {
                if let Some(RecoveryStrategy::Ignore { justification }) = &gate_result.recovered_via {
                    self.deps
                        .event_log
                        .append(
                            EventRecord::new(workflow.id.clone(), EventType::Custom("crv_ignored".into()))
                                .with_task(task.id.clone())
                                .with_metadata("gate", serde_json::json!(gate_result.gate_name))
                                .with_metadata("justification", serde_json::json!(justification)),
                        )
                        .await;
                }
            }

            if result.blocked {
                let last = result.gate_results.last();
                let code = last.and_then(|g| g.failure_code).unwrap_or(ErrorCode::PolicyViolation);
                let reason = last
                    .map(|g| format!("blocked by gate '{}'", g.gate_name))
                    .unwrap_or_else(|| "blocked by CRV gate chain".into());
                let e = KernelError::classified(code, reason, last.and_then(|g| g.remediation.clone()));
                self.record_task_failed(workflow, task, attempt, &snapshot.id.to_string(), &e).await;
                return AttemptOutcome::Failed(e);
            }
        }

        // 8. State update (CAS).
        if let Err(e) = self.apply_state_update(&task.id, output.clone()).await {
            self.record_task_failed(workflow, task, attempt, &snapshot.id.to_string(), &e).await;
            return AttemptOutcome::Failed(e);
        }

        // 9. Record.
        self.deps
            .event_log
            .append(
                EventRecord::new(workflow.id.clone(), EventType::TaskCompleted)
                    .with_task(task.id.clone())
                    .with_metadata("attempt", serde_json::json!(attempt))
                    .with_metadata("snapshot_id", serde_json::json!(snapshot.id.to_string())),
            )
            .await;

        // 10. Lock release happens via `guard`'s Drop.
        drop(guard);
        AttemptOutcome::Completed(output)
    }

    async fn record_task_failed(
        &self,
        workflow: &WorkflowSpec,
        task: &TaskSpec,
        attempt: u32,
        snapshot_id: &str,
        error: &KernelError,
    ) {
        self.deps
            .event_log
            .append(
                EventRecord::new(workflow.id.clone(), EventType::TaskFailed)
                    .with_task(task.id.clone())
                    .with_metadata("attempt", serde_json::json!(attempt))
                    .with_metadata("snapshot_id", serde_json::json!(snapshot_id))
                    .with_metadata("code", serde_json::json!(format!("{:?}", error.code())))
                    .with_metadata("error", serde_json::json!(error.to_string())),
            )
            .await;
    }

    async fn invoke_tool(&self, workflow: &WorkflowSpec, task: &TaskSpec, attempt: u32) -> KernelResult<serde_json::Value> {
        let tool_id = task
            .tool_id
            .as_ref()
            .ok_or_else(|| KernelError::classified(ErrorCode::MissingData, "task has no tool_id", None))?;
        let tool = self
            .deps
            .tools
            .get(tool_id)
            .cloned()
            .ok_or_else(|| KernelError::classified(ErrorCode::ToolError, format!("unknown tool '{tool_id}'"), None))?;

        let timeout = Duration::from_millis(task.timeout_ms.unwrap_or(30_000));
        let context = ToolContext {
            workflow_id: workflow.id.clone(),
            task_id: task.id.clone(),
            step_id: format!("{}-{attempt}", task.id),
            outbox: self.deps.outbox.clone(),
            simulate: false,
        };

        if tool.has_side_effects() {
            let key = task
                .idempotency_key
                .clone()
                .unwrap_or_else(|| idempotency_key_for(&task.id, attempt, tool_id, &task.input));

            let executor: Executor = {
                let tool = tool.clone();
                let context = context.clone();
                Box::new(move |params: serde_json::Value| Box::pin(async move { tool.execute(params, &context).await }))
            };

            let fut = self.deps.outbox.execute(
                &workflow.id,
                &task.id,
                tool_id,
                task.input.clone(),
                &key,
                executor,
                task.retry_policy.max_attempts,
            );
            match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(KernelError::ToolTimeout(tool_id.clone())),
            }
        } else {
            match tokio::time::timeout(timeout, tool.execute(task.input.clone(), &context)).await {
                Ok(result) => result,
                Err(_) => Err(KernelError::ToolTimeout(tool_id.clone())),
            }
        }
    }

    /// Writes the task's output into the world-state store under its own
    /// task id, via compare-and-swap (spec §4.1 step 8).
    async fn apply_state_update(&self, task_id: &str, value: serde_json::Value) -> KernelResult<()> {
        match self.deps.state_store.read(task_id).await {
            Ok(entry) => {
                self.deps.state_store.update(task_id, value, entry.version, None).await?;
            }
            Err(_) => {
                self.deps.state_store.create(task_id, value, HashMap::new()).await?;
            }
        }
        Ok(())
    }

    /// Saga compensation: run compensation for every completed task in the
    /// exact reverse order of completion. A compensation failure is logged
    /// but does not stop subsequent compensations (spec §4.1 "Compensation").
    async fn run_compensation(&self, workflow: &WorkflowSpec, completed_order: &[String]) -> Vec<String> {
        let mut compensated = Vec::new();

        for task_id in completed_order.iter().rev() {
            let task = match workflow.task(task_id) {
                Some(t) => t,
                None => continue,
            };
            let Some(hook) = &task.compensation else { continue };

            self.deps
                .event_log
                .append(EventRecord::new(workflow.id.clone(), EventType::CompensationTriggered).with_task(task_id.clone()))
                .await;

            let tool = self.deps.tools.get(&hook.tool_id).cloned();
            let outcome = match tool {
                Some(tool) => {
                    let context = ToolContext {
                        workflow_id: workflow.id.clone(),
                        task_id: task_id.clone(),
                        step_id: format!("{task_id}-compensation"),
                        outbox: self.deps.outbox.clone(),
                        simulate: false,
                    };
                    tool.execute(hook.params.clone(), &context).await
                }
                None => Err(KernelError::classified(
                    ErrorCode::ToolError,
                    format!("compensation tool '{}' not registered", hook.tool_id),
                    None,
                )),
            };

            match outcome {
                Ok(_) => compensated.push(task_id.clone()),
                Err(e) => {
                    tracing::warn!(task_id, error = %e, "compensation action failed");
                }
            }
        }

        compensated
    }

    /// Restore a verified snapshot. For risk tiers `HIGH`/`CRITICAL` the
    /// policy guard must approve first (spec §4.1 "Rollback").
    pub async fn rollback(
        &self,
        workflow_id: &str,
        snapshot_id: uuid::Uuid,
        risk_tier: RiskTier,
        approved: bool,
    ) -> KernelResult<()> {
        if risk_tier >= self.config.rollback.require_approval_at_risk_tier && !approved {
            return Err(KernelError::classified(
                ErrorCode::PolicyViolation,
                "rollback at this risk tier requires explicit approval",
                Some("obtain operator approval before retrying the rollback".into()),
            ));
        }

        let snapshot = self.deps.snapshot_store.restore_snapshot(snapshot_id).await?;
        self.deps.state_store.reconcile_to(&snapshot.world_state).await?;

        self.deps
            .event_log
            .append(
                EventRecord::new(workflow_id.to_string(), EventType::RollbackInitiated)
                    .with_metadata("snapshot_id", serde_json::json!(snapshot_id.to_string())),
            )
            .await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{CompensationHook, RetryPolicy, TaskType};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct EchoTool {
        side_effects: bool,
    }

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn id(&self) -> &str {
            "echo"
        }
        fn has_side_effects(&self) -> bool {
            self.side_effects
        }
        async fn execute(&self, params: serde_json::Value, _ctx: &ToolContext) -> KernelResult<serde_json::Value> {
            Ok(params)
        }
    }

    struct FlakyTool(Arc<AtomicU32>);

    #[async_trait::async_trait]
    impl Tool for FlakyTool {
        fn id(&self) -> &str {
            "flaky"
        }
        fn has_side_effects(&self) -> bool {
            true
        }
        async fn execute(&self, params: serde_json::Value, _ctx: &ToolContext) -> KernelResult<serde_json::Value> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(KernelError::classified(ErrorCode::ToolError, "transient", None))
            } else {
                Ok(params)
            }
        }
    }

    fn task(id: &str, tool_id: &str) -> TaskSpec {
        TaskSpec {
            id: id.to_string(),
            name: id.to_string(),
            task_type: TaskType::Action,
            tool_id: Some(tool_id.to_string()),
            input: serde_json::json!({"n": 1}),
            retry_policy: RetryPolicy { max_attempts: 3, backoff_ms: 1 },
            timeout_ms: Some(5_000),
            idempotency_key: None,
            compensation: None,
            risk_tier: RiskTier::Low,
            required_permissions: vec![],
            shared_resources: vec![],
        }
    }

    fn principal() -> Principal {
        Principal { id: "p1".into(), permissions: vec![] }
    }

    #[tokio::test]
    async fn executes_independent_tasks_to_completion() {
        let config = KernelConfig::default();
        let deps = OrchestratorDeps::in_memory(&config).with_tool(Arc::new(EchoTool { side_effects: false }));
        let orchestrator = WorkflowOrchestrator::new(deps, config);

        let workflow = WorkflowSpec::new("wf1", vec![task("a", "echo"), task("b", "echo")]);
        let result = orchestrator.execute_workflow(&workflow, &principal()).await.unwrap();

        assert_eq!(result.status, WorkflowOutcome::Completed);
        assert_eq!(result.completed.len(), 2);
    }

    #[tokio::test]
    async fn ignore_recovery_lets_a_blocking_gate_complete_the_task() {
        use crate::crv::{Gate, GateChain, RecoveryStrategy, ValidationResult, Validator};

        struct AlwaysFails;
        #[async_trait::async_trait]
        impl Validator for AlwaysFails {
            fn name(&self) -> &str {
                "always_fails"
            }
            async fn validate(&self, _commit: &Commit) -> ValidationResult {
                ValidationResult::fail("never valid", ErrorCode::PolicyViolation, "n/a")
            }
        }

        let chain = GateChain::new().with_gate(
            Gate::new("gate")
                .with_validator(Box::new(AlwaysFails))
                .blocking(true)
                .with_recovery(RecoveryStrategy::Ignore { justification: "approved".into() }),
        );

        let config = KernelConfig::default();
        let deps = OrchestratorDeps::in_memory(&config)
            .with_tool(Arc::new(EchoTool { side_effects: false }))
            .with_crv_chain(chain);
        let orchestrator = WorkflowOrchestrator::new(deps, config);

        let workflow = WorkflowSpec::new("wf1", vec![task("a", "echo")]);
        let result = orchestrator.execute_workflow(&workflow, &principal()).await.unwrap();

        assert_eq!(result.status, WorkflowOutcome::Completed);
        assert_eq!(result.completed, vec!["a".to_string()]);

        let events = orchestrator.deps.event_log.read("wf1").await;
        assert!(events.iter().any(|e| e.event_type == EventType::Custom("crv_ignored".into())));
    }

    #[tokio::test]
    async fn retries_a_transient_failure_then_succeeds() {
        let config = KernelConfig::default();
        let calls = Arc::new(AtomicU32::new(0));
        let deps = OrchestratorDeps::in_memory(&config).with_tool(Arc::new(FlakyTool(calls)));
        let orchestrator = WorkflowOrchestrator::new(deps, config);

        let workflow = WorkflowSpec::new("wf1", vec![task("a", "flaky")]);
        let result = orchestrator.execute_workflow(&workflow, &principal()).await.unwrap();

        assert_eq!(result.status, WorkflowOutcome::Completed);
        assert_eq!(result.completed, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn compensates_completed_tasks_in_reverse_order_on_failure() {
        let config = KernelConfig::default();
        let deps = OrchestratorDeps::in_memory(&config).with_tool(Arc::new(EchoTool { side_effects: false }));
        let orchestrator = WorkflowOrchestrator::new(deps, config);

        let mut a = task("a", "echo");
        a.compensation = Some(CompensationHook { tool_id: "echo".into(), params: serde_json::json!({}) });
        let mut b = task("b", "missing-tool");
        b.retry_policy.max_attempts = 1;

        let workflow = WorkflowSpec::new("wf1", vec![a, b]).with_dependency("b", "a");
        let result = orchestrator.execute_workflow(&workflow, &principal()).await.unwrap();

        assert!(matches!(result.status, WorkflowOutcome::Compensated | WorkflowOutcome::PartiallyCompensated));
        assert_eq!(result.completed, vec!["a".to_string()]);
        assert_eq!(result.compensated, vec!["a".to_string()]);
    }
}
