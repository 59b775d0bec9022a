//! Agentic workflow orchestration kernel.
//!
//! Hosts long-lived workflow executions as DAGs of tasks. Each task passes
//! through a policy gate and feasibility check, routes effectful tool calls
//! through a durable outbox, validates tool output through a CRV gate
//! chain, and mutates world-state under compare-and-swap. Tasks that share
//! resources coordinate through a multi-agent coordinator with deadlock
//! and livelock detection.

pub mod collaborators;
pub mod config;
pub mod coordinator;
pub mod crv;
pub mod error;
pub mod event_log;
pub mod livelock;
pub mod mitigator;
pub mod orchestrator;
pub mod outbox;
pub mod snapshot;
pub mod state_store;
pub mod task;
pub mod workflow;

pub use collaborators::{
    CompositeFeasibilityChecker, FeasibilityCheck, FeasibilityChecker, FeasibilityReport,
    PermissiveFeasibilityChecker, PermissivePolicyGuard, PolicyDecision, PolicyGuard, Principal, Tool,
    ToolContext,
};
pub use config::{CoordinatorConfig, KernelConfig, LivelockConfig, OutboxConfig, RollbackConfig, WorkflowConfig};
pub use coordinator::{CoordinationPolicy, Coordinator, DeadlockReport, LockMode, ResourceLock};
pub use crv::{
    ChainResult, Commit, Gate, GateChain, GateOutcome, GateResult, NoopRecoveryExecutor, RecoveryExecutor,
    RecoveryStrategy, Validator, ValidationResult,
};
pub use error::{ErrorCode, KernelError, KernelResult};
pub use event_log::{EventLog, EventRecord, EventType, InMemoryEventLog};
pub use livelock::{LivelockDetector, LivelockPattern, LivelockReport};
pub use mitigator::{MitigationOutcome, MitigationStrategy, Mitigator};
pub use orchestrator::{OrchestratorDeps, WorkflowOrchestrator};
pub use outbox::{FileOutbox, InMemoryOutbox, Outbox, OutboxEntry, OutboxState};
pub use snapshot::{InMemorySnapshotStore, Snapshot, SnapshotStore};
pub use state_store::{InMemoryStateStore, StateEntry, StateSnapshot, StateStore};
pub use task::{
    CompensationHook, RetryPolicy, RiskTier, SharedResourceRequest, TaskSpec, TaskState, TaskStateMap,
    TaskStatus, TaskType,
};
pub use workflow::{WorkflowOutcome, WorkflowResult, WorkflowSpec};
