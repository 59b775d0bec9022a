//! Task specification and per-execution task state (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Severity classification, ordered `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

/// What a task does once its predecessors have completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskType {
    Action,
    Decision,
    Compensation,
}

/// Retry policy attached to a task (spec §3, §4.1 "Retry policy").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 500,
        }
    }
}

/// Reference to the action that semantically undoes a completed task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationHook {
    pub tool_id: String,
    pub params: serde_json::Value,
}

/// Immutable description of a task within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub name: String,
    pub task_type: TaskType,
    pub tool_id: Option<String>,
    pub input: serde_json::Value,
    pub retry_policy: RetryPolicy,
    pub timeout_ms: Option<u64>,
    pub idempotency_key: Option<String>,
    pub compensation: Option<CompensationHook>,
    pub risk_tier: RiskTier,
    pub required_permissions: Vec<String>,
    /// Resources this task must hold (via the coordinator) while it runs.
    pub shared_resources: Vec<SharedResourceRequest>,
}

/// A resource this task needs exclusive or shared access to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedResourceRequest {
    pub resource_id: String,
    pub mode: crate::coordinator::LockMode,
}

/// Terminal/non-terminal lifecycle of a task within one workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Compensated
                | TaskStatus::Skipped
        )
    }
}

/// Mutable per-execution state for a task, owned exclusively by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub task_id: String,
    pub status: TaskStatus,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub output: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TaskState {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::Pending,
            attempt: 0,
            last_error: None,
            output: None,
            started_at: None,
            ended_at: None,
        }
    }
}

/// Per-workflow map of task id -> state, kept by the orchestrator.
pub type TaskStateMap = HashMap<String, TaskState>;

/// Identifier helper: a fresh random id scoped to a workflow run.
pub fn new_attempt_id() -> Uuid {
    Uuid::new_v4()
}
