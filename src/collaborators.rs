//! External collaborator interfaces: policy guard, feasibility checker,
//! tool contract, and tool context. Internals of the real perception
//! pipeline, sandbox, and policy/role guard are out of scope (spec §1,
//! §6 "External interfaces"); this module specifies the adapters the
//! orchestrator consumes plus permissive default implementations.

use crate::error::KernelResult;
use crate::outbox::Outbox;
use crate::task::{RiskTier, TaskSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The acting identity a workflow executes under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: String,
    pub requires_human_approval: bool,
}

/// `evaluate(principal, action, toolId?, workflowId?, taskId?) -> decision`
/// (spec §6 "Policy guard contract").
#[async_trait]
pub trait PolicyGuard: Send + Sync {
    async fn evaluate(
        &self,
        principal: &Principal,
        task: &TaskSpec,
        workflow_id: &str,
    ) -> PolicyDecision;
}

/// Grants everything except actions whose risk tier exceeds what the
/// principal is declared to hold permissions for; a reasonable default for
/// environments with no real policy service wired in.
pub struct PermissivePolicyGuard;

#[async_trait]
impl PolicyGuard for PermissivePolicyGuard {
    async fn evaluate(&self, principal: &Principal, task: &TaskSpec, _workflow_id: &str) -> PolicyDecision {
        let missing: Vec<&String> = task
            .required_permissions
            .iter()
            .filter(|p| !principal.permissions.iter().any(|owned| owned == *p))
            .collect();

        if !missing.is_empty() {
            return PolicyDecision {
                allowed: false,
                reason: format!("principal lacks permissions: {:?}", missing),
                requires_human_approval: false,
            };
        }

        PolicyDecision {
            allowed: true,
            reason: "no policy violation".to_string(),
            requires_human_approval: task.risk_tier >= RiskTier::High,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeasibilityReport {
    pub feasible: bool,
    pub reasons: Vec<String>,
    pub confidence_score: f64,
}

/// `checkFeasibility(task) -> report` (spec §6 "Feasibility checker contract").
#[async_trait]
pub trait FeasibilityChecker: Send + Sync {
    async fn check_feasibility(&self, task: &TaskSpec) -> FeasibilityReport;
}

/// A single named feasibility check contributing a pass/fail plus an
/// optional confidence score.
#[async_trait]
pub trait FeasibilityCheck: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, task: &TaskSpec) -> (bool, Option<f64>, Option<String>);
}

/// Aggregates multiple checks; overall confidence is the mean of all
/// individual scores that reported one, defaulting to 1.0 if none did
/// (resolved Open Question, SPEC_FULL.md §3).
pub struct CompositeFeasibilityChecker {
    checks: Vec<Box<dyn FeasibilityCheck>>,
}

impl CompositeFeasibilityChecker {
    pub fn new(checks: Vec<Box<dyn FeasibilityCheck>>) -> Self {
        Self { checks }
    }
}

#[async_trait]
impl FeasibilityChecker for CompositeFeasibilityChecker {
    async fn check_feasibility(&self, task: &TaskSpec) -> FeasibilityReport {
        let mut reasons = Vec::new();
        let mut scores = Vec::new();
        let mut feasible = true;

        for check in &self.checks {
            let (passed, score, reason) = check.run(task).await;
            if !passed {
                feasible = false;
            }
            if let Some(r) = reason {
                reasons.push(format!("{}: {}", check.name(), r));
            }
            if let Some(s) = score {
                scores.push(s);
            }
        }

        let confidence_score = if scores.is_empty() {
            1.0
        } else {
            scores.iter().sum::<f64>() / scores.len() as f64
        };

        FeasibilityReport { feasible, reasons, confidence_score }
    }
}

/// Always-feasible checker for tests and configurations with no wired
/// constraint engine.
pub struct PermissiveFeasibilityChecker;

#[async_trait]
impl FeasibilityChecker for PermissiveFeasibilityChecker {
    async fn check_feasibility(&self, _task: &TaskSpec) -> FeasibilityReport {
        FeasibilityReport {
            feasible: true,
            reasons: Vec::new(),
            confidence_score: 1.0,
        }
    }
}

/// Context handed to a tool invocation: identifiers plus references to the
/// outbox adapter and an optional simulation flag (spec §6 "Tool contract").
#[derive(Clone)]
pub struct ToolContext {
    pub workflow_id: String,
    pub task_id: String,
    pub step_id: String,
    pub outbox: Arc<dyn Outbox>,
    /// When set, the tool must not perform real side effects: it records
    /// what it would have done instead (sandbox capture-only execution).
    pub simulate: bool,
}

/// `execute(params, context) -> result` (spec §6 "Tool contract").
#[async_trait]
pub trait Tool: Send + Sync {
    fn id(&self) -> &str;
    fn has_side_effects(&self) -> bool;
    async fn execute(&self, params: serde_json::Value, context: &ToolContext) -> KernelResult<serde_json::Value>;
}
