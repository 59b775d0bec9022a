//! Workflow specification: a DAG of tasks plus the dependency mapping
//! between them (spec §3 "Workflow specification").

use crate::error::{ErrorCode, KernelError, KernelResult};
use crate::task::TaskSpec;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::config::WorkflowConfig;

/// A workflow: an identifier, its task set, and the predecessor mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub id: String,
    pub tasks: Vec<TaskSpec>,
    /// task id -> set of predecessor task ids.
    pub dependencies: HashMap<String, HashSet<String>>,
    pub safety_policy: Option<WorkflowConfig>,
}

impl WorkflowSpec {
    pub fn new(id: impl Into<String>, tasks: Vec<TaskSpec>) -> Self {
        Self {
            id: id.into(),
            tasks,
            dependencies: HashMap::new(),
            safety_policy: None,
        }
    }

    pub fn with_dependency(mut self, task: impl Into<String>, depends_on: impl Into<String>) -> Self {
        self.dependencies
            .entry(task.into())
            .or_default()
            .insert(depends_on.into());
        self
    }

    pub fn task(&self, id: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.id == id)
    }

    fn predecessors_of(&self, task_id: &str) -> HashSet<&str> {
        self.dependencies
            .get(task_id)
            .map(|s| s.iter().map(|s| s.as_str()).collect())
            .unwrap_or_default()
    }

    /// Validate the invariant from spec §3: the dependency graph has no
    /// cycles and every predecessor exists in the task set.
    pub fn validate(&self) -> KernelResult<()> {
        let task_ids: HashSet<&str> = self.tasks.iter().map(|t| t.id.as_str()).collect();

        for (task, preds) in &self.dependencies {
            if !task_ids.contains(task.as_str()) {
                return Err(KernelError::classified(
                    ErrorCode::MissingData,
                    format!("dependency map references unknown task '{task}'"),
                    Some("remove the dangling dependency entry or add the task".into()),
                ));
            }
            for pred in preds {
                if !task_ids.contains(pred.as_str()) {
                    return Err(KernelError::classified(
                        ErrorCode::MissingData,
                        format!("task '{task}' depends on unknown predecessor '{pred}'"),
                        Some("add the missing predecessor task to the workflow".into()),
                    ));
                }
            }
        }

        let mut graph = DiGraph::<&str, ()>::new();
        let mut idx: HashMap<&str, NodeIndex> = HashMap::new();
        for t in &self.tasks {
            idx.insert(t.id.as_str(), graph.add_node(t.id.as_str()));
        }
        for (task, preds) in &self.dependencies {
            for pred in preds {
                graph.add_edge(idx[pred.as_str()], idx[task.as_str()], ());
            }
        }

        if toposort(&graph, None).is_err() {
            return Err(KernelError::classified(
                ErrorCode::Conflict,
                format!("dependency graph for workflow '{}' contains a cycle", self.id),
                Some("break the cycle by removing one of the offending dependency edges".into()),
            ));
        }

        Ok(())
    }

    /// Tasks whose predecessors are all in `completed`.
    pub fn eligible_tasks<'a>(&'a self, completed: &HashSet<String>) -> Vec<&'a TaskSpec> {
        self.tasks
            .iter()
            .filter(|t| !completed.contains(&t.id))
            .filter(|t| {
                self.predecessors_of(&t.id)
                    .iter()
                    .all(|p| completed.contains(*p))
            })
            .collect()
    }
}

/// Result returned once a workflow reaches a terminal state (spec §4.1, §7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub status: WorkflowOutcome,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub compensated: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowOutcome {
    Completed,
    Failed,
    Compensated,
    PartiallyCompensated,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{RetryPolicy, RiskTier, TaskType};

    fn task(id: &str) -> TaskSpec {
        TaskSpec {
            id: id.to_string(),
            name: id.to_string(),
            task_type: TaskType::Action,
            tool_id: None,
            input: serde_json::json!({}),
            retry_policy: RetryPolicy::default(),
            timeout_ms: None,
            idempotency_key: None,
            compensation: None,
            risk_tier: RiskTier::Low,
            required_permissions: vec![],
            shared_resources: vec![],
        }
    }

    #[test]
    fn rejects_cycles() {
        let wf = WorkflowSpec::new("wf", vec![task("a"), task("b")])
            .with_dependency("a", "b")
            .with_dependency("b", "a");
        assert!(wf.validate().is_err());
    }

    #[test]
    fn rejects_missing_predecessor() {
        let wf = WorkflowSpec::new("wf", vec![task("a")]).with_dependency("a", "ghost");
        assert!(wf.validate().is_err());
    }

    #[test]
    fn accepts_dag() {
        let wf = WorkflowSpec::new("wf", vec![task("a"), task("b"), task("c")])
            .with_dependency("b", "a")
            .with_dependency("c", "a")
            .with_dependency("c", "b");
        assert!(wf.validate().is_ok());

        let mut completed = HashSet::new();
        assert_eq!(
            wf.eligible_tasks(&completed).iter().map(|t| t.id.clone()).collect::<Vec<_>>(),
            vec!["a".to_string()]
        );
        completed.insert("a".to_string());
        let mut eligible: Vec<_> = wf.eligible_tasks(&completed).iter().map(|t| t.id.clone()).collect();
        eligible.sort();
        assert_eq!(eligible, vec!["b".to_string()]);
    }
}
