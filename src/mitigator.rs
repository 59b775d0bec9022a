//! Mitigator: applies a chosen strategy to a detected deadlock or livelock
//! condition (spec §4.4 "Mitigator").

use crate::coordinator::{Coordinator, DeadlockReport};
use crate::livelock::{LivelockDetector, LivelockReport};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MitigationStrategy {
    Abort,
    Replan,
    Escalate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MitigationOutcome {
    /// Tasks belonging to these agents/holders were marked failed and their
    /// locks released.
    Aborted { victims: Vec<String> },
    /// Locks released and the orchestrator signalled to replan.
    Replanned { victim: String },
    /// No autonomous action; a registered callback was invoked.
    Escalated { context: String },
}

pub trait EscalationCallback: Send + Sync {
    fn on_escalate(&self, context: &str);
}

pub struct NoopEscalationCallback;
impl EscalationCallback for NoopEscalationCallback {
    fn on_escalate(&self, context: &str) {
        tracing::warn!(context, "deadlock/livelock escalated with no registered handler");
    }
}

pub struct Mitigator {
    coordinator: Arc<Coordinator>,
    livelock: Arc<LivelockDetector>,
    escalation: Arc<dyn EscalationCallback>,
}

impl Mitigator {
    pub fn new(coordinator: Arc<Coordinator>, livelock: Arc<LivelockDetector>) -> Self {
        Self {
            coordinator,
            livelock,
            escalation: Arc::new(NoopEscalationCallback),
        }
    }

    pub fn with_escalation(mut self, callback: Arc<dyn EscalationCallback>) -> Self {
        self.escalation = callback;
        self
    }

    /// Mitigate a deadlock. `ABORT` picks the victim holding the most
    /// resources; `REPLAN` picks the one holding the fewest (spec §4.4).
    pub fn mitigate_deadlock(&self, report: &DeadlockReport, strategy: MitigationStrategy) -> MitigationOutcome {
        match strategy {
            MitigationStrategy::Abort => {
                let victim = report
                    .cycle
                    .iter()
                    .max_by_key(|agent| self.coordinator.resources_held_by(agent).len())
                    .cloned()
                    .unwrap_or_else(|| report.cycle[0].clone());
                self.coordinator.release_all(&victim);
                self.livelock.clear(&victim);
                MitigationOutcome::Aborted { victims: vec![victim] }
            }
            MitigationStrategy::Replan => {
                let victim = report
                    .cycle
                    .iter()
                    .min_by_key(|agent| self.coordinator.resources_held_by(agent).len())
                    .cloned()
                    .unwrap_or_else(|| report.cycle[0].clone());
                self.coordinator.release_all(&victim);
                self.livelock.clear(&victim);
                MitigationOutcome::Replanned { victim }
            }
            MitigationStrategy::Escalate => {
                let context = format!("deadlock cycle: {:?}", report.cycle);
                self.escalation.on_escalate(&context);
                MitigationOutcome::Escalated { context }
            }
        }
    }

    /// Mitigate a livelock. `ABORT` aborts every implicated agent; `REPLAN`
    /// clears history so agents retry with a fresh context (spec §4.4).
    pub fn mitigate_livelock(&self, report: &LivelockReport, strategy: MitigationStrategy) -> MitigationOutcome {
        match strategy {
            MitigationStrategy::Abort => {
                self.coordinator.release_all(&report.agent_id);
                self.livelock.clear(&report.agent_id);
                MitigationOutcome::Aborted { victims: vec![report.agent_id.clone()] }
            }
            MitigationStrategy::Replan => {
                self.livelock.clear(&report.agent_id);
                MitigationOutcome::Replanned { victim: report.agent_id.clone() }
            }
            MitigationStrategy::Escalate => {
                let context = format!("livelock agent: {} pattern: {:?}", report.agent_id, report.pattern);
                self.escalation.on_escalate(&context);
                MitigationOutcome::Escalated { context }
            }
        }
    }

    /// Run deadlock detection and mitigation before livelock, since
    /// clearing a deadlock victim's locks also invalidates its livelock
    /// history (resolved Open Question on detection ordering).
    pub fn sweep(&self, agent_id: &str, strategy: MitigationStrategy) -> Option<MitigationOutcome> {
        if let Some(deadlock) = self.coordinator.detect_deadlock() {
            if deadlock.cycle.iter().any(|a| a == agent_id) {
                return Some(self.mitigate_deadlock(&deadlock, strategy));
            }
        }

        if let Some(livelock) = self.livelock.check(agent_id) {
            return Some(self.mitigate_livelock(&livelock, strategy));
        }

        None
    }
}
