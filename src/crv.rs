//! CRV gate chain: composable validators expressing domain invariants over
//! a commit, with fail-fast/aggregate blocking policy (spec §4.3).

use crate::error::ErrorCode;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// A proposed state transition submitted to a gate chain for validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: String,
    pub payload: Value,
    pub previous: Option<Value>,
    pub metadata: HashMap<String, String>,
}

impl Commit {
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
            previous: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_previous(mut self, previous: Value) -> Self {
        self.previous = Some(previous);
        self
    }
}

/// Outcome of a single validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub reason: String,
    pub confidence: f64,
    pub failure_code: Option<ErrorCode>,
    pub remediation: Option<String>,
}

impl ValidationResult {
    pub fn pass(reason: impl Into<String>) -> Self {
        Self {
            valid: true,
            reason: reason.into(),
            confidence: 1.0,
            failure_code: None,
            remediation: None,
        }
    }

    pub fn fail(reason: impl Into<String>, code: ErrorCode, remediation: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: reason.into(),
            confidence: 0.0,
            failure_code: Some(code),
            remediation: Some(remediation.into()),
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }
}

/// A pure predicate over a commit.
#[async_trait]
pub trait Validator: Send + Sync {
    fn name(&self) -> &str;
    async fn validate(&self, commit: &Commit) -> ValidationResult;
}

/// Recovery strategies a gate may declare; execution is delegated to a
/// `RecoveryExecutor` collaborator (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecoveryStrategy {
    RetryAltTool { tool_name: String, max_retries: u32 },
    AskUser { prompt: String },
    Escalate { reason: String },
    /// Proceed with an auditable bypass. Never silently drops the failure:
    /// the gate chain still records a `warning`-level outcome and tags the
    /// event log entry with `justification` (resolved Open Question).
    Ignore { justification: String },
}

#[async_trait]
pub trait RecoveryExecutor: Send + Sync {
    async fn execute(&self, strategy: &RecoveryStrategy, commit: &Commit, gate_name: &str);
}

/// A no-op executor for configurations that declare intent without wiring
/// an operator-facing channel; records nothing beyond a trace event.
#[derive(Debug, Default)]
pub struct NoopRecoveryExecutor;

#[async_trait]
impl RecoveryExecutor for NoopRecoveryExecutor {
    async fn execute(&self, strategy: &RecoveryStrategy, commit: &Commit, gate_name: &str) {
        tracing::warn!(gate = gate_name, commit_id = %commit.id, ?strategy, "recovery strategy invoked");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateOutcome {
    Passed,
    Warning,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub gate_name: String,
    pub outcome: GateOutcome,
    pub results: Vec<ValidationResult>,
    pub failure_code: Option<ErrorCode>,
    pub remediation: Option<String>,
    /// Set when a declared recovery strategy ran against this gate's verdict.
    pub recovered_via: Option<RecoveryStrategy>,
}

/// A named, ordered set of validators plus blocking policy.
pub struct Gate {
    pub name: String,
    pub validators: Vec<Box<dyn Validator>>,
    pub block_on_failure: bool,
    pub required_confidence: Option<f64>,
    pub recovery_strategy: Option<RecoveryStrategy>,
    /// Per-validator suspension budget (spec §5 "Suspension points"). A
    /// validator that blows through this is treated as a failure rather
    /// than hanging the whole chain.
    pub validator_timeout: Option<Duration>,
}

impl Gate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            validators: Vec::new(),
            block_on_failure: true,
            required_confidence: None,
            recovery_strategy: None,
            validator_timeout: None,
        }
    }

    pub fn with_validator(mut self, validator: Box<dyn Validator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn blocking(mut self, block_on_failure: bool) -> Self {
        self.block_on_failure = block_on_failure;
        self
    }

    pub fn with_required_confidence(mut self, threshold: f64) -> Self {
        self.required_confidence = Some(threshold);
        self
    }

    pub fn with_recovery(mut self, strategy: RecoveryStrategy) -> Self {
        self.recovery_strategy = Some(strategy);
        self
    }

    pub fn with_validator_timeout(mut self, timeout: Duration) -> Self {
        self.validator_timeout = Some(timeout);
        self
    }

    /// Run every validator in declared order and fold into a gate verdict
    /// (spec §4.3 "Validation algorithm").
    pub async fn run(&self, commit: &Commit) -> GateResult {
        let mut results = Vec::with_capacity(self.validators.len());
        for validator in &self.validators {
            let result = match self.validator_timeout {
                Some(timeout) => match with_timeout(timeout, validator.validate(commit)).await {
                    Ok(r) => r,
                    Err(_) => ValidationResult::fail(
                        format!("validator '{}' timed out", validator.name()),
                        ErrorCode::ToolError,
                        "increase the gate's validator timeout or investigate the slow validator",
                    ),
                },
                None => validator.validate(commit).await,
            };
            tracing::debug!(
                gate = %self.name,
                validator = validator.name(),
                valid = result.valid,
                confidence = result.confidence,
                "validator ran"
            );
            results.push(result);
        }

        let all_passed = results.iter().all(|r| {
            r.valid && self.required_confidence.map(|t| r.confidence >= t).unwrap_or(true)
        });

        let first_failure = results.iter().find(|r| {
            !r.valid || self.required_confidence.map(|t| r.confidence < t).unwrap_or(false)
        });

        let outcome = if all_passed {
            GateOutcome::Passed
        } else if self.block_on_failure {
            GateOutcome::Blocked
        } else {
            GateOutcome::Warning
        };

        let (failure_code, remediation) = match first_failure {
            Some(r) => (r.failure_code, r.remediation.clone()),
            None => (None, None),
        };

        GateResult {
            gate_name: self.name.clone(),
            outcome,
            results,
            failure_code,
            remediation,
            recovered_via: None,
        }
    }

    /// Run the gate, then apply its declared recovery strategy (if any) to a
    /// `Blocked` verdict (spec §4.3 "Recovery strategies"). `Ignore` is the
    /// only strategy that downgrades the verdict itself, to `Warning` — the
    /// others (`RetryAltTool`, `AskUser`, `Escalate`) hand the failure to the
    /// executor for out-of-band handling but leave the gate blocked.
    pub async fn run_with_recovery(&self, commit: &Commit, executor: &dyn RecoveryExecutor) -> GateResult {
        let mut result = self.run(commit).await;
        if result.outcome != GateOutcome::Blocked {
            return result;
        }
        let Some(strategy) = &self.recovery_strategy else {
            return result;
        };

        executor.execute(strategy, commit, &self.name).await;
        result.recovered_via = Some(strategy.clone());
        if let RecoveryStrategy::Ignore { justification } = strategy {
            result.outcome = GateOutcome::Warning;
            result.remediation = Some(format!("ignored: {justification}"));
        }
        result
    }
}

/// Sequential composition of gates; the first blocking gate stops the chain.
#[derive(Default)]
pub struct GateChain {
    gates: Vec<Gate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainResult {
    pub gate_results: Vec<GateResult>,
    pub blocked: bool,
}

impl GateChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gates.push(gate);
        self
    }

    pub async fn run(&self, commit: &Commit) -> ChainResult {
        self.run_with_recovery(commit, &NoopRecoveryExecutor).await
    }

    /// Sequentially runs every gate through its declared recovery strategy;
    /// the first gate whose verdict is still `Blocked` after recovery stops
    /// the chain.
    pub async fn run_with_recovery(&self, commit: &Commit, executor: &dyn RecoveryExecutor) -> ChainResult {
        let mut gate_results = Vec::with_capacity(self.gates.len());
        let mut blocked = false;

        for gate in &self.gates {
            let result = gate.run_with_recovery(commit, executor).await;
            let is_blocked = result.outcome == GateOutcome::Blocked;
            gate_results.push(result);
            if is_blocked {
                blocked = true;
                break;
            }
        }

        ChainResult { gate_results, blocked }
    }
}

/// Timeout wrapper used by callers invoking suspension points through the
/// gate chain (spec §5 "Suspension points").
pub async fn with_timeout<F, T>(duration: Duration, fut: F) -> crate::error::KernelResult<T>
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| crate::error::KernelError::ToolTimeout("crv validator".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysPasses;
    #[async_trait]
    impl Validator for AlwaysPasses {
        fn name(&self) -> &str {
            "always_passes"
        }
        async fn validate(&self, _commit: &Commit) -> ValidationResult {
            ValidationResult::pass("ok")
        }
    }

    struct RejectsNegativeBalance;
    #[async_trait]
    impl Validator for RejectsNegativeBalance {
        fn name(&self) -> &str {
            "rejects_negative_balance"
        }
        async fn validate(&self, commit: &Commit) -> ValidationResult {
            let balance = commit.payload.get("balance").and_then(|v| v.as_i64()).unwrap_or(0);
            if balance < 0 {
                ValidationResult::fail(
                    "balance would go negative",
                    ErrorCode::PolicyViolation,
                    "reduce the withdrawal amount",
                )
            } else {
                ValidationResult::pass("balance non-negative")
            }
        }
    }

    #[tokio::test]
    async fn blocks_chain_on_first_blocking_gate() {
        let chain = GateChain::new()
            .with_gate(Gate::new("balance").with_validator(Box::new(RejectsNegativeBalance)).blocking(true))
            .with_gate(Gate::new("always").with_validator(Box::new(AlwaysPasses)));

        let commit = Commit::new("c1", serde_json::json!({"balance": -5}));
        let result = chain.run(&commit).await;

        assert!(result.blocked);
        assert_eq!(result.gate_results.len(), 1);
        assert_eq!(result.gate_results[0].outcome, GateOutcome::Blocked);
        assert_eq!(result.gate_results[0].failure_code, Some(ErrorCode::PolicyViolation));
    }

    #[tokio::test]
    async fn non_blocking_gate_emits_warning_and_continues() {
        let chain = GateChain::new()
            .with_gate(Gate::new("balance").with_validator(Box::new(RejectsNegativeBalance)).blocking(false))
            .with_gate(Gate::new("always").with_validator(Box::new(AlwaysPasses)));

        let commit = Commit::new("c1", serde_json::json!({"balance": -5}));
        let result = chain.run(&commit).await;

        assert!(!result.blocked);
        assert_eq!(result.gate_results.len(), 2);
        assert_eq!(result.gate_results[0].outcome, GateOutcome::Warning);
        assert_eq!(result.gate_results[1].outcome, GateOutcome::Passed);
    }

    #[tokio::test]
    async fn required_confidence_below_threshold_fails_even_if_valid() {
        struct LowConfidence;
        #[async_trait]
        impl Validator for LowConfidence {
            fn name(&self) -> &str {
                "low_confidence"
            }
            async fn validate(&self, _commit: &Commit) -> ValidationResult {
                ValidationResult::pass("technically valid").with_confidence(0.2)
            }
        }

        let gate = Gate::new("confidence")
            .with_validator(Box::new(LowConfidence))
            .with_required_confidence(0.8)
            .blocking(true);

        let commit = Commit::new("c1", serde_json::json!({}));
        let result = gate.run(&commit).await;
        assert_eq!(result.outcome, GateOutcome::Blocked);
    }

    #[derive(Default)]
    struct RecordingRecoveryExecutor {
        invocations: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RecoveryExecutor for RecordingRecoveryExecutor {
        async fn execute(&self, _strategy: &RecoveryStrategy, _commit: &Commit, gate_name: &str) {
            self.invocations.lock().push(gate_name.to_string());
        }
    }

    #[tokio::test]
    async fn ignore_recovery_downgrades_blocked_to_warning_and_invokes_executor() {
        let gate = Gate::new("balance")
            .with_validator(Box::new(RejectsNegativeBalance))
            .blocking(true)
            .with_recovery(RecoveryStrategy::Ignore { justification: "manually approved overdraft".into() });

        let executor = RecordingRecoveryExecutor::default();
        let commit = Commit::new("c1", serde_json::json!({"balance": -5}));
        let result = gate.run_with_recovery(&commit, &executor).await;

        assert_eq!(result.outcome, GateOutcome::Warning);
        assert!(matches!(result.recovered_via, Some(RecoveryStrategy::Ignore { .. })));
        assert_eq!(*executor.invocations.lock(), vec!["balance".to_string()]);
    }

    #[tokio::test]
    async fn escalate_recovery_invokes_executor_but_stays_blocked() {
        let gate = Gate::new("balance")
            .with_validator(Box::new(RejectsNegativeBalance))
            .blocking(true)
            .with_recovery(RecoveryStrategy::Escalate { reason: "needs a human".into() });

        let executor = RecordingRecoveryExecutor::default();
        let commit = Commit::new("c1", serde_json::json!({"balance": -5}));
        let result = gate.run_with_recovery(&commit, &executor).await;

        assert_eq!(result.outcome, GateOutcome::Blocked);
        assert!(matches!(result.recovered_via, Some(RecoveryStrategy::Escalate { .. })));
        assert_eq!(*executor.invocations.lock(), vec!["balance".to_string()]);
    }

    #[tokio::test]
    async fn gate_chain_run_applies_ignore_recovery_by_default() {
        let chain = GateChain::new().with_gate(
            Gate::new("balance")
                .with_validator(Box::new(RejectsNegativeBalance))
                .blocking(true)
                .with_recovery(RecoveryStrategy::Ignore { justification: "ok".into() }),
        );

        let commit = Commit::new("c1", serde_json::json!({"balance": -5}));
        let result = chain.run(&commit).await;

        assert!(!result.blocked);
        assert_eq!(result.gate_results[0].outcome, GateOutcome::Warning);
    }

    struct SlowValidator;
    #[async_trait]
    impl Validator for SlowValidator {
        fn name(&self) -> &str {
            "slow"
        }
        async fn validate(&self, _commit: &Commit) -> ValidationResult {
            tokio::time::sleep(Duration::from_millis(50)).await;
            ValidationResult::pass("eventually ok")
        }
    }

    #[tokio::test]
    async fn validator_exceeding_timeout_fails_the_gate() {
        let gate = Gate::new("slow-gate")
            .with_validator(Box::new(SlowValidator))
            .with_validator_timeout(Duration::from_millis(5))
            .blocking(true);

        let commit = Commit::new("c1", serde_json::json!({}));
        let result = gate.run(&commit).await;

        assert_eq!(result.outcome, GateOutcome::Blocked);
        assert_eq!(result.failure_code, Some(ErrorCode::ToolError));
    }
}
