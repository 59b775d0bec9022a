//! Explicit configuration structs, passed at construction time rather than
//! threaded as ambient globals (spec §9 "Ambient/global collaborator objects").

use serde::{Deserialize, Serialize};

/// Workflow-level configuration (spec §6 "Configuration").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub safety_policy: Option<String>,
    pub fail_fast: bool,
    pub strict_warnings: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            safety_policy: None,
            fail_fast: true,
            strict_warnings: false,
        }
    }
}

/// Outbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    pub stuck_processing_threshold_ms: u64,
    pub default_max_attempts: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            stuck_processing_threshold_ms: 300_000,
            default_max_attempts: 3,
        }
    }
}

/// Coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub default_lock_timeout_ms: u64,
    pub enable_timeout_checker: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_lock_timeout_ms: 30_000,
            enable_timeout_checker: true,
        }
    }
}

/// Livelock detector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivelockConfig {
    pub window_size: usize,
    pub pattern_threshold: usize,
    pub progress_timeout_ms: u64,
}

impl Default for LivelockConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            pattern_threshold: 3,
            progress_timeout_ms: 60_000,
        }
    }
}

/// Rollback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackConfig {
    pub require_approval_at_risk_tier: crate::task::RiskTier,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            require_approval_at_risk_tier: crate::task::RiskTier::High,
        }
    }
}

/// Top-level configuration bundle handed to the orchestrator at construction.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KernelConfig {
    pub workflow: WorkflowConfig,
    pub outbox: OutboxConfig,
    pub coordinator: CoordinatorConfig,
    pub livelock: LivelockConfig,
    pub rollback: RollbackConfig,
}
