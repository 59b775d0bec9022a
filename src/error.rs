//! Closed error taxonomy and the crate-wide error type.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable failure classification, closed by design (spec §7). Every
/// failure surfaced to a caller carries exactly one of these codes plus a
/// remediation string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Required field absent.
    MissingData,
    /// Schema/type mismatch, version conflict, or inconsistent cross-field state.
    Conflict,
    /// Value outside declared bounds (size, statistical, permission).
    OutOfScope,
    /// Validator returned valid but below the confidence threshold.
    LowConfidence,
    /// Policy gate denied, or a safety rule triggered.
    PolicyViolation,
    /// Tool threw, timed out, or returned a non-result.
    ToolError,
    /// Idempotence or temporal-monotonicity invariant violated.
    NonDeterminism,
}

impl ErrorCode {
    /// Whether a failure of this class should be retried by the orchestrator's
    /// retry policy (spec §4.1 "Retry policy", §7 "Propagation").
    pub fn is_retriable(&self) -> bool {
        matches!(self, ErrorCode::ToolError | ErrorCode::Conflict)
    }
}

#[derive(Error, Debug, Clone)]
pub enum KernelError {
    #[error("{code:?}: {message}")]
    Classified {
        code: ErrorCode,
        message: String,
        remediation: Option<String>,
    },

    #[error("version conflict on key {key}: expected {expected}, found {found}")]
    VersionConflict {
        key: String,
        expected: u64,
        found: u64,
    },

    #[error("lock acquisition timed out on resource {resource}")]
    LockTimeout { resource: String },

    #[error("deadlock detected: cycle {cycle:?}")]
    Deadlock { cycle: Vec<String> },

    #[error("tool '{0}' timed out")]
    ToolTimeout(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl KernelError {
    pub fn classified(
        code: ErrorCode,
        message: impl Into<String>,
        remediation: Option<String>,
    ) -> Self {
        KernelError::Classified {
            code,
            message: message.into(),
            remediation,
        }
    }

    /// Classify this error into the closed taxonomy for retry/recording purposes.
    pub fn code(&self) -> ErrorCode {
        match self {
            KernelError::Classified { code, .. } => *code,
            KernelError::VersionConflict { .. } => ErrorCode::Conflict,
            KernelError::LockTimeout { .. } => ErrorCode::ToolError,
            KernelError::Deadlock { .. } => ErrorCode::Conflict,
            KernelError::ToolTimeout(_) => ErrorCode::ToolError,
            KernelError::NotFound(_) => ErrorCode::MissingData,
            KernelError::Io(_) => ErrorCode::ToolError,
            KernelError::Serialization(_) => ErrorCode::Conflict,
        }
    }

    /// Remediation text, when one is available.
    pub fn remediation(&self) -> Option<&str> {
        match self {
            KernelError::Classified { remediation, .. } => remediation.as_deref(),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KernelError {
    fn from(e: std::io::Error) -> Self {
        KernelError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(e: serde_json::Error) -> Self {
        KernelError::Serialization(e.to_string())
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
