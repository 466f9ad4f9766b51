//! Error types and failure classification

use thiserror::Error;

use crate::run::RunId;

/// Classification attached to every action failure.
///
/// The retry policy only ever sees one of these, never a raw error, so
/// retry decisions stay deterministic across drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The step's own timeout elapsed before the driver returned.
    Timeout,
    /// Transient network/IO failure reported by the driver.
    TransientIo,
    /// Selector or navigation target not present (DOM timing).
    TargetNotFound,
    /// The action's parameters were rejected by the driver.
    Validation,
    /// Non-recoverable driver condition.
    Fatal,
}

impl FailureKind {
    /// Whether the retry policy may grant another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::Timeout | FailureKind::TransientIo | FailureKind::TargetNotFound
        )
    }

    /// Whether the outcome of the failed attempt is unknown.
    ///
    /// A timed-out or connection-dropped action may still have taken effect
    /// on the page; a missing target provably did nothing.
    pub fn is_ambiguous(self) -> bool {
        matches!(self, FailureKind::Timeout | FailureKind::TransientIo)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::TransientIo => "transient_io",
            FailureKind::TargetNotFound => "target_not_found",
            FailureKind::Validation => "validation",
            FailureKind::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All error variants are part of the public API.
#[derive(Error, Debug)]
pub enum StrandError {
    #[error("invalid workflow definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("run '{run_id}' not found")]
    NotFound { run_id: RunId },

    #[error("agent '{agent}' is not declared in the routing policy")]
    UnknownAgent { agent: String },

    #[error("agent '{agent}' wrote slot '{slot}' without declaring ownership (held by '{owner}')")]
    SlotViolation {
        slot: String,
        agent: String,
        owner: String,
    },

    #[error("step {step_index} is not idempotent and its outcome is unknown; refusing to retry")]
    UnsafeRetry { step_index: usize },

    #[error("action failed ({kind}): {message}")]
    Action { kind: FailureKind, message: String },

    #[error("step {step_index} payload is {size} bytes (limit {limit})")]
    PayloadTooLarge {
        step_index: usize,
        size: usize,
        limit: usize,
    },

    #[error("run exceeded its duration limit after {elapsed_ms}ms")]
    RunTimeout { elapsed_ms: u64 },

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StrandError {
    /// Whether this error belongs to the configuration class of the
    /// taxonomy (bad definition or routing, fails fast, never retried).
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            StrandError::InvalidDefinition { .. }
                | StrandError::UnknownAgent { .. }
                | StrandError::SlotViolation { .. }
        )
    }

    /// Short operator-facing hint on how to fix the condition.
    pub fn remediation(&self) -> Option<&'static str> {
        match self {
            StrandError::InvalidDefinition { .. } => {
                Some("Check the workflow has at least one step and every step kind is routed")
            }
            StrandError::NotFound { .. } => Some("Verify the run id; the run may have been purged"),
            StrandError::UnknownAgent { .. } => {
                Some("Add an agent declaration with its owned slots to the routing policy")
            }
            StrandError::SlotViolation { .. } => {
                Some("Declare the slot in the agent's `owns` list to claim ownership")
            }
            StrandError::UnsafeRetry { .. } => {
                Some("Mark the step idempotent or have the driver confirm the attempt had no effect")
            }
            StrandError::Action { .. } => Some("Inspect the attempt history via the run snapshot"),
            StrandError::PayloadTooLarge { .. } => {
                Some("Narrow the extract selector or raise max_payload_size")
            }
            StrandError::RunTimeout { .. } => Some("Raise max_run_duration or split the workflow"),
            StrandError::Ledger(_) => Some("Check the ledger backend is reachable and writable"),
            StrandError::YamlParse(_) => Some("Check YAML syntax: indentation and quoting"),
            StrandError::Json(_) => None,
            StrandError::Io(_) => Some("Check file path and permissions"),
        }
    }
}
