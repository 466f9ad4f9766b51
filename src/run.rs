//! Run aggregate and step execution records
//!
//! A `WorkflowRun` is never mutated in place by callers; it is folded from
//! the ledger's append-only event stream, so a snapshot always reflects the
//! last durably committed transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FailureKind;
use crate::handoff::HandoffContext;
use crate::step::WorkflowDefinition;

/// Unique run identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Overall run lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// State of one step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Queued,
    InFlight,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// Classified error detail attached to a failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: FailureKind,
    pub message: String,
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// One attempt record for one step. Every transition of an attempt is
/// appended to the ledger as a fresh record; folding keeps the latest
/// record per (step_index, attempt).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_index: usize,
    /// 1-based, monotonically increasing per step.
    pub attempt: u32,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    pub fn queued(step_index: usize, attempt: u32) -> Self {
        Self {
            step_index,
            attempt,
            status: StepStatus::Queued,
            payload: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn in_flight(step_index: usize, attempt: u32) -> Self {
        Self {
            status: StepStatus::InFlight,
            started_at: Some(Utc::now()),
            ..Self::queued(step_index, attempt)
        }
    }

    pub fn succeeded(
        step_index: usize,
        attempt: u32,
        payload: serde_json::Value,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            step_index,
            attempt,
            status: StepStatus::Succeeded,
            payload: Some(payload),
            error: None,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
        }
    }

    pub fn failed(
        step_index: usize,
        attempt: u32,
        error: StepError,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            step_index,
            attempt,
            status: StepStatus::Failed,
            payload: None,
            error: Some(error),
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
        }
    }
}

/// Snapshot of a run, folded from the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub definition: WorkflowDefinition,
    pub status: RunStatus,
    /// Human-readable reason for terminal Failed/Cancelled states.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    /// Latest record per (step_index, attempt), ordered by step then attempt.
    pub steps: Vec<StepExecution>,
    /// Index of the span currently (or last) executing.
    pub current_span: usize,
    /// Cumulative context as of the last successful handoff.
    pub context: HandoffContext,
    pub submitted_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// All attempt records for one step, in attempt order.
    pub fn attempts_for(&self, step_index: usize) -> Vec<&StepExecution> {
        self.steps
            .iter()
            .filter(|s| s.step_index == step_index)
            .collect()
    }

    /// Number of steps whose latest attempt succeeded.
    pub fn succeeded_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .map(|s| s.step_index)
            .collect::<std::collections::BTreeSet<_>>()
            .len()
    }

    /// Error detail of the most recent failed attempt, if any.
    pub fn last_error(&self) -> Option<&StepError> {
        self.steps
            .iter()
            .rev()
            .find_map(|s| s.error.as_ref())
    }
}

/// Lightweight listing entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: RunId,
    pub name: String,
    pub status: RunStatus,
    pub step_count: usize,
    pub submitted_at: DateTime<Utc>,
}

/// Filter for run listings.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub name_contains: Option<String>,
}

impl RunFilter {
    pub fn matches(&self, summary: &RunSummary) -> bool {
        if let Some(status) = self.status {
            if summary.status != status {
                return false;
            }
        }
        if let Some(needle) = &self.name_contains {
            if !summary.name.contains(needle.as_str()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_status_terminality() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn step_execution_transitions_carry_timestamps() {
        let queued = StepExecution::queued(0, 1);
        assert_eq!(queued.status, StepStatus::Queued);
        assert!(queued.started_at.is_none());

        let in_flight = StepExecution::in_flight(0, 1);
        assert_eq!(in_flight.status, StepStatus::InFlight);
        let started = in_flight.started_at.unwrap();

        let done = StepExecution::succeeded(0, 1, json!({"url": "x"}), started);
        assert_eq!(done.status, StepStatus::Succeeded);
        assert!(done.finished_at.unwrap() >= started);
    }

    #[test]
    fn filter_matches_status_and_name() {
        let summary = RunSummary {
            id: RunId::new(),
            name: "checkout-price".into(),
            status: RunStatus::Succeeded,
            step_count: 3,
            submitted_at: Utc::now(),
        };

        assert!(RunFilter::default().matches(&summary));
        assert!(RunFilter {
            status: Some(RunStatus::Succeeded),
            name_contains: Some("checkout".into()),
        }
        .matches(&summary));
        assert!(!RunFilter {
            status: Some(RunStatus::Failed),
            ..Default::default()
        }
        .matches(&summary));
        assert!(!RunFilter {
            name_contains: Some("login".into()),
            ..Default::default()
        }
        .matches(&summary));
    }

    #[test]
    fn run_id_display_is_uuid() {
        let id = RunId::new();
        assert_eq!(id.to_string().len(), 36);
    }
}
