//! Execution ledger: durable, append-only record of run transitions
//!
//! The ledger is the authoritative commit point: a state change is not
//! final until its event is appended. Snapshots are folded from the event
//! stream, so readers always see the last durably committed transition.
//!
//! Appends for one run are serialized by the state machine (single writer
//! per run); the ledger only has to make each append atomic.

mod jsonl;
mod memory;

pub use jsonl::JsonlLedger;
pub use memory::MemoryLedger;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StrandError;
use crate::handoff::HandoffContext;
use crate::run::{RunFilter, RunId, RunStatus, RunSummary, StepExecution, WorkflowRun};
use crate::step::WorkflowDefinition;

/// One transition in a run's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Submitted {
        definition: WorkflowDefinition,
        submitted_at: DateTime<Utc>,
    },
    StatusChanged {
        status: RunStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    SpanStarted {
        span_index: usize,
        agent: String,
        at: DateTime<Utc>,
    },
    Step {
        exec: StepExecution,
    },
    Handoff {
        span_index: usize,
        agent: String,
        context: HandoffContext,
        at: DateTime<Utc>,
    },
}

impl RunEvent {
    pub fn status_changed(status: RunStatus, reason: Option<String>) -> Self {
        RunEvent::StatusChanged {
            status,
            reason,
            at: Utc::now(),
        }
    }

    pub fn span_started(span_index: usize, agent: impl Into<String>) -> Self {
        RunEvent::SpanStarted {
            span_index,
            agent: agent.into(),
            at: Utc::now(),
        }
    }
}

/// Envelope stored by ledger backends: per-run monotonic sequence number
/// plus the event itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub seq: u64,
    pub run_id: RunId,
    pub event: RunEvent,
}

/// Repository interface consumed by the engine. Backends must make each
/// `append` atomic; they never see concurrent appends for one run.
pub trait ExecutionLedger: Send + Sync {
    /// Append one transition, returning its sequence number within the run.
    fn append(&self, run_id: RunId, event: RunEvent) -> Result<u64, StrandError>;

    /// Fold the run's events into a consistent snapshot.
    fn read_run(&self, run_id: RunId) -> Result<WorkflowRun, StrandError>;

    /// Summaries of known runs matching the filter, newest first.
    fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunSummary>, StrandError>;
}

/// Fold an event stream into a run snapshot. Returns `None` when the stream
/// lacks a `Submitted` event (unknown run).
pub fn fold_run(run_id: RunId, events: &[RunEvent]) -> Option<WorkflowRun> {
    let mut run: Option<WorkflowRun> = None;

    for event in events {
        match event {
            RunEvent::Submitted {
                definition,
                submitted_at,
            } => {
                run = Some(WorkflowRun {
                    id: run_id,
                    definition: definition.clone(),
                    status: RunStatus::Pending,
                    status_reason: None,
                    steps: Vec::new(),
                    current_span: 0,
                    context: HandoffContext::default(),
                    submitted_at: *submitted_at,
                });
            }
            RunEvent::StatusChanged { status, reason, .. } => {
                if let Some(run) = run.as_mut() {
                    run.status = *status;
                    run.status_reason = reason.clone();
                }
            }
            RunEvent::SpanStarted { span_index, .. } => {
                if let Some(run) = run.as_mut() {
                    run.current_span = *span_index;
                }
            }
            RunEvent::Step { exec } => {
                if let Some(run) = run.as_mut() {
                    apply_step(&mut run.steps, exec);
                }
            }
            RunEvent::Handoff { context, .. } => {
                if let Some(run) = run.as_mut() {
                    run.context = context.clone();
                }
            }
        }
    }

    run.map(|mut r| {
        r.steps
            .sort_by_key(|s| (s.step_index, s.attempt));
        r
    })
}

/// Keep the latest record per (step_index, attempt).
fn apply_step(steps: &mut Vec<StepExecution>, exec: &StepExecution) {
    if let Some(existing) = steps
        .iter_mut()
        .find(|s| s.step_index == exec.step_index && s.attempt == exec.attempt)
    {
        *existing = exec.clone();
    } else {
        steps.push(exec.clone());
    }
}

/// Summary view of an event stream, cheap enough for listings.
pub(crate) fn summarize(run_id: RunId, events: &[RunEvent]) -> Option<RunSummary> {
    let mut summary: Option<RunSummary> = None;
    for event in events {
        match event {
            RunEvent::Submitted {
                definition,
                submitted_at,
            } => {
                summary = Some(RunSummary {
                    id: run_id,
                    name: definition.name.clone(),
                    status: RunStatus::Pending,
                    step_count: definition.steps.len(),
                    submitted_at: *submitted_at,
                });
            }
            RunEvent::StatusChanged { status, .. } => {
                if let Some(summary) = summary.as_mut() {
                    summary.status = *status;
                }
            }
            _ => {}
        }
    }
    summary
}
