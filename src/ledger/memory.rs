//! In-memory ledger backend

use std::collections::HashMap;

use parking_lot::RwLock;

use super::{fold_run, summarize, ExecutionLedger, LedgerRecord, RunEvent};
use crate::error::StrandError;
use crate::run::{RunFilter, RunId, RunSummary, WorkflowRun};

/// Reference ledger: per-run append-only vectors behind a single lock.
///
/// Suitable for tests and single-process deployments; the trait boundary is
/// where a relational backend plugs in.
#[derive(Default)]
pub struct MemoryLedger {
    runs: RwLock<HashMap<RunId, Vec<LedgerRecord>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw event records for one run, in append order.
    pub fn records(&self, run_id: RunId) -> Vec<LedgerRecord> {
        self.runs
            .read()
            .get(&run_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl ExecutionLedger for MemoryLedger {
    fn append(&self, run_id: RunId, event: RunEvent) -> Result<u64, StrandError> {
        let mut runs = self.runs.write();
        let records = runs.entry(run_id).or_default();
        let seq = records.len() as u64;
        records.push(LedgerRecord { seq, run_id, event });
        Ok(seq)
    }

    fn read_run(&self, run_id: RunId) -> Result<WorkflowRun, StrandError> {
        let runs = self.runs.read();
        let records = runs.get(&run_id).ok_or(StrandError::NotFound { run_id })?;
        let events: Vec<RunEvent> = records.iter().map(|r| r.event.clone()).collect();
        fold_run(run_id, &events).ok_or(StrandError::NotFound { run_id })
    }

    fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunSummary>, StrandError> {
        let runs = self.runs.read();
        let mut summaries: Vec<RunSummary> = runs
            .iter()
            .filter_map(|(&run_id, records)| {
                let events: Vec<RunEvent> = records.iter().map(|r| r.event.clone()).collect();
                summarize(run_id, &events)
            })
            .filter(|s| filter.matches(s))
            .collect();
        summaries.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunStatus;
    use crate::step::{StepKind, StepSpec, WorkflowDefinition};
    use chrono::Utc;

    fn submit(ledger: &MemoryLedger, name: &str) -> RunId {
        let run_id = RunId::new();
        ledger
            .append(
                run_id,
                RunEvent::Submitted {
                    definition: WorkflowDefinition::new(name, vec![StepSpec::new(StepKind::Noop)]),
                    submitted_at: Utc::now(),
                },
            )
            .unwrap();
        run_id
    }

    #[test]
    fn append_returns_monotonic_seq() {
        let ledger = MemoryLedger::new();
        let run_id = submit(&ledger, "w");

        let s1 = ledger
            .append(run_id, RunEvent::status_changed(RunStatus::Running, None))
            .unwrap();
        let s2 = ledger
            .append(run_id, RunEvent::status_changed(RunStatus::Succeeded, None))
            .unwrap();
        assert_eq!(s1, 1);
        assert_eq!(s2, 2);
    }

    #[test]
    fn read_unknown_run_is_not_found() {
        let ledger = MemoryLedger::new();
        let err = ledger.read_run(RunId::new()).unwrap_err();
        assert!(matches!(err, StrandError::NotFound { .. }));
    }

    #[test]
    fn read_your_writes() {
        let ledger = MemoryLedger::new();
        let run_id = submit(&ledger, "w");
        ledger
            .append(run_id, RunEvent::status_changed(RunStatus::Running, None))
            .unwrap();

        let run = ledger.read_run(run_id).unwrap();
        assert_eq!(run.status, RunStatus::Running);
    }

    #[test]
    fn list_runs_filters_by_status() {
        let ledger = MemoryLedger::new();
        let a = submit(&ledger, "alpha");
        let b = submit(&ledger, "beta");
        ledger
            .append(a, RunEvent::status_changed(RunStatus::Succeeded, None))
            .unwrap();
        ledger
            .append(b, RunEvent::status_changed(RunStatus::Failed, Some("x".into())))
            .unwrap();

        let all = ledger.list_runs(&RunFilter::default()).unwrap();
        assert_eq!(all.len(), 2);

        let failed = ledger
            .list_runs(&RunFilter {
                status: Some(RunStatus::Failed),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].name, "beta");
    }

    #[test]
    fn appends_for_different_runs_are_independent() {
        let ledger = MemoryLedger::new();
        let a = submit(&ledger, "a");
        let b = submit(&ledger, "b");

        ledger
            .append(a, RunEvent::status_changed(RunStatus::Running, None))
            .unwrap();

        assert_eq!(ledger.records(a).len(), 2);
        assert_eq!(ledger.records(b).len(), 1);
    }
}
