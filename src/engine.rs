//! # Orchestration Facade
//!
//! One entry point for callers: submit a workflow, poll its state, cancel
//! it, wait for it. Each accepted run executes on its own tokio task; the
//! engine keeps only the in-process handles (cancel flag, join handle),
//! while all durable state lives in the ledger.
//!
//! ## Design
//!
//! `submit` validates and partitions up front so a malformed workflow is
//! rejected synchronously with nothing written to the ledger. Once the
//! `Submitted` event is appended the run exists and every later question
//! about it is answered by folding the ledger, not by in-memory state.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument};

use crate::config::EngineConfig;
use crate::driver::{ActionDriver, ActionExecutor, SessionHandle};
use crate::error::StrandError;
use crate::handoff::{HandoffCoordinator, RoutingPolicy};
use crate::ledger::{ExecutionLedger, RunEvent};
use crate::machine::{CancelFlag, StateMachine};
use crate::run::{RunFilter, RunId, RunStatus, RunSummary, WorkflowRun};
use crate::step::WorkflowDefinition;

/// In-process handles for a live run. Dropped state is recoverable from
/// the ledger; these only exist for cancellation and joining.
struct RunHandle {
    cancel: CancelFlag,
    join: Mutex<Option<JoinHandle<RunStatus>>>,
}

/// Workflow execution engine.
pub struct Engine {
    driver: Arc<dyn ActionDriver>,
    ledger: Arc<dyn ExecutionLedger>,
    config: EngineConfig,
    /// Live runs only; each entry is removed by its own task once the
    /// terminal status is committed.
    runs: Arc<DashMap<RunId, RunHandle>>,
}

impl Engine {
    pub fn new(
        driver: Arc<dyn ActionDriver>,
        ledger: Arc<dyn ExecutionLedger>,
        config: EngineConfig,
    ) -> Self {
        Self {
            driver,
            ledger,
            config,
            runs: Arc::new(DashMap::new()),
        }
    }

    /// Validate, persist and start a run. Returns as soon as the run is
    /// committed as `Pending`; execution proceeds on a background task.
    #[instrument(skip_all, fields(workflow = %definition.name, steps = definition.steps.len()))]
    pub fn submit(
        &self,
        definition: WorkflowDefinition,
        policy: RoutingPolicy,
        session: SessionHandle,
    ) -> Result<RunId, StrandError> {
        definition.validate()?;
        policy.partition(&definition)?;

        let run_id = RunId::new();
        self.ledger.append(
            run_id,
            RunEvent::Submitted {
                definition: definition.clone(),
                submitted_at: Utc::now(),
            },
        )?;
        self.ledger
            .append(run_id, RunEvent::status_changed(RunStatus::Pending, None))?;
        info!(%run_id, "run accepted");

        let cancel = CancelFlag::new();
        let task_cancel = cancel.clone();
        let ledger = self.ledger.clone();
        let executor = ActionExecutor::new(self.driver.clone(), self.config.default_step_timeout);
        let machine = StateMachine::new(executor, ledger.clone(), self.config.clone());

        // Registered before the task starts so the task can evict its own
        // entry once the terminal status is committed.
        self.runs.insert(
            run_id,
            RunHandle {
                cancel,
                join: Mutex::new(None),
            },
        );

        let runs = self.runs.clone();
        let join = tokio::spawn(async move {
            let coordinator = HandoffCoordinator::new(machine, ledger);
            let status = match coordinator
                .run(run_id, &definition, &policy, session, &task_cancel)
                .await
            {
                Ok(status) => status,
                Err(e) => {
                    error!(%run_id, error = %e, "run aborted on ledger failure");
                    RunStatus::Failed
                }
            };
            runs.remove(&run_id);
            status
        });

        if let Some(handle) = self.runs.get(&run_id) {
            *handle.join.lock() = Some(join);
        }
        Ok(run_id)
    }

    /// Current snapshot of the run, folded from the ledger.
    pub fn run_state(&self, run_id: RunId) -> Result<WorkflowRun, StrandError> {
        self.ledger.read_run(run_id)
    }

    /// Request cancellation. Returns `false` when the run has already
    /// reached a terminal state, `true` when the request was recorded.
    /// Cancellation is courteous: the run stops at its next step boundary.
    pub fn cancel(&self, run_id: RunId) -> Result<bool, StrandError> {
        let run = self.ledger.read_run(run_id)?;
        if run.status.is_terminal() {
            return Ok(false);
        }
        match self.runs.get(&run_id) {
            Some(handle) => {
                handle.cancel.set();
                info!(%run_id, "cancellation requested");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Wait for the run to reach a terminal status.
    pub async fn wait(&self, run_id: RunId) -> Result<RunStatus, StrandError> {
        let join = self
            .runs
            .get(&run_id)
            .and_then(|handle| handle.join.lock().take());

        if let Some(join) = join {
            if let Ok(status) = join.await {
                return Ok(status);
            }
        }
        Ok(self.ledger.read_run(run_id)?.status)
    }

    /// Summaries of known runs matching the filter, newest first.
    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunSummary>, StrandError> {
        self.ledger.list_runs(filter)
    }

    /// Number of runs that have not yet reached a terminal status.
    pub fn active_runs(&self) -> usize {
        self.runs.len()
    }
}
