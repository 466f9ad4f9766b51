//! # Workflow State Machine
//!
//! Executes one agent span's steps strictly in definition order, with the
//! ledger as the commit point: every step transition is appended before it
//! becomes visible to any reader.
//!
//! Per step, the loop is: Queued -> InFlight -> terminal, then on failure
//! the unsafe-retry guard and the retry policy decide whether a new attempt
//! (attempt number + 1) is scheduled after a backoff delay. Cancellation is
//! observed at step boundaries and on resumption from backoff; an in-flight
//! action runs to completion or its own timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, instrument, warn};

use crate::config::EngineConfig;
use crate::driver::{ActionExecutor, SessionHandle};
use crate::error::StrandError;
use crate::handoff::{AgentSpan, ContextDelta};
use crate::ledger::{ExecutionLedger, RunEvent};
use crate::retry::RetryPolicy;
use crate::run::{RunId, StepExecution};
use crate::step::WorkflowDefinition;

/// Courtesy cancellation: set once, observed at step boundaries.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How a span ended.
#[derive(Debug)]
pub enum SpanResult {
    /// Every step succeeded; the delta holds the slots this span wrote.
    Completed(ContextDelta),
    /// A step failed terminally; remaining steps were not started.
    Failed(StrandError),
    /// Cancellation observed at a step boundary.
    Cancelled,
}

/// Owns all mutation of a run's step records for the span it executes.
/// One instance serves many runs; per-run exclusivity comes from each run
/// living on its own task.
#[derive(Clone)]
pub struct StateMachine {
    executor: ActionExecutor,
    ledger: Arc<dyn ExecutionLedger>,
    retry: RetryPolicy,
    config: EngineConfig,
}

impl StateMachine {
    pub fn new(
        executor: ActionExecutor,
        ledger: Arc<dyn ExecutionLedger>,
        config: EngineConfig,
    ) -> Self {
        Self {
            executor,
            ledger,
            retry: RetryPolicy::new(config.retry.clone()),
            config,
        }
    }

    /// Execute the span's steps in order. The only `Err` is a ledger append
    /// failure; step failures come back as `SpanResult::Failed`.
    #[instrument(skip_all, fields(run_id = %run_id, agent = %span.agent, start = span.start_step, end = span.end_step))]
    pub async fn execute_span(
        &self,
        run_id: RunId,
        definition: &WorkflowDefinition,
        span: &AgentSpan,
        session: &mut SessionHandle,
        cancel: &CancelFlag,
        run_started: Instant,
    ) -> Result<SpanResult, StrandError> {
        let mut delta = ContextDelta::default();

        for step_index in span.start_step..span.end_step {
            if cancel.is_set() {
                debug!(step_index, "cancellation observed at step boundary");
                return Ok(SpanResult::Cancelled);
            }

            if run_started.elapsed() > self.config.max_run_duration {
                return Ok(SpanResult::Failed(StrandError::RunTimeout {
                    elapsed_ms: run_started.elapsed().as_millis() as u64,
                }));
            }

            match self
                .execute_step(run_id, definition, step_index, session, cancel, &mut delta)
                .await?
            {
                StepOutcome::Succeeded => {}
                StepOutcome::Failed(error) => return Ok(SpanResult::Failed(error)),
                StepOutcome::Cancelled => return Ok(SpanResult::Cancelled),
            }
        }

        Ok(SpanResult::Completed(delta))
    }

    /// Attempt loop for one step.
    async fn execute_step(
        &self,
        run_id: RunId,
        definition: &WorkflowDefinition,
        step_index: usize,
        session: &mut SessionHandle,
        cancel: &CancelFlag,
        delta: &mut ContextDelta,
    ) -> Result<StepOutcome, StrandError> {
        let spec = &definition.steps[step_index];
        let max_retries = spec.max_retries_or(self.config.default_max_retries);
        let mut attempt = 1u32;

        loop {
            self.ledger
                .append(run_id, RunEvent::Step {
                    exec: StepExecution::queued(step_index, attempt),
                })?;

            let in_flight = StepExecution::in_flight(step_index, attempt);
            let started_at = in_flight.started_at.unwrap_or_else(Utc::now);
            self.ledger
                .append(run_id, RunEvent::Step { exec: in_flight })?;

            match self.executor.execute(spec, session).await {
                Ok(payload) => {
                    let size = payload.to_string().len();
                    if size > self.config.max_payload_size {
                        let error = StrandError::PayloadTooLarge {
                            step_index,
                            size,
                            limit: self.config.max_payload_size,
                        };
                        self.ledger.append(run_id, RunEvent::Step {
                            exec: StepExecution::failed(
                                step_index,
                                attempt,
                                crate::run::StepError {
                                    kind: crate::error::FailureKind::Validation,
                                    message: error.to_string(),
                                },
                                started_at,
                            ),
                        })?;
                        return Ok(StepOutcome::Failed(error));
                    }

                    self.ledger.append(run_id, RunEvent::Step {
                        exec: StepExecution::succeeded(
                            step_index,
                            attempt,
                            payload.clone(),
                            started_at,
                        ),
                    })?;
                    delta.record_step(&spec.kind, &payload, session);
                    debug!(step_index, attempt, "step succeeded");
                    return Ok(StepOutcome::Succeeded);
                }
                Err(step_error) => {
                    warn!(step_index, attempt, error = %step_error, "step attempt failed");
                    self.ledger.append(run_id, RunEvent::Step {
                        exec: StepExecution::failed(
                            step_index,
                            attempt,
                            step_error.clone(),
                            started_at,
                        ),
                    })?;

                    let decision = self.retry.decide(max_retries, attempt, step_error.kind);
                    if !decision.should_retry {
                        return Ok(StepOutcome::Failed(StrandError::Action {
                            kind: step_error.kind,
                            message: format!("{}: {}", decision.reason, step_error.message),
                        }));
                    }

                    // Unsafe-retry guard: a retry is due, but a non-idempotent
                    // step whose failed attempt may have taken effect is only
                    // retried when the driver positively confirms it did not.
                    if !spec.is_idempotent() && step_error.kind.is_ambiguous() {
                        let clean = self.executor.confirm_clean(spec, session).await;
                        if !clean {
                            return Ok(StepOutcome::Failed(StrandError::UnsafeRetry {
                                step_index,
                            }));
                        }
                        debug!(step_index, attempt, "driver confirmed attempt left no effect");
                    }

                    debug!(step_index, attempt, delay = ?decision.delay, "backing off before retry");
                    tokio::time::sleep(decision.delay).await;

                    // Cancellation is re-checked on resumption from backoff.
                    if cancel.is_set() {
                        return Ok(StepOutcome::Cancelled);
                    }

                    attempt += 1;
                }
            }
        }
    }
}

enum StepOutcome {
    Succeeded,
    Failed(StrandError),
    Cancelled,
}
