//! # Agent Handoff Coordination
//!
//! A workflow is partitioned into contiguous agent spans by a routing
//! policy, and agents exchange state only through the `HandoffContext`.
//! There are no live agent objects: a span's writes are collected into a
//! `ContextDelta` and merged into the cumulative context at the handoff
//! boundary, where slot ownership is enforced.
//!
//! ## Design
//!
//! Ownership is checked twice. Before a span starts, the slots its steps
//! can write are projected from the step kinds and checked against the
//! agent's declaration, so a misconfigured span fails with zero of its
//! steps executed. The merge itself re-checks each written slot, which
//! also covers dynamic slot names that projection cannot see.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::driver::SessionHandle;
use crate::error::StrandError;
use crate::ledger::{ExecutionLedger, RunEvent};
use crate::machine::{CancelFlag, SpanResult, StateMachine};
use crate::run::{RunId, RunStatus};
use crate::step::{StepKind, WorkflowDefinition};

// ============================================================================
// WELL-KNOWN SLOTS
// ============================================================================

/// Written by `navigate`: the URL the session landed on.
pub const SLOT_CURRENT_URL: &str = "current_url";
/// Written by `navigate`: cookies visible to the session after the load.
pub const SLOT_SESSION_COOKIES: &str = "session_cookies";
/// Written by `screenshot`: reference to the most recent capture.
pub const SLOT_LAST_SCREENSHOT: &str = "last_screenshot";
/// Default target slot for `extract` steps.
pub const SLOT_EXTRACTED_FIELDS: &str = "extracted_fields";

// ============================================================================
// CONTEXT
// ============================================================================

/// A slot's value together with the agent that last wrote it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotEntry {
    pub value: Value,
    pub owner: String,
}

/// The only channel between agents: named slots with recorded ownership.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandoffContext {
    slots: BTreeMap<String, SlotEntry>,
}

impl HandoffContext {
    pub fn get(&self, slot: &str) -> Option<&Value> {
        self.slots.get(slot).map(|e| &e.value)
    }

    pub fn owner_of(&self, slot: &str) -> Option<&str> {
        self.slots.get(slot).map(|e| e.owner.as_str())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Merge a span's writes, enforcing that the writing agent declared
    /// every slot it touches. Writing a declared slot claims ownership.
    pub fn apply(
        &mut self,
        agent: &str,
        owns: &[String],
        delta: &ContextDelta,
    ) -> Result<(), StrandError> {
        for (slot, value) in &delta.entries {
            if !owns.iter().any(|o| o == slot) {
                return Err(StrandError::SlotViolation {
                    slot: slot.clone(),
                    agent: agent.to_string(),
                    owner: self
                        .owner_of(slot)
                        .unwrap_or("nobody")
                        .to_string(),
                });
            }
            self.slots.insert(
                slot.clone(),
                SlotEntry {
                    value: value.clone(),
                    owner: agent.to_string(),
                },
            );
        }
        Ok(())
    }
}

/// Slots written during one span, merged into the context at handoff.
#[derive(Debug, Clone, Default)]
pub struct ContextDelta {
    entries: BTreeMap<String, Value>,
}

impl ContextDelta {
    pub fn get(&self, slot: &str) -> Option<&Value> {
        self.entries.get(slot)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn slots(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Record a successful step's writes. Only kinds with declared output
    /// slots touch the delta; repeated `extract` writes to one slot merge
    /// shallowly when both values are objects.
    pub fn record_step(&mut self, kind: &StepKind, payload: &Value, session: &SessionHandle) {
        match kind {
            StepKind::Navigate { url } => {
                let url = session
                    .current_url
                    .clone()
                    .unwrap_or_else(|| url.clone());
                self.entries
                    .insert(SLOT_CURRENT_URL.to_string(), Value::String(url));
                self.entries.insert(
                    SLOT_SESSION_COOKIES.to_string(),
                    serde_json::to_value(&session.cookies).unwrap_or(Value::Null),
                );
            }
            StepKind::Extract { slot, .. } => {
                let merged = match (self.entries.get(slot), payload) {
                    (Some(Value::Object(existing)), Value::Object(new)) => {
                        let mut merged = existing.clone();
                        merged.extend(new.clone());
                        Value::Object(merged)
                    }
                    _ => payload.clone(),
                };
                self.entries.insert(slot.clone(), merged);
            }
            StepKind::Screenshot { .. } => {
                self.entries
                    .insert(SLOT_LAST_SCREENSHOT.to_string(), payload.clone());
            }
            StepKind::Click { .. }
            | StepKind::Fill { .. }
            | StepKind::Wait { .. }
            | StepKind::Noop => {}
        }
    }
}

// ============================================================================
// ROUTING
// ============================================================================

/// An agent and the context slots it may write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDecl {
    pub name: String,
    #[serde(default)]
    pub owns: Vec<String>,
}

/// Routes a set of step kinds to one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindAssignment {
    pub kinds: Vec<String>,
    pub agent: String,
}

/// Static routing table: which agent handles which step kinds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingPolicy {
    #[serde(default)]
    pub assignments: Vec<KindAssignment>,
    #[serde(default)]
    pub agents: Vec<AgentDecl>,
}

impl RoutingPolicy {
    /// Everything routed to one agent which owns the given slots. Useful
    /// for single-agent workflows and tests.
    pub fn single_agent(name: impl Into<String>, owns: Vec<String>) -> Self {
        let name = name.into();
        Self {
            assignments: vec![KindAssignment {
                kinds: StepKind::ALL.iter().map(|k| k.to_string()).collect(),
                agent: name.clone(),
            }],
            agents: vec![AgentDecl { name, owns }],
        }
    }

    pub fn agent_for_kind(&self, kind: &str) -> Option<&str> {
        self.assignments
            .iter()
            .find(|a| a.kinds.iter().any(|k| k == kind))
            .map(|a| a.agent.as_str())
    }

    pub fn declaration(&self, agent: &str) -> Option<&AgentDecl> {
        self.agents.iter().find(|a| a.name == agent)
    }

    /// Partition the definition into maximal contiguous same-agent spans,
    /// in step order. Fails when any step kind is unrouted.
    pub fn partition(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<Vec<AgentSpan>, StrandError> {
        let mut spans: Vec<AgentSpan> = Vec::new();

        for (index, step) in definition.steps.iter().enumerate() {
            let kind = step.kind.name();
            let agent = self.agent_for_kind(kind).ok_or_else(|| {
                StrandError::InvalidDefinition {
                    reason: format!("step {index}: no agent routed for kind '{kind}'"),
                }
            })?;

            match spans.last_mut() {
                Some(span) if span.agent == agent => span.end_step = index + 1,
                _ => spans.push(AgentSpan {
                    agent: agent.to_string(),
                    start_step: index,
                    end_step: index + 1,
                }),
            }
        }

        Ok(spans)
    }
}

/// A contiguous run of steps handled by one agent: `start_step` inclusive,
/// `end_step` exclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpan {
    pub agent: String,
    pub start_step: usize,
    pub end_step: usize,
}

/// Slots a span can write, projected from its step kinds. `fill`, `click`,
/// `wait` and `noop` never write the context, so they project nothing.
pub fn span_write_slots(definition: &WorkflowDefinition, span: &AgentSpan) -> BTreeSet<String> {
    let mut slots = BTreeSet::new();
    for step in &definition.steps[span.start_step..span.end_step] {
        match &step.kind {
            StepKind::Navigate { .. } => {
                slots.insert(SLOT_CURRENT_URL.to_string());
                slots.insert(SLOT_SESSION_COOKIES.to_string());
            }
            StepKind::Extract { slot, .. } => {
                slots.insert(slot.clone());
            }
            StepKind::Screenshot { .. } => {
                slots.insert(SLOT_LAST_SCREENSHOT.to_string());
            }
            _ => {}
        }
    }
    slots
}

// ============================================================================
// COORDINATOR
// ============================================================================

/// Drives a run span by span: state machine for the steps, ledger for the
/// status and handoff transitions.
pub struct HandoffCoordinator {
    machine: StateMachine,
    ledger: Arc<dyn ExecutionLedger>,
}

impl HandoffCoordinator {
    pub fn new(machine: StateMachine, ledger: Arc<dyn ExecutionLedger>) -> Self {
        Self { machine, ledger }
    }

    /// Execute the whole run. The returned status is already committed to
    /// the ledger; `Err` means a ledger append itself failed.
    #[instrument(skip_all, fields(run_id = %run_id, workflow = %definition.name))]
    pub async fn run(
        &self,
        run_id: RunId,
        definition: &WorkflowDefinition,
        policy: &RoutingPolicy,
        mut session: SessionHandle,
        cancel: &CancelFlag,
    ) -> Result<RunStatus, StrandError> {
        let spans = match policy.partition(definition) {
            Ok(spans) => spans,
            Err(e) => return self.finish(run_id, RunStatus::Failed, Some(e.to_string())),
        };

        if cancel.is_set() {
            return self.finish(
                run_id,
                RunStatus::Cancelled,
                Some("cancelled before start".into()),
            );
        }

        self.ledger
            .append(run_id, RunEvent::status_changed(RunStatus::Running, None))?;
        info!(spans = spans.len(), "run started");

        let mut context = HandoffContext::default();
        let run_started = Instant::now();

        for (span_index, span) in spans.iter().enumerate() {
            if cancel.is_set() {
                return self.finish(
                    run_id,
                    RunStatus::Cancelled,
                    Some(format!("cancelled at handoff boundary before span {span_index}")),
                );
            }

            let Some(decl) = policy.declaration(&span.agent) else {
                let e = StrandError::UnknownAgent {
                    agent: span.agent.clone(),
                };
                return self.finish(run_id, RunStatus::Failed, Some(e.to_string()));
            };

            // Reject a misdeclared span before any of its steps run.
            for slot in span_write_slots(definition, span) {
                if !decl.owns.iter().any(|o| *o == slot) {
                    let e = StrandError::SlotViolation {
                        slot: slot.clone(),
                        agent: span.agent.clone(),
                        owner: context.owner_of(&slot).unwrap_or("nobody").to_string(),
                    };
                    warn!(span_index, agent = %span.agent, %slot, "span rejected by ownership check");
                    return self.finish(run_id, RunStatus::Failed, Some(e.to_string()));
                }
            }

            self.ledger
                .append(run_id, RunEvent::span_started(span_index, &span.agent))?;
            debug!(span_index, agent = %span.agent, start = span.start_step, end = span.end_step, "span started");

            match self
                .machine
                .execute_span(run_id, definition, span, &mut session, cancel, run_started)
                .await?
            {
                SpanResult::Completed(delta) => {
                    if let Err(e) = context.apply(&span.agent, &decl.owns, &delta) {
                        return self.finish(run_id, RunStatus::Failed, Some(e.to_string()));
                    }
                    self.ledger.append(
                        run_id,
                        RunEvent::Handoff {
                            span_index,
                            agent: span.agent.clone(),
                            context: context.clone(),
                            at: chrono::Utc::now(),
                        },
                    )?;
                    info!(span_index, agent = %span.agent, slots = context.len(), "handoff committed");
                }
                SpanResult::Failed(e) => {
                    return self.finish(run_id, RunStatus::Failed, Some(e.to_string()));
                }
                SpanResult::Cancelled => {
                    return self.finish(
                        run_id,
                        RunStatus::Cancelled,
                        Some(format!("cancelled during span {span_index}")),
                    );
                }
            }
        }

        self.finish(run_id, RunStatus::Succeeded, None)
    }

    fn finish(
        &self,
        run_id: RunId,
        status: RunStatus,
        reason: Option<String>,
    ) -> Result<RunStatus, StrandError> {
        self.ledger
            .append(run_id, RunEvent::status_changed(status, reason))?;
        info!(%run_id, ?status, "run finished");
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{StepKind, StepSpec};
    use serde_json::json;

    fn two_agent_policy() -> RoutingPolicy {
        RoutingPolicy {
            assignments: vec![
                KindAssignment {
                    kinds: vec!["navigate".into(), "click".into(), "fill".into(), "wait".into()],
                    agent: "browser".into(),
                },
                KindAssignment {
                    kinds: vec!["extract".into(), "screenshot".into(), "noop".into()],
                    agent: "scraper".into(),
                },
            ],
            agents: vec![
                AgentDecl {
                    name: "browser".into(),
                    owns: vec![SLOT_CURRENT_URL.into(), SLOT_SESSION_COOKIES.into()],
                },
                AgentDecl {
                    name: "scraper".into(),
                    owns: vec![SLOT_EXTRACTED_FIELDS.into(), SLOT_LAST_SCREENSHOT.into()],
                },
            ],
        }
    }

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::new(
            "scrape",
            vec![
                StepSpec::new(StepKind::Navigate {
                    url: "https://example.com".into(),
                }),
                StepSpec::new(StepKind::Click {
                    selector: "#accept".into(),
                }),
                StepSpec::new(StepKind::Extract {
                    selector: ".price".into(),
                    slot: SLOT_EXTRACTED_FIELDS.into(),
                }),
                StepSpec::new(StepKind::Screenshot { full_page: false }),
            ],
        )
    }

    #[test]
    fn partition_groups_contiguous_steps_by_agent() {
        let spans = two_agent_policy().partition(&definition()).unwrap();
        assert_eq!(
            spans,
            vec![
                AgentSpan {
                    agent: "browser".into(),
                    start_step: 0,
                    end_step: 2,
                },
                AgentSpan {
                    agent: "scraper".into(),
                    start_step: 2,
                    end_step: 4,
                },
            ]
        );
    }

    #[test]
    fn partition_splits_on_agent_alternation() {
        let definition = WorkflowDefinition::new(
            "alternating",
            vec![
                StepSpec::new(StepKind::Navigate {
                    url: "https://a.example".into(),
                }),
                StepSpec::new(StepKind::Extract {
                    selector: ".x".into(),
                    slot: SLOT_EXTRACTED_FIELDS.into(),
                }),
                StepSpec::new(StepKind::Navigate {
                    url: "https://b.example".into(),
                }),
            ],
        );
        let spans = two_agent_policy().partition(&definition).unwrap();
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].agent, "browser");
        assert_eq!(spans[1].agent, "scraper");
        assert_eq!(spans[2].agent, "browser");
    }

    #[test]
    fn partition_rejects_unrouted_kind() {
        let policy = RoutingPolicy {
            assignments: vec![KindAssignment {
                kinds: vec!["navigate".into()],
                agent: "browser".into(),
            }],
            agents: vec![],
        };
        let err = policy.partition(&definition()).unwrap_err();
        assert!(matches!(err, StrandError::InvalidDefinition { .. }));
    }

    #[test]
    fn apply_rejects_undeclared_slot_write() {
        let mut context = HandoffContext::default();
        let mut delta = ContextDelta::default();
        delta.entries.insert(
            SLOT_EXTRACTED_FIELDS.into(),
            json!({ "price": "9.99" }),
        );

        let err = context
            .apply("browser", &[SLOT_CURRENT_URL.into()], &delta)
            .unwrap_err();
        match err {
            StrandError::SlotViolation { slot, agent, owner } => {
                assert_eq!(slot, SLOT_EXTRACTED_FIELDS);
                assert_eq!(agent, "browser");
                assert_eq!(owner, "nobody");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(context.is_empty());
    }

    #[test]
    fn apply_records_ownership() {
        let mut context = HandoffContext::default();
        let mut delta = ContextDelta::default();
        delta
            .entries
            .insert(SLOT_CURRENT_URL.into(), json!("https://example.com"));

        context
            .apply("browser", &[SLOT_CURRENT_URL.into()], &delta)
            .unwrap();
        assert_eq!(context.owner_of(SLOT_CURRENT_URL), Some("browser"));
        assert_eq!(
            context.get(SLOT_CURRENT_URL),
            Some(&json!("https://example.com"))
        );
    }

    #[test]
    fn extract_writes_merge_shallowly_within_a_span() {
        let session = SessionHandle::new("s");
        let mut delta = ContextDelta::default();
        let kind = StepKind::Extract {
            selector: ".a".into(),
            slot: SLOT_EXTRACTED_FIELDS.into(),
        };

        delta.record_step(&kind, &json!({ "title": "Widget" }), &session);
        delta.record_step(&kind, &json!({ "price": "9.99" }), &session);

        assert_eq!(
            delta.get(SLOT_EXTRACTED_FIELDS),
            Some(&json!({ "title": "Widget", "price": "9.99" }))
        );
    }

    #[test]
    fn navigate_records_url_and_cookies() {
        let mut session = SessionHandle::new("s");
        session.current_url = Some("https://example.com/landing".into());
        session
            .cookies
            .insert("sid".into(), "abc123".into());

        let mut delta = ContextDelta::default();
        delta.record_step(
            &StepKind::Navigate {
                url: "https://example.com".into(),
            },
            &json!({}),
            &session,
        );

        assert_eq!(
            delta.get(SLOT_CURRENT_URL),
            Some(&json!("https://example.com/landing"))
        );
        assert_eq!(
            delta.get(SLOT_SESSION_COOKIES),
            Some(&json!({ "sid": "abc123" }))
        );
    }

    #[test]
    fn write_slot_projection_covers_output_kinds_only() {
        let policy = two_agent_policy();
        let definition = definition();
        let spans = policy.partition(&definition).unwrap();

        let browser = span_write_slots(&definition, &spans[0]);
        assert!(browser.contains(SLOT_CURRENT_URL));
        assert!(browser.contains(SLOT_SESSION_COOKIES));
        assert_eq!(browser.len(), 2);

        let scraper = span_write_slots(&definition, &spans[1]);
        assert!(scraper.contains(SLOT_EXTRACTED_FIELDS));
        assert!(scraper.contains(SLOT_LAST_SCREENSHOT));
    }
}
