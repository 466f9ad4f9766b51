//! Strand - browser-automation workflow engine with supervised agent handoffs

pub mod config;
pub mod driver;
pub mod engine;
pub mod error;
pub mod handoff;
pub mod ledger;
pub mod machine;
pub mod retry;
pub mod run;
pub mod step;

pub use config::EngineConfig;
pub use driver::{ActionDriver, ActionExecutor, DriverError, MockDriver, SessionHandle};
pub use engine::Engine;
pub use error::{FailureKind, StrandError};
pub use handoff::{
    AgentDecl, AgentSpan, ContextDelta, HandoffContext, HandoffCoordinator, KindAssignment,
    RoutingPolicy,
};
pub use ledger::{ExecutionLedger, JsonlLedger, LedgerRecord, MemoryLedger, RunEvent};
pub use machine::{CancelFlag, SpanResult, StateMachine};
pub use retry::{RetryConfig, RetryDecision, RetryPolicy};
pub use run::{
    RunFilter, RunId, RunStatus, RunSummary, StepError, StepExecution, StepStatus, WorkflowRun,
};
pub use step::{StepKind, StepSpec, WorkflowDefinition};
