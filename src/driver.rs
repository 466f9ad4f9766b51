//! # Action Driver Abstraction
//!
//! Trait and adapter for the external browser-automation capability.
//!
//! The engine never talks to a browser directly: a [`ActionDriver`]
//! implementation performs one action against a live page, and the
//! [`ActionExecutor`] adapter turns a workflow step into exactly one driver
//! call, enforcing the step timeout and normalizing every failure into a
//! [`FailureKind`]-classified [`StepError`].
//!
//! [`MockDriver`] is the in-crate test driver: scripted outcomes, call
//! counting, no real browser.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::error::FailureKind;
use crate::run::StepError;
use crate::step::{parse_duration, StepKind, StepSpec};

/// Browser session owned by exactly one run at a time.
///
/// Handing off between agents passes resume state (URL, cookies) through the
/// handoff context; the live handle itself never crosses task boundaries.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionHandle {
    pub id: String,
    pub current_url: Option<String>,
    pub cookies: BTreeMap<String, String>,
}

impl SessionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            current_url: None,
            cookies: BTreeMap::new(),
        }
    }
}

/// Classified failure reported by a driver.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct DriverError {
    pub kind: FailureKind,
    pub message: String,
}

impl DriverError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::TransientIo, message)
    }

    pub fn target_not_found(message: impl Into<String>) -> Self {
        Self::new(FailureKind::TargetNotFound, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Fatal, message)
    }
}

/// The external automation capability, consumed as an interface.
#[async_trait]
pub trait ActionDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Perform one action against the session's current page.
    ///
    /// May mutate session state (navigation, DOM); partial effects are not
    /// rolled back here.
    async fn execute(
        &self,
        step: &StepSpec,
        session: &mut SessionHandle,
    ) -> Result<Value, DriverError>;

    /// Positively confirm that a failed attempt of `step` left no observable
    /// side effect. Drivers that cannot tell must keep the default `false`.
    async fn confirm_clean(
        &self,
        _step: &StepSpec,
        _session: &SessionHandle,
    ) -> Result<bool, DriverError> {
        Ok(false)
    }
}

// ============================================================================
// EXECUTOR ADAPTER
// ============================================================================

/// Wraps the driver: one step in, one normalized result out.
#[derive(Clone)]
pub struct ActionExecutor {
    driver: std::sync::Arc<dyn ActionDriver>,
    default_timeout: Duration,
}

impl ActionExecutor {
    pub fn new(driver: std::sync::Arc<dyn ActionDriver>, default_timeout: Duration) -> Self {
        Self {
            driver,
            default_timeout,
        }
    }

    /// Execute one step with its timeout. Exceeding the timeout yields a
    /// `Timeout`-classified failure like any other driver failure.
    #[instrument(skip(self, step, session), fields(kind = %step.kind.name(), driver = %self.driver.name()))]
    pub async fn execute(
        &self,
        step: &StepSpec,
        session: &mut SessionHandle,
    ) -> Result<Value, StepError> {
        let timeout = step.timeout_or(self.default_timeout);
        debug!(?timeout, "dispatching action to driver");

        match tokio::time::timeout(timeout, self.driver.execute(step, session)).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(e)) => Err(StepError {
                kind: e.kind,
                message: e.message,
            }),
            Err(_) => Err(StepError {
                kind: FailureKind::Timeout,
                message: format!("action exceeded step timeout of {timeout:?}"),
            }),
        }
    }

    /// Ask the driver whether a failed attempt provably had no effect.
    /// Any driver error here counts as "cannot confirm".
    pub async fn confirm_clean(&self, step: &StepSpec, session: &SessionHandle) -> bool {
        match self.driver.confirm_clean(step, session).await {
            Ok(clean) => clean,
            Err(e) => {
                warn!(error = %e, "side-effect probe failed; treating attempt as dirty");
                false
            }
        }
    }
}

// ============================================================================
// MOCK DRIVER
// ============================================================================

/// Test driver with scripted outcomes, keyed by step kind.
///
/// Failures and payload overrides are FIFO queues per kind; when a queue is
/// empty the driver succeeds with a canned payload for that kind.
pub struct MockDriver {
    failures: Mutex<HashMap<String, Vec<DriverError>>>,
    payloads: Mutex<HashMap<String, Vec<Value>>>,
    stalls: Mutex<HashMap<String, Duration>>,
    calls: Mutex<HashMap<String, usize>>,
    total_calls: AtomicUsize,
    confirm_clean: std::sync::atomic::AtomicBool,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            payloads: Mutex::new(HashMap::new()),
            stalls: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            total_calls: AtomicUsize::new(0),
            confirm_clean: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Queue a failure for the next call of the given step kind.
    pub fn fail_next(&self, kind: &str, error: DriverError) {
        self.failures
            .lock()
            .unwrap()
            .entry(kind.to_string())
            .or_default()
            .push(error);
    }

    /// Queue `n` identical failures for the given step kind.
    pub fn fail_n(&self, kind: &str, n: usize, error: DriverError) {
        for _ in 0..n {
            self.fail_next(kind, error.clone());
        }
    }

    /// Override the success payload for the next call of the given kind.
    pub fn queue_payload(&self, kind: &str, payload: Value) {
        self.payloads
            .lock()
            .unwrap()
            .entry(kind.to_string())
            .or_default()
            .push(payload);
    }

    /// Make every call of the given kind sleep before responding, so the
    /// adapter's step timeout fires first.
    pub fn stall(&self, kind: &str, duration: Duration) {
        self.stalls
            .lock()
            .unwrap()
            .insert(kind.to_string(), duration);
    }

    /// Whether `confirm_clean` reports the prior attempt as effect-free.
    pub fn set_confirm_clean(&self, clean: bool) {
        self.confirm_clean.store(clean, Ordering::SeqCst);
    }

    pub fn call_count(&self, kind: &str) -> usize {
        self.calls.lock().unwrap().get(kind).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }

    fn record_call(&self, kind: &str) {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(kind.to_string())
            .or_insert(0) += 1;
        self.total_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn pop_failure(&self, kind: &str) -> Option<DriverError> {
        let mut failures = self.failures.lock().unwrap();
        let queue = failures.get_mut(kind)?;
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }

    fn pop_payload(&self, kind: &str) -> Option<Value> {
        let mut payloads = self.payloads.lock().unwrap();
        let queue = payloads.get_mut(kind)?;
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }

    fn default_payload(kind: &StepKind, session: &SessionHandle) -> Value {
        match kind {
            StepKind::Navigate { url } => json!({ "url": url }),
            StepKind::Click { selector } => json!({ "clicked": selector }),
            StepKind::Fill { selector, .. } => json!({ "filled": selector }),
            StepKind::Extract { selector, .. } => json!({ "selector": selector, "text": "mock" }),
            StepKind::Wait { .. } => Value::Null,
            StepKind::Screenshot { full_page } => {
                json!({ "image": "bW9jaw==", "full_page": full_page, "url": session.current_url })
            }
            StepKind::Noop => Value::Null,
        }
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionDriver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    async fn execute(
        &self,
        step: &StepSpec,
        session: &mut SessionHandle,
    ) -> Result<Value, DriverError> {
        let kind = step.kind.name();
        self.record_call(kind);

        let stall = self.stalls.lock().unwrap().get(kind).copied();
        if let Some(duration) = stall {
            tokio::time::sleep(duration).await;
        }

        if let Some(error) = self.pop_failure(kind) {
            return Err(error);
        }

        // Successful actions mutate the session the way a browser would.
        match &step.kind {
            StepKind::Navigate { url } => {
                session.current_url = Some(url.clone());
                session
                    .cookies
                    .insert("session".to_string(), format!("visited:{url}"));
            }
            StepKind::Wait { duration, .. } => {
                if let Some(d) = duration.as_deref().and_then(parse_duration) {
                    tokio::time::sleep(d).await;
                }
            }
            _ => {}
        }

        Ok(self
            .pop_payload(kind)
            .unwrap_or_else(|| Self::default_payload(&step.kind, session)))
    }

    async fn confirm_clean(
        &self,
        _step: &StepSpec,
        _session: &SessionHandle,
    ) -> Result<bool, DriverError> {
        Ok(self.confirm_clean.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn navigate_step() -> StepSpec {
        StepSpec::new(StepKind::Navigate {
            url: "https://example.com".into(),
        })
    }

    #[tokio::test]
    async fn mock_navigate_updates_session() {
        let driver = MockDriver::new();
        let mut session = SessionHandle::new("s1");

        let payload = driver.execute(&navigate_step(), &mut session).await.unwrap();

        assert_eq!(payload["url"], "https://example.com");
        assert_eq!(session.current_url.as_deref(), Some("https://example.com"));
        assert!(!session.cookies.is_empty());
        assert_eq!(driver.call_count("navigate"), 1);
    }

    #[tokio::test]
    async fn mock_scripted_failures_drain_in_order() {
        let driver = MockDriver::new();
        driver.fail_n("extract", 2, DriverError::transient("socket reset"));
        let mut session = SessionHandle::new("s1");

        let step = StepSpec::new(StepKind::Extract {
            selector: ".price".into(),
            slot: "extracted_fields".into(),
        });

        assert!(driver.execute(&step, &mut session).await.is_err());
        assert!(driver.execute(&step, &mut session).await.is_err());
        assert!(driver.execute(&step, &mut session).await.is_ok());
        assert_eq!(driver.call_count("extract"), 3);
    }

    #[tokio::test]
    async fn executor_classifies_timeout() {
        let driver = Arc::new(MockDriver::new());
        driver.stall("navigate", Duration::from_millis(100));
        let executor = ActionExecutor::new(driver, Duration::from_millis(10));
        let mut session = SessionHandle::new("s1");

        let err = executor
            .execute(&navigate_step(), &mut session)
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Timeout);
    }

    #[tokio::test]
    async fn executor_passes_through_classification() {
        let driver = Arc::new(MockDriver::new());
        driver.fail_next("click", DriverError::target_not_found("#gone"));
        let executor = ActionExecutor::new(driver, Duration::from_secs(1));
        let mut session = SessionHandle::new("s1");

        let step = StepSpec::new(StepKind::Click {
            selector: "#gone".into(),
        });
        let err = executor.execute(&step, &mut session).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::TargetNotFound);
        assert!(err.message.contains("#gone"));
    }

    #[tokio::test]
    async fn step_timeout_overrides_default() {
        let driver = Arc::new(MockDriver::new());
        driver.stall("noop", Duration::from_millis(50));
        let executor = ActionExecutor::new(driver, Duration::from_millis(5));
        let mut session = SessionHandle::new("s1");

        // Generous per-step timeout wins over the tight default.
        let step = StepSpec::new(StepKind::Noop).with_timeout("1s");
        assert!(executor.execute(&step, &mut session).await.is_ok());
    }

    #[tokio::test]
    async fn confirm_clean_defaults_to_dirty() {
        let driver = Arc::new(MockDriver::new());
        let executor = ActionExecutor::new(driver.clone(), Duration::from_secs(1));
        let session = SessionHandle::new("s1");
        let step = navigate_step();

        assert!(!executor.confirm_clean(&step, &session).await);
        driver.set_confirm_clean(true);
        assert!(executor.confirm_clean(&step, &session).await);
    }
}
