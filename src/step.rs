//! Workflow definition structures
//!
//! A workflow is an ordered, immutable sequence of browser actions. Step
//! kinds form a closed set with typed parameter payloads so the executor
//! can match on them exhaustively.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StrandError;

/// The closed set of browser actions, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    Navigate {
        url: String,
    },
    Click {
        selector: String,
    },
    Fill {
        selector: String,
        value: String,
    },
    Extract {
        selector: String,
        /// Context slot the extracted value lands in at the next handoff.
        #[serde(default = "default_extract_slot")]
        slot: String,
    },
    Wait {
        /// Fixed pause, e.g. "500ms" or "2s".
        #[serde(default)]
        duration: Option<String>,
        /// Wait for a selector to appear instead of a fixed pause.
        #[serde(default)]
        selector: Option<String>,
    },
    Screenshot {
        #[serde(default)]
        full_page: bool,
    },
    Noop,
}

fn default_extract_slot() -> String {
    "extracted_fields".to_string()
}

impl StepKind {
    /// Every kind name, in declaration order. Routing policies that cover
    /// the whole action set are built from this.
    pub const ALL: [&'static str; 7] = [
        "navigate",
        "click",
        "fill",
        "extract",
        "wait",
        "screenshot",
        "noop",
    ];

    /// Step kind name used by routing policies and tracing.
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Navigate { .. } => "navigate",
            StepKind::Click { .. } => "click",
            StepKind::Fill { .. } => "fill",
            StepKind::Extract { .. } => "extract",
            StepKind::Wait { .. } => "wait",
            StepKind::Screenshot { .. } => "screenshot",
            StepKind::Noop => "noop",
        }
    }

    /// Whether re-running the action is harmless by construction.
    ///
    /// Clicks and form fills can submit or mutate page state, so they are
    /// only retried when the step opts in or the driver confirms the prior
    /// attempt had no effect.
    pub fn default_idempotent(&self) -> bool {
        !matches!(self, StepKind::Click { .. } | StepKind::Fill { .. })
    }
}

/// One action specification within a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    #[serde(flatten)]
    pub kind: StepKind,

    /// Per-step timeout, e.g. "30s". Falls back to the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Additional attempts allowed after the first failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Overrides the kind's default idempotency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotent: Option<bool>,
}

impl StepSpec {
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind,
            timeout: None,
            max_retries: None,
            idempotent: None,
        }
    }

    pub fn with_timeout(mut self, timeout: impl Into<String>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = Some(idempotent);
        self
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent.unwrap_or_else(|| self.kind.default_idempotent())
    }

    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout
            .as_deref()
            .and_then(parse_duration)
            .unwrap_or(default)
    }

    pub fn max_retries_or(&self, default: u32) -> u32 {
        self.max_retries.unwrap_or(default)
    }
}

/// Immutable workflow input: ordered step sequence, fixed at submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default = "default_workflow_name")]
    pub name: String,
    pub steps: Vec<StepSpec>,
}

fn default_workflow_name() -> String {
    "workflow".to_string()
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<StepSpec>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, StrandError> {
        let definition: WorkflowDefinition = serde_yaml::from_str(yaml)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Structural validation applied at submission time.
    pub fn validate(&self) -> Result<(), StrandError> {
        if self.steps.is_empty() {
            return Err(StrandError::InvalidDefinition {
                reason: "step sequence is empty".to_string(),
            });
        }

        for (index, step) in self.steps.iter().enumerate() {
            if let Some(timeout) = step.timeout.as_deref() {
                if parse_duration(timeout).is_none() {
                    return Err(StrandError::InvalidDefinition {
                        reason: format!("step {index}: unparseable timeout '{timeout}'"),
                    });
                }
            }

            if let StepKind::Wait { duration, selector } = &step.kind {
                match (duration.as_deref(), selector) {
                    (None, None) => {
                        return Err(StrandError::InvalidDefinition {
                            reason: format!("step {index}: wait needs a duration or a selector"),
                        });
                    }
                    (Some(d), _) if parse_duration(d).is_none() => {
                        return Err(StrandError::InvalidDefinition {
                            reason: format!("step {index}: unparseable wait duration '{d}'"),
                        });
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }
}

/// Parse a duration string like "500ms", "30s", "5m", "1h" into a Duration.
/// Bare numbers are treated as seconds.
pub fn parse_duration(duration_str: &str) -> Option<Duration> {
    let s = duration_str.trim();
    if s.is_empty() {
        return None;
    }

    if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(secs) = s.strip_suffix('s') {
        return secs.parse::<u64>().ok().map(Duration::from_secs);
    }
    if let Some(mins) = s.strip_suffix('m') {
        return mins
            .parse::<u64>()
            .ok()
            .map(|m| Duration::from_secs(m * 60));
    }
    if let Some(hours) = s.strip_suffix('h') {
        return hours
            .parse::<u64>()
            .ok()
            .map(|h| Duration::from_secs(h * 3600));
    }

    s.parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn definition_from_yaml() {
        let yaml = r##"
name: checkout-price
steps:
  - kind: navigate
    url: "https://shop.example.com/item/42"
    timeout: 30s
  - kind: extract
    selector: ".price"
    slot: extracted_fields
    max_retries: 2
  - kind: click
    selector: "#add-to-cart"
"##;
        let definition = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert_eq!(definition.name, "checkout-price");
        assert_eq!(definition.steps.len(), 3);
        assert_eq!(definition.steps[0].kind.name(), "navigate");
        assert_eq!(definition.steps[1].max_retries, Some(2));
        if let StepKind::Extract { slot, .. } = &definition.steps[1].kind {
            assert_eq!(slot, "extracted_fields");
        } else {
            panic!("expected extract step");
        }
    }

    #[test]
    fn empty_definition_rejected() {
        let definition = WorkflowDefinition::new("empty", vec![]);
        let err = definition.validate().unwrap_err();
        assert!(matches!(err, StrandError::InvalidDefinition { .. }));
    }

    #[test]
    fn wait_requires_duration_or_selector() {
        let definition = WorkflowDefinition::new(
            "w",
            vec![StepSpec::new(StepKind::Wait {
                duration: None,
                selector: None,
            })],
        );
        assert!(definition.validate().is_err());

        let definition = WorkflowDefinition::new(
            "w",
            vec![StepSpec::new(StepKind::Wait {
                duration: Some("2s".into()),
                selector: None,
            })],
        );
        assert!(definition.validate().is_ok());
    }

    #[test]
    fn bad_timeout_rejected() {
        let definition = WorkflowDefinition::new(
            "w",
            vec![StepSpec::new(StepKind::Noop).with_timeout("whenever")],
        );
        assert!(definition.validate().is_err());
    }

    #[test]
    fn idempotency_defaults_per_kind() {
        let navigate = StepSpec::new(StepKind::Navigate {
            url: "https://example.com".into(),
        });
        assert!(navigate.is_idempotent());

        let click = StepSpec::new(StepKind::Click {
            selector: "#submit".into(),
        });
        assert!(!click.is_idempotent());

        let click = click.with_idempotent(true);
        assert!(click.is_idempotent());
    }

    #[test]
    fn extract_slot_defaults() {
        let yaml = r#"
steps:
  - kind: extract
    selector: ".title"
"#;
        let definition = WorkflowDefinition::from_yaml(yaml).unwrap();
        if let StepKind::Extract { slot, .. } = &definition.steps[0].kind {
            assert_eq!(slot, "extracted_fields");
        } else {
            panic!("expected extract step");
        }
    }

    #[test]
    fn step_kind_roundtrips_through_json() {
        let spec = StepSpec::new(StepKind::Fill {
            selector: "#email".into(),
            value: "a@b.c".into(),
        })
        .with_max_retries(1);

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["kind"], "fill");
        assert_eq!(json["selector"], "#email");

        let back: StepSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }
}
