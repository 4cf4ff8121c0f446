//! Step and run results.
//!
//! Both are produced once and never mutated afterwards. Everything here is
//! `Serialize` so callers can persist run history however they like.

use crate::backend::Usage;
use crate::context::ExecutionContext;
use crate::error::ErrorKind;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

fn as_millis<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    pub step_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(rename = "latency_ms", serialize_with = "as_millis")]
    pub latency: Duration,
    /// Summed over every attempt that got a response.
    pub usage: Usage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Dispatch attempts made; zero when the step never reached a backend.
    pub attempts: u32,
    pub retry_count: u32,
}

impl StepResult {
    pub(crate) fn succeeded(
        step_id: impl Into<String>,
        output: Value,
        backend: String,
        model: String,
        usage: Usage,
        attempts: u32,
        latency: Duration,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            success: true,
            output: Some(output),
            error: None,
            error_kind: None,
            latency,
            usage,
            backend: Some(backend),
            model: Some(model),
            attempts,
            retry_count: attempts.saturating_sub(1),
        }
    }

    pub(crate) fn failed(
        step_id: impl Into<String>,
        error: String,
        kind: ErrorKind,
        attempts: u32,
        latency: Duration,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            success: false,
            output: None,
            error: Some(error),
            error_kind: Some(kind),
            latency,
            usage: Usage::default(),
            backend: None,
            model: None,
            attempts,
            retry_count: attempts.saturating_sub(1),
        }
    }

    pub(crate) fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    pub(crate) fn with_last_backend(mut self, backend: Option<String>, model: Option<String>) -> Self {
        self.backend = backend;
        self.model = model;
        self
    }
}

/// Per-step entry of [`RunMetadata`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepSummary {
    pub success: bool,
    #[serde(rename = "latency_ms", serialize_with = "as_millis")]
    pub latency: Duration,
    pub tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub retry_count: u32,
}

/// Totals and per-step summaries for a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunMetadata {
    pub profile_id: String,
    pub profile_name: String,
    pub profile_version: String,
    pub steps_completed: usize,
    pub steps_failed: usize,
    pub total_retries: u32,
    pub usage: Usage,
    pub total_tokens: u64,
    #[serde(rename = "total_execution_time_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
    pub step_summary: BTreeMap<String, StepSummary>,
}

impl RunMetadata {
    pub(crate) fn collect(
        profile: &crate::profile::Profile,
        steps: &[StepResult],
        elapsed: Duration,
    ) -> Self {
        let mut usage = Usage::default();
        let mut step_summary = BTreeMap::new();
        for s in steps {
            usage += s.usage;
            step_summary.insert(
                s.step_id.clone(),
                StepSummary {
                    success: s.success,
                    latency: s.latency,
                    tokens: s.usage.total(),
                    backend: s.backend.clone(),
                    model: s.model.clone(),
                    retry_count: s.retry_count,
                },
            );
        }
        Self {
            profile_id: profile.id.clone(),
            profile_name: profile.name.clone(),
            profile_version: profile.version.clone(),
            steps_completed: steps.iter().filter(|s| s.success).count(),
            steps_failed: steps.iter().filter(|s| !s.success).count(),
            total_retries: steps.iter().map(|s| s.retry_count).sum(),
            usage,
            total_tokens: usage.total(),
            elapsed,
            step_summary,
        }
    }
}

/// Why a run failed.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunError {
    /// Variable closure failed; no step was executed.
    #[error("profile validation failed, unresolved variables: {unresolved:?}")]
    InvalidProfile {
        unresolved: BTreeMap<String, Vec<String>>,
    },

    #[error("required step '{step_id}' failed: {message}")]
    StepFailed { step_id: String, message: String },

    /// `during_step` is set when a step was interrupted between retries;
    /// `before_step` is the first step that never started.
    #[error(
        "run cancelled {}before step '{}'",
        .during_step.as_deref().map(|s| format!("during step '{}', ", s)).unwrap_or_default(),
        .before_step.as_deref().unwrap_or("<end>")
    )]
    Cancelled {
        before_step: Option<String>,
        during_step: Option<String>,
    },
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub profile_id: String,
    pub success: bool,
    /// Every step result produced, in execution order.
    pub steps: Vec<StepResult>,
    /// Successful step outputs keyed by step id, plus `_metadata`.
    pub output: Map<String, Value>,
    pub metadata: RunMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub context: ExecutionContext,
}

impl PipelineResult {
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Id of the step that caused the run to fail, if any.
    pub fn failed_step(&self) -> Option<&str> {
        match self.error {
            Some(RunError::StepFailed { ref step_id, .. }) => Some(step_id.as_str()),
            _ => None,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.metadata.total_tokens
    }

    /// The error message, for callers that only want text.
    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{Profile, Step};
    use serde_json::json;

    #[test]
    fn test_retry_count_derived_from_attempts() {
        let ok = StepResult::succeeded(
            "a",
            json!("x"),
            "local".into(),
            "m".into(),
            Usage::new(1, 1),
            3,
            Duration::from_millis(5),
        );
        assert_eq!(ok.retry_count, 2);

        let never_dispatched = StepResult::failed(
            "b",
            "missing".into(),
            ErrorKind::Interpolation,
            0,
            Duration::ZERO,
        );
        assert_eq!(never_dispatched.retry_count, 0);
    }

    #[test]
    fn test_metadata_totals() {
        let profile = Profile::new("p", "P")
            .with_step(Step::new("a", "x"))
            .with_step(Step::new("b", "y"));
        let steps = vec![
            StepResult::succeeded(
                "a",
                json!(1),
                "local".into(),
                "m".into(),
                Usage::new(10, 5),
                2,
                Duration::from_millis(40),
            ),
            StepResult::failed("b", "boom".into(), ErrorKind::Backend, 1, Duration::from_millis(2))
                .with_usage(Usage::new(3, 0)),
        ];
        let meta = RunMetadata::collect(&profile, &steps, Duration::from_millis(50));
        assert_eq!(meta.steps_completed, 1);
        assert_eq!(meta.steps_failed, 1);
        assert_eq!(meta.total_retries, 1);
        assert_eq!(meta.total_tokens, 18);
        assert_eq!(meta.step_summary["a"].tokens, 15);

        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["total_execution_time_ms"], 50);
        assert_eq!(value["step_summary"]["a"]["latency_ms"], 40);
        assert_eq!(value["profile_version"], "1.0.0");
    }

    #[test]
    fn test_run_error_serialization() {
        let err = RunError::StepFailed {
            step_id: "extract".into(),
            message: "boom".into(),
        };
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"kind": "step_failed", "step_id": "extract", "message": "boom"})
        );
        assert!(err.to_string().contains("'extract'"));
    }
}
