//! Whole-profile execution and result aggregation.
//!
//! A run is strictly sequential: steps execute one at a time in dependency
//! order, each owning a fresh [`ExecutionContext`]. Step failures are
//! captured into [`StepResult`](crate::result::StepResult)s; only a
//! structurally broken profile makes [`PipelineExecutor::run`] return `Err`.

use crate::backend::BackendHealth;
use crate::config::Overrides;
use crate::context::ExecutionContext;
use crate::error::{DefinitionError, Result};
use crate::events::{emit, Event, EventHandler};
use crate::profile::{self, Profile, METADATA_KEY};
use crate::result::{PipelineResult, RunError, RunMetadata, StepResult};
use crate::retry::RetryPolicy;
use crate::selector::BackendSelector;
use crate::step::{was_cancelled, StepExecutor};
use serde_json::Map;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

/// Runs profiles against a set of backends.
///
/// Cheap to clone; independent runs share only the read-only backend
/// registry.
///
/// # Example
///
/// ```
/// use llm_profile_engine::backend::MockBackend;
/// use llm_profile_engine::executor::PipelineExecutor;
/// use llm_profile_engine::selector::BackendSelector;
/// use llm_profile_engine::retry::RetryPolicy;
/// use std::sync::Arc;
///
/// let selector = BackendSelector::new()
///     .with_backend(Arc::new(MockBackend::fixed("local", "ok")));
/// let executor = PipelineExecutor::new(selector)
///     .with_retry_policy(RetryPolicy::immediate());
/// ```
#[derive(Debug, Clone)]
pub struct PipelineExecutor {
    steps: StepExecutor,
}

impl PipelineExecutor {
    pub fn new(selector: BackendSelector) -> Self {
        Self {
            steps: StepExecutor::new(Arc::new(selector)),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.steps = self.steps.with_retry_policy(retry);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.steps = self.steps.with_event_handler(handler);
        self
    }

    /// Checked before every step and before every retry sleep.
    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.steps = self.steps.with_cancellation(flag);
        self
    }

    pub fn selector(&self) -> &BackendSelector {
        self.steps.selector()
    }

    /// Every definition problem in `profile`, for use before a run.
    pub fn validate(&self, profile: &Profile) -> Vec<DefinitionError> {
        profile::validate(profile)
    }

    /// Health of every configured backend.
    pub async fn backend_status(&self) -> BTreeMap<String, BackendHealth> {
        self.selector().status().await
    }

    /// Execute `profile` on `input`.
    ///
    /// Returns `Err` only for cycles, duplicate ids or missing
    /// dependencies. Every other failure is reported through the returned
    /// [`PipelineResult`].
    pub async fn run(
        &self,
        profile: &Profile,
        input: &str,
        overrides: &Overrides,
    ) -> Result<PipelineResult> {
        let span = tracing::info_span!("run", profile_id = %profile.id);
        self.run_inner(profile, input, overrides)
            .instrument(span)
            .await
    }

    async fn run_inner(
        &self,
        profile: &Profile,
        input: &str,
        overrides: &Overrides,
    ) -> Result<PipelineResult> {
        let started = Instant::now();
        let events = self.steps.events();

        let order = profile::compute_order(profile)?;
        let mut context = ExecutionContext::new(input);

        let unresolved = profile::unresolved_in_order(profile, &order);
        if !unresolved.is_empty() {
            tracing::error!(?unresolved, "profile has unresolved variables, nothing executed");
            let error = RunError::InvalidProfile { unresolved };
            return self.finish(profile, Vec::new(), context, Some(error), started);
        }

        tracing::info!(steps = order.len(), ?order, "starting run");
        emit(
            events,
            Event::RunStart {
                profile_id: profile.id.clone(),
                order: order.clone(),
            },
        );

        let mut results: Vec<StepResult> = Vec::with_capacity(order.len());
        let mut error = None;

        for (index, id) in order.iter().enumerate() {
            if self.steps.is_cancelled() {
                tracing::warn!(next_step = %id, "run cancelled");
                error = Some(RunError::Cancelled {
                    before_step: Some(id.clone()),
                    during_step: None,
                });
                break;
            }
            let Some(step) = profile.get_step(id) else {
                continue;
            };

            let result = self.steps.run(step, &mut context, overrides).await;
            let cancelled = was_cancelled(&result);
            let failed = !result.success;
            let message = result.error.clone().unwrap_or_default();
            results.push(result);

            if cancelled {
                let next = order.get(index + 1).cloned();
                tracing::warn!(step_id = %id, next_step = ?next, "run cancelled mid-step");
                error = Some(RunError::Cancelled {
                    before_step: next,
                    during_step: Some(id.clone()),
                });
                break;
            }
            if failed && step.required {
                error = Some(RunError::StepFailed {
                    step_id: id.clone(),
                    message,
                });
                break;
            }
            if failed {
                tracing::warn!(step_id = %id, "optional step failed, continuing");
            }
        }

        self.finish(profile, results, context, error, started)
    }

    fn finish(
        &self,
        profile: &Profile,
        steps: Vec<StepResult>,
        context: ExecutionContext,
        error: Option<RunError>,
        started: Instant,
    ) -> Result<PipelineResult> {
        let elapsed = started.elapsed();
        let metadata = RunMetadata::collect(profile, &steps, elapsed);

        let mut output = Map::new();
        for step in steps.iter().filter(|s| s.success) {
            if !profile.includes_in_output(&step.step_id) {
                continue;
            }
            if let Some(ref value) = step.output {
                output.insert(step.step_id.clone(), value.clone());
            }
        }
        output.insert(METADATA_KEY.to_string(), serde_json::to_value(&metadata)?);

        let success = error.is_none();
        match error {
            None => tracing::info!(
                elapsed_ms = elapsed.as_millis() as u64,
                tokens = metadata.total_tokens,
                "run completed"
            ),
            Some(ref e) => tracing::error!(error = %e, "run failed"),
        }
        emit(
            self.steps.events(),
            Event::RunEnd {
                profile_id: profile.id.clone(),
                success,
                elapsed,
            },
        );

        Ok(PipelineResult {
            profile_id: profile.id.clone(),
            success,
            steps,
            output,
            metadata,
            error,
            context,
        })
    }
}

/// Convenience for one-off runs without overrides.
pub async fn run_profile(
    executor: &PipelineExecutor,
    profile: &Profile,
    input: &str,
) -> Result<PipelineResult> {
    executor.run(profile, input, &Overrides::default()).await
}
