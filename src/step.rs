//! Single-step execution with bounded retry.
//!
//! One attempt is: render the prompt, resolve the effective config, select a
//! backend, dispatch with the config's timeout, and validate the reply
//! against the step's output contract. Any failure inside an attempt is
//! retried (subject to [`RetryPolicy`]) up to the step's retry budget.

use crate::backend::{GenerateRequest, Usage};
use crate::config::{self, Overrides};
use crate::context::ExecutionContext;
use crate::error::{ErrorKind, InterpolationError, PipelineError, Result};
use crate::events::{emit, Event, EventHandler};
use crate::interpolate;
use crate::profile::Step;
use crate::result::StepResult;
use crate::retry::RetryPolicy;
use crate::selector::BackendSelector;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

/// What an attempt left behind, successful or not.
#[derive(Debug, Default)]
struct AttemptLog {
    usage: Usage,
    backend: Option<String>,
    model: Option<String>,
}

/// Runs one step against a [`BackendSelector`].
#[derive(Clone)]
pub struct StepExecutor {
    selector: Arc<BackendSelector>,
    retry: RetryPolicy,
    events: Option<Arc<dyn EventHandler>>,
    cancellation: Option<Arc<AtomicBool>>,
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("selector", &self.selector)
            .field("retry", &self.retry)
            .field("has_event_handler", &self.events.is_some())
            .field("has_cancellation", &self.cancellation.is_some())
            .finish()
    }
}

impl StepExecutor {
    pub fn new(selector: Arc<BackendSelector>) -> Self {
        Self {
            selector,
            retry: RetryPolicy::default(),
            events: None,
            cancellation: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.events = Some(handler);
        self
    }

    pub fn with_cancellation(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancellation = Some(flag);
        self
    }

    pub fn selector(&self) -> &BackendSelector {
        &self.selector
    }

    pub(crate) fn events(&self) -> &Option<Arc<dyn EventHandler>> {
        &self.events
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|c| c.load(Ordering::Relaxed))
    }

    /// Run `step`, recording its output into `context` on success when the
    /// step passes its output on.
    pub async fn run(
        &self,
        step: &Step,
        context: &mut ExecutionContext,
        overrides: &Overrides,
    ) -> StepResult {
        let span = tracing::info_span!("step", step_id = %step.id);
        self.run_inner(step, context, overrides).instrument(span).await
    }

    async fn run_inner(
        &self,
        step: &Step,
        context: &mut ExecutionContext,
        overrides: &Overrides,
    ) -> StepResult {
        let started = Instant::now();
        emit(
            &self.events,
            Event::StepStart {
                step_id: step.id.clone(),
            },
        );

        // A missing variable here is a definition bug: no dispatch, no retry.
        if let Ok(missing) = context.missing_for(step) {
            if !missing.is_empty() {
                let err = PipelineError::Interpolation(InterpolationError::MissingVariables(missing));
                tracing::error!(error = %err, "step preconditions not met");
                return self.finish(
                    step,
                    StepResult::failed(&step.id, err.to_string(), err.kind(), 0, started.elapsed()),
                );
            }
        }

        let max_attempts = step.retry_budget().saturating_add(1);
        let mut log = AttemptLog::default();
        let mut attempt = 0;

        let failure = loop {
            attempt += 1;
            match self.attempt(step, context, overrides, &mut log).await {
                Ok(output) => {
                    let latency = started.elapsed();
                    tracing::info!(
                        attempt,
                        latency_ms = latency.as_millis() as u64,
                        tokens = log.usage.total(),
                        "step completed"
                    );
                    if step.pass_to_next && !context.record(&step.id, output.clone()) {
                        tracing::warn!("output already recorded, keeping the first value");
                    }
                    let result = StepResult::succeeded(
                        &step.id,
                        output,
                        log.backend.take().unwrap_or_default(),
                        log.model.take().unwrap_or_default(),
                        log.usage,
                        attempt,
                        latency,
                    );
                    return self.finish(step, result);
                }
                Err(err) => {
                    let can_retry = attempt < max_attempts && self.retry.should_retry(&err);
                    let delay = can_retry.then(|| self.retry.delay_after(attempt, &err));
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        error = %err,
                        retry_in_ms = delay.map(|d| d.as_millis() as u64),
                        "step attempt failed"
                    );
                    emit(
                        &self.events,
                        Event::AttemptFailed {
                            step_id: step.id.clone(),
                            attempt,
                            error: err.to_string(),
                            delay,
                        },
                    );

                    let Some(delay) = delay else {
                        break err;
                    };
                    if self.is_cancelled() {
                        break PipelineError::Cancelled;
                    }
                    tokio::time::sleep(delay).await;
                    if self.is_cancelled() {
                        break PipelineError::Cancelled;
                    }
                }
            }
        };

        tracing::error!(attempts = attempt, error = %failure, "step failed permanently");
        let result = StepResult::failed(
            &step.id,
            failure.to_string(),
            failure.kind(),
            attempt,
            started.elapsed(),
        )
        .with_usage(log.usage)
        .with_last_backend(log.backend, log.model);
        self.finish(step, result)
    }

    fn finish(&self, step: &Step, result: StepResult) -> StepResult {
        emit(
            &self.events,
            Event::StepEnd {
                step_id: step.id.clone(),
                success: result.success,
                retry_count: result.retry_count,
                latency: result.latency,
            },
        );
        result
    }

    async fn attempt(
        &self,
        step: &Step,
        context: &ExecutionContext,
        overrides: &Overrides,
        log: &mut AttemptLog,
    ) -> Result<Value> {
        let prompt = interpolate::render(&step.prompt_template, &context.variables_for(step), true)?;
        let effective = config::resolve(&step.config, overrides, &step.id)?;
        let selection = self.selector.select(&effective).await?;

        if let Some(ref from) = selection.fell_back_from {
            emit(
                &self.events,
                Event::BackendFallback {
                    step_id: step.id.clone(),
                    from: from.clone(),
                    to: selection.config.backend.clone(),
                },
            );
        }

        let request = GenerateRequest::new(prompt, &selection.config);
        let backend_name = selection.backend.name().to_string();
        log.backend = Some(backend_name.clone());
        log.model = Some(request.model.clone());

        let response = tokio::time::timeout(request.timeout, selection.backend.generate(&request))
            .await
            .map_err(|_| PipelineError::Timeout {
                backend: backend_name,
                after: request.timeout,
            })??;

        log.usage += response.usage;
        log.model = Some(response.model.clone());
        tracing::debug!(
            backend = %response.backend,
            model = %response.model,
            latency_ms = response.latency.as_millis() as u64,
            "backend responded"
        );

        step.output.validate(&response.content)
    }
}

/// Whether `result` ended because of cancellation.
pub(crate) fn was_cancelled(result: &StepResult) -> bool {
    result.error_kind == Some(ErrorKind::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use crate::config::ModelConfig;
    use crate::events::FnEventHandler;
    use crate::output::OutputContract;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn executor(backends: Vec<Arc<MockBackend>>) -> StepExecutor {
        let selector = backends.into_iter().fold(
            BackendSelector::new().with_fallback_order(["local", "cloud"]),
            |s, b| s.with_backend(b),
        );
        StepExecutor::new(Arc::new(selector)).with_retry_policy(RetryPolicy::immediate())
    }

    fn local_step(id: &str, template: &str) -> Step {
        Step::new(id, template).with_config(ModelConfig::default().with_backend("local"))
    }

    #[tokio::test]
    async fn test_success_records_output() {
        let mock = Arc::new(MockBackend::fixed("local", r#"{"people": ["Alice", "Bob"]}"#));
        let exec = executor(vec![mock.clone()]);
        let step = local_step("extract", "Extract from {input}")
            .with_output(OutputContract::json_object(["people"]));
        let mut ctx = ExecutionContext::new("Alice met Bob on Monday.");

        let result = exec.run(&step, &mut ctx, &Overrides::default()).await;

        assert!(result.success);
        assert_eq!(result.output, Some(json!({"people": ["Alice", "Bob"]})));
        assert_eq!(result.backend.as_deref(), Some("local"));
        assert_eq!(result.model.as_deref(), Some("llama3.1:8b"));
        assert_eq!(result.attempts, 1);
        assert_eq!(result.retry_count, 0);
        assert_eq!(ctx.get("extract"), Some(&json!({"people": ["Alice", "Bob"]})));
        assert_eq!(mock.prompts(), vec!["Extract from Alice met Bob on Monday."]);
    }

    #[tokio::test]
    async fn test_private_step_not_recorded() {
        let exec = executor(vec![Arc::new(MockBackend::fixed("local", "done"))]);
        let step = local_step("s", "{input}")
            .with_output(OutputContract::text())
            .private();
        let mut ctx = ExecutionContext::new("x");
        assert!(exec.run(&step, &mut ctx, &Overrides::default()).await.success);
        assert!(ctx.get("s").is_none());
    }

    #[tokio::test]
    async fn test_permanent_failure_makes_bound_plus_one_attempts() {
        let mock = Arc::new(MockBackend::failing("local"));
        let exec = executor(vec![mock.clone()]);
        let step = local_step("s", "{input}").with_max_retries(3);
        let mut ctx = ExecutionContext::new("x");

        let result = exec.run(&step, &mut ctx, &Overrides::default()).await;

        assert!(!result.success);
        assert_eq!(mock.calls(), 4);
        assert_eq!(result.attempts, 4);
        assert_eq!(result.retry_count, 3);
        assert_eq!(result.error_kind, Some(ErrorKind::Backend));
        assert!(result.error.as_deref().unwrap().contains("scripted failure"));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let mock = Arc::new(
            MockBackend::new("local")
                .fail("reset", true)
                .reply("not json at all")
                .reply(r#"{"ok": true}"#),
        );
        let exec = executor(vec![mock.clone()]);
        let step = local_step("s", "{input}").with_output(OutputContract::json_object(["ok"]));
        let mut ctx = ExecutionContext::new("x");

        let result = exec.run(&step, &mut ctx, &Overrides::default()).await;

        assert!(result.success);
        assert_eq!(result.retry_count, 2);
        assert_eq!(mock.calls(), 3);
        // usage counts both answered attempts
        assert_eq!(result.usage.completion_tokens, 4 + 2);
    }

    #[tokio::test]
    async fn test_retry_disabled() {
        let mock = Arc::new(MockBackend::failing("local"));
        let exec = executor(vec![mock.clone()]);
        let step = local_step("s", "{input}").with_max_retries(5).without_retry();
        let result = exec
            .run(&step, &mut ExecutionContext::new("x"), &Overrides::default())
            .await;
        assert_eq!(mock.calls(), 1);
        assert_eq!(result.retry_count, 0);
    }

    #[tokio::test]
    async fn test_non_recoverable_skipped_when_policy_says_so() {
        let mock = Arc::new(MockBackend::new("local").fail("bad key", false));
        let exec = executor(vec![mock.clone()])
            .with_retry_policy(RetryPolicy::immediate().skip_non_recoverable());
        let step = local_step("s", "{input}").with_max_retries(3);
        let result = exec
            .run(&step, &mut ExecutionContext::new("x"), &Overrides::default())
            .await;
        assert!(!result.success);
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_huge_retry_bound_does_not_overflow() {
        let mock = Arc::new(MockBackend::new("local").fail("reset", true).reply("fine"));
        let exec = executor(vec![mock.clone()]);
        let step = local_step("s", "{input}")
            .with_output(OutputContract::text())
            .with_max_retries(u32::MAX);
        let result = exec
            .run(&step, &mut ExecutionContext::new("x"), &Overrides::default())
            .await;

        assert!(result.success);
        assert_eq!(mock.calls(), 2);
        assert_eq!(result.retry_count, 1);
    }

    #[tokio::test]
    async fn test_missing_variable_never_dispatches() {
        let mock = Arc::new(MockBackend::fixed("local", "x"));
        let exec = executor(vec![mock.clone()]);
        let step = local_step("b", "{a} {input}").depends_on(["a"]);
        let result = exec
            .run(&step, &mut ExecutionContext::new("x"), &Overrides::default())
            .await;

        assert!(!result.success);
        assert_eq!(result.attempts, 0);
        assert_eq!(result.retry_count, 0);
        assert_eq!(result.error_kind, Some(ErrorKind::Interpolation));
        assert_eq!(mock.calls(), 0);
        assert_eq!(mock.probes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_attempt_failure() {
        let mock = Arc::new(
            MockBackend::fixed("local", "late").with_latency(Duration::from_secs(60)),
        );
        let exec = executor(vec![mock.clone()]);
        let step = local_step("s", "{input}").with_max_retries(1);
        let result = exec
            .run(&step, &mut ExecutionContext::new("x"), &Overrides::default())
            .await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert_eq!(mock.calls(), 2);
    }

    #[tokio::test]
    async fn test_fallback_event_and_backend_recorded() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let exec = executor(vec![
            Arc::new(MockBackend::unavailable("local")),
            Arc::new(MockBackend::fixed("cloud", "hello")),
        ])
        .with_event_handler(Arc::new(FnEventHandler(move |e| sink.lock().unwrap().push(e))));

        let step = local_step("s", "{input}").with_output(OutputContract::text());
        let result = exec
            .run(&step, &mut ExecutionContext::new("x"), &Overrides::default())
            .await;

        assert!(result.success);
        assert_eq!(result.backend.as_deref(), Some("cloud"));
        let events = events.lock().unwrap();
        assert!(events.contains(&Event::BackendFallback {
            step_id: "s".into(),
            from: "local".into(),
            to: "cloud".into(),
        }));
        assert!(matches!(events.last(), Some(Event::StepEnd { success: true, .. })));
    }

    #[tokio::test]
    async fn test_invalid_override_is_attempt_failure() {
        let mock = Arc::new(MockBackend::fixed("local", "x"));
        let exec = executor(vec![mock.clone()]);
        let step = local_step("s", "{input}").with_max_retries(0);
        let overrides = Overrides::new().with_temperature(5.0);

        let result = exec
            .run(&step, &mut ExecutionContext::new("x"), &overrides)
            .await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::InvalidConfig));
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_stops_retries() {
        let flag = Arc::new(AtomicBool::new(false));
        let mock = Arc::new(MockBackend::failing("local"));
        let exec = executor(vec![mock.clone()]).with_cancellation(flag.clone());
        flag.store(true, Ordering::Relaxed);

        let step = local_step("s", "{input}").with_max_retries(5);
        let result = exec
            .run(&step, &mut ExecutionContext::new("x"), &Overrides::default())
            .await;

        assert!(was_cancelled(&result));
        assert_eq!(mock.calls(), 1);
    }
}
