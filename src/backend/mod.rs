//! Backend trait and normalized request/response types.
//!
//! A [`Backend`] is one LLM service. The engine only ever talks to
//! `Arc<dyn Backend>`; adding a service means implementing the trait and
//! registering it with a [`BackendSelector`](crate::selector::BackendSelector).
//!
//! ```text
//! StepExecutor ──► GenerateRequest ──► Backend::generate() ──► GenerateResponse
//!                                             │
//!                               ┌─────────────┴─────────────┐
//!                         OllamaBackend               OpenAiBackend
//!                        /api/generate           /chat/completions
//!                        /api/tags (probe)       /models (probe)
//! ```

pub mod mock;
pub mod ollama;
#[cfg(feature = "openai")]
pub mod openai;

pub use mock::MockBackend;
pub use ollama::OllamaBackend;
#[cfg(feature = "openai")]
pub use openai::OpenAiBackend;

use crate::config::{ModelConfig, SamplingParams};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A provider-agnostic generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub prompt: String,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub sampling: SamplingParams,
}

impl GenerateRequest {
    /// Build a request from a resolved [`ModelConfig`].
    pub fn new(prompt: impl Into<String>, config: &ModelConfig) -> Self {
        Self {
            prompt: prompt.into(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: config.timeout(),
            sampling: config.sampling.clone(),
        }
    }
}

/// Token accounting for one or more calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
    }
}

/// A normalized generation response.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateResponse {
    pub content: String,
    pub usage: Usage,
    /// Name of the backend that answered.
    pub backend: String,
    /// Model the backend reports having used.
    pub model: String,
    pub latency: Duration,
}

/// Result of a liveness probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackendHealth {
    pub available: bool,
    pub latency: Duration,
    pub models: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BackendHealth {
    pub fn up(latency: Duration, models: Vec<String>) -> Self {
        Self {
            available: true,
            latency,
            models,
            error: None,
        }
    }

    pub fn down(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            available: false,
            latency,
            models: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Snapshot of a backend's request counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackendStats {
    pub requests: u64,
    pub failures: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Per-instance counters backing [`Backend::stats`].
#[derive(Debug, Default)]
pub struct StatsRecorder {
    requests: AtomicU64,
    failures: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

impl StatsRecorder {
    pub fn record_success(&self, usage: &Usage) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.prompt_tokens
            .fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens
            .fetch_add(usage.completion_tokens, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of `result` and pass it through.
    pub fn track(&self, result: Result<GenerateResponse>) -> Result<GenerateResponse> {
        match &result {
            Ok(resp) => self.record_success(&resp.usage),
            Err(_) => self.record_failure(),
        }
        result
    }

    pub fn snapshot(&self) -> BackendStats {
        BackendStats {
            requests: self.requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
        }
    }
}

/// Abstraction over LLM services.
///
/// This trait is object-safe and designed to be used as `Arc<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Registry name, e.g. `"local"` or `"openrouter"`.
    fn name(&self) -> &str;

    /// Run one completion.
    ///
    /// Failures carry a recoverable flag through
    /// [`PipelineError::is_recoverable`].
    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse>;

    /// Probe the service and list the models it serves.
    async fn check_health(&self) -> Result<BackendHealth>;

    /// Cheap liveness check. Probe errors are logged and reported as
    /// unavailable.
    async fn is_available(&self) -> bool {
        match self.check_health().await {
            Ok(health) => {
                if let Some(ref err) = health.error {
                    tracing::debug!(backend = self.name(), error = %err, "backend reported unhealthy");
                }
                health.available
            }
            Err(e) => {
                tracing::warn!(backend = self.name(), error = %e, "backend health probe failed");
                false
            }
        }
    }

    /// Request counters owned by this instance.
    fn stats(&self) -> BackendStats {
        BackendStats::default()
    }
}

/// Parse a `Retry-After` header value given in seconds.
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Convert a non-success HTTP response into an error.
pub(crate) async fn http_error(backend: &str, resp: reqwest::Response) -> PipelineError {
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    let body = error_message(&resp.text().await.unwrap_or_default());

    match status {
        401 | 403 => PipelineError::Backend {
            backend: backend.to_string(),
            message: format!("authentication failed (HTTP {}): {}", status, body),
            recoverable: false,
        },
        _ => PipelineError::HttpError {
            status,
            body,
            retry_after,
        },
    }
}

/// Pull the human-readable message out of `{"error": ...}` bodies.
fn error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.to_string();
    };
    let error = value.get("error");
    error
        .and_then(|e| e.get("message"))
        .or(error)
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}

/// Map a transport failure, distinguishing timeouts.
pub(crate) fn transport_error(backend: &str, timeout: Duration, err: reqwest::Error) -> PipelineError {
    if err.is_timeout() {
        PipelineError::Timeout {
            backend: backend.to_string(),
            after: timeout,
        }
    } else if err.is_connect() {
        PipelineError::Backend {
            backend: backend.to_string(),
            message: format!("cannot connect: {}", err),
            recoverable: true,
        }
    } else {
        PipelineError::Request(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_config() {
        let config = ModelConfig::default()
            .with_model("m")
            .with_temperature(0.0)
            .with_timeout_secs(12);
        let req = GenerateRequest::new("hi", &config);
        assert_eq!(req.prompt, "hi");
        assert_eq!(req.model, "m");
        assert_eq!(req.temperature, 0.0);
        assert_eq!(req.max_tokens, 2000);
        assert_eq!(req.timeout, Duration::from_secs(12));
    }

    #[test]
    fn test_usage_accumulates() {
        let mut usage = Usage::new(10, 5);
        usage += Usage::new(1, 2);
        assert_eq!(usage, Usage::new(11, 7));
        assert_eq!(usage.total(), 18);
    }

    #[test]
    fn test_stats_recorder() {
        let stats = StatsRecorder::default();
        stats.record_success(&Usage::new(3, 4));
        stats.record_failure();
        assert_eq!(
            stats.snapshot(),
            BackendStats {
                requests: 2,
                failures: 1,
                prompt_tokens: 3,
                completion_tokens: 4,
            }
        );
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(" 7 "), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message(r#"{"error": {"message": "quota exceeded", "code": 429}}"#),
            "quota exceeded"
        );
        assert_eq!(error_message(r#"{"error": "model not found"}"#), "model not found");
        assert_eq!(error_message("plain failure"), "plain failure");
    }
}
