//! Backend for OpenAI-compatible chat APIs (OpenRouter by default).
//!
//! Endpoint: `{base}/chat/completions`, always a single user message.
//! The liveness probe is an authenticated `GET {base}/models`.

use super::{
    http_error, transport_error, Backend, BackendHealth, BackendStats, GenerateRequest,
    GenerateResponse, StatsRecorder, Usage,
};
use crate::error::Result;
use crate::PipelineError;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use std::time::{Duration, Instant};

pub const DEFAULT_OPENROUTER_URL: &str = "https://openrouter.ai/api/v1";

/// Backend for any OpenAI-compatible API.
///
/// # Example
///
/// ```
/// use llm_profile_engine::backend::{Backend, OpenAiBackend};
///
/// let cloud = OpenAiBackend::openrouter("sk-or-...")
///     .with_app_name("Transcript Analyzer");
/// assert_eq!(cloud.name(), "openrouter");
/// assert!(cloud.has_api_key());
/// ```
pub struct OpenAiBackend {
    name: String,
    base_url: String,
    api_key: Option<String>,
    app_name: Option<String>,
    app_url: Option<String>,
    client: Client,
    probe_timeout: Duration,
    stats: StatsRecorder,
}

impl std::fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field(
                "api_key",
                &self.api_key.as_ref().map(|k| match k.get(..6) {
                    Some(prefix) if k.len() > 6 => format!("{}***", prefix),
                    _ => "***".to_string(),
                }),
            )
            .field("app_name", &self.app_name)
            .field("app_url", &self.app_url)
            .finish()
    }
}

impl OpenAiBackend {
    /// An unauthenticated backend at `base_url` (e.g. a local vLLM server).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            name: "openai".to_string(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            app_name: None,
            app_url: None,
            client: Client::new(),
            probe_timeout: Duration::from_secs(5),
            stats: StatsRecorder::default(),
        }
    }

    /// OpenRouter with the given API key, registered as `"openrouter"`.
    pub fn openrouter(api_key: impl Into<String>) -> Self {
        Self::new(DEFAULT_OPENROUTER_URL)
            .with_name("openrouter")
            .with_api_key(api_key)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sent as `Authorization: Bearer {key}`.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sent as `X-Title` for app attribution.
    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    /// Sent as `HTTP-Referer` for app attribution.
    pub fn with_app_url(mut self, url: impl Into<String>) -> Self {
        self.app_url = Some(url.into());
        self
    }

    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        let mut builder = builder;
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }
        if let Some(ref url) = self.app_url {
            builder = builder.header("HTTP-Referer", url);
        }
        if let Some(ref name) = self.app_name {
            builder = builder.header("X-Title", name);
        }
        builder
    }

    fn build_body(request: &GenerateRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": [{"role": "user", "content": request.prompt}],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": false,
        });
        let sampling = &request.sampling;
        if let Some(top_p) = sampling.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(p) = sampling.frequency_penalty {
            body["frequency_penalty"] = json!(p);
        }
        if let Some(p) = sampling.presence_penalty {
            body["presence_penalty"] = json!(p);
        }
        if !sampling.stop.is_empty() {
            body["stop"] = json!(sampling.stop);
        }
        if let Some(seed) = sampling.seed {
            body["seed"] = json!(seed);
        }
        body
    }

    fn parse_response(&self, body: &Value, request: &GenerateRequest) -> Result<(String, Usage, String)> {
        let empty = |message: &str| PipelineError::Backend {
            backend: self.name.clone(),
            message: message.to_string(),
            recoverable: true,
        };

        let choice = body
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .ok_or_else(|| empty("no choices in response"))?;
        let content = choice
            .pointer("/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(empty("empty response"));
        }

        let count = |key: &str| {
            body.get("usage")
                .and_then(|u| u.get(key))
                .and_then(Value::as_u64)
                .unwrap_or(0)
        };
        let usage = Usage::new(count("prompt_tokens"), count("completion_tokens"));
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&request.model)
            .to_string();
        Ok((content.to_string(), usage, model))
    }

    async fn call(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        if !self.has_api_key() && self.base_url == DEFAULT_OPENROUTER_URL {
            return Err(PipelineError::Backend {
                backend: self.name.clone(),
                message: "API key not configured".to_string(),
                recoverable: false,
            });
        }

        let started = Instant::now();
        tracing::debug!(
            backend = %self.name,
            model = %request.model,
            prompt_len = request.prompt.len(),
            "sending chat completion request"
        );

        let resp = self
            .authorize(self.client.post(format!("{}/chat/completions", self.base_url)))
            .timeout(request.timeout)
            .json(&Self::build_body(request))
            .send()
            .await
            .map_err(|e| transport_error(&self.name, request.timeout, e))?;

        if !resp.status().is_success() {
            return Err(http_error(&self.name, resp).await);
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| transport_error(&self.name, request.timeout, e))?;
        let (content, usage, model) = self.parse_response(&body, request)?;
        let latency = started.elapsed();

        tracing::debug!(
            backend = %self.name,
            model = %model,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            latency_ms = latency.as_millis() as u64,
            "received chat completion"
        );

        Ok(GenerateResponse {
            content,
            usage,
            backend: self.name.clone(),
            model,
            latency,
        })
    }

    fn parse_models(body: &Value) -> Vec<String> {
        body.get("data")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl Backend for OpenAiBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        self.stats.track(self.call(request).await)
    }

    async fn check_health(&self) -> Result<BackendHealth> {
        let started = Instant::now();
        if !self.has_api_key() && self.base_url == DEFAULT_OPENROUTER_URL {
            return Ok(BackendHealth::down(Duration::ZERO, "API key not configured"));
        }

        let resp = self
            .authorize(self.client.get(format!("{}/models", self.base_url)))
            .timeout(self.probe_timeout)
            .send()
            .await;
        let resp = match resp {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Ok(BackendHealth::down(started.elapsed(), "connection timeout"))
            }
            Err(e) => {
                return Ok(BackendHealth::down(
                    started.elapsed(),
                    format!("connection error: {}", e),
                ))
            }
        };
        let latency = started.elapsed();

        match resp.status().as_u16() {
            200..=299 => {
                let models = resp
                    .json::<Value>()
                    .await
                    .map(|body| Self::parse_models(&body))
                    .unwrap_or_default();
                Ok(BackendHealth::up(latency, models))
            }
            401 | 403 => Ok(BackendHealth::down(latency, "invalid API key")),
            status => Ok(BackendHealth::down(latency, format!("HTTP {}", status))),
        }
    }

    fn stats(&self) -> BackendStats {
        self.stats.snapshot()
    }
}
