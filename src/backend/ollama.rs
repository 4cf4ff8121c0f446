//! Backend for a local Ollama server.
//!
//! Generation goes through `/api/generate` (non-streaming); the liveness
//! probe lists installed models via `/api/tags`.

use super::{
    http_error, transport_error, Backend, BackendHealth, BackendStats, GenerateRequest,
    GenerateResponse, StatsRecorder, Usage,
};
use crate::error::Result;
use crate::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Backend for Ollama's native API.
///
/// # Example
///
/// ```
/// use llm_profile_engine::backend::{Backend, OllamaBackend};
///
/// let local = OllamaBackend::new("http://localhost:11434");
/// assert_eq!(local.name(), "local");
/// ```
#[derive(Debug)]
pub struct OllamaBackend {
    name: String,
    base_url: String,
    client: Client,
    probe_timeout: Duration,
    stats: StatsRecorder,
}

impl Default for OllamaBackend {
    fn default() -> Self {
        Self::new(DEFAULT_OLLAMA_URL)
    }
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            name: "local".to_string(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
            probe_timeout: Duration::from_secs(5),
            stats: StatsRecorder::default(),
        }
    }

    /// Register under a different name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Reuse an existing HTTP client (connection pool).
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_body(request: &GenerateRequest) -> Value {
        let mut options = json!({
            "temperature": request.temperature,
            "num_predict": request.max_tokens,
        });
        let sampling = &request.sampling;
        if let Some(top_p) = sampling.top_p {
            options["top_p"] = json!(top_p);
        }
        if let Some(p) = sampling.frequency_penalty {
            options["frequency_penalty"] = json!(p);
        }
        if let Some(p) = sampling.presence_penalty {
            options["presence_penalty"] = json!(p);
        }
        if !sampling.stop.is_empty() {
            options["stop"] = json!(sampling.stop);
        }
        if let Some(seed) = sampling.seed {
            options["seed"] = json!(seed);
        }

        json!({
            "model": request.model,
            "prompt": request.prompt,
            "stream": false,
            "options": options,
        })
    }

    fn parse_response(&self, body: &Value, request: &GenerateRequest) -> Result<(String, Usage, String)> {
        let content = body
            .get("response")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if content.trim().is_empty() {
            return Err(PipelineError::Backend {
                backend: self.name.clone(),
                message: "empty response".to_string(),
                recoverable: true,
            });
        }
        let count = |key: &str| body.get(key).and_then(Value::as_u64).unwrap_or(0);
        let usage = Usage::new(count("prompt_eval_count"), count("eval_count"));
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&request.model)
            .to_string();
        Ok((content.to_string(), usage, model))
    }

    fn parse_models(body: &Value) -> Vec<String> {
        body.get("models")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(Value::as_str))
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn call(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        let url = format!("{}/api/generate", self.base_url);
        let started = Instant::now();
        tracing::debug!(
            backend = %self.name,
            model = %request.model,
            prompt_len = request.prompt.len(),
            "sending generate request"
        );

        let resp = self
            .client
            .post(&url)
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
            completion_tokens = usage.completion_tokens,
            latency_ms = latency.as_millis() as u64,
            content_len = content.len(),
            "received generate response"
        );

        Ok(GenerateResponse {
            content,
            usage,
            backend: self.name.clone(),
            model,
            latency,
        })
    }
}

#[async_trait]
impl Backend for OllamaBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        self.stats.track(self.call(request).await)
    }

    async fn check_health(&self) -> Result<BackendHealth> {
        let started = Instant::now();
        let resp = self
            .client
            .get(format!("{}/api/tags", self.base_url))
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

        if !resp.status().is_success() {
            return Ok(BackendHealth::down(
                latency,
                format!("HTTP {}", resp.status().as_u16()),
            ));
        }

        match resp.json::<Value>().await {
            Ok(body) => Ok(BackendHealth::up(latency, Self::parse_models(&body))),
            Err(_) => Ok(BackendHealth {
                error: Some("service available but model list unreadable".to_string()),
                ..BackendHealth::up(latency, Vec::new())
            }),
        }
    }

    fn stats(&self) -> BackendStats {
        self.stats.snapshot()
    }
}
