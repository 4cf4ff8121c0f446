//! Scripted backend for tests and demos.
//!
//! [`MockBackend`] plays back a queue of replies. When one reply is left it
//! repeats forever, so `MockBackend::fixed("local", "...")` always answers
//! the same way.
//!
//! # Example
//!
//! ```
//! use llm_profile_engine::backend::MockBackend;
//!
//! let mock = MockBackend::new("local")
//!     .fail("connection reset", true)
//!     .reply(r#"{"people": ["Alice"]}"#);
//! assert_eq!(mock.calls(), 0);
//! ```

use super::{Backend, BackendHealth, BackendStats, GenerateRequest, GenerateResponse, StatsRecorder, Usage};
use crate::error::Result;
use crate::PipelineError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One scripted outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum MockReply {
    Text(String),
    Error { message: String, recoverable: bool },
}

/// A backend that returns scripted replies.
#[derive(Debug)]
pub struct MockBackend {
    name: String,
    replies: Mutex<VecDeque<MockReply>>,
    latency: Duration,
    available: AtomicBool,
    probe_error: AtomicBool,
    calls: AtomicUsize,
    probes: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    stats: StatsRecorder,
}

impl MockBackend {
    /// A backend with no scripted replies. Calls fail until one is added.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replies: Mutex::new(VecDeque::new()),
            latency: Duration::ZERO,
            available: AtomicBool::new(true),
            probe_error: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            stats: StatsRecorder::default(),
        }
    }

    /// Always answers `text`.
    pub fn fixed(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(name).reply(text)
    }

    /// Always fails with a recoverable error.
    pub fn failing(name: impl Into<String>) -> Self {
        Self::new(name).fail("scripted failure", true)
    }

    /// Reports itself unavailable to liveness probes.
    pub fn unavailable(name: impl Into<String>) -> Self {
        let mock = Self::new(name);
        mock.set_available(false);
        mock
    }

    /// Queue a successful reply.
    pub fn reply(self, text: impl Into<String>) -> Self {
        self.push(MockReply::Text(text.into()));
        self
    }

    /// Queue a failure.
    pub fn fail(self, message: impl Into<String>, recoverable: bool) -> Self {
        self.push(MockReply::Error {
            message: message.into(),
            recoverable,
        });
        self
    }

    /// Sleep this long inside every `generate` call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the liveness probe return an error instead of a health report.
    pub fn with_probe_error(self) -> Self {
        self.probe_error.store(true, Ordering::Relaxed);
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Number of `generate` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Number of liveness probes so far.
    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::Relaxed)
    }

    /// Every prompt received, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    fn push(&self, reply: MockReply) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply);
        }
    }

    fn next_reply(&self) -> Option<MockReply> {
        let mut replies = self.replies.lock().ok()?;
        if replies.len() > 1 {
            replies.pop_front()
        } else {
            replies.front().cloned()
        }
    }

    async fn play(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        let started = Instant::now();
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(request.prompt.clone());
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match self.next_reply() {
            Some(MockReply::Text(content)) => Ok(GenerateResponse {
                usage: Usage::new(
                    request.prompt.split_whitespace().count() as u64,
                    content.split_whitespace().count() as u64,
                ),
                content,
                backend: self.name.clone(),
                model: request.model.clone(),
                latency: started.elapsed(),
            }),
            Some(MockReply::Error {
                message,
                recoverable,
            }) => Err(PipelineError::Backend {
                backend: self.name.clone(),
                message,
                recoverable,
            }),
            None => Err(PipelineError::Backend {
                backend: self.name.clone(),
                message: "no scripted reply".to_string(),
                recoverable: false,
            }),
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse> {
        self.stats.track(self.play(request).await)
    }

    async fn check_health(&self) -> Result<BackendHealth> {
        self.probes.fetch_add(1, Ordering::Relaxed);
        if self.probe_error.load(Ordering::Relaxed) {
            return Err(PipelineError::Backend {
                backend: self.name.clone(),
                message: "probe exploded".to_string(),
                recoverable: true,
            });
        }
        if self.available.load(Ordering::Relaxed) {
            Ok(BackendHealth::up(Duration::ZERO, vec!["mock".to_string()]))
        } else {
            Ok(BackendHealth::down(Duration::ZERO, "scripted outage"))
        }
    }

    fn stats(&self) -> BackendStats {
        self.stats.snapshot()
    }
}
