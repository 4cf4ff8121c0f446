//! Backend registry and fallback selection.
//!
//! The selector owns a read-only map of named backends and a fallback
//! order. [`BackendSelector::select`] probes the preferred backend first and
//! walks the fallback order when it is down. Probe failures never abort
//! selection; they are logged and the next candidate is tried.

use crate::backend::{Backend, BackendHealth};
use crate::config::{ModelConfig, Overrides};
use crate::error::{PipelineError, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// The outcome of a selection.
#[derive(Clone)]
pub struct Selection {
    pub backend: Arc<dyn Backend>,
    /// Working config with `backend` (and possibly `model`) updated to match
    /// the chosen backend.
    pub config: ModelConfig,
    /// Preferred backend name when a fallback was used.
    pub fell_back_from: Option<String>,
}

impl std::fmt::Debug for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selection")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .field("fell_back_from", &self.fell_back_from)
            .finish()
    }
}

/// Chooses a live backend for each step.
///
/// # Example
///
/// ```
/// use llm_profile_engine::backend::MockBackend;
/// use llm_profile_engine::selector::BackendSelector;
/// use std::sync::Arc;
///
/// let selector = BackendSelector::new()
///     .with_backend(Arc::new(MockBackend::fixed("local", "hi")))
///     .with_backend(Arc::new(MockBackend::fixed("cloud", "hi")))
///     .with_fallback_order(["local", "cloud"]);
/// assert_eq!(selector.backend_names(), vec!["cloud", "local"]);
/// ```
#[derive(Clone)]
pub struct BackendSelector {
    backends: BTreeMap<String, Arc<dyn Backend>>,
    fallback_order: Vec<String>,
    fallback_models: HashMap<String, String>,
    probe_timeout: Duration,
}

impl Default for BackendSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BackendSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSelector")
            .field("backends", &self.backend_names())
            .field("fallback_order", &self.fallback_order)
            .field("fallback_models", &self.fallback_models)
            .field("probe_timeout", &self.probe_timeout)
            .finish()
    }
}

impl BackendSelector {
    pub fn new() -> Self {
        Self {
            backends: BTreeMap::new(),
            fallback_order: vec!["local".to_string(), "openrouter".to_string()],
            fallback_models: HashMap::new(),
            probe_timeout: Duration::from_secs(5),
        }
    }

    /// Register a backend under its own [`Backend::name`].
    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.register(backend);
        self
    }

    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn with_fallback_order<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fallback_order = order.into_iter().map(Into::into).collect();
        self
    }

    /// Model to request when falling back onto `backend`.
    pub fn with_fallback_model(mut self, backend: impl Into<String>, model: impl Into<String>) -> Self {
        self.fallback_models.insert(backend.into(), model.into());
        self
    }

    /// Upper bound on each liveness probe.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    pub fn fallback_order(&self) -> &[String] {
        &self.fallback_order
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Backend>> {
        self.backends.get(name)
    }

    async fn probe(&self, backend: &Arc<dyn Backend>) -> bool {
        match tokio::time::timeout(self.probe_timeout, backend.is_available()).await {
            Ok(available) => available,
            Err(_) => {
                tracing::warn!(
                    backend = backend.name(),
                    timeout_ms = self.probe_timeout.as_millis() as u64,
                    "backend probe timed out"
                );
                false
            }
        }
    }

    /// Pick a backend for an already-resolved config.
    pub async fn select(&self, config: &ModelConfig) -> Result<Selection> {
        let preferred = config.backend.as_str();

        match self.backends.get(preferred) {
            Some(backend) => {
                if self.probe(backend).await {
                    tracing::debug!(backend = preferred, "using preferred backend");
                    return Ok(Selection {
                        backend: Arc::clone(backend),
                        config: config.clone(),
                        fell_back_from: None,
                    });
                }
                tracing::warn!(backend = preferred, "preferred backend is not available");
            }
            None => {
                tracing::warn!(backend = preferred, "preferred backend is not configured");
            }
        }

        for name in &self.fallback_order {
            if name == preferred {
                continue;
            }
            let Some(backend) = self.backends.get(name) else {
                continue;
            };
            if self.probe(backend).await {
                tracing::warn!(from = preferred, to = %name, "falling back to another backend");
                let mut working = config.clone();
                working.backend = name.clone();
                if let Some(model) = self.fallback_models.get(name) {
                    working.model = model.clone();
                }
                return Ok(Selection {
                    backend: Arc::clone(backend),
                    config: working,
                    fell_back_from: Some(preferred.to_string()),
                });
            }
        }

        Err(PipelineError::BackendUnavailable {
            configured: self.backend_names(),
            preferred: preferred.to_string(),
            fallback_order: self.fallback_order.clone(),
        })
    }

    /// Apply forced backend/model overrides to `config`, then select.
    pub async fn select_with_overrides(
        &self,
        config: &ModelConfig,
        overrides: &Overrides,
    ) -> Result<Selection> {
        let mut working = config.clone();
        overrides.apply_forced(&mut working);
        self.select(&working).await
    }

    /// Health of every registered backend. Probe errors become unhealthy
    /// reports.
    pub async fn status(&self) -> BTreeMap<String, BackendHealth> {
        let mut report = BTreeMap::new();
        for (name, backend) in &self.backends {
            let health = match tokio::time::timeout(self.probe_timeout, backend.check_health()).await {
                Ok(Ok(health)) => health,
                Ok(Err(e)) => BackendHealth::down(Duration::ZERO, format!("health check failed: {}", e)),
                Err(_) => BackendHealth::down(self.probe_timeout, "probe timed out"),
            };
            report.insert(name.clone(), health);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;

    fn config(backend: &str) -> ModelConfig {
        ModelConfig::default().with_backend(backend)
    }

    #[tokio::test]
    async fn test_preferred_backend_selected() {
        let local = Arc::new(MockBackend::fixed("local", "x"));
        let cloud = Arc::new(MockBackend::fixed("cloud", "x"));
        let selector = BackendSelector::new()
            .with_backend(local.clone())
            .with_backend(cloud.clone())
            .with_fallback_order(["local", "cloud"]);

        let selection = selector.select(&config("local")).await.unwrap();
        assert_eq!(selection.backend.name(), "local");
        assert_eq!(selection.config.backend, "local");
        assert!(selection.fell_back_from.is_none());
        assert_eq!(cloud.probes(), 0);
    }

    #[tokio::test]
    async fn test_falls_back_and_updates_config() {
        let selector = BackendSelector::new()
            .with_backend(Arc::new(MockBackend::unavailable("local")))
            .with_backend(Arc::new(MockBackend::fixed("cloud", "x")))
            .with_fallback_order(["local", "cloud"]);

        let selection = selector.select(&config("local")).await.unwrap();
        assert_eq!(selection.backend.name(), "cloud");
        assert_eq!(selection.config.backend, "cloud");
        assert_eq!(selection.config.model, "llama3.1:8b");
        assert_eq!(selection.fell_back_from.as_deref(), Some("local"));
    }

    #[tokio::test]
    async fn test_fallback_model_substituted() {
        let selector = BackendSelector::new()
            .with_backend(Arc::new(MockBackend::unavailable("local")))
            .with_backend(Arc::new(MockBackend::fixed("cloud", "x")))
            .with_fallback_order(["local", "cloud"])
            .with_fallback_model("cloud", "openai/gpt-4o-mini");

        let selection = selector.select(&config("local")).await.unwrap();
        assert_eq!(selection.config.model, "openai/gpt-4o-mini");
    }

    #[tokio::test]
    async fn test_probe_errors_are_swallowed() {
        let broken = Arc::new(MockBackend::fixed("local", "x").with_probe_error());
        let selector = BackendSelector::new()
            .with_backend(broken.clone())
            .with_backend(Arc::new(MockBackend::fixed("cloud", "x")))
            .with_fallback_order(["local", "cloud"]);

        let selection = selector.select(&config("local")).await.unwrap();
        assert_eq!(selection.backend.name(), "cloud");
        assert_eq!(broken.probes(), 1);
    }

    #[tokio::test]
    async fn test_preferred_not_tried_twice() {
        let local = Arc::new(MockBackend::unavailable("local"));
        let selector = BackendSelector::new()
            .with_backend(local.clone())
            .with_fallback_order(["local"]);

        assert!(selector.select(&config("local")).await.is_err());
        assert_eq!(local.probes(), 1);
    }

    #[tokio::test]
    async fn test_unknown_preferred_uses_fallbacks() {
        let selector = BackendSelector::new()
            .with_backend(Arc::new(MockBackend::fixed("local", "x")))
            .with_fallback_order(["local"]);
        let selection = selector.select(&config("nonexistent")).await.unwrap();
        assert_eq!(selection.backend.name(), "local");
    }

    #[tokio::test]
    async fn test_none_available() {
        let selector = BackendSelector::new()
            .with_backend(Arc::new(MockBackend::unavailable("local")))
            .with_backend(Arc::new(MockBackend::unavailable("cloud")))
            .with_fallback_order(["local", "cloud"]);

        let err = selector.select(&config("local")).await.unwrap_err();
        match err {
            PipelineError::BackendUnavailable {
                configured,
                preferred,
                fallback_order,
            } => {
                assert_eq!(configured, vec!["cloud", "local"]);
                assert_eq!(preferred, "local");
                assert_eq!(fallback_order, vec!["local", "cloud"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_slow_probe_times_out() {
        struct Hanging;

        #[async_trait::async_trait]
        impl Backend for Hanging {
            fn name(&self) -> &str {
                "local"
            }
            async fn generate(
                &self,
                _request: &crate::backend::GenerateRequest,
            ) -> Result<crate::backend::GenerateResponse> {
                Err(PipelineError::Other("unused".into()))
            }
            async fn check_health(&self) -> Result<BackendHealth> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(BackendHealth::default())
            }
        }

        let selector = BackendSelector::new()
            .with_backend(Arc::new(Hanging))
            .with_backend(Arc::new(MockBackend::fixed("cloud", "x")))
            .with_fallback_order(["local", "cloud"])
            .with_probe_timeout(Duration::from_millis(20));

        let selection = selector.select(&config("local")).await.unwrap();
        assert_eq!(selection.backend.name(), "cloud");
    }

    #[tokio::test]
    async fn test_forced_backend_applied_before_selection() {
        let selector = BackendSelector::new()
            .with_backend(Arc::new(MockBackend::fixed("local", "x")))
            .with_backend(Arc::new(MockBackend::fixed("cloud", "x")));
        let overrides = Overrides::new().force_backend("cloud").force_model("big");

        let selection = selector
            .select_with_overrides(&config("local"), &overrides)
            .await
            .unwrap();
        assert_eq!(selection.backend.name(), "cloud");
        assert_eq!(selection.config.model, "big");
    }

    #[tokio::test]
    async fn test_status_reports_every_backend() {
        let selector = BackendSelector::new()
            .with_backend(Arc::new(MockBackend::unavailable("local")))
            .with_backend(Arc::new(MockBackend::fixed("cloud", "x").with_probe_error()));
        let status = selector.status().await;
        assert!(!status["local"].available);
        assert!(status["cloud"].error.as_deref().unwrap().contains("health check failed"));
    }
}
