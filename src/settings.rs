//! Engine-wide settings: where the backends live and how to reach them.
//!
//! Loaded from `PROFILE_ENGINE_*` environment variables (a `.env` file is
//! read first when present), or from YAML with the `yaml` feature.

use crate::backend::ollama::{OllamaBackend, DEFAULT_OLLAMA_URL};
#[cfg(feature = "openai")]
use crate::backend::openai::{OpenAiBackend, DEFAULT_OPENROUTER_URL};
use crate::error::{PipelineError, Result};
use crate::retry::RetryPolicy;
use crate::selector::BackendSelector;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Prefix for every environment variable read by [`EngineSettings::from_env`].
pub const ENV_PREFIX: &str = "PROFILE_ENGINE_";

#[cfg(not(feature = "openai"))]
const DEFAULT_OPENROUTER_URL: &str = "https://openrouter.ai/api/v1";

/// Connection and policy settings shared by every run.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub ollama_url: String,
    pub openrouter_url: String,
    #[serde(skip_serializing)]
    pub openrouter_api_key: Option<String>,
    pub app_name: Option<String>,
    pub app_url: Option<String>,
    /// Model substituted when falling back to the local backend.
    pub local_model: String,
    /// Model substituted when falling back to the cloud backend.
    pub cloud_model: String,
    pub fallback_order: Vec<String>,
    pub retry_unit_ms: u64,
    pub probe_timeout_secs: u64,
}

impl std::fmt::Debug for EngineSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSettings")
            .field("ollama_url", &self.ollama_url)
            .field("openrouter_url", &self.openrouter_url)
            .field("openrouter_api_key", &self.openrouter_api_key.as_ref().map(|_| "***"))
            .field("app_name", &self.app_name)
            .field("local_model", &self.local_model)
            .field("cloud_model", &self.cloud_model)
            .field("fallback_order", &self.fallback_order)
            .finish_non_exhaustive()
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            openrouter_url: DEFAULT_OPENROUTER_URL.to_string(),
            openrouter_api_key: None,
            app_name: None,
            app_url: None,
            local_model: "llama3.1:8b".to_string(),
            cloud_model: "openai/gpt-4o-mini".to_string(),
            fallback_order: vec!["local".to_string(), "openrouter".to_string()],
            retry_unit_ms: 500,
            probe_timeout_secs: 5,
        }
    }
}

impl EngineSettings {
    /// Read `.env` if present, then the process environment.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                tracing::warn!(error = %e, "failed to read .env file");
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Keys are passed with the
    /// [`ENV_PREFIX`] already applied.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name)).filter(|v| !v.trim().is_empty())
        };
        let mut settings = Self::default();

        if let Some(v) = get("OLLAMA_URL") {
            settings.ollama_url = v;
        }
        if let Some(v) = get("OPENROUTER_URL") {
            settings.openrouter_url = v;
        }
        settings.openrouter_api_key = get("OPENROUTER_API_KEY");
        settings.app_name = get("APP_NAME");
        settings.app_url = get("APP_URL");
        if let Some(v) = get("LOCAL_MODEL") {
            settings.local_model = v;
        }
        if let Some(v) = get("CLOUD_MODEL") {
            settings.cloud_model = v;
        }
        if let Some(v) = get("FALLBACK_ORDER") {
            settings.fallback_order = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = get("RETRY_UNIT_MS") {
            settings.retry_unit_ms = parse_number("RETRY_UNIT_MS", &v)?;
        }
        if let Some(v) = get("PROBE_TIMEOUT_SECS") {
            settings.probe_timeout_secs = parse_number("PROBE_TIMEOUT_SECS", &v)?;
        }
        Ok(settings)
    }

    /// Load from a YAML file. Missing keys keep their defaults.
    #[cfg(feature = "yaml")]
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Ok(serde_yaml::from_str(&text)?)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Linear backoff with the configured unit.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(Duration::from_millis(self.retry_unit_ms))
    }

    /// A selector with the local backend always registered and the cloud
    /// backend registered when an API key is configured.
    pub fn build_selector(&self) -> BackendSelector {
        let probe_timeout = self.probe_timeout();
        let client = reqwest::Client::new();

        let local = OllamaBackend::new(&self.ollama_url)
            .with_client(client.clone())
            .with_probe_timeout(probe_timeout);
        let mut selector = BackendSelector::new()
            .with_backend(Arc::new(local))
            .with_fallback_order(self.fallback_order.iter().cloned())
            .with_fallback_model("local", &self.local_model)
            .with_probe_timeout(probe_timeout);

        #[cfg(feature = "openai")]
        match self.openrouter_api_key {
            Some(ref key) => {
                let mut cloud = OpenAiBackend::new(&self.openrouter_url)
                    .with_name("openrouter")
                    .with_api_key(key)
                    .with_client(client)
                    .with_probe_timeout(probe_timeout);
                if let Some(ref name) = self.app_name {
                    cloud = cloud.with_app_name(name);
                }
                if let Some(ref url) = self.app_url {
                    cloud = cloud.with_app_url(url);
                }
                selector = selector
                    .with_backend(Arc::new(cloud))
                    .with_fallback_model("openrouter", &self.cloud_model);
            }
            None => tracing::info!("no OpenRouter API key configured, cloud backend disabled"),
        }

        tracing::debug!(backends = ?selector.backend_names(), "selector built");
        selector
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| {
        PipelineError::InvalidConfig(format!("{}{} = '{}': {}", ENV_PREFIX, name, value, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (format!("{}{}", ENV_PREFIX, k), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let settings = EngineSettings::from_lookup(|_| None).unwrap();
        assert_eq!(settings, EngineSettings::default());
        assert_eq!(settings.ollama_url, "http://localhost:11434");
        assert_eq!(settings.fallback_order, vec!["local", "openrouter"]);
        assert_eq!(settings.retry_policy().delay_for(2), Duration::from_secs(1));
    }

    #[test]
    fn test_env_values_override_defaults() {
        let settings = EngineSettings::from_lookup(lookup(&[
            ("OLLAMA_URL", "http://gpu-box:11434"),
            ("OPENROUTER_API_KEY", "sk-or-test"),
            ("FALLBACK_ORDER", "openrouter, local ,"),
            ("RETRY_UNIT_MS", "250"),
            ("CLOUD_MODEL", "anthropic/claude-3-haiku"),
            ("APP_NAME", "   "),
        ]))
        .unwrap();

        assert_eq!(settings.ollama_url, "http://gpu-box:11434");
        assert_eq!(settings.openrouter_api_key.as_deref(), Some("sk-or-test"));
        assert_eq!(settings.fallback_order, vec!["openrouter", "local"]);
        assert_eq!(settings.retry_unit_ms, 250);
        assert_eq!(settings.cloud_model, "anthropic/claude-3-haiku");
        assert!(settings.app_name.is_none());
    }

    #[test]
    fn test_bad_number_is_invalid_config() {
        let err = EngineSettings::from_lookup(lookup(&[("PROBE_TIMEOUT_SECS", "soon")])).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(ref m) if m.contains("PROBE_TIMEOUT_SECS")));
    }

    #[test]
    fn test_debug_hides_api_key() {
        let settings = EngineSettings {
            openrouter_api_key: Some("sk-or-secret".into()),
            ..Default::default()
        };
        let debug = format!("{:?}", settings);
        assert!(!debug.contains("sk-or-secret"));
        assert!(debug.contains("***"));
    }

    #[test]
    fn test_selector_without_key_has_only_local() {
        let selector = EngineSettings::default().build_selector();
        assert_eq!(selector.backend_names(), vec!["local"]);
        assert_eq!(selector.fallback_order(), ["local", "openrouter"]);
    }

    #[cfg(feature = "openai")]
    #[test]
    fn test_selector_with_key_registers_cloud() {
        let settings = EngineSettings {
            openrouter_api_key: Some("sk-or-test".into()),
            ..Default::default()
        };
        let selector = settings.build_selector();
        assert_eq!(selector.backend_names(), vec!["local", "openrouter"]);
    }

    #[cfg(feature = "yaml")]
    #[test]
    fn test_yaml_partial_settings() {
        let settings: EngineSettings =
            serde_yaml::from_str("ollama_url: http://other:11434\nretry_unit_ms: 100\n").unwrap();
        assert_eq!(settings.ollama_url, "http://other:11434");
        assert_eq!(settings.retry_unit_ms, 100);
        assert_eq!(settings.local_model, "llama3.1:8b");
    }
}
