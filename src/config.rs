//! Model configuration and run-time overrides.
//!
//! [`ModelConfig`] is declared per step. Callers may adjust it for a single
//! run through [`Overrides`]; [`resolve`] produces the effective config,
//! applying (in increasing precedence) the step's declared config, global
//! field overrides, forced backend/model, and per-step overrides.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::time::Duration;

pub const TEMPERATURE_RANGE: RangeInclusive<f64> = 0.0..=2.0;
pub const MAX_TOKENS_RANGE: RangeInclusive<u32> = 100..=50_000;
pub const TIMEOUT_SECS_RANGE: RangeInclusive<u64> = 5..=300;
pub const TOP_P_RANGE: RangeInclusive<f64> = 0.0..=1.0;
pub const PENALTY_RANGE: RangeInclusive<f64> = -2.0..=2.0;
pub const MAX_STOP_SEQUENCES: usize = 4;

/// Optional sampling parameters forwarded to backends that support them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl SamplingParams {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Configuration for a single LLM request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Name of the backend to prefer (e.g. `"local"`, `"openrouter"`).
    #[serde(alias = "provider")]
    pub backend: String,

    /// Model identifier understood by the backend.
    pub model: String,

    /// Temperature (0.0 = deterministic, 2.0 = very creative).
    pub temperature: f64,

    /// Maximum tokens to generate.
    pub max_tokens: u32,

    /// Per-call timeout in seconds.
    #[serde(alias = "timeout_seconds")]
    pub timeout_secs: u64,

    /// Optional sampling parameters.
    #[serde(skip_serializing_if = "SamplingParams::is_empty")]
    pub sampling: SamplingParams,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: "local".to_string(),
            model: "llama3.1:8b".to_string(),
            temperature: 0.2,
            max_tokens: 2000,
            timeout_secs: 30,
            sampling: SamplingParams::default(),
        }
    }
}

impl ModelConfig {
    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = tokens;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    /// The per-call timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Check every field against its allowed range.
    pub fn validate(&self) -> Result<()> {
        if self.backend.trim().is_empty() {
            return Err(PipelineError::InvalidConfig("backend must not be empty".into()));
        }
        if self.model.trim().is_empty() {
            return Err(PipelineError::InvalidConfig("model must not be empty".into()));
        }
        check_range("temperature", self.temperature, &TEMPERATURE_RANGE)?;
        check_range("max_tokens", self.max_tokens, &MAX_TOKENS_RANGE)?;
        check_range("timeout_secs", self.timeout_secs, &TIMEOUT_SECS_RANGE)?;
        if let Some(top_p) = self.sampling.top_p {
            check_range("top_p", top_p, &TOP_P_RANGE)?;
        }
        if let Some(p) = self.sampling.frequency_penalty {
            check_range("frequency_penalty", p, &PENALTY_RANGE)?;
        }
        if let Some(p) = self.sampling.presence_penalty {
            check_range("presence_penalty", p, &PENALTY_RANGE)?;
        }
        if self.sampling.stop.len() > MAX_STOP_SEQUENCES {
            return Err(PipelineError::InvalidConfig(format!(
                "at most {} stop sequences are allowed, got {}",
                MAX_STOP_SEQUENCES,
                self.sampling.stop.len()
            )));
        }
        Ok(())
    }
}

fn check_range<T>(field: &str, value: T, range: &RangeInclusive<T>) -> Result<()>
where
    T: PartialOrd + std::fmt::Display,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(PipelineError::InvalidConfig(format!(
            "{} must be within {}..={}, got {}",
            field,
            range.start(),
            range.end(),
            value
        )))
    }
}

/// Field overrides for a single step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepOverride {
    #[serde(alias = "provider")]
    pub backend: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    #[serde(alias = "timeout_seconds")]
    pub timeout_secs: Option<u64>,
    pub top_p: Option<f64>,
}

impl StepOverride {
    fn apply(&self, config: &mut ModelConfig) {
        if let Some(ref backend) = self.backend {
            config.backend = backend.clone();
        }
        if let Some(ref model) = self.model {
            config.model = model.clone();
        }
        if let Some(t) = self.temperature {
            config.temperature = t;
        }
        if let Some(m) = self.max_tokens {
            config.max_tokens = m;
        }
        if let Some(t) = self.timeout_secs {
            config.timeout_secs = t;
        }
        if let Some(p) = self.top_p {
            config.sampling.top_p = Some(p);
        }
    }
}

/// Caller-supplied overrides for one run.
///
/// Accepts both the field names below and the `global_*` / `force_provider`
/// spellings when deserialized.
///
/// # Example
///
/// ```
/// use llm_profile_engine::config::Overrides;
///
/// let overrides: Overrides = serde_json::from_str(
///     r#"{"global_temperature": 0.0, "force_provider": "cloud"}"#,
/// ).unwrap();
/// assert_eq!(overrides.temperature, Some(0.0));
/// assert_eq!(overrides.force_backend.as_deref(), Some("cloud"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Overrides {
    #[serde(alias = "global_temperature")]
    pub temperature: Option<f64>,
    #[serde(alias = "global_max_tokens")]
    pub max_tokens: Option<u32>,
    #[serde(alias = "global_timeout_seconds", alias = "global_timeout_secs")]
    pub timeout_secs: Option<u64>,
    #[serde(alias = "global_top_p")]
    pub top_p: Option<f64>,
    #[serde(alias = "force_provider")]
    pub force_backend: Option<String>,
    pub force_model: Option<String>,
    pub step_overrides: HashMap<String, StepOverride>,
}

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.temperature = Some(temp);
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    pub fn force_backend(mut self, backend: impl Into<String>) -> Self {
        self.force_backend = Some(backend.into());
        self
    }

    pub fn force_model(mut self, model: impl Into<String>) -> Self {
        self.force_model = Some(model.into());
        self
    }

    pub fn with_step_override(mut self, step_id: impl Into<String>, o: StepOverride) -> Self {
        self.step_overrides.insert(step_id.into(), o);
        self
    }

    /// Apply only the forced backend/model to `config`.
    pub(crate) fn apply_forced(&self, config: &mut ModelConfig) {
        if let Some(ref backend) = self.force_backend {
            config.backend = backend.clone();
        }
        if let Some(ref model) = self.force_model {
            config.model = model.clone();
        }
    }
}

/// Compute the effective configuration for `step_id`.
///
/// The result is re-validated with the same range checks as a freshly
/// declared config.
pub fn resolve(base: &ModelConfig, overrides: &Overrides, step_id: &str) -> Result<ModelConfig> {
    let mut config = base.clone();

    if let Some(t) = overrides.temperature {
        config.temperature = t;
    }
    if let Some(m) = overrides.max_tokens {
        config.max_tokens = m;
    }
    if let Some(t) = overrides.timeout_secs {
        config.timeout_secs = t;
    }
    if let Some(p) = overrides.top_p {
        config.sampling.top_p = Some(p);
    }

    overrides.apply_forced(&mut config);

    if let Some(step) = overrides.step_overrides.get(step_id) {
        step.apply(&mut config);
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_config_defaults() {
        let config = ModelConfig::default();
        assert_eq!(config.backend, "local");
        assert_eq!(config.model, "llama3.1:8b");
        assert_eq!(config.temperature, 0.2);
        assert_eq!(config.max_tokens, 2000);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_model_config_builder() {
        let config = ModelConfig::default()
            .with_backend("cloud")
            .with_model("openai/gpt-4o-mini")
            .with_temperature(0.7)
            .with_max_tokens(4096)
            .with_timeout_secs(60);
        assert_eq!(config.backend, "cloud");
        assert_eq!(config.model, "openai/gpt-4o-mini");
        assert_eq!(config.temperature, 0.7);
        assert_eq!(config.max_tokens, 4096);
        assert_eq!(config.timeout_secs, 60);
    }

    #[test]
    fn test_range_validation() {
        assert!(ModelConfig::default().with_temperature(2.5).validate().is_err());
        assert!(ModelConfig::default().with_temperature(-0.1).validate().is_err());
        assert!(ModelConfig::default().with_max_tokens(99).validate().is_err());
        assert!(ModelConfig::default().with_max_tokens(50_001).validate().is_err());
        assert!(ModelConfig::default().with_timeout_secs(4).validate().is_err());
        assert!(ModelConfig::default().with_timeout_secs(301).validate().is_err());
        assert!(ModelConfig::default().with_model("  ").validate().is_err());

        let sampling = SamplingParams {
            top_p: Some(1.5),
            ..Default::default()
        };
        assert!(ModelConfig::default().with_sampling(sampling).validate().is_err());

        let sampling = SamplingParams {
            stop: vec!["a".into(), "b".into(), "c".into(), "d".into(), "e".into()],
            ..Default::default()
        };
        assert!(ModelConfig::default().with_sampling(sampling).validate().is_err());
    }

    #[test]
    fn test_resolve_precedence() {
        let base = ModelConfig::default()
            .with_backend("local")
            .with_model("llama3.1:8b")
            .with_temperature(0.1);

        let overrides = Overrides::new()
            .with_temperature(0.9)
            .with_max_tokens(3000)
            .force_backend("cloud")
            .force_model("openai/gpt-4o-mini")
            .with_step_override(
                "summarize",
                StepOverride {
                    temperature: Some(0.0),
                    model: Some("special".into()),
                    ..Default::default()
                },
            );

        let other = resolve(&base, &overrides, "extract").unwrap();
        assert_eq!(other.temperature, 0.9);
        assert_eq!(other.max_tokens, 3000);
        assert_eq!(other.backend, "cloud");
        assert_eq!(other.model, "openai/gpt-4o-mini");

        let summarize = resolve(&base, &overrides, "summarize").unwrap();
        assert_eq!(summarize.temperature, 0.0);
        assert_eq!(summarize.model, "special");
        assert_eq!(summarize.backend, "cloud");
    }

    #[test]
    fn test_resolve_without_overrides_is_identity() {
        let base = ModelConfig::default().with_temperature(1.1);
        assert_eq!(resolve(&base, &Overrides::default(), "any").unwrap(), base);
    }

    #[test]
    fn test_resolve_revalidates() {
        let overrides = Overrides::new().with_temperature(7.0);
        let err = resolve(&ModelConfig::default(), &overrides, "s").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidConfig(_)));
    }

    #[test]
    fn test_overrides_accept_legacy_keys() {
        let o: Overrides = serde_json::from_str(
            r#"{
                "global_temperature": 0.5,
                "global_max_tokens": 1500,
                "global_timeout_seconds": 45,
                "force_provider": "openrouter",
                "force_model": "m",
                "step_overrides": {"s1": {"provider": "local", "timeout_seconds": 10}}
            }"#,
        )
        .unwrap();
        assert_eq!(o.temperature, Some(0.5));
        assert_eq!(o.max_tokens, Some(1500));
        assert_eq!(o.timeout_secs, Some(45));
        assert_eq!(o.force_backend.as_deref(), Some("openrouter"));
        assert_eq!(o.step_overrides["s1"].backend.as_deref(), Some("local"));
        assert_eq!(o.step_overrides["s1"].timeout_secs, Some(10));
    }

    #[test]
    fn test_model_config_deserializes_provider_alias() {
        let c: ModelConfig =
            serde_json::from_str(r#"{"provider": "openrouter", "model": "x", "max_tokens": 1000}"#)
                .unwrap();
        assert_eq!(c.backend, "openrouter");
        assert_eq!(c.max_tokens, 1000);
        assert_eq!(c.temperature, 0.2);
    }
}
