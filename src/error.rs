use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the engine and its components.
///
/// Step-attempt failures ([`Interpolation`](Self::Interpolation),
/// [`Backend`](Self::Backend), [`OutputValidation`](Self::OutputValidation),
/// [`BackendUnavailable`](Self::BackendUnavailable), ...) are captured into
/// [`StepResult`](crate::result::StepResult)s and never escape
/// [`PipelineExecutor::run`](crate::executor::PipelineExecutor::run). Only
/// [`ProfileDefinition`](Self::ProfileDefinition) is returned to the caller,
/// because running a structurally broken profile is a contract violation.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The profile itself is malformed (cycle, missing dependency, ...).
    #[error("invalid profile definition: {}", join_definition_errors(.0))]
    ProfileDefinition(Vec<DefinitionError>),

    /// Prompt template could not be rendered.
    #[error("prompt interpolation failed: {0}")]
    Interpolation(#[from] InterpolationError),

    /// A backend reported a failure.
    #[error("backend '{backend}' failed: {message}")]
    Backend {
        /// Name of the backend that failed.
        backend: String,
        /// Human-readable failure description.
        message: String,
        /// Whether the backend considers the failure transient.
        recoverable: bool,
    },

    /// HTTP error with status code, response body, and optional Retry-After hint.
    #[error("HTTP {status}: {body}")]
    HttpError {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// A backend call exceeded the step's configured timeout.
    #[error("backend '{backend}' timed out after {}s", .after.as_secs())]
    Timeout { backend: String, after: Duration },

    /// The backend answered, but the answer does not satisfy the output contract.
    #[error("output validation failed: {0}")]
    OutputValidation(String),

    /// Neither the preferred backend nor any fallback answered the liveness probe.
    #[error(
        "no available LLM backends. Configured: {configured:?}, Preferred: {preferred}, Fallbacks: {fallback_order:?}"
    )]
    BackendUnavailable {
        configured: Vec<String>,
        preferred: String,
        fallback_order: Vec<String>,
    },

    /// A model configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The run was cancelled via the cancellation flag.
    #[error("Pipeline was cancelled")]
    Cancelled,

    /// Low-level HTTP transport failure (connection refused, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing failed at the serde level.
    #[cfg(feature = "yaml")]
    #[error("YAML parsing failed: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// Coarse classification, recorded on failed step results.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::ProfileDefinition(_) => ErrorKind::ProfileDefinition,
            PipelineError::Interpolation(_) => ErrorKind::Interpolation,
            PipelineError::Backend { .. } | PipelineError::HttpError { .. } => ErrorKind::Backend,
            PipelineError::Request(_) => ErrorKind::Backend,
            PipelineError::Timeout { .. } => ErrorKind::Timeout,
            PipelineError::OutputValidation(_) | PipelineError::Json(_) => {
                ErrorKind::OutputValidation
            }
            #[cfg(feature = "yaml")]
            PipelineError::Yaml(_) => ErrorKind::Other,
            PipelineError::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            PipelineError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            PipelineError::Cancelled => ErrorKind::Cancelled,
            PipelineError::Other(_) => ErrorKind::Other,
        }
    }

    /// Whether a re-dispatch could plausibly succeed.
    ///
    /// Definition, configuration and authentication-style failures are not
    /// recoverable. Output validation is, since the model may answer
    /// differently next time.
    pub fn is_recoverable(&self) -> bool {
        match self {
            PipelineError::Backend { recoverable, .. } => *recoverable,
            PipelineError::HttpError { status, .. } => *status == 429 || *status >= 500,
            PipelineError::Request(_) | PipelineError::Timeout { .. } => true,
            PipelineError::OutputValidation(_) | PipelineError::Json(_) => true,
            PipelineError::BackendUnavailable { .. } => true,
            PipelineError::Interpolation(InterpolationError::MissingVariables(_)) => true,
            PipelineError::Interpolation(InterpolationError::Syntax { .. }) => false,
            PipelineError::ProfileDefinition(_)
            | PipelineError::InvalidConfig(_)
            | PipelineError::Cancelled
            | PipelineError::Other(_) => false,
            #[cfg(feature = "yaml")]
            PipelineError::Yaml(_) => false,
        }
    }

    /// `Retry-After` hint from a rate-limited backend, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PipelineError::HttpError { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Serializable discriminant of [`PipelineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ProfileDefinition,
    Interpolation,
    Backend,
    Timeout,
    OutputValidation,
    BackendUnavailable,
    InvalidConfig,
    Cancelled,
    Other,
}

/// A structural problem with a profile, detected before any backend call.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DefinitionError {
    #[error("profile has no steps")]
    EmptyProfile,

    #[error("step id '{step_id}' is used more than once")]
    DuplicateStep { step_id: String },

    #[error("step id '{step_id}' is not a valid variable name")]
    InvalidStepId { step_id: String },

    #[error("step id '{step_id}' is reserved")]
    ReservedStepId { step_id: String },

    #[error("step '{step_id}' depends on unknown step '{dependency}'")]
    MissingDependency { step_id: String, dependency: String },

    #[error("dependency cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("step '{step_id}' has an invalid prompt template: {message}")]
    InvalidTemplate { step_id: String, message: String },

    #[error("step '{step_id}' references unresolved variables {variables:?}")]
    UnresolvedVariables {
        step_id: String,
        variables: Vec<String>,
    },

    #[error("step '{step_id}' allows {max_retries} retries, at most {limit} are permitted")]
    RetryBoundTooLarge {
        step_id: String,
        max_retries: u32,
        limit: u32,
    },

    #[error("step '{step_id}' has an invalid model configuration: {message}")]
    InvalidConfig { step_id: String, message: String },

    #[error("final output includes unknown step '{step_id}'")]
    UnknownOutputStep { step_id: String },
}

/// Template rendering failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InterpolationError {
    /// Brace content that is not a `{name}` placeholder or a `{{` / `}}` escape.
    #[error("invalid template syntax at byte {position}: {message}")]
    Syntax { position: usize, message: String },

    /// Strict rendering referenced names absent from the variable map.
    #[error("missing required variables: {0:?}")]
    MissingVariables(Vec<String>),
}

fn join_definition_errors(errors: &[DefinitionError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_error_recoverability() {
        let rate_limited = PipelineError::HttpError {
            status: 429,
            body: "slow down".into(),
            retry_after: Some(Duration::from_secs(3)),
        };
        assert!(rate_limited.is_recoverable());
        assert_eq!(rate_limited.retry_after(), Some(Duration::from_secs(3)));

        let unauthorized = PipelineError::HttpError {
            status: 401,
            body: "bad key".into(),
            retry_after: None,
        };
        assert!(!unauthorized.is_recoverable());
        assert_eq!(unauthorized.kind(), ErrorKind::Backend);
    }

    #[test]
    fn test_backend_unavailable_message_names_everything() {
        let err = PipelineError::BackendUnavailable {
            configured: vec!["cloud".into(), "local".into()],
            preferred: "local".into(),
            fallback_order: vec!["local".into(), "cloud".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("Configured"));
        assert!(msg.contains("Preferred: local"));
        assert!(msg.contains("Fallbacks"));
    }

    #[test]
    fn test_definition_errors_joined() {
        let err = PipelineError::ProfileDefinition(vec![
            DefinitionError::Cycle {
                path: vec!["a".into(), "b".into(), "a".into()],
            },
            DefinitionError::MissingDependency {
                step_id: "c".into(),
                dependency: "zzz".into(),
            },
        ]);
        let msg = err.to_string();
        assert!(msg.contains("a -> b -> a"));
        assert!(msg.contains("unknown step 'zzz'"));
        assert_eq!(err.kind(), ErrorKind::ProfileDefinition);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_anyhow_conversion() {
        let err: PipelineError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, PipelineError::Other(ref m) if m == "boom"));
    }
}
