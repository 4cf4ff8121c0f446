//! Step-level retry policy.
//!
//! Each step gets `max_retries + 1` attempts. Between attempts the executor
//! waits [`RetryPolicy::delay_for`]; the default is linear backoff
//! (`unit * attempt`), matching a 0.5 s, 1 s, 1.5 s, ... schedule.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `unit * attempt`.
    Linear,
    /// `unit * multiplier^(attempt - 1)`, randomised per [`Jitter`].
    Exponential { multiplier: f64, jitter: Jitter },
}

/// Randomisation applied to exponential delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// `delay / 2` plus uniform in `[0, delay / 2]`.
    Equal,
}

/// Retry behaviour shared by every step of a run.
///
/// # Example
///
/// ```
/// use llm_profile_engine::retry::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.delay_for(1), Duration::from_millis(500));
/// assert_eq!(policy.delay_for(3), Duration::from_millis(1500));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub unit: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Retry failures the error itself marks as permanent (bad credentials,
    /// template syntax). `true` retries every failure uniformly.
    pub retry_non_recoverable: bool,
    /// Honour `Retry-After` from rate-limited backends when it is longer
    /// than the computed delay.
    pub respect_retry_after: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            unit: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Linear,
            retry_non_recoverable: true,
            respect_retry_after: true,
        }
    }
}

impl RetryPolicy {
    /// Linear backoff with the given unit.
    pub fn linear(unit: Duration) -> Self {
        Self {
            unit,
            ..Self::default()
        }
    }

    /// No waiting between attempts. Useful in tests.
    pub fn immediate() -> Self {
        Self::linear(Duration::ZERO)
    }

    /// Exponential backoff with full jitter.
    pub fn exponential(unit: Duration, multiplier: f64) -> Self {
        Self {
            unit,
            strategy: BackoffStrategy::Exponential {
                multiplier,
                jitter: Jitter::Full,
            },
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Skip retries for failures that report themselves as non-recoverable.
    pub fn skip_non_recoverable(mut self) -> Self {
        self.retry_non_recoverable = false;
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let unit = self.unit.as_secs_f64();
        let secs = match self.strategy {
            BackoffStrategy::Linear => unit * f64::from(attempt),
            BackoffStrategy::Exponential { multiplier, jitter } => {
                let base = (unit * multiplier.powi(attempt as i32 - 1))
                    .min(self.max_delay.as_secs_f64());
                match jitter {
                    Jitter::None => base,
                    Jitter::Full => fastrand::f64() * base,
                    Jitter::Equal => base / 2.0 + fastrand::f64() * (base / 2.0),
                }
            }
        };
        Duration::from_secs_f64(secs.clamp(0.0, self.max_delay.as_secs_f64()))
    }

    /// Delay before retrying after `error`, honouring `Retry-After`.
    pub fn delay_after(&self, attempt: u32, error: &PipelineError) -> Duration {
        let computed = self.delay_for(attempt);
        match error.retry_after() {
            Some(hint) if self.respect_retry_after => computed.max(hint.min(self.max_delay)),
            _ => computed,
        }
    }

    /// Whether `error` is worth another attempt under this policy.
    pub fn should_retry(&self, error: &PipelineError) -> bool {
        self.retry_non_recoverable || error.is_recoverable()
    }
}
