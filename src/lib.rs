//! # LLM Profile Engine
//!
//! Declarative multi-step LLM pipelines ("profiles") executed in dependency
//! order, with safe prompt interpolation, backend fallback, bounded retry
//! and a single aggregated result.
//!
//! ## Core Concepts
//!
//! - **[`Profile`]** / **[`Step`]**: the declarative definition. Steps name
//!   their dependencies and reference earlier outputs as `{step_id}` in
//!   their prompt templates.
//! - **[`ExecutionContext`]**: per-run, append-only store of the input text
//!   and every output passed on so far.
//! - **[`Backend`]**: object-safe trait over LLM services. Ships with
//!   [`OllamaBackend`], an OpenAI-compatible backend (feature `openai`) and
//!   [`MockBackend`] for tests.
//! - **[`BackendSelector`]**: picks a live backend for a step, falling back
//!   in a configured order.
//! - **[`PipelineExecutor`]**: validates, orders and runs a profile, producing
//!   a [`PipelineResult`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use llm_profile_engine::{
//!     EngineSettings, Overrides, OutputContract, PipelineExecutor, Profile, Step,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = EngineSettings::from_env()?;
//!     let executor = PipelineExecutor::new(settings.build_selector())
//!         .with_retry_policy(settings.retry_policy());
//!
//!     let profile = Profile::new("meeting", "Meeting notes")
//!         .with_step(
//!             Step::new("extract", "List the people mentioned, as JSON: {input}")
//!                 .with_output(OutputContract::json_object(["people"])),
//!         )
//!         .with_step(
//!             Step::new("summarize", "People: {extract}\n\nSummarize: {input}")
//!                 .with_output(OutputContract::text())
//!                 .depends_on(["extract"]),
//!         );
//!
//!     let result = executor
//!         .run(&profile, "Alice met Bob on Monday.", &Overrides::default())
//!         .await?;
//!     println!("{}", serde_json::to_string_pretty(&result.output)?);
//!     Ok(())
//! }
//! ```
//!
//! ## Failure model
//!
//! Structural problems (cycles, missing dependencies, duplicate ids) make
//! [`PipelineExecutor::run`] return `Err`. Everything that happens while
//! steps execute is captured in the [`PipelineResult`]: a failing required
//! step aborts the run, a failing optional step does not, and results
//! produced before an abort are kept.

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod executor;
pub mod interpolate;
pub mod output;
pub mod profile;
pub mod result;
pub mod retry;
pub mod selector;
pub mod settings;
pub mod step;
pub mod telemetry;

pub use backend::{Backend, BackendHealth, GenerateRequest, GenerateResponse, MockBackend, OllamaBackend, Usage};
#[cfg(feature = "openai")]
pub use backend::OpenAiBackend;
pub use config::{ModelConfig, Overrides, SamplingParams, StepOverride};
pub use context::ExecutionContext;
pub use error::{DefinitionError, ErrorKind, InterpolationError, PipelineError, Result};
pub use events::{Event, EventHandler, FnEventHandler};
pub use executor::{run_profile, PipelineExecutor};
pub use output::{OutputContract, OutputFormat, OutputShape};
pub use profile::{FinalOutput, Profile, Step};
pub use result::{PipelineResult, RunError, RunMetadata, StepResult};
pub use retry::{BackoffStrategy, Jitter, RetryPolicy};
pub use selector::{BackendSelector, Selection};
pub use settings::EngineSettings;
pub use step::StepExecutor;
