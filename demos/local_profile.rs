//! Example: a profile against a local Ollama server, with OpenRouter as
//! fallback when `PROFILE_ENGINE_OPENROUTER_API_KEY` is set.
//!
//! Requires Ollama running locally with the model pulled:
//!   ollama pull llama3.1:8b
//!
//! Run with: `cargo run --example local_profile -- "some text to analyze"`

use llm_profile_engine::telemetry::init_tracing;
use llm_profile_engine::{EngineSettings, Overrides, PipelineExecutor, Profile};

const PROFILE: &str = r#"{
  "profile_id": "analysis",
  "name": "Text analysis",
  "steps": [
    {
      "step_id": "topics",
      "prompt": "Return a JSON object with a 'topics' array of strings for:\n\n{input}",
      "output_schema": { "format": "json", "required_fields": ["topics"] }
    },
    {
      "step_id": "report",
      "prompt": "Topics: {topics}\n\nWrite a short report on:\n\n{input}",
      "output_schema": { "format": "text" },
      "dependencies": ["topics"],
      "llm_config": { "temperature": 0.7 }
    }
  ]
}"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("llm_profile_engine=debug");

    let input = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Rust is a systems programming language focused on safety and performance.".to_string());

    let settings = EngineSettings::from_env()?;
    let executor = PipelineExecutor::new(settings.build_selector())
        .with_retry_policy(settings.retry_policy());

    for (name, health) in executor.backend_status().await {
        println!("{}: available={} models={:?}", name, health.available, health.models);
    }

    let profile = Profile::from_json_str(PROFILE)?;
    let result = executor.run(&profile, &input, &Overrides::default()).await?;

    if let Some(err) = result.error_message() {
        eprintln!("run failed: {}", err);
    }
    for step in &result.steps {
        println!(
            "{:<8} ok={} backend={:?} retries={} tokens={}",
            step.step_id,
            step.success,
            step.backend,
            step.retry_count,
            step.usage.total()
        );
    }
    println!("\n{}", serde_json::to_string_pretty(&result.output)?);
    Ok(())
}
