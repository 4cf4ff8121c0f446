//! Example: running a two-step profile against scripted backends.
//!
//! The local backend is down, so both steps fall back to the "cloud" mock.
//! The first reply is malformed JSON and gets retried.
//!
//! Run with: `cargo run --example mock_profile`

use llm_profile_engine::telemetry::init_tracing;
use llm_profile_engine::{
    BackendSelector, Event, FnEventHandler, MockBackend, ModelConfig, OutputContract, Overrides,
    PipelineExecutor, Profile, RetryPolicy, Step,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("llm_profile_engine=info");

    let cloud = MockBackend::new("cloud")
        .reply("Sure! Here you go: {\"people\": [\"Alice\"")
        .reply(r#"```json
{"people": ["Alice", "Bob"], "day": "Monday"}
```"#)
        .reply("Alice and Bob met on Monday to plan the release.");

    let selector = BackendSelector::new()
        .with_backend(Arc::new(MockBackend::unavailable("local")))
        .with_backend(Arc::new(cloud))
        .with_fallback_order(["local", "cloud"])
        .with_fallback_model("cloud", "mock-large");

    let executor = PipelineExecutor::new(selector)
        .with_retry_policy(RetryPolicy::immediate())
        .with_event_handler(Arc::new(FnEventHandler(|event| match event {
            Event::BackendFallback { step_id, from, to } => {
                println!("[{}] {} unavailable, using {}", step_id, from, to)
            }
            Event::AttemptFailed { step_id, attempt, error, .. } => {
                println!("[{}] attempt {} failed: {}", step_id, attempt, error)
            }
            Event::StepEnd { step_id, success, retry_count, .. } => {
                println!("[{}] done ok={} retries={}", step_id, success, retry_count)
            }
            _ => {}
        })));

    let local = ModelConfig::default().with_backend("local");
    let profile = Profile::new("meeting", "Meeting notes")
        .with_step(
            Step::new("extract", "List the people and the day as JSON:\n\n{input}")
                .with_config(local.clone())
                .with_output(OutputContract::json_object(["people"])),
        )
        .with_step(
            Step::new(
                "summarize",
                "People: {extract}\n\nWrite a one-sentence summary of:\n\n{input}",
            )
            .with_config(local)
            .with_output(OutputContract::text())
            .depends_on(["extract"]),
        );

    let problems = executor.validate(&profile);
    if !problems.is_empty() {
        for p in &problems {
            eprintln!("definition error: {}", p);
        }
        return Err("profile is invalid".into());
    }

    let result = executor
        .run(&profile, "Alice met Bob on Monday.", &Overrides::default())
        .await?;

    println!("\nsuccess: {}", result.success);
    println!("{}", serde_json::to_string_pretty(&result.output)?);
    Ok(())
}
