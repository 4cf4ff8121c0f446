//! Run lifecycle events.
//!
//! Optional and non-intrusive: attach an [`EventHandler`] to a
//! [`PipelineExecutor`](crate::executor::PipelineExecutor) to drive progress
//! bars, audit logs or UIs. Handlers run inline, so keep them cheap.

use std::sync::Arc;
use std::time::Duration;

/// Events emitted while a profile runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A run is starting with the given execution order.
    RunStart {
        profile_id: String,
        order: Vec<String>,
    },
    /// A step is about to make its first attempt.
    StepStart { step_id: String },
    /// The preferred backend was down and another one was chosen.
    BackendFallback {
        step_id: String,
        from: String,
        to: String,
    },
    /// An attempt failed; `delay` is the wait before the next attempt, or
    /// `None` if the step gives up.
    AttemptFailed {
        step_id: String,
        /// 1-based attempt number.
        attempt: u32,
        error: String,
        delay: Option<Duration>,
    },
    /// A step finished.
    StepEnd {
        step_id: String,
        success: bool,
        retry_count: u32,
        latency: Duration,
    },
    /// The run finished.
    RunEnd {
        profile_id: String,
        success: bool,
        elapsed: Duration,
    },
}

/// Receives run lifecycle events.
///
/// # Example
///
/// ```
/// use llm_profile_engine::events::{Event, EventHandler};
///
/// struct PrintHandler;
///
/// impl EventHandler for PrintHandler {
///     fn on_event(&self, event: Event) {
///         match event {
///             Event::StepStart { step_id } => println!("[start] {}", step_id),
///             Event::StepEnd { step_id, success, .. } => println!("[end] {} ok={}", step_id, success),
///             _ => {}
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: Event);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: Event) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_fn_handler_receives_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: Option<Arc<dyn EventHandler>> = Some(Arc::new(FnEventHandler(move |e| {
            sink.lock().unwrap().push(e);
        })));

        emit(
            &handler,
            Event::StepStart {
                step_id: "extract".into(),
            },
        );
        emit(&None, Event::StepStart { step_id: "ignored".into() });

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![Event::StepStart {
                step_id: "extract".into()
            }]
        );
    }
}
