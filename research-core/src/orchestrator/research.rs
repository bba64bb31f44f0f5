//! Research Phase Controller: runs the locked `runtime_plan` step by step
//! under an overall phase deadline, tolerating partial completion when the
//! deadline is hit mid-chain as long as some evidence was gathered.

use crate::adapter::AdapterRegistry;
use crate::config::LimitsConfig;
use crate::error::{Error, Result};
use crate::span::{Span, SpanKind, SpanSink};
use crate::state::State;

use super::step_executor;

pub async fn run(state: &mut State, registry: &AdapterRegistry, limits: &LimitsConfig, span_sink: &dyn SpanSink) -> Result<()> {
    let span = Span::start(SpanKind::Phase, "research");
    let deadline = limits.phase_deadline_for_depth(state.depth.as_deref().unwrap_or("deep"));
    let started = tokio::time::Instant::now();

    let plan = state.runtime_plan.clone();
    let mut aborted_by: Option<Error> = None;

    for step in &plan {
        if started.elapsed() >= deadline {
            break;
        }

        let remaining = deadline.saturating_sub(started.elapsed());
        let outcome = tokio::time::timeout(remaining, step_executor::run(state, step, registry, limits, span_sink)).await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                aborted_by = Some(e);
                break;
            }
            Err(_) => break,
        }
    }

    if let Some(error) = aborted_by {
        if state.evidence.is_empty() {
            span_sink.emit(&span.finish_error(error.to_string()));
            return Err(error);
        }
        span_sink.emit(&span.finish_warning(format!("aborted on '{error}' with partial evidence")));
    } else {
        span_sink.emit(&span.with_output_summary(format!("evidence={}", state.evidence.len())).finish_ok());
    }

    state.phase = crate::state::Phase::Researched;
    Ok(())
}
