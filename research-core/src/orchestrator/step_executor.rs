//! Step Executor: runs one `Step` from the locked `runtime_plan` against the
//! adapter registry, with `when`/`for_each`/retry/timeout/`on_error`
//! semantics applied uniformly regardless of which adapter backs it.

use std::collections::HashMap;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use rand::Rng;

use crate::adapter::{AdapterContext, AdapterRegistry};
use crate::config::LimitsConfig;
use crate::error::{Error, Result};
use crate::span::{Span, SpanKind, SpanSink};
use crate::state::{State, StepOutcome};
use crate::strategy::{OnError, Step};
use crate::template::{self, Scope, Value};

const BASE_BACKOFF_MS: u64 = 500;
const MAX_BACKOFF_MS: u64 = 8_000;
const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(30);
const LLM_STEP_TIMEOUT: Duration = Duration::from_secs(90);

/// Run one step. Returns `Ok(())` whether or not evidence was gathered;
/// an `Err` is only returned for `on_error: abort` steps whose retries were
/// exhausted, signalling the Research Phase Controller to stop the chain.
pub async fn run(
    state: &mut State,
    step: &Step,
    registry: &AdapterRegistry,
    limits: &LimitsConfig,
    span_sink: &dyn SpanSink,
) -> Result<()> {
    let span = Span::start(SpanKind::Step, step.name.clone());
    let base_scope = state.to_scope();

    if !template::eval_when(step.when.as_deref().unwrap_or("true"), &base_scope)? {
        state.step_outcomes.push((step.name.clone(), StepOutcome::Skipped { reason: "when guard false".to_string() }));
        span_sink.emit(&span.with_output_summary("skipped").finish_ok());
        return Ok(());
    }

    let Some(adapter) = registry.lookup(&step.uses) else {
        let error = Error::config(format!("no adapter registered for '{}'", step.uses));
        return handle_failure(state, step, error, &span, span_sink);
    };

    let timeout = step
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(if step.uses.contains("llm") { LLM_STEP_TIMEOUT } else { DEFAULT_STEP_TIMEOUT });

    let elements: Vec<Scope> = match &step.for_each {
        None => vec![base_scope.clone()],
        Some(path) => match template::resolve_list(path, &base_scope) {
            Ok(items) => items
                .to_vec()
                .into_iter()
                .map(|item| base_scope.clone().with(step.r#as.clone(), item))
                .collect(),
            Err(error) => return handle_failure(state, step, error, &span, span_sink),
        },
    };

    let concurrency = limits.for_each_concurrency.max(1);
    let outcomes: Vec<Result<Vec<crate::state::Evidence>>> = stream::iter(elements.into_iter().map(|scope| {
        let adapter = adapter.clone();
        let identity = state.identity.clone();
        let step_name = step.name.clone();
        let params = step.params.clone();
        let retry_max = step.retry_max;
        async move {
            let expanded = template::expand_map(&params, &scope)?;
            call_with_retry(adapter, identity, step_name, expanded, timeout, retry_max).await
        }
    }))
    .buffered(concurrency)
    .collect()
    .await;

    let mut gathered = Vec::new();
    let mut first_error: Option<Error> = None;
    for outcome in outcomes {
        match outcome {
            Ok(mut evidence) => gathered.append(&mut evidence),
            Err(e) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
    }

    if let Some(error) = first_error {
        return handle_failure(state, step, error, &span, span_sink);
    }

    let (appended, dropped) = state.append_evidence(gathered, limits.evidence_cap);
    state.step_outcomes.push((step.name.clone(), StepOutcome::Ran { evidence_count: appended }));

    if let Some(save_as) = &step.save_as {
        let start = state.evidence.len() - appended;
        state.vars.insert(
            save_as.clone(),
            Value::List(state.evidence[start..].iter().map(evidence_to_value).collect()),
        );
    }

    span_sink.emit(
        &span
            .with_output_summary(format!("evidence_appended={appended} dropped_for_cap={dropped}"))
            .finish_ok(),
    );
    Ok(())
}

fn handle_failure(state: &mut State, step: &Step, error: Error, span: &Span, span_sink: &dyn SpanSink) -> Result<()> {
    state.record_error(step.name.clone(), &error);
    state.step_outcomes.push((
        step.name.clone(),
        StepOutcome::Failed { error: crate::state::ErrorRecord::from_error(step.name.clone(), &error) },
    ));
    span_sink.emit(&span.clone().finish_error(error.to_string()));

    match step.on_error {
        OnError::Abort => Err(error),
        OnError::Continue | OnError::Retry => Ok(()),
    }
}

fn evidence_to_value(evidence: &crate::state::Evidence) -> Value {
    let mut map = HashMap::new();
    map.insert("title".to_string(), Value::String(evidence.title.clone()));
    map.insert("url".to_string(), Value::String(evidence.url.clone()));
    map.insert("snippet".to_string(), Value::String(evidence.snippet.clone()));
    Value::Map(map)
}

async fn call_with_retry(
    adapter: std::sync::Arc<dyn crate::adapter::Adapter>,
    identity: HashMap<String, String>,
    step_name: String,
    params: HashMap<String, serde_json::Value>,
    timeout: Duration,
    retry_max: u32,
) -> Result<Vec<crate::state::Evidence>> {
    let mut attempt = 0;
    loop {
        let ctx = AdapterContext::new(identity.clone(), step_name.clone(), timeout);
        let result = tokio::time::timeout(timeout, adapter.call(&ctx, &params)).await;

        let outcome = match result {
            Ok(inner) => inner,
            Err(_) => Err(Error::timeout(timeout.as_millis() as u64)),
        };

        match outcome {
            Ok(output) => return Ok(output.results),
            Err(error) => {
                if attempt >= retry_max || !error.is_retryable() {
                    return Err(error);
                }
                tokio::time::sleep(backoff(attempt)).await;
                attempt += 1;
            }
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    let exp = BASE_BACKOFF_MS.saturating_mul(1u64 << attempt.min(16));
    let capped = exp.min(MAX_BACKOFF_MS);
    let jitter_frac = rand::thread_rng().gen_range(-0.25..=0.25);
    let jittered = (capped as f64) * (1.0 + jitter_frac);
    Duration::from_millis(jittered.max(1.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdapterErrorKind;
    use crate::span::BufferingSpanSink;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingAdapter {
        key: &'static str,
        calls: Arc<AtomicUsize>,
        fail_until: usize,
    }

    #[async_trait]
    impl crate::adapter::Adapter for CountingAdapter {
        fn key(&self) -> &str {
            self.key
        }
        fn capabilities(&self) -> HashSet<String> {
            HashSet::from([self.key.to_string()])
        }
        async fn call(
            &self,
            _ctx: &AdapterContext,
            params: &HashMap<String, serde_json::Value>,
        ) -> Result<crate::adapter::AdapterOutput> {
            let call_index = self.calls.fetch_add(1, Ordering::SeqCst);
            if call_index < self.fail_until {
                return Err(Error::adapter(self.key, "blip", AdapterErrorKind::Transient));
            }
            let title = params.get("query").and_then(|v| v.as_str()).unwrap_or("result").to_string();
            Ok(crate::adapter::AdapterOutput::new(vec![crate::state::Evidence::new(self.key, title)]))
        }
    }

    fn step(name: &str, uses: &str) -> Step {
        Step {
            name: name.to_string(),
            uses: uses.to_string(),
            params: HashMap::from([("query".to_string(), serde_json::json!("{{topic}}"))]),
            when: None,
            for_each: None,
            r#as: "item".to_string(),
            save_as: Some("results".to_string()),
            on_error: OnError::Continue,
            retry_max: 2,
            timeout_secs: None,
        }
    }

    #[tokio::test]
    async fn test_happy_path_appends_evidence_and_sets_save_as() {
        let mut state = State::new("Rust", HashMap::new());
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(CountingAdapter { key: "web_search", calls: Arc::new(AtomicUsize::new(0)), fail_until: 0 }));
        let limits = LimitsConfig::default();
        let sink = BufferingSpanSink::new();

        run(&mut state, &step("search", "web_search"), &registry, &limits, &sink).await.unwrap();

        assert_eq!(state.evidence.len(), 1);
        assert!(state.vars.contains_key("results"));
        assert!(matches!(state.step_outcomes[0].1, StepOutcome::Ran { evidence_count: 1 }));
    }

    #[tokio::test]
    async fn test_when_guard_skips_step() {
        let mut state = State::new("Rust", HashMap::new());
        let registry = AdapterRegistry::new();
        let limits = LimitsConfig::default();
        let sink = BufferingSpanSink::new();

        let mut s = step("search", "web_search");
        s.when = Some("{{missing}}".to_string());

        run(&mut state, &s, &registry, &limits, &sink).await.unwrap();
        assert!(state.evidence.is_empty());
        assert!(matches!(state.step_outcomes[0].1, StepOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_succeeds() {
        let mut state = State::new("Rust", HashMap::new());
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(CountingAdapter { key: "web_search", calls: Arc::new(AtomicUsize::new(0)), fail_until: 1 }));
        let limits = LimitsConfig::default();
        let sink = BufferingSpanSink::new();

        run(&mut state, &step("search", "web_search"), &registry, &limits, &sink).await.unwrap();
        assert_eq!(state.evidence.len(), 1);
    }

    #[tokio::test]
    async fn test_continue_on_error_records_failure_without_aborting() {
        let mut state = State::new("Rust", HashMap::new());
        let registry = AdapterRegistry::new();
        let limits = LimitsConfig::default();
        let sink = BufferingSpanSink::new();

        let result = run(&mut state, &step("search", "web_search"), &registry, &limits, &sink).await;
        assert!(result.is_ok());
        assert!(matches!(state.step_outcomes[0].1, StepOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_abort_on_error_propagates() {
        let mut state = State::new("Rust", HashMap::new());
        let registry = AdapterRegistry::new();
        let limits = LimitsConfig::default();
        let sink = BufferingSpanSink::new();

        let mut s = step("search", "web_search");
        s.on_error = OnError::Abort;

        let result = run(&mut state, &s, &registry, &limits, &sink).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_for_each_fans_out_preserving_order() {
        let mut state = State::new("Rust", HashMap::new());
        state.vars.insert(
            "symbols".to_string(),
            Value::List(vec![Value::String("A".to_string()), Value::String("B".to_string()), Value::String("C".to_string())]),
        );
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(CountingAdapter { key: "web_search", calls: Arc::new(AtomicUsize::new(0)), fail_until: 0 }));
        let limits = LimitsConfig::default();
        let sink = BufferingSpanSink::new();

        let mut s = step("search", "web_search");
        s.for_each = Some("symbols".to_string());
        s.params = HashMap::from([("query".to_string(), serde_json::json!("{{item}}"))]);

        run(&mut state, &s, &registry, &limits, &sink).await.unwrap();
        assert_eq!(state.evidence.len(), 3);
        let titles: Vec<&str> = state.evidence.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_for_each_missing_list_continues_on_error() {
        let mut state = State::new("Rust", HashMap::new());
        let registry = AdapterRegistry::new();
        let limits = LimitsConfig::default();
        let sink = BufferingSpanSink::new();

        let mut s = step("search", "web_search");
        s.for_each = Some("vars.missing_list".to_string());

        let result = run(&mut state, &s, &registry, &limits, &sink).await;
        assert!(result.is_ok());
        assert!(state.evidence.is_empty());
        assert!(matches!(state.step_outcomes[0].1, StepOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_for_each_missing_list_aborts_when_on_error_abort() {
        let mut state = State::new("Rust", HashMap::new());
        let registry = AdapterRegistry::new();
        let limits = LimitsConfig::default();
        let sink = BufferingSpanSink::new();

        let mut s = step("search", "web_search");
        s.for_each = Some("vars.missing_list".to_string());
        s.on_error = OnError::Abort;

        let result = run(&mut state, &s, &registry, &limits, &sink).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_save_as_preserves_forward_order() {
        let mut state = State::new("Rust", HashMap::new());
        state.vars.insert(
            "symbols".to_string(),
            Value::List(vec![Value::String("A".to_string()), Value::String("B".to_string()), Value::String("C".to_string())]),
        );
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(CountingAdapter { key: "web_search", calls: Arc::new(AtomicUsize::new(0)), fail_until: 0 }));
        let limits = LimitsConfig::default();
        let sink = BufferingSpanSink::new();

        let mut s = step("search", "web_search");
        s.for_each = Some("symbols".to_string());
        s.params = HashMap::from([("query".to_string(), serde_json::json!("{{item}}"))]);

        run(&mut state, &s, &registry, &limits, &sink).await.unwrap();
        let Some(Value::List(saved)) = state.vars.get("results") else {
            panic!("expected results var to be a list");
        };
        let saved_titles: Vec<String> = saved
            .iter()
            .map(|v| match v {
                Value::Map(m) => match m.get("title") {
                    Some(Value::String(s)) => s.clone(),
                    _ => panic!("expected title string"),
                },
                _ => panic!("expected map"),
            })
            .collect();
        assert_eq!(saved_titles, vec!["A", "B", "C"]);
    }
}
