//! Fill: resolve every strategy variable to a concrete value before the
//! Research phase's runtime plan is locked in.
//!
//! Resolution order per variable source: `from_request` reads the inbound
//! request, `from_scope` reads what Scope just set, `llm_fill` variables are
//! batched into a single LLM call. A required variable with no default that
//! still has no value after fill is a hard `config` error.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration as ChronoDuration;

use crate::clock::Clock;
use crate::config::{ModelPurpose, Settings};
use crate::error::{Error, Result};
use crate::llm::LLMClient;
use crate::module::{Module, Predict, PredictConfig};
use crate::signatures::{FillVariables, FillVariablesInputs};
use crate::span::{Span, SpanKind, SpanSink};
use crate::state::State;
use crate::strategy::{Strategy, VariableSource};
use crate::template::Value;

use super::ResearchRequest;

pub async fn run(
    state: &mut State,
    strategy: &Strategy,
    request: &ResearchRequest,
    settings: &Settings,
    llm_client: Arc<dyn LLMClient>,
    clock: &dyn Clock,
    span_sink: &dyn SpanSink,
) -> Result<()> {
    let span = Span::start(SpanKind::Phase, "fill");
    let result = resolve(state, strategy, request, settings, llm_client, clock).await;

    match &result {
        Ok(()) => span_sink.emit(&span.with_output_summary(format!("vars={}", state.vars.len())).finish_ok()),
        Err(e) => span_sink.emit(&span.finish_error(e.to_string())),
    }

    result
}

async fn resolve(
    state: &mut State,
    strategy: &Strategy,
    request: &ResearchRequest,
    settings: &Settings,
    llm_client: Arc<dyn LLMClient>,
    clock: &dyn Clock,
) -> Result<()> {
    let mut vars: HashMap<String, Value> = HashMap::new();
    let mut missing = Vec::new();

    for variable in &strategy.variables {
        match &variable.source {
            VariableSource::FromRequest { field } => {
                let value = resolve_from_request(field, state, request)?;
                vars.insert(variable.name.clone(), value);
            }
            VariableSource::FromScope => {
                let value = match variable.name.as_str() {
                    "category" => state.category.clone(),
                    "time_window" => state.time_window.clone(),
                    "depth" => state.depth.clone(),
                    other => {
                        return Err(Error::config(format!(
                            "variable '{other}' declared from_scope has no corresponding scope field"
                        )))
                    }
                };
                vars.insert(variable.name.clone(), value.map(Value::String).unwrap_or(Value::Null));
            }
            VariableSource::LlmFill => missing.push(variable.clone()),
        }
    }

    if !missing.is_empty() {
        let resolved = fill_via_llm(state, &missing, settings, llm_client).await;
        for variable in &missing {
            let value = resolved.as_ref().ok().and_then(|by_name: &HashMap<String, String>| by_name.get(&variable.name).cloned());
            match value {
                Some(v) => {
                    vars.insert(variable.name.clone(), Value::String(v));
                }
                None => match &variable.default {
                    Some(default) => {
                        vars.insert(variable.name.clone(), Value::from_json(default));
                    }
                    None if variable.required => {
                        return Err(Error::config(format!(
                            "required variable '{}' has no value and no default",
                            variable.name
                        )));
                    }
                    None => {
                        vars.insert(variable.name.clone(), Value::Null);
                    }
                },
            }
        }
    }

    expand_time_window(&mut vars, state.time_window.as_deref().unwrap_or("day"), clock.now());

    state.vars = vars;
    state.runtime_plan = strategy.tool_chain.clone();
    state.phase = crate::state::Phase::Filled;
    Ok(())
}

fn resolve_from_request(field: &str, state: &State, request: &ResearchRequest) -> Result<Value> {
    match field {
        "topic" => Ok(Value::String(state.user_request.clone())),
        "identity" => Ok(Value::Map(
            state.identity.iter().map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect(),
        )),
        "depth_override" => Ok(request.depth_override.clone().map(Value::String).unwrap_or(Value::Null)),
        "strategy_hint" => Ok(request.strategy_hint.clone().map(Value::String).unwrap_or(Value::Null)),
        other => Err(Error::config(format!("unknown from_request field '{other}'"))),
    }
}

async fn fill_via_llm(
    state: &State,
    missing: &[crate::strategy::StrategyVariable],
    settings: &Settings,
    llm_client: Arc<dyn LLMClient>,
) -> Result<HashMap<String, String>> {
    let model = settings.models.get(ModelPurpose::Fill);
    let predict = Predict::<FillVariables>::with_lm(llm_client).with_config(
        PredictConfig::new()
            .with_model(model.model.clone())
            .with_temperature(model.temperature)
            .with_max_tokens(model.max_tokens),
    );

    let inputs = FillVariablesInputs {
        topic: state.user_request.clone(),
        missing_variables: missing
            .iter()
            .map(|v| format!("{} — {}", v.name, v.description))
            .collect(),
    };

    let outputs = predict.forward(inputs).await?;
    Ok(outputs.values.into_iter().map(|fv| (fv.name, fv.value)).collect())
}

/// Expand `time_window` into concrete `time_window_start`/`time_window_end`
/// bounds measured back from `now`. Strategies that never reference these
/// variables simply ignore them.
fn expand_time_window(vars: &mut HashMap<String, Value>, window: &str, now: chrono::DateTime<chrono::Utc>) {
    let span = match window {
        "day" => ChronoDuration::days(1),
        "week" => ChronoDuration::weeks(1),
        "month" => ChronoDuration::days(30),
        _ => ChronoDuration::days(1),
    };
    vars.entry("time_window_start".to_string())
        .or_insert_with(|| Value::String((now - span).to_rfc3339()));
    vars.entry("time_window_end".to_string()).or_insert_with(|| Value::String(now.to_rfc3339()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::llm::{ChatMessage, CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, Provider, StopReason, TokenUsage};
    use crate::span::BufferingSpanSink;
    use crate::strategy::StrategyVariable;
    use async_trait::async_trait;
    use chrono::TimeZone;

    struct StubClient {
        response: String,
    }

    #[async_trait]
    impl LLMClient for StubClient {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
            Ok(CompletionResponse {
                id: "stub".to_string(),
                model: "stub".to_string(),
                content: self.response.clone(),
                stop_reason: Some(StopReason::EndTurn),
                usage: TokenUsage::default(),
                timestamp: chrono::Utc::now(),
                cost: None,
            })
        }
        async fn embed(&self, _request: EmbeddingRequest) -> Result<EmbeddingResponse> {
            unimplemented!()
        }
        fn provider(&self) -> Provider {
            Provider::Anthropic
        }
        fn available_models(&self) -> Vec<crate::llm::ModelSpec> {
            Vec::new()
        }
    }

    fn base_strategy(variables: Vec<StrategyVariable>) -> Strategy {
        Strategy {
            slug: "s".to_string(),
            version: "1".to_string(),
            category: "news".to_string(),
            time_window: "day".to_string(),
            depth: "brief".to_string(),
            variables,
            tool_chain: Vec::new(),
            output_spec: crate::strategy::OutputSpec::default(),
        }
    }

    fn clock_2026() -> FixedClock {
        FixedClock(chrono::Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap())
    }

    #[tokio::test]
    async fn test_from_request_and_from_scope_resolve_without_llm() {
        let strategy = base_strategy(vec![
            StrategyVariable {
                name: "topic".to_string(),
                source: VariableSource::FromRequest { field: "topic".to_string() },
                description: String::new(),
                default: None,
                required: true,
            },
            StrategyVariable {
                name: "category".to_string(),
                source: VariableSource::FromScope,
                description: String::new(),
                default: None,
                required: true,
            },
        ]);

        let mut state = State::new("Rust news", HashMap::new());
        state.category = Some("news".to_string());
        state.time_window = Some("day".to_string());
        let request = ResearchRequest::new("Rust news");
        let settings = Settings::default();
        let client: Arc<dyn LLMClient> = Arc::new(StubClient { response: String::new() });
        let clock = clock_2026();
        let sink = BufferingSpanSink::new();

        run(&mut state, &strategy, &request, &settings, client, &clock, &sink).await.unwrap();

        assert_eq!(state.vars.get("topic"), Some(&Value::String("Rust news".to_string())));
        assert_eq!(state.vars.get("category"), Some(&Value::String("news".to_string())));
        assert_eq!(state.phase, crate::state::Phase::Filled);
        assert_eq!(state.runtime_plan.len(), strategy.tool_chain.len());
    }

    #[tokio::test]
    async fn test_llm_fill_resolves_missing_variables() {
        let strategy = base_strategy(vec![StrategyVariable {
            name: "symbol".to_string(),
            source: VariableSource::LlmFill,
            description: "the stock ticker to track".to_string(),
            default: None,
            required: true,
        }]);

        let mut state = State::new("Acme Corp earnings", HashMap::new());
        state.time_window = Some("day".to_string());
        let request = ResearchRequest::new("Acme Corp earnings");
        let settings = Settings::default();
        let client: Arc<dyn LLMClient> = Arc::new(StubClient {
            response: r#"{"values": [{"name": "symbol", "value": "ACME"}]}"#.to_string(),
        });
        let clock = clock_2026();
        let sink = BufferingSpanSink::new();

        run(&mut state, &strategy, &request, &settings, client, &clock, &sink).await.unwrap();
        assert_eq!(state.vars.get("symbol"), Some(&Value::String("ACME".to_string())));
    }

    #[tokio::test]
    async fn test_missing_required_variable_with_no_default_is_config_error() {
        let strategy = base_strategy(vec![StrategyVariable {
            name: "symbol".to_string(),
            source: VariableSource::LlmFill,
            description: "ticker".to_string(),
            default: None,
            required: true,
        }]);

        let mut state = State::new("topic", HashMap::new());
        state.time_window = Some("day".to_string());
        let request = ResearchRequest::new("topic");
        let settings = Settings::default();
        let client: Arc<dyn LLMClient> = Arc::new(StubClient { response: "not json".to_string() });
        let clock = clock_2026();
        let sink = BufferingSpanSink::new();

        let err = run(&mut state, &strategy, &request, &settings, client, &clock, &sink).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_missing_optional_variable_falls_back_to_default() {
        let strategy = base_strategy(vec![StrategyVariable {
            name: "region".to_string(),
            source: VariableSource::LlmFill,
            description: "region to focus on".to_string(),
            default: Some(serde_json::json!("global")),
            required: false,
        }]);

        let mut state = State::new("topic", HashMap::new());
        state.time_window = Some("day".to_string());
        let request = ResearchRequest::new("topic");
        let settings = Settings::default();
        let client: Arc<dyn LLMClient> = Arc::new(StubClient { response: "not json".to_string() });
        let clock = clock_2026();
        let sink = BufferingSpanSink::new();

        run(&mut state, &strategy, &request, &settings, client, &clock, &sink).await.unwrap();
        assert_eq!(state.vars.get("region"), Some(&Value::String("global".to_string())));
    }

    #[tokio::test]
    async fn test_time_window_expands_to_concrete_bounds() {
        let strategy = base_strategy(Vec::new());
        let mut state = State::new("topic", HashMap::new());
        state.time_window = Some("week".to_string());
        let request = ResearchRequest::new("topic");
        let settings = Settings::default();
        let client: Arc<dyn LLMClient> = Arc::new(StubClient { response: String::new() });
        let clock = clock_2026();
        let sink = BufferingSpanSink::new();

        run(&mut state, &strategy, &request, &settings, client, &clock, &sink).await.unwrap();

        let start = state.vars.get("time_window_start").unwrap().as_str().unwrap().to_string();
        let end = state.vars.get("time_window_end").unwrap().as_str().unwrap().to_string();
        assert!(end > start);
    }

    #[tokio::test]
    async fn test_identity_from_request_flows_into_vars() {
        let strategy = base_strategy(vec![StrategyVariable {
            name: "identity".to_string(),
            source: VariableSource::FromRequest { field: "identity".to_string() },
            description: String::new(),
            default: None,
            required: false,
        }]);

        let mut identity = HashMap::new();
        identity.insert("user_id".to_string(), "u-1".to_string());
        let mut state = State::new("topic", identity);
        state.time_window = Some("day".to_string());
        let request = ResearchRequest::new("topic");
        let settings = Settings::default();
        let client: Arc<dyn LLMClient> = Arc::new(StubClient { response: String::new() });
        let clock = clock_2026();
        let sink = BufferingSpanSink::new();

        run(&mut state, &strategy, &request, &settings, client, &clock, &sink).await.unwrap();
        match state.vars.get("identity") {
            Some(Value::Map(m)) => assert_eq!(m.get("user_id"), Some(&Value::String("u-1".to_string()))),
            other => panic!("expected identity map, got {other:?}"),
        }
    }
}
