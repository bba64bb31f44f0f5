//! Scope: resolve the request to a strategy, either directly via an
//! explicit `strategy_hint` or by classifying the topic through an LLM call
//! and looking the resulting shape up in the registry.

use std::sync::Arc;

use crate::config::{ModelPurpose, Settings};
use crate::error::{Error, Result};
use crate::llm::LLMClient;
use crate::module::{Module, Predict, PredictConfig};
use crate::signatures::{CategorizeTopic, CategorizeTopicInputs};
use crate::span::{Span, SpanKind, SpanSink};
use crate::state::State;
use crate::strategy::{Strategy, StrategyRegistry};

use super::ResearchRequest;

pub async fn run(
    state: &mut State,
    registry: &StrategyRegistry,
    request: &ResearchRequest,
    settings: &Settings,
    llm_client: Arc<dyn LLMClient>,
    span_sink: &dyn SpanSink,
) -> Result<Strategy> {
    let span = Span::start(SpanKind::Phase, "scope");

    let result = resolve(state, registry, request, settings, llm_client).await;

    match &result {
        Ok(strategy) => {
            span_sink.emit(
                &span
                    .with_output_summary(format!("strategy={}", strategy.slug))
                    .finish_ok(),
            );
        }
        Err(e) => {
            span_sink.emit(&span.finish_error(e.to_string()));
        }
    }

    result
}

async fn resolve(
    state: &mut State,
    registry: &StrategyRegistry,
    request: &ResearchRequest,
    settings: &Settings,
    llm_client: Arc<dyn LLMClient>,
) -> Result<Strategy> {
    let strategy = if let Some(hint) = &request.strategy_hint {
        let strategy = registry
            .get(hint)
            .ok_or_else(|| Error::input(format!("unknown strategy slug '{hint}'")))?
            .clone();
        state.category = Some(strategy.category.clone());
        state.time_window = Some(strategy.time_window.clone());
        state.depth = Some(request.depth_override.clone().unwrap_or_else(|| strategy.depth.clone()));
        strategy
    } else {
        let model = settings.models.get(ModelPurpose::Scope);
        let predict = Predict::<CategorizeTopic>::with_lm(llm_client).with_config(
            PredictConfig::new()
                .with_model(model.model.clone())
                .with_temperature(model.temperature)
                .with_max_tokens(model.max_tokens),
        );
        let outputs = predict
            .forward(CategorizeTopicInputs { topic: state.user_request.clone() })
            .await?;

        state.category = Some(outputs.category.clone());
        state.time_window = Some(outputs.time_window.clone());
        let depth = request.depth_override.clone().unwrap_or(outputs.depth.clone());
        state.depth = Some(depth.clone());

        registry
            .find_by_shape(&outputs.category, &outputs.time_window, &depth)
            .ok_or_else(|| {
                Error::input(format!(
                    "no strategy registered for shape (category={}, time_window={}, depth={})",
                    outputs.category, outputs.time_window, depth
                ))
            })?
            .clone()
    };

    state.strategy_slug = Some(strategy.slug.clone());
    state.phase = crate::state::Phase::Scoped;
    Ok(strategy)
}
