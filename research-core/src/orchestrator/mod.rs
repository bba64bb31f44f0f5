//! The four-phase orchestration pipeline: Scope → Fill → Research → Finalize.
//!
//! [`Orchestrator::run`] drives one [`ResearchRequest`] through `State`'s
//! documented transitions (`Init → Scoped → Filled → Researched →
//! Finalized | Failed`), producing a [`ResearchResult`] rather than
//! propagating a hard error for any failure a deployment should expect to
//! see routinely (unknown strategy, no evidence gathered, a malformed LLM
//! response that survives every fallback) — those become `status: Failed`
//! results so a batch run over many subscriptions can isolate one bad
//! request without losing the rest.

pub mod finalize;
pub mod fill;
pub mod research;
pub mod scope;
pub mod step_executor;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::adapter::AdapterRegistry;
use crate::clock::{Clock, SystemClock};
use crate::config::Settings;
use crate::error::Result;
use crate::llm::LLMClient;
use crate::span::{Span, SpanKind, SpanSink, TracingSpanSink};
use crate::state::{Citation, Phase, RunStatus, Section, State};
use crate::strategy::StrategyRegistry;

/// One inbound request to research a topic, either on demand or as the
/// per-subscription unit a [`crate::batch_runner::BatchRunner`] dispatches.
#[derive(Debug, Clone)]
pub struct ResearchRequest {
    pub topic: String,
    pub identity: HashMap<String, String>,
    pub strategy_hint: Option<String>,
    pub depth_override: Option<String>,
}

impl ResearchRequest {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            identity: HashMap::new(),
            strategy_hint: None,
            depth_override: None,
        }
    }

    pub fn with_identity(mut self, identity: HashMap<String, String>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_strategy_hint(mut self, hint: impl Into<String>) -> Self {
        self.strategy_hint = Some(hint.into());
        self
    }

    pub fn with_depth_override(mut self, depth: impl Into<String>) -> Self {
        self.depth_override = Some(depth.into());
        self
    }
}

/// Metadata describing how a [`Briefing`] was produced, independent of its
/// content.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BriefingMetadata {
    pub strategy_slug: Option<String>,
    pub category: Option<String>,
    pub time_window: Option<String>,
    pub depth: Option<String>,
    pub evidence_count: usize,
    /// Count of step-level error records accumulated across the run (§7).
    pub error_count: usize,
    /// Count of steps whose `when` guard evaluated false (§7).
    pub skipped_count: usize,
    pub started_at: DateTime<Utc>,
}

/// The finished output of a successful run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Briefing {
    pub topic: String,
    pub sections: Vec<Section>,
    pub citations: Vec<Citation>,
    pub metadata: BriefingMetadata,
}

/// The outcome of one `Orchestrator::run` call.
#[derive(Debug, Clone)]
pub struct ResearchResult {
    pub status: RunStatus,
    pub briefing: Option<Briefing>,
    pub error: Option<String>,
}

impl ResearchResult {
    fn failed(error: impl Into<String>) -> Self {
        Self { status: RunStatus::Failed, briefing: None, error: Some(error.into()) }
    }
}

/// Construction-time configuration for an [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub settings: Settings,
}

impl OrchestratorConfig {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { settings: Settings::default() }
    }
}

/// Drives one request through Scope, Fill, Research and Finalize.
pub struct Orchestrator {
    strategies: Arc<StrategyRegistry>,
    adapters: Arc<AdapterRegistry>,
    config: OrchestratorConfig,
    llm_client: Arc<dyn LLMClient>,
    span_sink: Arc<dyn SpanSink>,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    pub fn new(
        strategies: StrategyRegistry,
        adapters: AdapterRegistry,
        config: OrchestratorConfig,
        llm_client: Arc<dyn LLMClient>,
    ) -> Self {
        Self {
            strategies: Arc::new(strategies),
            adapters: Arc::new(adapters),
            config,
            llm_client,
            span_sink: Arc::new(TracingSpanSink),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_span_sink(mut self, span_sink: Arc<dyn SpanSink>) -> Self {
        self.span_sink = span_sink;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn run(&self, request: ResearchRequest) -> Result<ResearchResult> {
        let trace = Span::start(SpanKind::Trace, "run_research");
        let mut state = State::new(request.topic.clone(), request.identity.clone());

        let strategy = match scope::run(
            &mut state,
            &self.strategies,
            &request,
            &self.config.settings,
            Arc::clone(&self.llm_client),
            self.span_sink.as_ref(),
        )
        .await
        {
            Ok(strategy) => strategy,
            Err(e) => {
                state.phase = Phase::Failed;
                state.record_error("scope", &e);
                self.span_sink.emit(&trace.finish_error(e.to_string()));
                return Ok(ResearchResult::failed(e.to_string()));
            }
        };

        if let Err(e) = fill::run(
            &mut state,
            &strategy,
            &request,
            &self.config.settings,
            Arc::clone(&self.llm_client),
            self.clock.as_ref(),
            self.span_sink.as_ref(),
        )
        .await
        {
            state.phase = Phase::Failed;
            state.record_error("fill", &e);
            self.span_sink.emit(&trace.finish_error(e.to_string()));
            return Ok(ResearchResult::failed(e.to_string()));
        }

        if let Err(e) = research::run(&mut state, &self.adapters, &self.config.settings.limits, self.span_sink.as_ref()).await {
            state.phase = Phase::Failed;
            state.record_error("research", &e);
            self.span_sink.emit(&trace.finish_error(e.to_string()));
            return Ok(ResearchResult::failed(e.to_string()));
        }

        finalize::run(&mut state, &strategy, &self.config.settings, Arc::clone(&self.llm_client), self.span_sink.as_ref())
            .await?;

        let result = match state.phase {
            Phase::Finalized => ResearchResult {
                status: RunStatus::Completed,
                briefing: Some(Briefing {
                    topic: state.user_request.clone(),
                    sections: state.sections.clone(),
                    citations: state.citations.clone(),
                    metadata: BriefingMetadata {
                        strategy_slug: state.strategy_slug.clone(),
                        category: state.category.clone(),
                        time_window: state.time_window.clone(),
                        depth: state.depth.clone(),
                        evidence_count: state.evidence.len(),
                        error_count: state.errors.len(),
                        skipped_count: state
                            .step_outcomes
                            .iter()
                            .filter(|(_, outcome)| matches!(outcome, crate::state::StepOutcome::Skipped { .. }))
                            .count(),
                        started_at: state.started_at,
                    },
                }),
                error: None,
            },
            _ => ResearchResult::failed("finalize produced no sections"),
        };

        self.span_sink.emit(
            &trace
                .with_output_summary(format!("status={:?}", result.status))
                .finish_ok(),
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatMessage, CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, Provider, StopReason, TokenUsage};
    use crate::strategy::{OnError, OutputSpec, Step, StrategyLoader, StrategyVariable, VariableSource};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedClient {
        responses: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<&str>) -> Self {
            Self { responses: Mutex::new(responses.into_iter().map(str::to_string).rev().collect()) }
        }
    }

    #[async_trait]
    impl LLMClient for ScriptedClient {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse> {
            let content = self.responses.lock().unwrap().pop().unwrap_or_default();
            Ok(CompletionResponse {
                id: "stub".to_string(),
                model: "stub".to_string(),
                content,
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

    fn news_strategy() -> crate::strategy::Strategy {
        crate::strategy::Strategy {
            slug: "daily_news".to_string(),
            version: "1".to_string(),
            category: "news".to_string(),
            time_window: "day".to_string(),
            depth: "brief".to_string(),
            variables: vec![StrategyVariable {
                name: "topic".to_string(),
                source: VariableSource::FromRequest { field: "topic".to_string() },
                description: String::new(),
                default: None,
                required: true,
            }],
            tool_chain: vec![Step {
                name: "search".to_string(),
                uses: "web_search".to_string(),
                params: HashMap::from([("query".to_string(), serde_json::json!("{{topic}}"))]),
                when: None,
                for_each: None,
                r#as: "item".to_string(),
                save_as: Some("results".to_string()),
                on_error: OnError::Continue,
                retry_max: 1,
                timeout_secs: None,
            }],
            output_spec: OutputSpec::default(),
        }
    }

    fn registry_with(strategies: Vec<crate::strategy::Strategy>) -> StrategyRegistry {
        let dir = tempfile::tempdir().unwrap();
        for (i, s) in strategies.iter().enumerate() {
            std::fs::write(dir.path().join(format!("{i}.yaml")), serde_yaml::to_string(s).unwrap()).unwrap();
        }
        let loader = StrategyLoader::new(std::collections::HashSet::from(["web_search".to_string()]), std::collections::HashSet::new());
        loader.load(dir.path()).unwrap()
    }

    struct StubSearchAdapter;

    #[async_trait]
    impl crate::adapter::Adapter for StubSearchAdapter {
        fn key(&self) -> &str {
            "web_search"
        }
        fn capabilities(&self) -> std::collections::HashSet<String> {
            std::collections::HashSet::from(["web_search".to_string()])
        }
        async fn call(
            &self,
            _ctx: &crate::adapter::AdapterContext,
            _params: &HashMap<String, serde_json::Value>,
        ) -> Result<crate::adapter::AdapterOutput> {
            Ok(crate::adapter::AdapterOutput::new(vec![
                crate::state::Evidence::new("web_search", "Breaking development").with_url("https://news.example.com/a").with_snippet("details"),
                crate::state::Evidence::new("web_search", "Follow-up coverage").with_url("https://news.example.com/b").with_snippet("more details"),
                crate::state::Evidence::new("web_search", "Analyst reaction").with_url("https://news.example.com/c").with_snippet("reaction"),
            ]))
        }
    }

    fn orchestrator_with(client: Arc<dyn LLMClient>) -> Orchestrator {
        let strategies = registry_with(vec![news_strategy()]);
        let mut adapters = AdapterRegistry::new();
        adapters.register(Arc::new(StubSearchAdapter));
        Orchestrator::new(strategies, adapters, OrchestratorConfig::default(), client)
            .with_span_sink(Arc::new(crate::span::BufferingSpanSink::new()))
    }

    #[tokio::test]
    async fn test_happy_path_produces_completed_briefing() {
        let write_response = format!(
            r#"{{"sections": [{{"heading": "Overview", "body": "{}", "cited_indices": [0, 1, 2]}}]}}"#,
            "word ".repeat(60)
        );
        let client: Arc<dyn LLMClient> = Arc::new(ScriptedClient::new(vec![
            r#"{"clusters": [{"label": "all", "member_indices": [0, 1, 2]}]}"#,
            r#"{"key_facts": ["fact"], "analysis": "a grounded take on the gathered evidence"}"#,
            &write_response,
        ]));
        let orchestrator = orchestrator_with(client);

        let request = ResearchRequest::new("Acme Corp earnings").with_strategy_hint("daily_news");
        let result = orchestrator.run(request).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        let briefing = result.briefing.unwrap();
        assert_eq!(briefing.sections.len(), 1);
        assert_eq!(briefing.citations.len(), 3);
        assert_eq!(briefing.metadata.strategy_slug.as_deref(), Some("daily_news"));
    }

    #[tokio::test]
    async fn test_unknown_strategy_hint_yields_failed_status_not_an_error() {
        let client: Arc<dyn LLMClient> = Arc::new(ScriptedClient::new(vec![]));
        let orchestrator = orchestrator_with(client);

        let request = ResearchRequest::new("topic").with_strategy_hint("nonexistent");
        let result = orchestrator.run(request).await.unwrap();

        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.briefing.is_none());
        assert!(result.error.is_some());
    }
}
