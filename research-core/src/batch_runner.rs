//! Batch Runner: per-subscription fan-out of recurring executions.
//!
//! Given a frequency (`daily`/`weekly`/`monthly`), the runner pulls active
//! subscriptions from a [`SubscriptionStore`], drives the [`crate::Orchestrator`]
//! for each one concurrently (bounded by a configurable worker count, the
//! same `Semaphore` + `join_all` shape `llm::batch::BatchExecutor` uses for
//! provider calls), and delivers one structured [`BatchResult`] per
//! subscription to a [`DeliverySink`]. A single subscription's failure never
//! aborts the batch or is allowed to affect another subscription's result.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::error::Result;
use crate::orchestrator::{Briefing, Orchestrator, ResearchRequest, ResearchResult};
use crate::state::RunStatus;

/// Default number of subscriptions run concurrently within one `RunBatch`.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// The recurrence label a batch run is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionFrequency {
    Daily,
    Weekly,
    Monthly,
}

impl std::fmt::Display for SubscriptionFrequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        };
        write!(f, "{s}")
    }
}

/// One recurring subscription record as read from the external store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub topic: String,
    pub identity: std::collections::HashMap<String, String>,
    pub strategy_hint: Option<String>,
}

impl Subscription {
    pub fn new(id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            identity: std::collections::HashMap::new(),
            strategy_hint: None,
        }
    }

    pub fn with_identity(mut self, identity: std::collections::HashMap<String, String>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_strategy_hint(mut self, hint: impl Into<String>) -> Self {
        self.strategy_hint = Some(hint.into());
        self
    }

    fn into_request(self) -> ResearchRequest {
        let mut request = ResearchRequest::new(self.topic).with_identity(self.identity);
        if let Some(hint) = self.strategy_hint {
            request = request.with_strategy_hint(hint);
        }
        request
    }
}

/// Read-only lookup by frequency, external to the core (§6, "Subscription store").
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn active_subscriptions(&self, frequency: SubscriptionFrequency) -> Result<Vec<Subscription>>;
}

/// The structured, per-subscription delivery payload (§6's "Delivery sink").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub subscription_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
    pub briefing: Option<Briefing>,
}

impl BatchResult {
    fn from_research(subscription_id: String, started_at: DateTime<Utc>, result: ResearchResult) -> Self {
        Self {
            subscription_id,
            status: result.status,
            started_at,
            finished_at: Utc::now(),
            error: result.error,
            briefing: result.briefing,
        }
    }

    fn from_fatal_error(subscription_id: String, started_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            subscription_id,
            status: RunStatus::Failed,
            started_at,
            finished_at: Utc::now(),
            error: Some(error.into()),
            briefing: None,
        }
    }
}

/// Receives one [`BatchResult`] per subscription as it completes. Either a
/// callback-URL poster or a synchronous in-memory collector, per §6.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, result: &BatchResult);
}

/// A delivery sink that simply collects results in memory, for synchronous
/// callers and tests. Production deployments post `BatchResult` as JSON to
/// a configured callback URL instead (wire format out of scope, per §1).
#[derive(Debug, Default)]
pub struct InMemoryDeliverySink {
    results: std::sync::Mutex<Vec<BatchResult>>,
}

impl InMemoryDeliverySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<BatchResult> {
        self.results.lock().expect("delivery sink lock poisoned").clone()
    }
}

#[async_trait]
impl DeliverySink for InMemoryDeliverySink {
    async fn deliver(&self, result: &BatchResult) {
        self.results.lock().expect("delivery sink lock poisoned").push(result.clone());
    }
}

/// Construction-time configuration for a [`BatchRunner`].
#[derive(Debug, Clone, Copy)]
pub struct BatchRunnerConfig {
    /// Upper bound on subscriptions run concurrently within one `RunBatch`.
    pub worker_count: usize,
}

impl BatchRunnerConfig {
    pub fn new(worker_count: usize) -> Self {
        Self { worker_count: worker_count.max(1) }
    }
}

impl Default for BatchRunnerConfig {
    fn default() -> Self {
        Self { worker_count: DEFAULT_WORKER_COUNT }
    }
}

/// Drives the [`Orchestrator`] for every active subscription of a given
/// frequency, bounding concurrency and isolating per-subscription failure.
pub struct BatchRunner {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn SubscriptionStore>,
    sink: Arc<dyn DeliverySink>,
    config: BatchRunnerConfig,
}

impl BatchRunner {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        store: Arc<dyn SubscriptionStore>,
        sink: Arc<dyn DeliverySink>,
        config: BatchRunnerConfig,
    ) -> Self {
        Self { orchestrator, store, sink, config }
    }

    /// `RunBatch(frequency, subscriptions)`: enumerate the frequency's active
    /// subscriptions and run the orchestrator for each, bounded by
    /// `config.worker_count` in flight at once. Returns every subscription's
    /// result in store order, regardless of completion order, so a caller
    /// can reconcile against the subscription list it started with.
    pub async fn run_batch(&self, frequency: SubscriptionFrequency) -> Result<Vec<BatchResult>> {
        let subscriptions = self.store.active_subscriptions(frequency).await?;
        let semaphore = Arc::new(Semaphore::new(self.config.worker_count));

        let tasks: Vec<_> = subscriptions
            .into_iter()
            .map(|subscription| {
                let orchestrator = Arc::clone(&self.orchestrator);
                let sink = Arc::clone(&self.sink);
                let semaphore = Arc::clone(&semaphore);
                async move {
                    let _permit = semaphore.acquire().await.expect("batch runner semaphore closed unexpectedly");
                    let subscription_id = subscription.id.clone();
                    let started_at = Utc::now();
                    let request = subscription.into_request();

                    // A per-subscription failure is isolated here: `run`
                    // itself only returns `Err` for bugs in the core, not for
                    // expected failures (those already surface as
                    // `ResearchResult { status: Failed, .. }`), but the
                    // isolation still holds either way — this subscription's
                    // outcome never aborts the others.
                    let result = match orchestrator.run(request).await {
                        Ok(research_result) => BatchResult::from_research(subscription_id, started_at, research_result),
                        Err(e) => BatchResult::from_fatal_error(subscription_id, started_at, e.to_string()),
                    };

                    sink.deliver(&result).await;
                    result
                }
            })
            .collect();

        Ok(join_all(tasks).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterRegistry;
    use crate::config::Settings;
    use crate::error::Error;
    use crate::llm::{ChatMessage, CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse, LLMClient, Provider, StopReason, TokenUsage};
    use crate::orchestrator::OrchestratorConfig;
    use crate::strategy::{OnError, OutputSpec, Step, StrategyLoader, StrategyVariable, VariableSource};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

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
                timestamp: Utc::now(),
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
                crate::state::Evidence::new("web_search", "Hit one").with_url("https://x.example.com/1"),
                crate::state::Evidence::new("web_search", "Hit two").with_url("https://x.example.com/2"),
            ]))
        }
    }

    fn news_strategy(slug: &str, required_variable: bool) -> crate::strategy::Strategy {
        let variables = if required_variable {
            vec![StrategyVariable {
                name: "ticker".to_string(),
                source: VariableSource::LlmFill,
                description: "stock ticker".to_string(),
                default: None,
                required: true,
            }]
        } else {
            vec![StrategyVariable {
                name: "topic".to_string(),
                source: VariableSource::FromRequest { field: "topic".to_string() },
                description: String::new(),
                default: None,
                required: true,
            }]
        };
        crate::strategy::Strategy {
            slug: slug.to_string(),
            version: "1".to_string(),
            category: "news".to_string(),
            time_window: "day".to_string(),
            depth: "brief".to_string(),
            variables,
            tool_chain: vec![Step {
                name: "search".to_string(),
                uses: "web_search".to_string(),
                params: HashMap::from([("query".to_string(), serde_json::json!("{{topic}}"))]),
                when: None,
                for_each: None,
                r#as: "item".to_string(),
                save_as: None,
                on_error: OnError::Continue,
                retry_max: 0,
                timeout_secs: None,
            }],
            output_spec: OutputSpec::default(),
        }
    }

    fn registry_with(strategies: Vec<crate::strategy::Strategy>) -> crate::strategy::StrategyRegistry {
        let dir = tempfile::tempdir().unwrap();
        for (i, s) in strategies.iter().enumerate() {
            std::fs::write(dir.path().join(format!("{i}.yaml")), serde_yaml::to_string(s).unwrap()).unwrap();
        }
        let loader = StrategyLoader::new(std::collections::HashSet::from(["web_search".to_string()]), std::collections::HashSet::new());
        loader.load(dir.path()).unwrap()
    }

    /// A strategy with no `llm_fill` variables only ever drives the
    /// finalize synthesizer's LLM calls (scope is skipped via
    /// `with_strategy_hint`), and cluster/analyze failures degrade
    /// gracefully rather than erroring — so one scripted `write` response
    /// is enough to carry every subscription through to `Completed`.
    fn orchestrator_with(strategy: crate::strategy::Strategy, write_body_words: usize) -> Arc<Orchestrator> {
        let strategies = registry_with(vec![strategy]);
        let mut adapters = AdapterRegistry::new();
        adapters.register(Arc::new(StubSearchAdapter));
        let write_response = format!(
            r#"{{"sections": [{{"heading": "Overview", "body": "{}", "cited_indices": [0, 1]}}]}}"#,
            "word ".repeat(write_body_words)
        );
        let client: Arc<dyn LLMClient> = Arc::new(StubClient { response: write_response });
        Arc::new(Orchestrator::new(strategies, adapters, OrchestratorConfig::default(), client))
    }

    struct FixedStore {
        subscriptions: Vec<Subscription>,
    }

    #[async_trait]
    impl SubscriptionStore for FixedStore {
        async fn active_subscriptions(&self, _frequency: SubscriptionFrequency) -> Result<Vec<Subscription>> {
            Ok(self.subscriptions.clone())
        }
    }

    #[tokio::test]
    async fn test_batch_runs_every_subscription_and_delivers_results() {
        let orchestrator = orchestrator_with(news_strategy("daily_news", false), 60);
        let store: Arc<dyn SubscriptionStore> = Arc::new(FixedStore {
            subscriptions: vec![
                Subscription::new("sub-1", "Topic A").with_strategy_hint("daily_news"),
                Subscription::new("sub-2", "Topic B").with_strategy_hint("daily_news"),
            ],
        });
        let sink = Arc::new(InMemoryDeliverySink::new());
        let runner = BatchRunner::new(orchestrator, store, sink.clone(), BatchRunnerConfig::default());

        let results = runner.run_batch(SubscriptionFrequency::Daily).await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == RunStatus::Completed));
        assert_eq!(sink.results().len(), 2);
    }

    #[tokio::test]
    async fn test_batch_partial_failure_does_not_abort_other_subscriptions() {
        // sub-1 uses a strategy whose only variable requires an llm_fill
        // value with no default; the stub client's response is not parsable
        // as `FillVariables` output, so fill fails with a config error and
        // that subscription's result is `Failed` — without affecting sub-2.
        let strategies = registry_with(vec![
            news_strategy("needs_fill", true),
            news_strategy("daily_news", false),
        ]);
        let mut adapters = AdapterRegistry::new();
        adapters.register(Arc::new(StubSearchAdapter));
        let write_response = format!(
            r#"{{"sections": [{{"heading": "Overview", "body": "{}", "cited_indices": [0, 1]}}]}}"#,
            "word ".repeat(60)
        );
        let client: Arc<dyn LLMClient> = Arc::new(StubClient { response: write_response });
        let orchestrator = Arc::new(Orchestrator::new(strategies, adapters, OrchestratorConfig::default(), client));

        let store: Arc<dyn SubscriptionStore> = Arc::new(FixedStore {
            subscriptions: vec![
                Subscription::new("sub-1", "Needs a ticker").with_strategy_hint("needs_fill"),
                Subscription::new("sub-2", "Topic B").with_strategy_hint("daily_news"),
            ],
        });
        let sink = Arc::new(InMemoryDeliverySink::new());
        let runner = BatchRunner::new(orchestrator, store, sink, BatchRunnerConfig::default());

        let results = runner.run_batch(SubscriptionFrequency::Daily).await.unwrap();

        let by_id: HashMap<_, _> = results.into_iter().map(|r| (r.subscription_id.clone(), r)).collect();
        assert_eq!(by_id["sub-1"].status, RunStatus::Failed);
        assert!(by_id["sub-1"].error.as_deref().unwrap_or_default().contains("ticker") || by_id["sub-1"].error.is_some());
        assert_eq!(by_id["sub-2"].status, RunStatus::Completed);
    }

    /// A search adapter that sleeps briefly while tracking how many calls are
    /// in flight at once, so the batch runner's concurrency cap can be
    /// observed directly rather than inferred from timing.
    struct ConcurrencyTrackingAdapter {
        in_flight: Arc<AtomicUsize>,
        max_observed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl crate::adapter::Adapter for ConcurrencyTrackingAdapter {
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
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_observed.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(crate::adapter::AdapterOutput::new(vec![
                crate::state::Evidence::new("web_search", "Hit").with_url("https://x.example.com"),
            ]))
        }
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded_by_worker_count() {
        let strategies = registry_with(vec![news_strategy("daily_news", false)]);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_observed = Arc::new(AtomicUsize::new(0));
        let mut adapters = AdapterRegistry::new();
        adapters.register(Arc::new(ConcurrencyTrackingAdapter { in_flight: Arc::clone(&in_flight), max_observed: Arc::clone(&max_observed) }));
        let write_response = format!(
            r#"{{"sections": [{{"heading": "Overview", "body": "{}", "cited_indices": [0]}}]}}"#,
            "word ".repeat(60)
        );
        let client: Arc<dyn LLMClient> = Arc::new(StubClient { response: write_response });
        let orchestrator = Arc::new(Orchestrator::new(strategies, adapters, OrchestratorConfig::default(), client));

        let subscriptions: Vec<Subscription> = (0..8)
            .map(|i| Subscription::new(format!("sub-{i}"), "Topic").with_strategy_hint("daily_news"))
            .collect();
        let store: Arc<dyn SubscriptionStore> = Arc::new(FixedStore { subscriptions });
        let sink = Arc::new(InMemoryDeliverySink::new());
        let runner = BatchRunner::new(orchestrator, store, sink.clone(), BatchRunnerConfig::new(2));

        let results = runner.run_batch(SubscriptionFrequency::Daily).await.unwrap();

        assert_eq!(results.len(), 8);
        assert_eq!(sink.results().len(), 8);
        assert!(max_observed.load(Ordering::SeqCst) <= 2, "observed {} concurrent adapter calls, expected at most 2", max_observed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_default_worker_count_matches_documented_value() {
        assert_eq!(BatchRunnerConfig::default().worker_count, DEFAULT_WORKER_COUNT);
    }

    #[test]
    fn test_subscription_frequency_display() {
        assert_eq!(SubscriptionFrequency::Daily.to_string(), "daily");
        assert_eq!(SubscriptionFrequency::Weekly.to_string(), "weekly");
        assert_eq!(SubscriptionFrequency::Monthly.to_string(), "monthly");
    }
}
