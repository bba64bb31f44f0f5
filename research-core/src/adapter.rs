//! The Tool Adapter Registry: a uniform invocation surface for the
//! web-search, semantic-search, and LLM-synthesis tools a strategy's
//! `tool_chain` invokes by key.
//!
//! An [`Adapter`] turns an already-templated parameter map into ordered
//! [`Evidence`], independent of the wire format of whatever service backs
//! it. The [`AdapterRegistry`] resolves a step's `use` key to an adapter
//! either directly or, when the exact key is unavailable, through a
//! `capabilities()` tag the Step Executor treats as interchangeable (any
//! adapter tagged `web_search` can satisfy a step that asks for one).
//! Registration is data — pushing a boxed trait object into a map — not a
//! class hierarchy, per the "inheritance-free adapters" design note.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::{AdapterErrorKind, Error, Result};
use crate::llm::{ChatMessage, CompletionRequest, LLMClient};
use crate::state::Evidence;

/// Per-call context the Step Executor hands to every adapter invocation:
/// the identity tag for observability and the deadline derived from the
/// phase deadline minus elapsed time (§5, "Cancellation & timeouts").
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub identity: HashMap<String, String>,
    pub step_name: String,
    pub deadline: Instant,
}

impl AdapterContext {
    pub fn new(identity: HashMap<String, String>, step_name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            identity,
            step_name: step_name.into(),
            deadline: Instant::now() + timeout,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Cost/token usage an adapter call reports for observability, separate
/// from the generation-span usage an LLM-backed adapter also emits.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AdapterUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: Option<f64>,
}

impl AdapterUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self { input_tokens, output_tokens, cost_usd: None }
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = Some(cost_usd);
        self
    }
}

/// What one adapter invocation produced.
#[derive(Debug, Clone, Default)]
pub struct AdapterOutput {
    pub results: Vec<Evidence>,
    pub usage: Option<AdapterUsage>,
}

impl AdapterOutput {
    pub fn new(results: Vec<Evidence>) -> Self {
        Self { results, usage: None }
    }

    pub fn with_usage(mut self, usage: AdapterUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// The uniform contract every search/LLM/HTTP tool implements.
///
/// `call` returns `Err` for any failure; the error's [`crate::error::ErrorKind`]
/// (`config`, `input`, `transient`, `permanent`, `rate_limited`, `timeout`)
/// is what the Step Executor's retry policy inspects, so adapters must map
/// their own failures onto that taxonomy rather than returning `internal`
/// for anything retryable.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// The registry key this adapter registers under (e.g. `"web_search"`).
    fn key(&self) -> &str;

    /// Capability tags the registry's fallback lookup matches against.
    fn capabilities(&self) -> HashSet<String>;

    /// A soft cost bound the Research Phase Controller may use for budgeting.
    fn cost_hint(&self) -> Option<f64> {
        None
    }

    async fn call(&self, ctx: &AdapterContext, params: &HashMap<String, JsonValue>) -> Result<AdapterOutput>;
}

/// A web-search adapter backed by an HTTP search API. The concrete wire
/// format is deliberately out of scope (§1); this implementation issues a
/// single GET against a configurable endpoint and maps each hit into
/// Evidence, which is representative of the shape every real web-search
/// provider this core talks to will have.
pub struct WebSearchAdapter {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl WebSearchAdapter {
    /// Construct from explicit credentials (used by tests and by
    /// `AdapterRegistry::register_default` when the environment provides them).
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    /// Read the endpoint and API key from `RESEARCH_WEB_SEARCH_ENDPOINT` /
    /// `RESEARCH_WEB_SEARCH_API_KEY`. Returns `None` when the credential is
    /// absent, per §4.1's "missing credentials demote an adapter to
    /// unavailable but not fatal".
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("RESEARCH_WEB_SEARCH_API_KEY").ok()?;
        let endpoint = std::env::var("RESEARCH_WEB_SEARCH_ENDPOINT")
            .unwrap_or_else(|_| "https://api.search.example.com/v1/search".to_string());
        Some(Self::new(endpoint, api_key))
    }
}

#[async_trait]
impl Adapter for WebSearchAdapter {
    fn key(&self) -> &str {
        "web_search"
    }

    fn capabilities(&self) -> HashSet<String> {
        HashSet::from(["web_search".to_string()])
    }

    fn cost_hint(&self) -> Option<f64> {
        Some(0.002)
    }

    async fn call(&self, ctx: &AdapterContext, params: &HashMap<String, JsonValue>) -> Result<AdapterOutput> {
        let query = params
            .get("query")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| Error::config("web_search step requires a 'query' param"))?;
        let limit = params.get("limit").and_then(JsonValue::as_u64).unwrap_or(10);

        let response = self
            .client
            .get(&self.endpoint)
            .bearer_auth(&self.api_key)
            .query(&[("q", query), ("limit", &limit.to_string())])
            .timeout(ctx.remaining())
            .send()
            .await
            .map_err(|e| map_reqwest_error("web_search", &e))?;

        if !response.status().is_success() {
            return Err(status_to_error("web_search", response.status()));
        }

        let body: WebSearchResponse = response
            .json()
            .await
            .map_err(|e| Error::adapter("web_search", format!("malformed response: {e}"), AdapterErrorKind::Transient))?;

        let results = body
            .results
            .into_iter()
            .map(|hit| {
                let mut evidence = Evidence::new("web_search", hit.title).with_url(hit.url);
                if let Some(snippet) = hit.snippet {
                    evidence = evidence.with_snippet(snippet);
                }
                if let Some(published_at) = hit.published_at {
                    evidence = evidence.with_published_at(published_at);
                }
                if let Some(score) = hit.score {
                    evidence = evidence.with_relevance(score as f32);
                }
                evidence
            })
            .collect();

        Ok(AdapterOutput::new(results))
    }
}

#[derive(Debug, serde::Deserialize)]
struct WebSearchResponse {
    results: Vec<WebSearchHit>,
}

#[derive(Debug, serde::Deserialize)]
struct WebSearchHit {
    title: String,
    url: String,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default)]
    published_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    score: Option<f64>,
}

/// A semantic-search adapter over a vector index, for strategies that ask
/// for embedding-similarity retrieval rather than web crawling.
pub struct SemanticSearchAdapter {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl SemanticSearchAdapter {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("RESEARCH_SEMANTIC_SEARCH_API_KEY").ok()?;
        let endpoint = std::env::var("RESEARCH_SEMANTIC_SEARCH_ENDPOINT")
            .unwrap_or_else(|_| "https://api.vectorstore.example.com/v1/query".to_string());
        Some(Self::new(endpoint, api_key))
    }
}

#[async_trait]
impl Adapter for SemanticSearchAdapter {
    fn key(&self) -> &str {
        "semantic_search"
    }

    fn capabilities(&self) -> HashSet<String> {
        HashSet::from(["semantic_search".to_string()])
    }

    fn cost_hint(&self) -> Option<f64> {
        Some(0.001)
    }

    async fn call(&self, ctx: &AdapterContext, params: &HashMap<String, JsonValue>) -> Result<AdapterOutput> {
        let query = params
            .get("query")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| Error::config("semantic_search step requires a 'query' param"))?;
        let top_k = params.get("top_k").and_then(JsonValue::as_u64).unwrap_or(8);

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "query": query, "top_k": top_k }))
            .timeout(ctx.remaining())
            .send()
            .await
            .map_err(|e| map_reqwest_error("semantic_search", &e))?;

        if !response.status().is_success() {
            return Err(status_to_error("semantic_search", response.status()));
        }

        let body: WebSearchResponse = response
            .json()
            .await
            .map_err(|e| Error::adapter("semantic_search", format!("malformed response: {e}"), AdapterErrorKind::Transient))?;

        let results = body
            .results
            .into_iter()
            .map(|hit| {
                let mut evidence = Evidence::new("semantic_search", hit.title).with_url(hit.url);
                if let Some(snippet) = hit.snippet {
                    evidence = evidence.with_snippet(snippet);
                }
                if let Some(score) = hit.score {
                    evidence = evidence.with_relevance(score as f32);
                }
                evidence
            })
            .collect();

        Ok(AdapterOutput::new(results))
    }
}

/// Turns a raw LLM completion into Evidence with an empty `url`, for
/// strategy steps that want a model's own synthesis (e.g. "summarize what
/// is publicly known about X") folded into the evidence pool alongside
/// retrieved search hits. Distinct from the Finalize Synthesizer's own
/// cluster/analyze/write calls, which go through [`crate::module::Predict`]
/// directly rather than the Adapter Registry.
pub struct LlmAdapter {
    client: Arc<dyn LLMClient>,
    model: Option<String>,
}

impl LlmAdapter {
    pub fn new(client: Arc<dyn LLMClient>) -> Self {
        Self { client, model: None }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

#[async_trait]
impl Adapter for LlmAdapter {
    fn key(&self) -> &str {
        "llm"
    }

    fn capabilities(&self) -> HashSet<String> {
        HashSet::from(["llm".to_string(), "llm_synthesis".to_string()])
    }

    async fn call(&self, _ctx: &AdapterContext, params: &HashMap<String, JsonValue>) -> Result<AdapterOutput> {
        let prompt = params
            .get("prompt")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| Error::config("llm step requires a 'prompt' param"))?;
        let title = params
            .get("title")
            .and_then(JsonValue::as_str)
            .unwrap_or("LLM synthesis")
            .to_string();

        let request = CompletionRequest {
            model: self.model.clone(),
            ..CompletionRequest::new().with_message(ChatMessage::user(prompt))
        };

        let response = self.client.complete(request).await?;

        let evidence = Evidence::new("llm", title).with_snippet(response.content);
        let usage = AdapterUsage::new(response.usage.input_tokens, response.usage.output_tokens);
        Ok(AdapterOutput::new(vec![evidence]).with_usage(usage))
    }
}

fn map_reqwest_error(adapter: &str, error: &reqwest::Error) -> Error {
    if error.is_timeout() {
        Error::adapter(adapter, error.to_string(), AdapterErrorKind::Timeout)
    } else if error.is_connect() {
        Error::adapter(adapter, error.to_string(), AdapterErrorKind::Transient)
    } else {
        Error::adapter(adapter, error.to_string(), AdapterErrorKind::Permanent)
    }
}

fn status_to_error(adapter: &str, status: reqwest::StatusCode) -> Error {
    if status.as_u16() == 429 {
        Error::adapter(adapter, format!("rate limited: {status}"), AdapterErrorKind::RateLimited)
    } else if status.is_server_error() {
        Error::adapter(adapter, format!("server error: {status}"), AdapterErrorKind::Transient)
    } else {
        Error::adapter(adapter, format!("request rejected: {status}"), AdapterErrorKind::Permanent)
    }
}

/// Indexes adapters by key and by capability tag.
#[derive(Default)]
pub struct AdapterRegistry {
    by_key: HashMap<String, Arc<dyn Adapter>>,
    by_capability: HashMap<String, Vec<String>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one adapter, indexing it under its own key and every
    /// capability it declares.
    pub fn register(&mut self, adapter: Arc<dyn Adapter>) {
        let key = adapter.key().to_string();
        for capability in adapter.capabilities() {
            self.by_capability.entry(capability).or_default().push(key.clone());
        }
        self.by_key.insert(key, adapter);
    }

    /// Attempt to construct and register every known built-in adapter from
    /// environment-provided credentials. An adapter whose credentials are
    /// absent is silently omitted — "missing credentials demote an adapter
    /// to unavailable but not fatal" — not an initialization error.
    pub fn register_default(&mut self, llm_client: Option<Arc<dyn LLMClient>>) {
        if let Some(web_search) = WebSearchAdapter::from_env() {
            self.register(Arc::new(web_search));
        }
        if let Some(semantic_search) = SemanticSearchAdapter::from_env() {
            self.register(Arc::new(semantic_search));
        }
        if let Some(client) = llm_client {
            self.register(Arc::new(LlmAdapter::new(client)));
        }
    }

    /// Resolve a step's `use` key: an exact match wins; otherwise the first
    /// registered adapter whose capability set contains `use` stands in.
    pub fn lookup(&self, key: &str) -> Option<Arc<dyn Adapter>> {
        if let Some(adapter) = self.by_key.get(key) {
            return Some(Arc::clone(adapter));
        }
        let candidates = self.by_capability.get(key)?;
        let first = candidates.first()?;
        self.by_key.get(first).map(Arc::clone)
    }

    pub fn known_keys(&self) -> HashSet<String> {
        self.by_key.keys().cloned().collect()
    }

    pub fn known_capabilities(&self) -> HashSet<String> {
        self.by_capability.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }
}
