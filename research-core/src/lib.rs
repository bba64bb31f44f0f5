//! # research-core
//!
//! A strategy-driven research orchestration library: given a natural-language
//! topic, it selects a declarative YAML strategy, resolves runtime variables,
//! executes a tool-chain of steps against pluggable search/LLM adapters, and
//! synthesizes the gathered evidence into a cited briefing.
//!
//! ## Core components
//!
//! - **Strategy**: the declarative plan (variables, tool chain, output spec)
//! - **State**: the mutable record threaded through scope → fill → research → finalize
//! - **Adapter**: the uniform contract for search/LLM tools
//! - **Orchestrator**: owns State, composes the four phases, emits spans
//! - **BatchRunner**: per-subscription fan-out for scheduled runs
//!
//! ## Example
//!
//! ```rust,ignore
//! use research_core::{Orchestrator, OrchestratorConfig, ResearchRequest};
//!
//! let orchestrator = Orchestrator::new(strategies, adapters, settings, span_sink);
//! let result = orchestrator.run(ResearchRequest::new("Latest AI developments")).await?;
//! ```

// Self-alias for derive macro support within the crate
extern crate self as research_core;

pub mod adapter;
pub mod batch_runner;
pub mod clock;
pub mod config;
pub mod error;
pub mod llm;
pub mod module;
pub mod orchestrator;
pub mod signature;
pub mod signatures;
pub mod span;
pub mod state;
pub mod strategy;
pub mod template;

// Re-exports for convenience
pub use adapter::{
    Adapter, AdapterRegistry, AdapterUsage, LlmAdapter, SemanticSearchAdapter, WebSearchAdapter,
};
pub use batch_runner::{
    BatchResult, BatchRunner, BatchRunnerConfig, DeliverySink, InMemoryDeliverySink, Subscription,
    SubscriptionFrequency, SubscriptionStore,
};
pub use config::{LimitsConfig, ModelConfig, ModelPurpose, Settings};
pub use error::{AdapterErrorKind, Error, ErrorKind, Result};
pub use llm::{
    AnthropicClient, BatchConfig, BatchExecutor, BatchQueryResult, BatchedLLMQuery,
    BatchedQueryResults, ClientConfig, CompletionRequest, CompletionResponse, CostTracker,
    LLMClient, ModelCosts, ModelSpec, ModelTier, MultiProviderClient, OpenAIClient, Provider,
};
pub use module::{Module, ModuleConfig, Predict, PredictConfig};
pub use orchestrator::{Orchestrator, OrchestratorConfig, ResearchRequest, ResearchResult};
pub use signature::{
    apply_defaults, validate_fields, validate_value, FieldSpec, FieldType, ParseError, Signature,
    ValidationError, ValidationResult,
};
pub use span::{BufferingSpanSink, Span, SpanKind, SpanLevel, SpanSink, SpanUsage, TracingSpanSink};
pub use state::{Citation, Evidence, RunStatus, Section, State, StepOutcome};
pub use strategy::{OnError, OutputSpec, Step, Strategy, StrategyLoader, StrategyVariable};
pub use template::Value as TemplateValue;
