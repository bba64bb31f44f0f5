//! LLM client abstraction used by the LLM-kind tool adapters.
//!
//! This module provides a unified interface for working with multiple LLM
//! providers (Anthropic, OpenAI, OpenRouter). Model selection per purpose
//! (scope, fill, cluster, analyze, write) is a direct lookup in the
//! settings document (see [`crate::config`]), not query-based routing.
//!
//! ## Example
//!
//! ```rust,ignore
//! use research_core::llm::{AnthropicClient, ClientConfig, CompletionRequest, ChatMessage};
//!
//! let client = AnthropicClient::new(
//!     ClientConfig::new("your-api-key")
//!         .with_default_model("claude-3-5-sonnet-20241022")
//! );
//!
//! let request = CompletionRequest::new().with_message(ChatMessage::user("Hello"));
//! let response = client.complete(request).await?;
//! ```

mod batch;
mod cache;
mod client;
mod types;

pub use batch::{
    BatchConfig, BatchExecutor, BatchQueryResult, BatchedLLMQuery, BatchedQueryResults,
    DEFAULT_MAX_PARALLEL,
};
pub use cache::{
    apply_cache_markers, find_cache_breakpoints, CacheEntry, CacheKey, CacheStats, PromptCache,
};
pub use client::{
    AnthropicClient, ClientConfig, LLMClient, MultiProviderClient, OpenAIClient, TrackedClient,
};
#[cfg(feature = "gemini")]
pub use client::GoogleClient;
pub use types::{
    CacheControl, ChatMessage, ChatRole, CompletionRequest, CompletionResponse, CostTracker,
    EmbeddingRequest, EmbeddingResponse, ModelCosts, ModelSpec, ModelTier, Provider, StopReason,
    TokenUsage,
};
