//! Signature-driven LLM operations.
//!
//! This module provides [`Predict`], a thin wrapper that turns a
//! [`Signature`](crate::signature::Signature) into a callable operation: it
//! builds the prompt from the signature's instructions and field specs,
//! invokes an [`LLMClient`], and parses/validates the reply back into the
//! signature's typed output. The orchestrator's scope, fill, cluster,
//! analyze and write steps are each one `Predict<S>` instantiation.
//!
//! # Example
//!
//! ```ignore
//! use research_core::module::{Module, Predict};
//!
//! let categorize = Predict::<CategorizeTopic>::with_lm(client);
//! let outputs = categorize.forward(CategorizeTopicInputs { topic }).await?;
//! ```

mod predict;

pub use predict::{Predict, PredictConfig};

use crate::error::Result;
use crate::llm::LLMClient;
use crate::signature::Signature;
use async_trait::async_trait;
use std::sync::Arc;

/// A module wraps a signature and executes it against a language model.
#[async_trait]
pub trait Module: Send + Sync {
    /// The signature this module implements.
    type Sig: Signature;

    /// Execute the module with the given inputs.
    async fn forward(
        &self,
        inputs: <Self::Sig as Signature>::Inputs,
    ) -> Result<<Self::Sig as Signature>::Outputs>;

    /// Set the language model used for subsequent calls.
    fn set_lm(&mut self, lm: Arc<dyn LLMClient>);

    /// Get the current language model, if any.
    fn get_lm(&self) -> Option<Arc<dyn LLMClient>>;

    /// Module name for tracing/debugging.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Configuration shared by all `Predict` invocations.
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    /// Maximum number of retries on a parse/validation failure.
    pub max_retries: u32,
    /// Sampling temperature.
    pub temperature: f64,
    /// Maximum output tokens.
    pub max_tokens: Option<u32>,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            temperature: 0.0,
            max_tokens: None,
        }
    }
}

impl ModuleConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.temperature = temp;
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_config_default() {
        let config = ModuleConfig::default();
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.temperature, 0.0);
        assert!(config.max_tokens.is_none());
    }

    #[test]
    fn test_module_config_builder() {
        let config = ModuleConfig::new()
            .with_max_retries(5)
            .with_temperature(0.7)
            .with_max_tokens(1000);

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.temperature, 0.7);
        assert_eq!(config.max_tokens, Some(1000));
    }
}
