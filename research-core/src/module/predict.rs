//! Predict wrapper for executing signatures with LLMs.
//!
//! `Predict<S>` handles prompt generation, LLM invocation, and output
//! parsing/validation for a given [`Signature`]. It retries on a
//! parse/validation failure (not on transport failure — that is the
//! adapter's job, see [`crate::adapter`]) up to `config.max_retries` times.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Module, ModuleConfig};
use crate::error::{Error, Result};
use crate::llm::{ChatMessage, CompletionRequest, LLMClient};
use crate::signature::Signature;

/// Configuration for a single `Predict` instantiation.
#[derive(Debug, Clone, Default)]
pub struct PredictConfig {
    /// Base module configuration.
    pub module: ModuleConfig,
    /// Model to use (overrides the client's default if set).
    pub model: Option<String>,
}

impl PredictConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.module.temperature = temp;
        self
    }

    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.module.max_tokens = Some(tokens);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.module.max_retries = retries;
        self
    }
}

/// A module that predicts typed outputs for a given signature.
pub struct Predict<S: Signature> {
    _phantom: PhantomData<S>,
    lm: Arc<RwLock<Option<Arc<dyn LLMClient>>>>,
    config: PredictConfig,
    name: String,
}

impl<S: Signature> Predict<S> {
    /// Create a new `Predict` module with no language model set.
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
            lm: Arc::new(RwLock::new(None)),
            config: PredictConfig::default(),
            name: format!("Predict<{}>", std::any::type_name::<S>()),
        }
    }

    /// Create a `Predict` module bound to a language model.
    pub fn with_lm(lm: Arc<dyn LLMClient>) -> Self {
        Self {
            _phantom: PhantomData,
            lm: Arc::new(RwLock::new(Some(lm))),
            config: PredictConfig::default(),
            name: format!("Predict<{}>", std::any::type_name::<S>()),
        }
    }

    pub fn with_config(mut self, config: PredictConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn build_prompt(&self, inputs: &S::Inputs) -> Result<Vec<ChatMessage>> {
        let system = S::to_prompt(inputs);
        Ok(vec![
            ChatMessage::system(system),
            ChatMessage::user("Produce the JSON output now."),
        ])
    }

    fn parse_response(&self, response: &str) -> Result<S::Outputs> {
        S::from_response(response)
            .map_err(|e| Error::Internal(format!("failed to parse {} response: {}", S::name(), e)))
    }
}

impl<S: Signature> Default for Predict<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S: Signature + 'static> Module for Predict<S> {
    type Sig = S;

    async fn forward(&self, inputs: S::Inputs) -> Result<S::Outputs> {
        let lm_guard = self.lm.read().await;
        let lm = lm_guard
            .as_ref()
            .ok_or_else(|| Error::Config(format!("no language model set for {}", self.name)))?;

        let messages = self.build_prompt(&inputs)?;

        let request = CompletionRequest {
            model: self.config.model.clone(),
            system: None,
            messages,
            max_tokens: self.config.module.max_tokens,
            temperature: Some(self.config.module.temperature),
            stop: None,
            enable_caching: false,
            metadata: None,
        };

        let mut last_error = None;
        for attempt in 0..=self.config.module.max_retries {
            match lm.complete(request.clone()).await {
                Ok(response) => match self.parse_response(&response.content) {
                    Ok(outputs) => return Ok(outputs),
                    Err(e) if attempt < self.config.module.max_retries => {
                        last_error = Some(e);
                        continue;
                    }
                    Err(e) => return Err(e),
                },
                Err(e) if attempt < self.config.module.max_retries => {
                    last_error = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Internal("unreachable retry exit".to_string())))
    }

    fn set_lm(&mut self, lm: Arc<dyn LLMClient>) {
        if let Ok(mut guard) = self.lm.try_write() {
            *guard = Some(lm);
        }
    }

    fn get_lm(&self) -> Option<Arc<dyn LLMClient>> {
        self.lm.try_read().ok().and_then(|g| g.clone())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl<S: Signature> Clone for Predict<S> {
    fn clone(&self) -> Self {
        Self {
            _phantom: PhantomData,
            lm: self.lm.clone(),
            config: self.config.clone(),
            name: self.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::{FieldSpec, FieldType};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct MockInputs {
        text: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct MockOutputs {
        result: String,
    }

    struct MockSignature;

    impl Signature for MockSignature {
        type Inputs = MockInputs;
        type Outputs = MockOutputs;

        fn instructions() -> &'static str {
            "Process the input text and produce a result."
        }

        fn input_fields() -> Vec<FieldSpec> {
            vec![FieldSpec::new("text", FieldType::String).with_description("Input text")]
        }

        fn output_fields() -> Vec<FieldSpec> {
            vec![FieldSpec::new("result", FieldType::String).with_description("Output result")]
        }
    }

    #[test]
    fn test_predict_creation() {
        let predict = Predict::<MockSignature>::new();
        assert!(predict.get_lm().is_none());
    }

    #[test]
    fn test_predict_config() {
        let config = PredictConfig::new()
            .with_model("claude-3-5-haiku-20241022")
            .with_temperature(0.5)
            .with_max_retries(2);

        assert_eq!(config.model, Some("claude-3-5-haiku-20241022".to_string()));
        assert_eq!(config.module.temperature, 0.5);
        assert_eq!(config.module.max_retries, 2);
    }
}
