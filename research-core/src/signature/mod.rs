//! Typed signatures for LLM I/O contracts.
//!
//! Every LLM call the orchestrator makes (scope categorization, variable
//! fill, evidence clustering, per-cluster analysis, section writing) goes
//! through a [`Signature`]: a typed input/output contract that generates its
//! own prompt and validates/parses the model's reply, instead of each call
//! site hand-rolling prompt strings and ad-hoc JSON parsing.
//!
//! # Example
//!
//! ```rust,ignore
//! use research_core::signature::{Signature, FieldSpec, FieldType};
//!
//! struct ClusterEvidence;
//!
//! impl Signature for ClusterEvidence {
//!     type Inputs = ClusterEvidenceInputs;
//!     type Outputs = ClusterEvidenceOutputs;
//!
//!     fn instructions() -> &'static str {
//!         "Group the evidence summaries into topical clusters."
//!     }
//!
//!     fn input_fields() -> Vec<FieldSpec> {
//!         vec![FieldSpec::new("summaries", FieldType::list(FieldType::String))]
//!     }
//!
//!     fn output_fields() -> Vec<FieldSpec> {
//!         vec![FieldSpec::new("clusters", FieldType::list(FieldType::String))]
//!     }
//! }
//! ```
//!
//! # Architecture
//!
//! - [`Signature`]: core trait defining I/O contracts
//! - [`FieldSpec`] / [`FieldType`]: field metadata used for prompt generation and validation
//! - [`ValidationError`]: errors from validating a parsed response
//! - [`ParseError`]: errors from parsing the raw LLM reply

pub mod types;
pub mod validation;

pub use types::{FieldSpec, FieldType};
pub use validation::{
    apply_defaults, validate_fields, validate_value, ValidationError, ValidationResult,
};

// Re-export derive macro
pub use research_core_derive::Signature;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::fmt;

/// Error that occurs when parsing an LLM response into outputs.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Response was not valid JSON
    InvalidJson {
        /// The parse error message
        message: String,
        /// Preview of the response that failed to parse
        response_preview: String,
    },

    /// JSON parsed but didn't match expected structure
    StructureMismatch {
        /// What was expected
        expected: String,
        /// What was found
        got: String,
    },

    /// Validation failed after parsing
    ValidationFailed(Vec<ValidationError>),

    /// Response was empty or contained no extractable content
    EmptyResponse,

    /// Custom parse error
    Custom(String),
}

impl ParseError {
    /// Create an invalid JSON error from a serde error.
    pub fn invalid_json(err: &serde_json::Error, response: &str) -> Self {
        Self::InvalidJson {
            message: err.to_string(),
            response_preview: truncate(response, 200),
        }
    }

    /// Create a structure mismatch error.
    pub fn structure_mismatch(expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self::StructureMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }

    /// Create from validation errors.
    pub fn validation_failed(errors: Vec<ValidationError>) -> Self {
        Self::ValidationFailed(errors)
    }

    /// Get a human-readable error message.
    pub fn to_user_message(&self) -> String {
        match self {
            Self::InvalidJson {
                message,
                response_preview,
            } => {
                format!(
                    "Failed to parse response as JSON: {}. Response: {}",
                    message, response_preview
                )
            }
            Self::StructureMismatch { expected, got } => {
                format!(
                    "Response structure mismatch: expected {}, got {}",
                    expected, got
                )
            }
            Self::ValidationFailed(errors) => {
                let messages: Vec<_> = errors.iter().map(|e| e.to_user_message()).collect();
                format!("Validation failed:\n  - {}", messages.join("\n  - "))
            }
            Self::EmptyResponse => "LLM returned an empty response".to_string(),
            Self::Custom(msg) => msg.clone(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_user_message())
    }
}

impl std::error::Error for ParseError {}

/// Core trait defining a typed LLM I/O contract.
///
/// A Signature specifies:
/// - Input type that must be serializable
/// - Output type that must be deserializable
/// - Task instructions for the LLM
/// - Field specifications for validation and prompt generation
///
/// # Implementing Signature
///
/// Signatures can be implemented manually or (in the future) via derive macro.
///
/// ```rust,ignore
/// use research_core::signature::{Signature, FieldSpec, FieldType, ParseError};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Clone)]
/// struct SummarizeInputs {
///     text: String,
///     max_length: Option<u32>,
/// }
///
/// #[derive(Deserialize, Clone)]
/// struct SummarizeOutputs {
///     summary: String,
///     key_points: Vec<String>,
/// }
///
/// struct Summarize;
///
/// impl Signature for Summarize {
///     type Inputs = SummarizeInputs;
///     type Outputs = SummarizeOutputs;
///
///     fn instructions() -> &'static str {
///         "Summarize the given text, extracting key points"
///     }
///
///     fn input_fields() -> Vec<FieldSpec> {
///         vec![
///             FieldSpec::new("text", FieldType::String)
///                 .with_description("Text to summarize"),
///             FieldSpec::new("max_length", FieldType::Integer)
///                 .with_description("Maximum summary length in words")
///                 .optional(),
///         ]
///     }
///
///     fn output_fields() -> Vec<FieldSpec> {
///         vec![
///             FieldSpec::new("summary", FieldType::String)
///                 .with_description("Concise summary of the text"),
///             FieldSpec::new("key_points", FieldType::list(FieldType::String))
///                 .with_description("Main points from the text"),
///         ]
///     }
/// }
/// ```
pub trait Signature: Send + Sync + 'static {
    /// Input type (must be serializable).
    type Inputs: Serialize + DeserializeOwned + Clone + Send + Sync;

    /// Output type (must be deserializable).
    type Outputs: Serialize + DeserializeOwned + Clone + Send + Sync;

    /// Task instructions for the LLM.
    ///
    /// This should be a clear, concise description of the task.
    fn instructions() -> &'static str;

    /// Input field specifications.
    ///
    /// Used for:
    /// - Prompt generation
    /// - Input validation
    /// - Documentation
    fn input_fields() -> Vec<FieldSpec>;

    /// Output field specifications.
    ///
    /// Used for:
    /// - Response parsing hints
    /// - Output validation
    /// - Documentation
    fn output_fields() -> Vec<FieldSpec>;

    /// Generate a prompt from inputs.
    ///
    /// Default implementation creates a structured prompt with:
    /// - Instructions
    /// - Input field values
    /// - Output field specifications
    fn to_prompt(inputs: &Self::Inputs) -> String
    where
        Self: Sized,
    {
        let mut prompt = String::new();

        // Instructions
        prompt.push_str("## Task\n\n");
        prompt.push_str(Self::instructions());
        prompt.push_str("\n\n");

        // Inputs
        prompt.push_str("## Inputs\n\n");
        let input_json = serde_json::to_value(inputs).unwrap_or(Value::Null);
        for field in Self::input_fields() {
            let value = input_json.get(&field.name);
            let label = field.display_label();
            match value {
                Some(v) => {
                    prompt.push_str(&format!("**{}**: {}\n", label, format_value(v)));
                }
                None if !field.required => {
                    // Skip optional missing fields
                }
                None => {
                    prompt.push_str(&format!("**{}**: (not provided)\n", label));
                }
            }
        }
        prompt.push('\n');

        // Output specification
        prompt.push_str("## Required Output\n\n");
        prompt.push_str("Respond with a JSON object containing:\n\n");
        for field in Self::output_fields() {
            prompt.push_str(&format!("- {}\n", field.to_prompt_line()));
        }
        prompt.push_str("\n```json\n");
        prompt.push_str(&generate_output_template::<Self>());
        prompt.push_str("\n```\n");

        prompt
    }

    /// Parse outputs from an LLM response.
    ///
    /// Default implementation:
    /// 1. Extracts JSON from the response (handles markdown code blocks)
    /// 2. Parses into the output type
    /// 3. Validates against output field specs
    fn from_response(response: &str) -> Result<Self::Outputs, ParseError>
    where
        Self: Sized,
    {
        let response = response.trim();

        if response.is_empty() {
            return Err(ParseError::EmptyResponse);
        }

        // Extract JSON from response (may be wrapped in markdown)
        let json_str = extract_json(response);

        // Parse JSON
        let value: Value =
            serde_json::from_str(json_str).map_err(|e| ParseError::invalid_json(&e, json_str))?;

        // Validate against output fields
        if let Err(errors) = validate_fields(&value, &Self::output_fields()) {
            return Err(ParseError::validation_failed(errors));
        }

        // Parse into output type
        serde_json::from_value(value.clone()).map_err(|e| {
            ParseError::structure_mismatch(std::any::type_name::<Self::Outputs>(), e.to_string())
        })
    }

    /// Get the signature name (defaults to type name).
    fn name() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Generate a JSON schema for the output type.
    fn output_schema() -> Value
    where
        Self: Sized,
    {
        let output_fields = Self::output_fields();

        let properties: serde_json::Map<String, Value> = output_fields
            .iter()
            .map(|f| (f.name.clone(), f.field_type.to_json_schema()))
            .collect();

        let required: Vec<String> = output_fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.clone())
            .collect();

        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required
        })
    }
}

/// Extract JSON from a response that may contain markdown or other text.
fn extract_json(response: &str) -> &str {
    // Try to find JSON in code blocks
    if let Some(start) = response.find("```json") {
        let content_start = start + 7;
        if let Some(end) = response[content_start..].find("```") {
            return response[content_start..content_start + end].trim();
        }
    }

    // Try generic code block
    if let Some(start) = response.find("```") {
        let content_start = start + 3;
        // Skip language identifier if present
        let content_start = response[content_start..]
            .find('\n')
            .map(|i| content_start + i + 1)
            .unwrap_or(content_start);
        if let Some(end) = response[content_start..].find("```") {
            return response[content_start..content_start + end].trim();
        }
    }

    // Try to find raw JSON object
    if let Some(start) = response.find('{') {
        if let Some(end) = response.rfind('}') {
            if end > start {
                return &response[start..=end];
            }
        }
    }

    // Return as-is
    response
}

/// Generate an output template with placeholder values.
fn generate_output_template<S: Signature>() -> String {
    let mut obj = serde_json::Map::new();

    for field in S::output_fields() {
        let placeholder = field_placeholder(&field.field_type);
        obj.insert(field.name.clone(), placeholder);
    }

    serde_json::to_string_pretty(&Value::Object(obj)).unwrap_or_default()
}

/// Generate a placeholder value for a field type.
fn field_placeholder(field_type: &FieldType) -> Value {
    match field_type {
        FieldType::String => Value::String("<string>".to_string()),
        FieldType::Integer => Value::String("<integer>".to_string()),
        FieldType::Float => Value::String("<number>".to_string()),
        FieldType::Boolean => Value::String("<true|false>".to_string()),
        FieldType::List(inner) => Value::Array(vec![field_placeholder(inner)]),
        FieldType::Object(fields) => {
            let mut obj = serde_json::Map::new();
            for f in fields {
                obj.insert(f.name.clone(), field_placeholder(&f.field_type));
            }
            Value::Object(obj)
        }
        FieldType::Enum(values) => Value::String(values.join("|")),
        FieldType::Custom(name) => Value::String(format!("<{}>", name)),
    }
}

/// Format a JSON value for display in a prompt.
fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(arr) if arr.len() <= 3 => {
            let items: Vec<_> = arr.iter().map(|v| format_value(v)).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Array(arr) => {
            format!("[{} items]", arr.len())
        }
        Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
        other => other.to_string(),
    }
}

/// Truncate a string to a maximum length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len])
    }
}
