//! The settings document consumed by the orchestrator.
//!
//! Mirrors the persisted/config state described for the core: per-purpose
//! model selection, execution limits, and citation defaults. Deserializes
//! from the same YAML-equivalent form as strategies so a deployment ships one
//! `settings.yaml` alongside its `strategies/` directory.

use serde::{Deserialize, Serialize};

/// The five purposes the orchestrator issues LLM calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelPurpose {
    Scope,
    Fill,
    Cluster,
    Analyze,
    Write,
}

impl std::fmt::Display for ModelPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Scope => "scope",
            Self::Fill => "fill",
            Self::Cluster => "cluster",
            Self::Analyze => "analyze",
            Self::Write => "write",
        };
        write!(f, "{s}")
    }
}

/// Model selection and sampling parameters for one purpose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
}

fn default_temperature() -> f64 {
    0.2
}

impl ModelConfig {
    pub fn new(model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            model: model.into(),
            temperature: default_temperature(),
            max_tokens,
            top_p: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }

    /// Validate the sampling temperature falls in the documented 0-2 range.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(format!(
                "temperature must be in 0.0..=2.0, got {}",
                self.temperature
            ));
        }
        Ok(())
    }
}

/// Per-purpose model table: `models.{scope,fill,cluster,analyze,write}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub scope: ModelConfig,
    pub fill: ModelConfig,
    pub cluster: ModelConfig,
    pub analyze: ModelConfig,
    pub write: ModelConfig,
}

impl ModelsConfig {
    pub fn get(&self, purpose: ModelPurpose) -> &ModelConfig {
        match purpose {
            ModelPurpose::Scope => &self.scope,
            ModelPurpose::Fill => &self.fill,
            ModelPurpose::Cluster => &self.cluster,
            ModelPurpose::Analyze => &self.analyze,
            ModelPurpose::Write => &self.write,
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        // A conservative, cheap default suitable for tests and first boot;
        // production deployments override every field via settings.yaml.
        let scope = ModelConfig::new("claude-3-5-haiku-20241022", 256);
        let fill = ModelConfig::new("claude-3-5-haiku-20241022", 512);
        let cluster = ModelConfig::new("claude-3-5-sonnet-20241022", 1024);
        let analyze = ModelConfig::new("claude-3-5-sonnet-20241022", 1024);
        let write = ModelConfig::new("claude-3-5-sonnet-20241022", 4096);
        Self { scope, fill, cluster, analyze, write }
    }
}

/// Execution limits: `limits.*`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_phase_deadline_secs")]
    pub phase_deadline_secs: u64,
    #[serde(default = "default_evidence_cap")]
    pub evidence_cap: usize,
    #[serde(default = "default_for_each_concurrency")]
    pub for_each_concurrency: usize,
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,
}

fn default_phase_deadline_secs() -> u64 {
    180
}
fn default_evidence_cap() -> usize {
    200
}
fn default_for_each_concurrency() -> usize {
    4
}
fn default_retry_max() -> u32 {
    2
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            phase_deadline_secs: default_phase_deadline_secs(),
            evidence_cap: default_evidence_cap(),
            for_each_concurrency: default_for_each_concurrency(),
            retry_max: default_retry_max(),
        }
    }
}

impl LimitsConfig {
    /// Derive a phase deadline from depth: deeper research gets more time,
    /// bounded by the configured ceiling for "comprehensive".
    pub fn phase_deadline_for_depth(&self, depth: &str) -> std::time::Duration {
        let secs = match depth {
            "brief" => self.phase_deadline_secs / 3,
            "deep" => self.phase_deadline_secs,
            "comprehensive" => self.phase_deadline_secs * 2,
            _ => self.phase_deadline_secs,
        };
        std::time::Duration::from_secs(secs.max(1))
    }
}

/// Citation count defaults: `defaults.citation_min/max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_citation_min")]
    pub citation_min: usize,
    #[serde(default = "default_citation_max")]
    pub citation_max: usize,
}

fn default_citation_min() -> usize {
    3
}
fn default_citation_max() -> usize {
    10
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            citation_min: default_citation_min(),
            citation_max: default_citation_max(),
        }
    }
}

/// The full settings document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Settings {
    pub models: ModelsConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

impl Settings {
    /// Parse a settings document from its YAML-equivalent textual form.
    pub fn from_yaml(text: &str) -> Result<Self, crate::error::Error> {
        serde_yaml::from_str(text)
            .map_err(|e| crate::error::Error::config(format!("invalid settings document: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let limits = LimitsConfig::default();
        assert_eq!(limits.phase_deadline_secs, 180);
        assert_eq!(limits.evidence_cap, 200);
        assert_eq!(limits.for_each_concurrency, 4);
        assert_eq!(limits.retry_max, 2);

        let defaults = DefaultsConfig::default();
        assert_eq!(defaults.citation_min, 3);
        assert_eq!(defaults.citation_max, 10);
    }

    #[test]
    fn test_phase_deadline_scales_with_depth() {
        let limits = LimitsConfig::default();
        assert!(limits.phase_deadline_for_depth("brief") < limits.phase_deadline_for_depth("deep"));
        assert!(
            limits.phase_deadline_for_depth("deep") < limits.phase_deadline_for_depth("comprehensive")
        );
    }

    #[test]
    fn test_model_config_validates_temperature_range() {
        let bad = ModelConfig::new("x", 100).with_temperature(3.0);
        assert!(bad.validate().is_err());
        let ok = ModelConfig::new("x", 100).with_temperature(1.0);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_settings_from_yaml_minimal() {
        let yaml = r#"
models:
  scope: { model: "haiku", max_tokens: 256 }
  fill: { model: "haiku", max_tokens: 512 }
  cluster: { model: "sonnet", max_tokens: 1024 }
  analyze: { model: "sonnet", max_tokens: 1024 }
  write: { model: "sonnet", max_tokens: 4096 }
"#;
        let settings = Settings::from_yaml(yaml).unwrap();
        assert_eq!(settings.models.scope.model, "haiku");
        assert_eq!(settings.limits.evidence_cap, 200);
    }

    #[test]
    fn test_settings_from_yaml_rejects_malformed_document() {
        let err = Settings::from_yaml("models: [not, an, object]").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }
}
