//! Declarative strategies: the YAML-equivalent plan a Strategy Loader
//! indexes, and the loader itself.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What to do when a step's adapter call fails after any retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    Abort,
    Continue,
    Retry,
}

impl Default for OnError {
    fn default() -> Self {
        Self::Continue
    }
}

/// How a strategy variable's value is obtained during Fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "source")]
pub enum VariableSource {
    /// Pulled directly from the inbound request (topic, identity, depth_override).
    FromRequest { field: String },
    /// Set by the Scope phase (category, time_window, depth).
    FromScope,
    /// Resolved via a single batched LLM call during Fill.
    LlmFill,
}

/// One strategy-declared variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyVariable {
    pub name: String,
    pub source: VariableSource,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub required: bool,
}

/// One step of a strategy's tool chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(rename = "use")]
    pub uses: String,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<String>,
    #[serde(default = "default_loop_var")]
    pub r#as: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_as: Option<String>,
    #[serde(default)]
    pub on_error: OnError,
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_loop_var() -> String {
    "item".to_string()
}

fn default_retry_max() -> u32 {
    2
}

/// Output shape requirements for a strategy's finalize stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OutputSpec {
    #[serde(default)]
    pub required_sections: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation_min: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citation_max: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer_prompt: Option<String>,
}

/// A declarative research strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub slug: String,
    pub version: String,
    pub category: String,
    pub time_window: String,
    pub depth: String,
    #[serde(default)]
    pub variables: Vec<StrategyVariable>,
    pub tool_chain: Vec<Step>,
    #[serde(default)]
    pub output_spec: OutputSpec,
}

impl Strategy {
    /// Validate structural invariants the loader requires to hold for every
    /// strategy: unique `save_as`, declared variables, well-formed `for_each`
    /// paths. `known_adapter_keys`/`known_capabilities` together determine
    /// whether a step's `use` resolves.
    pub fn validate(
        &self,
        known_adapter_keys: &HashSet<String>,
        known_capabilities: &HashSet<String>,
    ) -> Result<()> {
        let declared_vars: HashSet<&str> = self.variables.iter().map(|v| v.name.as_str()).collect();
        let mut seen_save_as: HashSet<&str> = HashSet::new();

        for step in &self.tool_chain {
            if !known_adapter_keys.contains(&step.uses) && !known_capabilities.contains(&step.uses) {
                return Err(Error::config(format!(
                    "strategy '{}' step '{}' uses unknown adapter/capability '{}'",
                    self.slug, step.name, step.uses
                )));
            }

            if step.retry_max > 5 {
                return Err(Error::config(format!(
                    "strategy '{}' step '{}' retry_max {} exceeds bound of 5",
                    self.slug, step.name, step.retry_max
                )));
            }

            if let Some(save_as) = &step.save_as {
                if !seen_save_as.insert(save_as.as_str()) {
                    return Err(Error::config(format!(
                        "strategy '{}' has duplicate save_as '{}'",
                        self.slug, save_as
                    )));
                }
            }

            if let Some(for_each) = &step.for_each {
                if !is_dotted_reference(for_each) {
                    return Err(Error::config(format!(
                        "strategy '{}' step '{}' has malformed for_each path '{}'",
                        self.slug, step.name, for_each
                    )));
                }
            }

            for reference in referenced_variables(step) {
                if !declared_vars.contains(reference.as_str())
                    && !is_builtin_reference(&reference)
                    && !seen_save_as.contains(reference.as_str())
                {
                    return Err(Error::config(format!(
                        "strategy '{}' step '{}' references undeclared variable '{}'",
                        self.slug, step.name, reference
                    )));
                }
            }
        }

        Ok(())
    }

    /// Effective citation bounds: an explicit `output_spec` bound overrides
    /// the settings-document default (see the Open Questions resolution in
    /// the design notes).
    pub fn citation_bounds(&self, defaults: (usize, usize)) -> (usize, usize) {
        (
            self.output_spec.citation_min.unwrap_or(defaults.0),
            self.output_spec.citation_max.unwrap_or(defaults.1),
        )
    }
}

fn is_builtin_reference(name: &str) -> bool {
    matches!(name, "topic" | "category" | "time_window" | "depth" | "identity")
}

fn is_dotted_reference(path: &str) -> bool {
    !path.is_empty()
        && path
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_alphanumeric() || c == '_'))
}

/// Extract every `{{name}}`/`{{name.x}}` top-level reference appearing in a
/// step's `params` values and its `when`/`for_each` expressions.
fn referenced_variables(step: &Step) -> Vec<String> {
    let mut refs = Vec::new();
    let mut collect_from_str = |s: &str, refs: &mut Vec<String>| {
        let mut rest = s;
        while let Some(start) = rest.find("{{") {
            let after = &rest[start + 2..];
            if let Some(end) = after.find("}}") {
                let path = after[..end].trim();
                if let Some(head) = path.split('.').next() {
                    refs.push(head.to_string());
                }
                rest = &after[end + 2..];
            } else {
                break;
            }
        }
    };

    for value in step.params.values() {
        if let serde_json::Value::String(s) = value {
            collect_from_str(s, &mut refs);
        }
    }
    if let Some(when) = &step.when {
        collect_from_str(when, &mut refs);
    }
    if let Some(for_each) = &step.for_each {
        if let Some(head) = for_each.split('.').next() {
            refs.push(head.to_string());
        }
    }
    refs
}

/// Indexes and owns every loaded strategy.
#[derive(Debug, Default)]
pub struct StrategyRegistry {
    by_slug: HashMap<String, Strategy>,
    by_shape: HashMap<(String, String, String), String>,
}

impl StrategyRegistry {
    pub fn get(&self, slug: &str) -> Option<&Strategy> {
        self.by_slug.get(slug)
    }

    /// Look up a strategy by (category, time_window, depth) when no explicit
    /// slug hint was given.
    pub fn find_by_shape(&self, category: &str, time_window: &str, depth: &str) -> Option<&Strategy> {
        self.by_shape
            .get(&(category.to_string(), time_window.to_string(), depth.to_string()))
            .and_then(|slug| self.by_slug.get(slug))
    }

    pub fn len(&self) -> usize {
        self.by_slug.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_slug.is_empty()
    }

    pub fn strategies(&self) -> impl Iterator<Item = &Strategy> {
        self.by_slug.values()
    }
}

/// Walks a directory of strategy files, parses, validates, and indexes them.
pub struct StrategyLoader {
    known_adapter_keys: HashSet<String>,
    known_capabilities: HashSet<String>,
}

impl StrategyLoader {
    pub fn new(known_adapter_keys: HashSet<String>, known_capabilities: HashSet<String>) -> Self {
        Self { known_adapter_keys, known_capabilities }
    }

    /// Load and validate every `*.yaml`/`*.yml` file directly under `dir`.
    ///
    /// Structural errors (duplicate slug, unknown required adapter with no
    /// capability fallback, malformed `for_each`) fail the whole load.
    /// Unknown adapter keys that *do* declare a capability fallback are a
    /// warning, not a hard failure (the fallback will be exercised at
    /// execution time by the Adapter Registry).
    pub fn load(&self, dir: &Path) -> Result<StrategyRegistry> {
        let mut registry = StrategyRegistry::default();
        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| Error::config(format!("cannot read strategy directory {}: {e}", dir.display())))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(p.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"))
            })
            .collect();
        entries.sort();

        for path in entries {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| Error::config(format!("cannot read strategy file {}: {e}", path.display())))?;
            let strategy: Strategy = serde_yaml::from_str(&text).map_err(|e| {
                Error::config(format!("malformed strategy file {}: {e}", path.display()))
            })?;

            if registry.by_slug.contains_key(&strategy.slug) {
                return Err(Error::config(format!("duplicate strategy slug '{}'", strategy.slug)));
            }

            strategy.validate(&self.known_adapter_keys, &self.known_capabilities)?;

            registry.by_shape.insert(
                (strategy.category.clone(), strategy.time_window.clone(), strategy.depth.clone()),
                strategy.slug.clone(),
            );
            registry.by_slug.insert(strategy.slug.clone(), strategy);
        }

        Ok(registry)
    }
}
