//! The mutable record threaded through scope → fill → research → finalize.
//!
//! `State` is owned exclusively by the [`crate::orchestrator::Orchestrator`]
//! for the duration of one request; phases receive `&mut State` and append
//! to it, never replacing fields another phase depends on.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::strategy::Step;
use crate::template::Value;

/// One retrieved fact-bearing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// May be empty for LLM-derived evidence with no backing URL.
    pub url: String,
    pub title: String,
    pub snippet: String,
    pub published_at: Option<DateTime<Utc>>,
    pub source_tool: String,
    pub relevance: Option<f32>,
    pub raw: serde_json::Value,
}

impl Evidence {
    pub fn new(source_tool: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: String::new(),
            title: title.into(),
            snippet: String::new(),
            published_at: None,
            source_tool: source_tool.into(),
            relevance: None,
            raw: serde_json::Value::Null,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = snippet.into();
        self
    }

    pub fn with_published_at(mut self, at: DateTime<Utc>) -> Self {
        self.published_at = Some(at);
        self
    }

    pub fn with_relevance(mut self, relevance: f32) -> Self {
        self.relevance = Some(relevance);
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = raw;
        self
    }

    /// The dedup/identity key described for the Research Phase Controller:
    /// normalized URL paired with a lowercase, punctuation-stripped title.
    pub fn dedup_key(&self) -> (String, String) {
        (normalize_url(&self.url), normalize_title(&self.title))
    }
}

fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_lowercase()
}

fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// One section of the finalized briefing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub heading: String,
    pub body: String,
}

/// A citation dereferenced from an Evidence the writer actually cited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub published_at: Option<DateTime<Utc>>,
}

impl Citation {
    pub fn from_evidence(evidence: &Evidence) -> Self {
        Self {
            title: evidence.title.clone(),
            url: evidence.url.clone(),
            snippet: evidence.snippet.clone(),
            published_at: evidence.published_at,
        }
    }

    /// The identity used to check `citations ⊆ evidence`.
    pub fn identity(&self) -> (String, String) {
        (normalize_url(&self.url), normalize_title(&self.title))
    }
}

/// A structured record of one step's non-fatal or fatal error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub step: String,
    pub kind: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn from_error(step: impl Into<String>, error: &Error) -> Self {
        Self {
            step: step.into(),
            kind: error.kind().as_str().to_string(),
            message: error.to_string(),
            occurred_at: Utc::now(),
        }
    }
}

/// What happened when the Step Executor ran one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StepOutcome {
    Ran { evidence_count: usize },
    Skipped { reason: String },
    Failed { error: ErrorRecord },
}

/// Terminal status of one orchestrator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

/// The orchestrator's state machine position, per the documented transitions
/// `INIT → SCOPED → FILLED → RESEARCHED → FINALIZED | FAILED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Scoped,
    Filled,
    Researched,
    Finalized,
    Failed,
}

/// The mutable record threaded through all four phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub user_request: String,
    pub identity: HashMap<String, String>,
    pub strategy_slug: Option<String>,
    pub category: Option<String>,
    pub time_window: Option<String>,
    pub depth: Option<String>,
    pub tasks: Vec<String>,
    pub vars: HashMap<String, Value>,
    /// Locked at the end of Fill; Research may not mutate step definitions.
    pub runtime_plan: Vec<Step>,
    pub evidence: Vec<Evidence>,
    pub sections: Vec<Section>,
    pub citations: Vec<Citation>,
    pub errors: Vec<ErrorRecord>,
    pub step_outcomes: Vec<(String, StepOutcome)>,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
}

impl State {
    pub fn new(user_request: impl Into<String>, identity: HashMap<String, String>) -> Self {
        Self {
            user_request: user_request.into(),
            identity,
            strategy_slug: None,
            category: None,
            time_window: None,
            depth: None,
            tasks: Vec::new(),
            vars: HashMap::new(),
            runtime_plan: Vec::new(),
            evidence: Vec::new(),
            sections: Vec::new(),
            citations: Vec::new(),
            errors: Vec::new(),
            step_outcomes: Vec::new(),
            phase: Phase::Init,
            started_at: Utc::now(),
        }
    }

    pub fn record_error(&mut self, step: impl Into<String>, error: &Error) {
        self.errors.push(ErrorRecord::from_error(step, error));
    }

    pub fn to_scope(&self) -> crate::template::Scope {
        let mut scope = crate::template::Scope::from_map(self.vars.clone());
        scope.set("topic", Value::String(self.user_request.clone()));
        if let Some(category) = &self.category {
            scope.set("category", Value::String(category.clone()));
        }
        if let Some(time_window) = &self.time_window {
            scope.set("time_window", Value::String(time_window.clone()));
        }
        if let Some(depth) = &self.depth {
            scope.set("depth", Value::String(depth.clone()));
        }
        scope
    }

    /// Append evidence observing the dedup and cap rules of the Research
    /// Phase Controller. Returns the number of records actually appended
    /// (after dedup) and the number dropped for exceeding `cap`.
    pub fn append_evidence(&mut self, new_evidence: Vec<Evidence>, cap: usize) -> (usize, usize) {
        let mut appended = 0;
        let mut dropped_for_cap = 0;
        for item in new_evidence {
            let key = item.dedup_key();
            let is_dup = self.evidence.iter().any(|existing| existing.dedup_key() == key);
            if is_dup {
                continue;
            }
            if self.evidence.len() >= cap {
                // FIFO eviction: drop the oldest to make room, preserving
                // the relative order of what remains.
                self.evidence.remove(0);
                dropped_for_cap += 1;
            }
            self.evidence.push(item);
            appended += 1;
        }
        (appended, dropped_for_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_key_normalizes_url_and_title() {
        let a = Evidence::new("web_search", "Rust 2.0 Released!").with_url("https://Example.com/x/");
        let b = Evidence::new("web_search", "rust 2.0 released").with_url("https://example.com/x");
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn test_append_evidence_dedups_keeping_earlier() {
        let mut state = State::new("topic", HashMap::new());
        let a = Evidence::new("web_search", "Same Title").with_url("https://x.com").with_snippet("first");
        let b = Evidence::new("web_search", "same title").with_url("https://x.com").with_snippet("second");
        let (appended1, _) = state.append_evidence(vec![a], 200);
        let (appended2, _) = state.append_evidence(vec![b], 200);
        assert_eq!(appended1, 1);
        assert_eq!(appended2, 0);
        assert_eq!(state.evidence.len(), 1);
        assert_eq!(state.evidence[0].snippet, "first");
    }

    #[test]
    fn test_append_evidence_respects_cap_fifo() {
        let mut state = State::new("topic", HashMap::new());
        for i in 0..5 {
            state.append_evidence(
                vec![Evidence::new("web_search", format!("t{i}")).with_url(format!("https://x.com/{i}"))],
                3,
            );
        }
        assert_eq!(state.evidence.len(), 3);
        assert_eq!(state.evidence[0].title, "t2");
        assert_eq!(state.evidence[2].title, "t4");
    }

    #[test]
    fn test_citation_identity_matches_evidence_dedup_key() {
        let evidence = Evidence::new("web_search", "Title").with_url("https://x.com");
        let citation = Citation::from_evidence(&evidence);
        assert_eq!(citation.identity(), evidence.dedup_key());
    }
}
