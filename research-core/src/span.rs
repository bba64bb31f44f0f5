//! Hierarchical observability spans emitted during orchestration.
//!
//! A run produces one trace span (one per `RunResearch`), phase spans
//! (scope, fill, research, finalize) nested under the trace, step spans
//! nested under the research phase, and generation spans for individual LLM
//! calls nested under whichever phase or step issued them. Spans are handed
//! to a [`SpanSink`] as they close; this crate never assumes a particular
//! sink (structured logging, an in-memory buffer for tests, or a remote
//! collector are all valid implementations).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Position of a span in the trace → phase → step → generation hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    /// One per `RunResearch` invocation.
    Trace,
    /// One of scope, fill, research, finalize.
    Phase,
    /// A single tool-chain step within the research phase.
    Step,
    /// A single LLM call (prompt in, completion out).
    Generation,
}

impl std::fmt::Display for SpanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Trace => "trace",
            Self::Phase => "phase",
            Self::Step => "step",
            Self::Generation => "generation",
        };
        write!(f, "{}", s)
    }
}

/// Severity of a span, independent of whether the underlying operation errored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpanLevel {
    Info,
    Warning,
    Error,
}

/// Token usage attached to a generation span.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpanUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl SpanUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Maximum length, in characters, of an input/output summary before it is
/// truncated. Summaries are counts and short excerpts, never raw bodies.
const SUMMARY_EXCERPT_CAP: usize = 500;

/// A single observability span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub kind: SpanKind,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_summary: Option<String>,
    pub metadata: HashMap<String, Value>,
    pub level: SpanLevel,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<SpanUsage>,
}

impl Span {
    /// Start a new, open span. Call [`Span::close`] (or one of the
    /// `finish_*` helpers) once the operation completes.
    pub fn start(kind: SpanKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            input_summary: None,
            output_summary: None,
            metadata: HashMap::new(),
            level: SpanLevel::Info,
            started_at: Utc::now(),
            ended_at: None,
            usage: None,
        }
    }

    pub fn with_input_summary(mut self, summary: impl Into<String>) -> Self {
        self.input_summary = Some(truncate(&summary.into()));
        self
    }

    pub fn with_output_summary(mut self, summary: impl Into<String>) -> Self {
        self.output_summary = Some(truncate(&summary.into()));
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_usage(mut self, usage: SpanUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Mark this span's duration as complete at the given level.
    pub fn close(mut self, level: SpanLevel) -> Self {
        self.level = level;
        self.ended_at = Some(Utc::now());
        self
    }

    /// Convenience: close at `INFO`.
    pub fn finish_ok(self) -> Self {
        self.close(SpanLevel::Info)
    }

    /// Convenience: close at `WARNING`, typically for a step that failed but
    /// was absorbed by `on_error: continue`.
    pub fn finish_warning(self, reason: impl Into<String>) -> Self {
        self.with_metadata("warning", reason.into()).close(SpanLevel::Warning)
    }

    /// Convenience: close at `ERROR`.
    pub fn finish_error(self, error: impl Into<String>) -> Self {
        self.with_metadata("error", error.into()).close(SpanLevel::Error)
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }

    pub fn is_error(&self) -> bool {
        self.level == SpanLevel::Error
    }
}

fn truncate(s: &str) -> String {
    if s.chars().count() <= SUMMARY_EXCERPT_CAP {
        s.to_string()
    } else {
        let excerpt: String = s.chars().take(SUMMARY_EXCERPT_CAP).collect();
        format!("{excerpt}… ({} chars total)", s.chars().count())
    }
}

/// Receives spans as they close. Implementations might forward to
/// `tracing`, buffer in memory for tests, or POST to a collector; the core
/// orchestrator only depends on this trait.
pub trait SpanSink: Send + Sync {
    fn emit(&self, span: &Span);
}

/// A sink that forwards each span to the `tracing` ecosystem at its level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSpanSink;

impl SpanSink for TracingSpanSink {
    fn emit(&self, span: &Span) {
        let fields = serde_json::to_string(&span.metadata).unwrap_or_default();
        match span.level {
            SpanLevel::Info => tracing::info!(
                kind = %span.kind,
                name = %span.name,
                duration_ms = span.duration_ms(),
                metadata = %fields,
                "span closed"
            ),
            SpanLevel::Warning => tracing::warn!(
                kind = %span.kind,
                name = %span.name,
                duration_ms = span.duration_ms(),
                metadata = %fields,
                "span closed"
            ),
            SpanLevel::Error => tracing::error!(
                kind = %span.kind,
                name = %span.name,
                duration_ms = span.duration_ms(),
                metadata = %fields,
                "span closed"
            ),
        }
    }
}

/// An in-memory sink, primarily for tests and for embedders that want to
/// inspect a run's full span tree after the fact.
#[derive(Debug, Default)]
pub struct BufferingSpanSink {
    spans: std::sync::Mutex<Vec<Span>>,
}

impl BufferingSpanSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().expect("span buffer lock poisoned").clone()
    }
}

impl SpanSink for BufferingSpanSink {
    fn emit(&self, span: &Span) {
        self.spans
            .lock()
            .expect("span buffer lock poisoned")
            .push(span.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_lifecycle() {
        let span = Span::start(SpanKind::Step, "web_search")
            .with_input_summary("query: rust async runtimes")
            .with_metadata("phase", "research")
            .finish_ok();

        assert_eq!(span.level, SpanLevel::Info);
        assert!(span.ended_at.is_some());
        assert!(span.duration_ms().unwrap() >= 0);
    }

    #[test]
    fn test_finish_error_records_reason() {
        let span = Span::start(SpanKind::Step, "semantic_search").finish_error("timeout");
        assert!(span.is_error());
        assert_eq!(
            span.metadata.get("error"),
            Some(&Value::String("timeout".to_string()))
        );
    }

    #[test]
    fn test_summary_is_truncated() {
        let long = "x".repeat(SUMMARY_EXCERPT_CAP + 50);
        let span = Span::start(SpanKind::Generation, "write").with_output_summary(long);
        let summary = span.output_summary.unwrap();
        assert!(summary.len() < SUMMARY_EXCERPT_CAP + 50);
        assert!(summary.contains("chars total"));
    }

    #[test]
    fn test_buffering_sink_collects_spans() {
        let sink = BufferingSpanSink::new();
        sink.emit(&Span::start(SpanKind::Trace, "run_research").finish_ok());
        sink.emit(&Span::start(SpanKind::Phase, "scope").finish_ok());
        assert_eq!(sink.spans().len(), 2);
    }

    #[test]
    fn test_usage_total_tokens() {
        let usage = SpanUsage::new(100, 50);
        assert_eq!(usage.total_tokens(), 150);
    }
}
