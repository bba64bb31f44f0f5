//! Finalize: Cluster → Analyze → Write → Cite, turning gathered evidence
//! into the briefing's sections and citation list.
//!
//! Every LLM call in this phase degrades gracefully rather than failing the
//! whole run: a cluster call that errors or parses badly falls back to one
//! cluster covering all evidence; a write call that is still malformed after
//! one retry falls back to a single deterministic "Research Summary" section
//! built from the raw evidence titles/snippets, never an `Err`.

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::{ModelPurpose, Settings};
use crate::error::Result;
use crate::llm::LLMClient;
use crate::module::{Module, Predict, PredictConfig};
use crate::signatures::{
    AnalyzeCluster, AnalyzeClusterInputs, ClusterEvidence, ClusterEvidenceInputs, ClusterLabel, WriteSections,
    WriteSectionsInputs, WrittenSection,
};
use crate::span::{Span, SpanKind, SpanSink};
use crate::state::{Citation, Section, State};
use crate::strategy::Strategy;

/// Minimum total body length, in words, below which a `Write` result is
/// retried once with a `deficiency_note`. Scaled to depth: a brief briefing
/// is legitimately short, a comprehensive one should not be.
fn quality_floor_words(depth: &str) -> usize {
    match depth {
        "brief" => 50,
        "comprehensive" => 300,
        _ => 150,
    }
}

pub async fn run(
    state: &mut State,
    strategy: &Strategy,
    settings: &Settings,
    llm_client: Arc<dyn LLMClient>,
    span_sink: &dyn SpanSink,
) -> Result<()> {
    let span = Span::start(SpanKind::Phase, "finalize");

    if state.evidence.is_empty() {
        span_sink.emit(&span.finish_warning("no evidence gathered, nothing to finalize"));
        state.phase = crate::state::Phase::Failed;
        return Ok(());
    }

    let summaries: Vec<String> = state
        .evidence
        .iter()
        .enumerate()
        .map(|(i, e)| format!("{i}: {} — {}", e.title, e.snippet))
        .collect();

    let clusters = cluster(&summaries, settings, Arc::clone(&llm_client)).await;
    let analyses = analyze(
        state.depth.as_deref().unwrap_or("deep"),
        &clusters,
        &summaries,
        settings,
        Arc::clone(&llm_client),
    )
    .await;
    let sections = write(state, strategy, &analyses, &summaries, settings, llm_client).await;

    state.sections = sections.iter().map(|s| Section { heading: s.heading.clone(), body: s.body.clone() }).collect();
    state.citations = cite(state, strategy, settings, &sections);
    state.phase = crate::state::Phase::Finalized;

    span_sink.emit(
        &span
            .with_output_summary(format!("sections={} citations={}", state.sections.len(), state.citations.len()))
            .finish_ok(),
    );
    Ok(())
}

async fn cluster(summaries: &[String], settings: &Settings, llm_client: Arc<dyn LLMClient>) -> Vec<ClusterLabel> {
    let model = settings.models.get(ModelPurpose::Cluster);
    let predict = Predict::<ClusterEvidence>::with_lm(llm_client).with_config(
        PredictConfig::new()
            .with_model(model.model.clone())
            .with_temperature(model.temperature)
            .with_max_tokens(model.max_tokens)
            .with_max_retries(0),
    );

    let fallback = || vec![ClusterLabel { label: "All evidence".to_string(), member_indices: (0..summaries.len()).collect() }];

    match predict.forward(ClusterEvidenceInputs { evidence_summaries: summaries.to_vec() }).await {
        Ok(outputs) if covers_every_index(&outputs.clusters, summaries.len()) => outputs.clusters,
        _ => fallback(),
    }
}

fn covers_every_index(clusters: &[ClusterLabel], total: usize) -> bool {
    if clusters.is_empty() {
        return false;
    }
    let seen: HashSet<usize> = clusters.iter().flat_map(|c| c.member_indices.iter().copied()).collect();
    (0..total).all(|i| seen.contains(&i))
}

struct ClusterAnalysis {
    label: String,
    key_facts: Vec<String>,
    analysis: String,
}

async fn analyze(
    depth: &str,
    clusters: &[ClusterLabel],
    summaries: &[String],
    settings: &Settings,
    llm_client: Arc<dyn LLMClient>,
) -> Vec<ClusterAnalysis> {
    let model = settings.models.get(ModelPurpose::Analyze);
    // A failed analyze call degrades to an empty analysis rather than
    // retrying internally; Predict's parse-retry would just resend the same
    // malformed request to the same model.
    let make_predict = || {
        Predict::<AnalyzeCluster>::with_lm(Arc::clone(&llm_client)).with_config(
            PredictConfig::new()
                .with_model(model.model.clone())
                .with_temperature(model.temperature)
                .with_max_tokens(model.max_tokens)
                .with_max_retries(0),
        )
    };

    // `brief` depth combines everything into one call rather than one per
    // cluster, since a brief briefing rarely warrants per-cluster detail.
    let targets: Vec<&ClusterLabel> = if depth == "brief" {
        clusters.first().into_iter().collect()
    } else {
        clusters.iter().collect()
    };

    let mut analyses = Vec::with_capacity(targets.len());
    for cluster in targets {
        let member_summaries: Vec<String> = cluster
            .member_indices
            .iter()
            .filter_map(|&i| summaries.get(i).cloned())
            .collect();
        let inputs = AnalyzeClusterInputs { label: cluster.label.clone(), evidence_summaries: member_summaries };
        match make_predict().forward(inputs).await {
            Ok(outputs) => analyses.push(ClusterAnalysis { label: cluster.label.clone(), key_facts: outputs.key_facts, analysis: outputs.analysis }),
            Err(_) => analyses.push(ClusterAnalysis { label: cluster.label.clone(), key_facts: Vec::new(), analysis: String::new() }),
        }
    }
    analyses
}

async fn write(
    state: &State,
    strategy: &Strategy,
    analyses: &[ClusterAnalysis],
    summaries: &[String],
    settings: &Settings,
    llm_client: Arc<dyn LLMClient>,
) -> Vec<WrittenSection> {
    let model = settings.models.get(ModelPurpose::Write);
    let cluster_analyses: Vec<String> = analyses
        .iter()
        .map(|a| format!("{}: {}\n{}", a.label, a.analysis, a.key_facts.join("; ")))
        .collect();
    let depth = state.depth.clone().unwrap_or_else(|| "deep".to_string());
    let floor = quality_floor_words(&depth);

    let make_inputs = |deficiency_note: Option<String>| WriteSectionsInputs {
        topic: state.user_request.clone(),
        depth: depth.clone(),
        required_sections: strategy.output_spec.required_sections.clone(),
        cluster_analyses: cluster_analyses.clone(),
        evidence_summaries: summaries.to_vec(),
        deficiency_note,
    };

    // The deficiency-note retry below is this phase's own retry path;
    // Predict's internal parse-retry is disabled so each call corresponds to
    // exactly one write attempt.
    let make_predict = || {
        Predict::<WriteSections>::with_lm(Arc::clone(&llm_client)).with_config(
            PredictConfig::new()
                .with_model(model.model.clone())
                .with_temperature(model.temperature)
                .with_max_tokens(model.max_tokens)
                .with_max_retries(0),
        )
    };

    let required_count = strategy.output_spec.required_sections.len();

    let first = make_predict().forward(make_inputs(None)).await.ok();
    if let Some(outputs) = &first {
        if meets_quality_floor(&outputs.sections, floor, required_count) {
            return outputs.sections.clone();
        }
    }

    let deficiency = if first.as_ref().map_or(0, |o| o.sections.len()) < required_count {
        format!("the previous draft had too few sections; this strategy requires at least {required_count}")
    } else {
        format!("the previous draft was too short for '{depth}' depth; expand with more supporting detail")
    };
    let retried = make_predict().forward(make_inputs(Some(deficiency))).await.ok();
    if let Some(outputs) = &retried {
        if total_words(&outputs.sections) >= floor || !outputs.sections.is_empty() {
            return outputs.sections.clone();
        }
    }

    fallback_sections(summaries)
}

fn total_words(sections: &[WrittenSection]) -> usize {
    sections.iter().map(|s| s.body.split_whitespace().count()).sum()
}

/// §4.6 step 5: the Write result clears the quality floor only if it has
/// at least the strategy's required number of sections *and* enough total
/// body words for the depth.
fn meets_quality_floor(sections: &[WrittenSection], word_floor: usize, required_count: usize) -> bool {
    sections.len() >= required_count && total_words(sections) >= word_floor
}

fn fallback_sections(summaries: &[String]) -> Vec<WrittenSection> {
    let body = summaries.join("\n");
    vec![WrittenSection {
        heading: "Research Summary".to_string(),
        body,
        cited_indices: (0..summaries.len()).collect(),
    }]
}

fn cite(state: &State, strategy: &Strategy, settings: &Settings, sections: &[WrittenSection]) -> Vec<Citation> {
    let (min, max) = strategy.citation_bounds((settings.defaults.citation_min, settings.defaults.citation_max));

    let mut cited_indices: Vec<usize> = sections.iter().flat_map(|s| s.cited_indices.iter().copied()).collect();
    cited_indices.sort_unstable();
    cited_indices.dedup();

    let mut citations: Vec<Citation> = Vec::new();
    let mut seen = HashSet::new();
    for i in cited_indices {
        if let Some(evidence) = state.evidence.get(i) {
            let citation = Citation::from_evidence(evidence);
            if seen.insert(citation.identity()) {
                citations.push(citation);
            }
        }
    }

    // Pad from remaining evidence (in order) if the writer cited fewer than
    // the strategy's minimum; never invent a citation not backed by evidence.
    if citations.len() < min {
        for evidence in &state.evidence {
            if citations.len() >= min {
                break;
            }
            let citation = Citation::from_evidence(evidence);
            if seen.insert(citation.identity()) {
                citations.push(citation);
            }
        }
    }

    citations.truncate(max);
    citations
}
