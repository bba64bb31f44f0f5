//! The typed `Signature`s behind every LLM call the orchestrator issues:
//! scope categorization, variable fill, and the finalize synthesizer's
//! cluster/analyze/write stages. Each is a thin `#[derive(Signature)]`
//! struct; the generated `{Name}Inputs`/`{Name}Outputs` types are what the
//! phase modules actually construct and consume.

use research_core_derive::Signature;
use serde::{Deserialize, Serialize};

/// Scope: classify a raw topic into the (category, time_window, depth)
/// shape strategies are indexed by.
#[derive(Signature)]
#[signature(
    instructions = "Classify a research topic for retrieval planning. \
    category is a short lowercase label such as news, company, or general. \
    time_window is one of day, week, month. \
    depth is one of brief, deep, comprehensive, chosen by how much the topic \
    warrants: a narrow factual question is brief, an open-ended question is \
    comprehensive."
)]
struct CategorizeTopic {
    #[input(desc = "The raw research topic as given by the requester")]
    topic: String,

    #[output(desc = "Short lowercase category label, e.g. news, company, general")]
    category: String,
    #[output(desc = "day, week, or month")]
    #[field(enum_values = "day,week,month")]
    time_window: String,
    #[output(desc = "brief, deep, or comprehensive")]
    #[field(enum_values = "brief,deep,comprehensive")]
    depth: String,
}

/// Fill: resolve every strategy variable whose source is `llm_fill` in one
/// batched call, rather than one call per variable.
#[derive(Signature)]
#[signature(
    instructions = "For each variable below, given as 'name — description', \
    produce the single best value for researching the topic. Return one \
    entry per variable, in the same order, naming it back exactly."
)]
struct FillVariables {
    #[input(desc = "The research topic these variables support")]
    topic: String,
    #[input(desc = "Variables needing a value, each 'name — description'")]
    missing_variables: Vec<String>,

    #[output(desc = "Resolved name/value pairs, one per requested variable")]
    values: Vec<FilledVariable>,
}

/// One resolved variable from a `FillVariables` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilledVariable {
    pub name: String,
    pub value: String,
}

/// Cluster: group evidence summaries (indexed by their position in the
/// evidence list) into topical clusters for the finalize synthesizer.
#[derive(Signature)]
#[signature(
    instructions = "Group the numbered evidence summaries into topical \
    clusters. Every index must appear in exactly one cluster. Prefer fewer, \
    larger clusters over many small ones unless the evidence is genuinely \
    disjoint."
)]
struct ClusterEvidence {
    #[input(desc = "Evidence summaries as 'index: title — snippet'")]
    evidence_summaries: Vec<String>,

    #[output(desc = "Clusters covering every evidence index exactly once")]
    clusters: Vec<ClusterLabel>,
}

/// One cluster from a `ClusterEvidence` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterLabel {
    pub label: String,
    pub member_indices: Vec<usize>,
}

/// Analyze: extract key facts and a short analysis for one cluster's
/// evidence (or, for `brief` depth, one combined pseudo-cluster).
#[derive(Signature)]
#[signature(
    instructions = "Given one cluster's evidence summaries, extract the key \
    facts and write a short analysis grounded only in what the evidence \
    supports. Do not speculate beyond the given summaries."
)]
struct AnalyzeCluster {
    #[input(desc = "The cluster's label")]
    label: String,
    #[input(desc = "Evidence summaries belonging to this cluster")]
    evidence_summaries: Vec<String>,

    #[output(desc = "Short, evidence-grounded factual statements")]
    key_facts: Vec<String>,
    #[output(desc = "A short paragraph analyzing the cluster")]
    analysis: String,
}

/// Write: turn cluster analyses into the briefing's final sections, each
/// citing the evidence indices it draws on.
#[derive(Signature)]
#[signature(
    instructions = "Write the final briefing sections from the cluster \
    analyses below. Every section must cite the evidence indices (from the \
    numbered evidence summaries) that support it. Cover every required \
    section heading if any are given; otherwise choose headings that fit \
    the material."
)]
struct WriteSections {
    #[input(desc = "The research topic")]
    topic: String,
    #[input(desc = "brief, deep, or comprehensive")]
    depth: String,
    #[input(desc = "Section headings the briefing must cover, if any")]
    required_sections: Vec<String>,
    #[input(desc = "Per-cluster analyses feeding the write-up")]
    cluster_analyses: Vec<String>,
    #[input(desc = "Full evidence list as 'index: title — snippet', for citing")]
    evidence_summaries: Vec<String>,
    #[input(desc = "Set only on retry: what was deficient about the previous attempt")]
    deficiency_note: Option<String>,

    #[output(desc = "The finished sections")]
    sections: Vec<WrittenSection>,
}

/// One section from a `WriteSections` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrittenSection {
    pub heading: String,
    pub body: String,
    pub cited_indices: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::Signature;

    #[test]
    fn test_categorize_topic_schema() {
        let inputs = CategorizeTopicInputs { topic: "Rust 2.0 release".to_string() };
        let prompt = CategorizeTopic::to_prompt(&inputs);
        assert!(prompt.contains("Rust 2.0 release"));
        assert!(prompt.contains("category"));
        assert!(prompt.contains("time_window"));
    }

    #[test]
    fn test_categorize_topic_parses_response() {
        let response = r#"{"category": "news", "time_window": "day", "depth": "brief"}"#;
        let outputs = CategorizeTopic::from_response(response).unwrap();
        assert_eq!(outputs.category, "news");
        assert_eq!(outputs.time_window, "day");
        assert_eq!(outputs.depth, "brief");
    }

    #[test]
    fn test_categorize_topic_rejects_bad_enum() {
        let response = r#"{"category": "news", "time_window": "fortnight", "depth": "brief"}"#;
        assert!(CategorizeTopic::from_response(response).is_err());
    }

    #[test]
    fn test_fill_variables_round_trip() {
        let response = r#"{"values": [{"name": "symbol", "value": "ACME"}]}"#;
        let outputs = FillVariables::from_response(response).unwrap();
        assert_eq!(outputs.values.len(), 1);
        assert_eq!(outputs.values[0].name, "symbol");
    }

    #[test]
    fn test_cluster_evidence_parses_member_indices() {
        let response = r#"{"clusters": [{"label": "earnings", "member_indices": [0, 2]}]}"#;
        let outputs = ClusterEvidence::from_response(response).unwrap();
        assert_eq!(outputs.clusters.len(), 1);
        assert_eq!(outputs.clusters[0].member_indices, vec![0, 2]);
    }

    #[test]
    fn test_analyze_cluster_parses_facts_and_analysis() {
        let response = r#"{"key_facts": ["fact one"], "analysis": "a short take"}"#;
        let outputs = AnalyzeCluster::from_response(response).unwrap();
        assert_eq!(outputs.key_facts, vec!["fact one".to_string()]);
        assert_eq!(outputs.analysis, "a short take");
    }

    #[test]
    fn test_write_sections_parses_cited_indices() {
        let response = r#"{"sections": [{"heading": "Overview", "body": "...", "cited_indices": [0, 1]}]}"#;
        let outputs = WriteSections::from_response(response).unwrap();
        assert_eq!(outputs.sections.len(), 1);
        assert_eq!(outputs.sections[0].cited_indices, vec![0, 1]);
    }

    #[test]
    fn test_write_sections_deficiency_note_is_optional_input() {
        let fields = WriteSections::input_fields();
        let note_field = fields.iter().find(|f| f.name == "deficiency_note").unwrap();
        assert!(!note_field.required);
    }
}
