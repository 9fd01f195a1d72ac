//! Core data models that flow through the analysis workflow.
//!
//! A request is planned into [`FieldSpec`]s, each field is retrieved into
//! [`RetrievalCandidate`]s, every (document, field) pair is extracted into
//! an [`ExtractionRecord`], and the accepted pass is assembled into a
//! [`MatrixResult`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Cell value used when a field has no supporting evidence in a document.
pub const NOT_FOUND: &str = "Not found";

/// Cell value used when the extraction call itself failed.
pub const NOT_SPECIFIED: &str = "Not specified";

/// Flavour of analysis requested by the caller.
///
/// All types share one pipeline; non-general types only change how the
/// prompt is framed for planning and how the response is labelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisType {
    #[default]
    General,
    Risk,
    Compliance,
}

impl AnalysisType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisType::General => "general",
            AnalysisType::Risk => "risk",
            AnalysisType::Compliance => "compliance",
        }
    }

    /// Prompt prefix used for specialized analyses, e.g. `[RISK ANALYSIS]`.
    pub fn prompt_prefix(&self) -> Option<&'static str> {
        match self {
            AnalysisType::General => None,
            AnalysisType::Risk => Some("[RISK ANALYSIS]"),
            AnalysisType::Compliance => Some("[COMPLIANCE ANALYSIS]"),
        }
    }
}

impl fmt::Display for AnalysisType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnalysisType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "general" => Ok(AnalysisType::General),
            "risk" => Ok(AnalysisType::Risk),
            "compliance" => Ok(AnalysisType::Compliance),
            other => Err(format!(
                "unknown analysis type '{}'. Use general, risk, or compliance.",
                other
            )),
        }
    }
}

/// A single analysis request. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub prompt: String,
    #[serde(default)]
    pub analysis_type: AnalysisType,
    /// Verified caller identity supplied by the authentication layer.
    #[serde(default)]
    pub caller_id: Option<String>,
}

impl AnalysisRequest {
    pub fn new(prompt: impl Into<String>, analysis_type: AnalysisType, caller_id: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            analysis_type,
            caller_id: Some(caller_id.into()),
        }
    }
}

/// One column of the output matrix, derived from the prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    /// What to extract, paraphrased from the prompt.
    pub instruction: String,
    /// Domain keywords used to bias retrieval.
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Output of query processing: intent plus the ordered field list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub intent: String,
    #[serde(default)]
    pub legal_terms: Vec<String>,
    #[serde(default)]
    pub expanded_queries: Vec<String>,
    pub fields: Vec<FieldSpec>,
}

/// A previously ingested span of document text. Read-only to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub document_name: String,
    pub text: String,
    #[serde(default)]
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub page_numbers: Vec<u32>,
    #[serde(default)]
    pub location_markers: Vec<String>,
}

/// Candidate-generation strategy that produced a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    Semantic,
    Keyword,
    TermMatch,
}

impl RetrievalStrategy {
    pub const ALL: [RetrievalStrategy; 3] = [
        RetrievalStrategy::Semantic,
        RetrievalStrategy::Keyword,
        RetrievalStrategy::TermMatch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalStrategy::Semantic => "semantic",
            RetrievalStrategy::Keyword => "keyword",
            RetrievalStrategy::TermMatch => "term_match",
        }
    }
}

/// One literal keyword-search term and the synonyms that also count as a
/// hit for it. Coverage is measured over literal terms, so synonyms can
/// only raise a chunk's score.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordTerm {
    pub term: String,
    pub synonyms: Vec<String>,
}

impl KeywordTerm {
    pub fn literal(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            synonyms: Vec::new(),
        }
    }

    /// The term followed by its synonyms.
    pub fn alternatives(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.term.as_str()).chain(self.synonyms.iter().map(String::as_str))
    }
}

/// A raw hit returned by a Chunk Store search, score in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub score: f64,
}

/// A fused candidate for one field in one pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalCandidate {
    pub chunk_id: String,
    pub document_id: String,
    /// Fused score in `[0, 1]`.
    pub score: f64,
    /// Strategy with the largest weighted contribution.
    pub strategy: RetrievalStrategy,
}

/// Retrieval output for one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRetrieval {
    pub field_name: String,
    pub candidates: Vec<RetrievalCandidate>,
    /// Top-1 score, or the mean of the survivors when fewer than 3 survive.
    pub confidence: f64,
}

impl FieldRetrieval {
    /// Distinct document ids among the candidates, in first-seen order.
    pub fn document_ids(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for c in &self.candidates {
            if !seen.contains(&c.document_id.as_str()) {
                seen.push(c.document_id.as_str());
            }
        }
        seen
    }

    pub fn chunk_ids_for(&self, document_id: &str) -> Vec<&str> {
        self.candidates
            .iter()
            .filter(|c| c.document_id == document_id)
            .map(|c| c.chunk_id.as_str())
            .collect()
    }
}

/// One extracted cell with its citation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub document_id: String,
    pub document_name: String,
    pub field_name: String,
    pub value: String,
    pub exact_quote: String,
    pub page_numbers: Vec<u32>,
    pub document_url: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Whether the quote was found verbatim in the supplied chunk texts.
    pub verified: bool,
    /// The model's own quote when it could not be verified, kept for audit.
    /// Never used as a citation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_quote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub location_markers: Vec<String>,
}

impl ExtractionRecord {
    fn empty_cell(document_id: &str, document_name: &str, field_name: &str, value: &str) -> Self {
        Self {
            document_id: document_id.to_string(),
            document_name: document_name.to_string(),
            field_name: field_name.to_string(),
            value: value.to_string(),
            exact_quote: String::new(),
            page_numbers: Vec::new(),
            document_url: String::new(),
            confidence: 0.0,
            verified: false,
            reported_quote: None,
            source: None,
            location_markers: Vec::new(),
        }
    }

    /// Cell for a field with no evidence in this document.
    pub fn not_found(document_id: &str, document_name: &str, field_name: &str) -> Self {
        Self::empty_cell(document_id, document_name, field_name, NOT_FOUND)
    }

    /// Cell for a failed extraction call.
    pub fn not_specified(document_id: &str, document_name: &str, field_name: &str) -> Self {
        Self::empty_cell(document_id, document_name, field_name, NOT_SPECIFIED)
    }

    /// True when the value is one of the placeholder values.
    pub fn is_placeholder(&self) -> bool {
        is_placeholder_value(&self.value)
    }
}

/// Placeholder values that never count as a successful extraction.
pub fn is_placeholder_value(value: &str) -> bool {
    let v = value.trim();
    v.is_empty() || v.eq_ignore_ascii_case(NOT_FOUND) || v.eq_ignore_ascii_case(NOT_SPECIFIED)
}

/// Retrieval knobs that are relaxed between passes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrievalParams {
    pub score_threshold: f64,
    pub top_k: usize,
}

/// Outcome of validating one pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub success_rate: f64,
    pub mean_retrieval_confidence: f64,
    pub should_retry: bool,
    pub reason: String,
}

/// History entry for one executed pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassSummary {
    pub pass: u32,
    pub params: RetrievalParams,
    pub candidates: usize,
    pub success_rate: f64,
    pub mean_retrieval_confidence: f64,
    pub should_retry: bool,
    pub reason: String,
}

/// The document × field grid.
///
/// `rows` maps document name → field name → record. Row keys are unique;
/// two documents sharing a display name are disambiguated by id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatrixResult {
    pub columns: Vec<String>,
    pub rows: BTreeMap<String, BTreeMap<String, ExtractionRecord>>,
}

impl MatrixResult {
    pub fn cell(&self, document_name: &str, field_name: &str) -> Option<&ExtractionRecord> {
        self.rows.get(document_name).and_then(|r| r.get(field_name))
    }

    pub fn records(&self) -> impl Iterator<Item = &ExtractionRecord> {
        self.rows.values().flat_map(|r| r.values())
    }
}

/// Run metadata returned alongside the matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassMetadata {
    pub retry_count: u32,
    pub final_params: RetrievalParams,
    pub passes: Vec<PassSummary>,
    pub documents_analyzed: usize,
    /// The last pass still asked for a retry but the budget was spent.
    pub retry_budget_exhausted: bool,
}

/// Terminal artifact of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub request_id: String,
    pub analysis_type: AnalysisType,
    pub query_intent: String,
    pub matrix: MatrixResult,
    pub metadata: PassMetadata,
}
