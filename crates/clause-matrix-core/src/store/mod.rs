//! Storage contracts consumed by the workflow.
//!
//! The [`ChunkStore`] is a read-only view over previously ingested chunks,
//! always scoped to the caller's document set. The [`ResultStore`] receives
//! synthesized cells with upsert semantics keyed by
//! `(request_id, document_id, field_name)`.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::models::{AnalysisType, DocumentChunk, ExtractionRecord, KeywordTerm, ScoredChunk};

/// Read-only accessor over ingested document chunks.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`search_semantic`](ChunkStore::search_semantic) | Dense similarity over chunk embeddings |
/// | [`search_keyword`](ChunkStore::search_keyword) | Sparse term search over chunk text |
/// | [`get_chunks`](ChunkStore::get_chunks) | Fetch full chunk records by id |
///
/// Scores returned by both searches are in `[0, 1]`.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Top-`k` chunks by cosine similarity to `vector`.
    async fn search_semantic(
        &self,
        caller_id: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError>;

    /// Top-`k` chunks containing any alternative of any of `terms`, scored
    /// by [`term_coverage`].
    ///
    /// A term may be a multi-word phrase; it matches as a whole.
    async fn search_keyword(
        &self,
        caller_id: &str,
        terms: &[KeywordTerm],
        k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError>;

    /// Full chunk records for `chunk_ids`. Unknown ids are skipped.
    async fn get_chunks(
        &self,
        caller_id: &str,
        chunk_ids: &[String],
    ) -> Result<Vec<DocumentChunk>, StoreError>;
}

/// Lifecycle state of a stored analysis request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Running,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Running => "running",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RequestStatus::Running),
            "completed" => Some(RequestStatus::Completed),
            "failed" => Some(RequestStatus::Failed),
            _ => None,
        }
    }
}

/// Bookkeeping row for one analysis request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub caller_id: String,
    pub prompt: String,
    pub analysis_type: AnalysisType,
    pub status: RequestStatus,
    pub columns: Vec<String>,
    pub retry_count: u32,
}

/// Durable sink for synthesized matrices.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert or overwrite the cell at `(request_id, document_id, field_name)`.
    async fn upsert(
        &self,
        request_id: &str,
        document_id: &str,
        field_name: &str,
        record: &ExtractionRecord,
    ) -> Result<(), StoreError>;

    /// All cells stored for a request, ordered by document then field.
    async fn cells(&self, request_id: &str) -> Result<Vec<ExtractionRecord>, StoreError>;

    /// Record that a request has started.
    async fn begin_request(&self, record: &RequestRecord) -> Result<(), StoreError>;

    /// Mark a request finished with its final columns and retry count.
    async fn finish_request(
        &self,
        request_id: &str,
        status: RequestStatus,
        columns: &[String],
        retry_count: u32,
    ) -> Result<(), StoreError>;

    async fn get_request(&self, request_id: &str) -> Result<Option<RequestRecord>, StoreError>;
}

/// Fraction of `terms` with at least one alternative occurring in `text`,
/// case-insensitively.
///
/// Returns `0.0` when no term has a non-blank alternative.
pub fn term_coverage(text: &str, terms: &[KeywordTerm]) -> f64 {
    let haystack = text.to_lowercase();
    let mut total = 0usize;
    let mut hits = 0usize;
    for term in terms {
        let alternatives: Vec<String> = term
            .alternatives()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        if alternatives.is_empty() {
            continue;
        }
        total += 1;
        if alternatives.iter().any(|t| haystack.contains(t.as_str())) {
            hits += 1;
        }
    }
    if total == 0 {
        return 0.0;
    }
    hits as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn literals(terms: &[&str]) -> Vec<KeywordTerm> {
        terms.iter().map(|t| KeywordTerm::literal(*t)).collect()
    }

    #[test]
    fn coverage_counts_phrases_whole() {
        let text = "Either party may terminate upon thirty days' written notice.";
        let terms = literals(&["written notice", "change of control"]);
        assert!((term_coverage(text, &terms) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn coverage_ignores_blank_terms() {
        assert_eq!(term_coverage("anything", &[]), 0.0);
        assert_eq!(term_coverage("anything", &literals(&["  "])), 0.0);
        assert_eq!(term_coverage("ANYTHING", &literals(&["thing"])), 1.0);
    }

    #[test]
    fn synonyms_never_dilute_literal_coverage() {
        let text = "Termination notice period is thirty days.";
        let terms = vec![
            KeywordTerm {
                term: "termination".into(),
                synonyms: vec!["terminate".into(), "end".into(), "conclusion".into()],
            },
            KeywordTerm {
                term: "notice".into(),
                synonyms: vec!["notification".into(), "inform".into(), "advise".into()],
            },
            KeywordTerm::literal("period"),
        ];
        assert_eq!(term_coverage(text, &terms), 1.0);
    }

    #[test]
    fn a_synonym_hit_counts_for_its_term() {
        let text = "Either party may terminate on written notification.";
        let terms = vec![
            KeywordTerm {
                term: "termination".into(),
                synonyms: vec!["terminate".into()],
            },
            KeywordTerm {
                term: "notice".into(),
                synonyms: vec!["notification".into()],
            },
            KeywordTerm::literal("period"),
        ];
        assert!((term_coverage(text, &terms) - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [RequestStatus::Running, RequestStatus::Completed, RequestStatus::Failed] {
            assert_eq!(RequestStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(RequestStatus::parse("queued"), None);
    }
}
