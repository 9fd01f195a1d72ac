//! External capability contracts and vector utilities.
//!
//! The workflow never lets a model choose what to do next. It owns a fixed
//! capability set and calls each one at the stage that needs it:
//!
//! | Stage | Capability | Method |
//! |-------|------------|--------|
//! | QueryProcessing | [`AnalysisModel`] | [`plan_fields`](AnalysisModel::plan_fields) |
//! | Retrieval | [`Embedder`] | [`embed`](Embedder::embed) |
//! | Extraction | [`AnalysisModel`] | [`extract_field`](AnalysisModel::extract_field) |
//!
//! The model only fills structured arguments and outputs. Concrete HTTP
//! providers live in the application crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CapabilityError;
use crate::models::{AnalysisType, FieldSpec, QueryPlan};

/// Produces embedding vectors for retrieval queries.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Vector dimensionality.
    fn dims(&self) -> usize;
    /// Embed one text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError>;
}

/// One passage handed to the extraction capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionPassage {
    pub chunk_id: String,
    pub text: String,
    #[serde(default)]
    pub page_numbers: Vec<u32>,
}

/// Arguments of a single extraction call, constrained to one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionCall {
    pub document_id: String,
    pub document_name: String,
    pub field: FieldSpec,
    /// The prompt that produced the field, for context.
    pub prompt: String,
    /// Only the candidate chunks of this document for this field.
    pub passages: Vec<ExtractionPassage>,
}

/// Structured output of the extraction capability, before verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionDraft {
    pub value: String,
    #[serde(default)]
    pub exact_quote: String,
    #[serde(default, deserialize_with = "crate::citation::lenient_page_numbers")]
    pub page_numbers: Vec<u32>,
    /// Model self-reported confidence. May be out of range; the extractor clamps it.
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub source: Option<String>,
}

/// Language-model capabilities used by the workflow.
#[async_trait]
pub trait AnalysisModel: Send + Sync {
    /// Derive intent, legal terms, and ordered fields from a prompt.
    async fn plan_fields(
        &self,
        prompt: &str,
        analysis_type: AnalysisType,
    ) -> Result<QueryPlan, CapabilityError>;

    /// Extract one field from one document's passages.
    async fn extract_field(&self, call: &ExtractionCall) -> Result<ExtractionDraft, CapabilityError>;
}

/// Encode a float vector as little-endian `f32` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode bytes written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, mismatched lengths, or zero norms.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_preserves_vector() {
        let v = vec![0.25f32, -1.5, 3.0];
        let blob = vec_to_blob(&v);
        assert_eq!(blob.len(), 12);
        assert_eq!(blob_to_vec(&blob), v);
    }

    #[test]
    fn cosine_edge_cases() {
        assert!((cosine_similarity(&[1.0, 2.0], &[1.0, 2.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn draft_defaults_missing_fields() {
        let draft: ExtractionDraft = serde_json::from_str(r#"{"value":"30 days"}"#).unwrap();
        assert_eq!(draft.value, "30 days");
        assert!(draft.exact_quote.is_empty());
        assert_eq!(draft.confidence, 0.0);
    }
}
