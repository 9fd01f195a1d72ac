//! Field extraction over one pass's retrieval candidates.
//!
//! One extraction call runs per (field, document) pair that has at least
//! one candidate, under a bounded pool of `concurrency` in-flight calls.
//! Each call sees only that document's candidate chunks for that field.
//! Every result lands in its own pre-allocated slot, so the output order
//! is fixed (field order, then first-seen document order) regardless of
//! completion order.
//!
//! After a call returns the extractor checks the model's citation itself:
//!
//! - confidence outside `[0, 1]` is clamped and logged
//! - a quote that is not a normalized substring of the supplied passages
//!   halves the confidence and marks the record unverified; the model's
//!   quote moves to `reported_quote` for audit and the citation becomes a
//!   passage sentence containing every content word of the value
//! - with no such sentence the citation is empty and confidence drops to 0
//!
//! Verification ignores the truncation marker appended to cut passages.
//!
//! A failed or timed-out call becomes a "Not specified" cell with
//! confidence 0 and never aborts its siblings.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};

use clause_matrix_core::capability::{
    AnalysisModel, ExtractionCall, ExtractionDraft, ExtractionPassage,
};
use clause_matrix_core::citation;
use clause_matrix_core::error::{AnalysisError, CapabilityError};
use clause_matrix_core::models::{
    is_placeholder_value, DocumentChunk, ExtractionRecord, FieldRetrieval, FieldSpec,
};
use clause_matrix_core::store::ChunkStore;

/// Longest excerpt recovered from a passage when the model's quote fails.
const MAX_EXCERPT_CHARS: usize = 200;

/// Output of one extraction pass.
#[derive(Debug, Clone, Default)]
pub struct ExtractionPass {
    pub records: Vec<ExtractionRecord>,
    /// Document id → display name for every document with candidates.
    pub document_names: BTreeMap<String, String>,
}

pub struct Extractor {
    model: Arc<dyn AnalysisModel>,
    chunks: Arc<dyn ChunkStore>,
    concurrency: usize,
    call_timeout: Duration,
    max_context_chars: usize,
    document_url_base: String,
}

struct Job {
    slot: usize,
    call: ExtractionCall,
    chunks: Vec<DocumentChunk>,
}

impl Extractor {
    pub fn new(
        model: Arc<dyn AnalysisModel>,
        chunks: Arc<dyn ChunkStore>,
        concurrency: usize,
        call_timeout: Duration,
        max_context_chars: usize,
        document_url_base: String,
    ) -> Self {
        Self {
            model,
            chunks,
            concurrency: concurrency.max(1),
            call_timeout,
            max_context_chars,
            document_url_base,
        }
    }

    /// Run every extraction call of a pass and wait for all of them.
    ///
    /// Fails only when the chunk texts cannot be loaded.
    pub async fn extract(
        &self,
        caller_id: &str,
        prompt: &str,
        fields: &[FieldSpec],
        retrievals: &[FieldRetrieval],
    ) -> Result<ExtractionPass, AnalysisError> {
        let mut wanted: Vec<String> = retrievals
            .iter()
            .flat_map(|r| r.candidates.iter().map(|c| c.chunk_id.clone()))
            .collect();
        wanted.sort();
        wanted.dedup();

        let loaded = if wanted.is_empty() {
            Vec::new()
        } else {
            self.chunks
                .get_chunks(caller_id, &wanted)
                .await
                .map_err(AnalysisError::RetrievalFailure)?
        };
        let by_id: HashMap<&str, &DocumentChunk> =
            loaded.iter().map(|c| (c.chunk_id.as_str(), c)).collect();

        let mut document_names = BTreeMap::new();
        let mut jobs = Vec::new();
        for field in fields {
            let Some(retrieval) = retrievals.iter().find(|r| r.field_name == field.name) else {
                continue;
            };
            for document_id in retrieval.document_ids() {
                let doc_chunks: Vec<DocumentChunk> = retrieval
                    .chunk_ids_for(document_id)
                    .into_iter()
                    .filter_map(|id| by_id.get(id).map(|c| (*c).clone()))
                    .collect();
                let document_name = doc_chunks
                    .first()
                    .map(|c| c.document_name.clone())
                    .unwrap_or_else(|| document_id.to_string());
                document_names
                    .entry(document_id.to_string())
                    .or_insert_with(|| document_name.clone());

                let call = ExtractionCall {
                    document_id: document_id.to_string(),
                    document_name,
                    field: field.clone(),
                    prompt: prompt.to_string(),
                    passages: self.passages(&doc_chunks),
                };
                jobs.push(Job {
                    slot: jobs.len(),
                    call,
                    chunks: doc_chunks,
                });
            }
        }

        tracing::debug!(
            calls = jobs.len(),
            concurrency = self.concurrency,
            "dispatching extraction calls"
        );

        let mut slots: Vec<Option<ExtractionRecord>> = vec![None; jobs.len()];
        let finished: Vec<(usize, ExtractionRecord)> = stream::iter(jobs)
            .map(|job| self.run_job(job))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        for (slot, record) in finished {
            slots[slot] = Some(record);
        }

        Ok(ExtractionPass {
            records: slots.into_iter().flatten().collect(),
            document_names,
        })
    }

    /// Passages for one call, cut to the context budget.
    fn passages(&self, chunks: &[DocumentChunk]) -> Vec<ExtractionPassage> {
        let mut remaining = self.max_context_chars;
        let mut passages = Vec::new();
        for chunk in chunks {
            if remaining == 0 {
                break;
            }
            let len = chunk.text.chars().count();
            let text = if len > remaining {
                citation::truncate_context(&chunk.text, remaining)
            } else {
                chunk.text.clone()
            };
            remaining = remaining.saturating_sub(len);
            passages.push(ExtractionPassage {
                chunk_id: chunk.chunk_id.clone(),
                text,
                page_numbers: chunk.page_numbers.clone(),
            });
        }
        passages
    }

    async fn run_job(&self, job: Job) -> (usize, ExtractionRecord) {
        let Job { slot, call, chunks } = job;
        let outcome = match tokio::time::timeout(self.call_timeout, self.model.extract_field(&call)).await
        {
            Ok(result) => result,
            Err(_) => Err(CapabilityError::Timeout {
                secs: self.call_timeout.as_secs(),
            }),
        };

        let record = match outcome {
            Ok(draft) => self.finalize(&call, &chunks, draft),
            Err(e) => {
                tracing::warn!(
                    document_id = %call.document_id,
                    field = %call.field.name,
                    error = %e,
                    "extraction call failed; cell marked not specified"
                );
                ExtractionRecord::not_specified(&call.document_id, &call.document_name, &call.field.name)
            }
        };
        (slot, record)
    }

    /// Verify a draft against the passages it was produced from.
    pub(crate) fn finalize(
        &self,
        call: &ExtractionCall,
        chunks: &[DocumentChunk],
        draft: ExtractionDraft,
    ) -> ExtractionRecord {
        let value = draft.value.trim().to_string();
        if is_placeholder_value(&value) {
            return ExtractionRecord::not_found(&call.document_id, &call.document_name, &call.field.name);
        }

        let mut confidence = draft.confidence;
        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            tracing::warn!(
                document_id = %call.document_id,
                field = %call.field.name,
                reported = confidence,
                "model confidence out of range; clamped"
            );
            confidence = if confidence.is_finite() {
                confidence.clamp(0.0, 1.0)
            } else {
                0.0
            };
        }

        let texts = || call.passages.iter().map(|p| citation::strip_truncation(&p.text));
        let reported = draft.exact_quote.trim().to_string();
        let verified = citation::quote_is_grounded(&reported, texts());
        let (quote, reported_quote) = if verified {
            (reported, None)
        } else {
            confidence /= 2.0;
            let quote = match best_excerpt(&value, &reported, texts()) {
                Some(excerpt) => excerpt,
                None => {
                    confidence = 0.0;
                    String::new()
                }
            };
            tracing::warn!(
                document_id = %call.document_id,
                field = %call.field.name,
                confidence,
                "quote not found in passages; demoted"
            );
            (quote, Some(reported).filter(|q| !q.is_empty()))
        };

        let page_numbers = if draft.page_numbers.is_empty() {
            citation::fallback_page_numbers(
                &quote,
                chunks.iter().map(|c| (c.text.as_str(), c.page_numbers.as_slice())),
            )
        } else {
            draft.page_numbers
        };

        ExtractionRecord {
            document_id: call.document_id.clone(),
            document_name: call.document_name.clone(),
            field_name: call.field.name.clone(),
            value,
            document_url: citation::document_url(&self.document_url_base, &call.document_id, &quote),
            location_markers: markers_for(&quote, chunks),
            exact_quote: quote,
            page_numbers,
            confidence,
            verified,
            reported_quote,
            source: draft.source.filter(|s| !s.trim().is_empty()),
        }
    }
}

/// Location markers of the chunk that contains `quote`.
fn markers_for(quote: &str, chunks: &[DocumentChunk]) -> Vec<String> {
    let needle = citation::normalize(quote);
    if needle.is_empty() {
        return Vec::new();
    }
    chunks
        .iter()
        .find(|c| citation::normalize(&c.text).contains(&needle))
        .map(|c| {
            if c.location_markers.is_empty() {
                citation::location_markers(&c.text)
            } else {
                c.location_markers
                    .iter()
                    .take(citation::MAX_LOCATION_MARKERS)
                    .cloned()
                    .collect()
            }
        })
        .unwrap_or_default()
}

/// A passage sentence that supports `value`, preferring the one that
/// overlaps most with the model's reported quote.
///
/// Returns a verbatim slice of a passage, or `None` when no sentence longer
/// than 20 characters contains every content word of the value.
fn best_excerpt<'a>(
    value: &str,
    reported: &str,
    texts: impl Iterator<Item = &'a str>,
) -> Option<String> {
    let reported_tokens = citation::content_tokens(reported);
    let mut best: Option<(usize, &str)> = None;
    for text in texts {
        for sentence in text.split(|c| c == '.' || c == '\n') {
            let sentence = sentence.trim();
            if sentence.chars().count() <= 20 || !citation::supports_value(sentence, value) {
                continue;
            }
            let tokens = citation::content_tokens(sentence);
            let overlap = reported_tokens.iter().filter(|w| tokens.contains(w)).count();
            if best.map_or(true, |(o, _)| overlap > o) {
                best = Some((overlap, sentence));
            }
        }
    }
    best.map(|(_, s)| s.chars().take(MAX_EXCERPT_CHARS).collect())
}

impl ExtractionPass {
    /// Records with a real value, for logging.
    pub fn found(&self) -> usize {
        self.records.iter().filter(|r| !r.is_placeholder()).count()
    }
}
