//! Pass validation and the retry decision.
//!
//! A pass is accepted unless extraction quality or retrieval confidence is
//! below its floor and retry budget remains. Retries relax the retrieval
//! parameters monotonically so no two passes do identical work.

use serde::{Deserialize, Serialize};

use crate::models::{ExtractionRecord, FieldRetrieval, RetrievalParams, ValidationVerdict};

/// Thresholds governing the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidationPolicy {
    pub min_success_rate: f64,
    pub min_retrieval_confidence: f64,
    pub max_retries: u32,
    /// A cell only counts as a success above this confidence.
    pub min_field_confidence: f64,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self {
            min_success_rate: 0.30,
            min_retrieval_confidence: 0.40,
            max_retries: 3,
            min_field_confidence: 0.2,
        }
    }
}

impl ValidationPolicy {
    /// Fraction of records with a real value and confidence above the floor.
    pub fn success_rate(&self, records: &[ExtractionRecord]) -> f64 {
        if records.is_empty() {
            return 0.0;
        }
        let ok = records
            .iter()
            .filter(|r| !r.is_placeholder() && r.confidence > self.min_field_confidence)
            .count();
        ok as f64 / records.len() as f64
    }

    /// Judge one pass. `retry_count` is the number of retries already spent.
    pub fn evaluate(
        &self,
        records: &[ExtractionRecord],
        retrievals: &[FieldRetrieval],
        retry_count: u32,
    ) -> ValidationVerdict {
        let success_rate = self.success_rate(records);
        let mean_retrieval_confidence = mean_retrieval_confidence(retrievals);

        let low_success = success_rate < self.min_success_rate;
        let low_retrieval = mean_retrieval_confidence < self.min_retrieval_confidence;
        let budget_left = retry_count < self.max_retries;
        let should_retry = (low_success || low_retrieval) && budget_left;

        let reason = match (low_success, low_retrieval) {
            (false, false) => format!(
                "accepted: success rate {:.2} and retrieval confidence {:.2} meet thresholds",
                success_rate, mean_retrieval_confidence
            ),
            _ => {
                let mut problems = Vec::new();
                if low_success {
                    problems.push(format!(
                        "success rate {:.2} < {:.2}",
                        success_rate, self.min_success_rate
                    ));
                }
                if low_retrieval {
                    problems.push(format!(
                        "retrieval confidence {:.2} < {:.2}",
                        mean_retrieval_confidence, self.min_retrieval_confidence
                    ));
                }
                if budget_left {
                    format!("retry: {}", problems.join(", "))
                } else {
                    format!(
                        "retry budget of {} exhausted: {}",
                        self.max_retries,
                        problems.join(", ")
                    )
                }
            }
        };

        tracing::debug!(
            success_rate,
            mean_retrieval_confidence,
            retry_count,
            should_retry,
            "pass evaluated"
        );

        ValidationVerdict {
            success_rate,
            mean_retrieval_confidence,
            should_retry,
            reason,
        }
    }

    /// True when the verdict failed its thresholds but no retry is left.
    pub fn budget_exhausted(&self, verdict: &ValidationVerdict, retry_count: u32) -> bool {
        !verdict.should_retry
            && retry_count >= self.max_retries
            && (verdict.success_rate < self.min_success_rate
                || verdict.mean_retrieval_confidence < self.min_retrieval_confidence)
    }
}

/// Mean of per-field retrieval confidences; `0.0` with no fields.
pub fn mean_retrieval_confidence(retrievals: &[FieldRetrieval]) -> f64 {
    if retrievals.is_empty() {
        return 0.0;
    }
    retrievals.iter().map(|r| r.confidence).sum::<f64>() / retrievals.len() as f64
}

/// How retrieval parameters widen between passes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Relaxation {
    /// Multiplier applied to the score threshold, in `(0, 1)`.
    pub threshold_factor: f64,
    /// Added to `top_k`, at least 1.
    pub top_k_step: usize,
}

impl Default for Relaxation {
    fn default() -> Self {
        Self {
            threshold_factor: 0.5,
            top_k_step: 10,
        }
    }
}

impl Relaxation {
    /// Parameters for the next pass.
    ///
    /// The threshold never increases and `top_k` always grows, so the
    /// candidate pool of pass `n + 1` is a superset of pass `n`'s.
    pub fn apply(&self, params: RetrievalParams) -> RetrievalParams {
        let factor = if self.threshold_factor > 0.0 && self.threshold_factor < 1.0 {
            self.threshold_factor
        } else {
            0.5
        };
        RetrievalParams {
            score_threshold: (params.score_threshold * factor).max(0.0),
            top_k: params.top_k.saturating_add(self.top_k_step.max(1)),
        }
    }
}
