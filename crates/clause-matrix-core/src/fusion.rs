//! Rank fusion over the three candidate-generation strategies.
//!
//! # Fusion Algorithm
//!
//! 1. Within one strategy, a chunk returned more than once keeps its best score.
//! 2. Across strategies: `fused = min(1, Σ weight(s) × score(s))`, summed in
//!    the fixed order semantic, keyword, term-match.
//! 3. Drop candidates with `fused < score_threshold`.
//! 4. Sort by fused score (desc), then chunk id (asc).
//! 5. Truncate to `top_k`.
//!
//! Because per-strategy scores are collected into fixed slots before summing,
//! the result does not depend on the order in which strategy lists arrive.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{RetrievalCandidate, RetrievalParams, RetrievalStrategy, ScoredChunk};

/// Per-strategy weights. The default favours semantic similarity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub semantic: f64,
    pub keyword: f64,
    pub term: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            semantic: 1.0,
            keyword: 0.5,
            term: 0.5,
        }
    }
}

impl FusionWeights {
    pub fn weight(&self, strategy: RetrievalStrategy) -> f64 {
        match strategy {
            RetrievalStrategy::Semantic => self.semantic,
            RetrievalStrategy::Keyword => self.keyword,
            RetrievalStrategy::TermMatch => self.term,
        }
    }
}

fn slot(strategy: RetrievalStrategy) -> usize {
    match strategy {
        RetrievalStrategy::Semantic => 0,
        RetrievalStrategy::Keyword => 1,
        RetrievalStrategy::TermMatch => 2,
    }
}

struct Accum {
    document_id: String,
    best: [f64; 3],
}

/// Merge per-strategy hit lists into ranked candidates for one field.
pub fn fuse(
    strategy_hits: &[(RetrievalStrategy, Vec<ScoredChunk>)],
    weights: &FusionWeights,
    params: &RetrievalParams,
) -> Vec<RetrievalCandidate> {
    let mut by_chunk: BTreeMap<&str, Accum> = BTreeMap::new();

    for (strategy, hits) in strategy_hits {
        let i = slot(*strategy);
        for hit in hits {
            let score = if hit.score.is_finite() {
                hit.score.clamp(0.0, 1.0)
            } else {
                0.0
            };
            let entry = by_chunk.entry(hit.chunk_id.as_str()).or_insert_with(|| Accum {
                document_id: hit.document_id.clone(),
                best: [0.0; 3],
            });
            if score > entry.best[i] {
                entry.best[i] = score;
            }
        }
    }

    let mut candidates: Vec<RetrievalCandidate> = by_chunk
        .into_iter()
        .map(|(chunk_id, acc)| {
            let mut fused = 0.0;
            let mut lead = RetrievalStrategy::Semantic;
            let mut lead_contribution = f64::NEG_INFINITY;
            for strategy in RetrievalStrategy::ALL {
                let contribution = weights.weight(strategy) * acc.best[slot(strategy)];
                fused += contribution;
                if contribution > lead_contribution {
                    lead_contribution = contribution;
                    lead = strategy;
                }
            }
            RetrievalCandidate {
                chunk_id: chunk_id.to_string(),
                document_id: acc.document_id,
                score: fused.clamp(0.0, 1.0),
                strategy: lead,
            }
        })
        .filter(|c| c.score >= params.score_threshold)
        .collect();

    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    candidates.truncate(params.top_k);
    candidates
}

/// Per-field confidence summary over ranked candidates.
///
/// The top-1 score when at least three candidates survive, otherwise the
/// mean of the survivors; `0.0` when none survive.
pub fn retrieval_confidence(candidates: &[RetrievalCandidate]) -> f64 {
    match candidates.len() {
        0 => 0.0,
        n if n < 3 => candidates.iter().map(|c| c.score).sum::<f64>() / n as f64,
        _ => candidates[0].score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(chunk: &str, doc: &str, score: f64) -> ScoredChunk {
        ScoredChunk {
            chunk_id: chunk.to_string(),
            document_id: doc.to_string(),
            score,
        }
    }

    fn params(threshold: f64, k: usize) -> RetrievalParams {
        RetrievalParams {
            score_threshold: threshold,
            top_k: k,
        }
    }

    fn ids(c: &[RetrievalCandidate]) -> Vec<&str> {
        c.iter().map(|c| c.chunk_id.as_str()).collect()
    }

    #[test]
    fn test_weighted_sum_and_clamp() {
        let hits = vec![
            (RetrievalStrategy::Semantic, vec![hit("c1", "A", 0.8)]),
            (RetrievalStrategy::Keyword, vec![hit("c1", "A", 0.6)]),
            (RetrievalStrategy::TermMatch, vec![hit("c2", "A", 0.4)]),
        ];
        let out = fuse(&hits, &FusionWeights::default(), &params(0.0, 10));
        assert_eq!(ids(&out), vec!["c1", "c2"]);
        // 0.8 + 0.5 * 0.6 = 1.1, clamped
        assert_eq!(out[0].score, 1.0);
        assert_eq!(out[0].strategy, RetrievalStrategy::Semantic);
        assert!((out[1].score - 0.2).abs() < 1e-9);
        assert_eq!(out[1].strategy, RetrievalStrategy::TermMatch);
    }

    #[test]
    fn test_duplicate_hits_within_strategy_keep_max() {
        let hits = vec![(
            RetrievalStrategy::Semantic,
            vec![hit("c1", "A", 0.4), hit("c1", "A", 0.7)],
        )];
        let out = fuse(&hits, &FusionWeights::default(), &params(0.0, 10));
        assert_eq!(out.len(), 1);
        assert!((out[0].score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_threshold_and_top_k() {
        let hits = vec![(
            RetrievalStrategy::Semantic,
            vec![
                hit("c1", "A", 0.9),
                hit("c2", "A", 0.5),
                hit("c3", "B", 0.31),
                hit("c4", "C", 0.29),
            ],
        )];
        let out = fuse(&hits, &FusionWeights::default(), &params(0.3, 10));
        assert_eq!(ids(&out), vec!["c1", "c2", "c3"]);
        let out = fuse(&hits, &FusionWeights::default(), &params(0.3, 2));
        assert_eq!(ids(&out), vec!["c1", "c2"]);
    }

    #[test]
    fn test_ties_break_by_chunk_id() {
        let hits = vec![(
            RetrievalStrategy::Semantic,
            vec![hit("c9", "A", 0.5), hit("c1", "B", 0.5), hit("c5", "C", 0.5)],
        )];
        let out = fuse(&hits, &FusionWeights::default(), &params(0.0, 2));
        assert_eq!(ids(&out), vec!["c1", "c5"]);
    }

    #[test]
    fn test_order_independent() {
        let sem = (
            RetrievalStrategy::Semantic,
            vec![hit("c1", "A", 0.35), hit("c2", "A", 0.3), hit("c3", "B", 0.1)],
        );
        let kw = (
            RetrievalStrategy::Keyword,
            vec![hit("c3", "B", 0.7), hit("c2", "A", 0.1)],
        );
        let term = (
            RetrievalStrategy::TermMatch,
            vec![hit("c4", "C", 0.9), hit("c1", "A", 0.2)],
        );
        let w = FusionWeights::default();
        let p = params(0.3, 3);
        let forward = fuse(&[sem.clone(), kw.clone(), term.clone()], &w, &p);
        let reversed = fuse(&[term.clone(), kw.clone(), sem.clone()], &w, &p);
        let shuffled = fuse(&[kw, sem, term], &w, &p);
        assert_eq!(forward, reversed);
        assert_eq!(forward, shuffled);
    }

    #[test]
    fn test_out_of_range_scores_are_bounded() {
        let hits = vec![(
            RetrievalStrategy::Keyword,
            vec![hit("c1", "A", f64::NAN), hit("c2", "A", -3.0), hit("c3", "A", 7.0)],
        )];
        let out = fuse(&hits, &FusionWeights::default(), &params(0.0, 10));
        for c in &out {
            assert!((0.0..=1.0).contains(&c.score));
        }
        assert_eq!(out[0].chunk_id, "c3");
        assert!((out[0].score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_retrieval_confidence() {
        let cand = |s: f64| RetrievalCandidate {
            chunk_id: format!("c{}", s),
            document_id: "A".into(),
            score: s,
            strategy: RetrievalStrategy::Semantic,
        };
        assert_eq!(retrieval_confidence(&[]), 0.0);
        assert!((retrieval_confidence(&[cand(0.8), cand(0.4)]) - 0.6).abs() < 1e-9);
        assert_eq!(retrieval_confidence(&[cand(0.9), cand(0.5), cand(0.4)]), 0.9);
    }
}
