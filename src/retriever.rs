//! Hybrid retrieval: three strategies per field, fused by chunk identity.
//!
//! | Strategy | Query | Store call |
//! |----------|-------|------------|
//! | semantic | embedding of the field instruction, plus the plan's expanded queries | `search_semantic` |
//! | keyword | literal instruction terms, each with its legal synonyms | `search_keyword` |
//! | term match | the field's domain keywords | `search_keyword` |
//!
//! Expanded queries are searched once per pass and their hits join every
//! field's semantic list, where fusion keeps each chunk's best score. The
//! strategies for one field run concurrently, as do the fields of one pass. A store error aborts the request as a retrieval failure. An
//! embedding failure only removes the semantic strategy from the pass.

use std::sync::Arc;

use futures::future::try_join_all;

use clause_matrix_core::capability::Embedder;
use clause_matrix_core::error::{AnalysisError, StoreError};
use clause_matrix_core::fusion::{fuse, retrieval_confidence, FusionWeights};
use clause_matrix_core::models::{
    FieldRetrieval, FieldSpec, KeywordTerm, RetrievalParams, RetrievalStrategy, ScoredChunk,
};
use clause_matrix_core::query::{expand_terms, instruction_terms};
use clause_matrix_core::store::ChunkStore;

pub struct Retriever {
    chunks: Arc<dyn ChunkStore>,
    embedder: Arc<dyn Embedder>,
    weights: FusionWeights,
    /// Hits requested from each strategy before fusion.
    candidate_k: usize,
}

impl Retriever {
    pub fn new(
        chunks: Arc<dyn ChunkStore>,
        embedder: Arc<dyn Embedder>,
        weights: FusionWeights,
        candidate_k: usize,
    ) -> Self {
        Self {
            chunks,
            embedder,
            weights,
            candidate_k,
        }
    }

    /// Retrieve candidates for every field, in field order.
    pub async fn retrieve(
        &self,
        caller_id: &str,
        fields: &[FieldSpec],
        expanded_queries: &[String],
        params: RetrievalParams,
    ) -> Result<Vec<FieldRetrieval>, AnalysisError> {
        let k = self.candidate_k.max(params.top_k);
        let expanded: Vec<ScoredChunk> = try_join_all(
            expanded_queries
                .iter()
                .map(|query| self.semantic_hits(caller_id, query, k)),
        )
        .await
        .map_err(AnalysisError::RetrievalFailure)?
        .into_iter()
        .flatten()
        .collect();

        try_join_all(
            fields
                .iter()
                .map(|field| self.retrieve_field(caller_id, field, &expanded, params)),
        )
        .await
    }

    /// Candidates for one field. `shared_semantic` holds hits found for the
    /// whole request that count toward every field's semantic strategy.
    pub async fn retrieve_field(
        &self,
        caller_id: &str,
        field: &FieldSpec,
        shared_semantic: &[ScoredChunk],
        params: RetrievalParams,
    ) -> Result<FieldRetrieval, AnalysisError> {
        // Ask each strategy for at least as many hits as the pass keeps.
        let k = self.candidate_k.max(params.top_k);
        let keyword_terms = expand_terms(&instruction_terms(&field.instruction));
        let domain_terms: Vec<KeywordTerm> =
            field.keywords.iter().map(|k| KeywordTerm::literal(k.as_str())).collect();

        let (mut semantic, keyword, term) = tokio::try_join!(
            self.semantic_hits(caller_id, &field.instruction, k),
            self.keyword_hits(caller_id, &keyword_terms, k),
            self.keyword_hits(caller_id, &domain_terms, k),
        )
        .map_err(AnalysisError::RetrievalFailure)?;
        semantic.extend_from_slice(shared_semantic);

        let strategy_hits = [
            (RetrievalStrategy::Semantic, semantic),
            (RetrievalStrategy::Keyword, keyword),
            (RetrievalStrategy::TermMatch, term),
        ];
        let candidates = fuse(&strategy_hits, &self.weights, &params);
        let confidence = retrieval_confidence(&candidates);

        tracing::debug!(
            field = %field.name,
            candidates = candidates.len(),
            confidence,
            score_threshold = params.score_threshold,
            top_k = params.top_k,
            "field retrieved"
        );

        Ok(FieldRetrieval {
            field_name: field.name.clone(),
            candidates,
            confidence,
        })
    }

    async fn semantic_hits(
        &self,
        caller_id: &str,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        let vector = match self.embedder.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(query, error = %e, "semantic search skipped");
                return Ok(Vec::new());
            }
        };
        self.chunks.search_semantic(caller_id, &vector, k).await
    }

    async fn keyword_hits(
        &self,
        caller_id: &str,
        terms: &[KeywordTerm],
        k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        if terms.iter().all(|t| t.alternatives().all(|a| a.trim().is_empty())) {
            return Ok(Vec::new());
        }
        self.chunks.search_keyword(caller_id, terms, k).await
    }
}
