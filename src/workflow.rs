//! The analysis state machine.
//!
//! ```text
//! Processing → Retrieving → Extracting → Validating ─┬→ Synthesizing → Done
//!                  ↑                                  │
//!                  └──────────── retry ───────────────┘
//! ```
//!
//! The retry edge is the only back-edge. Every retry relaxes the retrieval
//! parameters (threshold down, `top_k` up) and spends one unit of the retry
//! budget, so a request runs at most `max_retries + 1` passes.
//!
//! Each request owns its [`WorkflowState`]. The orchestrator itself holds
//! only immutable configuration and shared store handles, so one
//! [`Orchestrator`] serves any number of concurrent requests.
//!
//! A request ends early when its [`CancellationToken`] fires or the overall
//! time budget elapses. The in-flight pass is dropped at that point, which
//! aborts its outstanding extraction calls, and nothing is persisted.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use clause_matrix_core::capability::{AnalysisModel, Embedder};
use clause_matrix_core::error::{AnalysisError, StoreError};
use clause_matrix_core::matrix;
use clause_matrix_core::models::{
    AnalysisOutcome, AnalysisRequest, AnalysisType, ExtractionRecord, FieldRetrieval, FieldSpec,
    MatrixResult, PassMetadata, PassSummary, RetrievalParams, ValidationVerdict,
};
use clause_matrix_core::query::{framed_prompt, normalize_plan, validate_prompt};
use clause_matrix_core::store::{ChunkStore, RequestRecord, RequestStatus, ResultStore};

use crate::config::{Config, WorkflowConfig};
use crate::embedding::create_embedder;
use crate::extractor::Extractor;
use crate::llm::create_model;
use crate::retriever::Retriever;
use crate::sqlite_store::{SqliteChunkStore, SqliteResultStore};
use crate::synthesizer::Synthesizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Processing,
    Retrieving,
    Extracting,
    Validating,
    Synthesizing,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Processing => "processing",
            Stage::Retrieving => "retrieving",
            Stage::Extracting => "extracting",
            Stage::Validating => "validating",
            Stage::Synthesizing => "synthesizing",
            Stage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Per-request data threaded through the stages.
#[derive(Debug)]
pub struct WorkflowState {
    pub request_id: String,
    pub caller_id: String,
    pub prompt: String,
    pub analysis_type: AnalysisType,
    pub query_intent: String,
    pub fields: Vec<FieldSpec>,
    /// Alternative phrasings from the planner, searched semantically.
    pub expanded_queries: Vec<String>,
    pub retrievals: Vec<FieldRetrieval>,
    pub records: Vec<ExtractionRecord>,
    pub document_names: BTreeMap<String, String>,
    pub verdict: Option<ValidationVerdict>,
    pub retry_count: u32,
    pub params: RetrievalParams,
    pub history: Vec<PassSummary>,
    pub matrix: MatrixResult,
    pub stage: Stage,
}

impl WorkflowState {
    fn new(
        request_id: String,
        caller_id: String,
        prompt: String,
        analysis_type: AnalysisType,
        params: RetrievalParams,
    ) -> Self {
        Self {
            request_id,
            caller_id,
            prompt,
            analysis_type,
            query_intent: String::new(),
            fields: Vec::new(),
            expanded_queries: Vec::new(),
            retrievals: Vec::new(),
            records: Vec::new(),
            document_names: BTreeMap::new(),
            verdict: None,
            retry_count: 0,
            params,
            history: Vec::new(),
            matrix: MatrixResult::default(),
            stage: Stage::Processing,
        }
    }

    /// 1-based number of the pass currently running.
    pub fn pass(&self) -> u32 {
        self.retry_count + 1
    }
}

pub struct Orchestrator {
    config: WorkflowConfig,
    model: Arc<dyn AnalysisModel>,
    retriever: Retriever,
    extractor: Extractor,
    synthesizer: Synthesizer,
    results: Arc<dyn ResultStore>,
}

impl Orchestrator {
    pub fn new(
        config: WorkflowConfig,
        model: Arc<dyn AnalysisModel>,
        embedder: Arc<dyn Embedder>,
        chunks: Arc<dyn ChunkStore>,
        results: Arc<dyn ResultStore>,
    ) -> Self {
        let retriever = Retriever::new(
            chunks.clone(),
            embedder,
            config.weights,
            config.candidate_k,
        );
        let extractor = Extractor::new(
            model.clone(),
            chunks,
            config.concurrency,
            config.call_timeout,
            config.max_context_chars,
            config.document_url_base.clone(),
        );
        Self {
            synthesizer: Synthesizer::new(results.clone()),
            config,
            model,
            retriever,
            extractor,
            results,
        }
    }

    /// Wire an orchestrator to the configured database and providers.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let pool = crate::db::connect(config).await?;
        Ok(Self::new(
            config.workflow(),
            create_model(&config.model)?,
            create_embedder(&config.embedding)?,
            Arc::new(SqliteChunkStore::new(pool.clone())),
            Arc::new(SqliteResultStore::new(pool)),
        ))
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Run one analysis request to completion.
    ///
    /// `cancel` aborts the request from outside, e.g. on client disconnect.
    /// Cancellation and the overall timeout cover every stage up to the
    /// accepted pass. Synthesis then runs to completion, so a matrix is
    /// either fully written or not written at all.
    pub async fn run_analysis(
        &self,
        request: AnalysisRequest,
        cancel: CancellationToken,
    ) -> Result<AnalysisOutcome, AnalysisError> {
        let caller_id = request
            .caller_id
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(AnalysisError::Unauthenticated)?
            .to_string();
        let prompt = validate_prompt(&request.prompt, self.config.max_prompt_chars)?.to_string();
        let request_id = uuid::Uuid::new_v4().to_string();

        tracing::info!(
            request_id = %request_id,
            analysis_type = %request.analysis_type,
            "analysis started"
        );

        let bookkeeping = RequestRecord {
            request_id: request_id.clone(),
            caller_id: caller_id.clone(),
            prompt: prompt.clone(),
            analysis_type: request.analysis_type,
            status: RequestStatus::Running,
            columns: Vec::new(),
            retry_count: 0,
        };
        if let Err(e) = self.results.begin_request(&bookkeeping).await {
            tracing::warn!(request_id = %request_id, error = %e, "could not record request start");
        }

        let state = WorkflowState::new(
            request_id.clone(),
            caller_id,
            prompt,
            request.analysis_type,
            self.config.initial_params,
        );

        let accepted = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AnalysisError::Cancelled),
            finished = tokio::time::timeout(self.config.timeout, self.drive(state)) => match finished {
                Ok(result) => result,
                Err(_) => Err(AnalysisError::Timeout {
                    secs: self.config.timeout.as_secs(),
                }),
            },
        };
        let result = match accepted {
            Ok(mut state) => self.synthesize(&mut state).await,
            Err(e) => Err(e),
        };

        self.finish(&request_id, &result).await;
        result
    }

    async fn finish(&self, request_id: &str, result: &Result<AnalysisOutcome, AnalysisError>) {
        let (status, outcome) = match result {
            Ok(outcome) => (RequestStatus::Completed, Some(outcome)),
            Err(e) => {
                tracing::warn!(request_id, code = e.code(), error = %e, "analysis failed");
                (RequestStatus::Failed, e.partial_outcome())
            }
        };
        let (columns, retry_count) = outcome
            .map(|o| (o.matrix.columns.clone(), o.metadata.retry_count))
            .unwrap_or_default();
        if let Err(e) = self
            .results
            .finish_request(request_id, status, &columns, retry_count)
            .await
        {
            tracing::warn!(request_id, error = %e, "could not record request status");
        }
    }

    /// Step through the stages until a pass is accepted for synthesis.
    async fn drive(&self, mut state: WorkflowState) -> Result<WorkflowState, AnalysisError> {
        loop {
            tracing::debug!(
                request_id = %state.request_id,
                stage = %state.stage,
                pass = state.pass(),
                "entering stage"
            );
            state.stage = match state.stage {
                Stage::Processing => self.process(&mut state).await?,
                Stage::Retrieving => self.retrieve(&mut state).await?,
                Stage::Extracting => self.extract(&mut state).await?,
                Stage::Validating => self.validate(&mut state),
                Stage::Synthesizing | Stage::Done => return Ok(state),
            };
        }
    }

    async fn process(&self, state: &mut WorkflowState) -> Result<Stage, AnalysisError> {
        let framed = framed_prompt(&state.prompt, state.analysis_type);
        let planned = tokio::time::timeout(
            self.config.call_timeout,
            self.model.plan_fields(&framed, state.analysis_type),
        )
        .await;
        let plan = match planned {
            Ok(Ok(plan)) => plan,
            Ok(Err(e)) => {
                return Err(AnalysisError::NoFieldsDerived {
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(AnalysisError::NoFieldsDerived {
                    reason: format!(
                        "query planning timed out after {}s",
                        self.config.call_timeout.as_secs()
                    ),
                })
            }
        };
        let plan = normalize_plan(plan, &state.prompt, self.config.max_fields)?;

        state.query_intent = plan.intent;
        state.fields = plan.fields;
        state.expanded_queries = plan.expanded_queries;
        tracing::info!(
            request_id = %state.request_id,
            intent = %state.query_intent,
            fields = state.fields.len(),
            "query planned"
        );
        Ok(Stage::Retrieving)
    }

    async fn retrieve(&self, state: &mut WorkflowState) -> Result<Stage, AnalysisError> {
        state.retrievals = self
            .retriever
            .retrieve(
                &state.caller_id,
                &state.fields,
                &state.expanded_queries,
                state.params,
            )
            .await?;
        tracing::info!(
            request_id = %state.request_id,
            pass = state.pass(),
            score_threshold = state.params.score_threshold,
            top_k = state.params.top_k,
            candidates = candidate_total(&state.retrievals),
            "retrieval complete"
        );
        Ok(Stage::Extracting)
    }

    async fn extract(&self, state: &mut WorkflowState) -> Result<Stage, AnalysisError> {
        let pass = self
            .extractor
            .extract(&state.caller_id, &state.prompt, &state.fields, &state.retrievals)
            .await?;
        tracing::info!(
            request_id = %state.request_id,
            pass = state.pass(),
            records = pass.records.len(),
            found = pass.found(),
            "extraction complete"
        );
        state.records = pass.records;
        state.document_names = pass.document_names;
        Ok(Stage::Validating)
    }

    fn validate(&self, state: &mut WorkflowState) -> Stage {
        let verdict = self
            .config
            .policy
            .evaluate(&state.records, &state.retrievals, state.retry_count);

        state.history.push(PassSummary {
            pass: state.pass(),
            params: state.params,
            candidates: candidate_total(&state.retrievals),
            success_rate: verdict.success_rate,
            mean_retrieval_confidence: verdict.mean_retrieval_confidence,
            should_retry: verdict.should_retry,
            reason: verdict.reason.clone(),
        });
        tracing::info!(
            request_id = %state.request_id,
            pass = state.pass(),
            reason = %verdict.reason,
            "pass validated"
        );

        let next = if verdict.should_retry {
            state.retry_count += 1;
            state.params = self.config.relaxation.apply(state.params);
            Stage::Retrieving
        } else {
            Stage::Synthesizing
        };
        state.verdict = Some(verdict);
        next
    }

    async fn synthesize(&self, state: &mut WorkflowState) -> Result<AnalysisOutcome, AnalysisError> {
        state.matrix = matrix::assemble(
            &state.fields,
            &state.retrievals,
            &state.records,
            &state.document_names,
        );

        match self.synthesizer.persist(&state.request_id, &state.matrix).await {
            Ok(cells) => {
                tracing::info!(
                    request_id = %state.request_id,
                    rows = state.matrix.rows.len(),
                    cells,
                    retry_count = state.retry_count,
                    "matrix synthesized"
                );
                state.stage = Stage::Done;
                Ok(outcome_of(state, &self.config))
            }
            Err(source) => {
                tracing::error!(request_id = %state.request_id, error = %source, "persisting matrix failed");
                Err(AnalysisError::PersistenceFailure {
                    source,
                    outcome: Box::new(outcome_of(state, &self.config)),
                })
            }
        }
    }

    /// Read a stored matrix back for its owner.
    ///
    /// Returns `None` when the request is unknown or belongs to another caller.
    pub async fn load_matrix(
        &self,
        request_id: &str,
        caller_id: &str,
    ) -> Result<Option<(RequestRecord, MatrixResult)>, StoreError> {
        let Some(record) = self.results.get_request(request_id).await? else {
            return Ok(None);
        };
        if record.caller_id != caller_id {
            return Ok(None);
        }
        let cells = self.results.cells(request_id).await?;
        let matrix = matrix::from_records(&record.columns, &cells);
        Ok(Some((record, matrix)))
    }
}

fn candidate_total(retrievals: &[FieldRetrieval]) -> usize {
    retrievals.iter().map(|r| r.candidates.len()).sum()
}

fn outcome_of(state: &WorkflowState, config: &WorkflowConfig) -> AnalysisOutcome {
    let retry_budget_exhausted = state
        .verdict
        .as_ref()
        .map(|v| config.policy.budget_exhausted(v, state.retry_count))
        .unwrap_or(false);

    AnalysisOutcome {
        request_id: state.request_id.clone(),
        analysis_type: state.analysis_type,
        query_intent: state.query_intent.clone(),
        matrix: state.matrix.clone(),
        metadata: PassMetadata {
            retry_count: state.retry_count,
            final_params: state.params,
            passes: state.history.clone(),
            documents_analyzed: state.matrix.rows.len(),
            retry_budget_exhausted,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use clause_matrix_core::capability::{ExtractionCall, ExtractionDraft};
    use clause_matrix_core::error::CapabilityError;
    use clause_matrix_core::models::{DocumentChunk, QueryPlan};
    use clause_matrix_core::store::memory::{InMemoryChunkStore, InMemoryResultStore};

    use crate::embedding::DisabledEmbedder;

    struct NoticeModel;

    #[async_trait]
    impl AnalysisModel for NoticeModel {
        async fn plan_fields(&self, _: &str, _: AnalysisType) -> Result<QueryPlan, CapabilityError> {
            Ok(QueryPlan {
                intent: "clause_extraction".into(),
                legal_terms: vec![],
                expanded_queries: vec![],
                fields: vec![FieldSpec {
                    name: "Notice".into(),
                    instruction: "notice period".into(),
                    keywords: vec!["notice".into()],
                }],
            })
        }

        async fn extract_field(&self, call: &ExtractionCall) -> Result<ExtractionDraft, CapabilityError> {
            Ok(ExtractionDraft {
                value: "30 days".into(),
                exact_quote: call.passages[0].text.clone(),
                page_numbers: vec![],
                confidence: 0.9,
                source: None,
            })
        }
    }

    fn orchestrator(results: Arc<InMemoryResultStore>) -> Orchestrator {
        let chunks = Arc::new(InMemoryChunkStore::new());
        chunks
            .insert(
                "alice",
                DocumentChunk {
                    chunk_id: "c1".into(),
                    document_id: "A".into(),
                    document_name: "A.pdf".into(),
                    text: "Either party may give notice of thirty days.".into(),
                    embedding: vec![],
                    page_numbers: vec![2],
                    location_markers: vec![],
                },
            )
            .unwrap();
        Orchestrator::new(
            WorkflowConfig::default(),
            Arc::new(NoticeModel),
            Arc::new(DisabledEmbedder),
            chunks,
            results,
        )
    }

    #[tokio::test]
    async fn request_runs_to_done_and_is_recorded() {
        let results = Arc::new(InMemoryResultStore::new());
        let orch = orchestrator(results.clone());
        let outcome = orch
            .run_analysis(
                AnalysisRequest::new("What is the notice period?", AnalysisType::General, "alice"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.query_intent, "clause_extraction");
        assert_eq!(outcome.matrix.columns, vec!["Notice"]);
        assert_eq!(outcome.matrix.cell("A.pdf", "Notice").unwrap().value, "30 days");
        assert_eq!(outcome.metadata.passes.len() as u32, outcome.metadata.retry_count + 1);

        let record = results.get_request(&outcome.request_id).await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Completed);

        let (_, stored) = orch.load_matrix(&outcome.request_id, "alice").await.unwrap().unwrap();
        assert_eq!(stored, outcome.matrix);
        assert!(orch.load_matrix(&outcome.request_id, "mallory").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_caller_fails_closed() {
        let orch = orchestrator(Arc::new(InMemoryResultStore::new()));
        let mut request = AnalysisRequest::new("notice", AnalysisType::General, "x");
        request.caller_id = None;
        let err = orch.run_analysis(request, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::Unauthenticated));
    }

    #[tokio::test]
    async fn pre_cancelled_request_returns_cancelled() {
        let results = Arc::new(InMemoryResultStore::new());
        let orch = orchestrator(results.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = orch
            .run_analysis(AnalysisRequest::new("notice", AnalysisType::General, "alice"), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Cancelled));
        assert_eq!(results.cell_count(), 0);
    }

    #[test]
    fn stage_names_are_lowercase() {
        assert_eq!(Stage::Synthesizing.to_string(), "synthesizing");
        assert_eq!(Stage::Done.to_string(), "done");
    }
}
