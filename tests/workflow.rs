//! End-to-end tests of the analysis state machine.
//!
//! The model and embedder are scripted so every retrieval score and every
//! extraction answer is known in advance. The embedder always returns the
//! unit x-axis, and each chunk's embedding is placed at the angle whose
//! cosine is the semantic score the test wants. Field instructions use a
//! token that appears in no chunk, so the keyword strategies contribute
//! nothing and fused scores equal the semantic scores.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use clause_matrix::config::WorkflowConfig;
use clause_matrix::synthesizer::Synthesizer;
use clause_matrix::workflow::Orchestrator;
use clause_matrix_core::capability::{
    AnalysisModel, Embedder, ExtractionCall, ExtractionDraft,
};
use clause_matrix_core::citation;
use clause_matrix_core::error::{AnalysisError, CapabilityError, StoreError};
use clause_matrix_core::models::{
    AnalysisOutcome, AnalysisRequest, AnalysisType, DocumentChunk, ExtractionRecord, FieldSpec,
    QueryPlan,
    NOT_FOUND, NOT_SPECIFIED,
};
use clause_matrix_core::store::memory::{InMemoryChunkStore, InMemoryResultStore};
use clause_matrix_core::store::{RequestRecord, RequestStatus, ResultStore};

const CALLER: &str = "alice";
const FIELD: &str = "termination_notice_period";

// ─── Scripted capabilities ──────────────────────────────────────────

struct AxisEmbedder;

#[async_trait]
impl Embedder for AxisEmbedder {
    fn model_name(&self) -> &str {
        "axis"
    }
    fn dims(&self) -> usize {
        2
    }
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, CapabilityError> {
        Ok(vec![1.0, 0.0])
    }
}

/// Answers only for documents in `answers`; everything else is "Not found".
#[derive(Default)]
struct ScriptedModel {
    fields: Vec<FieldSpec>,
    answers: HashSet<String>,
    failing: HashSet<String>,
    slow: HashSet<String>,
    delay: Duration,
    fabricated_quote: Option<String>,
    plan_error: bool,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedModel {
    fn new(answers: &[&str]) -> Self {
        Self {
            fields: vec![field(FIELD)],
            answers: answers.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl AnalysisModel for ScriptedModel {
    async fn plan_fields(&self, _prompt: &str, _t: AnalysisType) -> Result<QueryPlan, CapabilityError> {
        if self.plan_error {
            return Err(CapabilityError::Call("planner offline".into()));
        }
        Ok(QueryPlan {
            intent: "clause_extraction".into(),
            legal_terms: vec![],
            expanded_queries: vec![],
            fields: self.fields.clone(),
        })
    }

    async fn extract_field(&self, call: &ExtractionCall) -> Result<ExtractionDraft, CapabilityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let mut delay = self.delay;
        if self.slow.contains(&call.document_id) {
            delay = Duration::from_secs(5);
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&call.document_id) {
            return Err(CapabilityError::Call("model returned 500".into()));
        }
        if !self.answers.contains(&call.document_id) {
            return Ok(ExtractionDraft {
                value: NOT_FOUND.into(),
                exact_quote: String::new(),
                page_numbers: vec![],
                confidence: 0.0,
                source: None,
            });
        }
        let quote = self
            .fabricated_quote
            .clone()
            .unwrap_or_else(|| call.passages[0].text.clone());
        Ok(ExtractionDraft {
            value: "30 days".into(),
            exact_quote: quote,
            page_numbers: vec![],
            confidence: 0.9,
            source: None,
        })
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

fn field(name: &str) -> FieldSpec {
    FieldSpec {
        name: name.into(),
        instruction: "zzqx".into(),
        keywords: vec![],
    }
}

fn chunk_text(doc: &str) -> String {
    format!("Either party may end the agreement for document {} on thirty days notice.", doc)
}

/// A one-chunk document whose semantic score against the query is `score`.
fn chunk(doc: &str, score: f32) -> DocumentChunk {
    DocumentChunk {
        chunk_id: format!("{}-0", doc),
        document_id: doc.into(),
        document_name: format!("{}.pdf", doc),
        text: chunk_text(doc),
        embedding: vec![score, (1.0 - score * score).sqrt()],
        page_numbers: vec![3],
        location_markers: vec![],
    }
}

fn corpus(docs: &[(&str, f32)]) -> Arc<InMemoryChunkStore> {
    let store = Arc::new(InMemoryChunkStore::new());
    for (doc, score) in docs {
        store.insert(CALLER, chunk(doc, *score)).unwrap();
    }
    store
}

struct Harness {
    engine: Orchestrator,
    model: Arc<ScriptedModel>,
    chunks: Arc<InMemoryChunkStore>,
    results: Arc<InMemoryResultStore>,
}

fn harness(config: WorkflowConfig, model: ScriptedModel, docs: &[(&str, f32)]) -> Harness {
    let model = Arc::new(model);
    let chunks = corpus(docs);
    let results = Arc::new(InMemoryResultStore::new());
    let engine = Orchestrator::new(
        config,
        model.clone(),
        Arc::new(AxisEmbedder),
        chunks.clone(),
        results.clone(),
    );
    Harness {
        engine,
        model,
        chunks,
        results,
    }
}

fn request(prompt: &str) -> AnalysisRequest {
    AnalysisRequest::new(prompt, AnalysisType::General, CALLER)
}

async fn run(h: &Harness, prompt: &str) -> Result<AnalysisOutcome, AnalysisError> {
    h.engine
        .run_analysis(request(prompt), CancellationToken::new())
        .await
}

fn row_names(outcome: &AnalysisOutcome) -> Vec<&str> {
    outcome.matrix.rows.keys().map(String::as_str).collect()
}

// ─── Scenarios ──────────────────────────────────────────────────────

#[tokio::test]
async fn only_documents_with_candidates_become_rows() {
    let h = harness(
        WorkflowConfig::default(),
        ScriptedModel::new(&["A", "B"]),
        &[("A", 0.8), ("B", 0.6), ("C", 0.1)],
    );
    let outcome = run(&h, "find notice periods").await.unwrap();

    assert_eq!(row_names(&outcome), vec!["A.pdf", "B.pdf"]);
    assert_eq!(outcome.matrix.columns, vec![FIELD]);
    assert_eq!(outcome.metadata.retry_count, 0);
    assert_eq!(outcome.metadata.documents_analyzed, 2);
    assert_eq!(h.model.calls.load(Ordering::SeqCst), 2);

    let cell = outcome.matrix.cell("A.pdf", FIELD).unwrap();
    assert_eq!(cell.value, "30 days");
    assert!(cell.verified);
    assert_eq!(cell.page_numbers, vec![3]);
    assert!(cell.document_url.contains("/A/edit#:~:text="));
}

#[tokio::test]
async fn low_success_pass_is_retried_with_relaxed_threshold() {
    // Pass 1 (threshold 0.30) sees D1..D5, only D1 answers: success 0.20.
    // Pass 2 (threshold 0.15) adds D6..D9, all answering: success 5/9.
    let docs = [
        ("D1", 0.9),
        ("D2", 0.5),
        ("D3", 0.5),
        ("D4", 0.5),
        ("D5", 0.5),
        ("D6", 0.25),
        ("D7", 0.25),
        ("D8", 0.25),
        ("D9", 0.25),
    ];
    let h = harness(
        WorkflowConfig::default(),
        ScriptedModel::new(&["D1", "D6", "D7", "D8", "D9"]),
        &docs,
    );
    let outcome = run(&h, "find notice periods").await.unwrap();
    let meta = &outcome.metadata;

    assert_eq!(meta.retry_count, 1);
    assert_eq!(meta.passes.len(), 2);
    assert!((meta.passes[0].success_rate - 0.20).abs() < 1e-9);
    assert!(meta.passes[0].should_retry);
    assert_eq!(meta.passes[0].params.score_threshold, 0.30);
    assert_eq!(meta.passes[1].params.score_threshold, 0.15);
    assert!((meta.passes[1].success_rate - 5.0 / 9.0).abs() < 1e-9);
    assert!(!meta.passes[1].should_retry);
    assert_eq!(meta.final_params.score_threshold, 0.15);
    assert_eq!(meta.final_params.top_k, 30);
    assert!(!meta.retry_budget_exhausted);
    assert_eq!(outcome.matrix.rows.len(), 9);
}

#[tokio::test]
async fn retries_stop_at_budget_and_relax_monotonically() {
    let h = harness(
        WorkflowConfig::default(),
        ScriptedModel::new(&[]),
        &[("A", 0.8), ("B", 0.7), ("C", 0.6)],
    );
    let outcome = run(&h, "find notice periods").await.unwrap();
    let meta = &outcome.metadata;

    assert_eq!(meta.retry_count, 3);
    assert_eq!(meta.passes.len(), 4);
    assert!(meta.retry_budget_exhausted);
    for pair in meta.passes.windows(2) {
        assert!(pair[1].params.score_threshold < pair[0].params.score_threshold);
        assert!(pair[1].params.top_k > pair[0].params.top_k);
    }
    assert!(meta.passes[3].reason.starts_with("retry budget of 3 exhausted"));

    // Every document still appears even though every cell is "Not found".
    assert_eq!(row_names(&outcome), vec!["A.pdf", "B.pdf", "C.pdf"]);
    assert!(outcome.matrix.records().all(|r| r.value == NOT_FOUND));
}

#[tokio::test]
async fn empty_corpus_yields_empty_matrix_with_columns() {
    let h = harness(WorkflowConfig::default(), ScriptedModel::new(&[]), &[]);
    let outcome = run(&h, "find notice periods").await.unwrap();
    assert!(outcome.matrix.rows.is_empty());
    assert_eq!(outcome.matrix.columns, vec![FIELD]);
    assert_eq!(outcome.metadata.retry_count, 3);
    assert_eq!(h.model.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn confident_cells_always_quote_their_document() {
    let mut model = ScriptedModel::new(&["A", "B"]);
    model.fabricated_quote = Some("either party may end on ninety days notice".into());
    let h = harness(
        WorkflowConfig::default(),
        model,
        &[("A", 0.8), ("B", 0.7)],
    );
    let outcome = run(&h, "find notice periods").await.unwrap();

    for record in outcome.matrix.records() {
        assert!(!record.verified);
        assert_eq!(
            record.reported_quote.as_deref(),
            Some("either party may end on ninety days notice")
        );
        if record.confidence > 0.0 {
            assert!(
                citation::quote_is_grounded(
                    &record.exact_quote,
                    [chunk_text(&record.document_id).as_str()]
                ),
                "ungrounded quote kept: {:?}",
                record.exact_quote
            );
        }
    }
}

#[tokio::test]
async fn unsupported_value_is_not_a_success() {
    // "30 days" never appears in the corpus, only "thirty days".
    let mut model = ScriptedModel::new(&["A", "B"]);
    model.fabricated_quote = Some("notice of 30 days".into());
    let h = harness(
        WorkflowConfig::default(),
        model,
        &[("A", 0.8), ("B", 0.7)],
    );
    let outcome = run(&h, "find notice periods").await.unwrap();

    for record in outcome.matrix.records() {
        assert_eq!(record.confidence, 0.0);
        assert!(record.exact_quote.is_empty());
        assert_eq!(record.reported_quote.as_deref(), Some("notice of 30 days"));
    }
    let first = &outcome.metadata.passes[0];
    assert_eq!(first.success_rate, 0.0);
    assert!(first.should_retry);
}

#[tokio::test]
async fn failed_cell_does_not_abort_siblings() {
    let mut model = ScriptedModel::new(&["A", "B", "C"]);
    model.failing.insert("B".into());
    let h = harness(
        WorkflowConfig::default(),
        model,
        &[("A", 0.8), ("B", 0.7), ("C", 0.6)],
    );
    let outcome = run(&h, "find notice periods").await.unwrap();

    let b = outcome.matrix.cell("B.pdf", FIELD).unwrap();
    assert_eq!(b.value, NOT_SPECIFIED);
    assert_eq!(b.confidence, 0.0);
    assert_eq!(outcome.matrix.cell("A.pdf", FIELD).unwrap().value, "30 days");
    assert_eq!(outcome.matrix.cell("C.pdf", FIELD).unwrap().value, "30 days");
}

#[tokio::test]
async fn slow_call_times_out_into_placeholder() {
    let mut config = WorkflowConfig::default();
    config.call_timeout = Duration::from_millis(100);
    let mut model = ScriptedModel::new(&["A", "B"]);
    model.slow.insert("B".into());
    let h = harness(config, model, &[("A", 0.8), ("B", 0.7)]);
    let outcome = run(&h, "find notice periods").await.unwrap();

    assert_eq!(outcome.matrix.cell("B.pdf", FIELD).unwrap().value, NOT_SPECIFIED);
    assert_eq!(outcome.matrix.cell("A.pdf", FIELD).unwrap().value, "30 days");
}

#[tokio::test]
async fn extraction_pool_is_bounded() {
    let mut config = WorkflowConfig::default();
    config.concurrency = 2;
    let mut model = ScriptedModel::new(&["A", "B", "C", "D", "E", "F"]);
    model.delay = Duration::from_millis(20);
    let docs = [("A", 0.9), ("B", 0.8), ("C", 0.7), ("D", 0.6), ("E", 0.5), ("F", 0.4)];
    let h = harness(config, model, &docs);
    let outcome = run(&h, "find notice periods").await.unwrap();

    assert_eq!(outcome.matrix.rows.len(), 6);
    assert_eq!(h.model.calls.load(Ordering::SeqCst), 6);
    assert!(h.model.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn overall_budget_elapsing_is_a_timeout() {
    let mut config = WorkflowConfig::default();
    config.timeout = Duration::from_millis(100);
    let mut model = ScriptedModel::new(&["A"]);
    model.slow.insert("A".into());
    let h = harness(config, model, &[("A", 0.8)]);

    let err = run(&h, "find notice periods").await.unwrap_err();
    assert!(matches!(err, AnalysisError::Timeout { .. }));
    assert_eq!(h.results.cell_count(), 0);
}

#[tokio::test]
async fn cancellation_aborts_the_active_pass() {
    let mut model = ScriptedModel::new(&["A"]);
    model.slow.insert("A".into());
    let h = harness(WorkflowConfig::default(), model, &[("A", 0.8)]);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = h
        .engine
        .run_analysis(request("find notice periods"), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, AnalysisError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(h.results.cell_count(), 0);
}

/// Result store whose cell writes take a while and announce the first one.
struct SlowResults {
    inner: InMemoryResultStore,
    delay: Duration,
    writing: CancellationToken,
}

#[async_trait]
impl ResultStore for SlowResults {
    async fn upsert(
        &self,
        request_id: &str,
        document_id: &str,
        field_name: &str,
        record: &ExtractionRecord,
    ) -> Result<(), StoreError> {
        self.writing.cancel();
        tokio::time::sleep(self.delay).await;
        self.inner.upsert(request_id, document_id, field_name, record).await
    }

    async fn cells(&self, request_id: &str) -> Result<Vec<ExtractionRecord>, StoreError> {
        self.inner.cells(request_id).await
    }

    async fn begin_request(&self, record: &RequestRecord) -> Result<(), StoreError> {
        self.inner.begin_request(record).await
    }

    async fn finish_request(
        &self,
        request_id: &str,
        status: RequestStatus,
        columns: &[String],
        retry_count: u32,
    ) -> Result<(), StoreError> {
        self.inner
            .finish_request(request_id, status, columns, retry_count)
            .await
    }

    async fn get_request(&self, request_id: &str) -> Result<Option<RequestRecord>, StoreError> {
        self.inner.get_request(request_id).await
    }
}

#[tokio::test]
async fn cancellation_during_synthesis_never_leaves_a_partial_matrix() {
    let results = Arc::new(SlowResults {
        inner: InMemoryResultStore::new(),
        delay: Duration::from_millis(50),
        writing: CancellationToken::new(),
    });
    let engine = Orchestrator::new(
        WorkflowConfig::default(),
        Arc::new(ScriptedModel::new(&["A", "B", "C"])),
        Arc::new(AxisEmbedder),
        corpus(&[("A", 0.8), ("B", 0.7), ("C", 0.6)]),
        results.clone(),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let writing = results.writing.clone();
    tokio::spawn(async move {
        writing.cancelled().await;
        trigger.cancel();
    });

    let outcome = engine
        .run_analysis(request("find notice periods"), cancel)
        .await
        .unwrap();
    assert_eq!(outcome.matrix.rows.len(), 3);
    assert_eq!(results.inner.cell_count(), 3);
    let stored = results.inner.get_request(&outcome.request_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RequestStatus::Completed);
}

#[tokio::test]
async fn persistence_failure_still_returns_the_matrix() {
    let h = harness(
        WorkflowConfig::default(),
        ScriptedModel::new(&["A"]),
        &[("A", 0.8)],
    );
    h.results.set_fail_writes(true);
    let err = run(&h, "find notice periods").await.unwrap_err();

    assert_eq!(err.code(), "persistence_failure");
    let outcome = err.partial_outcome().unwrap();
    assert_eq!(outcome.matrix.cell("A.pdf", FIELD).unwrap().value, "30 days");

    let record = h.results.get_request(&outcome.request_id).await.unwrap().unwrap();
    assert_eq!(record.status, RequestStatus::Failed);
}

#[tokio::test]
async fn resynthesizing_overwrites_cells() {
    let h = harness(
        WorkflowConfig::default(),
        ScriptedModel::new(&["A", "B"]),
        &[("A", 0.8), ("B", 0.7)],
    );
    let outcome = run(&h, "find notice periods").await.unwrap();
    assert_eq!(h.results.cell_count(), 2);

    let synth = Synthesizer::new(h.results.clone());
    synth.persist(&outcome.request_id, &outcome.matrix).await.unwrap();
    assert_eq!(h.results.cell_count(), 2);
    assert_eq!(h.results.write_count(), 4);
}

#[tokio::test]
async fn unreachable_index_fails_the_request() {
    let h = harness(
        WorkflowConfig::default(),
        ScriptedModel::new(&["A"]),
        &[("A", 0.8)],
    );
    h.chunks.set_unavailable(true);
    let err = run(&h, "find notice periods").await.unwrap_err();
    assert!(matches!(err, AnalysisError::RetrievalFailure(_)));
    assert_eq!(h.results.cell_count(), 0);
}

#[tokio::test]
async fn requests_are_rejected_before_any_work() {
    let h = harness(
        WorkflowConfig::default(),
        ScriptedModel::new(&["A"]),
        &[("A", 0.8)],
    );

    let mut anonymous = request("find notice periods");
    anonymous.caller_id = Some("   ".into());
    let err = h
        .engine
        .run_analysis(anonymous, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AnalysisError::Unauthenticated));

    let err = run(&h, "   ").await.unwrap_err();
    assert!(matches!(err, AnalysisError::InvalidRequest { .. }));

    let long = "x".repeat(h.engine.config().max_prompt_chars + 1);
    let err = run(&h, &long).await.unwrap_err();
    assert!(matches!(err, AnalysisError::InvalidRequest { .. }));

    assert_eq!(h.model.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn planner_without_fields_is_reported() {
    let mut empty = ScriptedModel::new(&[]);
    empty.fields = vec![field("  ")];
    let h = harness(WorkflowConfig::default(), empty, &[("A", 0.8)]);
    let err = run(&h, "find notice periods").await.unwrap_err();
    assert!(matches!(err, AnalysisError::NoFieldsDerived { .. }));

    let mut broken = ScriptedModel::new(&[]);
    broken.plan_error = true;
    let h = harness(WorkflowConfig::default(), broken, &[("A", 0.8)]);
    let err = run(&h, "find notice periods").await.unwrap_err();
    assert_eq!(err.code(), "no_fields_derived");
}

#[tokio::test]
async fn concurrent_requests_do_not_share_state() {
    let h = Arc::new(harness(
        WorkflowConfig::default(),
        ScriptedModel::new(&["A", "B"]),
        &[("A", 0.8), ("B", 0.7)],
    ));
    let a = {
        let h = h.clone();
        tokio::spawn(async move { run(&h, "find notice periods").await })
    };
    let b = {
        let h = h.clone();
        tokio::spawn(async move { run(&h, "what notice is required").await })
    };
    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();

    assert_ne!(a.request_id, b.request_id);
    assert_eq!(a.matrix, b.matrix);
    assert_eq!(h.results.cell_count(), 4);
}
