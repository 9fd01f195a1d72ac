//! In-memory [`ChunkStore`] and [`ResultStore`] implementations for tests.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. Semantic search is
//! brute-force cosine similarity; keyword search is a substring scan scored
//! by [`term_coverage`]. Both stores expose switches that simulate an
//! unreachable backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::capability::cosine_similarity;
use crate::error::StoreError;
use crate::models::{DocumentChunk, ExtractionRecord, KeywordTerm, ScoredChunk};

use super::{term_coverage, ChunkStore, RequestRecord, RequestStatus, ResultStore};

struct OwnedChunk {
    owner: String,
    chunk: DocumentChunk,
}

/// In-memory chunk index keyed by owner.
pub struct InMemoryChunkStore {
    chunks: RwLock<Vec<OwnedChunk>>,
    unavailable: AtomicBool,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(Vec::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Add a chunk owned by `owner`, replacing any chunk with the same id.
    pub fn insert(&self, owner: &str, chunk: DocumentChunk) -> Result<(), StoreError> {
        let mut chunks = self.chunks.write().map_err(|_| StoreError::Poisoned)?;
        chunks.retain(|c| c.chunk.chunk_id != chunk.chunk_id);
        chunks.push(OwnedChunk {
            owner: owner.to_string(),
            chunk,
        });
        Ok(())
    }

    /// Make every subsequent call fail as if the index were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory index offline".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryChunkStore {
    fn default() -> Self {
        Self::new()
    }
}

fn rank(mut hits: Vec<ScoredChunk>, k: usize) -> Vec<ScoredChunk> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    hits.truncate(k);
    hits
}

#[async_trait]
impl ChunkStore for InMemoryChunkStore {
    async fn search_semantic(
        &self,
        caller_id: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        self.check_available()?;
        let chunks = self.chunks.read().map_err(|_| StoreError::Poisoned)?;
        let hits = chunks
            .iter()
            .filter(|c| c.owner == caller_id && !c.chunk.embedding.is_empty())
            .map(|c| ScoredChunk {
                chunk_id: c.chunk.chunk_id.clone(),
                document_id: c.chunk.document_id.clone(),
                score: (cosine_similarity(vector, &c.chunk.embedding) as f64).clamp(0.0, 1.0),
            })
            .collect();
        Ok(rank(hits, k))
    }

    async fn search_keyword(
        &self,
        caller_id: &str,
        terms: &[KeywordTerm],
        k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        self.check_available()?;
        let chunks = self.chunks.read().map_err(|_| StoreError::Poisoned)?;
        let hits = chunks
            .iter()
            .filter(|c| c.owner == caller_id)
            .filter_map(|c| {
                let score = term_coverage(&c.chunk.text, terms);
                (score > 0.0).then(|| ScoredChunk {
                    chunk_id: c.chunk.chunk_id.clone(),
                    document_id: c.chunk.document_id.clone(),
                    score,
                })
            })
            .collect();
        Ok(rank(hits, k))
    }

    async fn get_chunks(
        &self,
        caller_id: &str,
        chunk_ids: &[String],
    ) -> Result<Vec<DocumentChunk>, StoreError> {
        self.check_available()?;
        let chunks = self.chunks.read().map_err(|_| StoreError::Poisoned)?;
        Ok(chunk_ids
            .iter()
            .filter_map(|id| {
                chunks
                    .iter()
                    .find(|c| c.owner == caller_id && &c.chunk.chunk_id == id)
                    .map(|c| c.chunk.clone())
            })
            .collect())
    }
}

type CellKey = (String, String, String);

/// In-memory result store with upsert semantics.
pub struct InMemoryResultStore {
    cells: RwLock<BTreeMap<CellKey, ExtractionRecord>>,
    requests: RwLock<HashMap<String, RequestRecord>>,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self {
            cells: RwLock::new(BTreeMap::new()),
            requests: RwLock::new(HashMap::new()),
            writes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Number of distinct stored cells.
    pub fn cell_count(&self) -> usize {
        self.cells.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Number of upsert calls accepted so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every subsequent cell upsert fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl Default for InMemoryResultStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn upsert(
        &self,
        request_id: &str,
        document_id: &str,
        field_name: &str,
        record: &ExtractionRecord,
    ) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory result store offline".to_string()));
        }
        let mut cells = self.cells.write().map_err(|_| StoreError::Poisoned)?;
        cells.insert(
            (
                request_id.to_string(),
                document_id.to_string(),
                field_name.to_string(),
            ),
            record.clone(),
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn cells(&self, request_id: &str) -> Result<Vec<ExtractionRecord>, StoreError> {
        let cells = self.cells.read().map_err(|_| StoreError::Poisoned)?;
        Ok(cells
            .iter()
            .filter(|((req, _, _), _)| req == request_id)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn begin_request(&self, record: &RequestRecord) -> Result<(), StoreError> {
        let mut requests = self.requests.write().map_err(|_| StoreError::Poisoned)?;
        requests.insert(record.request_id.clone(), record.clone());
        Ok(())
    }

    async fn finish_request(
        &self,
        request_id: &str,
        status: RequestStatus,
        columns: &[String],
        retry_count: u32,
    ) -> Result<(), StoreError> {
        let mut requests = self.requests.write().map_err(|_| StoreError::Poisoned)?;
        if let Some(r) = requests.get_mut(request_id) {
            r.status = status;
            r.columns = columns.to_vec();
            r.retry_count = retry_count;
        }
        Ok(())
    }

    async fn get_request(&self, request_id: &str) -> Result<Option<RequestRecord>, StoreError> {
        let requests = self.requests.read().map_err(|_| StoreError::Poisoned)?;
        Ok(requests.get(request_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, doc: &str, text: &str, embedding: Vec<f32>) -> DocumentChunk {
        DocumentChunk {
            chunk_id: id.to_string(),
            document_id: doc.to_string(),
            document_name: format!("{} name", doc),
            text: text.to_string(),
            embedding,
            page_numbers: vec![],
            location_markers: vec![],
        }
    }

    #[tokio::test]
    async fn searches_are_scoped_to_owner() {
        let store = InMemoryChunkStore::new();
        store
            .insert("alice", chunk("c1", "A", "termination notice", vec![1.0, 0.0]))
            .unwrap();
        store
            .insert("bob", chunk("c2", "B", "termination notice", vec![1.0, 0.0]))
            .unwrap();

        let hits = store
            .search_keyword("alice", &[KeywordTerm::literal("notice")], 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c1");

        let hits = store.search_semantic("bob", &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c2");

        let fetched = store
            .get_chunks("alice", &["c1".to_string(), "c2".to_string()])
            .await
            .unwrap();
        assert_eq!(fetched.len(), 1);
    }

    #[tokio::test]
    async fn semantic_scores_are_clamped_to_unit() {
        let store = InMemoryChunkStore::new();
        store.insert("u", chunk("c1", "A", "x", vec![-1.0, 0.0])).unwrap();
        let hits = store.search_semantic("u", &[1.0, 0.0], 5).await.unwrap();
        assert_eq!(hits[0].score, 0.0);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryChunkStore::new();
        store.set_unavailable(true);
        assert!(store.search_semantic("u", &[1.0], 5).await.is_err());
        assert!(store.search_keyword("u", &[KeywordTerm::literal("a")], 5).await.is_err());
    }

    #[tokio::test]
    async fn result_upsert_overwrites_same_key() {
        let store = InMemoryResultStore::new();
        let mut record = ExtractionRecord::not_found("A", "Doc A", "notice_period");
        store.upsert("r1", "A", "notice_period", &record).await.unwrap();
        record.value = "30 days".to_string();
        store.upsert("r1", "A", "notice_period", &record).await.unwrap();

        assert_eq!(store.cell_count(), 1);
        assert_eq!(store.write_count(), 2);
        let cells = store.cells("r1").await.unwrap();
        assert_eq!(cells[0].value, "30 days");
        assert!(store.cells("r2").await.unwrap().is_empty());
    }
}
