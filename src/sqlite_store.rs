//! SQLite-backed [`ChunkStore`] and [`ResultStore`] implementations.
//!
//! Chunks live in `document_chunks` with an FTS5 mirror in `chunks_fts`;
//! results live in `analysis_requests` and `matrix_cells`. Every chunk
//! query is filtered by `owner_id`, so a caller only ever sees its own
//! documents.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use clause_matrix_core::capability::{blob_to_vec, cosine_similarity, vec_to_blob};
use clause_matrix_core::error::StoreError;
use clause_matrix_core::models::{
    AnalysisType, DocumentChunk, ExtractionRecord, KeywordTerm, ScoredChunk,
};
use clause_matrix_core::store::{
    term_coverage, ChunkStore, RequestRecord, RequestStatus, ResultStore,
};

/// Keyword hits fetched from FTS5 per requested result before rescoring.
const FTS_OVERFETCH: usize = 4;

/// SQLite implementation of [`ChunkStore`].
pub struct SqliteChunkStore {
    pool: SqlitePool,
}

impl SqliteChunkStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace one chunk and its FTS5 row.
    ///
    /// Chunks are normally written by the ingestion pipeline; this is the
    /// write path it (and the test suite) uses.
    pub async fn insert_chunk(&self, owner_id: &str, chunk: &DocumentChunk) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::backend)?;
        let embedding = (!chunk.embedding.is_empty()).then(|| vec_to_blob(&chunk.embedding));
        let pages = serde_json::to_string(&chunk.page_numbers).map_err(StoreError::backend)?;
        let markers = serde_json::to_string(&chunk.location_markers).map_err(StoreError::backend)?;

        sqlx::query(
            r#"
            INSERT INTO document_chunks (chunk_id, document_id, document_name, owner_id, text,
                                         embedding, page_numbers_json, location_markers_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                document_id = excluded.document_id,
                document_name = excluded.document_name,
                owner_id = excluded.owner_id,
                text = excluded.text,
                embedding = excluded.embedding,
                page_numbers_json = excluded.page_numbers_json,
                location_markers_json = excluded.location_markers_json
            "#,
        )
        .bind(&chunk.chunk_id)
        .bind(&chunk.document_id)
        .bind(&chunk.document_name)
        .bind(owner_id)
        .bind(&chunk.text)
        .bind(embedding)
        .bind(pages)
        .bind(markers)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::backend)?;

        sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
            .bind(&chunk.chunk_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::backend)?;

        sqlx::query("INSERT INTO chunks_fts (chunk_id, document_id, owner_id, text) VALUES (?, ?, ?, ?)")
            .bind(&chunk.chunk_id)
            .bind(&chunk.document_id)
            .bind(owner_id)
            .bind(&chunk.text)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::backend)?;

        tx.commit().await.map_err(StoreError::backend)?;
        Ok(())
    }
}

/// FTS5 query matching any of `terms` as whole phrases.
fn fts_match_expr(terms: &[KeywordTerm]) -> Option<String> {
    let phrases: Vec<String> = terms
        .iter()
        .flat_map(KeywordTerm::alternatives)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    (!phrases.is_empty()).then(|| phrases.join(" OR "))
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

fn parse_json_list<T: serde::de::DeserializeOwned>(raw: &str) -> Vec<T> {
    serde_json::from_str(raw).unwrap_or_default()
}

#[async_trait]
impl ChunkStore for SqliteChunkStore {
    async fn search_semantic(
        &self,
        caller_id: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT chunk_id, document_id, embedding
            FROM document_chunks
            WHERE owner_id = ? AND embedding IS NOT NULL
            "#,
        )
        .bind(caller_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        let hits = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(vector, &blob_to_vec(&blob)) as f64;
                ScoredChunk {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    score: similarity.clamp(0.0, 1.0),
                }
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
        let Some(expr) = fts_match_expr(terms) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r#"
            SELECT chunk_id, document_id, text
            FROM chunks_fts
            WHERE chunks_fts MATCH ? AND owner_id = ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(expr)
        .bind(caller_id)
        .bind(k.saturating_mul(FTS_OVERFETCH) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        let hits = rows
            .iter()
            .filter_map(|row| {
                let text: String = row.get("text");
                let score = term_coverage(&text, terms);
                (score > 0.0).then(|| ScoredChunk {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
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
        let mut chunks = Vec::with_capacity(chunk_ids.len());
        for id in chunk_ids {
            let row = sqlx::query(
                r#"
                SELECT chunk_id, document_id, document_name, text, embedding,
                       page_numbers_json, location_markers_json
                FROM document_chunks
                WHERE owner_id = ? AND chunk_id = ?
                "#,
            )
            .bind(caller_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::backend)?;

            if let Some(row) = row {
                let blob: Option<Vec<u8>> = row.get("embedding");
                let pages: String = row.get("page_numbers_json");
                let markers: String = row.get("location_markers_json");
                chunks.push(DocumentChunk {
                    chunk_id: row.get("chunk_id"),
                    document_id: row.get("document_id"),
                    document_name: row.get("document_name"),
                    text: row.get("text"),
                    embedding: blob.map(|b| blob_to_vec(&b)).unwrap_or_default(),
                    page_numbers: parse_json_list(&pages),
                    location_markers: parse_json_list(&markers),
                });
            }
        }
        Ok(chunks)
    }
}

/// SQLite implementation of [`ResultStore`].
pub struct SqliteResultStore {
    pool: SqlitePool,
}

impl SqliteResultStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn upsert(
        &self,
        request_id: &str,
        document_id: &str,
        field_name: &str,
        record: &ExtractionRecord,
    ) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        let pages = serde_json::to_string(&record.page_numbers).map_err(StoreError::backend)?;
        let markers = serde_json::to_string(&record.location_markers).map_err(StoreError::backend)?;

        sqlx::query(
            r#"
            INSERT INTO matrix_cells (request_id, document_id, field_name, document_name, value,
                                      exact_quote, page_numbers_json, document_url, confidence,
                                      verified, reported_quote, source, location_markers_json,
                                      updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(request_id, document_id, field_name) DO UPDATE SET
                document_name = excluded.document_name,
                value = excluded.value,
                exact_quote = excluded.exact_quote,
                page_numbers_json = excluded.page_numbers_json,
                document_url = excluded.document_url,
                confidence = excluded.confidence,
                verified = excluded.verified,
                reported_quote = excluded.reported_quote,
                source = excluded.source,
                location_markers_json = excluded.location_markers_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(request_id)
        .bind(document_id)
        .bind(field_name)
        .bind(&record.document_name)
        .bind(&record.value)
        .bind(&record.exact_quote)
        .bind(pages)
        .bind(&record.document_url)
        .bind(record.confidence)
        .bind(record.verified)
        .bind(&record.reported_quote)
        .bind(&record.source)
        .bind(markers)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(())
    }

    async fn cells(&self, request_id: &str) -> Result<Vec<ExtractionRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT document_id, document_name, field_name, value, exact_quote, page_numbers_json,
                   document_url, confidence, verified, reported_quote, source,
                   location_markers_json
            FROM matrix_cells
            WHERE request_id = ?
            ORDER BY document_id ASC, field_name ASC
            "#,
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(rows
            .iter()
            .map(|row| {
                let pages: String = row.get("page_numbers_json");
                let markers: String = row.get("location_markers_json");
                ExtractionRecord {
                    document_id: row.get("document_id"),
                    document_name: row.get("document_name"),
                    field_name: row.get("field_name"),
                    value: row.get("value"),
                    exact_quote: row.get("exact_quote"),
                    page_numbers: parse_json_list(&pages),
                    document_url: row.get("document_url"),
                    confidence: row.get("confidence"),
                    verified: row.get("verified"),
                    reported_quote: row.get("reported_quote"),
                    source: row.get("source"),
                    location_markers: parse_json_list(&markers),
                }
            })
            .collect())
    }

    async fn begin_request(&self, record: &RequestRecord) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        let columns = serde_json::to_string(&record.columns).map_err(StoreError::backend)?;

        sqlx::query(
            r#"
            INSERT INTO analysis_requests (request_id, caller_id, prompt, analysis_type,
                                           columns_json, status, retry_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(request_id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.request_id)
        .bind(&record.caller_id)
        .bind(&record.prompt)
        .bind(record.analysis_type.as_str())
        .bind(columns)
        .bind(record.status.as_str())
        .bind(record.retry_count as i64)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(())
    }

    async fn finish_request(
        &self,
        request_id: &str,
        status: RequestStatus,
        columns: &[String],
        retry_count: u32,
    ) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        let columns = serde_json::to_string(columns).map_err(StoreError::backend)?;

        sqlx::query(
            r#"
            UPDATE analysis_requests
            SET status = ?, columns_json = ?, retry_count = ?, updated_at = ?
            WHERE request_id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(columns)
        .bind(retry_count as i64)
        .bind(now)
        .bind(request_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        Ok(())
    }

    async fn get_request(&self, request_id: &str) -> Result<Option<RequestRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT request_id, caller_id, prompt, analysis_type, columns_json, status, retry_count
            FROM analysis_requests
            WHERE request_id = ?
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let analysis_type: String = row.get("analysis_type");
        let status: String = row.get("status");
        let columns: String = row.get("columns_json");
        let retry_count: i64 = row.get("retry_count");

        Ok(Some(RequestRecord {
            request_id: row.get("request_id"),
            caller_id: row.get("caller_id"),
            prompt: row.get("prompt"),
            analysis_type: analysis_type.parse().unwrap_or(AnalysisType::General),
            status: RequestStatus::parse(&status).unwrap_or(RequestStatus::Failed),
            columns: parse_json_list(&columns),
            retry_count: retry_count.max(0) as u32,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_expr_quotes_phrases() {
        let terms = vec![
            KeywordTerm::literal("written notice"),
            KeywordTerm::literal(" "),
            KeywordTerm::literal("say \"hi\""),
        ];
        assert_eq!(
            fts_match_expr(&terms).unwrap(),
            "\"written notice\" OR \"say \"\"hi\"\"\""
        );
        let expanded = vec![KeywordTerm {
            term: "notice".into(),
            synonyms: vec!["notification".into()],
        }];
        assert_eq!(fts_match_expr(&expanded).unwrap(), "\"notice\" OR \"notification\"");
        assert!(fts_match_expr(&[]).is_none());
    }

    #[test]
    fn bad_json_lists_decode_empty() {
        let pages: Vec<u32> = parse_json_list("not json");
        assert!(pages.is_empty());
        let pages: Vec<u32> = parse_json_list("[2,5]");
        assert_eq!(pages, vec![2, 5]);
    }
}
