//! Persists an accepted matrix cell by cell.
//!
//! Writes are upserts keyed by `(request_id, document_id, field_name)`, so
//! re-running synthesis for the same request overwrites instead of
//! duplicating.

use std::sync::Arc;

use clause_matrix_core::error::StoreError;
use clause_matrix_core::models::MatrixResult;
use clause_matrix_core::store::ResultStore;

pub struct Synthesizer {
    results: Arc<dyn ResultStore>,
}

impl Synthesizer {
    pub fn new(results: Arc<dyn ResultStore>) -> Self {
        Self { results }
    }

    /// Write every cell of `matrix`. Stops at the first store error.
    ///
    /// Returns the number of cells written.
    pub async fn persist(&self, request_id: &str, matrix: &MatrixResult) -> Result<usize, StoreError> {
        let mut written = 0;
        for record in matrix.records() {
            self.results
                .upsert(request_id, &record.document_id, &record.field_name, record)
                .await?;
            written += 1;
        }
        tracing::debug!(request_id, cells = written, "matrix persisted");
        Ok(written)
    }
}
