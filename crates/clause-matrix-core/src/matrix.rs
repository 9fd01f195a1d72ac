//! Matrix assembly from an accepted pass.
//!
//! A document becomes a row iff at least one field retrieved a candidate
//! from it. Every row carries a cell for every column; cells with no
//! extraction record are filled with "Not found".

use std::collections::{BTreeMap, BTreeSet};

use crate::models::{ExtractionRecord, FieldRetrieval, FieldSpec, MatrixResult};

/// Build the matrix for one pass.
///
/// `names` maps document id to display name; ids missing from it are shown
/// by id.
pub fn assemble(
    fields: &[FieldSpec],
    retrievals: &[FieldRetrieval],
    records: &[ExtractionRecord],
    names: &BTreeMap<String, String>,
) -> MatrixResult {
    let columns: Vec<String> = fields.iter().map(|f| f.name.clone()).collect();

    let document_ids: BTreeSet<&str> = retrievals
        .iter()
        .flat_map(|r| r.candidates.iter().map(|c| c.document_id.as_str()))
        .collect();

    let display: Vec<(&str, &str)> = document_ids
        .iter()
        .map(|id| (*id, names.get(*id).map(String::as_str).unwrap_or(*id)))
        .collect();
    let keys = row_keys(&display);

    let mut rows = BTreeMap::new();
    for (document_id, document_name) in display {
        let mut row = BTreeMap::new();
        for column in &columns {
            let cell = records
                .iter()
                .find(|r| r.document_id == document_id && &r.field_name == column)
                .cloned()
                .unwrap_or_else(|| ExtractionRecord::not_found(document_id, document_name, column));
            row.insert(column.clone(), cell);
        }
        if let Some(key) = keys.get(document_id) {
            rows.insert(key.clone(), row);
        }
    }

    MatrixResult { columns, rows }
}

/// Rebuild a matrix from stored cells, e.g. when reading a request back.
pub fn from_records(columns: &[String], records: &[ExtractionRecord]) -> MatrixResult {
    let mut display: Vec<(&str, &str)> = records
        .iter()
        .map(|r| (r.document_id.as_str(), r.document_name.as_str()))
        .collect();
    display.sort_unstable();
    display.dedup_by(|a, b| a.0 == b.0);
    let keys = row_keys(&display);

    let mut rows: BTreeMap<String, BTreeMap<String, ExtractionRecord>> = BTreeMap::new();
    for record in records {
        if let Some(key) = keys.get(record.document_id.as_str()) {
            rows.entry(key.clone())
                .or_default()
                .insert(record.field_name.clone(), record.clone());
        }
    }
    for (key, row) in rows.iter_mut() {
        for column in columns {
            if !row.contains_key(column) {
                let (id, name) = display
                    .iter()
                    .find(|(id, _)| keys.get(*id) == Some(key))
                    .copied()
                    .unwrap_or(("", key.as_str()));
                row.insert(column.clone(), ExtractionRecord::not_found(id, name, column));
            }
        }
    }

    MatrixResult {
        columns: columns.to_vec(),
        rows,
    }
}

/// Unique row key per document id.
///
/// The display name is used as-is unless another document shares it, in
/// which case every colliding row is keyed `"{name} ({id})"`.
fn row_keys<'a>(display: &[(&'a str, &'a str)]) -> BTreeMap<&'a str, String> {
    let mut name_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for (_, name) in display.iter() {
        *name_counts.entry(*name).or_default() += 1;
    }
    display
        .iter()
        .map(|(id, name)| {
            let key = if name_counts.get(name).copied().unwrap_or(0) > 1 {
                format!("{} ({})", name, id)
            } else {
                (*name).to_string()
            };
            (*id, key)
        })
        .collect()
}
