//! Database access for classif-ai
//!
//! Plain async functions over a tenant pool (or a transaction connection
//! for writes that must share the reconciliation transaction).

pub mod defects;
pub mod file_sets;
pub mod files;
pub mod history;
pub mod inference_queue;
pub mod ml_models;
pub mod regions;
pub mod use_cases;

use classif_common::{Error, Result};
use serde::de::DeserializeOwned;

/// Rows fetched per `IN (...)` query; stays well below SQLite's bind limit
pub(crate) const IN_CHUNK_SIZE: usize = 500;

pub(crate) fn decode_json<T: DeserializeOwned>(column: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| Error::Internal(format!("Failed to decode {} column: {}", column, e)))
}
