//! File set operations

use chrono::{DateTime, Utc};
use classif_common::db::FileSet;
use classif_common::time::{parse_db_timestamp, to_db_timestamp};
use classif_common::{Error, Result};
use serde_json::{Map, Value};
use sqlx::{sqlite::SqliteRow, Row, SqliteExecutor, SqlitePool};

use super::decode_json;
use crate::meta_schema::MetaInfoSchema;

/// File set upload request
#[derive(Debug, Clone, Default)]
pub struct NewFileSet {
    pub use_case_id: i64,
    pub meta_info: Map<String, Value>,
    /// Upload time; defaults to now
    pub created_at: Option<DateTime<Utc>>,
}

/// Insert a file set, validating its metadata against the tenant schema
pub async fn create_file_set(
    pool: &SqlitePool,
    file_set: &NewFileSet,
    schema: Option<&MetaInfoSchema>,
) -> Result<FileSet> {
    if let Some(schema) = schema {
        schema.validate(&file_set.meta_info)?;
    }

    let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM use_cases WHERE id = ?")
        .bind(file_set.use_case_id)
        .fetch_optional(pool)
        .await?;
    if exists.is_none() {
        return Err(Error::NotFound(format!("use case {}", file_set.use_case_id)));
    }

    let created_at = file_set.created_at.unwrap_or_else(Utc::now);
    let id = sqlx::query("INSERT INTO file_sets (use_case_id, meta_info, created_at) VALUES (?, ?, ?)")
        .bind(file_set.use_case_id)
        .bind(serde_json::to_string(&file_set.meta_info)?)
        .bind(to_db_timestamp(&created_at))
        .execute(pool)
        .await?
        .last_insert_rowid();

    tracing::debug!(file_set_id = id, use_case_id = file_set.use_case_id, "Created file set");

    Ok(FileSet {
        id,
        use_case_id: file_set.use_case_id,
        meta_info: file_set.meta_info.clone(),
        created_at,
    })
}

pub async fn load_file_set<'e, E>(executor: E, id: i64) -> Result<Option<FileSet>>
where
    E: SqliteExecutor<'e>,
{
    let row = sqlx::query("SELECT id, use_case_id, meta_info, created_at FROM file_sets WHERE id = ?")
        .bind(id)
        .fetch_optional(executor)
        .await?;

    row.as_ref().map(file_set_from_row).transpose()
}

pub async fn load_file_sets(pool: &SqlitePool) -> Result<Vec<FileSet>> {
    let rows = sqlx::query("SELECT id, use_case_id, meta_info, created_at FROM file_sets ORDER BY id")
        .fetch_all(pool)
        .await?;

    rows.iter().map(file_set_from_row).collect()
}

fn file_set_from_row(row: &SqliteRow) -> Result<FileSet> {
    Ok(FileSet {
        id: row.get("id"),
        use_case_id: row.get("use_case_id"),
        meta_info: decode_json("meta_info", row.get::<&str, _>("meta_info"))?,
        created_at: parse_db_timestamp(row.get::<&str, _>("created_at"))?,
    })
}
