//! File region persistence
//!
//! Writes take a `SqliteConnection` so they can join the caller's
//! reconciliation transaction; regions are never deleted, only flagged
//! `is_removed`.

use chrono::Utc;
use classif_common::db::{DefectMap, FileRegion, RegionBox};
use classif_common::time::{parse_db_timestamp, to_db_timestamp};
use classif_common::Result;
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqliteConnection, SqliteExecutor, SqlitePool};

use super::{decode_json, IN_CHUNK_SIZE};

const REGION_COLUMNS: &str = "id, file_id, ml_model_id, defects, region, is_user_feedback, is_removed, \
     classification_correctness, detection_correctness, ai_region_id, created_at, updated_at";

/// Column values for a region about to be inserted
#[derive(Debug, Clone, PartialEq)]
pub struct RegionDraft {
    pub file_id: i64,
    pub ml_model_id: i64,
    pub defects: DefectMap,
    pub region: Option<RegionBox>,
    pub is_user_feedback: bool,
    pub is_removed: bool,
    pub classification_correctness: Option<bool>,
    pub detection_correctness: Option<bool>,
    pub ai_region_id: Option<i64>,
}

pub async fn insert_region(conn: &mut SqliteConnection, draft: &RegionDraft) -> Result<FileRegion> {
    let now = Utc::now();
    let ts = to_db_timestamp(&now);
    let region_json = draft.region.as_ref().map(serde_json::to_string).transpose()?;

    let id = sqlx::query(
        r#"
        INSERT INTO file_regions (
            file_id, ml_model_id, defects, region, is_user_feedback, is_removed,
            classification_correctness, detection_correctness, ai_region_id,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(draft.file_id)
    .bind(draft.ml_model_id)
    .bind(serde_json::to_string(&draft.defects)?)
    .bind(region_json)
    .bind(draft.is_user_feedback)
    .bind(draft.is_removed)
    .bind(draft.classification_correctness)
    .bind(draft.detection_correctness)
    .bind(draft.ai_region_id)
    .bind(&ts)
    .bind(&ts)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    Ok(FileRegion {
        id,
        file_id: draft.file_id,
        ml_model_id: draft.ml_model_id,
        defects: draft.defects.clone(),
        region: draft.region,
        is_user_feedback: draft.is_user_feedback,
        is_removed: draft.is_removed,
        classification_correctness: draft.classification_correctness,
        detection_correctness: draft.detection_correctness,
        ai_region_id: draft.ai_region_id,
        created_at: now,
        updated_at: now,
    })
}

/// Persist the mutable state of a region (flags, correctness, link)
///
/// Stamps `updated_at` on the passed region.
pub async fn update_region_state(conn: &mut SqliteConnection, region: &mut FileRegion) -> Result<()> {
    region.updated_at = Utc::now();

    sqlx::query(
        r#"
        UPDATE file_regions
        SET is_removed = ?,
            classification_correctness = ?,
            detection_correctness = ?,
            ai_region_id = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(region.is_removed)
    .bind(region.classification_correctness)
    .bind(region.detection_correctness)
    .bind(region.ai_region_id)
    .bind(to_db_timestamp(&region.updated_at))
    .bind(region.id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn load_region<'e, E>(executor: E, id: i64) -> Result<Option<FileRegion>>
where
    E: SqliteExecutor<'e>,
{
    let row = sqlx::query(&format!("SELECT {} FROM file_regions WHERE id = ?", REGION_COLUMNS))
        .bind(id)
        .fetch_optional(executor)
        .await?;

    row.as_ref().map(region_from_row).transpose()
}

/// All regions (AI and feedback, removed included) of one file+model, oldest first
pub async fn load_regions_for_file_model<'e, E>(
    executor: E,
    file_id: i64,
    ml_model_id: i64,
) -> Result<Vec<FileRegion>>
where
    E: SqliteExecutor<'e>,
{
    let rows = sqlx::query(&format!(
        "SELECT {} FROM file_regions WHERE file_id = ? AND ml_model_id = ? ORDER BY id",
        REGION_COLUMNS
    ))
    .bind(file_id)
    .bind(ml_model_id)
    .fetch_all(executor)
    .await?;

    rows.iter().map(region_from_row).collect()
}

/// All regions on any of `file_ids`, ordered by id
pub async fn load_regions_for_files(pool: &SqlitePool, file_ids: &[i64]) -> Result<Vec<FileRegion>> {
    let mut regions = Vec::new();

    for chunk in file_ids.chunks(IN_CHUNK_SIZE) {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM file_regions WHERE file_id IN (",
            REGION_COLUMNS
        ));
        let mut separated = query.separated(", ");
        for id in chunk {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let rows = query.build().fetch_all(pool).await?;
        for row in &rows {
            regions.push(region_from_row(row)?);
        }
    }

    regions.sort_by_key(|r| r.id);
    Ok(regions)
}

fn region_from_row(row: &SqliteRow) -> Result<FileRegion> {
    let region: Option<String> = row.get("region");
    Ok(FileRegion {
        id: row.get("id"),
        file_id: row.get("file_id"),
        ml_model_id: row.get("ml_model_id"),
        defects: decode_json("defects", row.get::<&str, _>("defects"))?,
        region: region.as_deref().map(|r| decode_json("region", r)).transpose()?,
        is_user_feedback: row.get("is_user_feedback"),
        is_removed: row.get("is_removed"),
        classification_correctness: row.get("classification_correctness"),
        detection_correctness: row.get("detection_correctness"),
        ai_region_id: row.get("ai_region_id"),
        created_at: parse_db_timestamp(row.get::<&str, _>("created_at"))?,
        updated_at: parse_db_timestamp(row.get::<&str, _>("updated_at"))?,
    })
}
