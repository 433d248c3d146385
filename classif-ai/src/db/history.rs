//! Append-only region history

use chrono::Utc;
use classif_common::db::{FileRegion, FileRegionHistory};
use classif_common::time::{parse_db_timestamp, to_db_timestamp};
use classif_common::{Error, Result};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection, SqliteExecutor};
use uuid::Uuid;

use super::decode_json;

/// Snapshot the current state of `region`
pub async fn record_history(conn: &mut SqliteConnection, region: &FileRegion) -> Result<FileRegionHistory> {
    let entry = FileRegionHistory {
        guid: Uuid::new_v4(),
        file_region_id: region.id,
        file_id: region.file_id,
        ml_model_id: region.ml_model_id,
        defects: region.defects.clone(),
        region: region.region,
        ai_region_id: region.ai_region_id,
        is_user_feedback: region.is_user_feedback,
        is_removed: region.is_removed,
        classification_correctness: region.classification_correctness,
        detection_correctness: region.detection_correctness,
        created_at: Utc::now(),
    };

    sqlx::query(
        r#"
        INSERT INTO file_region_history (
            guid, file_region_id, file_id, ml_model_id, defects, region, ai_region_id,
            is_user_feedback, is_removed, classification_correctness, detection_correctness,
            created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(entry.guid.to_string())
    .bind(entry.file_region_id)
    .bind(entry.file_id)
    .bind(entry.ml_model_id)
    .bind(serde_json::to_string(&entry.defects)?)
    .bind(entry.region.as_ref().map(serde_json::to_string).transpose()?)
    .bind(entry.ai_region_id)
    .bind(entry.is_user_feedback)
    .bind(entry.is_removed)
    .bind(entry.classification_correctness)
    .bind(entry.detection_correctness)
    .bind(to_db_timestamp(&entry.created_at))
    .execute(&mut *conn)
    .await?;

    Ok(entry)
}

/// History of one region, oldest snapshot first
pub async fn load_history<'e, E>(executor: E, file_region_id: i64) -> Result<Vec<FileRegionHistory>>
where
    E: SqliteExecutor<'e>,
{
    let rows = sqlx::query(
        r#"
        SELECT guid, file_region_id, file_id, ml_model_id, defects, region, ai_region_id,
               is_user_feedback, is_removed, classification_correctness, detection_correctness,
               created_at
        FROM file_region_history
        WHERE file_region_id = ?
        ORDER BY created_at, rowid
        "#,
    )
    .bind(file_region_id)
    .fetch_all(executor)
    .await?;

    rows.iter().map(history_from_row).collect()
}

fn history_from_row(row: &SqliteRow) -> Result<FileRegionHistory> {
    let guid: String = row.get("guid");
    let region: Option<String> = row.get("region");
    Ok(FileRegionHistory {
        guid: Uuid::parse_str(&guid)
            .map_err(|e| Error::Internal(format!("Invalid history guid '{}': {}", guid, e)))?,
        file_region_id: row.get("file_region_id"),
        file_id: row.get("file_id"),
        ml_model_id: row.get("ml_model_id"),
        defects: decode_json("defects", row.get::<&str, _>("defects"))?,
        region: region.as_deref().map(|r| decode_json("region", r)).transpose()?,
        ai_region_id: row.get("ai_region_id"),
        is_user_feedback: row.get("is_user_feedback"),
        is_removed: row.get("is_removed"),
        classification_correctness: row.get("classification_correctness"),
        detection_correctness: row.get("detection_correctness"),
        created_at: parse_db_timestamp(row.get::<&str, _>("created_at"))?,
    })
}
