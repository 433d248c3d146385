//! Use case database operations

use chrono::Utc;
use classif_common::db::{ClassificationType, ModelType, UseCase};
use classif_common::time::{parse_db_timestamp, to_db_timestamp};
use classif_common::Result;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

pub async fn create_use_case(
    pool: &SqlitePool,
    name: &str,
    model_type: ModelType,
    classification_type: ClassificationType,
) -> Result<UseCase> {
    let created_at = Utc::now();
    let id = sqlx::query(
        "INSERT INTO use_cases (name, model_type, classification_type, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(name)
    .bind(model_type.as_str())
    .bind(classification_type.as_str())
    .bind(to_db_timestamp(&created_at))
    .execute(pool)
    .await?
    .last_insert_rowid();

    Ok(UseCase {
        id,
        name: name.to_string(),
        model_type,
        classification_type,
        created_at,
    })
}

pub async fn load_use_cases(pool: &SqlitePool) -> Result<Vec<UseCase>> {
    let rows = sqlx::query(
        "SELECT id, name, model_type, classification_type, created_at FROM use_cases ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(use_case_from_row).collect()
}

fn use_case_from_row(row: &SqliteRow) -> Result<UseCase> {
    Ok(UseCase {
        id: row.get("id"),
        name: row.get("name"),
        model_type: ModelType::parse(row.get::<&str, _>("model_type"))?,
        classification_type: ClassificationType::parse(row.get::<&str, _>("classification_type"))?,
        created_at: parse_db_timestamp(row.get::<&str, _>("created_at"))?,
    })
}
