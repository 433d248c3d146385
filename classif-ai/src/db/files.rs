//! Image file operations

use chrono::Utc;
use classif_common::db::File;
use classif_common::time::{parse_db_timestamp, to_db_timestamp};
use classif_common::Result;
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqliteExecutor, SqlitePool};

use super::IN_CHUNK_SIZE;

pub async fn create_file(
    pool: &SqlitePool,
    file_set_id: i64,
    name: &str,
    train_type: Option<&str>,
) -> Result<File> {
    let created_at = Utc::now();
    let id = sqlx::query("INSERT INTO files (file_set_id, name, train_type, created_at) VALUES (?, ?, ?, ?)")
        .bind(file_set_id)
        .bind(name)
        .bind(train_type)
        .bind(to_db_timestamp(&created_at))
        .execute(pool)
        .await?
        .last_insert_rowid();

    Ok(File {
        id,
        file_set_id,
        name: name.to_string(),
        train_type: train_type.map(str::to_string),
        created_at,
    })
}

pub async fn file_exists<'e, E>(executor: E, file_id: i64) -> Result<bool>
where
    E: SqliteExecutor<'e>,
{
    let found: Option<i64> = sqlx::query_scalar("SELECT id FROM files WHERE id = ?")
        .bind(file_id)
        .fetch_optional(executor)
        .await?;
    Ok(found.is_some())
}

/// Files belonging to any of `file_set_ids`, ordered by id
pub async fn load_files_for_file_sets(pool: &SqlitePool, file_set_ids: &[i64]) -> Result<Vec<File>> {
    let mut files = Vec::new();

    for chunk in file_set_ids.chunks(IN_CHUNK_SIZE) {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, file_set_id, name, train_type, created_at FROM files WHERE file_set_id IN (",
        );
        let mut separated = query.separated(", ");
        for id in chunk {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let rows = query.build().fetch_all(pool).await?;
        for row in &rows {
            files.push(file_from_row(row)?);
        }
    }

    files.sort_by_key(|f| f.id);
    Ok(files)
}

fn file_from_row(row: &SqliteRow) -> Result<File> {
    Ok(File {
        id: row.get("id"),
        file_set_id: row.get("file_set_id"),
        name: row.get("name"),
        train_type: row.get("train_type"),
        created_at: parse_db_timestamp(row.get::<&str, _>("created_at"))?,
    })
}
