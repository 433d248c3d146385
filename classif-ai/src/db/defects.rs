//! Defect catalogue operations

use classif_common::db::Defect;
use classif_common::Result;
use sqlx::{Row, SqlitePool};

pub async fn create_defect(pool: &SqlitePool, name: &str, code: &str) -> Result<Defect> {
    let id = sqlx::query("INSERT INTO defects (name, code) VALUES (?, ?)")
        .bind(name)
        .bind(code)
        .execute(pool)
        .await?
        .last_insert_rowid();

    Ok(Defect {
        id,
        name: name.to_string(),
        code: code.to_string(),
    })
}

pub async fn load_defects(pool: &SqlitePool) -> Result<Vec<Defect>> {
    let rows = sqlx::query("SELECT id, name, code FROM defects ORDER BY id")
        .fetch_all(pool)
        .await?;

    Ok(rows
        .iter()
        .map(|row| Defect {
            id: row.get("id"),
            name: row.get("name"),
            code: row.get("code"),
        })
        .collect())
}
