//! Inference queue entries
//!
//! One entry per (file set, model) request. A new entry is refused while a
//! non-FAILED entry exists for the same pair.

use chrono::Utc;
use classif_common::db::{InferenceQueueEntry, InferenceStatus};
use classif_common::time::{parse_db_timestamp, to_db_timestamp};
use classif_common::{Error, Result};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection, SqliteExecutor, SqlitePool};

const ENTRY_COLUMNS: &str = "id, file_set_id, ml_model_id, status, error, created_at, updated_at";

/// Insert a PENDING entry, rejecting duplicates of live requests
pub async fn create_entry(pool: &SqlitePool, file_set_id: i64, ml_model_id: i64) -> Result<InferenceQueueEntry> {
    let mut tx = pool.begin().await?;

    let existing: Option<(i64, String)> = sqlx::query_as(
        r#"
        SELECT id, status FROM inference_queue
        WHERE file_set_id = ? AND ml_model_id = ? AND status != 'FAILED'
        ORDER BY id
        LIMIT 1
        "#,
    )
    .bind(file_set_id)
    .bind(ml_model_id)
    .fetch_optional(&mut *tx)
    .await?;

    if let Some((id, status)) = existing {
        return Err(Error::Validation(format!(
            "Inference for file set {} with model {} already requested (entry {}, {})",
            file_set_id, ml_model_id, id, status
        )));
    }

    let now = Utc::now();
    let ts = to_db_timestamp(&now);
    let id = sqlx::query(
        r#"
        INSERT INTO inference_queue (file_set_id, ml_model_id, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(file_set_id)
    .bind(ml_model_id)
    .bind(InferenceStatus::Pending.as_str())
    .bind(&ts)
    .bind(&ts)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    tx.commit().await?;

    Ok(InferenceQueueEntry {
        id,
        file_set_id,
        ml_model_id,
        status: InferenceStatus::Pending,
        error: None,
        created_at: now,
        updated_at: now,
    })
}

pub async fn load_entry<'e, E>(executor: E, id: i64) -> Result<Option<InferenceQueueEntry>>
where
    E: SqliteExecutor<'e>,
{
    let row = sqlx::query(&format!("SELECT {} FROM inference_queue WHERE id = ?", ENTRY_COLUMNS))
        .bind(id)
        .fetch_optional(executor)
        .await?;

    row.as_ref().map(entry_from_row).transpose()
}

pub async fn load_entries(pool: &SqlitePool) -> Result<Vec<InferenceQueueEntry>> {
    let rows = sqlx::query(&format!("SELECT {} FROM inference_queue ORDER BY id", ENTRY_COLUMNS))
        .fetch_all(pool)
        .await?;

    rows.iter().map(entry_from_row).collect()
}

/// Move an entry to `next`, enforcing the forward-only status machine
///
/// The compare-and-set on the previous status makes a concurrent transition
/// surface as a `Conflict` rather than a silent overwrite.
pub async fn update_status(
    pool: &SqlitePool,
    id: i64,
    next: InferenceStatus,
    error: Option<&str>,
) -> Result<InferenceQueueEntry> {
    let mut tx = pool.begin().await?;
    let (entry, previous) = transition(&mut tx, id, next, error).await?;
    tx.commit().await?;

    tracing::info!(
        entry_id = id,
        from = previous.as_str(),
        to = next.as_str(),
        "Inference queue transition"
    );

    Ok(entry)
}

/// Status change inside the caller's transaction
///
/// Returns the updated entry and the status it left. Nothing is logged;
/// the caller knows when the change becomes durable.
pub async fn transition(
    conn: &mut SqliteConnection,
    id: i64,
    next: InferenceStatus,
    error: Option<&str>,
) -> Result<(InferenceQueueEntry, InferenceStatus)> {
    let mut entry = load_entry(&mut *conn, id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("inference queue entry {}", id)))?;
    let previous = entry.status;

    if !previous.can_transition_to(next) {
        return Err(Error::Conflict(format!(
            "Inference queue entry {} cannot move from {} to {}",
            id,
            previous.as_str(),
            next.as_str()
        )));
    }

    let now = Utc::now();
    let updated = sqlx::query(
        "UPDATE inference_queue SET status = ?, error = ?, updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(next.as_str())
    .bind(error)
    .bind(to_db_timestamp(&now))
    .bind(id)
    .bind(previous.as_str())
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if updated != 1 {
        return Err(Error::Conflict(format!(
            "Inference queue entry {} changed concurrently",
            id
        )));
    }

    entry.status = next;
    entry.error = error.map(str::to_string);
    entry.updated_at = now;
    Ok((entry, previous))
}

fn entry_from_row(row: &SqliteRow) -> Result<InferenceQueueEntry> {
    Ok(InferenceQueueEntry {
        id: row.get("id"),
        file_set_id: row.get("file_set_id"),
        ml_model_id: row.get("ml_model_id"),
        status: InferenceStatus::parse(row.get::<&str, _>("status"))?,
        error: row.get("error"),
        created_at: parse_db_timestamp(row.get::<&str, _>("created_at"))?,
        updated_at: parse_db_timestamp(row.get::<&str, _>("updated_at"))?,
    })
}
