//! Tenant database initialization
//!
//! Each tenant owns one SQLite database. Schema creation is idempotent
//! (`CREATE TABLE IF NOT EXISTS`) so opening an existing database is safe.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Current schema version recorded in `schema_version`
pub const SCHEMA_VERSION: i64 = 1;

/// Open (or create) a tenant database and ensure the schema exists
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new tenant database: {}", db_path.display());
    } else {
        info!("Opened existing tenant database: {}", db_path.display());
    }

    // WAL allows concurrent readers alongside the single region writer
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory database with the full schema
///
/// The pool is pinned to one connection that never expires; every
/// connection to `sqlite::memory:` would otherwise see its own database.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create every table and index used by classif-ai
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON").execute(pool).await?;

    create_schema_version_table(pool).await?;
    create_use_cases_table(pool).await?;
    create_defects_table(pool).await?;
    create_ml_models_table(pool).await?;
    create_ml_model_deployments_table(pool).await?;
    create_file_sets_table(pool).await?;
    create_files_table(pool).await?;
    create_file_regions_table(pool).await?;
    create_file_region_history_table(pool).await?;
    create_inference_queue_table(pool).await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_use_cases_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS use_cases (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            model_type TEXT NOT NULL,
            classification_type TEXT NOT NULL DEFAULT 'SINGLE_LABEL',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_defects_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS defects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            code TEXT NOT NULL UNIQUE
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_ml_models_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ml_models (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1,
            model_type TEXT NOT NULL,
            use_case_id INTEGER NOT NULL REFERENCES use_cases(id),
            confidence_threshold REAL,
            created_at TEXT NOT NULL,
            UNIQUE (name, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_ml_model_deployments_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ml_model_deployments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ml_model_id INTEGER NOT NULL REFERENCES ml_models(id) ON DELETE CASCADE,
            starts_at TEXT NOT NULL,
            ends_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_file_sets_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_sets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            use_case_id INTEGER NOT NULL REFERENCES use_cases(id),
            meta_info TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_files_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_set_id INTEGER NOT NULL REFERENCES file_sets(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            train_type TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_file_set ON files(file_set_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_file_regions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_regions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            ml_model_id INTEGER NOT NULL REFERENCES ml_models(id),
            defects TEXT NOT NULL,
            region TEXT,
            is_user_feedback INTEGER NOT NULL DEFAULT 0,
            is_removed INTEGER NOT NULL DEFAULT 0,
            classification_correctness INTEGER,
            detection_correctness INTEGER,
            ai_region_id INTEGER REFERENCES file_regions(id),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_file_regions_file_model ON file_regions(file_id, ml_model_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_file_regions_ai_region ON file_regions(ai_region_id)")
        .execute(pool)
        .await?;

    Ok(())
}

async fn create_file_region_history_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_region_history (
            guid TEXT PRIMARY KEY,
            file_region_id INTEGER NOT NULL REFERENCES file_regions(id) ON DELETE CASCADE,
            file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            ml_model_id INTEGER NOT NULL,
            defects TEXT NOT NULL,
            region TEXT,
            ai_region_id INTEGER,
            is_user_feedback INTEGER NOT NULL,
            is_removed INTEGER NOT NULL,
            classification_correctness INTEGER,
            detection_correctness INTEGER,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_region_history_region ON file_region_history(file_region_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_inference_queue_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS inference_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_set_id INTEGER NOT NULL REFERENCES file_sets(id) ON DELETE CASCADE,
            ml_model_id INTEGER NOT NULL REFERENCES ml_models(id),
            status TEXT NOT NULL DEFAULT 'PENDING',
            error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
