//! ML model and deployment history operations

use chrono::{DateTime, Utc};
use classif_common::db::{MlModel, MlModelDeployment, ModelType};
use classif_common::time::{parse_db_timestamp, to_db_timestamp};
use classif_common::{Error, Result};
use sqlx::{sqlite::SqliteRow, Row, SqliteExecutor, SqlitePool};

/// Model registration request
#[derive(Debug, Clone)]
pub struct NewMlModel {
    pub name: String,
    pub version: i64,
    pub model_type: ModelType,
    pub use_case_id: i64,
    pub confidence_threshold: Option<f64>,
}

pub async fn create_ml_model(pool: &SqlitePool, model: &NewMlModel) -> Result<MlModel> {
    if let Some(threshold) = model.confidence_threshold {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(Error::InvalidInput(format!(
                "confidence_threshold must be in [0, 1], got {}",
                threshold
            )));
        }
    }

    let use_case_type: Option<String> =
        sqlx::query_scalar("SELECT model_type FROM use_cases WHERE id = ?")
            .bind(model.use_case_id)
            .fetch_optional(pool)
            .await?;
    let use_case_type = use_case_type
        .ok_or_else(|| Error::NotFound(format!("use case {}", model.use_case_id)))?;
    if ModelType::parse(&use_case_type)? != model.model_type {
        return Err(Error::Validation(format!(
            "Model type {} is incompatible with use case {} ({})",
            model.model_type.as_str(),
            model.use_case_id,
            use_case_type
        )));
    }

    let created_at = Utc::now();
    let id = sqlx::query(
        r#"
        INSERT INTO ml_models (name, version, model_type, use_case_id, confidence_threshold, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&model.name)
    .bind(model.version)
    .bind(model.model_type.as_str())
    .bind(model.use_case_id)
    .bind(model.confidence_threshold)
    .bind(to_db_timestamp(&created_at))
    .execute(pool)
    .await?
    .last_insert_rowid();

    Ok(MlModel {
        id,
        name: model.name.clone(),
        version: model.version,
        model_type: model.model_type,
        use_case_id: model.use_case_id,
        confidence_threshold: model.confidence_threshold,
        created_at,
    })
}

pub async fn load_ml_model<'e, E>(executor: E, id: i64) -> Result<Option<MlModel>>
where
    E: SqliteExecutor<'e>,
{
    let row = sqlx::query(
        r#"
        SELECT id, name, version, model_type, use_case_id, confidence_threshold, created_at
        FROM ml_models
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;

    row.as_ref().map(ml_model_from_row).transpose()
}

pub async fn load_ml_models(pool: &SqlitePool) -> Result<Vec<MlModel>> {
    let rows = sqlx::query(
        r#"
        SELECT id, name, version, model_type, use_case_id, confidence_threshold, created_at
        FROM ml_models
        ORDER BY id
        "#,
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(ml_model_from_row).collect()
}

fn ml_model_from_row(row: &SqliteRow) -> Result<MlModel> {
    Ok(MlModel {
        id: row.get("id"),
        name: row.get("name"),
        version: row.get("version"),
        model_type: ModelType::parse(row.get::<&str, _>("model_type"))?,
        use_case_id: row.get("use_case_id"),
        confidence_threshold: row.get("confidence_threshold"),
        created_at: parse_db_timestamp(row.get::<&str, _>("created_at"))?,
    })
}

/// Record that a model went into production at `starts_at`
pub async fn record_deployment(
    pool: &SqlitePool,
    ml_model_id: i64,
    starts_at: DateTime<Utc>,
    ends_at: Option<DateTime<Utc>>,
) -> Result<MlModelDeployment> {
    if let Some(end) = ends_at {
        if end < starts_at {
            return Err(Error::InvalidInput(
                "Deployment cannot end before it starts".to_string(),
            ));
        }
    }

    let id = sqlx::query(
        "INSERT INTO ml_model_deployments (ml_model_id, starts_at, ends_at) VALUES (?, ?, ?)",
    )
    .bind(ml_model_id)
    .bind(to_db_timestamp(&starts_at))
    .bind(ends_at.as_ref().map(to_db_timestamp))
    .execute(pool)
    .await?
    .last_insert_rowid();

    Ok(MlModelDeployment {
        id,
        ml_model_id,
        starts_at,
        ends_at,
    })
}

pub async fn load_deployments(pool: &SqlitePool) -> Result<Vec<MlModelDeployment>> {
    let rows = sqlx::query(
        "SELECT id, ml_model_id, starts_at, ends_at FROM ml_model_deployments ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            let ends_at: Option<String> = row.get("ends_at");
            Ok(MlModelDeployment {
                id: row.get("id"),
                ml_model_id: row.get("ml_model_id"),
                starts_at: parse_db_timestamp(row.get::<&str, _>("starts_at"))?,
                ends_at: ends_at.as_deref().map(parse_db_timestamp).transpose()?,
            })
        })
        .collect()
}
