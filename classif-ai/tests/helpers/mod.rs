//! Shared fixtures for classif-ai integration tests
//!
//! Every test gets its own in-memory tenant seeded with one use case, one
//! model and one file set holding a single file.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use classif_ai::db::file_sets::{create_file_set, NewFileSet};
use classif_ai::db::files::create_file;
use classif_ai::db::ml_models::{create_ml_model, NewMlModel};
use classif_ai::db::use_cases::create_use_case;
use classif_ai::TenantContext;
use classif_common::db::{
    ClassificationType, DefectDetail, DefectMap, File, FileSet, MlModel, ModelType, UseCase,
};
use serde_json::{Map, Value};

pub struct Seed {
    pub ctx: TenantContext,
    pub use_case: UseCase,
    pub model: MlModel,
    pub file_set: FileSet,
    pub file: File,
}

pub async fn seeded(model_type: ModelType) -> Seed {
    let ctx = TenantContext::in_memory("test").await.unwrap();
    let use_case = create_use_case(&ctx.db, "wafer-inspection", model_type, ClassificationType::SingleLabel)
        .await
        .unwrap();
    let model = add_model(&ctx, use_case.id, model_type, "v1").await;
    let (file_set, file) = add_file_set(&ctx, use_case.id, Value::Null, day(10)).await;

    Seed {
        ctx,
        use_case,
        model,
        file_set,
        file,
    }
}

pub async fn add_model(ctx: &TenantContext, use_case_id: i64, model_type: ModelType, name: &str) -> MlModel {
    create_ml_model(
        &ctx.db,
        &NewMlModel {
            name: name.to_string(),
            version: 1,
            model_type,
            use_case_id,
            confidence_threshold: Some(0.5),
        },
    )
    .await
    .unwrap()
}

/// File set with one file; `meta` must be a JSON object or null
pub async fn add_file_set(
    ctx: &TenantContext,
    use_case_id: i64,
    meta: Value,
    created_at: DateTime<Utc>,
) -> (FileSet, File) {
    let meta_info = match meta {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let file_set = create_file_set(
        &ctx.db,
        &NewFileSet {
            use_case_id,
            meta_info,
            created_at: Some(created_at),
        },
        ctx.meta_schema(),
    )
    .await
    .unwrap();
    let file = create_file(&ctx.db, file_set.id, &format!("img-{}.png", file_set.id), None)
        .await
        .unwrap();
    (file_set, file)
}

pub fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, d, 12, 0, 0).unwrap()
}

/// AI labels with confidences
pub fn predicted(ids: &[(i64, f64)]) -> DefectMap {
    ids.iter()
        .map(|(id, c)| (*id, DefectDetail::with_confidence(*c)))
        .collect()
}

/// Human labels (no confidence)
pub fn labeled(ids: &[i64]) -> DefectMap {
    ids.iter().map(|id| (*id, DefectDetail::default())).collect()
}
