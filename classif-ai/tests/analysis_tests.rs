//! Analytics over reconciled regions stored in a tenant database

mod helpers;

use classif_ai::db::ml_models::record_deployment;
use classif_ai::services::analysis::MetricValue;
use classif_ai::services::{AnalysisService, Correction, FilterCriteria, NewRegion, RegionReconciler};
use classif_common::config::AnalysisSettings;
use classif_common::db::ModelType;
use helpers::{add_file_set, add_model, day, labeled, predicted, seeded, Seed};
use pretty_assertions::assert_eq;
use serde_json::json;

async fn analyze(seed: &Seed, query: &str) -> AnalysisService {
    let filters = FilterCriteria::from_query_string(query).unwrap();
    AnalysisService::load(&seed.ctx, filters, AnalysisSettings::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_confirmed_classification_is_one_true_positive() {
    let seed = seeded(ModelType::Classification).await;
    let r = RegionReconciler::new(&seed.ctx, &AnalysisSettings::default());
    r.create_region(&NewRegion::ai(seed.file.id, seed.model.id, predicted(&[(1, 0.9)]), None))
        .await
        .unwrap();
    r.create_region(&NewRegion::feedback(seed.file.id, seed.model.id, labeled(&[1]), None))
        .await
        .unwrap();

    let service = analyze(&seed, &format!("ml_model_id__in={}", seed.model.id)).await;
    let summary = service.summary();

    assert_eq!(
        (summary.true_positives, summary.false_positives, summary.false_negatives),
        (1, 0, 0)
    );
    assert_eq!(summary.overall_accuracy, MetricValue::Value(100.0));
    assert_eq!(summary.precision, MetricValue::Value(1.0));
    assert_eq!(summary.recall, MetricValue::Value(1.0));
    assert_eq!(summary.automation_rate, MetricValue::Value(100.0));
}

#[tokio::test]
async fn test_rejected_prediction_counts_false_positive_and_negative() {
    let seed = seeded(ModelType::Classification).await;
    let r = RegionReconciler::new(&seed.ctx, &AnalysisSettings::default());
    let ai = r
        .create_region(&NewRegion::ai(seed.file.id, seed.model.id, predicted(&[(1, 0.9)]), None))
        .await
        .unwrap();
    let classif_ai::services::ReconcileOutcome::Standalone { region_id } = ai else {
        panic!("unexpected outcome {:?}", ai);
    };
    r.reject_ai_region(
        region_id,
        Some(Correction {
            defects: labeled(&[2]),
            region: None,
        }),
    )
    .await
    .unwrap();

    let service = analyze(&seed, &format!("ml_model_id__in={}", seed.model.id)).await;
    let tally = service.tally();
    assert_eq!(
        (tally.true_positives, tally.false_positives, tally.false_negatives),
        (0, 1, 1)
    );
    assert_eq!(service.overall_accuracy(), MetricValue::Value(0.0));
    assert_eq!(service.false_positive_regions().len(), 1);
    assert_eq!(service.false_negative_regions().len(), 1);

    let matrix = service.confusion_matrix();
    assert_eq!(matrix.count(2, 1), 1);
}

#[tokio::test]
async fn test_unaudited_data_reports_not_applicable() {
    let seed = seeded(ModelType::Classification).await;
    let r = RegionReconciler::new(&seed.ctx, &AnalysisSettings::default());
    r.create_region(&NewRegion::ai(seed.file.id, seed.model.id, predicted(&[(1, 0.9)]), None))
        .await
        .unwrap();

    let service = analyze(&seed, &format!("ml_model_id__in={}", seed.model.id)).await;
    let summary = service.summary();
    assert!(summary.overall_accuracy.is_not_applicable());
    assert!(summary.precision.is_not_applicable());

    let value = serde_json::to_value(&summary).unwrap();
    assert_eq!(value["overall_accuracy"], json!("N/A"));
}

#[tokio::test]
async fn test_model_filter_is_mandatory() {
    let seed = seeded(ModelType::Classification).await;
    let filters = FilterCriteria::from_query_string("date__gte=2024-01-01").unwrap();

    let err = AnalysisService::load(&seed.ctx, filters, AnalysisSettings::default())
        .await
        .err()
        .unwrap();
    assert_eq!(err.status_code(), 400);

    let unknown = FilterCriteria::from_query_string("model=1").unwrap_err();
    assert_eq!(unknown.status_code(), 400);
}

#[tokio::test]
async fn test_auto_model_prefers_latest_deployment() {
    let seed = seeded(ModelType::Classification).await;
    let newer = add_model(&seed.ctx, seed.use_case.id, ModelType::Classification, "v2").await;
    record_deployment(&seed.ctx.db, seed.model.id, day(1), Some(day(4)))
        .await
        .unwrap();
    record_deployment(&seed.ctx.db, newer.id, day(5), None).await.unwrap();

    let r = RegionReconciler::new(&seed.ctx, &AnalysisSettings::default());
    for model_id in [seed.model.id, newer.id] {
        r.create_region(&NewRegion::ai(seed.file.id, model_id, predicted(&[(1, 0.9)]), None))
            .await
            .unwrap();
    }

    let service = analyze(&seed, "auto_model=true").await;
    assert_eq!(service.model_selection().get(&seed.file_set.id), Some(&newer.id));
    assert_eq!(service.ml_models().iter().map(|m| m.id).collect::<Vec<_>>(), vec![newer.id]);
    assert!(service.ai_regions().iter().all(|r| r.ml_model_id == newer.id));
}

#[tokio::test]
async fn test_meta_info_and_date_filters() {
    let seed = seeded(ModelType::Classification).await;
    let (lot_a, _) = add_file_set(&seed.ctx, seed.use_case.id, json!({"LotId": "A"}), day(11)).await;
    add_file_set(&seed.ctx, seed.use_case.id, json!({"LotId": "B"}), day(11)).await;
    add_file_set(&seed.ctx, seed.use_case.id, json!({"LotId": "A"}), day(20)).await;

    let service = analyze(
        &seed,
        &format!(
            "ml_model_id__in={}&meta_info__LotId__in=A&date__lte=2024-01-15",
            seed.model.id
        ),
    )
    .await;
    assert_eq!(service.file_sets().iter().map(|fs| fs.id).collect::<Vec<_>>(), vec![lot_a.id]);
    assert_eq!(service.files().len(), 1);
}
