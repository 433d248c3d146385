//! Inference queue lifecycle with stub predictors

mod helpers;

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use classif_ai::db::inference_queue::{load_entry, update_status};
use classif_ai::db::files::create_file;
use classif_ai::db::regions::load_regions_for_file_model;
use classif_ai::db::use_cases::create_use_case;
use classif_ai::services::{InferenceRunner, ModelLoader, ModelRegistry, Prediction, Predictor};
use classif_common::config::AnalysisSettings;
use classif_common::db::{ClassificationType, File, InferenceStatus, MlModel, ModelType};
use classif_common::events::{ImageHandlerMessage, MessageBus};
use helpers::{add_model, labeled, predicted, seeded, Seed};

struct FixedPredictor;

#[async_trait]
impl Predictor for FixedPredictor {
    async fn predict(&self, _file: &File) -> anyhow::Result<Vec<Prediction>> {
        Ok(vec![Prediction {
            defects: predicted(&[(1, 0.9)]),
            region: None,
        }])
    }
}

struct BrokenPredictor;

#[async_trait]
impl Predictor for BrokenPredictor {
    async fn predict(&self, _file: &File) -> anyhow::Result<Vec<Prediction>> {
        Err(anyhow::anyhow!("camera offline"))
    }
}

/// Fails on the second prediction only
struct FlakyPredictor {
    calls: AtomicUsize,
}

#[async_trait]
impl Predictor for FlakyPredictor {
    async fn predict(&self, _file: &File) -> anyhow::Result<Vec<Prediction>> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 1 {
            return Err(anyhow::anyhow!("socket reset"));
        }
        Ok(vec![Prediction {
            defects: predicted(&[(1, 0.9)]),
            region: None,
        }])
    }
}

/// Marks its queue entry FAILED while predicting, as an operator cancel would
struct CancellingPredictor {
    db: sqlx::SqlitePool,
    entry_id: AtomicI64,
}

#[async_trait]
impl Predictor for CancellingPredictor {
    async fn predict(&self, _file: &File) -> anyhow::Result<Vec<Prediction>> {
        let entry_id = self.entry_id.load(Ordering::SeqCst);
        update_status(&self.db, entry_id, InferenceStatus::Failed, Some("cancelled by operator")).await?;
        Ok(vec![Prediction {
            defects: predicted(&[(1, 0.9)]),
            region: None,
        }])
    }
}

struct StaticLoader(Arc<dyn Predictor>);

#[async_trait]
impl ModelLoader for StaticLoader {
    async fn load(&self, _tenant: &str, _model: &MlModel) -> anyhow::Result<Arc<dyn Predictor>> {
        Ok(Arc::clone(&self.0))
    }
}

fn settings() -> AnalysisSettings {
    AnalysisSettings {
        queue_visibility_max_attempts: 2,
        queue_visibility_base_delay_ms: 1,
        ..AnalysisSettings::default()
    }
}

fn runner(seed: &Seed, predictor: Arc<dyn Predictor>) -> InferenceRunner {
    let registry = Arc::new(ModelRegistry::new(Arc::new(StaticLoader(predictor)), 4));
    InferenceRunner::new(seed.ctx.clone(), settings(), registry)
}

#[tokio::test]
async fn test_duplicate_request_is_rejected_until_failed() {
    let seed = seeded(ModelType::Classification).await;
    let runner = runner(&seed, Arc::new(FixedPredictor));

    let entry = runner.enqueue(seed.file_set.id, seed.model.id).await.unwrap();
    assert_eq!(entry.status, InferenceStatus::Pending);

    let err = runner.enqueue(seed.file_set.id, seed.model.id).await.unwrap_err();
    assert_eq!(err.status_code(), 400);

    update_status(&seed.ctx.db, entry.id, InferenceStatus::Failed, Some("gpu lost"))
        .await
        .unwrap();
    runner.enqueue(seed.file_set.id, seed.model.id).await.unwrap();
}

#[tokio::test]
async fn test_model_from_another_use_case_is_rejected() {
    let seed = seeded(ModelType::Classification).await;
    let other = create_use_case(&seed.ctx.db, "bumps", ModelType::Detection, ClassificationType::SingleLabel)
        .await
        .unwrap();
    let foreign = add_model(&seed.ctx, other.id, ModelType::Detection, "bump-v1").await;

    let err = runner(&seed, Arc::new(FixedPredictor))
        .enqueue(seed.file_set.id, foreign.id)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);
}

#[tokio::test]
async fn test_run_saves_predictions_and_notifies() {
    let seed = seeded(ModelType::Classification).await;
    let bus = MessageBus::new(8);
    let mut rx = bus.subscribe();
    let runner = runner(&seed, Arc::new(FixedPredictor)).with_message_bus(bus);

    // feedback arrives before the model runs
    classif_ai::services::RegionReconciler::new(&seed.ctx, &settings())
        .create_region(&classif_ai::services::NewRegion::feedback(
            seed.file.id,
            seed.model.id,
            labeled(&[1]),
            None,
        ))
        .await
        .unwrap();

    let entry = runner.enqueue(seed.file_set.id, seed.model.id).await.unwrap();
    let report = runner.run(entry.id).await.unwrap();

    assert_eq!(report.files_processed, 1);
    assert_eq!(report.regions_created, 1);
    assert_eq!(report.regions_linked, 1);

    let stored = load_entry(&seed.ctx.db, entry.id).await.unwrap().unwrap();
    assert_eq!(stored.status, InferenceStatus::Finished);

    let regions = load_regions_for_file_model(&seed.ctx.db, seed.file.id, seed.model.id)
        .await
        .unwrap();
    let ai = regions.iter().find(|r| r.is_ai()).unwrap();
    assert_eq!(ai.classification_correctness, Some(true));

    let ImageHandlerMessage::ModelInference {
        file_set,
        ml_model,
        file_regions,
    } = rx.recv().await.unwrap();
    assert_eq!((file_set, ml_model), (seed.file_set.id, seed.model.id));
    assert_eq!(file_regions.len(), 1);
    assert_eq!(file_regions[0].file_id, seed.file.id);

    // a finished entry cannot be run again
    assert_eq!(runner.run(entry.id).await.unwrap_err().status_code(), 409);
}

#[tokio::test]
async fn test_predictor_failure_marks_entry_failed() {
    let seed = seeded(ModelType::Classification).await;
    let runner = runner(&seed, Arc::new(BrokenPredictor));

    let entry = runner.enqueue(seed.file_set.id, seed.model.id).await.unwrap();
    let err = runner.run(entry.id).await.unwrap_err();
    assert_eq!(err.status_code(), 500);

    let stored = load_entry(&seed.ctx.db, entry.id).await.unwrap().unwrap();
    assert_eq!(stored.status, InferenceStatus::Failed);
    assert!(stored.error.unwrap().contains("camera offline"));
}

#[tokio::test]
async fn test_missing_entry_is_not_found_after_retries() {
    let seed = seeded(ModelType::Classification).await;
    let err = runner(&seed, Arc::new(FixedPredictor)).run(4242).await.unwrap_err();
    assert_eq!(err.status_code(), 404);
}

#[tokio::test]
async fn test_status_transitions_are_forward_only() {
    let seed = seeded(ModelType::Classification).await;
    let entry = runner(&seed, Arc::new(FixedPredictor))
        .enqueue(seed.file_set.id, seed.model.id)
        .await
        .unwrap();

    let err = update_status(&seed.ctx.db, entry.id, InferenceStatus::Finished, None)
        .await
        .unwrap_err();
    assert!(matches!(err, classif_common::Error::Conflict(_)));

    update_status(&seed.ctx.db, entry.id, InferenceStatus::Processing, None)
        .await
        .unwrap();
    update_status(&seed.ctx.db, entry.id, InferenceStatus::Finished, None)
        .await
        .unwrap();
    assert!(update_status(&seed.ctx.db, entry.id, InferenceStatus::Pending, None)
        .await
        .is_err());
}

async fn ai_regions_per_file(seed: &Seed, file_ids: &[i64]) -> Vec<usize> {
    let mut counts = Vec::new();
    for file_id in file_ids {
        let regions = load_regions_for_file_model(&seed.ctx.db, *file_id, seed.model.id)
            .await
            .unwrap();
        counts.push(regions.iter().filter(|r| r.is_ai()).count());
    }
    counts
}

#[tokio::test]
async fn test_failed_run_leaves_no_regions_and_retry_saves_once() {
    let seed = seeded(ModelType::Classification).await;
    let second = create_file(&seed.ctx.db, seed.file_set.id, "img-second.png", None)
        .await
        .unwrap();
    let file_ids = [seed.file.id, second.id];
    let runner = runner(
        &seed,
        Arc::new(FlakyPredictor {
            calls: AtomicUsize::new(0),
        }),
    );

    let first = runner.enqueue(seed.file_set.id, seed.model.id).await.unwrap();
    assert!(runner.run(first.id).await.is_err());
    assert_eq!(ai_regions_per_file(&seed, &file_ids).await, vec![0, 0]);

    let retry = runner.enqueue(seed.file_set.id, seed.model.id).await.unwrap();
    let report = runner.run(retry.id).await.unwrap();
    assert_eq!(report.files_processed, 2);
    assert_eq!(report.regions_created, 2);
    assert_eq!(ai_regions_per_file(&seed, &file_ids).await, vec![1, 1]);
}

#[tokio::test]
async fn test_files_with_existing_predictions_are_skipped() {
    let seed = seeded(ModelType::Classification).await;
    classif_ai::services::RegionReconciler::new(&seed.ctx, &settings())
        .create_region(&classif_ai::services::NewRegion::ai(
            seed.file.id,
            seed.model.id,
            predicted(&[(1, 0.8)]),
            None,
        ))
        .await
        .unwrap();

    let runner = runner(&seed, Arc::new(FixedPredictor));
    let entry = runner.enqueue(seed.file_set.id, seed.model.id).await.unwrap();
    let report = runner.run(entry.id).await.unwrap();

    assert_eq!((report.files_processed, report.files_skipped), (0, 1));
    assert_eq!(report.regions_created, 0);
    assert_eq!(ai_regions_per_file(&seed, &[seed.file.id]).await, vec![1]);
}

#[tokio::test]
async fn test_finish_conflict_rolls_back_saved_regions() {
    let seed = seeded(ModelType::Classification).await;
    let predictor = Arc::new(CancellingPredictor {
        db: seed.ctx.db.clone(),
        entry_id: AtomicI64::new(0),
    });
    let runner = runner(&seed, predictor.clone());

    let entry = runner.enqueue(seed.file_set.id, seed.model.id).await.unwrap();
    predictor.entry_id.store(entry.id, Ordering::SeqCst);

    let err = runner.run(entry.id).await.unwrap_err();
    assert_eq!(err.status_code(), 409);

    let stored = load_entry(&seed.ctx.db, entry.id).await.unwrap().unwrap();
    assert_eq!(stored.status, InferenceStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("cancelled by operator"));
    assert_eq!(ai_regions_per_file(&seed, &[seed.file.id]).await, vec![0]);
}
