//! Inference queue processing
//!
//! Drives one queue entry through `PENDING → PROCESSING → FINISHED | FAILED`:
//! load the predictor, predict every file of the file set, save the
//! predictions through the reconciler and announce the batch downstream.

use std::collections::HashSet;
use std::sync::Arc;

use classif_common::config::AnalysisSettings;
use classif_common::db::{InferenceQueueEntry, InferenceStatus};
use classif_common::events::{ImageHandlerMessage, MessageBus, RegionPayload};
use serde::Serialize;
use tracing::{error, info};

use crate::db::{file_sets, files, inference_queue, ml_models, regions};
use crate::error::{AnalysisError, AnalysisResult};
use crate::services::model_registry::ModelRegistry;
use crate::services::reconciler::{NewRegion, ReconcileOutcome, RegionReconciler};
use crate::tenant::TenantContext;
use crate::utils::retry::retry_until_visible;

/// Result of a finished queue entry
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InferenceReport {
    pub entry_id: i64,
    pub file_set_id: i64,
    pub ml_model_id: i64,
    pub files_processed: usize,
    /// Files that already held predictions from this model
    pub files_skipped: usize,
    pub regions_created: usize,
    /// Predictions linked to pre-existing feedback
    pub regions_linked: usize,
}

pub struct InferenceRunner {
    ctx: TenantContext,
    settings: AnalysisSettings,
    registry: Arc<ModelRegistry>,
    bus: Option<MessageBus>,
}

impl InferenceRunner {
    pub fn new(ctx: TenantContext, settings: AnalysisSettings, registry: Arc<ModelRegistry>) -> Self {
        Self {
            ctx,
            settings,
            registry,
            bus: None,
        }
    }

    /// Announce finished batches on `bus`
    pub fn with_message_bus(mut self, bus: MessageBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Request inference of a file set with a model
    ///
    /// Rejects unknown entities, a model serving another use case and a
    /// second live request for the same pair.
    pub async fn enqueue(&self, file_set_id: i64, ml_model_id: i64) -> AnalysisResult<InferenceQueueEntry> {
        let file_set = file_sets::load_file_set(&self.ctx.db, file_set_id)
            .await?
            .ok_or_else(|| AnalysisError::NotFound(format!("file set {}", file_set_id)))?;
        let model = ml_models::load_ml_model(&self.ctx.db, ml_model_id)
            .await?
            .ok_or_else(|| AnalysisError::NotFound(format!("ml model {}", ml_model_id)))?;

        if model.use_case_id != file_set.use_case_id {
            return Err(AnalysisError::BadRequest(format!(
                "Model {} serves use case {}, file set {} belongs to use case {}",
                model.id, model.use_case_id, file_set.id, file_set.use_case_id
            )));
        }

        let entry = inference_queue::create_entry(&self.ctx.db, file_set_id, ml_model_id).await?;
        info!(
            tenant = %self.ctx.tenant,
            entry_id = entry.id,
            file_set_id,
            ml_model_id,
            "Inference enqueued"
        );
        Ok(entry)
    }

    /// Process one queue entry to completion
    ///
    /// Predictions are computed first, then saved together with the
    /// FINISHED transition in one transaction. Any failure after the entry
    /// was claimed leaves no regions behind, marks the entry FAILED with
    /// the error text and is returned to the caller.
    pub async fn run(&self, entry_id: i64) -> AnalysisResult<InferenceReport> {
        let entry = retry_until_visible(
            "inference queue entry",
            self.settings.queue_visibility_max_attempts,
            self.settings.queue_visibility_base_delay_ms,
            || inference_queue::load_entry(&self.ctx.db, entry_id),
        )
        .await?;

        if entry.status != InferenceStatus::Pending {
            return Err(AnalysisError::Conflict(format!(
                "Inference queue entry {} is {}, expected PENDING",
                entry_id,
                entry.status.as_str()
            )));
        }

        inference_queue::update_status(&self.ctx.db, entry_id, InferenceStatus::Processing, None).await?;

        let (report, payloads) = match self.process(&entry).await {
            Ok(done) => done,
            Err(err) => {
                self.mark_failed(entry_id, &err).await;
                return Err(err);
            }
        };

        if let Some(bus) = &self.bus {
            bus.publish_lossy(ImageHandlerMessage::ModelInference {
                file_set: entry.file_set_id,
                ml_model: entry.ml_model_id,
                file_regions: payloads,
            });
        }

        info!(
            tenant = %self.ctx.tenant,
            entry_id,
            files = report.files_processed,
            skipped = report.files_skipped,
            regions = report.regions_created,
            linked = report.regions_linked,
            "Inference finished"
        );
        Ok(report)
    }

    async fn mark_failed(&self, entry_id: i64, err: &AnalysisError) {
        error!(tenant = %self.ctx.tenant, entry_id, error = %err, "Inference failed");
        if let Err(mark_err) = inference_queue::update_status(
            &self.ctx.db,
            entry_id,
            InferenceStatus::Failed,
            Some(&err.to_string()),
        )
        .await
        {
            error!(entry_id, error = %mark_err, "Could not mark inference entry FAILED");
        }
    }

    /// Predict, then save the batch and finish the entry atomically
    ///
    /// Files that already carry regions of this model are skipped, so a
    /// retried request never stacks a second prediction on a file.
    async fn process(&self, entry: &InferenceQueueEntry) -> AnalysisResult<(InferenceReport, Vec<RegionPayload>)> {
        let model = ml_models::load_ml_model(&self.ctx.db, entry.ml_model_id)
            .await?
            .ok_or_else(|| AnalysisError::NotFound(format!("ml model {}", entry.ml_model_id)))?;
        let predictor = self.registry.get_or_load(&self.ctx.tenant, &model).await?;
        let reconciler = RegionReconciler::new(&self.ctx, &self.settings);

        let mut report = InferenceReport {
            entry_id: entry.id,
            file_set_id: entry.file_set_id,
            ml_model_id: entry.ml_model_id,
            ..InferenceReport::default()
        };

        let file_list = files::load_files_for_file_sets(&self.ctx.db, &[entry.file_set_id]).await?;
        let file_ids: Vec<i64> = file_list.iter().map(|f| f.id).collect();
        let predicted: HashSet<i64> = regions::load_regions_for_files(&self.ctx.db, &file_ids)
            .await?
            .into_iter()
            .filter(|r| r.is_ai() && r.ml_model_id == model.id)
            .map(|r| r.file_id)
            .collect();

        let mut batch = Vec::new();
        for file in &file_list {
            if predicted.contains(&file.id) {
                report.files_skipped += 1;
                continue;
            }
            for prediction in predictor.predict(file).await? {
                batch.push(NewRegion::ai(file.id, model.id, prediction.defects, prediction.region));
            }
            report.files_processed += 1;
        }

        let mut tx = self.ctx.db.begin().await?;
        let outcomes = reconciler.create_regions(&mut tx, &batch).await?;
        inference_queue::transition(&mut tx, entry.id, InferenceStatus::Finished, None).await?;
        tx.commit().await?;

        report.regions_created = outcomes.len();
        report.regions_linked = outcomes
            .iter()
            .filter(|o| matches!(o, ReconcileOutcome::Linked { .. }))
            .count();

        let payloads = batch
            .into_iter()
            .map(|new| RegionPayload {
                file_id: new.file_id,
                defects: new.defects,
                region: new.region,
            })
            .collect();

        Ok((report, payloads))
    }
}
