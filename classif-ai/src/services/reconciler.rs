//! Region reconciliation
//!
//! Matches a newly saved region against the opposite set (AI predictions vs
//! human feedback) on the same file and model, links the pair and updates
//! correctness flags. Every save happens inside one transaction together
//! with its history snapshot.

use classif_common::config::AnalysisSettings;
use classif_common::db::{
    single_defect, DefectMap, FileRegion, FileRegionHistory, MlModel, ModelType, RegionBox,
};
use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};

use crate::db::regions::{self, RegionDraft};
use crate::db::{files, history, ml_models};
use crate::error::{AnalysisError, AnalysisResult};
use crate::services::geometry::iou;
use crate::tenant::TenantContext;

/// Inbound region
#[derive(Debug, Clone, PartialEq)]
pub struct NewRegion {
    pub file_id: i64,
    pub ml_model_id: i64,
    pub defects: DefectMap,
    /// `None` for whole-image classification
    pub region: Option<RegionBox>,
    pub is_user_feedback: bool,
}

impl NewRegion {
    pub fn ai(file_id: i64, ml_model_id: i64, defects: DefectMap, region: Option<RegionBox>) -> Self {
        Self {
            file_id,
            ml_model_id,
            defects,
            region,
            is_user_feedback: false,
        }
    }

    pub fn feedback(
        file_id: i64,
        ml_model_id: i64,
        defects: DefectMap,
        region: Option<RegionBox>,
    ) -> Self {
        Self {
            file_id,
            ml_model_id,
            defects,
            region,
            is_user_feedback: true,
        }
    }
}

/// What reconciliation did with a region
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Saved without a counterpart
    Standalone { region_id: i64 },
    /// Saved (or re-examined) and linked feedback → AI
    Linked {
        region_id: i64,
        ai_region_id: i64,
        feedback_region_id: i64,
        iou: Option<f64>,
    },
    /// Classification feedback agreed with the AI label; nothing was stored
    Confirmed { ai_region_id: i64 },
    /// Identical active feedback already exists
    Duplicate { region_id: i64 },
    /// Nothing to do for an existing region
    Unchanged { region_id: i64 },
}

/// Reviewer correction attached to a rejected AI region
#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    pub defects: DefectMap,
    pub region: Option<RegionBox>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejectOutcome {
    pub ai_region: FileRegion,
    pub correction_region: Option<FileRegion>,
}

/// Best counterpart found for a region
struct Match {
    region: FileRegion,
    iou: Option<f64>,
}

/// Region writer for one tenant
pub struct RegionReconciler {
    db: SqlitePool,
    iou_threshold: f64,
}

impl RegionReconciler {
    pub fn new(ctx: &TenantContext, settings: &AnalysisSettings) -> Self {
        Self {
            db: ctx.db.clone(),
            iou_threshold: settings.iou_threshold,
        }
    }

    /// Save a region and reconcile it against its counterparts
    ///
    /// **Algorithm:**
    /// 1. Begin transaction, validate model, file and geometry
    /// 2. Load all regions of the same file+model
    /// 3. Feedback: skip exact resubmissions; match against AI regions that
    ///    are not removed and have no active feedback child
    /// 4. AI: match against active feedback not yet linked to an AI region
    /// 5. Persist, link, update correctness, snapshot history
    /// 6. Commit
    pub async fn create_region(&self, new: &NewRegion) -> AnalysisResult<ReconcileOutcome> {
        let mut tx = self.db.begin().await?;
        let outcome = self.reconcile_new(&mut tx, new).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Save a batch of regions inside the caller's transaction
    ///
    /// Each region is reconciled against everything saved before it, the
    /// earlier members of the batch included. Nothing is durable until the
    /// caller commits.
    pub async fn create_regions(
        &self,
        conn: &mut SqliteConnection,
        batch: &[NewRegion],
    ) -> AnalysisResult<Vec<ReconcileOutcome>> {
        let mut outcomes = Vec::with_capacity(batch.len());
        for new in batch {
            outcomes.push(self.reconcile_new(&mut *conn, new).await?);
        }
        Ok(outcomes)
    }

    async fn reconcile_new(
        &self,
        conn: &mut SqliteConnection,
        new: &NewRegion,
    ) -> AnalysisResult<ReconcileOutcome> {
        let model = load_model(conn, new.ml_model_id).await?;
        validate_shape(model.model_type, &new.defects, new.region.as_ref())?;
        if !files::file_exists(&mut *conn, new.file_id).await? {
            return Err(AnalysisError::NotFound(format!("file {}", new.file_id)));
        }

        let existing =
            regions::load_regions_for_file_model(&mut *conn, new.file_id, new.ml_model_id).await?;

        let outcome = if new.is_user_feedback {
            self.save_feedback(conn, &model, new, &existing).await?
        } else {
            self.save_ai(conn, &model, new, &existing).await?
        };

        tracing::debug!(
            file_id = new.file_id,
            ml_model_id = new.ml_model_id,
            is_user_feedback = new.is_user_feedback,
            outcome = ?outcome,
            "Region reconciled"
        );

        Ok(outcome)
    }

    /// Re-run matching for a stored region
    ///
    /// Already linked or already judged regions are left untouched, so
    /// repeated calls never add links or flip flags.
    pub async fn reconcile_existing(&self, region_id: i64) -> AnalysisResult<ReconcileOutcome> {
        let mut tx = self.db.begin().await?;

        let mut region = load_region(&mut tx, region_id).await?;
        if region.is_removed {
            return Ok(ReconcileOutcome::Unchanged { region_id });
        }

        let model = load_model(&mut tx, region.ml_model_id).await?;
        let existing =
            regions::load_regions_for_file_model(&mut *tx, region.file_id, region.ml_model_id)
                .await?;

        let outcome = if region.is_user_feedback {
            if region.ai_region_id.is_some() {
                return Ok(ReconcileOutcome::Unchanged { region_id });
            }
            let candidates = ai_candidates(&existing, Some(region.id));
            match self.best_match(model.model_type, &region.defects, region.region.as_ref(), candidates)? {
                None => ReconcileOutcome::Unchanged { region_id },
                Some(Match { region: mut ai, .. }) if model.model_type == ModelType::Classification => {
                    // Same collapse as a fresh submission: the AI label stands as ground truth
                    region.is_removed = true;
                    save(&mut tx, &mut region).await?;
                    ai.classification_correctness = Some(true);
                    save(&mut tx, &mut ai).await?;
                    ReconcileOutcome::Confirmed { ai_region_id: ai.id }
                }
                Some(Match { region: mut ai, iou }) => {
                    region.ai_region_id = Some(ai.id);
                    save(&mut tx, &mut region).await?;
                    judge_from_feedback(&mut ai, &region.defects);
                    save(&mut tx, &mut ai).await?;
                    ReconcileOutcome::Linked {
                        region_id,
                        ai_region_id: ai.id,
                        feedback_region_id: region.id,
                        iou,
                    }
                }
            }
        } else {
            let judged = region.classification_correctness.is_some()
                || region.detection_correctness.is_some();
            if judged || has_active_child(&existing, region.id) {
                return Ok(ReconcileOutcome::Unchanged { region_id });
            }
            let candidates = feedback_candidates(&existing);
            match self.best_match(model.model_type, &region.defects, region.region.as_ref(), candidates)? {
                None => ReconcileOutcome::Unchanged { region_id },
                Some(Match { region: mut feedback, iou }) => {
                    apply_exact_match(model.model_type, &mut region, &feedback);
                    save(&mut tx, &mut region).await?;
                    feedback.ai_region_id = Some(region.id);
                    save(&mut tx, &mut feedback).await?;
                    ReconcileOutcome::Linked {
                        region_id,
                        ai_region_id: region.id,
                        feedback_region_id: feedback.id,
                        iou,
                    }
                }
            }
        };

        tx.commit().await?;
        tracing::debug!(region_id, outcome = ?outcome, "Existing region reconciled");
        Ok(outcome)
    }

    /// Reviewer accepts an AI region as correct
    pub async fn confirm_ai_region(&self, ai_region_id: i64) -> AnalysisResult<FileRegion> {
        let mut tx = self.db.begin().await?;

        let mut ai = load_region(&mut tx, ai_region_id).await?;
        if ai.is_user_feedback {
            return Err(AnalysisError::BadRequest(format!(
                "Region {} is user feedback, not an AI prediction",
                ai_region_id
            )));
        }
        let model = load_model(&mut tx, ai.ml_model_id).await?;

        let detection = model.model_type.uses_boxes().then_some(true);
        if ai.classification_correctness != Some(true)
            || ai.detection_correctness != detection
            || ai.is_removed
        {
            ai.classification_correctness = Some(true);
            ai.detection_correctness = detection;
            ai.is_removed = false;
            save(&mut tx, &mut ai).await?;
        }

        tx.commit().await?;
        tracing::info!(ai_region_id, "AI region confirmed");
        Ok(ai)
    }

    /// Reviewer refutes an AI region, optionally supplying the right answer
    ///
    /// Detection models keep the AI box only when the corrected box overlaps
    /// it above the IoU threshold; otherwise the AI region is removed and the
    /// correction stands alone as a missed defect.
    pub async fn reject_ai_region(
        &self,
        ai_region_id: i64,
        correction: Option<Correction>,
    ) -> AnalysisResult<RejectOutcome> {
        let mut tx = self.db.begin().await?;

        let mut ai = load_region(&mut tx, ai_region_id).await?;
        if ai.is_user_feedback {
            return Err(AnalysisError::BadRequest(format!(
                "Region {} is user feedback, not an AI prediction",
                ai_region_id
            )));
        }
        let model = load_model(&mut tx, ai.ml_model_id).await?;
        if let Some(c) = &correction {
            validate_shape(model.model_type, &c.defects, c.region.as_ref())?;
        }

        let mut linked = true;
        ai.classification_correctness = Some(false);
        if model.model_type.uses_boxes() {
            let overlap = match (ai.region.as_ref(), correction.as_ref().and_then(|c| c.region.as_ref())) {
                (Some(a), Some(b)) => iou(a, b)?,
                _ => 0.0,
            };
            linked = overlap > self.iou_threshold;
            ai.detection_correctness = Some(linked);
            ai.is_removed = !linked;
        }

        let existing = regions::load_regions_for_file_model(&mut *tx, ai.file_id, ai.ml_model_id).await?;
        for child in existing
            .iter()
            .filter(|r| r.is_user_feedback && !r.is_removed && r.ai_region_id == Some(ai.id))
        {
            let mut child = child.clone();
            child.is_removed = true;
            save(&mut tx, &mut child).await?;
        }

        save(&mut tx, &mut ai).await?;

        let correction_region = match correction {
            Some(c) => {
                let draft = RegionDraft {
                    file_id: ai.file_id,
                    ml_model_id: ai.ml_model_id,
                    defects: c.defects,
                    region: c.region,
                    is_user_feedback: true,
                    is_removed: false,
                    classification_correctness: None,
                    detection_correctness: None,
                    ai_region_id: linked.then_some(ai.id),
                };
                Some(insert(&mut tx, &draft).await?)
            }
            None => None,
        };

        tx.commit().await?;

        tracing::info!(
            ai_region_id,
            removed = ai.is_removed,
            corrected = correction_region.is_some(),
            "AI region rejected"
        );

        Ok(RejectOutcome {
            ai_region: ai,
            correction_region,
        })
    }

    /// Withdraw a feedback region
    ///
    /// When it was the last active feedback on its AI region, the AI region
    /// goes back to unaudited.
    pub async fn remove_feedback_region(&self, region_id: i64) -> AnalysisResult<FileRegion> {
        let mut tx = self.db.begin().await?;

        let mut feedback = load_region(&mut tx, region_id).await?;
        if !feedback.is_user_feedback {
            return Err(AnalysisError::BadRequest(format!(
                "Region {} is an AI prediction; reject it instead",
                region_id
            )));
        }
        if feedback.is_removed {
            return Ok(feedback);
        }

        feedback.is_removed = true;
        save(&mut tx, &mut feedback).await?;

        if let Some(ai_id) = feedback.ai_region_id {
            let existing = regions::load_regions_for_file_model(
                &mut *tx,
                feedback.file_id,
                feedback.ml_model_id,
            )
            .await?;
            if !has_active_child(&existing, ai_id) {
                if let Some(ai) = existing.iter().find(|r| r.id == ai_id) {
                    let mut ai = ai.clone();
                    ai.classification_correctness = None;
                    ai.detection_correctness = None;
                    ai.is_removed = false;
                    save(&mut tx, &mut ai).await?;
                }
            }
        }

        tx.commit().await?;
        tracing::info!(region_id, "Feedback region removed");
        Ok(feedback)
    }

    /// Audit trail of one region, oldest first
    pub async fn region_history(&self, region_id: i64) -> AnalysisResult<Vec<FileRegionHistory>> {
        if regions::load_region(&self.db, region_id).await?.is_none() {
            return Err(AnalysisError::NotFound(format!("file region {}", region_id)));
        }
        Ok(history::load_history(&self.db, region_id).await?)
    }

    /// Store feedback, linking it to the best AI counterpart
    ///
    /// Classification feedback matches only a label-equal AI region. When
    /// the labels disagree the feedback is stored standalone and the AI
    /// region stays unaudited: it tallies as a false negative, never as a
    /// false positive, so a wrong classifier lowers recall but leaves
    /// precision untouched. The disagreement still shows up in the
    /// confusion matrix, which pairs labels per file.
    async fn save_feedback(
        &self,
        conn: &mut SqliteConnection,
        model: &MlModel,
        new: &NewRegion,
        existing: &[FileRegion],
    ) -> AnalysisResult<ReconcileOutcome> {
        if let Some(dup) = existing.iter().find(|r| {
            r.is_user_feedback
                && !r.is_removed
                && r.region == new.region
                && r.defects.keys().eq(new.defects.keys())
        }) {
            return Ok(ReconcileOutcome::Duplicate { region_id: dup.id });
        }

        let candidates = ai_candidates(existing, None);
        let found = self.best_match(model.model_type, &new.defects, new.region.as_ref(), candidates)?;

        match found {
            Some(Match { region: mut ai, .. }) if model.model_type == ModelType::Classification => {
                if ai.classification_correctness != Some(true) {
                    ai.classification_correctness = Some(true);
                    save(conn, &mut ai).await?;
                }
                Ok(ReconcileOutcome::Confirmed { ai_region_id: ai.id })
            }
            Some(Match { region: mut ai, iou }) => {
                let feedback = insert(conn, &feedback_draft(new, Some(ai.id))).await?;
                judge_from_feedback(&mut ai, &new.defects);
                save(conn, &mut ai).await?;
                Ok(ReconcileOutcome::Linked {
                    region_id: feedback.id,
                    ai_region_id: ai.id,
                    feedback_region_id: feedback.id,
                    iou,
                })
            }
            None => {
                let feedback = insert(conn, &feedback_draft(new, None)).await?;
                Ok(ReconcileOutcome::Standalone {
                    region_id: feedback.id,
                })
            }
        }
    }

    async fn save_ai(
        &self,
        conn: &mut SqliteConnection,
        model: &MlModel,
        new: &NewRegion,
        existing: &[FileRegion],
    ) -> AnalysisResult<ReconcileOutcome> {
        let candidates = feedback_candidates(existing);
        let found = self.best_match(model.model_type, &new.defects, new.region.as_ref(), candidates)?;

        let mut draft = RegionDraft {
            file_id: new.file_id,
            ml_model_id: new.ml_model_id,
            defects: new.defects.clone(),
            region: new.region,
            is_user_feedback: false,
            is_removed: false,
            classification_correctness: None,
            detection_correctness: None,
            ai_region_id: None,
        };

        match found {
            Some(Match { region: mut feedback, iou }) => {
                if is_exact_match(model.model_type, &new.defects, new.region.as_ref(), &feedback) {
                    draft.classification_correctness = Some(true);
                    draft.detection_correctness = model.model_type.uses_boxes().then_some(true);
                }
                let ai = insert(conn, &draft).await?;
                feedback.ai_region_id = Some(ai.id);
                save(conn, &mut feedback).await?;
                Ok(ReconcileOutcome::Linked {
                    region_id: ai.id,
                    ai_region_id: ai.id,
                    feedback_region_id: feedback.id,
                    iou,
                })
            }
            None => {
                let ai = insert(conn, &draft).await?;
                Ok(ReconcileOutcome::Standalone { region_id: ai.id })
            }
        }
    }

    /// Highest-IoU (or first label-equal) candidate; first seen wins ties
    fn best_match<'a>(
        &self,
        model_type: ModelType,
        defects: &DefectMap,
        region: Option<&RegionBox>,
        mut candidates: impl Iterator<Item = &'a FileRegion>,
    ) -> AnalysisResult<Option<Match>> {
        if model_type == ModelType::Classification {
            let Some(label) = single_defect(defects) else {
                return Ok(None);
            };
            return Ok(candidates
                .find(|c| c.single_defect() == Some(label))
                .map(|c| Match {
                    region: c.clone(),
                    iou: None,
                }));
        }

        let Some(region) = region else {
            return Ok(None);
        };

        let mut best: Option<(&FileRegion, f64)> = None;
        for candidate in candidates {
            let Some(other) = candidate.region.as_ref() else {
                continue;
            };
            let overlap = iou(region, other)?;
            if overlap <= self.iou_threshold {
                continue;
            }
            if best.map_or(true, |(_, b)| overlap > b) {
                best = Some((candidate, overlap));
            }
        }

        Ok(best.map(|(c, overlap)| Match {
            region: c.clone(),
            iou: Some(overlap),
        }))
    }
}

fn ai_candidates(existing: &[FileRegion], skip: Option<i64>) -> impl Iterator<Item = &FileRegion> {
    existing.iter().filter(move |r| {
        r.is_ai() && !r.is_removed && Some(r.id) != skip && !has_active_child(existing, r.id)
    })
}

fn feedback_candidates(existing: &[FileRegion]) -> impl Iterator<Item = &FileRegion> {
    existing
        .iter()
        .filter(|r| r.is_user_feedback && !r.is_removed && r.ai_region_id.is_none())
}

fn has_active_child(existing: &[FileRegion], ai_region_id: i64) -> bool {
    existing
        .iter()
        .any(|r| r.is_user_feedback && !r.is_removed && r.ai_region_id == Some(ai_region_id))
}

fn is_exact_match(
    model_type: ModelType,
    defects: &DefectMap,
    region: Option<&RegionBox>,
    feedback: &FileRegion,
) -> bool {
    let same_labels = defects.keys().eq(feedback.defects.keys());
    same_labels && (!model_type.uses_boxes() || region == feedback.region.as_ref())
}

/// Link-time verdict on a stored AI region that feedback matched by IoU
fn judge_from_feedback(ai: &mut FileRegion, feedback_defects: &DefectMap) {
    ai.detection_correctness = Some(true);
    ai.classification_correctness = Some(ai.defects.keys().eq(feedback_defects.keys()));
}

fn apply_exact_match(model_type: ModelType, ai: &mut FileRegion, feedback: &FileRegion) {
    if is_exact_match(model_type, &ai.defects, ai.region.as_ref(), feedback) {
        ai.classification_correctness = Some(true);
        ai.detection_correctness = model_type.uses_boxes().then_some(true);
    }
}

fn feedback_draft(new: &NewRegion, ai_region_id: Option<i64>) -> RegionDraft {
    RegionDraft {
        file_id: new.file_id,
        ml_model_id: new.ml_model_id,
        defects: new.defects.clone(),
        region: new.region,
        is_user_feedback: true,
        is_removed: false,
        classification_correctness: None,
        detection_correctness: None,
        ai_region_id,
    }
}

fn validate_shape(
    model_type: ModelType,
    defects: &DefectMap,
    region: Option<&RegionBox>,
) -> AnalysisResult<()> {
    if defects.is_empty() {
        return Err(AnalysisError::BadRequest(
            "A region needs at least one defect".to_string(),
        ));
    }
    match (model_type.uses_boxes(), region) {
        (true, None) => Err(AnalysisError::BadRequest(format!(
            "{} regions need a bounding box",
            model_type.as_str()
        ))),
        (true, Some(b)) if !b.is_well_formed() => Err(AnalysisError::BadRequest(format!(
            "Bounding box {:?} must have finite coordinates and positive size",
            b
        ))),
        (false, Some(_)) => Err(AnalysisError::BadRequest(
            "CLASSIFICATION regions cover the whole image and take no box".to_string(),
        )),
        _ => Ok(()),
    }
}

async fn load_model(conn: &mut SqliteConnection, ml_model_id: i64) -> AnalysisResult<MlModel> {
    ml_models::load_ml_model(&mut *conn, ml_model_id)
        .await?
        .ok_or_else(|| AnalysisError::NotFound(format!("ml model {}", ml_model_id)))
}

async fn load_region(conn: &mut SqliteConnection, region_id: i64) -> AnalysisResult<FileRegion> {
    regions::load_region(&mut *conn, region_id)
        .await?
        .ok_or_else(|| AnalysisError::NotFound(format!("file region {}", region_id)))
}

async fn insert(conn: &mut SqliteConnection, draft: &RegionDraft) -> AnalysisResult<FileRegion> {
    let region = regions::insert_region(&mut *conn, draft).await?;
    history::record_history(&mut *conn, &region).await?;
    Ok(region)
}

async fn save(conn: &mut SqliteConnection, region: &mut FileRegion) -> AnalysisResult<()> {
    regions::update_region_state(&mut *conn, region).await?;
    history::record_history(&mut *conn, region).await?;
    Ok(())
}
