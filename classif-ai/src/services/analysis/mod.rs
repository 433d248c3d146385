//! Performance and analytics aggregation
//!
//! `AnalysisService::load` snapshots everything the filters select in one
//! pass; every derived set after that is a pure function of the snapshot,
//! computed on first use and memoized for the lifetime of the instance.

pub mod confusion;
pub mod distribution;
pub mod metrics;
pub mod trends;
pub mod yield_loss;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use classif_common::config::AnalysisSettings;
use classif_common::db::{
    DefectId, Defect, File, FileRegion, FileSet, InferenceQueueEntry, MlModel, MlModelDeployment,
    ModelType, UseCase,
};
use once_cell::unsync::OnceCell;
use tracing::debug;

use crate::db::{defects, file_sets, files, inference_queue, ml_models, regions, use_cases};
use crate::error::AnalysisResult;
use crate::services::filters::FilterCriteria;
use crate::tenant::TenantContext;

pub use confusion::{ConfusionCell, ConfusionMatrix, FileLabel};
pub use metrics::{DefectMetrics, MetricValue, MetricsSummary, Tally};
pub use trends::{OverkillPoint, TrendPoint};
pub use yield_loss::{YieldGroupBy, YieldLossByDefectRow, YieldLossRow};

pub struct AnalysisService {
    filters: FilterCriteria,
    settings: AnalysisSettings,

    defects: Vec<Defect>,
    use_cases: HashMap<i64, UseCase>,
    models: HashMap<i64, MlModel>,
    deployments: Vec<MlModelDeployment>,
    queue: Vec<InferenceQueueEntry>,
    file_sets: Vec<FileSet>,
    files: Vec<File>,
    regions: Vec<FileRegion>,
    file_to_set: HashMap<i64, i64>,
    /// File set id → position in `file_sets`
    set_index: HashMap<i64, usize>,

    model_selection: OnceCell<BTreeMap<i64, i64>>,
    ml_models: OnceCell<Vec<MlModel>>,
    file_regions: OnceCell<Vec<FileRegion>>,
    ai_regions: OnceCell<Vec<FileRegion>>,
    feedback_regions: OnceCell<Vec<FileRegion>>,
    gt_regions: OnceCell<Vec<FileRegion>>,
    detected_file_regions: OnceCell<Vec<FileRegion>>,
    tally: OnceCell<Tally>,
    ai_defects_by_file_set: OnceCell<BTreeMap<i64, BTreeSet<DefectId>>>,
    gt_defects_by_file_set: OnceCell<BTreeMap<i64, BTreeSet<DefectId>>>,
}

impl AnalysisService {
    /// Validate `filters` and snapshot the tenant data they select
    pub async fn load(
        ctx: &TenantContext,
        filters: FilterCriteria,
        settings: AnalysisSettings,
    ) -> AnalysisResult<Self> {
        filters.validate_for_metrics()?;

        let use_cases: HashMap<i64, UseCase> = use_cases::load_use_cases(&ctx.db)
            .await?
            .into_iter()
            .map(|uc| (uc.id, uc))
            .collect();
        let models: HashMap<i64, MlModel> = ml_models::load_ml_models(&ctx.db)
            .await?
            .into_iter()
            .map(|m| (m.id, m))
            .collect();

        let selected_sets: Vec<FileSet> = file_sets::load_file_sets(&ctx.db)
            .await?
            .into_iter()
            .filter(|fs| filters.matches_file_set(fs, use_cases.get(&fs.use_case_id)))
            .collect();
        let set_ids: Vec<i64> = selected_sets.iter().map(|fs| fs.id).collect();

        let selected_files: Vec<File> = files::load_files_for_file_sets(&ctx.db, &set_ids)
            .await?
            .into_iter()
            .filter(|f| filters.matches_file(f))
            .collect();
        let file_ids: Vec<i64> = selected_files.iter().map(|f| f.id).collect();
        let file_to_set = selected_files.iter().map(|f| (f.id, f.file_set_id)).collect();

        let regions = regions::load_regions_for_files(&ctx.db, &file_ids).await?;

        debug!(
            tenant = %ctx.tenant,
            file_sets = selected_sets.len(),
            files = selected_files.len(),
            regions = regions.len(),
            "Analysis snapshot loaded"
        );

        Ok(Self::from_parts(
            filters,
            settings,
            Snapshot {
                defects: defects::load_defects(&ctx.db).await?,
                use_cases,
                models,
                deployments: ml_models::load_deployments(&ctx.db).await?,
                queue: inference_queue::load_entries(&ctx.db).await?,
                file_sets: selected_sets,
                files: selected_files,
                regions,
                file_to_set,
            },
        ))
    }

    fn from_parts(filters: FilterCriteria, settings: AnalysisSettings, snapshot: Snapshot) -> Self {
        let set_index = snapshot
            .file_sets
            .iter()
            .enumerate()
            .map(|(i, fs)| (fs.id, i))
            .collect();
        Self {
            filters,
            settings,
            defects: snapshot.defects,
            use_cases: snapshot.use_cases,
            models: snapshot.models,
            deployments: snapshot.deployments,
            queue: snapshot.queue,
            file_sets: snapshot.file_sets,
            files: snapshot.files,
            regions: snapshot.regions,
            file_to_set: snapshot.file_to_set,
            set_index,
            model_selection: OnceCell::new(),
            ml_models: OnceCell::new(),
            file_regions: OnceCell::new(),
            ai_regions: OnceCell::new(),
            feedback_regions: OnceCell::new(),
            gt_regions: OnceCell::new(),
            detected_file_regions: OnceCell::new(),
            tally: OnceCell::new(),
            ai_defects_by_file_set: OnceCell::new(),
            gt_defects_by_file_set: OnceCell::new(),
        }
    }

    pub fn filters(&self) -> &FilterCriteria {
        &self.filters
    }

    pub fn settings(&self) -> &AnalysisSettings {
        &self.settings
    }

    pub fn defects(&self) -> &[Defect] {
        &self.defects
    }

    pub fn use_case(&self, id: i64) -> Option<&UseCase> {
        self.use_cases.get(&id)
    }

    pub fn file_sets(&self) -> &[FileSet] {
        &self.file_sets
    }

    pub fn files(&self) -> &[File] {
        &self.files
    }

    pub fn file_set_of(&self, file_id: i64) -> Option<&FileSet> {
        let set_id = self.file_to_set.get(&file_id)?;
        self.set_index.get(set_id).and_then(|i| self.file_sets.get(*i))
    }

    pub fn model_type_of(&self, ml_model_id: i64) -> Option<ModelType> {
        self.models.get(&ml_model_id).map(|m| m.model_type)
    }

    /// Auto-model choice per file set: file set id → model id
    ///
    /// Among models with AI output on the file set, the most recently
    /// deployed wins; then the most recent queue entry; then the highest id.
    pub fn model_selection(&self) -> &BTreeMap<i64, i64> {
        self.model_selection.get_or_init(|| {
            let mut produced: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
            for region in self.regions.iter().filter(|r| r.is_ai()) {
                if !self.filters.selects_model(region.ml_model_id) {
                    continue;
                }
                if let Some(set_id) = self.file_to_set.get(&region.file_id) {
                    produced.entry(*set_id).or_default().insert(region.ml_model_id);
                }
            }

            produced
                .into_iter()
                .filter_map(|(set_id, models)| {
                    let chosen = models
                        .into_iter()
                        .max_by_key(|model_id| self.selection_key(set_id, *model_id))?;
                    debug!(file_set_id = set_id, ml_model_id = chosen, "Auto-selected model");
                    Some((set_id, chosen))
                })
                .collect()
        })
    }

    fn selection_key(
        &self,
        file_set_id: i64,
        ml_model_id: i64,
    ) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>, i64) {
        let deployed = self
            .deployments
            .iter()
            .filter(|d| d.ml_model_id == ml_model_id)
            .map(|d| d.starts_at)
            .max();
        let queued = self
            .queue
            .iter()
            .filter(|q| q.ml_model_id == ml_model_id && q.file_set_id == file_set_id)
            .map(|q| q.created_at)
            .max();
        (deployed, queued, ml_model_id)
    }

    /// Models whose regions take part in the analysis
    pub fn ml_models(&self) -> &[MlModel] {
        self.ml_models.get_or_init(|| {
            let ids: BTreeSet<i64> = if self.filters.auto_model {
                self.model_selection().values().copied().collect()
            } else {
                self.filters.ml_model_ids.iter().flatten().copied().collect()
            };
            ids.into_iter().filter_map(|id| self.models.get(&id).cloned()).collect()
        })
    }

    /// Regions (AI and feedback, removed included) of the selected models
    pub fn file_regions(&self) -> &[FileRegion] {
        self.file_regions.get_or_init(|| {
            if self.filters.auto_model {
                let selection = self.model_selection();
                self.regions
                    .iter()
                    .filter(|r| {
                        self.file_to_set
                            .get(&r.file_id)
                            .and_then(|set_id| selection.get(set_id))
                            == Some(&r.ml_model_id)
                    })
                    .cloned()
                    .collect()
            } else {
                self.regions
                    .iter()
                    .filter(|r| self.filters.selects_model(r.ml_model_id))
                    .cloned()
                    .collect()
            }
        })
    }

    /// Every AI prediction, including those a reviewer removed
    pub fn ai_regions(&self) -> &[FileRegion] {
        self.ai_regions
            .get_or_init(|| self.file_regions().iter().filter(|r| r.is_ai()).cloned().collect())
    }

    /// Active human feedback
    pub fn feedback_regions(&self) -> &[FileRegion] {
        self.feedback_regions.get_or_init(|| {
            self.file_regions()
                .iter()
                .filter(|r| r.is_user_feedback && !r.is_removed)
                .cloned()
                .collect()
        })
    }

    /// Ground truth: active feedback plus confirmed AI regions nobody overrode
    pub fn gt_regions(&self) -> &[FileRegion] {
        self.gt_regions.get_or_init(|| {
            let overridden: HashSet<i64> = self
                .feedback_regions()
                .iter()
                .filter_map(|r| r.ai_region_id)
                .collect();
            self.file_regions()
                .iter()
                .filter(|r| {
                    if r.is_user_feedback {
                        return !r.is_removed;
                    }
                    r.classification_correctness == Some(true)
                        && r.detection_correctness != Some(false)
                        && !r.is_removed
                        && !overridden.contains(&r.id)
                })
                .cloned()
                .collect()
        })
    }

    /// AI regions whose presence has been audited
    pub fn detected_file_regions(&self) -> &[FileRegion] {
        self.detected_file_regions.get_or_init(|| {
            self.ai_regions()
                .iter()
                .filter(|r| self.is_detected(r))
                .cloned()
                .collect()
        })
    }

    pub(crate) fn is_detected(&self, region: &FileRegion) -> bool {
        match self.model_type_of(region.ml_model_id) {
            Some(ModelType::Classification) => region.classification_correctness.is_some(),
            Some(_) => region.detection_correctness == Some(true),
            None => false,
        }
    }

    /// Active feedback regions linked to `ai_region_id`
    pub(crate) fn children_of(&self, ai_region_id: i64) -> impl Iterator<Item = &FileRegion> {
        self.feedback_regions()
            .iter()
            .filter(move |r| r.ai_region_id == Some(ai_region_id))
    }

    /// Defect counts over every selected region
    pub fn tally(&self) -> &Tally {
        self.tally.get_or_init(|| self.tally_where(|_| true))
    }

    /// Tally restricted to regions on file sets accepted by `keep`
    pub fn tally_for_file_sets(&self, keep: impl Fn(&FileSet) -> bool) -> Tally {
        let accepted: HashSet<i64> = self
            .file_sets
            .iter()
            .filter(|&fs| keep(fs))
            .map(|fs| fs.id)
            .collect();
        self.tally_where(|r| {
            self.file_to_set
                .get(&r.file_id)
                .is_some_and(|set_id| accepted.contains(set_id))
        })
    }

    /// AI defect labels per file set, non-defective labels dropped
    pub fn ai_defects_by_file_set(&self) -> &BTreeMap<i64, BTreeSet<DefectId>> {
        self.ai_defects_by_file_set
            .get_or_init(|| self.defects_by_file_set(self.ai_regions()))
    }

    /// Ground-truth defect labels per file set, non-defective labels dropped
    pub fn gt_defects_by_file_set(&self) -> &BTreeMap<i64, BTreeSet<DefectId>> {
        self.gt_defects_by_file_set
            .get_or_init(|| self.defects_by_file_set(self.gt_regions()))
    }

    fn defects_by_file_set(&self, regions: &[FileRegion]) -> BTreeMap<i64, BTreeSet<DefectId>> {
        let mut by_set: BTreeMap<i64, BTreeSet<DefectId>> = BTreeMap::new();
        for region in regions {
            let Some(set_id) = self.file_to_set.get(&region.file_id) else {
                continue;
            };
            let labels = by_set.entry(*set_id).or_default();
            labels.extend(
                region
                    .defects
                    .keys()
                    .filter(|id| !self.settings.non_defective_ids.contains(*id)),
            );
        }
        by_set.retain(|_, labels| !labels.is_empty());
        by_set
    }

    /// Confidence threshold a model's predictions must meet to count as automated
    pub fn confidence_threshold(&self, ml_model_id: i64) -> f64 {
        self.models
            .get(&ml_model_id)
            .and_then(|m| m.confidence_threshold)
            .unwrap_or(self.settings.default_confidence_threshold)
    }
}

struct Snapshot {
    defects: Vec<Defect>,
    use_cases: HashMap<i64, UseCase>,
    models: HashMap<i64, MlModel>,
    deployments: Vec<MlModelDeployment>,
    queue: Vec<InferenceQueueEntry>,
    file_sets: Vec<FileSet>,
    files: Vec<File>,
    regions: Vec<FileRegion>,
    file_to_set: HashMap<i64, i64>,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::TimeZone;
    use classif_common::db::{DefectDetail, DefectMap, RegionBox};
    use serde_json::{Map, Value};

    /// In-memory snapshot builder for unit tests of the metric modules
    pub struct SnapshotBuilder {
        settings: AnalysisSettings,
        filters: FilterCriteria,
        models: HashMap<i64, MlModel>,
        file_sets: Vec<FileSet>,
        files: Vec<File>,
        regions: Vec<FileRegion>,
        defects: Vec<Defect>,
    }

    pub fn labels(ids: &[(DefectId, f64)]) -> DefectMap {
        ids.iter()
            .map(|(id, c)| (*id, DefectDetail::with_confidence(*c)))
            .collect()
    }

    impl SnapshotBuilder {
        pub fn new(model_type: ModelType) -> Self {
            let created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let mut models = HashMap::new();
            models.insert(
                1,
                MlModel {
                    id: 1,
                    name: "model".to_string(),
                    version: 1,
                    model_type,
                    use_case_id: 1,
                    confidence_threshold: Some(0.5),
                    created_at: created,
                },
            );
            Self {
                settings: AnalysisSettings::default(),
                filters: FilterCriteria {
                    ml_model_ids: Some(vec![1]),
                    ..FilterCriteria::default()
                },
                models,
                file_sets: Vec::new(),
                files: Vec::new(),
                regions: Vec::new(),
                defects: Vec::new(),
            }
        }

        pub fn settings(mut self, settings: AnalysisSettings) -> Self {
            self.settings = settings;
            self
        }

        pub fn defect(mut self, id: DefectId, code: &str) -> Self {
            self.defects.push(Defect {
                id,
                name: code.to_string(),
                code: code.to_string(),
            });
            self
        }

        /// File set `id` with one file of the same id
        pub fn file_set(mut self, id: i64, day: u32, meta: Value) -> Self {
            let created_at = Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap();
            let meta_info: Map<String, Value> = meta.as_object().cloned().unwrap_or_default();
            self.file_sets.push(FileSet {
                id,
                use_case_id: 1,
                meta_info,
                created_at,
            });
            self.files.push(File {
                id,
                file_set_id: id,
                name: format!("img-{}.png", id),
                train_type: None,
                created_at,
            });
            self
        }

        pub fn region(mut self, region: FileRegion) -> Self {
            self.regions.push(region);
            self
        }

        pub fn build(self) -> AnalysisService {
            let file_to_set = self.files.iter().map(|f| (f.id, f.file_set_id)).collect();
            AnalysisService::from_parts(
                self.filters,
                self.settings,
                Snapshot {
                    defects: self.defects,
                    use_cases: HashMap::new(),
                    models: self.models,
                    deployments: Vec::new(),
                    queue: Vec::new(),
                    file_sets: self.file_sets,
                    files: self.files,
                    regions: self.regions,
                    file_to_set,
                },
            )
        }
    }

    /// Region on file `file_id` for model 1
    pub fn region(id: i64, file_id: i64, defects: DefectMap, is_user_feedback: bool) -> FileRegion {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        FileRegion {
            id,
            file_id,
            ml_model_id: 1,
            defects,
            region: None,
            is_user_feedback,
            is_removed: false,
            classification_correctness: None,
            detection_correctness: None,
            ai_region_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn boxed(mut region: FileRegion, b: RegionBox) -> FileRegion {
        region.region = Some(b);
        region
    }
}
