//! Cohort distributions: per defect, per use case, per wafer

use std::collections::{BTreeMap, BTreeSet};

use classif_common::db::{meta_keys, DefectId};
use serde::Serialize;

use super::AnalysisService;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DefectDistributionRow {
    pub defect_id: DefectId,
    pub code: Option<String>,
    /// AI regions predicting the defect
    pub ai_regions: usize,
    /// Ground-truth regions carrying the defect
    pub gt_regions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UseCaseDistributionRow {
    pub use_case_id: i64,
    pub name: Option<String>,
    pub file_sets: usize,
    pub files: usize,
    pub ai_regions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WaferDistributionRow {
    pub wafer_id: String,
    pub file_sets: usize,
    /// File sets the AI flagged with a defect
    pub defective_file_sets: usize,
}

impl AnalysisService {
    pub fn defect_distribution(&self) -> Vec<DefectDistributionRow> {
        let mut counts: BTreeMap<DefectId, (usize, usize)> = BTreeMap::new();
        for region in self.ai_regions() {
            for defect in region.defects.keys() {
                counts.entry(*defect).or_default().0 += 1;
            }
        }
        for region in self.gt_regions() {
            for defect in region.defects.keys() {
                counts.entry(*defect).or_default().1 += 1;
            }
        }

        counts
            .into_iter()
            .map(|(defect_id, (ai_regions, gt_regions))| DefectDistributionRow {
                defect_id,
                code: self
                    .defects()
                    .iter()
                    .find(|d| d.id == defect_id)
                    .map(|d| d.code.clone()),
                ai_regions,
                gt_regions,
            })
            .collect()
    }

    pub fn use_case_distribution(&self) -> Vec<UseCaseDistributionRow> {
        let mut sets: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
        for fs in self.file_sets() {
            sets.entry(fs.use_case_id).or_default().insert(fs.id);
        }

        sets.into_iter()
            .map(|(use_case_id, set_ids)| {
                let files = self
                    .files()
                    .iter()
                    .filter(|f| set_ids.contains(&f.file_set_id))
                    .count();
                let ai_regions = self
                    .ai_regions()
                    .iter()
                    .filter(|r| {
                        self.file_set_of(r.file_id)
                            .is_some_and(|fs| set_ids.contains(&fs.id))
                    })
                    .count();
                UseCaseDistributionRow {
                    use_case_id,
                    name: self.use_case(use_case_id).map(|uc| uc.name.clone()),
                    file_sets: set_ids.len(),
                    files,
                    ai_regions,
                }
            })
            .collect()
    }

    /// File sets grouped by `WaferId`; file sets without one are skipped
    pub fn wafer_distribution(&self) -> Vec<WaferDistributionRow> {
        let defective = self.ai_defects_by_file_set();
        let mut wafers: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        for fs in self.file_sets() {
            let Some(wafer) = fs.meta_str(meta_keys::WAFER) else {
                continue;
            };
            let entry = wafers.entry(wafer).or_default();
            entry.0 += 1;
            if defective.contains_key(&fs.id) {
                entry.1 += 1;
            }
        }

        wafers
            .into_iter()
            .map(|(wafer_id, (file_sets, defective_file_sets))| WaferDistributionRow {
                wafer_id,
                file_sets,
                defective_file_sets,
            })
            .collect()
    }
}
