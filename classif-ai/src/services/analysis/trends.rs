//! Time-bucketed accuracy, automation and overkill

use std::collections::{BTreeMap, BTreeSet, HashSet};

use classif_common::time::TimeFormat;
use serde::Serialize;

use super::{AnalysisService, MetricValue};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    /// Bucket start, `YYYY-MM-DD`
    pub bucket: String,
    pub value: MetricValue,
    /// Observations behind `value`
    pub samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverkillPoint {
    pub bucket: String,
    /// File sets with a human verdict
    pub audited: usize,
    /// AI flagged a defect, ground truth is clean
    pub overkill: usize,
    /// AI saw nothing, ground truth has a defect
    pub escapes: usize,
    pub overkill_rate: MetricValue,
    pub escape_rate: MetricValue,
}

impl AnalysisService {
    fn file_sets_by_bucket(&self, format: TimeFormat) -> BTreeMap<String, HashSet<i64>> {
        let mut buckets: BTreeMap<String, HashSet<i64>> = BTreeMap::new();
        for fs in self.file_sets() {
            buckets
                .entry(format.bucket_label(&fs.created_at))
                .or_default()
                .insert(fs.id);
        }
        buckets
    }

    fn in_sets(&self, sets: &HashSet<i64>, file_id: i64) -> bool {
        self.file_set_of(file_id).is_some_and(|fs| sets.contains(&fs.id))
    }

    /// Overall accuracy per bucket of file set upload time
    pub fn accuracy_trend(&self, format: TimeFormat) -> Vec<TrendPoint> {
        self.file_sets_by_bucket(format)
            .into_iter()
            .map(|(bucket, sets)| {
                let tally = self.tally_for_file_sets(|fs| sets.contains(&fs.id));
                TrendPoint {
                    bucket,
                    value: tally.overall_accuracy(),
                    samples: tally.true_positives + tally.false_positives + tally.false_negatives,
                }
            })
            .collect()
    }

    pub fn automation_trend(&self, format: TimeFormat) -> Vec<TrendPoint> {
        self.file_sets_by_bucket(format)
            .into_iter()
            .map(|(bucket, sets)| {
                let counts = self.automation_where(|r| self.in_sets(&sets, r.file_id));
                TrendPoint {
                    bucket,
                    value: counts.automation_rate(),
                    samples: counts.files_with_predictions,
                }
            })
            .collect()
    }

    /// File sets carrying ground truth or a reviewed AI prediction
    pub fn audited_file_sets(&self) -> BTreeSet<i64> {
        self.gt_regions()
            .iter()
            .chain(
                self.ai_regions()
                    .iter()
                    .filter(|r| r.classification_correctness.is_some()),
            )
            .filter_map(|r| self.file_set_of(r.file_id).map(|fs| fs.id))
            .collect()
    }

    pub fn overkill_trend(&self, format: TimeFormat) -> Vec<OverkillPoint> {
        let audited = self.audited_file_sets();
        let ai = self.ai_defects_by_file_set();
        let gt = self.gt_defects_by_file_set();

        self.file_sets_by_bucket(format)
            .into_iter()
            .map(|(bucket, sets)| {
                let reviewed: Vec<i64> = sets.into_iter().filter(|id| audited.contains(id)).collect();
                let overkill = reviewed
                    .iter()
                    .filter(|&&id| ai.contains_key(&id) && !gt.contains_key(&id))
                    .count();
                let escapes = reviewed
                    .iter()
                    .filter(|&&id| !ai.contains_key(&id) && gt.contains_key(&id))
                    .count();
                OverkillPoint {
                    bucket,
                    audited: reviewed.len(),
                    overkill,
                    escapes,
                    overkill_rate: MetricValue::percentage(overkill, reviewed.len()),
                    escape_rate: MetricValue::percentage(escapes, reviewed.len()),
                }
            })
            .collect()
    }
}
