//! Ground truth vs prediction confusion matrix

use std::collections::BTreeMap;

use classif_common::db::DefectId;
use serde::Serialize;

use super::{AnalysisService, MetricValue};

/// One label per file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileLabel {
    pub file_id: i64,
    pub defect_id: DefectId,
}

impl FileLabel {
    pub fn new(file_id: i64, defect_id: DefectId) -> Self {
        Self { file_id, defect_id }
    }
}

/// Pair labels of the same file from two lists sorted by `file_id`
///
/// Two-pointer walk: the side with the smaller file id advances; only equal
/// file ids emit a pair.
pub fn merge_join_by_file(gt: &[FileLabel], pred: &[FileLabel]) -> Vec<(FileLabel, FileLabel)> {
    let mut pairs = Vec::new();
    let (mut i, mut j) = (0, 0);

    while i < gt.len() && j < pred.len() {
        match gt[i].file_id.cmp(&pred[j].file_id) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                pairs.push((gt[i], pred[j]));
                i += 1;
                j += 1;
            }
        }
    }

    pairs
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfusionCell {
    pub gt_defect_id: DefectId,
    pub pred_defect_id: DefectId,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConfusionMatrix {
    /// Files with both a ground-truth and a predicted label
    pub paired_files: usize,
    pub cells: Vec<ConfusionCell>,
}

impl ConfusionMatrix {
    pub fn from_pairs(pairs: &[(FileLabel, FileLabel)]) -> Self {
        let mut counts: BTreeMap<(DefectId, DefectId), usize> = BTreeMap::new();
        for (gt, pred) in pairs {
            *counts.entry((gt.defect_id, pred.defect_id)).or_default() += 1;
        }
        Self {
            paired_files: pairs.len(),
            cells: counts
                .into_iter()
                .map(|((gt_defect_id, pred_defect_id), count)| ConfusionCell {
                    gt_defect_id,
                    pred_defect_id,
                    count,
                })
                .collect(),
        }
    }

    pub fn count(&self, gt_defect_id: DefectId, pred_defect_id: DefectId) -> usize {
        self.cells
            .iter()
            .find(|c| c.gt_defect_id == gt_defect_id && c.pred_defect_id == pred_defect_id)
            .map_or(0, |c| c.count)
    }

    /// Share of paired files whose labels agree
    pub fn agreement(&self) -> MetricValue {
        let diagonal: usize = self
            .cells
            .iter()
            .filter(|c| c.gt_defect_id == c.pred_defect_id)
            .map(|c| c.count)
            .sum();
        MetricValue::percentage(diagonal, self.paired_files)
    }
}

impl AnalysisService {
    /// Per file: lowest defect id of its first ground-truth region
    pub fn gt_file_labels(&self) -> Vec<FileLabel> {
        let mut first: BTreeMap<i64, (i64, DefectId)> = BTreeMap::new();
        for region in self.gt_regions() {
            let Some(defect) = region.defects.keys().next() else {
                continue;
            };
            first
                .entry(region.file_id)
                .and_modify(|(id, label)| {
                    if region.id < *id {
                        *id = region.id;
                        *label = *defect;
                    }
                })
                .or_insert((region.id, *defect));
        }
        first
            .into_iter()
            .map(|(file_id, (_, defect))| FileLabel::new(file_id, defect))
            .collect()
    }

    /// Per file: the most confident AI defect (lowest id on ties)
    pub fn predicted_file_labels(&self) -> Vec<FileLabel> {
        let mut best: BTreeMap<i64, (f64, DefectId)> = BTreeMap::new();
        for region in self.ai_regions() {
            for (defect, detail) in &region.defects {
                let confidence = detail.confidence.unwrap_or(0.0);
                let replace = match best.get(&region.file_id) {
                    None => true,
                    Some((c, d)) => confidence > *c || (confidence == *c && defect < d),
                };
                if replace {
                    best.insert(region.file_id, (confidence, *defect));
                }
            }
        }
        best.into_iter()
            .map(|(file_id, (_, defect))| FileLabel::new(file_id, defect))
            .collect()
    }

    pub fn confusion_matrix(&self) -> ConfusionMatrix {
        let pairs = merge_join_by_file(&self.gt_file_labels(), &self.predicted_file_labels());
        ConfusionMatrix::from_pairs(&pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{labels, region, SnapshotBuilder};
    use super::*;
    use classif_common::db::ModelType;
    use serde_json::json;

    #[test]
    fn test_merge_join_pairs_only_shared_files() {
        let gt = [FileLabel::new(1, 1), FileLabel::new(3, 2)];
        let pred = [FileLabel::new(1, 1), FileLabel::new(2, 5)];

        let pairs = merge_join_by_file(&gt, &pred);
        assert_eq!(pairs, vec![(FileLabel::new(1, 1), FileLabel::new(1, 1))]);
    }

    #[test]
    fn test_merge_join_handles_empty_and_disjoint_sides() {
        assert!(merge_join_by_file(&[], &[FileLabel::new(1, 1)]).is_empty());
        let gt = [FileLabel::new(2, 1), FileLabel::new(4, 1)];
        let pred = [FileLabel::new(1, 1), FileLabel::new(3, 1), FileLabel::new(5, 1)];
        assert!(merge_join_by_file(&gt, &pred).is_empty());
    }

    #[test]
    fn test_confusion_matrix_from_service() {
        let mut confirmed = region(1, 1, labels(&[(1, 0.9)]), false);
        confirmed.classification_correctness = Some(true);
        let wrong = region(2, 2, labels(&[(2, 0.6), (3, 0.8)]), false);
        let truth = region(3, 2, labels(&[(2, 1.0)]), true);

        let service = SnapshotBuilder::new(ModelType::Classification)
            .file_set(1, 1, json!({}))
            .file_set(2, 1, json!({}))
            .region(confirmed)
            .region(wrong)
            .region(truth)
            .build();

        let matrix = service.confusion_matrix();
        assert_eq!(matrix.paired_files, 2);
        assert_eq!(matrix.count(1, 1), 1);
        assert_eq!(matrix.count(2, 3), 1);
        assert_eq!(matrix.agreement(), MetricValue::Value(50.0));
    }
}
