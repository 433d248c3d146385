//! TP/FP/FN tallies and the metrics derived from them

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use classif_common::db::{DefectId, FileRegion};
use serde::{Serialize, Serializer};

use super::AnalysisService;

/// A metric, or `"N/A"` when its denominator is zero
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Value(f64),
    NotApplicable,
}

impl MetricValue {
    pub fn ratio(numerator: f64, denominator: f64) -> Self {
        if denominator == 0.0 {
            MetricValue::NotApplicable
        } else {
            MetricValue::Value(numerator / denominator)
        }
    }

    pub fn percentage(numerator: usize, denominator: usize) -> Self {
        Self::ratio(100.0 * numerator as f64, denominator as f64)
    }

    pub fn rounded(self, decimals: i32) -> Self {
        match self {
            MetricValue::Value(v) => {
                let factor = 10f64.powi(decimals);
                MetricValue::Value((v * factor).round() / factor)
            }
            na => na,
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            MetricValue::Value(v) => Some(*v),
            MetricValue::NotApplicable => None,
        }
    }

    pub fn is_not_applicable(&self) -> bool {
        matches!(self, MetricValue::NotApplicable)
    }
}

impl Serialize for MetricValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MetricValue::Value(v) => serializer.serialize_f64(*v),
            MetricValue::NotApplicable => serializer.serialize_str("N/A"),
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Value(v) => write!(f, "{}", v),
            MetricValue::NotApplicable => f.write_str("N/A"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DefectCounts {
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
}

/// Defect-level outcome counts over a set of regions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tally {
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub per_defect: BTreeMap<DefectId, DefectCounts>,
    /// AI regions contributing a true positive
    pub tp_regions: BTreeSet<i64>,
    /// AI regions contributing a false positive
    pub fp_regions: BTreeSet<i64>,
    /// Feedback regions contributing a false negative
    pub fn_regions: BTreeSet<i64>,
    /// Distinct labels (either side) on audited detected regions
    pub classification_total: usize,
    /// Box-model AI regions judged correctly placed
    pub detection_correct: usize,
    /// Box-model AI regions with a placement verdict, plus missed feedback boxes
    pub detection_total: usize,
}

impl Tally {
    fn true_positive(&mut self, defect: DefectId) {
        self.true_positives += 1;
        self.per_defect.entry(defect).or_default().true_positives += 1;
    }

    fn false_positive(&mut self, defect: DefectId) {
        self.false_positives += 1;
        self.per_defect.entry(defect).or_default().false_positives += 1;
    }

    fn false_negative(&mut self, defect: DefectId) {
        self.false_negatives += 1;
        self.per_defect.entry(defect).or_default().false_negatives += 1;
    }

    pub fn precision(&self) -> MetricValue {
        precision(self.true_positives, self.false_positives)
    }

    pub fn recall(&self) -> MetricValue {
        recall(self.true_positives, self.false_negatives)
    }

    pub fn overall_accuracy(&self) -> MetricValue {
        MetricValue::percentage(
            self.true_positives,
            self.true_positives + self.false_positives + self.false_negatives,
        )
    }

    pub fn classification_accuracy(&self) -> MetricValue {
        MetricValue::percentage(self.true_positives, self.classification_total)
    }

    pub fn detection_accuracy(&self) -> MetricValue {
        MetricValue::percentage(self.detection_correct, self.detection_total)
    }
}

fn precision(tp: usize, fp: usize) -> MetricValue {
    MetricValue::ratio(tp as f64, (tp + fp) as f64).rounded(2)
}

fn recall(tp: usize, fn_: usize) -> MetricValue {
    MetricValue::ratio(tp as f64, (tp + fn_) as f64).rounded(2)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DefectMetrics {
    pub defect_id: DefectId,
    pub code: Option<String>,
    #[serde(flatten)]
    pub counts: DefectCounts,
    pub precision: MetricValue,
    pub recall: MetricValue,
}

/// Per-file automation outcome
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AutomationCounts {
    /// Files with at least one AI prediction
    pub files_with_predictions: usize,
    /// Files whose every predicted defect met the confidence threshold
    pub auto_classified: usize,
    /// Auto-classified files with at least one reviewed prediction
    pub auto_audited: usize,
    /// Audited auto-classified files with no refuted prediction
    pub auto_correct: usize,
}

impl AutomationCounts {
    pub fn automation_rate(&self) -> MetricValue {
        MetricValue::percentage(self.auto_classified, self.files_with_predictions)
    }

    pub fn auto_classified_accuracy(&self) -> MetricValue {
        MetricValue::percentage(self.auto_correct, self.auto_audited)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub file_sets: usize,
    pub files: usize,
    pub ai_regions: usize,
    pub gt_regions: usize,
    pub detected_regions: usize,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub precision: MetricValue,
    pub recall: MetricValue,
    pub overall_accuracy: MetricValue,
    pub classification_accuracy: MetricValue,
    pub detection_accuracy: MetricValue,
    pub automation_rate: MetricValue,
    pub auto_classified_accuracy: MetricValue,
    pub per_defect: Vec<DefectMetrics>,
}

impl AnalysisService {
    /// Count defect outcomes over regions accepted by `keep`
    ///
    /// - confirmed detected AI region: each AI defect is a TP
    /// - refuted AI region: defects shared with its feedback are TPs (when
    ///   detected), AI-only defects FPs, feedback-only defects FNs
    /// - active feedback linked to no AI region: each defect is a FN
    /// - unaudited AI regions count nowhere
    pub(crate) fn tally_where(&self, keep: impl Fn(&FileRegion) -> bool) -> Tally {
        let mut tally = Tally::default();

        for ai in self.ai_regions().iter().filter(|&r| keep(r)) {
            let detected = self.is_detected(ai);
            let uses_boxes = self
                .model_type_of(ai.ml_model_id)
                .is_some_and(|t| t.uses_boxes());
            if uses_boxes {
                if let Some(placed) = ai.detection_correctness {
                    tally.detection_total += 1;
                    if placed {
                        tally.detection_correct += 1;
                    }
                }
            }

            let predicted = ai.defect_ids();
            match ai.classification_correctness {
                Some(true) if detected => {
                    tally.classification_total += predicted.len();
                    for defect in &predicted {
                        tally.true_positive(*defect);
                    }
                    tally.tp_regions.insert(ai.id);
                }
                Some(false) => {
                    let children: Vec<&FileRegion> = self.children_of(ai.id).collect();
                    let actual: BTreeSet<DefectId> = children
                        .iter()
                        .flat_map(|c| c.defects.keys().copied())
                        .collect();

                    if detected {
                        tally.classification_total += predicted.union(&actual).count();
                        for defect in predicted.intersection(&actual) {
                            tally.true_positive(*defect);
                            tally.tp_regions.insert(ai.id);
                        }
                    }
                    for defect in predicted.difference(&actual) {
                        tally.false_positive(*defect);
                        tally.fp_regions.insert(ai.id);
                    }
                    for defect in actual.difference(&predicted) {
                        tally.false_negative(*defect);
                        tally.fn_regions.extend(
                            children
                                .iter()
                                .filter(|c| c.defects.contains_key(defect))
                                .map(|c| c.id),
                        );
                    }
                }
                _ => {}
            }
        }

        for feedback in self
            .feedback_regions()
            .iter()
            .filter(|&r| r.ai_region_id.is_none() && keep(r))
        {
            if self
                .model_type_of(feedback.ml_model_id)
                .is_some_and(|t| t.uses_boxes())
            {
                tally.detection_total += 1;
            }
            for defect in feedback.defects.keys() {
                tally.false_negative(*defect);
            }
            tally.fn_regions.insert(feedback.id);
        }

        tally
    }

    pub fn true_positive_regions(&self) -> Vec<&FileRegion> {
        let ids = &self.tally().tp_regions;
        self.ai_regions().iter().filter(|r| ids.contains(&r.id)).collect()
    }

    pub fn false_positive_regions(&self) -> Vec<&FileRegion> {
        let ids = &self.tally().fp_regions;
        self.ai_regions().iter().filter(|r| ids.contains(&r.id)).collect()
    }

    pub fn false_negative_regions(&self) -> Vec<&FileRegion> {
        let ids = &self.tally().fn_regions;
        self.feedback_regions().iter().filter(|r| ids.contains(&r.id)).collect()
    }

    pub fn precision(&self) -> MetricValue {
        self.tally().precision()
    }

    pub fn recall(&self) -> MetricValue {
        self.tally().recall()
    }

    pub fn overall_accuracy(&self) -> MetricValue {
        self.tally().overall_accuracy()
    }

    pub fn classification_accuracy(&self) -> MetricValue {
        self.tally().classification_accuracy()
    }

    pub fn detection_accuracy(&self) -> MetricValue {
        self.tally().detection_accuracy()
    }

    pub fn per_defect_metrics(&self) -> Vec<DefectMetrics> {
        self.tally()
            .per_defect
            .iter()
            .map(|(defect_id, counts)| DefectMetrics {
                defect_id: *defect_id,
                code: self
                    .defects()
                    .iter()
                    .find(|d| d.id == *defect_id)
                    .map(|d| d.code.clone()),
                counts: *counts,
                precision: precision(counts.true_positives, counts.false_positives),
                recall: recall(counts.true_positives, counts.false_negatives),
            })
            .collect()
    }

    /// Automation counts over AI regions accepted by `keep`
    ///
    /// A file is auto-classified when every defect the AI predicted on it
    /// carries a confidence at or above the model threshold.
    pub fn automation_where(&self, keep: impl Fn(&FileRegion) -> bool) -> AutomationCounts {
        let mut by_file: BTreeMap<i64, Vec<&FileRegion>> = BTreeMap::new();
        for ai in self.ai_regions().iter().filter(|&r| keep(r)) {
            by_file.entry(ai.file_id).or_default().push(ai);
        }

        let mut counts = AutomationCounts::default();
        for predictions in by_file.values() {
            counts.files_with_predictions += 1;

            let confident = predictions.iter().all(|r| {
                let threshold = self.confidence_threshold(r.ml_model_id);
                r.defects
                    .values()
                    .all(|d| d.confidence.is_some_and(|c| c >= threshold))
            });
            if !confident {
                continue;
            }
            counts.auto_classified += 1;

            let verdicts: Vec<bool> = predictions
                .iter()
                .filter_map(|r| r.classification_correctness)
                .collect();
            if !verdicts.is_empty() {
                counts.auto_audited += 1;
                if verdicts.iter().all(|ok| *ok) {
                    counts.auto_correct += 1;
                }
            }
        }
        counts
    }

    pub fn automation(&self) -> AutomationCounts {
        self.automation_where(|_| true)
    }

    pub fn automation_rate(&self) -> MetricValue {
        self.automation().automation_rate()
    }

    pub fn summary(&self) -> MetricsSummary {
        let tally = self.tally();
        let automation = self.automation();
        MetricsSummary {
            file_sets: self.file_sets().len(),
            files: self.files().len(),
            ai_regions: self.ai_regions().len(),
            gt_regions: self.gt_regions().len(),
            detected_regions: self.detected_file_regions().len(),
            true_positives: tally.true_positives,
            false_positives: tally.false_positives,
            false_negatives: tally.false_negatives,
            precision: tally.precision(),
            recall: tally.recall(),
            overall_accuracy: tally.overall_accuracy(),
            classification_accuracy: tally.classification_accuracy(),
            detection_accuracy: tally.detection_accuracy(),
            automation_rate: automation.automation_rate(),
            auto_classified_accuracy: automation.auto_classified_accuracy(),
            per_defect: self.per_defect_metrics(),
        }
    }
}
