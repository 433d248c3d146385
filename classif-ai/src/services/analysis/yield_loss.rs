//! Yield loss: AI-defective file sets over inspected units

use std::collections::{BTreeMap, BTreeSet, HashMap};

use classif_common::db::{meta_keys, DefectId, FileSet};
use classif_common::time::TimeFormat;
use serde::Serialize;

use super::{AnalysisService, MetricValue};

const UNKNOWN_GROUP: &str = "unknown";

/// Grouping dimension for yield reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldGroupBy {
    Machine,
    Lot,
    Time(TimeFormat),
}

impl YieldGroupBy {
    /// `machine`, `lot`, `daily`, `weekly` or `monthly`
    pub fn parse(s: &str) -> classif_common::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "machine" => Ok(YieldGroupBy::Machine),
            "lot" => Ok(YieldGroupBy::Lot),
            other => TimeFormat::parse(other).map(YieldGroupBy::Time),
        }
    }

    fn key(&self, file_set: &FileSet) -> String {
        match self {
            YieldGroupBy::Machine => file_set
                .meta_str(meta_keys::MACHINE)
                .unwrap_or_else(|| UNKNOWN_GROUP.to_string()),
            YieldGroupBy::Lot => lot_key(file_set),
            YieldGroupBy::Time(format) => format.bucket_label(&file_set.created_at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YieldLossRow {
    pub group: String,
    pub defective: usize,
    pub inspected: i64,
    /// Percentage of inspected units lost
    pub yield_loss: MetricValue,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct YieldLossByDefectRow {
    pub group: String,
    pub defect_id: DefectId,
    pub defective: usize,
    pub inspected: i64,
    pub yield_loss: MetricValue,
}

/// File sets without a lot id form a lot of their own
fn lot_key(file_set: &FileSet) -> String {
    file_set
        .meta_str(meta_keys::LOT)
        .unwrap_or_else(|| format!("file_set:{}", file_set.id))
}

/// Inspected units across `file_sets`
///
/// Each lot counts once, with the largest `InitialTotal` any of its file
/// sets reports; a lot reporting none counts one unit per file set.
pub fn inspected_units<'a>(file_sets: impl IntoIterator<Item = &'a FileSet>) -> i64 {
    let mut lots: HashMap<String, (Option<i64>, i64)> = HashMap::new();
    for fs in file_sets {
        let (total, count) = lots.entry(lot_key(fs)).or_insert((None, 0));
        *count += 1;
        if let Some(n) = fs.initial_total() {
            *total = Some(total.map_or(n, |t| t.max(n)));
        }
    }
    lots.values().map(|(total, count)| total.unwrap_or(*count)).sum()
}

/// Priority position of a defect; unlisted defects rank after, by id
fn priority_rank(ordered: &[DefectId], defect: DefectId) -> (usize, DefectId) {
    match ordered.iter().position(|d| *d == defect) {
        Some(idx) => (idx, defect),
        None => (ordered.len(), defect),
    }
}

/// The single defect a file set is attributed to in priority mode
pub fn priority_defect(ordered: &[DefectId], defects: &BTreeSet<DefectId>) -> Option<DefectId> {
    defects
        .iter()
        .copied()
        .min_by_key(|d| priority_rank(ordered, *d))
}

impl AnalysisService {
    fn file_sets_by_group(&self, group_by: YieldGroupBy) -> BTreeMap<String, Vec<&FileSet>> {
        let mut groups: BTreeMap<String, Vec<&FileSet>> = BTreeMap::new();
        for fs in self.file_sets() {
            groups.entry(group_by.key(fs)).or_default().push(fs);
        }
        groups
    }

    pub fn yield_loss(&self, group_by: YieldGroupBy) -> Vec<YieldLossRow> {
        let defective_sets = self.ai_defects_by_file_set();
        self.file_sets_by_group(group_by)
            .into_iter()
            .map(|(group, sets)| {
                let inspected = inspected_units(sets.iter().copied());
                let defective = sets
                    .iter()
                    .filter(|fs| defective_sets.contains_key(&fs.id))
                    .count();
                YieldLossRow {
                    group,
                    defective,
                    inspected,
                    yield_loss: MetricValue::ratio(100.0 * defective as f64, inspected as f64),
                }
            })
            .collect()
    }

    /// Yield loss split per defect
    ///
    /// With `priority` each file set counts only toward its highest-priority
    /// defect (per `ordered_defect_ids`); otherwise toward every defect.
    pub fn yield_loss_by_defect(&self, group_by: YieldGroupBy, priority: bool) -> Vec<YieldLossByDefectRow> {
        let defective_sets = self.ai_defects_by_file_set();
        let ordered = &self.settings().ordered_defect_ids;
        let mut rows = Vec::new();

        for (group, sets) in self.file_sets_by_group(group_by) {
            let inspected = inspected_units(sets.iter().copied());
            let mut per_defect: BTreeMap<DefectId, usize> = BTreeMap::new();

            for fs in &sets {
                let Some(defects) = defective_sets.get(&fs.id) else {
                    continue;
                };
                if priority {
                    if let Some(d) = priority_defect(ordered, defects) {
                        *per_defect.entry(d).or_default() += 1;
                    }
                } else {
                    for d in defects {
                        *per_defect.entry(*d).or_default() += 1;
                    }
                }
            }

            rows.extend(per_defect.into_iter().map(|(defect_id, defective)| YieldLossByDefectRow {
                group: group.clone(),
                defect_id,
                defective,
                inspected,
                yield_loss: MetricValue::ratio(100.0 * defective as f64, inspected as f64),
            }));
        }

        rows
    }
}
