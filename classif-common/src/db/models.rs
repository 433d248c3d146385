//! Database models

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{Error, Result};

/// Defect identifier (primary key of the `defects` table)
pub type DefectId = i64;

/// Per-defect payload attached to a region
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefectDetail {
    /// Model confidence in [0, 1]; absent on human feedback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl DefectDetail {
    pub fn with_confidence(confidence: f64) -> Self {
        Self {
            confidence: Some(confidence),
        }
    }
}

/// Defect-id → detail mapping stored as JSON on each region
pub type DefectMap = BTreeMap<DefectId, DefectDetail>;

/// What a model (and the use case it serves) produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelType {
    /// Whole-image labels, no boxes
    Classification,
    /// Boxes only
    Detection,
    /// Boxes with per-box labels
    ClassificationAndDetection,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Classification => "CLASSIFICATION",
            ModelType::Detection => "DETECTION",
            ModelType::ClassificationAndDetection => "CLASSIFICATION_AND_DETECTION",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "CLASSIFICATION" => Ok(ModelType::Classification),
            "DETECTION" => Ok(ModelType::Detection),
            "CLASSIFICATION_AND_DETECTION" => Ok(ModelType::ClassificationAndDetection),
            other => Err(Error::InvalidInput(format!("Unknown model type: {}", other))),
        }
    }

    /// Whether regions of this model carry boxes and are matched by IoU
    pub fn uses_boxes(&self) -> bool {
        !matches!(self, ModelType::Classification)
    }
}

/// Label cardinality of a use case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClassificationType {
    SingleLabel,
    MultiLabel,
}

impl ClassificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationType::SingleLabel => "SINGLE_LABEL",
            ClassificationType::MultiLabel => "MULTI_LABEL",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "SINGLE_LABEL" => Ok(ClassificationType::SingleLabel),
            "MULTI_LABEL" => Ok(ClassificationType::MultiLabel),
            other => Err(Error::InvalidInput(format!(
                "Unknown classification type: {}",
                other
            ))),
        }
    }
}

/// Axis-aligned bounding box, top-left origin
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegionBox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl RegionBox {
    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }

    /// Corner form `[x1, y1, x2, y2]`
    pub fn corners(&self) -> [f64; 4] {
        [self.x, self.y, self.x + self.w, self.y + self.h]
    }

    pub fn area(&self) -> f64 {
        self.w * self.h
    }

    /// Finite coordinates with strictly positive extent
    pub fn is_well_formed(&self) -> bool {
        [self.x, self.y, self.w, self.h].iter().all(|v| v.is_finite()) && self.w > 0.0 && self.h > 0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UseCase {
    pub id: i64,
    pub name: String,
    pub model_type: ModelType,
    pub classification_type: ClassificationType,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defect {
    pub id: DefectId,
    pub name: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlModel {
    pub id: i64,
    pub name: String,
    pub version: i64,
    pub model_type: ModelType,
    pub use_case_id: i64,
    /// Minimum defect confidence for a prediction to count as auto-classified
    pub confidence_threshold: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// One production deployment window of a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlModelDeployment {
    pub id: i64,
    pub ml_model_id: i64,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
}

/// Metadata keys the analytics read from `FileSet::meta_info`
pub mod meta_keys {
    pub const MACHINE: &str = "MachineNo";
    pub const LOT: &str = "LotId";
    pub const WAFER: &str = "WaferId";
    pub const INITIAL_TOTAL: &str = "InitialTotal";
}

/// A group of related images uploaded together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSet {
    pub id: i64,
    pub use_case_id: i64,
    pub meta_info: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl FileSet {
    /// Metadata value rendered as a plain string (strings unquoted)
    pub fn meta_str(&self, key: &str) -> Option<String> {
        match self.meta_info.get(key)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Inspected unit count for the lot this file set belongs to
    pub fn initial_total(&self) -> Option<i64> {
        match self.meta_info.get(meta_keys::INITIAL_TOTAL)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub id: i64,
    pub file_set_id: i64,
    pub name: String,
    /// Dataset split the image was used in, if any
    pub train_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A labeled area on a file (box or whole image)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRegion {
    pub id: i64,
    pub file_id: i64,
    pub ml_model_id: i64,
    pub defects: DefectMap,
    pub region: Option<RegionBox>,
    pub is_user_feedback: bool,
    pub is_removed: bool,
    pub classification_correctness: Option<bool>,
    pub detection_correctness: Option<bool>,
    /// AI region this feedback region reconciles against
    pub ai_region_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRegion {
    pub fn is_ai(&self) -> bool {
        !self.is_user_feedback
    }

    pub fn defect_ids(&self) -> BTreeSet<DefectId> {
        self.defects.keys().copied().collect()
    }

    /// The label of a single-label region
    pub fn single_defect(&self) -> Option<DefectId> {
        single_defect(&self.defects)
    }
}

/// Label of a defect map holding exactly one defect
pub fn single_defect(defects: &DefectMap) -> Option<DefectId> {
    if defects.len() == 1 {
        defects.keys().next().copied()
    } else {
        None
    }
}

/// Append-only snapshot of a region taken on every save
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRegionHistory {
    pub guid: Uuid,
    pub file_region_id: i64,
    pub file_id: i64,
    pub ml_model_id: i64,
    pub defects: DefectMap,
    pub region: Option<RegionBox>,
    pub ai_region_id: Option<i64>,
    pub is_user_feedback: bool,
    pub is_removed: bool,
    pub classification_correctness: Option<bool>,
    pub detection_correctness: Option<bool>,
    pub created_at: DateTime<Utc>,
}

/// Inference queue entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InferenceStatus {
    Pending,
    Processing,
    Finished,
    Failed,
}

impl InferenceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InferenceStatus::Pending => "PENDING",
            InferenceStatus::Processing => "PROCESSING",
            InferenceStatus::Finished => "FINISHED",
            InferenceStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(InferenceStatus::Pending),
            "PROCESSING" => Ok(InferenceStatus::Processing),
            "FINISHED" => Ok(InferenceStatus::Finished),
            "FAILED" => Ok(InferenceStatus::Failed),
            other => Err(Error::InvalidInput(format!("Unknown inference status: {}", other))),
        }
    }

    /// Allowed forward transitions: PENDING → PROCESSING → FINISHED | FAILED
    pub fn can_transition_to(&self, next: InferenceStatus) -> bool {
        matches!(
            (self, next),
            (InferenceStatus::Pending, InferenceStatus::Processing)
                | (InferenceStatus::Pending, InferenceStatus::Failed)
                | (InferenceStatus::Processing, InferenceStatus::Finished)
                | (InferenceStatus::Processing, InferenceStatus::Failed)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceQueueEntry {
    pub id: i64,
    pub file_set_id: i64,
    pub ml_model_id: i64,
    pub status: InferenceStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_model_type_round_trips_through_str() {
        for t in [
            ModelType::Classification,
            ModelType::Detection,
            ModelType::ClassificationAndDetection,
        ] {
            assert_eq!(ModelType::parse(t.as_str()).unwrap(), t);
        }
        assert!(ModelType::parse("SEGMENTATION").is_err());
    }

    #[test]
    fn test_defect_map_serializes_with_string_keys() {
        let mut defects = DefectMap::new();
        defects.insert(3, DefectDetail::with_confidence(0.9));
        defects.insert(1, DefectDetail::default());

        let encoded = serde_json::to_value(&defects).unwrap();
        assert_eq!(encoded, json!({"1": {}, "3": {"confidence": 0.9}}));

        let decoded: DefectMap = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, defects);
    }

    #[test]
    fn test_single_defect_needs_exactly_one_label() {
        let mut defects = DefectMap::new();
        defects.insert(4, DefectDetail::with_confidence(0.7));
        defects.insert(2, DefectDetail::with_confidence(0.7));
        defects.insert(9, DefectDetail::with_confidence(0.2));
        let region = FileRegion {
            id: 1,
            file_id: 1,
            ml_model_id: 1,
            defects,
            region: None,
            is_user_feedback: false,
            is_removed: false,
            classification_correctness: None,
            detection_correctness: None,
            ai_region_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(region.single_defect(), None);

        let mut one = region.clone();
        one.defects.retain(|id, _| *id == 4);
        assert_eq!(one.single_defect(), Some(4));
    }

    #[test]
    fn test_file_set_initial_total_accepts_numbers_and_strings() {
        let mut fs = FileSet {
            id: 1,
            use_case_id: 1,
            meta_info: Map::new(),
            created_at: Utc::now(),
        };
        assert_eq!(fs.initial_total(), None);

        fs.meta_info.insert(meta_keys::INITIAL_TOTAL.to_string(), json!(250));
        assert_eq!(fs.initial_total(), Some(250));

        fs.meta_info.insert(meta_keys::INITIAL_TOTAL.to_string(), json!(" 40 "));
        assert_eq!(fs.initial_total(), Some(40));

        fs.meta_info.insert(meta_keys::LOT.to_string(), json!("L-7"));
        fs.meta_info.insert(meta_keys::MACHINE.to_string(), json!(12));
        assert_eq!(fs.meta_str(meta_keys::LOT).as_deref(), Some("L-7"));
        assert_eq!(fs.meta_str(meta_keys::MACHINE).as_deref(), Some("12"));
    }

    #[test]
    fn test_inference_status_transitions() {
        use InferenceStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Finished));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Finished.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Finished));
    }

    #[test]
    fn test_region_box_well_formed() {
        assert!(RegionBox::new(0.0, 0.0, 2.0, 2.0).is_well_formed());
        assert!(!RegionBox::new(0.0, 0.0, 0.0, 2.0).is_well_formed());
        assert!(!RegionBox::new(f64::NAN, 0.0, 1.0, 1.0).is_well_formed());
        assert_eq!(RegionBox::new(1.0, 2.0, 3.0, 4.0).corners(), [1.0, 2.0, 4.0, 6.0]);
    }
}
