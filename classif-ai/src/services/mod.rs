//! Service modules for region reconciliation, analytics and inference

pub mod analysis;
pub mod filters;
pub mod geometry;
pub mod inference_runner;
pub mod model_registry;
pub mod reconciler;

pub use analysis::AnalysisService;
pub use filters::FilterCriteria;
pub use geometry::{iou, GeometryError};
pub use inference_runner::{InferenceReport, InferenceRunner};
pub use model_registry::{ModelLoader, ModelRegistry, Prediction, Predictor};
pub use reconciler::{Correction, NewRegion, ReconcileOutcome, RegionReconciler, RejectOutcome};
