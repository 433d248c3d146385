//! classif-ai library interface
//!
//! Region reconciliation, performance analytics and the inference queue for
//! per-tenant defect classification data.

pub mod db;
pub mod error;
pub mod meta_schema;
pub mod services;
pub mod tenant;
pub mod utils;

pub use crate::error::{AnalysisError, AnalysisResult};
pub use crate::meta_schema::MetaInfoSchema;
pub use crate::tenant::{TenantContext, TenantRegistry};
