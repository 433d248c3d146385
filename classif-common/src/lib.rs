//! # classif-ai Common Library
//!
//! Shared code for the classif-ai inspection analytics workspace:
//! - Domain models (regions, file sets, models, inference queue)
//! - Tenant database schema initialization
//! - Outbound message types (image handler envelope)
//! - Configuration loading and analysis settings
//! - Time bucketing helpers

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod time;

pub use error::{Error, Result};
