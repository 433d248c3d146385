//! Configuration loading and root folder resolution
//!
//! Settings sources, highest priority first:
//! 1. Command-line argument
//! 2. Environment variable (`CLASSIF_ROOT_FOLDER`)
//! 3. TOML config file
//! 4. OS-dependent compiled default

use crate::db::DefectId;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV: &str = "CLASSIF_ROOT_FOLDER";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Folder holding `tenants/<tenant>.db` and per-tenant schema files
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub analysis: AnalysisSettings,

    /// Loaded predictors kept per worker before LRU eviction
    #[serde(default = "default_registry_capacity")]
    pub registry_capacity: usize,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            root_folder: None,
            logging: LoggingConfig::default(),
            analysis: AnalysisSettings::default(),
            registry_capacity: default_registry_capacity(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or an env-filter directive
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Tunables for reconciliation and the analytics engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSettings {
    /// Minimum IoU (exclusive) for two boxes to be considered the same region
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f64,

    /// Defect priority for yield attribution, highest priority first
    #[serde(default = "default_ordered_defect_ids")]
    pub ordered_defect_ids: Vec<DefectId>,

    /// Labels meaning "no defect" (e.g. OK / nuisance classes)
    #[serde(default)]
    pub non_defective_ids: Vec<DefectId>,

    /// Confidence threshold for models that do not define their own
    #[serde(default)]
    pub default_confidence_threshold: f64,

    /// Attempts made while waiting for a queue entry to become visible
    #[serde(default = "default_queue_visibility_max_attempts")]
    pub queue_visibility_max_attempts: u32,

    /// First backoff delay; doubles per attempt (capped at one second)
    #[serde(default = "default_queue_visibility_base_delay_ms")]
    pub queue_visibility_base_delay_ms: u64,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            iou_threshold: default_iou_threshold(),
            ordered_defect_ids: default_ordered_defect_ids(),
            non_defective_ids: Vec::new(),
            default_confidence_threshold: 0.0,
            queue_visibility_max_attempts: default_queue_visibility_max_attempts(),
            queue_visibility_base_delay_ms: default_queue_visibility_base_delay_ms(),
        }
    }
}

impl AnalysisSettings {
    /// Reject settings that would make matching or retries meaningless
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.iou_threshold) {
            return Err(Error::Config(format!(
                "iou_threshold must be in [0, 1), got {}",
                self.iou_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.default_confidence_threshold) {
            return Err(Error::Config(format!(
                "default_confidence_threshold must be in [0, 1], got {}",
                self.default_confidence_threshold
            )));
        }
        if self.queue_visibility_max_attempts == 0 {
            return Err(Error::Config(
                "queue_visibility_max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_registry_capacity() -> usize {
    8
}

fn default_iou_threshold() -> f64 {
    0.4
}

fn default_ordered_defect_ids() -> Vec<DefectId> {
    vec![1, 2, 4, 5, 3, 6]
}

fn default_queue_visibility_max_attempts() -> u32 {
    20
}

fn default_queue_visibility_base_delay_ms() -> u64 {
    50
}

/// Load the TOML configuration
///
/// An explicitly requested file must exist and parse. Without one, the
/// platform config file is used when present; otherwise defaults apply
/// with a warning (a missing config never stops startup).
pub fn load_toml_config(explicit_path: Option<&Path>) -> Result<TomlConfig> {
    if let Some(path) = explicit_path {
        return read_toml_config(path);
    }

    match default_config_path() {
        Some(path) if path.exists() => read_toml_config(&path),
        Some(path) => {
            warn!(
                "Config file not found at {}, using built-in defaults",
                path.display()
            );
            Ok(TomlConfig::default())
        }
        None => {
            warn!("Could not determine config directory, using built-in defaults");
            Ok(TomlConfig::default())
        }
    }
}

fn read_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;
    config.analysis.validate()?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

/// `~/.config/classif-ai/config.toml` (platform equivalent elsewhere)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("classif-ai").join("config.toml"))
}

/// Resolve the root folder following the documented priority order
pub fn resolve_root_folder(cli_arg: Option<&Path>, config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &config.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// OS-dependent default root folder
fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("classif-ai"))
        .unwrap_or_else(|| PathBuf::from("./classif_data"))
}
