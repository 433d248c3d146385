//! classif-ai - defect classification analytics
//!
//! Command-line front end over one tenant's data: initialize a tenant
//! database and print performance reports as JSON.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use classif_common::config::{load_toml_config, resolve_root_folder, TomlConfig};
use classif_common::time::TimeFormat;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use classif_ai::services::analysis::YieldGroupBy;
use classif_ai::services::{AnalysisService, FilterCriteria, RegionReconciler};
use classif_ai::{AnalysisError, AnalysisResult, TenantRegistry};

#[derive(Parser, Debug)]
#[command(name = "classif-ai")]
#[command(about = "Defect classification analytics")]
#[command(version)]
struct Cli {
    /// TOML config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Folder holding tenant databases
    #[arg(long, global = true, env = "CLASSIF_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Log level or env-filter directive; overrides RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[arg(long, global = true, default_value = "default")]
    tenant: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone, Default)]
struct FilterArgs {
    /// Query string, e.g. `ml_model_id__in=1,2&date__gte=2024-01-01`
    #[arg(long, default_value = "")]
    filter: String,
}

impl FilterArgs {
    fn criteria(&self) -> AnalysisResult<FilterCriteria> {
        FilterCriteria::from_query_string(&self.filter)
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DistributionKind {
    Defect,
    UseCase,
    Wafer,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TrendMetric {
    Accuracy,
    Automation,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the tenant database if missing
    Init,
    /// Accuracy, precision, recall and automation summary
    Report {
        #[command(flatten)]
        filter: FilterArgs,
        /// Include per-defect rows
        #[arg(long)]
        per_defect: bool,
    },
    /// Ground truth versus prediction per file
    Confusion {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Yield loss grouped by machine, lot or time bucket
    YieldLoss {
        #[command(flatten)]
        filter: FilterArgs,
        /// machine, lot, daily, weekly or monthly
        #[arg(long, default_value = "lot")]
        group_by: String,
        /// Split rows per defect
        #[arg(long)]
        by_defect: bool,
        /// Attribute each file set to its highest-priority defect only
        #[arg(long, requires = "by_defect")]
        priority: bool,
    },
    /// Accuracy or automation over time
    Trend {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long, value_enum, default_value = "accuracy")]
        metric: TrendMetric,
        #[arg(long, default_value = "daily")]
        time_format: String,
    },
    /// Overkill and escape rates over time
    Overkill {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long, default_value = "daily")]
        time_format: String,
    },
    /// Counts per defect, use case or wafer
    Distribution {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long, value_enum, default_value = "defect")]
        kind: DistributionKind,
    },
    /// Audit trail of one region
    History {
        #[arg(long)]
        region_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_toml_config(cli.config.as_deref()).context("Failed to load configuration")?;

    init_tracing(cli.log_level.as_deref(), &config);

    let root_folder = resolve_root_folder(cli.root_folder.as_deref(), &config);
    info!(root_folder = %root_folder.display(), tenant = %cli.tenant, "Starting classif-ai");

    let registry = TenantRegistry::new(root_folder);
    match execute(&registry, &config, &cli).await {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(err) => {
            eprintln!("{}", serde_json::to_string_pretty(&json!({
                "status": err.status_code(),
                "error": err.body(),
            }))?);
            std::process::exit(1);
        }
    }
}

/// `--log-level`, then `RUST_LOG`, then the TOML `[logging] level`
fn init_tracing(cli_level: Option<&str>, config: &TomlConfig) {
    let filter = match cli_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn to_json<T: Serialize>(value: &T) -> AnalysisResult<Value> {
    serde_json::to_value(value).map_err(|e| AnalysisError::Internal(format!("Serialize output: {}", e)))
}

/// Drop the per-defect rows unless asked for
fn report_output(mut summary: Value, per_defect: bool) -> Value {
    if !per_defect {
        if let Some(fields) = summary.as_object_mut() {
            fields.remove("per_defect");
        }
    }
    summary
}

async fn execute(registry: &TenantRegistry, config: &TomlConfig, cli: &Cli) -> AnalysisResult<Value> {
    let ctx = registry.context(&cli.tenant).await?;
    let settings = config.analysis.clone();

    let load = |filter: &FilterArgs| {
        let ctx = ctx.clone();
        let settings = settings.clone();
        let criteria = filter.criteria();
        async move { AnalysisService::load(&ctx, criteria?, settings).await }
    };

    match &cli.command {
        Command::Init => Ok(json!({
            "tenant": ctx.tenant,
            "database": registry.database_path(&cli.tenant).display().to_string(),
            "meta_schema": ctx.meta_schema().is_some(),
        })),
        Command::Report { filter, per_defect } => {
            let service = load(filter).await?;
            Ok(report_output(to_json(&service.summary())?, *per_defect))
        }
        Command::Confusion { filter } => to_json(&load(filter).await?.confusion_matrix()),
        Command::YieldLoss {
            filter,
            group_by,
            by_defect,
            priority,
        } => {
            let group_by = YieldGroupBy::parse(group_by)?;
            let service = load(filter).await?;
            if *by_defect {
                to_json(&service.yield_loss_by_defect(group_by, *priority))
            } else {
                to_json(&service.yield_loss(group_by))
            }
        }
        Command::Trend {
            filter,
            metric,
            time_format,
        } => {
            let format = TimeFormat::parse(time_format)?;
            let service = load(filter).await?;
            match metric {
                TrendMetric::Accuracy => to_json(&service.accuracy_trend(format)),
                TrendMetric::Automation => to_json(&service.automation_trend(format)),
            }
        }
        Command::Overkill { filter, time_format } => {
            let format = TimeFormat::parse(time_format)?;
            to_json(&load(filter).await?.overkill_trend(format))
        }
        Command::Distribution { filter, kind } => {
            let service = load(filter).await?;
            match kind {
                DistributionKind::Defect => to_json(&service.defect_distribution()),
                DistributionKind::UseCase => to_json(&service.use_case_distribution()),
                DistributionKind::Wafer => to_json(&service.wafer_distribution()),
            }
        }
        Command::History { region_id } => {
            let reconciler = RegionReconciler::new(&ctx, &settings);
            to_json(&reconciler.region_history(*region_id).await?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_per_defect_flag() {
        let cli = Cli::try_parse_from(["classif-ai", "report", "--per-defect", "--filter", "ml_model_id__in=1"]).unwrap();
        let Command::Report { filter, per_defect } = &cli.command else {
            panic!("expected report, got {:?}", cli.command);
        };
        assert!(*per_defect);
        assert_eq!(filter.filter, "ml_model_id__in=1");

        let summary = json!({"precision": "N/A", "per_defect": [{"defect_id": 1}]});
        assert_eq!(report_output(summary.clone(), true), summary);
        assert_eq!(report_output(summary, false), json!({"precision": "N/A"}));
    }

    #[test]
    fn test_priority_requires_by_defect() {
        assert!(Cli::try_parse_from(["classif-ai", "yield-loss", "--priority"]).is_err());
        assert!(Cli::try_parse_from(["classif-ai", "yield-loss", "--by-defect", "--priority"]).is_ok());
    }
}
