mod logging;
mod output;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value as Json;
use tracing::{info, warn};

use tierlake_kernel::adapters::alphavantage::{Endpoint, ResponseFeed};
use tierlake_kernel::config::{Layer, LakeConfig};
use tierlake_kernel::maintenance::{self, MaintenancePlan, MaintenanceTask, TableReport};
use tierlake_kernel::pipeline::{run_flow, Flow, SourceFeed};
use tierlake_kernel::replay::verify_log;
use tierlake_kernel::table::{Table, TimeTravel};

use output::{
    HistoryOutput, HistoryRow, IngestOutput, LakeOutput, LayerOutput, ShowOutput, TableResult,
    VerifyOutput,
};

/// Tierlake versioned table store
#[derive(Parser, Debug)]
#[command(name = "tierlake")]
#[command(about = "Versioned bronze/silver/gold tables with merge and maintenance", long_about = None)]
struct Cli {
    /// Path to lake config JSON
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Land a saved API response in bronze, then refresh silver and gold
    Ingest {
        /// Lake root directory
        #[arg(long)]
        lake: PathBuf,

        #[arg(long, value_enum)]
        endpoint: EndpointArg,

        /// Path to the raw JSON response
        #[arg(long)]
        response: PathBuf,
    },

    /// Compact (and cluster) every table under the lake root
    Optimize {
        #[arg(long)]
        lake: PathBuf,
    },

    /// Delete unreachable data files of every table under the lake root
    Vacuum {
        #[arg(long)]
        lake: PathBuf,

        /// Override the configured retention
        #[arg(long)]
        retention_hours: Option<i64>,

        /// Allow a retention below the configured minimum
        #[arg(long)]
        no_enforce_retention: bool,

        /// List candidates without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Commit history of one table
    History {
        #[arg(long)]
        table: PathBuf,
    },

    /// Rows of one table, latest or as of a version / instant
    Show {
        #[arg(long)]
        table: PathBuf,

        #[arg(long, conflicts_with = "as_of")]
        version: Option<u64>,

        /// RFC 3339 timestamp
        #[arg(long)]
        as_of: Option<DateTime<Utc>>,
    },

    /// Replay one table's log and check every version transition
    Verify {
        #[arg(long)]
        table: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum EndpointArg {
    DigitalCurrencyDaily,
    CurrencyExchangeRate,
}

impl From<EndpointArg> for Endpoint {
    fn from(arg: EndpointArg) -> Self {
        match arg {
            EndpointArg::DigitalCurrencyDaily => Endpoint::DigitalCurrencyDaily,
            EndpointArg::CurrencyExchangeRate => Endpoint::CurrencyExchangeRate,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    // ----------------------------
    // Load config
    // ----------------------------
    let config = match &cli.config {
        Some(path) => LakeConfig::load(path)?,
        None => LakeConfig::default_config(),
    };

    // ----------------------------
    // Run command and print output
    // ----------------------------
    match cli.command {
        Command::Ingest {
            lake,
            endpoint,
            response,
        } => print(&ingest(&config, &lake, endpoint.into(), &response)?),
        Command::Optimize { lake } => {
            let reports = maintenance::run_on_lake(&lake, |name| MaintenancePlan {
                options: config.table_options(name).unwrap_or_default(),
                task: MaintenanceTask::Optimize(config.compaction_options(name)),
            })?;
            print(&lake_output("optimize", &lake, reports))
        }
        Command::Vacuum {
            lake,
            retention_hours,
            no_enforce_retention,
            dry_run,
        } => {
            let mut options = config.vacuum_options();
            if let Some(hours) = retention_hours {
                options.retention = chrono::Duration::hours(hours);
            }
            options.enforce_retention &= !no_enforce_retention;
            options.dry_run = dry_run;
            let reports = maintenance::run_on_lake(&lake, |name| MaintenancePlan {
                options: config.table_options(name).unwrap_or_default(),
                task: MaintenanceTask::Vacuum(options.clone()),
            })?;
            print(&lake_output("vacuum", &lake, reports))
        }
        Command::History { table } => {
            let table = open(&config, &table)?;
            print(&HistoryOutput {
                table: table.name().to_string(),
                history: table.history()?.into_iter().map(HistoryRow::from).collect(),
            })
        }
        Command::Show {
            table,
            version,
            as_of,
        } => {
            let table = open(&config, &table)?;
            let snapshot = match (version, as_of) {
                (Some(v), _) => table.read_as_of(TimeTravel::Version(v))?,
                (None, Some(ts)) => table.read_as_of(TimeTravel::Timestamp(ts))?,
                (None, None) => table.read_latest()?,
            };
            print(&ShowOutput::new(table.name(), snapshot))
        }
        Command::Verify { table } => {
            let table = open(&config, &table)?;
            let output = VerifyOutput::new(table.name(), verify_log(table.log())?);
            print(&output)?;
            if !output.clean {
                warn!(table = table.name(), findings = output.findings.len(), "log verification failed");
                bail!("log of `{}` has {} inconsistencies", table.name(), output.findings.len());
            }
            Ok(())
        }
    }
}

fn print<T: Serialize>(output: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(output)?);
    Ok(())
}

fn open(config: &LakeConfig, path: &Path) -> Result<Table> {
    if !path.is_dir() {
        bail!("table directory `{}` does not exist", path.display());
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let options = config.table_options(&name)?;
    Ok(Table::open(path, options))
}

fn table_path(config: &LakeConfig, lake: &Path, name: &str, fallback: Layer) -> PathBuf {
    let layer = config.table(name).map_or(fallback, |t| t.layer);
    let dir = match layer {
        Layer::Bronze => "bronze",
        Layer::Silver => "silver",
        Layer::Gold => "gold",
    };
    lake.join(dir).join(name)
}

fn ingest(config: &LakeConfig, lake: &Path, endpoint: Endpoint, response: &Path) -> Result<IngestOutput> {
    let body = fs::read_to_string(response)
        .with_context(|| format!("reading response `{}`", response.display()))?;
    let body: Json = serde_json::from_str(&body)
        .with_context(|| format!("parsing response `{}`", response.display()))?;
    let feed = ResponseFeed::new(endpoint, body);

    let flow_config = config
        .flows
        .get(feed.name())
        .with_context(|| format!("no flow configured for feed `{}`", feed.name()))?;

    let bronze_path = table_path(config, lake, &flow_config.bronze, Layer::Bronze);
    let silver_path = table_path(config, lake, &flow_config.silver, Layer::Silver);
    let gold_path = table_path(config, lake, &flow_config.gold, Layer::Gold);
    for dir in [&bronze_path, &silver_path, &gold_path] {
        fs::create_dir_all(dir).with_context(|| format!("creating `{}`", dir.display()))?;
    }

    let bronze = Table::open(&bronze_path, config.table_options(&flow_config.bronze)?);
    let silver = Table::open(&silver_path, config.table_options(&flow_config.silver)?);
    let gold = Table::open(&gold_path, config.table_options(&flow_config.gold)?);
    let flow = Flow {
        bronze: &bronze,
        silver: &silver,
        gold: &gold,
        cleaning: flow_config.cleaning()?,
        aggregate: flow_config.aggregate(),
    };

    let report = run_flow(&flow, &feed)?;
    info!(
        feed = feed.name(),
        bronze = report.bronze.version(),
        silver_changed = report.silver.as_ref().map_or(false, |o| !o.is_noop()),
        gold_changed = report.gold.is_some(),
        "ingest finished"
    );
    Ok(IngestOutput {
        feed: feed.name().to_string(),
        endpoint: endpoint.to_string(),
        bronze: LayerOutput::new(bronze.name(), Some(&report.bronze)),
        silver: LayerOutput::new(silver.name(), report.silver.as_ref()),
        gold: LayerOutput::new(gold.name(), report.gold.as_ref()),
    })
}

fn lake_output(task: &str, lake: &Path, reports: Vec<TableReport>) -> LakeOutput {
    let output = LakeOutput::from(reports);
    for table in &output.tables {
        if let TableResult::Failed { error } = &table.result {
            warn!(task, table = %table.table, path = %table.path, %error, "table skipped");
        }
    }
    let failed = output.failures();
    if failed > 0 {
        warn!(task, lake = %lake.display(), tables = output.tables.len(), failed, "lake maintenance finished with failures");
    } else {
        info!(task, lake = %lake.display(), tables = output.tables.len(), "lake maintenance finished");
    }
    output
}
