// Lake Configuration
//
// Retry bounds, maintenance thresholds and per-table declarations, loaded
// from JSON. The kernel itself only ever sees the derived `TableOptions`,
// `CompactionOptions` and `VacuumOptions`.

use std::fs;
use std::path::Path;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::constraints::{Constraint, ConstraintParseError};
use crate::maintenance::compaction::{
    CompactionOptions, DEFAULT_MIN_FILES, DEFAULT_SMALL_FILE_BYTES, DEFAULT_TARGET_ROWS_PER_FILE,
};
use crate::maintenance::vacuum::{VacuumOptions, DEFAULT_RETENTION_HOURS};
use crate::pipeline::{Cleaning, ExtractionMode, GoldAggregate};
use crate::table::{TableOptions, DEFAULT_MAX_COMMIT_RETRIES};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config `{path}`: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("table `{table}`: {source}")]
    Constraint {
        table: String,
        #[source]
        source: ConstraintParseError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Bronze,
    Silver,
    Gold,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    pub max_retries: u32,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_COMMIT_RETRIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    pub small_file_bytes: u64,
    pub target_rows_per_file: usize,
    pub min_files: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            small_file_bytes: DEFAULT_SMALL_FILE_BYTES,
            target_rows_per_file: DEFAULT_TARGET_ROWS_PER_FILE,
            min_files: DEFAULT_MIN_FILES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VacuumConfig {
    pub retention_hours: i64,
    pub enforce_retention: bool,
    pub min_retention_hours: i64,
}

impl Default for VacuumConfig {
    fn default() -> Self {
        Self {
            retention_hours: DEFAULT_RETENTION_HOURS,
            enforce_retention: true,
            min_retention_hours: DEFAULT_RETENTION_HOURS,
        }
    }
}

/// Declaration of one table of the lake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    pub layer: Layer,
    /// Constraint expressions such as `"close > 0"`.
    #[serde(default)]
    pub constraints: Vec<String>,
    /// Empty for tables extracted in full.
    #[serde(default)]
    pub merge_key: Vec<String>,
    #[serde(default)]
    pub cluster_by: Option<String>,
}

impl TableConfig {
    pub fn extraction_mode(&self) -> ExtractionMode {
        if self.merge_key.is_empty() {
            ExtractionMode::Full
        } else {
            ExtractionMode::Incremental {
                key: self.merge_key.clone(),
            }
        }
    }

    pub fn parsed_constraints(&self) -> Result<Vec<Constraint>, ConfigError> {
        self.constraints
            .iter()
            .map(|expr| {
                Constraint::parse(expr).map_err(|source| ConfigError::Constraint {
                    table: self.name.clone(),
                    source,
                })
            })
            .collect()
    }
}

/// One source entity: which tables it flows through and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowConfig {
    pub bronze: String,
    pub silver: String,
    pub gold: String,
    /// Columns that must be non-null in Silver.
    #[serde(default)]
    pub required: Vec<String>,
    /// Predicates whose failing rows Silver drops.
    #[serde(default)]
    pub cleaning: Vec<String>,
    #[serde(default)]
    pub dedupe_key: Option<Vec<String>>,
    pub aggregate: AggregateConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregateConfig {
    Monthly { period_column: String, value_column: String },
    Latest { order_by: String },
}

impl FlowConfig {
    pub fn cleaning(&self) -> Result<Cleaning, ConfigError> {
        let mut cleaning = Cleaning::default().require(self.required.iter().cloned());
        for expr in &self.cleaning {
            let predicate = Constraint::parse(expr).map_err(|source| ConfigError::Constraint {
                table: self.silver.clone(),
                source,
            })?;
            cleaning = cleaning.with_predicate(predicate);
        }
        if let Some(key) = &self.dedupe_key {
            cleaning = cleaning.dedupe_rows_by(key.iter().cloned());
        }
        Ok(cleaning)
    }

    pub fn aggregate(&self) -> GoldAggregate {
        match &self.aggregate {
            AggregateConfig::Monthly {
                period_column,
                value_column,
            } => GoldAggregate::monthly(period_column.clone(), value_column.clone()),
            AggregateConfig::Latest { order_by } => GoldAggregate::latest(order_by.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LakeConfig {
    pub commit: CommitConfig,
    pub compaction: CompactionConfig,
    pub vacuum: VacuumConfig,
    pub tables: Vec<TableConfig>,
    /// Keyed by source feed name.
    pub flows: std::collections::BTreeMap<String, FlowConfig>,
}

impl LakeConfig {
    /// Built-in layout for the AlphaVantage feeds (used if no config is provided).
    pub fn default_config() -> Self {
        let table = |name: &str, layer, constraints: &[&str], key: &[&str], cluster: Option<&str>| {
            TableConfig {
                name: name.into(),
                layer,
                constraints: constraints.iter().map(|c| c.to_string()).collect(),
                merge_key: key.iter().map(|k| k.to_string()).collect(),
                cluster_by: cluster.map(Into::into),
            }
        };
        let mut flows = std::collections::BTreeMap::new();
        flows.insert(
            "alphavantage/digital_currency_daily".to_string(),
            FlowConfig {
                bronze: "digital_currency_daily".into(),
                silver: "crypto_daily_clean".into(),
                gold: "crypto_monthly_summary".into(),
                required: vec!["datetime".into(), "close".into()],
                cleaning: vec!["close > 0".into()],
                dedupe_key: Some(vec!["datetime".into()]),
                aggregate: AggregateConfig::Monthly {
                    period_column: "date".into(),
                    value_column: "close".into(),
                },
            },
        );
        flows.insert(
            "alphavantage/currency_exchange_rate".to_string(),
            FlowConfig {
                bronze: "currency_exchange_rate".into(),
                silver: "exchange_rate_clean".into(),
                gold: "exchange_rate_latest".into(),
                required: vec![],
                cleaning: vec![],
                dedupe_key: Some(vec!["last_refreshed".into()]),
                aggregate: AggregateConfig::Latest {
                    order_by: "last_refreshed".into(),
                },
            },
        );

        Self {
            commit: CommitConfig::default(),
            compaction: CompactionConfig::default(),
            vacuum: VacuumConfig::default(),
            tables: vec![
                table("digital_currency_daily", Layer::Bronze, &["close > 0"], &["datetime"], Some("date")),
                table("currency_exchange_rate", Layer::Bronze, &[], &[], None),
                table("crypto_daily_clean", Layer::Silver, &["close > 0"], &["datetime"], Some("date")),
                table("exchange_rate_clean", Layer::Silver, &[], &[], None),
                table("crypto_monthly_summary", Layer::Gold, &[], &[], Some("month")),
                table("exchange_rate_latest", Layer::Gold, &[], &[], None),
            ],
            flows,
        }
    }

    pub fn from_json(path: &str, json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        Self::from_json(&display, &json)
    }

    pub fn table(&self, name: &str) -> Option<&TableConfig> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Options for `name`; undeclared tables get no constraints.
    pub fn table_options(&self, name: &str) -> Result<TableOptions, ConfigError> {
        let constraints = match self.table(name) {
            Some(table) => table.parsed_constraints()?,
            None => Vec::new(),
        };
        Ok(TableOptions {
            constraints,
            max_commit_retries: self.commit.max_retries,
            ..TableOptions::default()
        })
    }

    pub fn compaction_options(&self, name: &str) -> CompactionOptions {
        CompactionOptions {
            small_file_bytes: self.compaction.small_file_bytes,
            target_rows_per_file: self.compaction.target_rows_per_file,
            min_files: self.compaction.min_files,
            cluster_by: self.table(name).and_then(|t| t.cluster_by.clone()),
        }
    }

    pub fn vacuum_options(&self) -> VacuumOptions {
        VacuumOptions {
            retention: Duration::hours(self.vacuum.retention_hours),
            enforce_retention: self.vacuum.enforce_retention,
            min_retention: Duration::hours(self.vacuum.min_retention_hours),
            dry_run: false,
        }
    }
}
