// Command Output
//
// JSON shapes printed on stdout, one struct per command.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value as Json};

use tierlake_kernel::log::{CommitMetrics, Operation, Version};
use tierlake_kernel::maintenance::{MaintenanceOutcome, TableReport};
use tierlake_kernel::merge::CommitOutcome;
use tierlake_kernel::record::{RecordBatch, Schema, Value};
use tierlake_kernel::replay::VerificationReport;
use tierlake_kernel::table::{HistoryEntry, TableSnapshot};

#[derive(Debug, Serialize)]
pub struct IngestOutput {
    pub feed: String,
    pub endpoint: String,
    pub bronze: LayerOutput,
    pub silver: LayerOutput,
    pub gold: LayerOutput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerStatus {
    Committed,
    Unchanged,
    Skipped,
}

/// What one ingest step did to its table.
#[derive(Debug, Serialize)]
pub struct LayerOutput {
    pub table: String,
    pub status: LayerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<CommitMetrics>,
}

impl LayerOutput {
    pub fn new(table: &str, outcome: Option<&CommitOutcome>) -> Self {
        let (status, version, metrics) = match outcome {
            Some(CommitOutcome::Committed { version, metrics }) => {
                (LayerStatus::Committed, Some(*version), Some(metrics.clone()))
            }
            Some(CommitOutcome::NoOp { version }) => (LayerStatus::Unchanged, Some(*version), None),
            None => (LayerStatus::Skipped, None, None),
        };
        Self {
            table: table.to_string(),
            status,
            version,
            metrics,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LakeOutput {
    pub tables: Vec<TableOutput>,
}

#[derive(Debug, Serialize)]
pub struct TableOutput {
    pub table: String,
    pub path: String,
    pub result: TableResult,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableResult {
    Optimized {
        version: Option<Version>,
        files_rewritten: usize,
        files_written: usize,
        rows_rewritten: u64,
    },
    Vacuumed {
        version: Option<Version>,
        dry_run: bool,
        protected_versions: Vec<Version>,
        candidates: Vec<String>,
        deleted: Vec<String>,
    },
    Failed {
        error: String,
    },
}

impl LakeOutput {
    pub fn failures(&self) -> usize {
        self.tables
            .iter()
            .filter(|t| matches!(t.result, TableResult::Failed { .. }))
            .count()
    }
}

impl From<Vec<TableReport>> for LakeOutput {
    fn from(reports: Vec<TableReport>) -> Self {
        let tables = reports
            .into_iter()
            .map(|r| {
                let result = match r.outcome {
                    Ok(MaintenanceOutcome::Optimized(c)) => TableResult::Optimized {
                        version: c.version,
                        files_rewritten: c.files_rewritten,
                        files_written: c.files_written,
                        rows_rewritten: c.rows_rewritten,
                    },
                    Ok(MaintenanceOutcome::Vacuumed(v)) => TableResult::Vacuumed {
                        version: v.version,
                        dry_run: v.dry_run,
                        protected_versions: v.protected_versions,
                        candidates: v.candidates,
                        deleted: v.deleted,
                    },
                    Err(e) => TableResult::Failed {
                        error: e.to_string(),
                    },
                };
                TableOutput {
                    table: r.table,
                    path: r.path.display().to_string(),
                    result,
                }
            })
            .collect();
        Self { tables }
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryOutput {
    pub table: String,
    pub history: Vec<HistoryRow>,
}

#[derive(Debug, Serialize)]
pub struct HistoryRow {
    pub version: Version,
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
    pub rows: u64,
    pub files: usize,
    pub metrics: CommitMetrics,
}

impl From<HistoryEntry> for HistoryRow {
    fn from(h: HistoryEntry) -> Self {
        Self {
            version: h.version,
            timestamp: h.timestamp,
            operation: h.operation,
            rows: h.row_count,
            files: h.file_count,
            metrics: h.metrics,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ShowOutput {
    pub table: String,
    pub version: Version,
    pub timestamp: Option<DateTime<Utc>>,
    pub schema: Schema,
    pub rows: Vec<Map<String, Json>>,
}

impl ShowOutput {
    pub fn new(table: &str, snapshot: TableSnapshot) -> Self {
        Self {
            table: table.to_string(),
            version: snapshot.version,
            timestamp: snapshot.timestamp,
            rows: rows_json(&snapshot.records),
            schema: snapshot.schema,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct VerifyOutput {
    pub table: String,
    pub current_version: Version,
    pub versions_checked: u64,
    pub clean: bool,
    pub findings: Vec<FindingOutput>,
}

#[derive(Debug, Serialize)]
pub struct FindingOutput {
    pub version: Version,
    pub kind: String,
    pub message: String,
}

impl VerifyOutput {
    pub fn new(table: &str, report: VerificationReport) -> Self {
        Self {
            table: table.to_string(),
            current_version: report.current_version,
            versions_checked: report.versions_checked,
            clean: report.is_clean(),
            findings: report
                .findings
                .into_iter()
                .map(|f| FindingOutput {
                    version: f.version,
                    kind: format!("{:?}", f.kind),
                    message: f.message,
                })
                .collect(),
        }
    }
}

fn value_json(value: &Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Boolean(b) => Json::from(*b),
        Value::Int64(i) => Json::from(*i),
        Value::Float64(f) => Json::from(*f),
        Value::Utf8(s) => Json::from(s.as_str()),
        Value::Date(d) => Json::from(d.format("%Y-%m-%d").to_string()),
        Value::Timestamp(t) => Json::from(t.to_rfc3339()),
    }
}

fn rows_json(records: &RecordBatch) -> Vec<Map<String, Json>> {
    records
        .rows()
        .iter()
        .map(|row| {
            records
                .schema()
                .fields()
                .iter()
                .zip(row)
                .map(|(field, value)| (field.name.clone(), value_json(value)))
                .collect()
        })
        .collect()
}
