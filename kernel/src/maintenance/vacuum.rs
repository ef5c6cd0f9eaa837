// Vacuum
//
// Physically deletes data files no reader inside the retention window can
// reach. A file is protected when it is listed by:
//
// - the current version
// - any version committed at or after `now - retention`
// - the newest version committed before that cutoff (it was current at
//   the start of the window, so time travel to the window edge needs it)
//
// Unprotected files are deleted only when their stored modification time is
// also older than the cutoff, which keeps files of in-flight commits safe.

use std::collections::HashSet;

use chrono::Duration;
use tracing::{debug, info, warn};

use crate::datafile::{FileStore, FileStoreError};
use crate::log::{CommitMetrics, LogError, LogStore, Manifest, Operation, Version};
use crate::merge::Draft;
use crate::table::{Table, TableError};

pub const DEFAULT_RETENTION_HOURS: i64 = 168;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VacuumOptions {
    pub retention: Duration,
    /// Refuse retentions shorter than `min_retention`.
    pub enforce_retention: bool,
    pub min_retention: Duration,
    /// Report candidates without deleting or committing.
    pub dry_run: bool,
}

impl Default for VacuumOptions {
    fn default() -> Self {
        Self {
            retention: Duration::hours(DEFAULT_RETENTION_HOURS),
            enforce_retention: true,
            min_retention: Duration::hours(DEFAULT_RETENTION_HOURS),
            dry_run: false,
        }
    }
}

impl VacuumOptions {
    pub fn retain_hours(mut self, hours: i64) -> Self {
        self.retention = Duration::hours(hours);
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VacuumReport {
    /// VACUUM version committed, `None` for dry runs or when nothing was deleted.
    pub version: Option<Version>,
    /// Versions whose files were kept.
    pub protected_versions: Vec<Version>,
    /// Paths eligible for deletion.
    pub candidates: Vec<String>,
    pub deleted: Vec<String>,
    pub dry_run: bool,
}

/// Delete unreachable data files of `table` and record a VACUUM version.
pub fn vacuum<L: LogStore, F: FileStore>(
    table: &Table<L, F>,
    options: &VacuumOptions,
) -> Result<VacuumReport, TableError> {
    if options.enforce_retention && options.retention < options.min_retention {
        warn!(
            table = table.name(),
            retention_hours = options.retention.num_hours(),
            min_retention_hours = options.min_retention.num_hours(),
            "refusing vacuum below minimum retention"
        );
        return Err(TableError::VacuumUnsafe {
            table: table.name().to_string(),
            reason: format!(
                "retention of {}h is below the minimum of {}h; disable retention enforcement to override",
                options.retention.num_hours(),
                options.min_retention.num_hours()
            ),
        });
    }
    if options.retention < Duration::zero() {
        return Err(TableError::VacuumUnsafe {
            table: table.name().to_string(),
            reason: "retention must not be negative".into(),
        });
    }

    let max_attempts = table.options().max_commit_retries.max(1);
    let mut attempts = 0;
    let (latest, plan) = loop {
        attempts += 1;
        let plan = plan_vacuum(table, options)?;
        // A version published while planning may change what is protected.
        let current = table.current_version()?;
        if current == plan.latest_version {
            break (current, plan);
        }
        if attempts >= max_attempts {
            warn!(
                table = table.name(),
                planned = plan.latest_version,
                current,
                attempts,
                "table kept advancing during vacuum planning"
            );
            return Err(TableError::ConcurrentModification {
                table: table.name().to_string(),
                operation: Operation::Vacuum,
                attempts,
                base_version: plan.latest_version,
            });
        }
        debug!(table = table.name(), planned = plan.latest_version, current, "replanning vacuum");
    };

    let mut report = VacuumReport {
        version: None,
        protected_versions: plan.protected,
        candidates: plan.candidates,
        deleted: Vec::new(),
        dry_run: options.dry_run,
    };
    if options.dry_run || report.candidates.is_empty() || latest == 0 {
        debug!(
            table = table.name(),
            version = latest,
            candidates = report.candidates.len(),
            dry_run = options.dry_run,
            "vacuum deletes nothing"
        );
        return Ok(report);
    }

    for path in &report.candidates {
        match table.files().delete(path) {
            Ok(()) | Err(FileStoreError::NotFound { .. }) => report.deleted.push(path.clone()),
            Err(e) => return Err(TableError::storage(table.name(), Operation::Vacuum, e)),
        }
    }

    report.version = Some(record_vacuum(table, report.deleted.len() as u64)?);
    Ok(report)
}

struct VacuumPlan {
    latest_version: Version,
    protected: Vec<Version>,
    candidates: Vec<String>,
}

fn plan_vacuum<L: LogStore, F: FileStore>(
    table: &Table<L, F>,
    options: &VacuumOptions,
) -> Result<VacuumPlan, TableError> {
    let manifests = table
        .log()
        .replay()
        .map_err(|e| TableError::log(table.name(), Operation::Vacuum, e))?;
    let cutoff = table.now() - options.retention;

    let latest_version = manifests.last().map_or(0, |m| m.version);
    let edge = manifests
        .iter()
        .filter(|m| m.timestamp < cutoff)
        .map(|m| m.version)
        .max();
    let protected: Vec<&Manifest> = manifests
        .iter()
        .filter(|m| {
            m.version == latest_version || m.timestamp >= cutoff || Some(m.version) == edge
        })
        .collect();

    let referenced: HashSet<&str> = protected
        .iter()
        .flat_map(|m| m.files.iter().map(|f| f.path.as_str()))
        .collect();
    let candidates: Vec<String> = table
        .files()
        .list()
        .map_err(|e| TableError::storage(table.name(), Operation::Vacuum, e))?
        .into_iter()
        .filter(|f| !referenced.contains(f.path.as_str()) && f.modified < cutoff)
        .map(|f| f.path)
        .collect();

    Ok(VacuumPlan {
        latest_version,
        protected: protected.iter().map(|m| m.version).collect(),
        candidates,
    })
}

/// Append a VACUUM version that keeps the active file set unchanged.
fn record_vacuum<L: LogStore, F: FileStore>(
    table: &Table<L, F>,
    deleted: u64,
) -> Result<Version, TableError> {
    let max_attempts = table.options().max_commit_retries.max(1);
    let mut attempts = 0;
    loop {
        attempts += 1;
        let Some(base) = table.latest_manifest()? else {
            return Ok(0);
        };
        let manifest = Draft {
            operation: Operation::Vacuum,
            schema: base.schema.clone(),
            constraints: base.constraints.clone(),
            files: base.files.clone(),
            added: Vec::new(),
            removed: Vec::new(),
            metrics: CommitMetrics {
                files_deleted: deleted,
                ..Default::default()
            },
        }
        .into_manifest(table.name(), Some(&base), table.now());

        match table.log().append(&manifest) {
            Ok(()) => {
                info!(
                    table = table.name(),
                    version = manifest.version,
                    operation = %Operation::Vacuum,
                    files_deleted = deleted,
                    "committed version"
                );
                return Ok(manifest.version);
            }
            Err(LogError::VersionConflict { .. }) if attempts < max_attempts => {
                debug!(table = table.name(), attempts, "vacuum record lost commit race");
            }
            Err(LogError::VersionConflict { .. }) => {
                return Err(TableError::ConcurrentModification {
                    table: table.name().to_string(),
                    operation: Operation::Vacuum,
                    attempts,
                    base_version: base.version,
                });
            }
            Err(e) => return Err(TableError::log(table.name(), Operation::Vacuum, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::clock::ManualClock;
    use crate::merge::WriteMode;
    use crate::record::{DataType, Field, RecordBatch, Schema, Value};
    use crate::table::{InMemoryTable, TableOptions, TimeTravel};

    fn batch(date: &str, close: f64) -> RecordBatch {
        let schema = Schema::new(vec![
            Field::required("date", DataType::Utf8),
            Field::required("close", DataType::Float64),
        ])
        .unwrap();
        RecordBatch::try_new(schema, vec![vec![Value::from(date), Value::Float64(close)]]).unwrap()
    }

    fn setup() -> (Arc<ManualClock>, InMemoryTable) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 10, 1, 0, 0, 0).unwrap(),
        ));
        let table = InMemoryTable::in_memory(
            "crypto_daily",
            TableOptions::default().with_clock(clock.clone()),
        );
        (clock, table)
    }

    #[test]
    fn short_retention_is_refused_when_enforced() {
        let (_, table) = setup();

        let err = vacuum(&table, &VacuumOptions::default().retain_hours(1)).unwrap_err();
        assert!(matches!(err, TableError::VacuumUnsafe { .. }));

        let relaxed = VacuumOptions {
            enforce_retention: false,
            ..VacuumOptions::default().retain_hours(1)
        };
        assert!(vacuum(&table, &relaxed).is_ok());
    }

    #[test]
    fn files_outside_window_are_deleted_and_window_stays_readable() {
        let (clock, table) = setup();
        table.commit(&batch("2025-10-01", 1.0), &WriteMode::Overwrite).unwrap();
        clock.advance(Duration::days(1));
        table.commit(&batch("2025-10-02", 2.0), &WriteMode::Overwrite).unwrap();
        clock.advance(Duration::days(10));
        table.commit(&batch("2025-10-12", 3.0), &WriteMode::Overwrite).unwrap();
        clock.advance(Duration::days(1));

        let report = vacuum(&table, &VacuumOptions::default()).unwrap();

        // v1 is older than the edge version v2 and is the only thing dropped.
        assert_eq!(report.protected_versions, vec![2, 3]);
        assert_eq!(report.deleted.len(), 1);
        assert_eq!(report.version, Some(4));
        assert!(table.read_as_of(TimeTravel::Version(2)).is_ok());
        assert!(table.read_as_of(TimeTravel::Version(1)).is_err());
        assert_eq!(table.read_latest().unwrap().records.num_rows(), 1);
    }

    #[test]
    fn dry_run_lists_without_deleting() {
        let (clock, table) = setup();
        table.commit(&batch("2025-10-01", 1.0), &WriteMode::Overwrite).unwrap();
        table.commit(&batch("2025-10-02", 2.0), &WriteMode::Overwrite).unwrap();
        clock.advance(Duration::days(30));
        table.commit(&batch("2025-10-31", 3.0), &WriteMode::Overwrite).unwrap();
        clock.advance(Duration::days(30));

        let report = vacuum(&table, &VacuumOptions::default().dry_run()).unwrap();

        assert_eq!(report.candidates.len(), 2);
        assert!(report.deleted.is_empty());
        assert_eq!(report.version, None);
        assert_eq!(table.files().list().unwrap().len(), 3);
        assert_eq!(table.current_version().unwrap(), 3);
    }
}
