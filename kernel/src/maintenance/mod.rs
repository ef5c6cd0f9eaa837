// Maintenance Engine
//
// Out-of-band jobs that reorganise storage without changing logical
// contents. Each job is an ordinary committer: it reads the current
// version, works without locks, and publishes through the log's
// compare-and-set with bounded retries.

pub mod compaction;
pub mod vacuum;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::datafile::FileStore;
use crate::log::{LogStore, LOG_DIR};
use crate::table::{Table, TableError, TableOptions};

pub use compaction::{compact, CompactionOptions, CompactionReport};
pub use vacuum::{vacuum, VacuumOptions, VacuumReport};

#[derive(Debug, thiserror::Error)]
pub enum MaintenanceError {
    #[error("cannot scan lake root `{path}`: {source}")]
    Discover {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaintenanceTask {
    Optimize(CompactionOptions),
    Vacuum(VacuumOptions),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaintenanceOutcome {
    Optimized(CompactionReport),
    Vacuumed(VacuumReport),
}

/// What to run on one discovered table.
pub struct MaintenancePlan {
    pub options: TableOptions,
    pub task: MaintenanceTask,
}

/// Result for one table of a lake-wide run.
#[derive(Debug)]
pub struct TableReport {
    pub table: String,
    pub path: PathBuf,
    pub outcome: Result<MaintenanceOutcome, TableError>,
}

/// Every directory under `root` (including `root`) that holds a version log.
/// Table directories are not searched further.
pub fn discover_tables(root: &Path) -> Result<Vec<PathBuf>, MaintenanceError> {
    let mut tables = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        if dir.join(LOG_DIR).is_dir() {
            tables.push(dir);
            continue;
        }
        let entries = fs::read_dir(&dir).map_err(|source| MaintenanceError::Discover {
            path: dir.display().to_string(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| MaintenanceError::Discover {
                path: dir.display().to_string(),
                source,
            })?;
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                pending.push(entry.path());
            }
        }
    }
    tables.sort();
    Ok(tables)
}

/// Run one task on a table.
pub fn run<L: LogStore, F: FileStore>(
    table: &Table<L, F>,
    task: &MaintenanceTask,
) -> Result<MaintenanceOutcome, TableError> {
    match task {
        MaintenanceTask::Optimize(options) => compact(table, options).map(MaintenanceOutcome::Optimized),
        MaintenanceTask::Vacuum(options) => vacuum(table, options).map(MaintenanceOutcome::Vacuumed),
    }
}

/// Run maintenance on every table under `root`.
///
/// `plan` picks options and task per table name. A failing table is
/// reported and the run continues with the next one.
pub fn run_on_lake(
    root: &Path,
    plan: impl Fn(&str) -> MaintenancePlan,
) -> Result<Vec<TableReport>, MaintenanceError> {
    let mut reports = Vec::new();
    for path in discover_tables(root)? {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let MaintenancePlan { options, task } = plan(&name);
        let table = Table::open(&path, options);

        let outcome = run(&table, &task);
        match &outcome {
            Ok(_) => info!(table = %name, path = %path.display(), "maintenance finished"),
            Err(e) => warn!(table = %name, path = %path.display(), error = %e, "maintenance failed"),
        }
        reports.push(TableReport {
            table: name,
            path,
            outcome,
        });
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_finds_log_directories_only() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("bronze/crypto_daily").join(LOG_DIR)).unwrap();
        fs::create_dir_all(root.path().join("gold/summary").join(LOG_DIR)).unwrap();
        fs::create_dir_all(root.path().join("scratch/empty")).unwrap();

        let tables = discover_tables(root.path()).unwrap();

        assert_eq!(
            tables,
            vec![
                root.path().join("bronze/crypto_daily"),
                root.path().join("gold/summary"),
            ]
        );
    }
}
