// Table Handle
//
// A `Table` pairs one version log with one data-file pool. Every
// operation takes the handle explicitly; there is no process-wide state.
// Reads resolve a single manifest and reconstruct rows from exactly the
// files it lists, so they never observe a partially committed version.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::constraints::Constraint;
use crate::datafile::{read_data_file, FileStore, FileStoreError, FsFileStore, InMemoryFileStore};
use crate::log::{
    CommitMetrics, FsLogStore, InMemoryLogStore, LogError, LogStore, Manifest, Operation, Version,
    VersionLog,
};
use crate::merge::{self, CommitOutcome, WriteMode};
use crate::record::{RecordBatch, Row, Schema, Value};
use crate::schema::SchemaError;

/// Default bound on compare-and-set attempts per commit.
pub const DEFAULT_MAX_COMMIT_RETRIES: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("table `{table}`: {operation} rejected, schema incompatible: {source}")]
    SchemaIncompatible {
        table: String,
        operation: Operation,
        #[source]
        source: SchemaError,
    },

    #[error("table `{table}`: {operation} rejected, constraint `{constraint}` violated by rows {rows:?}")]
    ConstraintViolation {
        table: String,
        operation: Operation,
        constraint: String,
        rows: Vec<usize>,
    },

    #[error("table `{table}`: {operation} lost the commit race {attempts} times (last base version {base_version})")]
    ConcurrentModification {
        table: String,
        operation: Operation,
        attempts: u32,
        base_version: Version,
    },

    #[error("table `{table}`: VACUUM refused: {reason}")]
    VacuumUnsafe { table: String, reason: String },

    #[error("table `{table}`: source feed failed, nothing committed: {message}")]
    SourceFeed { table: String, message: String },

    #[error("table `{table}`: {operation} rejected, incoming batch is empty")]
    EmptyBatch { table: String, operation: Operation },

    #[error("table `{table}`: {operation} rejected, merge key `{column}` {problem}")]
    MergeKey {
        table: String,
        operation: Operation,
        column: String,
        problem: String,
    },

    #[error("table `{table}`: version {version} does not exist")]
    VersionNotFound { table: String, version: Version },

    #[error("table `{table}`: no version committed at or before {at}")]
    NoVersionAsOf { table: String, at: DateTime<Utc> },

    #[error("table `{table}`: {context} failed in the version log: {source}")]
    Log {
        table: String,
        context: String,
        #[source]
        source: LogError,
    },

    #[error("table `{table}`: {context} failed on a data file: {source}")]
    Storage {
        table: String,
        context: String,
        #[source]
        source: FileStoreError,
    },
}

impl TableError {
    pub(crate) fn log(table: &str, context: impl ToString, source: LogError) -> Self {
        TableError::Log {
            table: table.to_string(),
            context: context.to_string(),
            source,
        }
    }

    pub(crate) fn storage(table: &str, context: impl ToString, source: FileStoreError) -> Self {
        TableError::Storage {
            table: table.to_string(),
            context: context.to_string(),
            source,
        }
    }
}

/// Knobs a table is opened with.
#[derive(Clone)]
pub struct TableOptions {
    /// Constraints enforced on every data-changing commit, in addition to
    /// those already recorded in the log.
    pub constraints: Vec<Constraint>,
    pub max_commit_retries: u32,
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for TableOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableOptions")
            .field("constraints", &self.constraints)
            .field("max_commit_retries", &self.max_commit_retries)
            .finish_non_exhaustive()
    }
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            constraints: Vec::new(),
            max_commit_retries: DEFAULT_MAX_COMMIT_RETRIES,
            clock: Arc::new(SystemClock),
        }
    }
}

impl TableOptions {
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Point in history to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeTravel {
    Version(Version),
    Timestamp(DateTime<Utc>),
}

/// Rows of one version together with its schema.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSnapshot {
    pub version: Version,
    pub timestamp: Option<DateTime<Utc>>,
    pub schema: Schema,
    pub records: RecordBatch,
}

/// Inclusive range predicate on one column, used to skip files.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanFilter {
    pub column: String,
    pub lower: Option<Value>,
    pub upper: Option<Value>,
}

impl ScanFilter {
    pub fn between(column: impl Into<String>, lower: Value, upper: Value) -> Self {
        Self {
            column: column.into(),
            lower: Some(lower),
            upper: Some(upper),
        }
    }

    fn matches(&self, value: &Value) -> bool {
        use std::cmp::Ordering::{Greater, Less};
        if value.is_null() {
            return false;
        }
        let above = self
            .lower
            .as_ref()
            .map_or(true, |l| !matches!(value.compare(l), Some(Less) | None));
        let below = self
            .upper
            .as_ref()
            .map_or(true, |u| !matches!(value.compare(u), Some(Greater) | None));
        above && below
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    pub version: Version,
    pub records: RecordBatch,
    pub files_scanned: usize,
    pub files_skipped: usize,
}

/// One line of table history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub version: Version,
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
    pub row_count: u64,
    pub file_count: usize,
    pub metrics: CommitMetrics,
}

/// A named, versioned table.
pub struct Table<L: LogStore = FsLogStore, F: FileStore = FsFileStore> {
    name: String,
    log: VersionLog<L>,
    files: F,
    options: TableOptions,
}

pub type InMemoryTable = Table<InMemoryLogStore, InMemoryFileStore>;

impl InMemoryTable {
    /// Table whose log and pool live in memory, sharing the options' clock.
    pub fn in_memory(name: impl Into<String>, options: TableOptions) -> Self {
        let files = InMemoryFileStore::with_clock(options.clock.clone());
        Table::new(name, InMemoryLogStore::default(), files, options)
    }
}

impl Table<FsLogStore, FsFileStore> {
    /// Open (or lazily create) the table rooted at `root`. The table is
    /// named after the directory.
    pub fn open(root: impl AsRef<Path>, options: TableOptions) -> Self {
        let root = root.as_ref();
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| root.display().to_string());
        Table::new(name, FsLogStore::new(root), FsFileStore::new(root), options)
    }
}

impl<L: LogStore, F: FileStore> Table<L, F> {
    pub fn new(name: impl Into<String>, log: L, files: F, options: TableOptions) -> Self {
        Self {
            name: name.into(),
            log: VersionLog::new(log),
            files,
            options,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn log(&self) -> &VersionLog<L> {
        &self.log
    }

    pub fn files(&self) -> &F {
        &self.files
    }

    pub fn options(&self) -> &TableOptions {
        &self.options
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.options.clock.now()
    }

    /// Commit `batch` with the given mode. See [`merge::commit`].
    pub fn commit(&self, batch: &RecordBatch, mode: &WriteMode) -> Result<CommitOutcome, TableError> {
        merge::commit(self, batch, mode)
    }

    pub fn current_version(&self) -> Result<Version, TableError> {
        self.log
            .current_version()
            .map_err(|e| TableError::log(&self.name, "resolve current version", e))
    }

    pub fn latest_manifest(&self) -> Result<Option<Manifest>, TableError> {
        self.log
            .latest()
            .map_err(|e| TableError::log(&self.name, "read latest", e))
    }

    pub fn manifest(&self, version: Version) -> Result<Manifest, TableError> {
        self.log.get(version).map_err(|e| match e {
            LogError::NotFound { version } => TableError::VersionNotFound {
                table: self.name.clone(),
                version,
            },
            other => TableError::log(&self.name, format!("read version {version}"), other),
        })
    }

    /// Current rows, schema and version.
    pub fn read_latest(&self) -> Result<TableSnapshot, TableError> {
        match self.latest_manifest()? {
            Some(manifest) => self.materialize(&manifest),
            None => Ok(empty_snapshot()),
        }
    }

    /// Rows exactly as they were at a prior version or instant.
    pub fn read_as_of(&self, at: TimeTravel) -> Result<TableSnapshot, TableError> {
        let manifest = match at {
            TimeTravel::Version(0) => return Ok(empty_snapshot()),
            TimeTravel::Version(version) => self.manifest(version)?,
            TimeTravel::Timestamp(ts) => self
                .log
                .as_of(ts)
                .map_err(|e| TableError::log(&self.name, "time travel", e))?
                .ok_or_else(|| TableError::NoVersionAsOf {
                    table: self.name.clone(),
                    at: ts,
                })?,
        };
        self.materialize(&manifest)
    }

    /// Latest rows whose `filter.column` falls within the range, reading
    /// only files whose statistics overlap it.
    pub fn scan(&self, filter: &ScanFilter) -> Result<ScanResult, TableError> {
        let Some(manifest) = self.latest_manifest()? else {
            return Ok(ScanResult {
                version: 0,
                records: RecordBatch::empty(Schema::empty()),
                files_scanned: 0,
                files_skipped: 0,
            });
        };

        let mut rows: Vec<Row> = Vec::new();
        let mut scanned = 0;
        for meta in &manifest.files {
            if !meta.may_contain(&filter.column, filter.lower.as_ref(), filter.upper.as_ref()) {
                continue;
            }
            scanned += 1;
            let batch = read_data_file(&self.files, meta)
                .map_err(|e| TableError::storage(&self.name, "scan", e))?
                .project(&manifest.schema);
            let idx = manifest.schema.index_of(&filter.column);
            rows.extend(
                batch
                    .into_rows()
                    .into_iter()
                    .filter(|row| idx.map_or(false, |i| filter.matches(&row[i]))),
            );
        }
        let skipped = manifest.files.len() - scanned;
        debug!(table = %self.name, version = manifest.version, scanned, skipped, "scan pruned files");

        Ok(ScanResult {
            version: manifest.version,
            records: RecordBatch::from_parts_unchecked(manifest.schema.clone(), rows),
            files_scanned: scanned,
            files_skipped: skipped,
        })
    }

    /// Commit history, oldest first.
    pub fn history(&self) -> Result<Vec<HistoryEntry>, TableError> {
        let manifests = self
            .log
            .replay()
            .map_err(|e| TableError::log(&self.name, "read history", e))?;
        Ok(manifests
            .into_iter()
            .map(|m| HistoryEntry {
                version: m.version,
                timestamp: m.timestamp,
                operation: m.operation,
                row_count: m.row_count(),
                file_count: m.files.len(),
                metrics: m.metrics,
            })
            .collect())
    }

    /// Rebuild the row set of `manifest` from its file list. Older files are
    /// widened to the manifest's schema; columns they predate read as null.
    pub fn materialize(&self, manifest: &Manifest) -> Result<TableSnapshot, TableError> {
        let records = self.read_files(manifest)?;
        Ok(TableSnapshot {
            version: manifest.version,
            timestamp: Some(manifest.timestamp),
            schema: manifest.schema.clone(),
            records,
        })
    }

    pub(crate) fn read_files(&self, manifest: &Manifest) -> Result<RecordBatch, TableError> {
        let mut rows: Vec<Row> = Vec::with_capacity(manifest.row_count() as usize);
        for meta in &manifest.files {
            let batch = read_data_file(&self.files, meta).map_err(|e| {
                TableError::storage(&self.name, format!("read version {}", manifest.version), e)
            })?;
            rows.extend(batch.project(&manifest.schema).into_rows());
        }
        Ok(RecordBatch::from_parts_unchecked(
            manifest.schema.clone(),
            rows,
        ))
    }
}

fn empty_snapshot() -> TableSnapshot {
    TableSnapshot {
        version: 0,
        timestamp: None,
        schema: Schema::empty(),
        records: RecordBatch::empty(Schema::empty()),
    }
}
