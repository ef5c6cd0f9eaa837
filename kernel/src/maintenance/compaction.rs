// Compaction & Clustering
//
// Rewrites small or overlapping active files into fewer, larger ones and
// commits the result as an OPTIMIZE version carrying the same logical rows.
// With a clustering column the rewritten rows are sorted on it and split
// into contiguous ranges, so each new file's statistics cover a narrow,
// non-overlapping interval.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::datafile::{read_data_file, write_data_file, DataFileMeta, FileId, FileStore};
use crate::log::{CommitMetrics, LogError, LogStore, Manifest, Operation, Version};
use crate::merge::Draft;
use crate::record::{RecordBatch, Row, Schema, Value};
use crate::table::{Table, TableError};

pub const DEFAULT_SMALL_FILE_BYTES: u64 = 1024 * 1024;
pub const DEFAULT_TARGET_ROWS_PER_FILE: usize = 100_000;
pub const DEFAULT_MIN_FILES: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionOptions {
    /// Files smaller than this (and holding fewer than
    /// `target_rows_per_file` rows) are rewritten.
    pub small_file_bytes: u64,
    pub target_rows_per_file: usize,
    /// Fewer candidates than this and the run is a no-op.
    pub min_files: usize,
    /// Sort and range-partition rewritten rows on this column.
    pub cluster_by: Option<String>,
}

impl Default for CompactionOptions {
    fn default() -> Self {
        Self {
            small_file_bytes: DEFAULT_SMALL_FILE_BYTES,
            target_rows_per_file: DEFAULT_TARGET_ROWS_PER_FILE,
            min_files: DEFAULT_MIN_FILES,
            cluster_by: None,
        }
    }
}

impl CompactionOptions {
    pub fn clustered(mut self, column: impl Into<String>) -> Self {
        self.cluster_by = Some(column.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    /// Version committed, `None` when there was nothing to rewrite.
    pub version: Option<Version>,
    pub files_rewritten: usize,
    pub files_written: usize,
    pub rows_rewritten: u64,
}

impl CompactionReport {
    fn nothing() -> Self {
        Self {
            version: None,
            files_rewritten: 0,
            files_written: 0,
            rows_rewritten: 0,
        }
    }
}

/// Files selected for one rewrite together with what replaces them.
struct Rewrite {
    schema: Schema,
    candidates: Vec<DataFileMeta>,
    written: Vec<DataFileMeta>,
    rows: u64,
}

/// Compact (and optionally cluster) the active files of `table`.
///
/// Holds no lock while rewriting. When the final compare-and-set loses,
/// the rewrite is rebased onto the new version if every candidate is still
/// active there under the same schema; otherwise it is recomputed.
pub fn compact<L: LogStore, F: FileStore>(
    table: &Table<L, F>,
    options: &CompactionOptions,
) -> Result<CompactionReport, TableError> {
    let max_attempts = table.options().max_commit_retries.max(1);
    let mut rewrite: Option<Rewrite> = None;
    let mut attempts = 0;

    loop {
        attempts += 1;
        let Some(base) = table.latest_manifest()? else {
            return Ok(CompactionReport::nothing());
        };

        let still_valid = rewrite.as_ref().map_or(false, |r| {
            r.schema == base.schema && r.candidates.iter().all(|c| base.references(&c.id))
        });
        if still_valid {
            debug!(table = table.name(), version = base.version, "rebasing rewrite onto new version");
        } else {
            let candidates = select_candidates(&base, options);
            if candidates.len() < options.min_files.max(1) {
                debug!(
                    table = table.name(),
                    version = base.version,
                    candidates = candidates.len(),
                    "not enough files to compact"
                );
                return Ok(CompactionReport::nothing());
            }
            rewrite = Some(rewrite_files(table, &base, candidates, options)?);
        }
        let Some(plan) = rewrite.as_ref() else {
            return Ok(CompactionReport::nothing());
        };

        let manifest = optimize_manifest(table, &base, plan);
        match table.log().append(&manifest) {
            Ok(()) => {
                info!(
                    table = table.name(),
                    version = manifest.version,
                    operation = %Operation::Optimize,
                    files_rewritten = plan.candidates.len(),
                    files_written = plan.written.len(),
                    "committed version"
                );
                return Ok(CompactionReport {
                    version: Some(manifest.version),
                    files_rewritten: plan.candidates.len(),
                    files_written: plan.written.len(),
                    rows_rewritten: plan.rows,
                });
            }
            Err(LogError::VersionConflict { .. }) if attempts < max_attempts => {
                debug!(
                    table = table.name(),
                    base_version = base.version,
                    attempts,
                    operation = %Operation::Optimize,
                    "lost commit race"
                );
            }
            Err(LogError::VersionConflict { .. }) => {
                return Err(TableError::ConcurrentModification {
                    table: table.name().to_string(),
                    operation: Operation::Optimize,
                    attempts,
                    base_version: base.version,
                });
            }
            Err(e) => return Err(TableError::log(table.name(), Operation::Optimize, e)),
        }
    }
}

/// Small files, plus (when clustering) every file whose range on the
/// clustering column overlaps another active file's range.
fn select_candidates(base: &Manifest, options: &CompactionOptions) -> Vec<DataFileMeta> {
    let small = |f: &DataFileMeta| {
        f.size_bytes < options.small_file_bytes
            && (f.row_count as usize) < options.target_rows_per_file
    };
    let overlapping: HashSet<FileId> = match &options.cluster_by {
        Some(column) => overlapping_files(&base.files, column),
        None => HashSet::new(),
    };
    base.files
        .iter()
        .filter(|f| small(f) || overlapping.contains(&f.id))
        .cloned()
        .collect()
}

fn overlapping_files(files: &[DataFileMeta], column: &str) -> HashSet<FileId> {
    let ranges: Vec<(FileId, &Value, &Value)> = files
        .iter()
        .filter_map(|f| {
            let stats = f.stats.get(column)?;
            Some((f.id, stats.min.as_ref()?, stats.max.as_ref()?))
        })
        .collect();

    let mut overlapping = HashSet::new();
    for (i, (a, a_min, a_max)) in ranges.iter().enumerate() {
        for (b, b_min, b_max) in &ranges[i + 1..] {
            if a_min <= b_max && b_min <= a_max {
                overlapping.insert(*a);
                overlapping.insert(*b);
            }
        }
    }
    overlapping
}

fn rewrite_files<L: LogStore, F: FileStore>(
    table: &Table<L, F>,
    base: &Manifest,
    candidates: Vec<DataFileMeta>,
    options: &CompactionOptions,
) -> Result<Rewrite, TableError> {
    let mut rows: Vec<Row> = Vec::new();
    for meta in &candidates {
        let batch = read_data_file(table.files(), meta)
            .map_err(|e| TableError::storage(table.name(), Operation::Optimize, e))?;
        rows.extend(batch.project(&base.schema).into_rows());
    }
    let total = rows.len() as u64;

    let key = options
        .cluster_by
        .as_ref()
        .and_then(|column| base.schema.index_of(column));
    if let Some(idx) = key {
        rows.sort_by(|a, b| a[idx].cmp(&b[idx]));
    }

    let now = table.now();
    let mut written = Vec::new();
    for chunk in split_rows(rows, options.target_rows_per_file.max(1), key) {
        let batch = RecordBatch::from_parts_unchecked(base.schema.clone(), chunk);
        let meta = write_data_file(table.files(), &batch, now)
            .map_err(|e| TableError::storage(table.name(), Operation::Optimize, e))?;
        written.push(meta);
    }

    debug!(
        table = table.name(),
        version = base.version,
        rewritten = candidates.len(),
        written = written.len(),
        rows = total,
        "rewrote candidate files"
    );
    Ok(Rewrite {
        schema: base.schema.clone(),
        candidates,
        written,
        rows: total,
    })
}

/// Split into chunks of `target` rows. With a clustering key, a chunk is
/// extended until the key changes so no value straddles two files.
fn split_rows(rows: Vec<Row>, target: usize, key: Option<usize>) -> Vec<Vec<Row>> {
    let mut chunks: Vec<Vec<Row>> = Vec::new();
    let mut current: Vec<Row> = Vec::with_capacity(target);
    for row in rows {
        if current.len() >= target {
            let same_key = key.map_or(false, |idx| {
                current.last().map_or(false, |last| last[idx] == row[idx])
            });
            if !same_key {
                chunks.push(std::mem::take(&mut current));
            }
        }
        current.push(row);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn optimize_manifest<L: LogStore, F: FileStore>(
    table: &Table<L, F>,
    base: &Manifest,
    plan: &Rewrite,
) -> Manifest {
    let rewritten: HashSet<FileId> = plan.candidates.iter().map(|c| c.id).collect();
    let mut files: Vec<DataFileMeta> = base
        .files
        .iter()
        .filter(|f| !rewritten.contains(&f.id))
        .cloned()
        .collect();
    files.extend(plan.written.iter().cloned());

    Draft {
        operation: Operation::Optimize,
        schema: base.schema.clone(),
        constraints: base.constraints.clone(),
        files,
        added: plan.written.iter().map(|f| f.id).collect(),
        removed: plan.candidates.clone(),
        metrics: CommitMetrics {
            rows_copied: plan.rows,
            files_added: plan.written.len() as u64,
            files_removed: plan.candidates.len() as u64,
            ..Default::default()
        },
    }
    .into_manifest(table.name(), Some(base), table.now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::WriteMode;
    use crate::record::{DataType, Field};
    use crate::table::{InMemoryTable, TableOptions};

    fn day(date: &str, close: f64) -> RecordBatch {
        let schema = Schema::new(vec![
            Field::required("date", DataType::Utf8),
            Field::required("close", DataType::Float64),
        ])
        .unwrap();
        RecordBatch::try_new(schema, vec![vec![Value::from(date), Value::Float64(close)]]).unwrap()
    }

    fn sorted(mut rows: Vec<Row>) -> Vec<Row> {
        rows.sort();
        rows
    }

    fn table_with_days(days: &[&str]) -> InMemoryTable {
        let table = InMemoryTable::in_memory("crypto_daily", TableOptions::default());
        for (i, d) in days.iter().enumerate() {
            table.commit(&day(d, i as f64 + 1.0), &WriteMode::Append).unwrap();
        }
        table
    }

    #[test]
    fn compaction_merges_small_files_and_keeps_rows() {
        let table = table_with_days(&["2025-10-03", "2025-10-01", "2025-10-02"]);
        let before = table.read_latest().unwrap();

        let report = compact(&table, &CompactionOptions::default()).unwrap();

        assert_eq!(report.version, Some(4));
        assert_eq!(report.files_rewritten, 3);
        assert_eq!(report.files_written, 1);

        let manifest = table.latest_manifest().unwrap().unwrap();
        assert_eq!(manifest.operation, Operation::Optimize);
        assert_eq!(manifest.files.len(), 1);
        let after = table.read_latest().unwrap();
        assert_eq!(
            sorted(after.records.into_rows()),
            sorted(before.records.into_rows())
        );
    }

    #[test]
    fn single_small_file_is_left_alone() {
        let table = table_with_days(&["2025-10-01"]);

        let report = compact(&table, &CompactionOptions::default()).unwrap();

        assert_eq!(report, CompactionReport::nothing());
        assert_eq!(table.current_version().unwrap(), 1);
    }

    #[test]
    fn clustering_produces_disjoint_ranges() {
        let table = table_with_days(&["2025-10-04", "2025-10-01", "2025-10-03", "2025-10-02"]);
        let options = CompactionOptions {
            target_rows_per_file: 2,
            ..CompactionOptions::default()
        }
        .clustered("date");

        compact(&table, &options).unwrap();

        let manifest = table.latest_manifest().unwrap().unwrap();
        let ranges: Vec<(Value, Value)> = manifest
            .files
            .iter()
            .map(|f| {
                let s = &f.stats["date"];
                (s.min.clone().unwrap(), s.max.clone().unwrap())
            })
            .collect();
        assert_eq!(
            ranges,
            vec![
                (Value::from("2025-10-01"), Value::from("2025-10-02")),
                (Value::from("2025-10-03"), Value::from("2025-10-04")),
            ]
        );

        // Full, disjoint files are not rewritten again.
        let again = compact(&table, &options).unwrap();
        assert_eq!(again.version, None);
    }

    #[test]
    fn split_keeps_equal_keys_together() {
        let rows: Vec<Row> = ["a", "a", "a", "b"]
            .iter()
            .map(|k| vec![Value::from(*k)])
            .collect();

        let chunks = split_rows(rows, 2, Some(0));

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 3);
    }
}
