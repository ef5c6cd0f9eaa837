// Merge Engine
//
// Reconciles an incoming batch with a table's current version and
// publishes the result as the next version. Each attempt:
//
// 1. reads the current manifest (base version `V`)
// 2. evolves the schema and validates constraints, before any file I/O
// 3. computes which files survive, which are removed and which rows must
//    be written
// 4. writes new data files, then compare-and-sets the log to `V + 1`
//
// Losing the compare-and-set restarts from step 1 against the new base.
// Files written by a losing attempt stay unreferenced until vacuumed.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::constraints::{Constraint, ConstraintValidator};
use crate::datafile::{read_data_file, write_data_file, DataFileMeta, FileId, FileStore};
use crate::log::{CommitMetrics, LogError, LogStore, Manifest, Operation, Version};
use crate::record::{RecordBatch, Row, Schema, Value};
use crate::schema::{conform, reconcile};
use crate::table::{Table, TableError};

/// How incoming rows combine with the current table contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteMode {
    /// Add rows; nothing existing is touched.
    Append,
    /// Replace the whole active file set.
    Overwrite,
    /// Upsert on the key columns; last row wins for duplicate keys.
    Merge { key: Vec<String> },
}

impl WriteMode {
    pub fn merge<I, S>(key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        WriteMode::Merge {
            key: key.into_iter().map(Into::into).collect(),
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            WriteMode::Append => Operation::Append,
            WriteMode::Overwrite => Operation::Overwrite,
            WriteMode::Merge { .. } => Operation::Merge,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed {
        version: Version,
        metrics: CommitMetrics,
    },
    /// The merge would not change the table; nothing was written.
    NoOp { version: Version },
}

impl CommitOutcome {
    pub fn version(&self) -> Version {
        match self {
            CommitOutcome::Committed { version, .. } | CommitOutcome::NoOp { version } => *version,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, CommitOutcome::NoOp { .. })
    }
}

/// Everything a new manifest needs besides its position in the log.
pub(crate) struct Draft {
    pub operation: Operation,
    pub schema: Schema,
    pub constraints: Vec<Constraint>,
    pub files: Vec<DataFileMeta>,
    pub added: Vec<FileId>,
    pub removed: Vec<DataFileMeta>,
    pub metrics: CommitMetrics,
}

impl Draft {
    /// Place the draft directly after `base`. Timestamps never go backwards
    /// so that timestamp time travel resolves to a single version.
    pub(crate) fn into_manifest(
        self,
        table: &str,
        base: Option<&Manifest>,
        now: DateTime<Utc>,
    ) -> Manifest {
        let base_version = base.map_or(0, |m| m.version);
        let timestamp = base.map_or(now, |m| m.timestamp.max(now));
        Manifest {
            table: table.to_string(),
            version: base_version + 1,
            base_version,
            timestamp,
            operation: self.operation,
            schema: self.schema,
            constraints: self.constraints,
            files: self.files,
            added: self.added,
            removed: self.removed,
            metrics: self.metrics,
        }
    }
}

/// Rows to write plus the base files they supersede.
struct Plan {
    schema: Schema,
    constraints: Vec<Constraint>,
    kept: Vec<DataFileMeta>,
    removed: Vec<DataFileMeta>,
    rows: Vec<Row>,
    metrics: CommitMetrics,
}

/// Commit `batch` to `table` using `mode`.
///
/// Schema evolution and constraint checks run before any file is written;
/// when either fails the table is left untouched. A merge that changes
/// nothing returns [`CommitOutcome::NoOp`] without creating a version.
pub fn commit<L: LogStore, F: FileStore>(
    table: &Table<L, F>,
    batch: &RecordBatch,
    mode: &WriteMode,
) -> Result<CommitOutcome, TableError> {
    let operation = mode.operation();
    if batch.is_empty() {
        return Err(TableError::EmptyBatch {
            table: table.name().to_string(),
            operation,
        });
    }

    let max_attempts = table.options().max_commit_retries.max(1);
    let mut attempts = 0;
    loop {
        attempts += 1;
        let base = table.latest_manifest()?;
        let base_version = base.as_ref().map_or(0, |m| m.version);

        let Some(plan) = plan(table, base.as_ref(), batch, mode)? else {
            warn!(
                table = table.name(),
                version = base_version,
                %operation,
                "merge changes nothing, commit elided"
            );
            return Ok(CommitOutcome::NoOp {
                version: base_version,
            });
        };

        let now = table.now();
        let mut files = plan.kept;
        let mut added = Vec::new();
        let mut metrics = plan.metrics;
        if !plan.rows.is_empty() {
            let rows = RecordBatch::from_parts_unchecked(plan.schema.clone(), plan.rows);
            let meta = write_data_file(table.files(), &rows, now)
                .map_err(|e| TableError::storage(table.name(), operation, e))?;
            added.push(meta.id);
            files.push(meta);
        }
        metrics.files_added = added.len() as u64;
        metrics.files_removed = plan.removed.len() as u64;

        let manifest = Draft {
            operation,
            schema: plan.schema,
            constraints: plan.constraints,
            files,
            added,
            removed: plan.removed,
            metrics: metrics.clone(),
        }
        .into_manifest(table.name(), base.as_ref(), now);

        match table.log().append(&manifest) {
            Ok(()) => {
                info!(
                    table = table.name(),
                    version = manifest.version,
                    %operation,
                    rows_inserted = metrics.rows_inserted,
                    rows_updated = metrics.rows_updated,
                    files_added = metrics.files_added,
                    files_removed = metrics.files_removed,
                    "committed version"
                );
                return Ok(CommitOutcome::Committed {
                    version: manifest.version,
                    metrics,
                });
            }
            Err(LogError::VersionConflict { .. }) if attempts < max_attempts => {
                debug!(
                    table = table.name(),
                    base_version,
                    attempts,
                    %operation,
                    "lost commit race, recomputing against new base"
                );
            }
            Err(LogError::VersionConflict { .. }) => {
                return Err(TableError::ConcurrentModification {
                    table: table.name().to_string(),
                    operation,
                    attempts,
                    base_version,
                });
            }
            Err(e) => return Err(TableError::log(table.name(), operation, e)),
        }
    }
}

/// Union of recorded and declared constraints, recorded first.
pub(crate) fn effective_constraints(
    base: Option<&Manifest>,
    declared: &[Constraint],
) -> Vec<Constraint> {
    let mut constraints: Vec<Constraint> = base.map(|m| m.constraints.clone()).unwrap_or_default();
    for constraint in declared {
        if constraints.iter().all(|c| c.name != constraint.name) {
            constraints.push(constraint.clone());
        }
    }
    constraints
}

fn plan<L: LogStore, F: FileStore>(
    table: &Table<L, F>,
    base: Option<&Manifest>,
    batch: &RecordBatch,
    mode: &WriteMode,
) -> Result<Option<Plan>, TableError> {
    let operation = mode.operation();
    let empty = Schema::empty();
    let base_schema = base.map_or(&empty, |m| &m.schema);

    let schema = reconcile(base_schema, batch.schema()).map_err(|source| {
        TableError::SchemaIncompatible {
            table: table.name().to_string(),
            operation,
            source,
        }
    })?;
    let incoming = conform(batch, &schema);

    let constraints = effective_constraints(base, &table.options().constraints);
    ConstraintValidator::for_table(&schema, &constraints)
        .evaluate(&incoming)
        .map_err(|v| TableError::ConstraintViolation {
            table: table.name().to_string(),
            operation,
            constraint: v.constraint,
            rows: v.rows,
        })?;

    let base_files = base.map(|m| m.files.clone()).unwrap_or_default();
    let unchanged_metadata = base.map_or(false, |m| {
        m.schema == schema && m.constraints.len() == constraints.len()
    });

    let plan = match mode {
        WriteMode::Append => Plan {
            metrics: CommitMetrics {
                rows_inserted: incoming.num_rows() as u64,
                ..Default::default()
            },
            schema,
            constraints,
            kept: base_files,
            removed: Vec::new(),
            rows: incoming.into_rows(),
        },
        WriteMode::Overwrite => Plan {
            metrics: CommitMetrics {
                rows_inserted: incoming.num_rows() as u64,
                rows_removed: base_files.iter().map(|f| f.row_count).sum(),
                ..Default::default()
            },
            schema,
            constraints,
            kept: Vec::new(),
            removed: base_files,
            rows: incoming.into_rows(),
        },
        WriteMode::Merge { key } => {
            let key_idx = key_indices(table, operation, &schema, key, &incoming)?;
            let upserts = last_write_wins(incoming.into_rows(), &key_idx);
            let merged = merge_into(table, &schema, base_files, &key_idx, upserts)?;
            if !merged.changed && unchanged_metadata {
                return Ok(None);
            }
            Plan {
                schema,
                constraints,
                kept: merged.kept,
                removed: merged.removed,
                rows: merged.rows,
                metrics: merged.metrics,
            }
        }
    };
    Ok(Some(plan))
}

fn key_indices<L: LogStore, F: FileStore>(
    table: &Table<L, F>,
    operation: Operation,
    schema: &Schema,
    key: &[String],
    incoming: &RecordBatch,
) -> Result<Vec<usize>, TableError> {
    let problem = |column: &str, problem: String| TableError::MergeKey {
        table: table.name().to_string(),
        operation,
        column: column.to_string(),
        problem,
    };
    if key.is_empty() {
        return Err(problem("", "must name at least one column".into()));
    }

    let mut indices = Vec::with_capacity(key.len());
    for column in key {
        let idx = schema
            .index_of(column)
            .ok_or_else(|| problem(column, "is not a column of the table".into()))?;
        let null_rows: Vec<usize> = incoming
            .rows()
            .iter()
            .enumerate()
            .filter(|(_, row)| row[idx].is_null())
            .map(|(i, _)| i)
            .collect();
        if !null_rows.is_empty() {
            return Err(problem(column, format!("is null in rows {null_rows:?}")));
        }
        indices.push(idx);
    }
    Ok(indices)
}

fn key_of(row: &Row, key_idx: &[usize]) -> Vec<Value> {
    key_idx.iter().map(|&i| row[i].clone()).collect()
}

/// Collapse duplicate keys, keeping the last row for each key at the
/// position of that last occurrence.
fn last_write_wins(rows: Vec<Row>, key_idx: &[usize]) -> Vec<Row> {
    let mut last: HashMap<Vec<Value>, usize> = HashMap::new();
    for (i, row) in rows.iter().enumerate() {
        last.insert(key_of(row, key_idx), i);
    }
    rows.into_iter()
        .enumerate()
        .filter(|(i, row)| last.get(&key_of(row, key_idx)) == Some(i))
        .map(|(_, row)| row)
        .collect()
}

struct Merged {
    kept: Vec<DataFileMeta>,
    removed: Vec<DataFileMeta>,
    rows: Vec<Row>,
    metrics: CommitMetrics,
    changed: bool,
}

fn merge_into<L: LogStore, F: FileStore>(
    table: &Table<L, F>,
    schema: &Schema,
    base_files: Vec<DataFileMeta>,
    key_idx: &[usize],
    upserts: Vec<Row>,
) -> Result<Merged, TableError> {
    let incoming: HashMap<Vec<Value>, &Row> = upserts
        .iter()
        .map(|row| (key_of(row, key_idx), row))
        .collect();

    // Single-column keys can prune files by their statistics.
    let key_range = match key_idx {
        [idx] => {
            let column = &schema.fields()[*idx].name;
            let min = upserts.iter().map(|r| &r[*idx]).min();
            let max = upserts.iter().map(|r| &r[*idx]).max();
            Some((column.as_str(), min, max))
        }
        _ => None,
    };

    let mut kept = Vec::new();
    let mut removed = Vec::new();
    let mut carried: Vec<Row> = Vec::new();
    // Existing rows per matched key; more than one means the merge collapses them.
    let mut matched: HashMap<Vec<Value>, usize> = HashMap::new();
    let mut changed = false;
    let mut metrics = CommitMetrics::default();

    for meta in base_files {
        if let Some((column, min, max)) = &key_range {
            if !meta.may_contain(column, *min, *max) {
                kept.push(meta);
                continue;
            }
        }

        let rows = read_data_file(table.files(), &meta)
            .map_err(|e| TableError::storage(table.name(), Operation::Merge, e))?
            .project(schema)
            .into_rows();

        let mut survivors = Vec::with_capacity(rows.len());
        let mut hit = false;
        for row in rows {
            let key = key_of(&row, key_idx);
            match incoming.get(&key) {
                Some(replacement) => {
                    hit = true;
                    changed |= *replacement != &row;
                    *matched.entry(key).or_insert(0) += 1;
                }
                None => survivors.push(row),
            }
        }

        if hit {
            metrics.rows_copied += survivors.len() as u64;
            carried.extend(survivors);
            removed.push(meta);
        } else {
            kept.push(meta);
        }
    }

    changed |= matched.values().any(|&count| count > 1);
    for row in &upserts {
        if matched.contains_key(&key_of(row, key_idx)) {
            metrics.rows_updated += 1;
        } else {
            metrics.rows_inserted += 1;
            changed = true;
        }
    }
    carried.extend(upserts);
    debug!(
        table = table.name(),
        files_kept = kept.len(),
        files_rewritten = removed.len(),
        "merge plan computed"
    );

    Ok(Merged {
        kept,
        removed,
        rows: carried,
        metrics,
        changed,
    })
}
