// Layer Pipeline
//
// Bronze → Silver → Gold, each layer an ordinary table:
//
// - Bronze lands Source Feed output as-is (MERGE on the natural key for
//   incremental feeds, OVERWRITE for full snapshots)
// - Silver is Bronze cleaned: invalid rows dropped, rows deduplicated,
//   written with the source's mode
// - Gold is an aggregate of Silver, always OVERWRITE
//
// Every step is idempotent: re-running on the same source batch leaves the
// logical contents of all three layers unchanged.

pub mod cleaning;
pub mod gold;

use tracing::{info, warn};

use crate::datafile::FileStore;
use crate::log::{LogStore, Operation};
use crate::merge::{CommitOutcome, WriteMode};
use crate::record::RecordBatch;
use crate::table::{Table, TableError};

pub use cleaning::{clean, dedupe_columns, Cleaning};
pub use gold::{aggregate, GoldAggregate};

/// How a feed's batches relate to what was fetched before.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionMode {
    /// Each fetch may overlap earlier ones; rows are upserted on `key`.
    Incremental { key: Vec<String> },
    /// Each fetch is the complete current state.
    Full,
}

impl ExtractionMode {
    pub fn incremental<I, S>(key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ExtractionMode::Incremental {
            key: key.into_iter().map(Into::into).collect(),
        }
    }

    pub fn write_mode(&self) -> WriteMode {
        match self {
            ExtractionMode::Incremental { key } => WriteMode::Merge { key: key.clone() },
            ExtractionMode::Full => WriteMode::Overwrite,
        }
    }
}

/// One fetch from a source feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedBatch {
    pub records: RecordBatch,
    pub mode: ExtractionMode,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("feed `{feed}` failed: {message}")]
pub struct SourceFeedError {
    pub feed: String,
    pub message: String,
}

/// External producer of records.
pub trait SourceFeed {
    fn name(&self) -> &str;

    fn fetch(&self) -> Result<FeedBatch, SourceFeedError>;
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Table(#[from] TableError),

    #[error("table `{table}`: {operation} cannot use column `{column}`: {problem}")]
    Column {
        table: String,
        operation: Operation,
        column: String,
        problem: String,
    },
}

/// Fetch from `feed` and land the batch in `bronze`.
///
/// A feed failure is reported as [`TableError::SourceFeed`] and nothing is
/// committed.
pub fn ingest_bronze<L: LogStore, F: FileStore>(
    bronze: &Table<L, F>,
    feed: &dyn SourceFeed,
) -> Result<(CommitOutcome, ExtractionMode), TableError> {
    let batch = feed.fetch().map_err(|e| {
        warn!(table = bronze.name(), feed = %e.feed, "source feed failed");
        TableError::SourceFeed {
            table: bronze.name().to_string(),
            message: e.to_string(),
        }
    })?;
    let outcome = bronze.commit(&batch.records, &batch.mode.write_mode())?;
    Ok((outcome, batch.mode))
}

/// Clean the latest Bronze rows into `silver`.
///
/// Returns `None` when nothing survives cleaning.
pub fn refine_silver<L: LogStore, F: FileStore>(
    bronze: &Table<L, F>,
    silver: &Table<L, F>,
    mode: &ExtractionMode,
    cleaning: &Cleaning,
) -> Result<Option<CommitOutcome>, TableError> {
    let raw = bronze.read_latest()?;
    let before = raw.records.num_rows();
    let cleaned = clean(raw.records, cleaning);
    info!(
        table = silver.name(),
        source = bronze.name(),
        rows_in = before,
        rows_out = cleaned.num_rows(),
        "cleaned bronze rows"
    );
    if cleaned.is_empty() {
        warn!(table = silver.name(), "no rows survived cleaning, silver left unchanged");
        return Ok(None);
    }
    silver.commit(&cleaned, &mode.write_mode()).map(Some)
}

/// Recompute `gold` from the latest Silver rows.
///
/// Returns `None` when Silver is empty, the aggregate has no rows, or it
/// equals what Gold already holds.
pub fn publish_gold<L: LogStore, F: FileStore>(
    silver: &Table<L, F>,
    gold: &Table<L, F>,
    definition: &GoldAggregate,
) -> Result<Option<CommitOutcome>, PipelineError> {
    let clean = silver.read_latest()?;
    if clean.records.is_empty() {
        return Ok(None);
    }
    let summary = aggregate(&clean.records, definition).map_err(|e| PipelineError::Column {
        table: gold.name().to_string(),
        operation: Operation::Overwrite,
        column: e.column,
        problem: e.problem,
    })?;
    if summary.is_empty() {
        warn!(
            table = gold.name(),
            source = silver.name(),
            "aggregate produced no rows, gold left unchanged"
        );
        return Ok(None);
    }

    let current = gold.read_latest()?;
    if current.version > 0 && current.records == summary {
        info!(table = gold.name(), version = current.version, "gold already up to date");
        return Ok(None);
    }
    Ok(Some(gold.commit(&summary, &WriteMode::Overwrite)?))
}

/// The three tables of one source entity and how data moves between them.
pub struct Flow<'a, L: LogStore, F: FileStore> {
    pub bronze: &'a Table<L, F>,
    pub silver: &'a Table<L, F>,
    pub gold: &'a Table<L, F>,
    pub cleaning: Cleaning,
    pub aggregate: GoldAggregate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowReport {
    pub bronze: CommitOutcome,
    pub silver: Option<CommitOutcome>,
    pub gold: Option<CommitOutcome>,
}

/// Run a feed through all three layers.
pub fn run_flow<L: LogStore, F: FileStore>(
    flow: &Flow<'_, L, F>,
    feed: &dyn SourceFeed,
) -> Result<FlowReport, PipelineError> {
    // 1. Land raw records
    let (bronze, mode) = ingest_bronze(flow.bronze, feed)?;

    // 2. Clean into silver
    let silver = refine_silver(flow.bronze, flow.silver, &mode, &flow.cleaning)?;

    // 3. Aggregate into gold
    let gold = publish_gold(flow.silver, flow.gold, &flow.aggregate)?;

    Ok(FlowReport {
        bronze,
        silver,
        gold,
    })
}
