// Data File Set
//
// Immutable column-major files referenced by manifests. A file is written
// once, never rewritten, and carries per-column statistics so readers can
// skip it when a predicate range cannot match.

pub mod store;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::{DataType, RecordBatch, Row, Schema, Value};

pub use store::{FileStore, FileStoreError, FsFileStore, InMemoryFileStore, StoredFile};

/// Identity of a data file; also determines its path in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub Uuid);

impl FileId {
    pub fn generate() -> Self {
        FileId(Uuid::new_v4())
    }

    pub fn path(&self) -> String {
        format!("data/{}.json", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Range summary of one column within one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnStats {
    pub min: Option<Value>,
    pub max: Option<Value>,
    pub null_count: u64,
}

/// Manifest entry describing a data file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFileMeta {
    pub id: FileId,
    pub path: String,
    pub row_count: u64,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub stats: BTreeMap<String, ColumnStats>,
}

impl DataFileMeta {
    /// Whether any row may have `column` within `[lower, upper]`.
    ///
    /// Files without the column hold only nulls for it and never match.
    pub fn may_contain(&self, column: &str, lower: Option<&Value>, upper: Option<&Value>) -> bool {
        let Some(stats) = self.stats.get(column) else {
            return false;
        };
        let (Some(min), Some(max)) = (&stats.min, &stats.max) else {
            return false;
        };
        if let Some(lower) = lower {
            if matches!(max.compare(lower), Some(std::cmp::Ordering::Less)) {
                return false;
            }
        }
        if let Some(upper) = upper {
            if matches!(min.compare(upper), Some(std::cmp::Ordering::Greater)) {
                return false;
            }
        }
        true
    }
}

/// Typed storage for one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "values", rename_all = "lowercase")]
pub enum ColumnData {
    Boolean(Vec<Option<bool>>),
    Int64(Vec<Option<i64>>),
    Float64(Vec<Option<f64>>),
    Utf8(Vec<Option<String>>),
    Date(Vec<Option<NaiveDate>>),
    Timestamp(Vec<Option<DateTime<Utc>>>),
}

impl ColumnData {
    fn from_values<'a>(data_type: DataType, values: impl Iterator<Item = &'a Value>) -> Self {
        match data_type {
            DataType::Boolean => ColumnData::Boolean(
                values
                    .map(|v| match v {
                        Value::Boolean(b) => Some(*b),
                        _ => None,
                    })
                    .collect(),
            ),
            DataType::Int64 => ColumnData::Int64(
                values
                    .map(|v| match v {
                        Value::Int64(i) => Some(*i),
                        _ => None,
                    })
                    .collect(),
            ),
            DataType::Float64 => ColumnData::Float64(values.map(Value::as_f64).collect()),
            DataType::Utf8 => ColumnData::Utf8(
                values
                    .map(|v| v.as_str().map(str::to_string))
                    .collect(),
            ),
            DataType::Date => ColumnData::Date(
                values
                    .map(|v| match v {
                        Value::Date(d) => Some(*d),
                        _ => None,
                    })
                    .collect(),
            ),
            DataType::Timestamp => ColumnData::Timestamp(
                values
                    .map(|v| match v {
                        Value::Timestamp(t) => Some(*t),
                        _ => None,
                    })
                    .collect(),
            ),
        }
    }

    fn len(&self) -> usize {
        match self {
            ColumnData::Boolean(v) => v.len(),
            ColumnData::Int64(v) => v.len(),
            ColumnData::Float64(v) => v.len(),
            ColumnData::Utf8(v) => v.len(),
            ColumnData::Date(v) => v.len(),
            ColumnData::Timestamp(v) => v.len(),
        }
    }

    fn get(&self, i: usize) -> Value {
        let value = match self {
            ColumnData::Boolean(v) => v[i].map(Value::Boolean),
            ColumnData::Int64(v) => v[i].map(Value::Int64),
            ColumnData::Float64(v) => v[i].map(Value::Float64),
            ColumnData::Utf8(v) => v[i].clone().map(Value::Utf8),
            ColumnData::Date(v) => v[i].map(Value::Date),
            ColumnData::Timestamp(v) => v[i].map(Value::Timestamp),
        };
        value.unwrap_or(Value::Null)
    }
}

/// Contents of a data file: its own schema plus one column per field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataFile {
    pub schema: Schema,
    pub columns: Vec<ColumnData>,
}

impl DataFile {
    pub fn from_batch(batch: &RecordBatch) -> Self {
        let columns = batch
            .schema()
            .fields()
            .iter()
            .enumerate()
            .map(|(idx, field)| {
                ColumnData::from_values(field.data_type, batch.rows().iter().map(|r| &r[idx]))
            })
            .collect();
        Self {
            schema: batch.schema().clone(),
            columns,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.columns.first().map(ColumnData::len).unwrap_or(0)
    }

    pub fn to_batch(&self) -> RecordBatch {
        let rows: Vec<Row> = (0..self.num_rows())
            .map(|i| self.columns.iter().map(|c| c.get(i)).collect())
            .collect();
        RecordBatch::from_parts_unchecked(self.schema.clone(), rows)
    }

    pub fn stats(&self) -> BTreeMap<String, ColumnStats> {
        self.schema
            .fields()
            .iter()
            .zip(&self.columns)
            .map(|(field, column)| {
                let mut stats = ColumnStats {
                    min: None,
                    max: None,
                    null_count: 0,
                };
                for i in 0..column.len() {
                    let value = column.get(i);
                    if value.is_null() {
                        stats.null_count += 1;
                        continue;
                    }
                    if stats.min.as_ref().map_or(true, |m| value < *m) {
                        stats.min = Some(value.clone());
                    }
                    if stats.max.as_ref().map_or(true, |m| value > *m) {
                        stats.max = Some(value);
                    }
                }
                (field.name.clone(), stats)
            })
            .collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Write `batch` as a new immutable file and describe it for a manifest.
pub fn write_data_file(
    store: &dyn FileStore,
    batch: &RecordBatch,
    created_at: DateTime<Utc>,
) -> Result<DataFileMeta, FileStoreError> {
    let id = FileId::generate();
    let path = id.path();
    let file = DataFile::from_batch(batch);
    let bytes = file.encode().map_err(|e| FileStoreError::Corrupt {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    store.put(&path, &bytes)?;

    Ok(DataFileMeta {
        id,
        path,
        row_count: file.num_rows() as u64,
        size_bytes: bytes.len() as u64,
        created_at,
        stats: file.stats(),
    })
}

/// Load a data file's rows with the file's own schema.
pub fn read_data_file(
    store: &dyn FileStore,
    meta: &DataFileMeta,
) -> Result<RecordBatch, FileStoreError> {
    let bytes = store.get(&meta.path)?;
    let file = DataFile::decode(&bytes).map_err(|e| FileStoreError::Corrupt {
        path: meta.path.clone(),
        reason: e.to_string(),
    })?;
    Ok(file.to_batch())
}
