#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use tierlake_kernel::datafile::{FileStore, FileStoreError, InMemoryFileStore, StoredFile};
use tierlake_kernel::log::{InMemoryLogStore, LogError, LogStore, Manifest, Version};
use tierlake_kernel::record::{DataType, Field, RecordBatch, Schema, Value};
use tierlake_kernel::table::{Table, TableOptions};

pub fn prices(rows: &[(&str, f64)]) -> RecordBatch {
    let schema = Schema::new(vec![
        Field::required("datetime", DataType::Utf8),
        Field::required("close", DataType::Float64),
    ])
    .unwrap();
    RecordBatch::try_new(
        schema,
        rows.iter()
            .map(|(d, c)| vec![Value::from(*d), Value::Float64(*c)])
            .collect(),
    )
    .unwrap()
}

pub fn json_batch(rows: serde_json::Value) -> RecordBatch {
    let rows = match rows {
        serde_json::Value::Array(rows) => rows,
        single => vec![single],
    };
    RecordBatch::from_json_rows(&rows).unwrap()
}

pub fn example_row() -> RecordBatch {
    json_batch(json!({ "datetime": "2025-10-29", "close": 112766.46 }))
}

/// Rows sorted so results can be compared regardless of file order.
pub fn sorted_rows(batch: RecordBatch) -> Vec<Vec<Value>> {
    let mut rows = batch.into_rows();
    rows.sort();
    rows
}

/// Log store shared between several table handles. An optional one-shot
/// hook runs just before the next append reaches the store, which lets a
/// test slip a competing commit in between planning and publishing.
pub struct SharedLog {
    inner: Arc<InMemoryLogStore>,
    before_append: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl SharedLog {
    pub fn new(inner: Arc<InMemoryLogStore>) -> Self {
        Self {
            inner,
            before_append: Mutex::new(None),
        }
    }

    pub fn before_next_append(&self, hook: impl FnOnce() + Send + 'static) {
        *self.before_append.lock() = Some(Box::new(hook));
    }
}

impl LogStore for SharedLog {
    fn append(&self, manifest: &Manifest) -> Result<(), LogError> {
        let hook = self.before_append.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        self.inner.append(manifest)
    }

    fn load(&self, version: Version) -> Result<Manifest, LogError> {
        self.inner.load(version)
    }

    fn current_version(&self) -> Result<Version, LogError> {
        self.inner.current_version()
    }
}

/// File pool shared between table handles, with a one-shot hook that runs
/// before the next listing (vacuum plans from a listing).
pub struct SharedFiles {
    inner: Arc<InMemoryFileStore>,
    before_list: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl SharedFiles {
    pub fn new(inner: Arc<InMemoryFileStore>) -> Self {
        Self {
            inner,
            before_list: Mutex::new(None),
        }
    }

    pub fn before_next_list(&self, hook: impl FnOnce() + Send + 'static) {
        *self.before_list.lock() = Some(Box::new(hook));
    }
}

impl FileStore for SharedFiles {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<(), FileStoreError> {
        self.inner.put(path, bytes)
    }

    fn get(&self, path: &str) -> Result<Vec<u8>, FileStoreError> {
        self.inner.get(path)
    }

    fn delete(&self, path: &str) -> Result<(), FileStoreError> {
        self.inner.delete(path)
    }

    fn list(&self) -> Result<Vec<StoredFile>, FileStoreError> {
        let hook = self.before_list.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        self.inner.list()
    }
}

pub type SharedTable = Table<SharedLog, SharedFiles>;

/// Two handles onto the same table, as two independent writers would have.
pub fn two_writers(name: &str, options: TableOptions) -> (SharedTable, Arc<SharedTable>) {
    let log = Arc::new(InMemoryLogStore::default());
    let files = Arc::new(InMemoryFileStore::with_clock(options.clock.clone()));
    let first = Table::new(
        name,
        SharedLog::new(log.clone()),
        SharedFiles::new(files.clone()),
        options.clone(),
    );
    let second = Table::new(name, SharedLog::new(log), SharedFiles::new(files), options);
    (first, Arc::new(second))
}
