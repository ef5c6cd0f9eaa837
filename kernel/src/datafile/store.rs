// Data File Pool
//
// Blob storage for data files, addressed by relative path. The pool has no
// notion of versions: liveness is decided entirely by manifests.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};

#[derive(Debug, thiserror::Error)]
pub enum FileStoreError {
    #[error("data file `{path}` not found")]
    NotFound { path: String },

    #[error("io error on `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("data file `{path}` is corrupt: {reason}")]
    Corrupt { path: String, reason: String },
}

/// A blob currently present in the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub path: String,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

/// Storage backend for immutable data files.
///
/// Implementations must make `put` all-or-nothing: a reader never observes
/// a partially written file.
pub trait FileStore: Send + Sync {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<(), FileStoreError>;

    fn get(&self, path: &str) -> Result<Vec<u8>, FileStoreError>;

    fn delete(&self, path: &str) -> Result<(), FileStoreError>;

    fn list(&self) -> Result<Vec<StoredFile>, FileStoreError>;
}

/// Pool held in memory; modification times come from the supplied clock.
pub struct InMemoryFileStore {
    files: RwLock<BTreeMap<String, (Vec<u8>, DateTime<Utc>)>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryFileStore {
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            files: RwLock::new(BTreeMap::new()),
            clock,
        }
    }
}

impl Default for InMemoryFileStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl FileStore for InMemoryFileStore {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<(), FileStoreError> {
        let now = self.clock.now();
        self.files
            .write()
            .insert(path.to_string(), (bytes.to_vec(), now));
        Ok(())
    }

    fn get(&self, path: &str) -> Result<Vec<u8>, FileStoreError> {
        self.files
            .read()
            .get(path)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| FileStoreError::NotFound {
                path: path.to_string(),
            })
    }

    fn delete(&self, path: &str) -> Result<(), FileStoreError> {
        self.files
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| FileStoreError::NotFound {
                path: path.to_string(),
            })
    }

    fn list(&self) -> Result<Vec<StoredFile>, FileStoreError> {
        Ok(self
            .files
            .read()
            .iter()
            .map(|(path, (bytes, modified))| StoredFile {
                path: path.clone(),
                size_bytes: bytes.len() as u64,
                modified: *modified,
            })
            .collect())
    }
}

/// Pool rooted at a table directory; files live under `data/`.
#[derive(Debug, Clone)]
pub struct FsFileStore {
    root: PathBuf,
}

impl FsFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

fn io_err(path: &Path, source: std::io::Error) -> FileStoreError {
    if source.kind() == ErrorKind::NotFound {
        FileStoreError::NotFound {
            path: path.display().to_string(),
        }
    } else {
        FileStoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl FileStore for FsFileStore {
    fn put(&self, path: &str, bytes: &[u8]) -> Result<(), FileStoreError> {
        let target = self.resolve(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        // Write aside and rename so the final path only ever holds a full file.
        let staging = target.with_extension(format!("tmp-{}", Uuid::new_v4()));
        fs::write(&staging, bytes).map_err(|e| io_err(&staging, e))?;
        fs::rename(&staging, &target).map_err(|e| io_err(&target, e))
    }

    fn get(&self, path: &str) -> Result<Vec<u8>, FileStoreError> {
        let target = self.resolve(path);
        fs::read(&target).map_err(|e| io_err(&target, e))
    }

    fn delete(&self, path: &str) -> Result<(), FileStoreError> {
        let target = self.resolve(path);
        fs::remove_file(&target).map_err(|e| io_err(&target, e))
    }

    fn list(&self) -> Result<Vec<StoredFile>, FileStoreError> {
        let dir = self.root.join("data");
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&dir, e)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let metadata = entry.metadata().map_err(|e| io_err(&entry.path(), e))?;
            // Staging files left by an interrupted `put` are listed too; no
            // manifest references them, so vacuum reclaims them once aged.
            if !metadata.is_file() {
                continue;
            }
            let modified = metadata
                .modified()
                .map_err(|e| io_err(&entry.path(), e))?;
            files.push(StoredFile {
                path: format!("data/{name}"),
                size_bytes: metadata.len(),
                modified: DateTime::<Utc>::from(modified),
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_put_get_delete() {
        let store = InMemoryFileStore::default();
        store.put("data/a.json", b"{}").unwrap();

        assert_eq!(store.get("data/a.json").unwrap(), b"{}".to_vec());
        assert_eq!(store.list().unwrap().len(), 1);

        store.delete("data/a.json").unwrap();
        assert!(matches!(
            store.get("data/a.json"),
            Err(FileStoreError::NotFound { .. })
        ));
    }

    #[test]
    fn fs_store_lists_blobs_and_leftover_staging_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsFileStore::new(dir.path());

        store.put("data/one.json", b"[1]").unwrap();
        store.put("data/two.json", b"[2]").unwrap();

        fs::write(dir.path().join("data/three.tmp-0a1b"), b"[3").unwrap();
        fs::create_dir_all(dir.path().join("data/nested")).unwrap();

        let listed: Vec<_> = store.list().unwrap().into_iter().map(|f| f.path).collect();
        assert_eq!(
            listed,
            vec!["data/one.json", "data/three.tmp-0a1b", "data/two.json"]
        );

        store.delete("data/one.json").unwrap();
        assert!(matches!(
            store.delete("data/one.json"),
            Err(FileStoreError::NotFound { .. })
        ));
    }
}
