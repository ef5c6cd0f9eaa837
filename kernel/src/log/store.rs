// Version Log Storage
//
// Durability contract for the authoritative version log. Implementations
// may persist to memory, a local directory, object storage, etc.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use uuid::Uuid;

use super::{LogError, Manifest, Version};

/// Directory, relative to a table root, that holds the manifest log.
pub const LOG_DIR: &str = "_tierlake_log";

/// Storage backend for the version log.
///
/// Properties required from implementations:
/// - Append-only
/// - Ordered
/// - Durable
/// - CAS semantics on version
///
/// Implementations MUST NOT:
/// - Reorder manifests
/// - Mutate existing manifests
/// - Allow version gaps
pub trait LogStore: Send + Sync {
    /// Publish a manifest.
    ///
    /// Implementations must enforce atomically:
    /// - manifest.version == current_version + 1
    fn append(&self, manifest: &Manifest) -> Result<(), LogError>;

    /// Load the manifest of one version.
    fn load(&self, version: Version) -> Result<Manifest, LogError>;

    /// Return the current persisted version, 0 when empty.
    fn current_version(&self) -> Result<Version, LogError>;
}

#[derive(Debug, Default)]
pub struct InMemoryLogStore {
    manifests: RwLock<Vec<Manifest>>,
}

impl LogStore for InMemoryLogStore {
    fn append(&self, manifest: &Manifest) -> Result<(), LogError> {
        let mut manifests = self.manifests.write();
        let expected = manifests.len() as Version + 1;
        if manifest.version != expected {
            return Err(LogError::VersionConflict {
                expected,
                actual: manifest.version,
            });
        }
        manifests.push(manifest.clone());
        Ok(())
    }

    fn load(&self, version: Version) -> Result<Manifest, LogError> {
        let manifests = self.manifests.read();
        version
            .checked_sub(1)
            .and_then(|idx| manifests.get(idx as usize))
            .cloned()
            .ok_or(LogError::NotFound { version })
    }

    fn current_version(&self) -> Result<Version, LogError> {
        Ok(self.manifests.read().len() as Version)
    }
}

/// Log stored as one JSON file per version under `<table>/_tierlake_log/`.
///
/// The compare-and-set is a hard link from a fully written staging file to
/// the version's final name, which fails if that name already exists.
#[derive(Debug, Clone)]
pub struct FsLogStore {
    dir: PathBuf,
}

impl FsLogStore {
    pub fn new(table_root: impl AsRef<Path>) -> Self {
        Self {
            dir: table_root.as_ref().join(LOG_DIR),
        }
    }

    fn manifest_path(&self, version: Version) -> PathBuf {
        self.dir.join(format!("{version:020}.json"))
    }

    fn io_err(path: &Path, source: std::io::Error) -> LogError {
        LogError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl LogStore for FsLogStore {
    fn append(&self, manifest: &Manifest) -> Result<(), LogError> {
        fs::create_dir_all(&self.dir).map_err(|e| Self::io_err(&self.dir, e))?;

        let expected = self.current_version()? + 1;
        if manifest.version != expected {
            return Err(LogError::VersionConflict {
                expected,
                actual: manifest.version,
            });
        }

        let target = self.manifest_path(manifest.version);
        let staging = self.dir.join(format!(".staging-{}", Uuid::new_v4()));
        let bytes = serde_json::to_vec_pretty(manifest).map_err(|e| LogError::Corrupt {
            path: target.display().to_string(),
            reason: e.to_string(),
        })?;
        fs::write(&staging, bytes).map_err(|e| Self::io_err(&staging, e))?;

        let linked = fs::hard_link(&staging, &target);
        let _ = fs::remove_file(&staging);
        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(LogError::VersionConflict {
                expected: self.current_version()? + 1,
                actual: manifest.version,
            }),
            Err(e) => Err(Self::io_err(&target, e)),
        }
    }

    fn load(&self, version: Version) -> Result<Manifest, LogError> {
        let path = self.manifest_path(version);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(LogError::NotFound { version })
            }
            Err(e) => return Err(Self::io_err(&path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|e| LogError::Corrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    fn current_version(&self) -> Result<Version, LogError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Self::io_err(&self.dir, e)),
        };

        let mut current = 0;
        for entry in entries {
            let entry = entry.map_err(|e| Self::io_err(&self.dir, e))?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(version) = stem.parse::<Version>() {
                current = current.max(version);
            }
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::tests::manifest;

    #[test]
    fn fs_store_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsLogStore::new(dir.path());

        store.append(&manifest(1, 1)).unwrap();
        store.append(&manifest(2, 2)).unwrap();

        let reopened = FsLogStore::new(dir.path());
        assert_eq!(reopened.current_version().unwrap(), 2);
        assert_eq!(reopened.load(1).unwrap(), manifest(1, 1));
    }

    #[test]
    fn fs_store_rejects_second_writer_for_same_version() {
        let dir = tempfile::tempdir().unwrap();
        let a = FsLogStore::new(dir.path());
        let b = FsLogStore::new(dir.path());

        a.append(&manifest(1, 1)).unwrap();
        let err = b.append(&manifest(1, 2)).unwrap_err();

        assert!(matches!(err, LogError::VersionConflict { expected: 2, .. }));
        assert_eq!(b.load(1).unwrap().timestamp, manifest(1, 1).timestamp);
    }

    #[test]
    fn missing_version_is_not_found() {
        let store = InMemoryLogStore::default();
        assert!(matches!(store.load(0), Err(LogError::NotFound { version: 0 })));
        assert!(matches!(store.load(3), Err(LogError::NotFound { version: 3 })));
    }
}
