// Version Log
//
// Append-only, totally ordered sequence of table versions. Each entry is a
// self-contained manifest: the full list of active data files plus schema,
// constraints and commit metadata. Resolving "current" or any historical
// version reads exactly one manifest.

pub mod store;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constraints::Constraint;
use crate::datafile::{DataFileMeta, FileId};
use crate::record::Schema;

pub use store::{FsLogStore, InMemoryLogStore, LogStore, LOG_DIR};

/// Logical version of a table. Version 0 is the empty table before any commit.
pub type Version = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Append,
    Overwrite,
    Merge,
    Optimize,
    Vacuum,
}

impl Operation {
    /// Whether a commit of this kind may change the logical row set.
    pub fn changes_data(self) -> bool {
        matches!(
            self,
            Operation::Append | Operation::Overwrite | Operation::Merge
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Append => "APPEND",
            Operation::Overwrite => "OVERWRITE",
            Operation::Merge => "MERGE",
            Operation::Optimize => "OPTIMIZE",
            Operation::Vacuum => "VACUUM",
        };
        f.write_str(name)
    }
}

/// Counters recorded with every commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMetrics {
    #[serde(default)]
    pub rows_inserted: u64,
    #[serde(default)]
    pub rows_updated: u64,
    #[serde(default)]
    pub rows_copied: u64,
    #[serde(default)]
    pub rows_removed: u64,
    #[serde(default)]
    pub files_added: u64,
    #[serde(default)]
    pub files_removed: u64,
    #[serde(default)]
    pub files_deleted: u64,
}

/// Immutable snapshot of a table at one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub table: String,
    pub version: Version,
    /// Version this commit was computed against.
    pub base_version: Version,
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
    pub schema: Schema,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    /// Every file that makes up the table at this version, in read order.
    pub files: Vec<DataFileMeta>,
    #[serde(default)]
    pub added: Vec<FileId>,
    /// Files active at `base_version` that this commit dropped.
    #[serde(default)]
    pub removed: Vec<DataFileMeta>,
    #[serde(default)]
    pub metrics: CommitMetrics,
}

impl Manifest {
    pub fn references(&self, id: &FileId) -> bool {
        self.files.iter().any(|f| &f.id == id)
    }

    pub fn row_count(&self) -> u64 {
        self.files.iter().map(|f| f.row_count).sum()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("version conflict: expected {expected}, got {actual}")]
    VersionConflict { expected: Version, actual: Version },

    #[error("version {version} does not exist")]
    NotFound { version: Version },

    #[error("log io error on `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt manifest `{path}`: {reason}")]
    Corrupt { path: String, reason: String },
}

/// The authoritative version history of one table.
///
/// The store's compare-and-set on the next version number is the single
/// synchronization point between committers.
#[derive(Debug, Default)]
pub struct VersionLog<S: LogStore> {
    store: S,
}

impl<S: LogStore> VersionLog<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Publish `manifest` as the next version.
    ///
    /// Fails with `VersionConflict` if another committer already published
    /// `manifest.version` or the manifest skips ahead.
    pub fn append(&self, manifest: &Manifest) -> Result<(), LogError> {
        let expected = self.store.current_version()? + 1;
        if manifest.version != expected {
            return Err(LogError::VersionConflict {
                expected,
                actual: manifest.version,
            });
        }
        self.store.append(manifest)
    }

    pub fn current_version(&self) -> Result<Version, LogError> {
        self.store.current_version()
    }

    /// Manifest of the current version, or `None` for an empty table.
    pub fn latest(&self) -> Result<Option<Manifest>, LogError> {
        match self.store.current_version()? {
            0 => Ok(None),
            version => self.store.load(version).map(Some),
        }
    }

    pub fn get(&self, version: Version) -> Result<Manifest, LogError> {
        self.store.load(version)
    }

    /// Newest version committed at or before `at`.
    pub fn as_of(&self, at: DateTime<Utc>) -> Result<Option<Manifest>, LogError> {
        let mut version = self.store.current_version()?;
        while version > 0 {
            let manifest = self.store.load(version)?;
            if manifest.timestamp <= at {
                return Ok(Some(manifest));
            }
            version -= 1;
        }
        Ok(None)
    }

    /// All manifests, oldest first.
    pub fn replay(&self) -> Result<Vec<Manifest>, LogError> {
        let current = self.store.current_version()?;
        (1..=current).map(|v| self.store.load(v)).collect()
    }
}
