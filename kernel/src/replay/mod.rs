// Log Replay Verification
//
// Walks a table's version log from the first version to the current one
// and checks that every manifest is a legal successor of the previous one:
//
// - versions are contiguous and each names its predecessor as base
// - timestamps never decrease
// - active(v) = active(v-1) - removed(v) + added(v)
// - no file is listed twice in one version
//
// Findings are collected rather than stopping at the first one, so a report
// shows every inconsistency in one pass.

use std::collections::BTreeSet;

use crate::datafile::FileId;
use crate::log::{LogError, LogStore, Manifest, Version, VersionLog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FindingKind {
    MissingVersion,
    WrongBaseVersion,
    TimestampRegression,
    TransitionMismatch,
    DuplicateFile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub version: Version,
    pub kind: FindingKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationReport {
    pub current_version: Version,
    pub versions_checked: u64,
    pub findings: Vec<Finding>,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("cannot read version log: {0}")]
    Log(#[from] LogError),
}

/// Verify every version of `log`.
pub fn verify_log<S: LogStore>(log: &VersionLog<S>) -> Result<VerificationReport, ReplayError> {
    let current = log.current_version()?;
    let mut findings = Vec::new();
    let mut previous: Option<Manifest> = None;
    let mut checked = 0;

    for version in 1..=current {
        let manifest = match log.get(version) {
            Ok(manifest) => manifest,
            Err(LogError::NotFound { .. }) => {
                findings.push(Finding {
                    version,
                    kind: FindingKind::MissingVersion,
                    message: format!("version {version} is missing from the log"),
                });
                previous = None;
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        checked += 1;
        check_manifest(version, previous.as_ref(), &manifest, &mut findings);
        previous = Some(manifest);
    }

    Ok(VerificationReport {
        current_version: current,
        versions_checked: checked,
        findings,
    })
}

fn check_manifest(
    version: Version,
    previous: Option<&Manifest>,
    manifest: &Manifest,
    findings: &mut Vec<Finding>,
) {
    let mut report = |kind, message: String| {
        findings.push(Finding {
            version,
            kind,
            message,
        })
    };

    if manifest.version != version || manifest.base_version + 1 != version {
        report(
            FindingKind::WrongBaseVersion,
            format!(
                "stored as version {version} but records version {} on base {}",
                manifest.version, manifest.base_version
            ),
        );
    }

    let mut active: BTreeSet<FileId> = BTreeSet::new();
    for file in &manifest.files {
        if !active.insert(file.id) {
            report(
                FindingKind::DuplicateFile,
                format!("file {} is listed more than once", file.id),
            );
        }
    }

    // Without the predecessor only version 1 can be checked, against empty.
    let expected_before: BTreeSet<FileId> = match previous {
        Some(prev) => {
            if manifest.timestamp < prev.timestamp {
                report(
                    FindingKind::TimestampRegression,
                    format!(
                        "timestamp {} is earlier than version {} at {}",
                        manifest.timestamp, prev.version, prev.timestamp
                    ),
                );
            }
            prev.files.iter().map(|f| f.id).collect()
        }
        None if version == 1 => BTreeSet::new(),
        None => return,
    };

    let removed: BTreeSet<FileId> = manifest.removed.iter().map(|f| f.id).collect();
    let stray: Vec<String> = removed
        .difference(&expected_before)
        .map(ToString::to_string)
        .collect();
    if !stray.is_empty() {
        report(
            FindingKind::TransitionMismatch,
            format!("removes files that were not active: {}", stray.join(", ")),
        );
    }

    let mut expected: BTreeSet<FileId> = expected_before.difference(&removed).copied().collect();
    expected.extend(manifest.added.iter().copied());
    if expected != active {
        let missing: Vec<String> = expected.difference(&active).map(ToString::to_string).collect();
        let unexpected: Vec<String> = active.difference(&expected).map(ToString::to_string).collect();
        report(
            FindingKind::TransitionMismatch,
            format!(
                "active files disagree with previous - removed + added (missing: [{}], unexpected: [{}])",
                missing.join(", "),
                unexpected.join(", ")
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datafile::DataFileMeta;
    use crate::log::tests::manifest;
    use crate::log::InMemoryLogStore;
    use chrono::{TimeZone, Utc};

    fn file() -> DataFileMeta {
        let id = FileId::generate();
        DataFileMeta {
            id,
            path: id.path(),
            row_count: 1,
            size_bytes: 10,
            created_at: Utc.with_ymd_and_hms(2025, 10, 29, 0, 0, 0).unwrap(),
            stats: Default::default(),
        }
    }

    #[test]
    fn consistent_log_is_clean() {
        let log = VersionLog::new(InMemoryLogStore::default());
        let a = file();
        let b = file();

        let mut v1 = manifest(1, 1);
        v1.files = vec![a.clone()];
        v1.added = vec![a.id];
        let mut v2 = manifest(2, 2);
        v2.files = vec![b.clone()];
        v2.added = vec![b.id];
        v2.removed = vec![a];
        log.append(&v1).unwrap();
        log.append(&v2).unwrap();

        let report = verify_log(&log).unwrap();
        assert!(report.is_clean(), "{:?}", report.findings);
        assert_eq!(report.versions_checked, 2);
    }

    #[test]
    fn unexplained_file_and_clock_regression_are_reported() {
        let log = VersionLog::new(InMemoryLogStore::default());
        let a = file();

        log.append(&manifest(1, 5)).unwrap();
        let mut v2 = manifest(2, 3);
        v2.files = vec![a];
        log.append(&v2).unwrap();

        let report = verify_log(&log).unwrap();
        let kinds: Vec<FindingKind> = report.findings.iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![FindingKind::TimestampRegression, FindingKind::TransitionMismatch]
        );
        assert!(report.findings.iter().all(|f| f.version == 2));
    }
}
