mod common;

use std::sync::Arc;
use std::thread;

use common::{prices, sorted_rows, two_writers};
use tierlake_kernel::log::Operation;
use tierlake_kernel::maintenance::{compact, CompactionOptions};
use tierlake_kernel::record::Value;
use tierlake_kernel::table::{InMemoryTable, Table, TableError, TableOptions};
use tierlake_kernel::WriteMode;

fn contended() -> TableOptions {
    TableOptions {
        max_commit_retries: 1_000,
        ..TableOptions::default()
    }
}

#[test]
fn disjoint_merges_from_many_threads_all_land() {
    let table = Arc::new(InMemoryTable::in_memory("prices", contended()));

    thread::scope(|s| {
        for writer in 0..4 {
            let table = Arc::clone(&table);
            s.spawn(move || {
                for day in 0..5 {
                    let key = format!("2025-10-{:02}", writer * 5 + day + 1);
                    let batch = prices(&[(key.as_str(), (writer * 10 + day) as f64 + 1.0)]);
                    table.commit(&batch, &WriteMode::merge(["datetime"])).unwrap();
                }
            });
        }
    });

    assert_eq!(table.current_version().unwrap(), 20);
    let rows = table.read_latest().unwrap().records;
    assert_eq!(rows.num_rows(), 20);
    let keys: Vec<&Value> = rows.column("datetime").unwrap();
    for day in 1..=20 {
        let key = Value::from(format!("2025-10-{day:02}"));
        assert!(keys.contains(&&key), "missing {key}");
    }
}

#[test]
fn filesystem_writers_sharing_a_directory_both_commit() {
    let dir = tempfile::tempdir().unwrap();
    let a = Table::open(dir.path(), contended());
    let b = Table::open(dir.path(), contended());

    thread::scope(|s| {
        s.spawn(|| {
            a.commit(&prices(&[("2025-10-01", 1.0)]), &WriteMode::merge(["datetime"]))
                .unwrap()
        });
        s.spawn(|| {
            b.commit(&prices(&[("2025-10-02", 2.0)]), &WriteMode::merge(["datetime"]))
                .unwrap()
        });
    });

    let reopened = Table::open(dir.path(), TableOptions::default());
    assert_eq!(reopened.current_version().unwrap(), 2);
    assert_eq!(
        sorted_rows(reopened.read_latest().unwrap().records),
        vec![
            vec![Value::from("2025-10-01"), Value::Float64(1.0)],
            vec![Value::from("2025-10-02"), Value::Float64(2.0)],
        ]
    );
}

#[test]
fn losing_merge_recomputes_against_winner() {
    let (a, b) = two_writers("prices", TableOptions::default());
    a.commit(&prices(&[("2025-10-01", 1.0)]), &WriteMode::Append).unwrap();

    let winner = Arc::clone(&b);
    a.log().store().before_next_append(move || {
        winner
            .commit(&prices(&[("2025-10-01", 5.0), ("2025-10-02", 6.0)]), &WriteMode::merge(["datetime"]))
            .unwrap();
    });

    let outcome = a
        .commit(&prices(&[("2025-10-01", 9.0)]), &WriteMode::merge(["datetime"]))
        .unwrap();

    assert_eq!(outcome.version(), 3);
    let manifest = a.latest_manifest().unwrap().unwrap();
    assert_eq!(manifest.base_version, 2);
    assert_eq!(
        sorted_rows(a.read_latest().unwrap().records),
        vec![
            vec![Value::from("2025-10-01"), Value::Float64(9.0)],
            vec![Value::from("2025-10-02"), Value::Float64(6.0)],
        ]
    );
}

#[test]
fn compaction_rebases_over_unrelated_commit() {
    let (a, b) = two_writers("prices", TableOptions::default());
    for (i, day) in ["2025-10-01", "2025-10-02", "2025-10-03"].iter().enumerate() {
        a.commit(&prices(&[(*day, i as f64 + 1.0)]), &WriteMode::Append).unwrap();
    }

    let writer = Arc::clone(&b);
    a.log().store().before_next_append(move || {
        writer
            .commit(&prices(&[("2025-11-01", 4.0)]), &WriteMode::merge(["datetime"]))
            .unwrap();
    });

    let report = compact(&a, &CompactionOptions::default()).unwrap();

    assert_eq!(report.version, Some(5));
    assert_eq!(report.files_rewritten, 3);
    let manifest = a.latest_manifest().unwrap().unwrap();
    assert_eq!(manifest.operation, Operation::Optimize);
    assert_eq!(manifest.files.len(), 2);
    assert_eq!(a.read_latest().unwrap().records.num_rows(), 4);
}

#[test]
fn exhausted_retries_report_concurrent_modification() {
    let options = TableOptions {
        max_commit_retries: 1,
        ..TableOptions::default()
    };
    let (a, b) = two_writers("prices", options);

    let writer = Arc::clone(&b);
    a.log().store().before_next_append(move || {
        writer.commit(&prices(&[("2025-10-02", 2.0)]), &WriteMode::Append).unwrap();
    });

    let err = a.commit(&prices(&[("2025-10-01", 1.0)]), &WriteMode::Append).unwrap_err();

    assert!(matches!(
        err,
        TableError::ConcurrentModification {
            attempts: 1,
            operation: Operation::Append,
            ..
        }
    ));
    assert_eq!(b.current_version().unwrap(), 1);
}

#[test]
fn compaction_recomputes_when_merge_removes_an_input_file() {
    let (a, b) = two_writers("prices", TableOptions::default());
    for (i, day) in ["2025-10-01", "2025-10-02", "2025-10-03"].iter().enumerate() {
        a.commit(&prices(&[(*day, i as f64 + 1.0)]), &WriteMode::Append).unwrap();
    }

    let writer = Arc::clone(&b);
    a.log().store().before_next_append(move || {
        writer
            .commit(&prices(&[("2025-10-02", 99.0)]), &WriteMode::merge(["datetime"]))
            .unwrap();
    });

    let report = compact(&a, &CompactionOptions::default()).unwrap();

    assert_eq!(report.version, Some(5));
    assert_eq!(report.files_rewritten, 3);
    assert_eq!(a.latest_manifest().unwrap().unwrap().operation, Operation::Optimize);
    assert_eq!(
        sorted_rows(a.read_latest().unwrap().records),
        vec![
            vec![Value::from("2025-10-01"), Value::Float64(1.0)],
            vec![Value::from("2025-10-02"), Value::Float64(99.0)],
            vec![Value::from("2025-10-03"), Value::Float64(3.0)],
        ]
    );
}
