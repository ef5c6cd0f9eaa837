// Silver cleaning rules.

use std::collections::{HashMap, HashSet};

use crate::constraints::Constraint;
use crate::record::{RecordBatch, Row, Value};

/// Row-level cleaning applied between Bronze and Silver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cleaning {
    /// Rows with a null (or absent) value in any of these columns are dropped.
    pub required: Vec<String>,
    /// Rows failing any of these are dropped rather than rejected.
    pub predicates: Vec<Constraint>,
    /// Keep only the last row per key, ordered by key.
    pub dedupe_key: Option<Vec<String>>,
}

impl Cleaning {
    pub fn require<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required.extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn with_predicate(mut self, predicate: Constraint) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn dedupe_rows_by<I, S>(mut self, key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dedupe_key = Some(key.into_iter().map(Into::into).collect());
        self
    }
}

/// Apply `cleaning` to `batch`. The schema is unchanged.
pub fn clean(batch: RecordBatch, cleaning: &Cleaning) -> RecordBatch {
    let schema = batch.schema().clone();
    let required: Vec<Option<usize>> = cleaning
        .required
        .iter()
        .map(|c| schema.index_of(c))
        .collect();

    let batch = batch.filter(|row| {
        required
            .iter()
            .all(|idx| idx.map_or(false, |i| !row[i].is_null()))
            && cleaning.predicates.iter().all(|c| c.predicate.eval(&schema, row))
    });

    let Some(key) = &cleaning.dedupe_key else {
        return batch;
    };
    let key_idx: Vec<usize> = key.iter().filter_map(|c| schema.index_of(c)).collect();
    if key_idx.is_empty() {
        return batch;
    }
    let key_of = |row: &Row| -> Vec<Value> { key_idx.iter().map(|&i| row[i].clone()).collect() };

    let mut last: HashMap<Vec<Value>, usize> = HashMap::new();
    for (i, row) in batch.rows().iter().enumerate() {
        last.insert(key_of(row), i);
    }
    let mut position = 0;
    let mut rows = batch
        .filter(|row| {
            let keep = last.get(&key_of(row)) == Some(&position);
            position += 1;
            keep
        })
        .into_rows();
    rows.sort_by_key(|row| key_of(row));
    RecordBatch::from_parts_unchecked(schema, rows)
}

/// Rename repeated column names: later duplicates get a `_dup` suffix.
pub fn dedupe_columns(names: &[String]) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    names
        .iter()
        .map(|name| {
            let mut candidate = name.clone();
            while seen.contains(&candidate) {
                candidate.push_str("_dup");
            }
            seen.insert(candidate.clone());
            candidate
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{DataType, Field, Schema};

    fn batch(rows: Vec<(&str, Value)>) -> RecordBatch {
        let schema = Schema::new(vec![
            Field::required("date", DataType::Utf8),
            Field::nullable("close", DataType::Float64),
        ])
        .unwrap();
        RecordBatch::try_new(
            schema,
            rows.into_iter().map(|(d, c)| vec![Value::from(d), c]).collect(),
        )
        .unwrap()
    }

    #[test]
    fn drops_nulls_and_failing_rows() {
        let input = batch(vec![
            ("2025-10-01", Value::Float64(1.0)),
            ("2025-10-02", Value::Null),
            ("2025-10-03", Value::Float64(0.0)),
        ]);
        let rules = Cleaning::default()
            .require(["close"])
            .with_predicate(Constraint::parse("close > 0").unwrap());

        let cleaned = clean(input, &rules);

        assert_eq!(cleaned.num_rows(), 1);
        assert_eq!(cleaned.value(0, "date"), Some(&Value::from("2025-10-01")));
    }

    #[test]
    fn dedupe_keeps_last_and_sorts_by_key() {
        let input = batch(vec![
            ("2025-10-02", Value::Float64(1.0)),
            ("2025-10-01", Value::Float64(2.0)),
            ("2025-10-02", Value::Float64(3.0)),
        ]);

        let cleaned = clean(input, &Cleaning::default().dedupe_rows_by(["date"]));

        assert_eq!(
            cleaned.into_rows(),
            vec![
                vec![Value::from("2025-10-01"), Value::Float64(2.0)],
                vec![Value::from("2025-10-02"), Value::Float64(3.0)],
            ]
        );
    }

    #[test]
    fn repeated_column_names_get_suffix() {
        let names: Vec<String> = ["rate", "code", "rate", "rate"].iter().map(|s| s.to_string()).collect();

        assert_eq!(
            dedupe_columns(&names),
            vec!["rate", "code", "rate_dup", "rate_dup_dup"]
        );
    }
}
