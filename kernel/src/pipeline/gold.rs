// Gold aggregates over Silver rows.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::record::{DataType, Field, RecordBatch, Schema, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GoldAggregate {
    /// One row per calendar month of `period_column` with the average,
    /// maximum and minimum of `value_column`.
    PeriodSummary {
        period_column: String,
        value_column: String,
    },
    /// The single row with the greatest `order_by` value.
    Latest { order_by: String },
}

impl GoldAggregate {
    pub fn monthly(period_column: impl Into<String>, value_column: impl Into<String>) -> Self {
        GoldAggregate::PeriodSummary {
            period_column: period_column.into(),
            value_column: value_column.into(),
        }
    }

    pub fn latest(order_by: impl Into<String>) -> Self {
        GoldAggregate::Latest {
            order_by: order_by.into(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("column `{column}` {problem}")]
pub struct AggregateError {
    pub column: String,
    pub problem: String,
}

pub fn aggregate(records: &RecordBatch, definition: &GoldAggregate) -> Result<RecordBatch, AggregateError> {
    match definition {
        GoldAggregate::PeriodSummary {
            period_column,
            value_column,
        } => monthly_summary(records, period_column, value_column),
        GoldAggregate::Latest { order_by } => latest_row(records, order_by),
    }
}

fn column_index(records: &RecordBatch, column: &str) -> Result<usize, AggregateError> {
    records
        .schema()
        .index_of(column)
        .ok_or_else(|| AggregateError {
            column: column.to_string(),
            problem: "is missing from the source table".into(),
        })
}

/// `YYYY-MM` of a date-like cell.
fn month_of(value: &Value) -> Option<String> {
    match value {
        Value::Date(d) => Some(d.format("%Y-%m").to_string()),
        Value::Timestamp(t) => Some(t.format("%Y-%m").to_string()),
        Value::Utf8(s) => s
            .get(..10)
            .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
            .map(|d| d.format("%Y-%m").to_string()),
        _ => None,
    }
}

struct Accumulator {
    sum: f64,
    count: u64,
    max: f64,
    min: f64,
}

fn monthly_summary(
    records: &RecordBatch,
    period_column: &str,
    value_column: &str,
) -> Result<RecordBatch, AggregateError> {
    let period = column_index(records, period_column)?;
    let value = column_index(records, value_column)?;
    let value_type = records.schema().fields()[value].data_type;
    if !matches!(value_type, DataType::Int64 | DataType::Float64) {
        return Err(AggregateError {
            column: value_column.to_string(),
            problem: format!("is {value_type}, expected a numeric column"),
        });
    }

    let mut months: BTreeMap<String, Accumulator> = BTreeMap::new();
    for row in records.rows() {
        let (Some(month), Some(v)) = (month_of(&row[period]), row[value].as_f64()) else {
            continue;
        };
        let acc = months.entry(month).or_insert(Accumulator {
            sum: 0.0,
            count: 0,
            max: f64::NEG_INFINITY,
            min: f64::INFINITY,
        });
        acc.sum += v;
        acc.count += 1;
        acc.max = acc.max.max(v);
        acc.min = acc.min.min(v);
    }

    let schema = Schema::new(vec![
        Field::required("month", DataType::Utf8),
        Field::required(format!("avg_{value_column}"), DataType::Float64),
        Field::required(format!("max_{value_column}"), DataType::Float64),
        Field::required(format!("min_{value_column}"), DataType::Float64),
    ])
    .map_err(|e| AggregateError {
        column: value_column.to_string(),
        problem: e.to_string(),
    })?;
    let rows = months
        .into_iter()
        .map(|(month, acc)| {
            vec![
                Value::Utf8(month),
                Value::Float64(acc.sum / acc.count as f64),
                Value::Float64(acc.max),
                Value::Float64(acc.min),
            ]
        })
        .collect();
    Ok(RecordBatch::from_parts_unchecked(schema, rows))
}

fn latest_row(records: &RecordBatch, order_by: &str) -> Result<RecordBatch, AggregateError> {
    let idx = column_index(records, order_by)?;
    let mut best: Option<&Vec<Value>> = None;
    for row in records.rows() {
        if row[idx].is_null() {
            continue;
        }
        // Ties go to the later row.
        if best.map_or(true, |b| row[idx] >= b[idx]) {
            best = Some(row);
        }
    }
    let rows = best.into_iter().cloned().collect();
    Ok(RecordBatch::from_parts_unchecked(records.schema().clone(), rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daily() -> RecordBatch {
        let schema = Schema::new(vec![
            Field::required("date", DataType::Utf8),
            Field::required("close", DataType::Float64),
        ])
        .unwrap();
        let rows = [
            ("2025-09-30", 100.0),
            ("2025-10-01", 10.0),
            ("2025-10-15", 30.0),
            ("2025-10-31", 20.0),
        ]
        .iter()
        .map(|(d, c)| vec![Value::from(*d), Value::Float64(*c)])
        .collect();
        RecordBatch::try_new(schema, rows).unwrap()
    }

    #[test]
    fn monthly_summary_groups_by_calendar_month() {
        let summary = aggregate(&daily(), &GoldAggregate::monthly("date", "close")).unwrap();

        let names: Vec<&str> = summary.schema().names().collect();
        assert_eq!(names, vec!["month", "avg_close", "max_close", "min_close"]);
        assert_eq!(
            summary.into_rows(),
            vec![
                vec![
                    Value::from("2025-09"),
                    Value::Float64(100.0),
                    Value::Float64(100.0),
                    Value::Float64(100.0),
                ],
                vec![
                    Value::from("2025-10"),
                    Value::Float64(20.0),
                    Value::Float64(30.0),
                    Value::Float64(10.0),
                ],
            ]
        );
    }

    #[test]
    fn latest_picks_greatest_refresh_value() {
        let schema = Schema::new(vec![
            Field::required("last_refreshed", DataType::Utf8),
            Field::required("exchange_rate", DataType::Float64),
        ])
        .unwrap();
        let fx = RecordBatch::try_new(
            schema,
            vec![
                vec![Value::from("2025-10-30 10:00:01"), Value::Float64(0.86)],
                vec![Value::from("2025-10-30 12:00:01"), Value::Float64(0.87)],
                vec![Value::from("2025-10-29 09:00:00"), Value::Float64(0.85)],
            ],
        )
        .unwrap();

        let latest = aggregate(&fx, &GoldAggregate::latest("last_refreshed")).unwrap();

        assert_eq!(latest.num_rows(), 1);
        assert_eq!(latest.value(0, "exchange_rate"), Some(&Value::Float64(0.87)));
    }

    #[test]
    fn missing_columns_are_reported() {
        let err = aggregate(&daily(), &GoldAggregate::monthly("date", "volume")).unwrap_err();
        assert_eq!(err.column, "volume");
    }
}
