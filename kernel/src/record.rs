// Structural Records
//
// Incoming data arrives with arbitrary columns. It is resolved once at the
// ingestion boundary into a `RecordBatch`: an explicit `Schema` plus rows of
// typed `Value`s. Everything past the boundary works on this shape.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Semantic column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    Int64,
    Float64,
    Utf8,
    Date,
    Timestamp,
}

impl DataType {
    /// Whether every value of `self` converts to `target` without loss.
    pub fn promotes_to(self, target: DataType) -> bool {
        self == target
            || matches!(
                (self, target),
                (DataType::Int64, DataType::Float64) | (DataType::Date, DataType::Timestamp)
            )
    }

    /// The narrowest type both sides promote to, if any.
    pub fn widest(self, other: DataType) -> Option<DataType> {
        if self.promotes_to(other) {
            Some(other)
        } else if other.promotes_to(self) {
            Some(self)
        } else {
            None
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Boolean => "boolean",
            DataType::Int64 => "int64",
            DataType::Float64 => "float64",
            DataType::Utf8 => "utf8",
            DataType::Date => "date",
            DataType::Timestamp => "timestamp",
        };
        f.write_str(name)
    }
}

/// A single cell.
///
/// Equality, ordering and hashing are structural: values of different
/// variants never compare equal and floats compare by `total_cmp`. Use
/// [`Value::compare`] for semantic comparisons across numeric types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(DataType::Boolean),
            Value::Int64(_) => Some(DataType::Int64),
            Value::Float64(_) => Some(DataType::Float64),
            Value::Utf8(_) => Some(DataType::Utf8),
            Value::Date(_) => Some(DataType::Date),
            Value::Timestamp(_) => Some(DataType::Timestamp),
        }
    }

    /// Losslessly convert into `target`. Returns `None` when the value's
    /// type does not promote to `target`.
    pub fn cast_to(&self, target: DataType) -> Option<Value> {
        match (self, target) {
            (Value::Null, _) => Some(Value::Null),
            (Value::Int64(v), DataType::Float64) => Some(Value::Float64(*v as f64)),
            (Value::Date(d), DataType::Timestamp) => {
                Some(Value::Timestamp(d.and_hms_opt(0, 0, 0)?.and_utc()))
            }
            (value, target) if value.data_type() == Some(target) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int64(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Utf8(s) => Some(s),
            _ => None,
        }
    }

    /// Semantic comparison. Numbers compare across int/float, dates against
    /// timestamps; anything involving null or mismatched kinds is unordered.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (a, b) if a.as_f64().is_some() && b.as_f64().is_some() => {
                a.as_f64()?.partial_cmp(&b.as_f64()?)
            }
            (Value::Date(_), Value::Timestamp(_)) => {
                self.cast_to(DataType::Timestamp)?.compare(other)
            }
            (Value::Timestamp(_), Value::Date(_)) => {
                self.compare(&other.cast_to(DataType::Timestamp)?)
            }
            (a, b) if a.data_type() == b.data_type() => Some(a.cmp(b)),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Boolean(_) => 0,
            Value::Int64(_) => 1,
            Value::Float64(_) => 2,
            Value::Utf8(_) => 3,
            Value::Date(_) => 4,
            Value::Timestamp(_) => 5,
            Value::Null => 6,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Nulls sort last.
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::Float64(a), Value::Float64(b)) => a.total_cmp(b),
            (Value::Utf8(a), Value::Utf8(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Null => {}
            Value::Boolean(v) => v.hash(state),
            Value::Int64(v) => v.hash(state),
            Value::Float64(v) => v.to_bits().hash(state),
            Value::Utf8(v) => v.hash(state),
            Value::Date(v) => v.hash(state),
            Value::Timestamp(v) => v.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::Utf8(v) => f.write_str(v),
            Value::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            Value::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Utf8(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Utf8(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

/// Errors raised while building records at the ingestion boundary.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("duplicate column `{column}`")]
    DuplicateColumn { column: String },

    #[error("row {row} has {found} values, schema has {expected} columns")]
    Arity {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("row {row}, column `{column}`: expected {expected}, found {found}")]
    Type {
        row: usize,
        column: String,
        expected: DataType,
        found: DataType,
    },

    #[error("unknown column `{column}`")]
    UnknownColumn { column: String },

    #[error("row {row} is not a JSON object")]
    NotAnObject { row: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    #[serde(default)]
    pub nullable: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
        }
    }

    pub fn nullable(name: impl Into<String>, data_type: DataType) -> Self {
        Self::new(name, data_type, true)
    }

    pub fn required(name: impl Into<String>, data_type: DataType) -> Self {
        Self::new(name, data_type, false)
    }
}

/// Ordered column list; names are unique.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Result<Self, RecordError> {
        for (i, field) in fields.iter().enumerate() {
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(RecordError::DuplicateColumn {
                    column: field.name.clone(),
                });
            }
        }
        Ok(Self { fields })
    }

    pub fn empty() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub(crate) fn push(&mut self, field: Field) {
        self.fields.push(field);
    }

    pub(crate) fn field_mut(&mut self, index: usize) -> &mut Field {
        &mut self.fields[index]
    }
}

pub type Row = Vec<Value>;

/// Rows plus the schema that describes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    schema: Schema,
    rows: Vec<Row>,
}

impl RecordBatch {
    /// Build a batch, checking arity and that every non-null value matches
    /// its column type. Nulls are accepted here; nullability is enforced by
    /// the constraint validator so offending rows can be reported.
    pub fn try_new(schema: Schema, rows: Vec<Row>) -> Result<Self, RecordError> {
        for (i, row) in rows.iter().enumerate() {
            if row.len() != schema.len() {
                return Err(RecordError::Arity {
                    row: i,
                    expected: schema.len(),
                    found: row.len(),
                });
            }
            for (field, value) in schema.fields().iter().zip(row) {
                if let Some(found) = value.data_type() {
                    if found != field.data_type {
                        return Err(RecordError::Type {
                            row: i,
                            column: field.name.clone(),
                            expected: field.data_type,
                            found,
                        });
                    }
                }
            }
        }
        Ok(Self { schema, rows })
    }

    pub fn empty(schema: Schema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
        }
    }

    /// Resolve loosely typed JSON objects into a batch, inferring the schema.
    ///
    /// Column order follows first appearance. Integers and floats mixed in
    /// one column widen to float; a column that is entirely null is utf8.
    pub fn from_json_rows(rows: &[serde_json::Value]) -> Result<Self, RecordError> {
        let mut names: Vec<String> = Vec::new();
        let mut types: Vec<Option<DataType>> = Vec::new();
        let mut nullable: Vec<bool> = Vec::new();

        for (i, row) in rows.iter().enumerate() {
            let object = row.as_object().ok_or(RecordError::NotAnObject { row: i })?;
            for (name, value) in object {
                let idx = match names.iter().position(|n| n == name) {
                    Some(idx) => idx,
                    None => {
                        names.push(name.clone());
                        types.push(None);
                        // Rows seen before this column appeared lack it.
                        nullable.push(i > 0);
                        names.len() - 1
                    }
                };
                let inferred = match value {
                    serde_json::Value::Null => {
                        nullable[idx] = true;
                        continue;
                    }
                    serde_json::Value::Bool(_) => DataType::Boolean,
                    serde_json::Value::Number(n) if n.is_i64() => DataType::Int64,
                    serde_json::Value::Number(_) => DataType::Float64,
                    _ => DataType::Utf8,
                };
                types[idx] = match types[idx] {
                    None => Some(inferred),
                    Some(existing) => Some(existing.widest(inferred).unwrap_or(DataType::Utf8)),
                };
            }
            for (idx, name) in names.iter().enumerate() {
                if !object.contains_key(name) {
                    nullable[idx] = true;
                }
            }
        }

        let fields = names
            .iter()
            .zip(&types)
            .zip(&nullable)
            .map(|((name, ty), nullable)| {
                Field::new(name.clone(), ty.unwrap_or(DataType::Utf8), *nullable)
            })
            .collect();
        let schema = Schema::new(fields)?;

        let typed_rows = rows
            .iter()
            .map(|row| {
                schema
                    .fields()
                    .iter()
                    .map(|field| json_to_value(row.get(&field.name), field.data_type))
                    .collect()
            })
            .collect();

        Self::try_new(schema, typed_rows)
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value at `row` in column `name`.
    pub fn value(&self, row: usize, name: &str) -> Option<&Value> {
        let idx = self.schema.index_of(name)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    pub fn column(&self, name: &str) -> Result<Vec<&Value>, RecordError> {
        let idx = self
            .schema
            .index_of(name)
            .ok_or_else(|| RecordError::UnknownColumn {
                column: name.to_string(),
            })?;
        Ok(self.rows.iter().map(|r| &r[idx]).collect())
    }

    /// Keep only rows for which `keep` returns true.
    pub fn filter(self, mut keep: impl FnMut(&Row) -> bool) -> Self {
        let rows = self.rows.into_iter().filter(|r| keep(r)).collect();
        Self {
            schema: self.schema,
            rows,
        }
    }

    /// Rebuild the rows against `target`: columns matched by name, missing
    /// columns filled with null and promotable values widened. Values that
    /// cannot be widened become null.
    pub fn project(&self, target: &Schema) -> RecordBatch {
        let mapping: Vec<Option<usize>> = target
            .fields()
            .iter()
            .map(|f| self.schema.index_of(&f.name))
            .collect();
        let rows = self
            .rows
            .iter()
            .map(|row| {
                target
                    .fields()
                    .iter()
                    .zip(&mapping)
                    .map(|(field, source)| match source {
                        Some(idx) => row[*idx].cast_to(field.data_type).unwrap_or(Value::Null),
                        None => Value::Null,
                    })
                    .collect()
            })
            .collect();
        RecordBatch {
            schema: target.clone(),
            rows,
        }
    }

    pub(crate) fn from_parts_unchecked(schema: Schema, rows: Vec<Row>) -> Self {
        Self { schema, rows }
    }
}

fn json_to_value(value: Option<&serde_json::Value>, data_type: DataType) -> Value {
    let Some(value) = value else {
        return Value::Null;
    };
    match (value, data_type) {
        (serde_json::Value::Null, _) => Value::Null,
        (serde_json::Value::Bool(b), DataType::Boolean) => Value::Boolean(*b),
        (serde_json::Value::Number(n), DataType::Int64) => {
            n.as_i64().map(Value::Int64).unwrap_or(Value::Null)
        }
        (serde_json::Value::Number(n), DataType::Float64) => {
            n.as_f64().map(Value::Float64).unwrap_or(Value::Null)
        }
        (serde_json::Value::String(s), DataType::Utf8) => Value::Utf8(s.clone()),
        (other, DataType::Utf8) => Value::Utf8(other.to_string()),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schema_rejects_duplicate_columns() {
        let err = Schema::new(vec![
            Field::required("close", DataType::Float64),
            Field::nullable("close", DataType::Float64),
        ])
        .unwrap_err();

        assert_eq!(
            err,
            RecordError::DuplicateColumn {
                column: "close".into()
            }
        );
    }

    #[test]
    fn batch_rejects_type_mismatch() {
        let schema = Schema::new(vec![Field::required("close", DataType::Float64)]).unwrap();
        let err = RecordBatch::try_new(schema, vec![vec![Value::from("high")]]).unwrap_err();

        assert!(matches!(err, RecordError::Type { row: 0, .. }));
    }

    #[test]
    fn json_rows_infer_schema() {
        let batch = RecordBatch::from_json_rows(&[
            json!({"datetime": "2025-10-29", "close": 112766.46}),
            json!({"datetime": "2025-10-30", "close": 5, "volume": 12}),
        ])
        .unwrap();

        let schema = batch.schema();
        assert_eq!(schema.field("datetime").unwrap().data_type, DataType::Utf8);
        assert_eq!(schema.field("close").unwrap().data_type, DataType::Float64);
        assert!(!schema.field("close").unwrap().nullable);
        assert!(schema.field("volume").unwrap().nullable);
        assert_eq!(batch.value(1, "close"), Some(&Value::Float64(5.0)));
        assert_eq!(batch.value(0, "volume"), Some(&Value::Null));
    }

    #[test]
    fn projection_fills_missing_and_widens() {
        let narrow = Schema::new(vec![Field::required("qty", DataType::Int64)]).unwrap();
        let batch = RecordBatch::try_new(narrow, vec![vec![Value::Int64(3)]]).unwrap();
        let wide = Schema::new(vec![
            Field::required("qty", DataType::Float64),
            Field::nullable("note", DataType::Utf8),
        ])
        .unwrap();

        let projected = batch.project(&wide);
        assert_eq!(projected.rows()[0], vec![Value::Float64(3.0), Value::Null]);
    }

    #[test]
    fn semantic_compare_crosses_numeric_types() {
        assert_eq!(
            Value::Float64(-5.0).compare(&Value::Int64(0)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Null.compare(&Value::Int64(0)), None);
        assert_ne!(Value::Float64(1.0), Value::Int64(1));
    }
}
