// Constraint Validator
//
// Constraints are pure, named predicates that every row of a batch must
// satisfy before it may be committed. A single offending row rejects the
// whole batch; rows are never silently dropped here.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::record::{RecordBatch, Row, Schema, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CmpOp {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            CmpOp::Eq => ordering == Ordering::Equal,
            CmpOp::NotEq => ordering != Ordering::Equal,
            CmpOp::Lt => ordering == Ordering::Less,
            CmpOp::LtEq => ordering != Ordering::Greater,
            CmpOp::Gt => ordering == Ordering::Greater,
            CmpOp::GtEq => ordering != Ordering::Less,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::NotEq => "!=",
            CmpOp::Lt => "<",
            CmpOp::LtEq => "<=",
            CmpOp::Gt => ">",
            CmpOp::GtEq => ">=",
        }
    }
}

/// Boolean condition over one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Predicate {
    /// `column <op> literal`. A null cell satisfies the comparison, as in
    /// SQL CHECK constraints; pair with `NotNull` to forbid nulls.
    Compare {
        column: String,
        op: CmpOp,
        value: Value,
    },
    NotNull { column: String },
}

impl Predicate {
    /// Evaluate against `row` laid out by `schema`. A column absent from the
    /// schema reads as null.
    pub fn eval(&self, schema: &Schema, row: &Row) -> bool {
        let cell = |column: &str| schema.index_of(column).map(|idx| &row[idx]);
        match self {
            Predicate::Compare { column, op, value } => match cell(column) {
                None | Some(Value::Null) => true,
                Some(cell) => cell
                    .compare(value)
                    .map(|ordering| op.holds(ordering))
                    .unwrap_or(false),
            },
            Predicate::NotNull { column } => matches!(cell(column), Some(v) if !v.is_null()),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Compare { column, op, value } => match value {
                Value::Utf8(s) => write!(f, "{column}{}'{s}'", op.symbol()),
                other => write!(f, "{column}{}{other}", op.symbol()),
            },
            Predicate::NotNull { column } => write!(f, "{column} IS NOT NULL"),
        }
    }
}

/// A named predicate attached to a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub name: String,
    pub predicate: Predicate,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("cannot parse constraint `{expr}`: {reason}")]
pub struct ConstraintParseError {
    pub expr: String,
    pub reason: String,
}

impl Constraint {
    pub fn new(name: impl Into<String>, predicate: Predicate) -> Self {
        Self {
            name: name.into(),
            predicate,
        }
    }

    /// Constraint named after its canonical predicate text.
    pub fn from_predicate(predicate: Predicate) -> Self {
        Self::new(predicate.to_string(), predicate)
    }

    pub fn not_null(column: impl Into<String>) -> Self {
        Self::from_predicate(Predicate::NotNull {
            column: column.into(),
        })
    }

    /// Parse `"<column> <op> <literal>"` or `"<column> IS NOT NULL"`.
    ///
    /// Literals are integers, floats, `true`/`false` or quoted strings.
    pub fn parse(expr: &str) -> Result<Self, ConstraintParseError> {
        let fail = |reason: &str| ConstraintParseError {
            expr: expr.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = expr.trim();

        let upper = trimmed.to_ascii_uppercase();
        if let Some(column) = upper
            .strip_suffix(" IS NOT NULL")
            .map(|_| trimmed[..trimmed.len() - " IS NOT NULL".len()].trim())
        {
            if !is_identifier(column) {
                return Err(fail("expected a column name before IS NOT NULL"));
            }
            return Ok(Self::not_null(column));
        }

        // Two-character operators first so `>=` is not read as `>`.
        const OPS: [(&str, CmpOp); 7] = [
            (">=", CmpOp::GtEq),
            ("<=", CmpOp::LtEq),
            ("!=", CmpOp::NotEq),
            ("<>", CmpOp::NotEq),
            (">", CmpOp::Gt),
            ("<", CmpOp::Lt),
            ("=", CmpOp::Eq),
        ];
        let (pos, symbol, op) = OPS
            .iter()
            .filter_map(|(symbol, op)| trimmed.find(symbol).map(|pos| (pos, *symbol, *op)))
            .min_by_key(|(pos, symbol, _)| (*pos, std::cmp::Reverse(symbol.len())))
            .ok_or_else(|| fail("no comparison operator"))?;

        let column = trimmed[..pos].trim();
        let literal = trimmed[pos + symbol.len()..].trim();
        if !is_identifier(column) {
            return Err(fail("left side must be a column name"));
        }
        let value = parse_literal(literal).ok_or_else(|| fail("unsupported literal"))?;

        Ok(Self::from_predicate(Predicate::Compare {
            column: column.to_string(),
            op,
            value,
        }))
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}

fn parse_literal(s: &str) -> Option<Value> {
    if let Some(inner) = s
        .strip_prefix('\'')
        .and_then(|r| r.strip_suffix('\''))
        .or_else(|| s.strip_prefix('"').and_then(|r| r.strip_suffix('"')))
    {
        return Some(Value::Utf8(inner.to_string()));
    }
    match s {
        "true" => return Some(Value::Boolean(true)),
        "false" => return Some(Value::Boolean(false)),
        _ => {}
    }
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::Int64(i));
    }
    s.parse::<f64>().ok().map(Value::Float64)
}

/// Returned when a batch breaks a constraint.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("constraint `{constraint}` violated by rows {rows:?}")]
pub struct ConstraintViolation {
    pub constraint: String,
    /// Zero-based indices into the incoming batch.
    pub rows: Vec<usize>,
}

/// Evaluates a set of constraints against whole batches.
#[derive(Debug, Default)]
pub struct ConstraintValidator {
    constraints: Vec<Constraint>,
}

impl ConstraintValidator {
    pub fn new() -> Self {
        Self {
            constraints: Vec::new(),
        }
    }

    /// Validator for a table: declared constraints first, then one not-null
    /// check per non-nullable column.
    pub fn for_table(schema: &Schema, declared: &[Constraint]) -> Self {
        let mut validator = Self::new();
        for constraint in declared {
            validator.register(constraint.clone());
        }
        for field in schema.fields().iter().filter(|f| !f.nullable) {
            validator.register(Constraint::not_null(field.name.clone()));
        }
        validator
    }

    /// Register a constraint; a second constraint with the same name is ignored.
    pub fn register(&mut self, constraint: Constraint) {
        if self.constraints.iter().all(|c| c.name != constraint.name) {
            self.constraints.push(constraint);
        }
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Evaluate all constraints in registration order.
    ///
    /// Stops at the first constraint with any failing row and reports every
    /// row that fails it.
    pub fn evaluate(&self, batch: &RecordBatch) -> Result<(), ConstraintViolation> {
        for constraint in &self.constraints {
            let rows: Vec<usize> = batch
                .rows()
                .iter()
                .enumerate()
                .filter(|(_, row)| !constraint.predicate.eval(batch.schema(), row))
                .map(|(i, _)| i)
                .collect();
            if !rows.is_empty() {
                return Err(ConstraintViolation {
                    constraint: constraint.name.clone(),
                    rows,
                });
            }
        }
        Ok(())
    }
}

/// Check `records` against `constraints`, all-or-nothing.
pub fn validate(records: &RecordBatch, constraints: &[Constraint]) -> Result<(), ConstraintViolation> {
    let mut validator = ConstraintValidator::new();
    for constraint in constraints {
        validator.register(constraint.clone());
    }
    validator.evaluate(records)
}
