// Schema Evolution Resolver
//
// Reconciles the schema of an incoming batch with the table's current
// schema. Evolution is monotonic: columns are never dropped, types only
// widen, and nullability only loosens.

use crate::record::{DataType, Field, RecordBatch, Schema};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("column `{column}` is {current} in the table but {incoming} in the incoming batch")]
    Incompatible {
        column: String,
        current: DataType,
        incoming: DataType,
    },
}

/// Merge `incoming` into `current`.
///
/// - shared columns keep their position and take the wider of the two types
/// - columns only in `incoming` are appended as nullable
/// - columns only in `current` are kept unchanged
///
/// A table with no columns yet adopts `incoming` verbatim.
pub fn reconcile(current: &Schema, incoming: &Schema) -> Result<Schema, SchemaError> {
    if current.is_empty() {
        return Ok(incoming.clone());
    }

    let mut merged = current.clone();
    for field in incoming.fields() {
        match merged.index_of(&field.name) {
            Some(idx) => {
                let existing = merged.field_mut(idx);
                let widened = existing.data_type.widest(field.data_type).ok_or_else(|| {
                    SchemaError::Incompatible {
                        column: field.name.clone(),
                        current: existing.data_type,
                        incoming: field.data_type,
                    }
                })?;
                existing.data_type = widened;
                existing.nullable |= field.nullable;
            }
            None => merged.push(Field::nullable(field.name.clone(), field.data_type)),
        }
    }
    Ok(merged)
}

/// Reshape a batch to a schema produced by [`reconcile`].
pub fn conform(batch: &RecordBatch, merged: &Schema) -> RecordBatch {
    if batch.schema() == merged {
        return batch.clone();
    }
    batch.project(merged)
}
