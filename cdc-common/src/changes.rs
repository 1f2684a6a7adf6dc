use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;

use crate::event::Snapshot;

/// Fields stamped by the pipeline itself. Differences in these never count as business changes.
pub const BOOKKEEPING_FIELDS: &[&str] = &[
    "ingestion_timestamp",
    "source",
    "_cdc_event_id",
    "_cdc_event_type",
    "_cdc_event_timestamp",
    "_message_id",
    "_pubsub_message_id",
    "_processing_timestamp",
    "system_modstamp",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldChange {
    pub before: Value,
    pub after: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSet {
    /// Changed field names, sorted.
    pub changed_fields: Vec<String>,
    pub field_changes: BTreeMap<String, FieldChange>,
}

impl ChangeSet {
    pub fn has_changes(&self) -> bool {
        !self.changed_fields.is_empty()
    }
}

/// Compare two snapshots field by field.
///
/// With `tracked_fields` unset (or empty) the union of both snapshots' fields is examined.
/// Bookkeeping fields are always ignored. A field missing on one side compares equal to null.
pub fn detect_changes(
    before: &Snapshot,
    after: &Snapshot,
    tracked_fields: Option<&[&str]>,
) -> ChangeSet {
    let fields: BTreeSet<&str> = match tracked_fields {
        Some(tracked) if !tracked.is_empty() => tracked.iter().copied().collect(),
        _ => before
            .fields()
            .chain(after.fields())
            .map(String::as_str)
            .collect(),
    };

    let mut changes = ChangeSet::default();
    for field in fields {
        if BOOKKEEPING_FIELDS.contains(&field) {
            continue;
        }

        let before_value = before.get(field).cloned().unwrap_or(Value::Null);
        let after_value = after.get(field).cloned().unwrap_or(Value::Null);
        if !values_equal(&before_value, &after_value) {
            changes.changed_fields.push(field.to_owned());
            changes.field_changes.insert(
                field.to_owned(),
                FieldChange {
                    before: before_value,
                    after: after_value,
                },
            );
        }
    }
    changes
}

/// Value equality where `1` and `1.0` are the same number.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(key, x)| ys.get(key).map_or(false, |y| values_equal(x, y)))
        }
        _ => a == b,
    }
}
