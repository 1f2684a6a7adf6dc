use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::schema::{ObjectType, ParseObjectTypeError};
use crate::time::{format_timestamp, parse_timestamp};

/// Keys starting with this prefix are pipeline or envelope metadata, never entity data.
pub const RESERVED_PREFIX: char = '_';

/// Enumeration of errors when turning a raw event into a typed `CdcEvent`.
#[derive(Error, Debug, PartialEq)]
pub enum EventError {
    #[error("event payload is not a JSON object")]
    NotAnObject,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("field {field} holds an invalid value: {value}")]
    InvalidField { field: &'static str, value: String },
    #[error("{0} is not a valid EventType")]
    ParseEventTypeError(String),
    #[error(transparent)]
    ParseObjectTypeError(#[from] ParseObjectTypeError),
    #[error("{event_type} event is missing its '{side}' snapshot")]
    MissingSnapshot {
        event_type: EventType,
        side: &'static str,
    },
}

/// The kind of mutation a CDC event describes. Also used as the change type of history records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

impl EventType {
    pub const ALL: [EventType; 3] = [EventType::Insert, EventType::Update, EventType::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Insert => "INSERT",
            EventType::Update => "UPDATE",
            EventType::Delete => "DELETE",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(EventType::Insert),
            "UPDATE" => Ok(EventType::Update),
            "DELETE" => Ok(EventType::Delete),
            invalid => Err(EventError::ParseEventTypeError(invalid.to_owned())),
        }
    }
}

/// An entity's state at one instant: field name to value, in wire order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(Map<String, Value>);

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a field. Absent fields and explicit nulls both read as `None`.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field).filter(|value| !value.is_null())
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn insert(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(field.into(), value)
    }

    pub fn fields(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for Snapshot {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Snapshot {
    type Error = EventError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(EventError::NotAnObject),
        }
    }
}

/// A CDC event exactly as it arrived: an open JSON object, possibly malformed.
/// The validator inspects this form; only valid events are converted to `CdcEvent`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawEvent(Map<String, Value>);

impl RawEvent {
    /// Read a top-level key. Absent keys and explicit nulls both read as `None`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|value| !value.is_null())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for RawEvent {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for RawEvent {
    type Error = EventError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(EventError::NotAnObject),
        }
    }
}

/// Render a JSON value the way error messages and identifiers quote it: strings unquoted.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A well-formed CDC event.
#[derive(Debug, Clone, PartialEq)]
pub struct CdcEvent {
    pub event_id: Option<String>,
    pub event_type: EventType,
    pub object_type: ObjectType,
    pub record_id: String,
    pub event_timestamp: DateTime<Utc>,
    pub changed_fields: Vec<String>,
    pub before: Option<Snapshot>,
    pub after: Option<Snapshot>,
    pub source: Option<String>,
    /// Envelope and pipeline keys (prefixed with `_`), carried through untouched.
    pub metadata: Map<String, Value>,
}

impl CdcEvent {
    /// The snapshot describing the entity for this event: `after` for INSERT and UPDATE,
    /// `before` for DELETE.
    pub fn snapshot(&self) -> Option<&Snapshot> {
        match self.event_type {
            EventType::Insert | EventType::Update => self.after.as_ref(),
            EventType::Delete => self.before.as_ref(),
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        self.metadata.get("_message_id").and_then(Value::as_str)
    }

    /// Serialize back to the wire shape.
    pub fn to_raw(&self) -> RawEvent {
        let mut map = Map::new();
        map.insert(
            "event_id".to_owned(),
            self.event_id.clone().map_or(Value::Null, Value::String),
        );
        map.insert("event_type".to_owned(), self.event_type.as_str().into());
        map.insert("object_type".to_owned(), self.object_type.as_str().into());
        map.insert("record_id".to_owned(), self.record_id.clone().into());
        map.insert(
            "event_timestamp".to_owned(),
            format_timestamp(&self.event_timestamp).into(),
        );
        map.insert(
            "changed_fields".to_owned(),
            Value::Array(
                self.changed_fields
                    .iter()
                    .cloned()
                    .map(Value::String)
                    .collect(),
            ),
        );
        map.insert("before".to_owned(), snapshot_value(&self.before));
        map.insert("after".to_owned(), snapshot_value(&self.after));
        if let Some(source) = &self.source {
            map.insert("source".to_owned(), source.clone().into());
        }
        for (key, value) in &self.metadata {
            map.insert(key.clone(), value.clone());
        }
        RawEvent(map)
    }
}

fn snapshot_value(snapshot: &Option<Snapshot>) -> Value {
    snapshot
        .as_ref()
        .map_or(Value::Null, |s| Value::Object(s.as_map().clone()))
}

fn required_str<'a>(raw: &'a RawEvent, field: &'static str) -> Result<&'a str, EventError> {
    match raw.get(field) {
        None => Err(EventError::MissingField(field)),
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(EventError::InvalidField {
            field,
            value: other.to_string(),
        }),
    }
}

fn optional_snapshot(
    raw: &RawEvent,
    field: &'static str,
) -> Result<Option<Snapshot>, EventError> {
    match raw.get(field) {
        None => Ok(None),
        Some(Value::Object(map)) => Ok(Some(Snapshot(map.clone()))),
        Some(other) => Err(EventError::InvalidField {
            field,
            value: other.to_string(),
        }),
    }
}

impl TryFrom<&RawEvent> for CdcEvent {
    type Error = EventError;

    fn try_from(raw: &RawEvent) -> Result<Self, Self::Error> {
        let event_type: EventType = required_str(raw, "event_type")?.parse()?;
        let object_type: ObjectType = required_str(raw, "object_type")?.parse()?;
        let record_id = required_str(raw, "record_id")?.to_owned();

        let timestamp = required_str(raw, "event_timestamp")?;
        let event_timestamp =
            parse_timestamp(timestamp).ok_or_else(|| EventError::InvalidField {
                field: "event_timestamp",
                value: timestamp.to_owned(),
            })?;

        let changed_fields = match raw.get("changed_fields") {
            None => Vec::new(),
            Some(Value::Array(fields)) => fields
                .iter()
                .map(|field| match field {
                    Value::String(name) => Ok(name.clone()),
                    other => Err(EventError::InvalidField {
                        field: "changed_fields",
                        value: other.to_string(),
                    }),
                })
                .collect::<Result<Vec<String>, EventError>>()?,
            Some(other) => {
                return Err(EventError::InvalidField {
                    field: "changed_fields",
                    value: other.to_string(),
                })
            }
        };

        let before = optional_snapshot(raw, "before")?;
        let after = optional_snapshot(raw, "after")?;

        match event_type {
            EventType::Insert | EventType::Update if after.is_none() => {
                return Err(EventError::MissingSnapshot {
                    event_type,
                    side: "after",
                })
            }
            EventType::Update | EventType::Delete if before.is_none() => {
                return Err(EventError::MissingSnapshot {
                    event_type,
                    side: "before",
                })
            }
            _ => {}
        }

        let metadata = raw
            .as_map()
            .iter()
            .filter(|(key, _)| key.starts_with(RESERVED_PREFIX))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Ok(CdcEvent {
            event_id: raw.get_str("event_id").map(String::from),
            event_type,
            object_type,
            record_id,
            event_timestamp,
            changed_fields,
            before,
            after,
            source: raw.get_str("source").map(String::from),
            metadata,
        })
    }
}

impl TryFrom<RawEvent> for CdcEvent {
    type Error = EventError;

    fn try_from(raw: RawEvent) -> Result<Self, Self::Error> {
        CdcEvent::try_from(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> RawEvent {
        RawEvent::try_from(value).unwrap()
    }

    #[test]
    fn converts_a_well_formed_update() {
        let event = CdcEvent::try_from(raw(json!({
            "event_id": "CDC-ABCDEF123456",
            "event_type": "UPDATE",
            "object_type": "Account",
            "record_id": "001ABCDEFGHIJKLMNO",
            "event_timestamp": "2024-05-01T12:00:00Z",
            "changed_fields": ["name"],
            "before": {"id": "001ABCDEFGHIJKLMNO", "name": "Acme"},
            "after": {"id": "001ABCDEFGHIJKLMNO", "name": "Acme Corp"},
            "source": "crm_cdc",
            "_message_id": "42",
        })))
        .unwrap();

        assert_eq!(event.event_type, EventType::Update);
        assert_eq!(event.object_type, ObjectType::Account);
        assert_eq!(event.changed_fields, vec!["name".to_owned()]);
        assert_eq!(event.message_id(), Some("42"));
        assert_eq!(
            event.snapshot().and_then(|s| s.get("name")),
            Some(&json!("Acme Corp"))
        );
        assert_eq!(event.source.as_deref(), Some("crm_cdc"));
    }

    #[test]
    fn delete_reads_its_before_snapshot() {
        let event = CdcEvent::try_from(raw(json!({
            "event_type": "DELETE",
            "object_type": "Case",
            "record_id": "500ABCDEFGHIJKLMNO",
            "event_timestamp": "2024-05-01T12:00:00Z",
            "before": {"id": "500ABCDEFGHIJKLMNO", "subject": "Broken"},
            "after": null,
        })))
        .unwrap();

        assert_eq!(event.event_id, None);
        assert!(event.changed_fields.is_empty());
        assert_eq!(
            event.snapshot().and_then(|s| s.get("subject")),
            Some(&json!("Broken"))
        );
    }

    #[test]
    fn rejects_missing_snapshots() {
        let err = CdcEvent::try_from(raw(json!({
            "event_type": "UPDATE",
            "object_type": "Account",
            "record_id": "001ABCDEFGHIJKLMNO",
            "event_timestamp": "2024-05-01T12:00:00Z",
            "after": {"id": "001ABCDEFGHIJKLMNO"},
        })))
        .unwrap_err();

        assert_eq!(
            err,
            EventError::MissingSnapshot {
                event_type: EventType::Update,
                side: "before"
            }
        );
    }

    #[test]
    fn rejects_unknown_enums() {
        let err = CdcEvent::try_from(raw(json!({
            "event_type": "MERGE",
            "object_type": "Account",
            "record_id": "001ABCDEFGHIJKLMNO",
            "event_timestamp": "2024-05-01T12:00:00Z",
        })))
        .unwrap_err();
        assert_eq!(err, EventError::ParseEventTypeError("MERGE".to_owned()));
    }

    #[test]
    fn to_raw_keeps_the_wire_shape() {
        let original = raw(json!({
            "event_id": "CDC-ABCDEF123456",
            "event_type": "INSERT",
            "object_type": "Contact",
            "record_id": "003ABCDEFGHIJKLMNO",
            "event_timestamp": "2024-05-01T12:00:00Z",
            "changed_fields": [],
            "before": null,
            "after": {"id": "003ABCDEFGHIJKLMNO", "first_name": "Ada"},
            "_message_id": "7",
        }));
        let event = CdcEvent::try_from(&original).unwrap();

        assert_eq!(event.to_raw(), original);
    }

    #[test]
    fn snapshot_reads_null_as_absent() {
        let snapshot = Snapshot::try_from(json!({"phone": null, "name": "Acme"})).unwrap();
        assert_eq!(snapshot.get("phone"), None);
        assert_eq!(snapshot.get("missing"), None);
        assert!(snapshot.contains("phone"));
        assert_eq!(snapshot.get("name"), Some(&json!("Acme")));
    }
}
