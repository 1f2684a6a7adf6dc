//! Structural and semantic checks for a single raw CDC event, plus the running counters
//! used to decide whether the invalid-event rate warrants an alert.
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::event::{display_value, EventType, RawEvent};
use crate::schema::{is_valid_identifier, value_kind, FieldKind, ObjectType};
use crate::time::{parse_timestamp, SystemTime, TimeSource};

pub const DEFAULT_ALERT_THRESHOLD: f64 = 0.05;

/// Events older than this many whole days are rejected.
pub const MAX_EVENT_AGE_DAYS: i64 = 365;

/// The named checks an event goes through. Each failing check is counted once per event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    EventType,
    ObjectType,
    RecordId,
    Timestamp,
    ChangedFields,
    NullFields,
    FieldTypes,
    ForeignKeys,
}

impl Check {
    pub fn as_str(&self) -> &'static str {
        match self {
            Check::EventType => "event_type",
            Check::ObjectType => "object_type",
            Check::RecordId => "record_id",
            Check::Timestamp => "timestamp",
            Check::ChangedFields => "changed_fields",
            Check::NullFields => "null_fields",
            Check::FieldTypes => "field_types",
            Check::ForeignKeys => "foreign_keys",
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which snapshot of an event a problem was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Before,
    After,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Before => "before",
            Side::After => "after",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One problem found in an event. Validation problems are data: they are collected,
/// reported and attached to the event, never raised.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    MissingField(&'static str),
    InvalidEventType(String),
    InvalidObjectType(String),
    InvalidRecordId(String),
    InvalidTimestamp(String),
    FutureTimestamp(String),
    StaleTimestamp { timestamp: String, age_days: i64 },
    MissingChangedFields,
    ChangedFieldsNotAList(&'static str),
    EmptyChangedFields,
    ShapeUnknown(&'static str),
    MissingSnapshot { side: Side, event_type: EventType },
    UnexpectedSnapshot { side: Side, event_type: EventType },
    SnapshotNotAnObject(Side),
    RequiredFieldMissing(&'static str),
    WrongFieldType {
        field: &'static str,
        side: Side,
        expected: FieldKind,
        actual: &'static str,
    },
    InvalidForeignKey { field: &'static str, value: String },
}

impl ValidationError {
    /// The check this error is counted under.
    pub fn check(&self) -> Check {
        match self {
            ValidationError::MissingField("event_type") | ValidationError::InvalidEventType(_) => {
                Check::EventType
            }
            ValidationError::MissingField("object_type")
            | ValidationError::InvalidObjectType(_) => Check::ObjectType,
            ValidationError::MissingField("record_id") | ValidationError::InvalidRecordId(_) => {
                Check::RecordId
            }
            ValidationError::MissingField(_)
            | ValidationError::InvalidTimestamp(_)
            | ValidationError::FutureTimestamp(_)
            | ValidationError::StaleTimestamp { .. } => Check::Timestamp,
            ValidationError::MissingChangedFields
            | ValidationError::ChangedFieldsNotAList(_)
            | ValidationError::EmptyChangedFields => Check::ChangedFields,
            ValidationError::ShapeUnknown(_)
            | ValidationError::MissingSnapshot { .. }
            | ValidationError::UnexpectedSnapshot { .. }
            | ValidationError::SnapshotNotAnObject(_)
            | ValidationError::RequiredFieldMissing(_) => Check::NullFields,
            ValidationError::WrongFieldType { .. } => Check::FieldTypes,
            ValidationError::InvalidForeignKey { .. } => Check::ForeignKeys,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::MissingField(field) => write!(f, "Missing required field: {field}"),
            ValidationError::InvalidEventType(value) => write!(
                f,
                "Invalid event_type: '{value}'. Must be one of [INSERT, UPDATE, DELETE]"
            ),
            ValidationError::InvalidObjectType(value) => write!(
                f,
                "Invalid object_type: '{value}'. Must be one of [Account, Contact, Opportunity, Case]"
            ),
            ValidationError::InvalidRecordId(value) => write!(
                f,
                "Invalid record_id format: '{value}'. Must be 15-18 alphanumeric characters"
            ),
            ValidationError::InvalidTimestamp(value) => write!(
                f,
                "Invalid event_timestamp format: '{value}'. Must be ISO 8601 format"
            ),
            ValidationError::FutureTimestamp(value) => {
                write!(f, "event_timestamp is in the future: '{value}'")
            }
            ValidationError::StaleTimestamp {
                timestamp,
                age_days,
            } => write!(
                f,
                "event_timestamp is too old: '{timestamp}' ({age_days} days ago)"
            ),
            ValidationError::MissingChangedFields => {
                f.write_str("Missing 'changed_fields' for UPDATE event")
            }
            ValidationError::ChangedFieldsNotAList(kind) => {
                write!(f, "'changed_fields' must be a list, got {kind}")
            }
            ValidationError::EmptyChangedFields => {
                f.write_str("'changed_fields' cannot be empty for UPDATE event")
            }
            ValidationError::ShapeUnknown(field) => {
                write!(f, "Cannot validate required fields without {field}")
            }
            ValidationError::MissingSnapshot { side, event_type } => {
                write!(f, "Missing '{side}' data for {event_type} event")
            }
            ValidationError::UnexpectedSnapshot { side, event_type } => {
                write!(f, "Unexpected '{side}' data for {event_type} event")
            }
            ValidationError::SnapshotNotAnObject(side) => {
                write!(f, "'{side}' data must be an object")
            }
            ValidationError::RequiredFieldMissing(field) => {
                write!(f, "Required field '{field}' is null or missing in 'after' data")
            }
            ValidationError::WrongFieldType {
                field,
                side,
                expected,
                actual,
            } => write!(
                f,
                "Field '{field}' has wrong type in '{side}': expected {expected}, got {actual}"
            ),
            ValidationError::InvalidForeignKey { field, value } => {
                write!(f, "Foreign key '{field}' has invalid format: '{value}'")
            }
        }
    }
}

/// The outcome of validating one event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Human readable error strings, in the order the checks ran.
    pub fn messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Counters {
    total: u64,
    valid: u64,
    invalid: u64,
    error_types: BTreeMap<Check, u64>,
}

/// A point-in-time copy of a validator's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationSummary {
    pub total_events: u64,
    pub valid_events: u64,
    pub invalid_events: u64,
    pub error_rate: f64,
    pub exceeds_threshold: bool,
    pub error_types: BTreeMap<Check, u64>,
}

/// Validates CDC events and keeps running counters for the events it has seen.
///
/// Counters belong to the instance: use one validator per consumer or batch session
/// rather than sharing one across threads.
pub struct Validator {
    alert_threshold: f64,
    time: Arc<dyn TimeSource + Send + Sync>,
    counters: Counters,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(DEFAULT_ALERT_THRESHOLD)
    }
}

impl Validator {
    pub fn new(alert_threshold: f64) -> Self {
        Self::with_time_source(alert_threshold, Arc::new(SystemTime {}))
    }

    pub fn with_time_source(
        alert_threshold: f64,
        time: Arc<dyn TimeSource + Send + Sync>,
    ) -> Self {
        Self {
            alert_threshold,
            time,
            counters: Counters::default(),
        }
    }

    pub fn alert_threshold(&self) -> f64 {
        self.alert_threshold
    }

    /// Run every check against the event and update the counters. All checks run, so the
    /// report lists every problem rather than the first.
    pub fn validate(&mut self, event: &RawEvent) -> ValidationReport {
        let mut errors = Vec::new();
        let mut failed = Vec::new();

        let single_checks = [
            self.check_event_type(event),
            self.check_object_type(event),
            self.check_record_id(event),
            self.check_timestamp(event),
            self.check_changed_fields(event),
        ];
        for error in single_checks.into_iter().flatten() {
            failed.push(error.check());
            errors.push(error);
        }

        let multi_checks = [
            (Check::NullFields, self.check_required_fields(event)),
            (Check::FieldTypes, self.check_field_types(event)),
            (Check::ForeignKeys, self.check_foreign_keys(event)),
        ];
        for (check, check_errors) in multi_checks {
            if !check_errors.is_empty() {
                failed.push(check);
                errors.extend(check_errors);
            }
        }

        self.counters.total += 1;
        if errors.is_empty() {
            self.counters.valid += 1;
        } else {
            self.counters.invalid += 1;
        }
        for check in failed {
            *self.counters.error_types.entry(check).or_insert(0) += 1;
        }

        ValidationReport { errors }
    }

    pub fn check_event_type(&self, event: &RawEvent) -> Option<ValidationError> {
        match event.get("event_type") {
            None => Some(ValidationError::MissingField("event_type")),
            Some(value) => match value.as_str().map(str::parse::<EventType>) {
                Some(Ok(_)) => None,
                _ => Some(ValidationError::InvalidEventType(display_value(value))),
            },
        }
    }

    pub fn check_object_type(&self, event: &RawEvent) -> Option<ValidationError> {
        match event.get("object_type") {
            None => Some(ValidationError::MissingField("object_type")),
            Some(value) => match value.as_str().map(str::parse::<ObjectType>) {
                Some(Ok(_)) => None,
                _ => Some(ValidationError::InvalidObjectType(display_value(value))),
            },
        }
    }

    pub fn check_record_id(&self, event: &RawEvent) -> Option<ValidationError> {
        let value = match event.get("record_id") {
            None => return Some(ValidationError::MissingField("record_id")),
            Some(value) => display_value(value),
        };

        if is_valid_identifier(&value) {
            None
        } else {
            Some(ValidationError::InvalidRecordId(value))
        }
    }

    /// The timestamp must parse, must not be ahead of the validator's clock, and must not be
    /// more than a year old.
    pub fn check_timestamp(&self, event: &RawEvent) -> Option<ValidationError> {
        let raw = match event.get("event_timestamp") {
            None => return Some(ValidationError::MissingField("event_timestamp")),
            Some(value) => value,
        };

        let text = display_value(raw);
        let timestamp = match raw.as_str().and_then(parse_timestamp) {
            Some(timestamp) => timestamp,
            None => return Some(ValidationError::InvalidTimestamp(text)),
        };

        let now = self.time.current_time();
        if timestamp > now {
            return Some(ValidationError::FutureTimestamp(text));
        }

        let age_days = (now - timestamp).num_days();
        if age_days > MAX_EVENT_AGE_DAYS {
            return Some(ValidationError::StaleTimestamp {
                timestamp: text,
                age_days,
            });
        }

        None
    }

    pub fn check_changed_fields(&self, event: &RawEvent) -> Option<ValidationError> {
        if event.get_str("event_type") != Some(EventType::Update.as_str()) {
            return None;
        }

        match event.get("changed_fields") {
            None => Some(ValidationError::MissingChangedFields),
            Some(Value::Array(fields)) if fields.is_empty() => {
                Some(ValidationError::EmptyChangedFields)
            }
            Some(Value::Array(_)) => None,
            Some(other) => Some(ValidationError::ChangedFieldsNotAList(value_kind(other))),
        }
    }

    /// Checks snapshot presence for the event type and non-null required fields in `after`.
    pub fn check_required_fields(&self, event: &RawEvent) -> Vec<ValidationError> {
        if event.get("object_type").is_none() {
            return vec![ValidationError::ShapeUnknown("object_type")];
        }
        let event_type = match event.get("event_type") {
            None => return vec![ValidationError::ShapeUnknown("event_type")],
            Some(value) => match value.as_str().map(str::parse::<EventType>) {
                Some(Ok(event_type)) => event_type,
                // An unknown event type has no expected shape; the event type check reports it.
                _ => return Vec::new(),
            },
        };
        let object_type = event
            .get_str("object_type")
            .and_then(|value| value.parse::<ObjectType>().ok());

        let mut errors = Vec::new();

        if matches!(event_type, EventType::Insert | EventType::Update) {
            match event.get(Side::After.as_str()) {
                None => {
                    errors.push(ValidationError::MissingSnapshot {
                        side: Side::After,
                        event_type,
                    });
                    return errors;
                }
                Some(Value::Object(after)) => {
                    let required = object_type.map_or(&[][..], |o| o.required_fields());
                    for field in required {
                        if after.get(*field).map_or(true, Value::is_null) {
                            errors.push(ValidationError::RequiredFieldMissing(*field));
                        }
                    }
                }
                Some(_) => errors.push(ValidationError::SnapshotNotAnObject(Side::After)),
            }
        }

        if matches!(event_type, EventType::Update | EventType::Delete) {
            match event.get(Side::Before.as_str()) {
                None => {
                    errors.push(ValidationError::MissingSnapshot {
                        side: Side::Before,
                        event_type,
                    });
                    return errors;
                }
                Some(Value::Object(_)) => {}
                Some(_) => errors.push(ValidationError::SnapshotNotAnObject(Side::Before)),
            }
        }

        match event_type {
            EventType::Insert if event.get(Side::Before.as_str()).is_some() => {
                errors.push(ValidationError::UnexpectedSnapshot {
                    side: Side::Before,
                    event_type,
                })
            }
            EventType::Delete if event.get(Side::After.as_str()).is_some() => {
                errors.push(ValidationError::UnexpectedSnapshot {
                    side: Side::After,
                    event_type,
                })
            }
            _ => {}
        }

        errors
    }

    /// Checks declared field kinds in both snapshots. Unknown object types are skipped.
    pub fn check_field_types(&self, event: &RawEvent) -> Vec<ValidationError> {
        let object_type = match event
            .get_str("object_type")
            .and_then(|value| value.parse::<ObjectType>().ok())
        {
            Some(object_type) => object_type,
            None => return Vec::new(),
        };

        let mut errors = Vec::new();
        for side in [Side::After, Side::Before] {
            let snapshot = match event.get(side.as_str()) {
                Some(Value::Object(snapshot)) => snapshot,
                _ => continue,
            };
            for (field, expected) in object_type.field_kinds() {
                if let Some(value) = snapshot.get(*field) {
                    if !expected.matches(value) {
                        errors.push(ValidationError::WrongFieldType {
                            field: *field,
                            side,
                            expected: *expected,
                            actual: value_kind(value),
                        });
                    }
                }
            }
        }
        errors
    }

    /// Foreign keys in `after` must look like identifiers when set.
    pub fn check_foreign_keys(&self, event: &RawEvent) -> Vec<ValidationError> {
        let object_type = match event
            .get_str("object_type")
            .and_then(|value| value.parse::<ObjectType>().ok())
        {
            Some(object_type) => object_type,
            None => return Vec::new(),
        };
        let after = match event.get(Side::After.as_str()) {
            Some(Value::Object(after)) => after,
            _ => return Vec::new(),
        };

        object_type
            .foreign_keys()
            .iter()
            .filter_map(|field| {
                let value = after.get(*field).filter(|v| !v.is_null())?;
                let value = display_value(value);
                (!is_valid_identifier(&value)).then_some(ValidationError::InvalidForeignKey {
                    field: *field,
                    value,
                })
            })
            .collect()
    }

    pub fn error_rate(&self) -> f64 {
        if self.counters.total == 0 {
            return 0.0;
        }
        self.counters.invalid as f64 / self.counters.total as f64
    }

    /// True once the invalid rate strictly exceeds the threshold.
    pub fn should_alert(&self) -> bool {
        self.error_rate() > self.alert_threshold
    }

    pub fn statistics(&self) -> ValidationSummary {
        let error_rate = self.error_rate();
        ValidationSummary {
            total_events: self.counters.total,
            valid_events: self.counters.valid,
            invalid_events: self.counters.invalid,
            error_rate,
            exceeds_threshold: error_rate > self.alert_threshold,
            error_types: self.counters.error_types.clone(),
        }
    }

    pub fn reset_statistics(&mut self) {
        self.counters = Counters::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::FixedTime;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn validator() -> Validator {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        Validator::with_time_source(DEFAULT_ALERT_THRESHOLD, Arc::new(FixedTime { time: now }))
    }

    fn event(value: Value) -> RawEvent {
        RawEvent::try_from(value).unwrap()
    }

    fn account_insert() -> Value {
        json!({
            "event_id": "CDC-0123456789AB",
            "event_type": "INSERT",
            "object_type": "Account",
            "record_id": "001ABCDEFGHIJKLMNO",
            "event_timestamp": "2024-05-31T10:00:00Z",
            "changed_fields": [],
            "before": null,
            "after": {
                "id": "001ABCDEFGHIJKLMNO",
                "name": "Acme",
                "annual_revenue": 1200000.0,
                "created_date": "2024-05-31T10:00:00Z",
                "last_modified_date": "2024-05-31T10:00:00Z",
            },
        })
    }

    fn contact_update() -> Value {
        json!({
            "event_type": "UPDATE",
            "object_type": "Contact",
            "record_id": "003ABCDEFGHIJKLMNO",
            "event_timestamp": "2024-05-31T10:00:00Z",
            "changed_fields": ["email"],
            "before": {
                "id": "003ABCDEFGHIJKLMNO",
                "first_name": "Ada",
                "last_name": "Lovelace",
                "email": "ada@old.example",
                "created_date": "2024-01-01T00:00:00Z",
                "last_modified_date": "2024-01-01T00:00:00Z",
            },
            "after": {
                "id": "003ABCDEFGHIJKLMNO",
                "account_id": "001ABCDEFGHIJKLMNO",
                "first_name": "Ada",
                "last_name": "Lovelace",
                "email": "ada@new.example",
                "created_date": "2024-01-01T00:00:00Z",
                "last_modified_date": "2024-05-31T10:00:00Z",
            },
        })
    }

    #[test]
    fn accepts_well_formed_events() {
        let mut validator = validator();
        assert!(validator.validate(&event(account_insert())).is_valid());
        assert!(validator.validate(&event(contact_update())).is_valid());

        let stats = validator.statistics();
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.valid_events, 2);
        assert!(stats.error_types.is_empty());
    }

    #[test]
    fn reports_invalid_enums_and_identifiers() {
        let mut raw = account_insert();
        raw["event_type"] = json!("MERGE");
        raw["record_id"] = json!("001-bad");

        let report = validator().validate(&event(raw));
        assert_eq!(
            report.messages(),
            vec![
                "Invalid event_type: 'MERGE'. Must be one of [INSERT, UPDATE, DELETE]".to_owned(),
                "Invalid record_id format: '001-bad'. Must be 15-18 alphanumeric characters"
                    .to_owned(),
            ]
        );
    }

    #[test]
    fn bad_record_id_fails_regardless_of_other_fields() {
        let mut raw = contact_update();
        raw["record_id"] = json!(12345);
        raw["changed_fields"] = json!([]);

        let report = validator().validate(&event(raw));
        let checks: Vec<Check> = report.errors.iter().map(ValidationError::check).collect();
        assert_eq!(checks, vec![Check::RecordId, Check::ChangedFields]);
        assert_eq!(
            report.errors[1].to_string(),
            "'changed_fields' cannot be empty for UPDATE event"
        );
    }

    #[test]
    fn timestamps_must_be_recent_and_in_the_past() {
        let validator = validator();

        let mut raw = account_insert();
        raw["event_timestamp"] = json!("2024-06-01T12:00:01Z");
        assert_eq!(
            validator.check_timestamp(&event(raw)),
            Some(ValidationError::FutureTimestamp(
                "2024-06-01T12:00:01Z".to_owned()
            ))
        );

        let mut raw = account_insert();
        raw["event_timestamp"] = json!("2023-05-01T12:00:00Z");
        let error = validator.check_timestamp(&event(raw)).unwrap();
        assert_eq!(
            error.to_string(),
            "event_timestamp is too old: '2023-05-01T12:00:00Z' (397 days ago)"
        );

        let mut raw = account_insert();
        raw["event_timestamp"] = json!("2023-06-03T12:00:00Z");
        assert_eq!(validator.check_timestamp(&event(raw)), None);

        let mut raw = account_insert();
        raw["event_timestamp"] = json!("last tuesday");
        assert_eq!(
            validator.check_timestamp(&event(raw)),
            Some(ValidationError::InvalidTimestamp("last tuesday".to_owned()))
        );
    }

    #[test]
    fn changed_fields_must_be_a_non_empty_list_for_updates() {
        let validator = validator();

        let mut raw = contact_update();
        raw.as_object_mut().unwrap().remove("changed_fields");
        assert_eq!(
            validator.check_changed_fields(&event(raw)),
            Some(ValidationError::MissingChangedFields)
        );

        let mut raw = contact_update();
        raw["changed_fields"] = json!("email");
        assert_eq!(
            validator
                .check_changed_fields(&event(raw))
                .map(|e| e.to_string()),
            Some("'changed_fields' must be a list, got string".to_owned())
        );

        let mut raw = account_insert();
        raw["changed_fields"] = json!("ignored for inserts");
        assert_eq!(validator.check_changed_fields(&event(raw)), None);
    }

    #[test]
    fn insert_requires_after_and_no_before() {
        let validator = validator();

        let mut raw = account_insert();
        raw["after"] = Value::Null;
        assert_eq!(
            validator.check_required_fields(&event(raw)),
            vec![ValidationError::MissingSnapshot {
                side: Side::After,
                event_type: EventType::Insert
            }]
        );

        let mut raw = account_insert();
        raw["before"] = json!({"id": "001ABCDEFGHIJKLMNO"});
        let errors = validator.check_required_fields(&event(raw));
        assert_eq!(
            errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["Unexpected 'before' data for INSERT event".to_owned()]
        );
    }

    #[test]
    fn required_fields_must_be_non_null() {
        let mut raw = account_insert();
        raw["after"]["name"] = Value::Null;
        raw["after"].as_object_mut().unwrap().remove("created_date");

        let errors = validator().check_required_fields(&event(raw));
        assert_eq!(
            errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec![
                "Required field 'name' is null or missing in 'after' data".to_owned(),
                "Required field 'created_date' is null or missing in 'after' data".to_owned(),
            ]
        );
    }

    #[test]
    fn shape_checks_short_circuit_without_object_type() {
        let mut raw = account_insert();
        raw.as_object_mut().unwrap().remove("object_type");

        let mut validator = validator();
        let report = validator.validate(&event(raw));
        assert_eq!(
            report.messages(),
            vec![
                "Missing required field: object_type".to_owned(),
                "Cannot validate required fields without object_type".to_owned(),
            ]
        );
        let stats = validator.statistics();
        assert_eq!(stats.error_types.get(&Check::ObjectType), Some(&1));
        assert_eq!(stats.error_types.get(&Check::NullFields), Some(&1));
    }

    #[test]
    fn update_and_delete_require_before() {
        let mut raw = contact_update();
        raw["before"] = Value::Null;
        assert_eq!(
            validator()
                .check_required_fields(&event(raw))
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>(),
            vec!["Missing 'before' data for UPDATE event".to_owned()]
        );
    }

    #[test]
    fn field_types_are_checked_on_both_sides() {
        let mut raw = contact_update();
        raw["after"]["email"] = json!(42);
        raw["before"]["first_name"] = json!(false);

        let errors = validator().check_field_types(&event(raw));
        assert_eq!(
            errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec![
                "Field 'email' has wrong type in 'after': expected string, got number".to_owned(),
                "Field 'first_name' has wrong type in 'before': expected string, got boolean"
                    .to_owned(),
            ]
        );

        let mut unknown = contact_update();
        unknown["object_type"] = json!("Lead");
        unknown["after"]["email"] = json!(42);
        assert!(validator().check_field_types(&event(unknown)).is_empty());
    }

    #[test]
    fn foreign_keys_must_look_like_identifiers() {
        let mut raw = contact_update();
        raw["after"]["account_id"] = json!("not-an-id");

        let mut validator = validator();
        let report = validator.validate(&event(raw));
        assert_eq!(
            report.messages(),
            vec!["Foreign key 'account_id' has invalid format: 'not-an-id'".to_owned()]
        );

        let mut raw = contact_update();
        raw["after"]["account_id"] = Value::Null;
        assert!(validator.validate(&event(raw)).is_valid());
    }

    #[test]
    fn alert_threshold_is_exceeded_not_reached() {
        let mut validator = validator();
        for _ in 0..19 {
            assert!(validator.validate(&event(account_insert())).is_valid());
        }
        let mut invalid = account_insert();
        invalid["record_id"] = json!("short");

        assert!(!validator.validate(&event(invalid.clone())).is_valid());
        assert_eq!(validator.error_rate(), 0.05);
        assert!(!validator.should_alert());

        validator.validate(&event(invalid));
        assert!(validator.should_alert());

        let stats = validator.statistics();
        assert_eq!(stats.total_events, 21);
        assert_eq!(stats.invalid_events, 2);
        assert!(stats.exceeds_threshold);
        assert_eq!(stats.error_types.get(&Check::RecordId), Some(&2));

        validator.reset_statistics();
        assert_eq!(validator.statistics().total_events, 0);
        assert_eq!(validator.error_rate(), 0.0);
        assert!(!validator.should_alert());
    }
}
