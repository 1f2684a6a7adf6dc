use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::event::RawEvent;
use crate::time::format_timestamp;
use crate::validator::ValidationReport;

pub const ALERT_TYPE: &str = "data_quality_violation";
pub const ALERT_SEVERITY: &str = "ERROR";

/// Raised for every invalid event and produced to the alerts topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataQualityAlert {
    pub alert_type: &'static str,
    pub severity: &'static str,
    pub timestamp: String,
    pub event_id: Option<String>,
    pub object_type: Option<String>,
    pub record_id: Option<String>,
    pub validation_errors: Vec<String>,
    pub event_data: RawEvent,
}

impl DataQualityAlert {
    pub fn new(event: &RawEvent, report: &ValidationReport, now: DateTime<Utc>) -> Self {
        let text = |key: &str| event.get(key).map(crate::event::display_value);
        Self {
            alert_type: ALERT_TYPE,
            severity: ALERT_SEVERITY,
            timestamp: format_timestamp(&now),
            event_id: text("event_id"),
            object_type: text("object_type"),
            record_id: text("record_id"),
            validation_errors: report.messages(),
            event_data: event.clone(),
        }
    }

    /// Key alerts by record so alerts for the same record stay ordered.
    pub fn key(&self) -> Option<&str> {
        self.record_id.as_deref()
    }
}

/// Attach the validation outcome to an invalid event.
pub fn mark_invalid(event: &mut RawEvent, report: &ValidationReport, now: DateTime<Utc>) {
    event.insert(
        "_validation_errors",
        Value::Array(report.messages().into_iter().map(Value::String).collect()),
    );
    event.insert("_validation_timestamp", format_timestamp(&now).into());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::ValidationError;
    use assert_json_diff::assert_json_eq;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn alert_carries_errors_and_event() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let mut event = RawEvent::try_from(json!({
            "event_id": "CDC-0123456789AB",
            "event_type": "INSERT",
            "object_type": "Account",
            "record_id": "bad",
        }))
        .unwrap();
        let report = ValidationReport {
            errors: vec![ValidationError::InvalidRecordId("bad".to_owned())],
        };

        mark_invalid(&mut event, &report, now);
        let alert = DataQualityAlert::new(&event, &report, now);

        assert_eq!(alert.key(), Some("bad"));
        assert_json_eq!(
            serde_json::to_value(&alert).unwrap(),
            json!({
                "alert_type": "data_quality_violation",
                "severity": "ERROR",
                "timestamp": "2024-06-01T12:00:00Z",
                "event_id": "CDC-0123456789AB",
                "object_type": "Account",
                "record_id": "bad",
                "validation_errors": [
                    "Invalid record_id format: 'bad'. Must be 15-18 alphanumeric characters"
                ],
                "event_data": {
                    "event_id": "CDC-0123456789AB",
                    "event_type": "INSERT",
                    "object_type": "Account",
                    "record_id": "bad",
                    "_validation_errors": [
                        "Invalid record_id format: 'bad'. Must be 15-18 alphanumeric characters"
                    ],
                    "_validation_timestamp": "2024-06-01T12:00:00Z",
                },
            })
        );
    }
}
