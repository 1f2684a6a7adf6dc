use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::event::{EventType, Snapshot};
use crate::time::{SystemTime, TimeSource};

/// One row of an SCD2 history table: the state of an entity over a validity interval.
///
/// `changed_fields` and `record_data` are stored as serialized JSON text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRecord {
    pub id: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub is_current: bool,
    pub change_type: EventType,
    pub changed_fields: String,
    pub record_data: String,
    pub ingestion_timestamp: DateTime<Utc>,
}

impl HistoryRecord {
    /// End the validity interval at `valid_to`.
    pub fn close(&mut self, valid_to: DateTime<Utc>) {
        self.valid_to = Some(valid_to);
        self.is_current = false;
    }

    pub fn snapshot(&self) -> Result<Snapshot, serde_json::Error> {
        serde_json::from_str(&self.record_data)
    }

    pub fn changed_fields(&self) -> Result<Vec<String>, serde_json::Error> {
        serde_json::from_str(&self.changed_fields)
    }
}

/// Builds history records, stamping them with the ingestion time of its clock.
#[derive(Clone)]
pub struct HistoryRecordBuilder {
    time: Arc<dyn TimeSource + Send + Sync>,
}

impl Default for HistoryRecordBuilder {
    fn default() -> Self {
        Self::new(Arc::new(SystemTime {}))
    }
}

impl HistoryRecordBuilder {
    pub fn new(time: Arc<dyn TimeSource + Send + Sync>) -> Self {
        Self { time }
    }

    /// Construct a record without validating its inputs. The record is current exactly when
    /// `valid_to` is unset.
    pub fn build(
        &self,
        record_id: &str,
        record_data: &Snapshot,
        valid_from: DateTime<Utc>,
        change_type: EventType,
        changed_fields: &[String],
        valid_to: Option<DateTime<Utc>>,
    ) -> Result<HistoryRecord, serde_json::Error> {
        Ok(HistoryRecord {
            id: record_id.to_owned(),
            valid_from,
            valid_to,
            is_current: valid_to.is_none(),
            change_type,
            changed_fields: serde_json::to_string(changed_fields)?,
            record_data: serde_json::to_string(record_data)?,
            ingestion_timestamp: self.time.current_time(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::FixedTime;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn builds_current_and_closed_records() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let builder = HistoryRecordBuilder::new(Arc::new(FixedTime { time: now }));
        let data = Snapshot::try_from(json!({"id": "001ABCDEFGHIJKLMNO", "name": "Acme"})).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();

        let mut record = builder
            .build(
                "001ABCDEFGHIJKLMNO",
                &data,
                t1,
                EventType::Update,
                &["name".to_owned()],
                None,
            )
            .unwrap();

        assert!(record.is_current);
        assert_eq!(record.valid_to, None);
        assert_eq!(record.ingestion_timestamp, now);
        assert_eq!(record.changed_fields, r#"["name"]"#);
        assert_eq!(record.snapshot().unwrap(), data);
        assert_eq!(record.changed_fields().unwrap(), vec!["name".to_owned()]);

        record.close(t2);
        assert!(!record.is_current);
        assert_eq!(record.valid_to, Some(t2));

        let closed = builder
            .build("001ABCDEFGHIJKLMNO", &data, t1, EventType::Insert, &[], Some(t2))
            .unwrap();
        assert!(!closed.is_current);
        assert_eq!(closed.changed_fields, "[]");
    }
}
