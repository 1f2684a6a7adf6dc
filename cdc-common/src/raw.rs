//! The append-only raw feed: one flat record per valid event.
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::event::{CdcEvent, EventType};
use crate::schema::{normalize_field_name, ObjectType};
use crate::store::{StoreError, StoreResult};
use crate::time::format_timestamp;

pub const RAW_SOURCE: &str = "cdc";

/// A snapshot as written to the raw feed, with the event's metadata stamped on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawRecord {
    pub object_type: ObjectType,
    pub record_id: String,
    pub event_id: Option<String>,
    pub event_type: EventType,
    pub event_timestamp: DateTime<Utc>,
    pub ingestion_timestamp: DateTime<Utc>,
    /// Scalar columns only: nested objects and arrays are stored as JSON text.
    pub data: Map<String, Value>,
}

impl RawRecord {
    /// INSERT and UPDATE events record their `after` snapshot, DELETE events their `before`.
    /// Column names are snake_case.
    pub fn from_event(event: &CdcEvent, ingestion_timestamp: DateTime<Utc>) -> Self {
        let mut data: Map<String, Value> = event
            .snapshot()
            .map(|snapshot| {
                snapshot
                    .as_map()
                    .iter()
                    .map(|(field, value)| (normalize_field_name(field), flatten_value(value)))
                    .collect()
            })
            .unwrap_or_default();

        data.insert(
            "ingestion_timestamp".to_owned(),
            format_timestamp(&ingestion_timestamp).into(),
        );
        data.insert("source".to_owned(), RAW_SOURCE.into());
        data.insert(
            "_cdc_event_id".to_owned(),
            event.event_id.clone().map_or(Value::Null, Value::String),
        );
        data.insert("_cdc_event_type".to_owned(), event.event_type.as_str().into());
        data.insert(
            "_cdc_event_timestamp".to_owned(),
            format_timestamp(&event.event_timestamp).into(),
        );
        if let Some(message_id) = event.message_id() {
            data.insert("_message_id".to_owned(), message_id.into());
        }

        Self {
            object_type: event.object_type,
            record_id: event.record_id.clone(),
            event_id: event.event_id.clone(),
            event_type: event.event_type,
            event_timestamp: event.event_timestamp,
            ingestion_timestamp,
            data,
        }
    }
}

/// Nested values become their JSON text, scalars are kept as they are.
pub fn flatten_value(value: &Value) -> Value {
    match value {
        Value::Object(_) | Value::Array(_) => Value::String(value.to_string()),
        scalar => scalar.clone(),
    }
}

#[async_trait]
pub trait RawSink: Send + Sync {
    async fn write(&self, record: RawRecord) -> StoreResult<()>;
    async fn write_batch(&self, records: Vec<RawRecord>) -> StoreResult<()>;
}

pub struct PrintSink {}

#[async_trait]
impl RawSink for PrintSink {
    async fn write(&self, record: RawRecord) -> StoreResult<()> {
        tracing::info!("raw record: {:?}", record);
        counter!("cdc_raw_records_written_total", "object_type" => record.object_type.as_str())
            .increment(1);

        Ok(())
    }

    async fn write_batch(&self, records: Vec<RawRecord>) -> StoreResult<()> {
        let span = tracing::span!(tracing::Level::INFO, "batch of raw records");
        let _enter = span.enter();

        histogram!("cdc_raw_batch_size").record(records.len() as f64);
        for record in records {
            counter!("cdc_raw_records_written_total", "object_type" => record.object_type.as_str())
                .increment(1);
            tracing::info!("raw record: {:?}", record);
        }

        Ok(())
    }
}

/// Collects raw records in memory.
#[derive(Default)]
pub struct MemoryRawSink {
    records: Mutex<Vec<RawRecord>>,
}

impl MemoryRawSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RawRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RawSink for MemoryRawSink {
    async fn write(&self, record: RawRecord) -> StoreResult<()> {
        self.write_batch(vec![record]).await
    }

    async fn write_batch(&self, records: Vec<RawRecord>) -> StoreResult<()> {
        self.records
            .lock()
            .map_err(|_| StoreError::Unavailable("raw record buffer lock poisoned".to_owned()))?
            .extend(records);
        Ok(())
    }
}
