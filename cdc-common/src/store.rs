//! The durable history store seam used by the SCD2 processor.
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::history::HistoryRecord;
use crate::schema::ObjectType;

/// Enumeration of errors for operations against a history store.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query on {table} failed with: {error}")]
    QueryError {
        command: String,
        table: String,
        error: sqlx::Error,
    },
    #[error("failed to decode {table} row: {reason}")]
    DecodeError { table: String, reason: String },
    #[error("{command} on {table} timed out")]
    Timeout { command: String, table: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Point reads of a key's latest record, a conditional close, and a bulk append.
///
/// Each operation is atomic on its own. Nothing is transactional across operations.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// The record with the latest `valid_from` for a key, open or closed.
    async fn latest_record(
        &self,
        object_type: ObjectType,
        record_id: &str,
    ) -> StoreResult<Option<HistoryRecord>>;

    /// Close every open record for a key at `valid_to`, returning how many were closed.
    async fn close_current(
        &self,
        object_type: ObjectType,
        record_id: &str,
        valid_to: DateTime<Utc>,
    ) -> StoreResult<u64>;

    async fn insert_records(
        &self,
        object_type: ObjectType,
        records: &[HistoryRecord],
    ) -> StoreResult<()>;
}

/// A history store held in process memory. Used by tests and by the worker's print mode.
#[derive(Default)]
pub struct MemoryHistoryStore {
    tables: Mutex<HashMap<ObjectType, Vec<HistoryRecord>>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record stored for an object type, in insertion order.
    pub fn records(&self, object_type: ObjectType) -> Vec<HistoryRecord> {
        self.tables
            .lock()
            .map(|tables| tables.get(&object_type).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// All records for one key, ordered by `valid_from`.
    pub fn history(&self, object_type: ObjectType, record_id: &str) -> Vec<HistoryRecord> {
        let mut records: Vec<HistoryRecord> = self
            .records(object_type)
            .into_iter()
            .filter(|record| record.id == record_id)
            .collect();
        records.sort_by_key(|record| record.valid_from);
        records
    }

    /// Seed a record directly, bypassing the processor.
    pub fn seed(&self, object_type: ObjectType, record: HistoryRecord) {
        if let Ok(mut tables) = self.tables.lock() {
            tables.entry(object_type).or_default().push(record);
        }
    }

    fn poisoned(object_type: ObjectType) -> StoreError {
        StoreError::Unavailable(format!("{object_type} history lock poisoned"))
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn latest_record(
        &self,
        object_type: ObjectType,
        record_id: &str,
    ) -> StoreResult<Option<HistoryRecord>> {
        let tables = self
            .tables
            .lock()
            .map_err(|_| Self::poisoned(object_type))?;

        Ok(tables.get(&object_type).and_then(|records| {
            records
                .iter()
                .filter(|record| record.id == record_id)
                .max_by_key(|record| record.valid_from)
                .cloned()
        }))
    }

    async fn close_current(
        &self,
        object_type: ObjectType,
        record_id: &str,
        valid_to: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| Self::poisoned(object_type))?;

        let mut closed = 0;
        for record in tables.entry(object_type).or_default().iter_mut() {
            if record.id == record_id && record.is_current {
                record.close(valid_to);
                closed += 1;
            }
        }
        Ok(closed)
    }

    async fn insert_records(
        &self,
        object_type: ObjectType,
        records: &[HistoryRecord],
    ) -> StoreResult<()> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| Self::poisoned(object_type))?;

        tables
            .entry(object_type)
            .or_default()
            .extend_from_slice(records);
        Ok(())
    }
}
