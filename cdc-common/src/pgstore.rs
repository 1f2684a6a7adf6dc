//! Postgres implementations of the history store and the raw feed sink.
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};

use crate::event::EventType;
use crate::history::HistoryRecord;
use crate::raw::{RawRecord, RawSink};
use crate::schema::{ObjectType, TableNames};
use crate::store::{HistoryStore, StoreError, StoreResult};

/// Postgres limits a statement to 65535 bind parameters; 8 per history row.
const INSERT_CHUNK_SIZE: usize = 1000;

async fn connect(url: &str, max_connections: u32) -> StoreResult<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .map_err(|error| StoreError::ConnectionError { error })
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: String,
    valid_from: DateTime<Utc>,
    valid_to: Option<DateTime<Utc>>,
    is_current: bool,
    change_type: String,
    changed_fields: String,
    record_data: String,
    ingestion_timestamp: DateTime<Utc>,
}

impl HistoryRow {
    fn into_record(self, table: &str) -> StoreResult<HistoryRecord> {
        let change_type =
            EventType::from_str(&self.change_type).map_err(|e| StoreError::DecodeError {
                table: table.to_owned(),
                reason: e.to_string(),
            })?;

        Ok(HistoryRecord {
            id: self.id,
            valid_from: self.valid_from,
            valid_to: self.valid_to,
            is_current: self.is_current,
            change_type,
            changed_fields: self.changed_fields,
            record_data: self.record_data,
            ingestion_timestamp: self.ingestion_timestamp,
        })
    }
}

/// SCD2 history tables in PostgreSQL, one per object type.
#[derive(Clone)]
pub struct PgHistoryStore {
    pool: PgPool,
    tables: TableNames,
}

impl PgHistoryStore {
    pub async fn new(url: &str, max_connections: u32, tables: TableNames) -> StoreResult<Self> {
        let pool = connect(url, max_connections).await?;
        Ok(Self { pool, tables })
    }

    pub fn new_from_pool(pool: PgPool, tables: TableNames) -> Self {
        Self { pool, tables }
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn latest_record(
        &self,
        object_type: ObjectType,
        record_id: &str,
    ) -> StoreResult<Option<HistoryRecord>> {
        let table = self.tables.history_table(object_type);
        let base_query = format!(
            r#"
SELECT
    id, valid_from, valid_to, is_current, change_type, changed_fields, record_data, ingestion_timestamp
FROM
    "{0}"
WHERE
    id = $1
ORDER BY
    valid_from DESC
LIMIT 1
            "#,
            table
        );

        let row: Option<HistoryRow> = sqlx::query_as(&base_query)
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                table: table.clone(),
                error,
            })?;

        row.map(|row| row.into_record(&table)).transpose()
    }

    async fn close_current(
        &self,
        object_type: ObjectType,
        record_id: &str,
        valid_to: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let table = self.tables.history_table(object_type);
        let base_query = format!(
            r#"
UPDATE
    "{0}"
SET
    valid_to = $2,
    is_current = FALSE
WHERE
    id = $1
    AND is_current = TRUE
            "#,
            table
        );

        let result = sqlx::query(&base_query)
            .bind(record_id)
            .bind(valid_to)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "UPDATE".to_owned(),
                table,
                error,
            })?;

        Ok(result.rows_affected())
    }

    /// All rows land in one transaction: either the whole batch is appended or none of it.
    async fn insert_records(
        &self,
        object_type: ObjectType,
        records: &[HistoryRecord],
    ) -> StoreResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let table = self.tables.history_table(object_type);
        let query_error = |command: &str, error: sqlx::Error| StoreError::QueryError {
            command: command.to_owned(),
            table: table.clone(),
            error,
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| query_error("BEGIN", error))?;

        for chunk in records.chunks(INSERT_CHUNK_SIZE) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                r#"INSERT INTO "{}" (id, valid_from, valid_to, is_current, change_type, changed_fields, record_data, ingestion_timestamp) "#,
                table
            ));
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(&record.id)
                    .push_bind(record.valid_from)
                    .push_bind(record.valid_to)
                    .push_bind(record.is_current)
                    .push_bind(record.change_type.as_str())
                    .push_bind(&record.changed_fields)
                    .push_bind(&record.record_data)
                    .push_bind(record.ingestion_timestamp);
            });

            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|error| query_error("INSERT", error))?;
        }

        tx.commit()
            .await
            .map_err(|error| query_error("COMMIT", error))?;

        Ok(())
    }
}

/// Raw feed tables in PostgreSQL. The flattened record is kept as JSONB next to its keys.
#[derive(Clone)]
pub struct PgRawSink {
    pool: PgPool,
    tables: TableNames,
}

impl PgRawSink {
    pub async fn new(url: &str, max_connections: u32, tables: TableNames) -> StoreResult<Self> {
        let pool = connect(url, max_connections).await?;
        Ok(Self { pool, tables })
    }

    pub fn new_from_pool(pool: PgPool, tables: TableNames) -> Self {
        Self { pool, tables }
    }
}

#[async_trait]
impl RawSink for PgRawSink {
    async fn write(&self, record: RawRecord) -> StoreResult<()> {
        self.write_batch(vec![record]).await
    }

    async fn write_batch(&self, records: Vec<RawRecord>) -> StoreResult<()> {
        for object_type in ObjectType::ALL {
            let rows: Vec<&RawRecord> = records
                .iter()
                .filter(|record| record.object_type == object_type)
                .collect();
            if rows.is_empty() {
                continue;
            }

            let table = self.tables.raw_table(object_type);
            for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
                let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                    r#"INSERT INTO "{}" (event_id, record_id, event_type, event_timestamp, ingestion_timestamp, source, record) "#,
                    table
                ));
                builder.push_values(chunk.iter().copied(), |mut row, record| {
                    row.push_bind(record.event_id.as_deref())
                        .push_bind(&record.record_id)
                        .push_bind(record.event_type.as_str())
                        .push_bind(record.event_timestamp)
                        .push_bind(record.ingestion_timestamp)
                        .push_bind(crate::raw::RAW_SOURCE)
                        .push_bind(sqlx::types::Json(&record.data));
                });

                builder
                    .build()
                    .execute(&self.pool)
                    .await
                    .map_err(|error| StoreError::QueryError {
                        command: "INSERT".to_owned(),
                        table: table.clone(),
                        error,
                    })?;
            }

            metrics::counter!("cdc_raw_records_written_total", "object_type" => object_type.as_str())
                .increment(rows.len() as u64);
        }

        Ok(())
    }
}
