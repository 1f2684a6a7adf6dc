//! SCD2 history maintenance: turns a batch of valid CDC events for one object type into
//! record closes and appends against a `HistoryStore`.
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use metrics::{counter, histogram};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::changes::detect_changes;
use crate::event::{CdcEvent, EventType, Snapshot};
use crate::history::{HistoryRecord, HistoryRecordBuilder};
use crate::schema::ObjectType;
use crate::store::{HistoryStore, StoreError, StoreResult};
use crate::time::TimeSource;

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CONCURRENT_GROUPS: usize = 8;

/// Failure while planning the history changes of one record.
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error(transparent)]
    StoreError(#[from] StoreError),
    #[error("failed to serialize history record: {0}")]
    SerializeError(#[from] serde_json::Error),
    #[error("{event_type} event for {record_id} carries no snapshot")]
    MissingSnapshot {
        event_type: EventType,
        record_id: String,
    },
}

/// Outcome of one `process_batch` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub total_events: usize,
    /// Record groups planned without error.
    pub records_processed: usize,
    /// INSERT events that produced a history record.
    pub records_inserted: usize,
    /// UPDATE events with at least one changed business field.
    pub records_updated: usize,
    pub errors: usize,
}

/// A queued request to end the open interval of a stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseOp {
    pub record_id: String,
    pub valid_to: DateTime<Utc>,
}

/// What replaying one record's events decided, before anything is written.
#[derive(Debug, Default)]
struct GroupPlan {
    closes: Vec<CloseOp>,
    inserts: Vec<HistoryRecord>,
    inserted: usize,
    updated: usize,
}

/// The interval that is open for a record while its events are replayed.
#[derive(Clone, Copy)]
enum Open {
    None,
    Stored,
    /// The last record queued in the plan.
    Pending,
}

pub struct Scd2Processor {
    store: Arc<dyn HistoryStore>,
    builder: HistoryRecordBuilder,
    store_timeout: Duration,
    max_concurrent_groups: usize,
    tracked_fields: Option<Vec<String>>,
}

impl Scd2Processor {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self {
            store,
            builder: HistoryRecordBuilder::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            max_concurrent_groups: DEFAULT_MAX_CONCURRENT_GROUPS,
            tracked_fields: None,
        }
    }

    pub fn with_time_source(mut self, time: Arc<dyn TimeSource + Send + Sync>) -> Self {
        self.builder = HistoryRecordBuilder::new(time);
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_groups(mut self, max: usize) -> Self {
        self.max_concurrent_groups = max.max(1);
        self
    }

    /// Restrict change detection to these fields.
    pub fn with_tracked_fields(mut self, fields: Vec<String>) -> Self {
        self.tracked_fields = Some(fields);
        self
    }

    /// Apply one batch of events for a single object type.
    ///
    /// Events are grouped by record and replayed in event-time order. Events at or before the
    /// end of the key's stored history are treated as redeliveries and skipped. Groups are planned
    /// independently: a store failure while planning one record counts one error and does
    /// not affect the others. Closes are applied before the bulk append; the two steps are
    /// not atomic with each other.
    #[instrument(skip_all, fields(object_type = %object_type, events = events.len()))]
    pub async fn process_batch(&self, events: Vec<CdcEvent>, object_type: ObjectType) -> BatchStats {
        let mut stats = BatchStats {
            total_events: events.len(),
            ..Default::default()
        };
        histogram!("cdc_history_batch_size").record(events.len() as f64);
        counter!("cdc_history_batches_total", "object_type" => object_type.as_str()).increment(1);

        let mut groups: BTreeMap<String, Vec<CdcEvent>> = BTreeMap::new();
        for event in events {
            if event.object_type != object_type {
                warn!(
                    record_id = %event.record_id,
                    "skipping {} event in a {} batch", event.object_type, object_type
                );
                stats.errors += 1;
                continue;
            }
            groups.entry(event.record_id.clone()).or_default().push(event);
        }
        for group in groups.values_mut() {
            group.sort_by_key(|event| event.event_timestamp);
        }

        let plans: Vec<(String, Result<GroupPlan, HistoryError>)> = stream::iter(groups)
            .map(|(record_id, events)| async move {
                let plan = self.plan_group(object_type, &record_id, events).await;
                (record_id, plan)
            })
            .buffered(self.max_concurrent_groups)
            .collect()
            .await;

        let mut closes = Vec::new();
        let mut inserts = Vec::new();
        for (record_id, plan) in plans {
            match plan {
                Ok(plan) => {
                    stats.records_processed += 1;
                    stats.records_inserted += plan.inserted;
                    stats.records_updated += plan.updated;
                    closes.extend(plan.closes);
                    inserts.extend(plan.inserts);
                }
                Err(e) => {
                    error!(%record_id, "failed to process record: {}", e);
                    stats.errors += 1;
                }
            }
        }

        stats.errors += self.apply(object_type, closes, inserts).await;

        counter!("cdc_history_records_inserted_total").increment(stats.records_inserted as u64);
        counter!("cdc_history_records_updated_total").increment(stats.records_updated as u64);
        counter!("cdc_history_errors_total").increment(stats.errors as u64);
        info!(
            processed = stats.records_processed,
            inserted = stats.records_inserted,
            updated = stats.records_updated,
            errors = stats.errors,
            "history batch complete"
        );

        stats
    }

    /// Replay one record's events against its stored current record.
    async fn plan_group(
        &self,
        object_type: ObjectType,
        record_id: &str,
        events: Vec<CdcEvent>,
    ) -> Result<GroupPlan, HistoryError> {
        let latest = self
            .timed(
                "SELECT",
                object_type,
                self.store.latest_record(object_type, record_id),
            )
            .await?;

        let tracked: Option<Vec<&str>> = self
            .tracked_fields
            .as_ref()
            .map(|fields| fields.iter().map(String::as_str).collect());

        let mut plan = GroupPlan::default();
        let mut open = match &latest {
            Some(record) if record.is_current => Open::Stored,
            _ => Open::None,
        };
        // Stored history already covers everything up to here.
        let applied_through = latest
            .as_ref()
            .map(|record| record.valid_to.unwrap_or(record.valid_from));

        for event in &events {
            let timestamp = event.event_timestamp;
            if applied_through.is_some_and(|applied| timestamp <= applied) {
                debug!(
                    record_id,
                    event_type = %event.event_type,
                    %timestamp,
                    "event is not newer than the stored history, already applied"
                );
                continue;
            }
            match event.event_type {
                EventType::Insert => {
                    let after = snapshot(event, event.after.as_ref())?;
                    if matches!(open, Open::Stored) {
                        warn!(
                            record_id,
                            "INSERT for a record that already has a current version, closing it"
                        );
                    }
                    close_open(&mut plan, &open, record_id, timestamp);
                    plan.inserts.push(self.builder.build(
                        record_id,
                        after,
                        timestamp,
                        EventType::Insert,
                        &[],
                        None,
                    )?);
                    plan.inserted += 1;
                    open = Open::Pending;
                }
                EventType::Update => {
                    let before = snapshot(event, event.before.as_ref())?;
                    let after = snapshot(event, event.after.as_ref())?;
                    let changes = detect_changes(before, after, tracked.as_deref());
                    if !changes.has_changes() {
                        debug!(record_id, "UPDATE without business changes, skipping");
                        continue;
                    }

                    close_open(&mut plan, &open, record_id, timestamp);
                    plan.inserts.push(self.builder.build(
                        record_id,
                        after,
                        timestamp,
                        EventType::Update,
                        &changes.changed_fields,
                        None,
                    )?);
                    plan.updated += 1;
                    open = Open::Pending;
                }
                EventType::Delete => {
                    close_open(&mut plan, &open, record_id, timestamp);
                    open = Open::None;
                }
            }
        }

        Ok(plan)
    }

    /// Run queued closes one by one, then append every new record in one call.
    /// Returns the number of records affected by failures.
    async fn apply(
        &self,
        object_type: ObjectType,
        closes: Vec<CloseOp>,
        inserts: Vec<HistoryRecord>,
    ) -> usize {
        let mut errors = 0;

        for close in closes {
            let result = self
                .timed(
                    "UPDATE",
                    object_type,
                    self.store
                        .close_current(object_type, &close.record_id, close.valid_to),
                )
                .await;
            match result {
                Ok(0) => debug!(record_id = %close.record_id, "no current record to close"),
                Ok(_) => debug!(
                    record_id = %close.record_id,
                    valid_to = %close.valid_to,
                    "closed current record"
                ),
                Err(e) => {
                    error!(record_id = %close.record_id, "failed to close current record: {}", e);
                    errors += 1;
                }
            }
        }

        if !inserts.is_empty() {
            let result = self
                .timed(
                    "INSERT",
                    object_type,
                    self.store.insert_records(object_type, &inserts),
                )
                .await;
            match result {
                Ok(()) => info!("inserted {} {} history records", inserts.len(), object_type),
                Err(e) => {
                    error!("failed to insert history records: {}", e);
                    errors += inserts.len();
                }
            }
        }

        errors
    }

    async fn timed<T>(
        &self,
        command: &str,
        object_type: ObjectType,
        operation: impl Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        let start = Instant::now();
        let result = tokio::time::timeout(self.store_timeout, operation).await;
        histogram!("cdc_history_store_duration_seconds", "command" => command.to_owned())
            .record(start.elapsed().as_secs_f64());

        result.map_err(|_| StoreError::Timeout {
            command: command.to_owned(),
            table: object_type.to_string(),
        })?
    }
}

fn snapshot<'a>(
    event: &CdcEvent,
    snapshot: Option<&'a Snapshot>,
) -> Result<&'a Snapshot, HistoryError> {
    snapshot.ok_or_else(|| HistoryError::MissingSnapshot {
        event_type: event.event_type,
        record_id: event.record_id.clone(),
    })
}

/// End whatever interval is open at `valid_to`. A pending record starting at the same
/// instant is superseded entirely and removed from the plan.
fn close_open(plan: &mut GroupPlan, open: &Open, record_id: &str, valid_to: DateTime<Utc>) {
    match open {
        Open::None => {}
        Open::Stored => plan.closes.push(CloseOp {
            record_id: record_id.to_owned(),
            valid_to,
        }),
        Open::Pending => {
            if let Some(pending) = plan.inserts.last_mut() {
                if pending.valid_from >= valid_to {
                    plan.inserts.pop();
                } else {
                    pending.close(valid_to);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RawEvent;
    use crate::store::MemoryHistoryStore;
    use crate::time::FixedTime;
    use chrono::TimeZone;
    use serde_json::{json, Value};

    const ID: &str = "001ABCDEFGHIJKLMNO";

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, 0, 0).unwrap()
    }

    fn event(event_type: &str, at: DateTime<Utc>, before: Value, after: Value) -> CdcEvent {
        CdcEvent::try_from(
            RawEvent::try_from(json!({
                "event_type": event_type,
                "object_type": "Account",
                "record_id": ID,
                "event_timestamp": crate::time::format_timestamp(&at),
                "changed_fields": ["name"],
                "before": before,
                "after": after,
            }))
            .unwrap(),
        )
        .unwrap()
    }

    fn processor(store: Arc<MemoryHistoryStore>) -> Scd2Processor {
        Scd2Processor::new(store).with_time_source(Arc::new(FixedTime { time: ts(23) }))
    }

    #[tokio::test]
    async fn insert_then_updates_chain_within_one_batch() {
        let store = Arc::new(MemoryHistoryStore::new());
        let stats = processor(store.clone())
            .process_batch(
                vec![
                    event("UPDATE", ts(3), json!({"name": "B"}), json!({"name": "C"})),
                    event("INSERT", ts(1), Value::Null, json!({"name": "A"})),
                    event("UPDATE", ts(2), json!({"name": "A"}), json!({"name": "B"})),
                ],
                ObjectType::Account,
            )
            .await;

        assert_eq!(
            stats,
            BatchStats {
                total_events: 3,
                records_processed: 1,
                records_inserted: 1,
                records_updated: 2,
                errors: 0,
            }
        );

        let history = store.history(ObjectType::Account, ID);
        let intervals: Vec<_> = history
            .iter()
            .map(|r| (r.valid_from, r.valid_to, r.is_current, r.change_type))
            .collect();
        assert_eq!(
            intervals,
            vec![
                (ts(1), Some(ts(2)), false, EventType::Insert),
                (ts(2), Some(ts(3)), false, EventType::Update),
                (ts(3), None, true, EventType::Update),
            ]
        );
        assert!(history.iter().all(|r| r.ingestion_timestamp == ts(23)));
    }

    #[tokio::test]
    async fn events_at_the_same_instant_supersede_each_other() {
        let store = Arc::new(MemoryHistoryStore::new());
        let stats = processor(store.clone())
            .process_batch(
                vec![
                    event("INSERT", ts(1), Value::Null, json!({"name": "A"})),
                    event("UPDATE", ts(1), json!({"name": "A"}), json!({"name": "B"})),
                ],
                ObjectType::Account,
            )
            .await;

        assert_eq!(stats.errors, 0);
        let history = store.history(ObjectType::Account, ID);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].change_type, EventType::Update);
        assert!(history[0].is_current);
    }

    #[tokio::test]
    async fn insert_over_a_current_record_closes_it() {
        let store = Arc::new(MemoryHistoryStore::new());
        let processor = processor(store.clone());
        processor
            .process_batch(
                vec![event("INSERT", ts(1), Value::Null, json!({"name": "A"}))],
                ObjectType::Account,
            )
            .await;
        let stats = processor
            .process_batch(
                vec![event("INSERT", ts(2), Value::Null, json!({"name": "A2"}))],
                ObjectType::Account,
            )
            .await;

        assert_eq!(stats.records_inserted, 1);
        let history = store.history(ObjectType::Account, ID);
        assert_eq!(history.len(), 2);
        assert_eq!(history.iter().filter(|r| r.is_current).count(), 1);
        assert_eq!(history[0].valid_to, Some(ts(2)));
    }

    #[tokio::test]
    async fn delete_inside_a_batch_closes_the_pending_record() {
        let store = Arc::new(MemoryHistoryStore::new());
        let stats = processor(store.clone())
            .process_batch(
                vec![
                    event("INSERT", ts(1), Value::Null, json!({"name": "A"})),
                    event("DELETE", ts(2), json!({"name": "A"}), Value::Null),
                ],
                ObjectType::Account,
            )
            .await;

        assert_eq!(stats.records_inserted, 1);
        let history = store.history(ObjectType::Account, ID);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].valid_to, Some(ts(2)));
        assert!(!history[0].is_current);
    }

    #[tokio::test]
    async fn events_of_another_object_type_are_counted_as_errors() {
        let store = Arc::new(MemoryHistoryStore::new());
        let stats = processor(store.clone())
            .process_batch(
                vec![event("INSERT", ts(1), Value::Null, json!({"name": "A"}))],
                ObjectType::Contact,
            )
            .await;

        assert_eq!(stats.errors, 1);
        assert_eq!(stats.records_processed, 0);
        assert!(store.records(ObjectType::Contact).is_empty());
    }

    #[tokio::test]
    async fn tracked_fields_limit_change_detection() {
        let store = Arc::new(MemoryHistoryStore::new());
        let stats = processor(store.clone())
            .with_tracked_fields(vec!["name".to_owned()])
            .process_batch(
                vec![event(
                    "UPDATE",
                    ts(1),
                    json!({"name": "A", "phone": "1"}),
                    json!({"name": "A", "phone": "2"}),
                )],
                ObjectType::Account,
            )
            .await;

        assert_eq!(stats.records_processed, 1);
        assert_eq!(stats.records_updated, 0);
        assert!(store.records(ObjectType::Account).is_empty());
    }
}
