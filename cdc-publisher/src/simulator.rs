//! Turns generated entities into a plausible stream of INSERT, UPDATE and DELETE events.
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use cdc_common::changes::detect_changes;
use cdc_common::event::{CdcEvent, EventType, Snapshot};
use cdc_common::schema::ObjectType;
use cdc_common::time::{format_timestamp, SystemTime, TimeSource};
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::generator::{
    EntityGenerator, Related, ACCOUNT_TYPES, CASE_PRIORITIES, CASE_STATUSES, CONTACT_TITLES,
    OPPORTUNITY_STAGES,
};

pub const SIMULATOR_SOURCE: &str = "salesforce_cdc";

const EVENT_ID_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Error, Debug, PartialEq)]
pub enum SimulatorError {
    #[error("event distribution must sum to 1.0, got {0}")]
    InvalidDistribution(f64),
}

/// Share of each event type in a generated batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventDistribution {
    pub insert: f64,
    pub update: f64,
    pub delete: f64,
}

impl Default for EventDistribution {
    fn default() -> Self {
        Self {
            insert: 0.5,
            update: 0.4,
            delete: 0.1,
        }
    }
}

impl EventDistribution {
    pub fn validate(&self) -> Result<(), SimulatorError> {
        let total = self.insert + self.update + self.delete;
        if (total - 1.0).abs() > 0.01 {
            return Err(SimulatorError::InvalidDistribution(total));
        }
        Ok(())
    }

    /// Event counts for a batch of `count`. The rounding remainder goes to INSERT.
    pub fn counts(&self, count: usize) -> (usize, usize, usize) {
        let share = |ratio: f64| (count as f64 * ratio).floor().max(0.0) as usize;
        let update = share(self.update);
        let delete = share(self.delete);
        let insert = count.saturating_sub(update + delete);
        (insert, update, delete)
    }
}

/// An UPDATE request is served as an INSERT when no record of the type exists yet.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Updated(CdcEvent),
    FellBackToInsert(CdcEvent),
}

/// A DELETE request is served as an INSERT when no record of the type exists yet.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    Deleted(CdcEvent),
    FellBackToInsert(CdcEvent),
}

impl UpdateOutcome {
    pub fn into_event(self) -> CdcEvent {
        match self {
            UpdateOutcome::Updated(event) | UpdateOutcome::FellBackToInsert(event) => event,
        }
    }
}

impl DeleteOutcome {
    pub fn into_event(self) -> CdcEvent {
        match self {
            DeleteOutcome::Deleted(event) | DeleteOutcome::FellBackToInsert(event) => event,
        }
    }
}

/// Keeps the latest snapshot of every live record it has created, per object type.
pub struct CdcSimulator {
    generator: EntityGenerator,
    existing: HashMap<ObjectType, BTreeMap<String, Snapshot>>,
    time: Arc<dyn TimeSource + Send + Sync>,
}

impl Default for CdcSimulator {
    fn default() -> Self {
        Self::new(EntityGenerator::new(), Arc::new(SystemTime {}))
    }
}

impl CdcSimulator {
    pub fn new(generator: EntityGenerator, time: Arc<dyn TimeSource + Send + Sync>) -> Self {
        Self {
            generator,
            existing: HashMap::new(),
            time,
        }
    }

    fn event_id(&mut self) -> String {
        let rng = self.generator.rng();
        let suffix: String = (0..12)
            .map(|_| char::from(EVENT_ID_CHARS[rng.gen_range(0..EVENT_ID_CHARS.len())]))
            .collect();
        format!("CDC-{suffix}")
    }

    fn ids(&self, object_type: ObjectType) -> Vec<String> {
        self.existing
            .get(&object_type)
            .map(|records| records.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Pick `record_id` if it exists, otherwise a random existing record.
    fn pick(&mut self, object_type: ObjectType, record_id: Option<&str>) -> Option<String> {
        let records = self.existing.get(&object_type)?;
        if let Some(id) = record_id.filter(|id| records.contains_key(*id)) {
            return Some(id.to_owned());
        }
        if records.is_empty() {
            return None;
        }
        let index = self.generator.rng().gen_range(0..records.len());
        records.keys().nth(index).cloned()
    }

    fn event(
        &mut self,
        event_type: EventType,
        object_type: ObjectType,
        record_id: String,
        changed_fields: Vec<String>,
        before: Option<Snapshot>,
        after: Option<Snapshot>,
    ) -> CdcEvent {
        CdcEvent {
            event_id: Some(self.event_id()),
            event_type,
            object_type,
            record_id,
            event_timestamp: self.time.current_time(),
            changed_fields,
            before,
            after,
            source: Some(SIMULATOR_SOURCE.to_owned()),
            metadata: Map::new(),
        }
    }

    /// A new record, referencing existing accounts and contacts where it has foreign keys.
    pub fn generate_insert(&mut self, object_type: ObjectType) -> CdcEvent {
        let account_ids = self.ids(ObjectType::Account);
        let contact_ids = self.ids(ObjectType::Contact);
        let related = Related {
            account_ids: &account_ids,
            contact_ids: &contact_ids,
        };
        let now = self.time.current_time();
        let after = self.generator.generate(object_type, now, &related);
        let record_id = after
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| self.generator.generate_id(object_type));

        self.existing
            .entry(object_type)
            .or_default()
            .insert(record_id.clone(), after.clone());

        self.event(
            EventType::Insert,
            object_type,
            record_id,
            vec![],
            None,
            Some(after),
        )
    }

    pub fn generate_update(
        &mut self,
        object_type: ObjectType,
        record_id: Option<&str>,
    ) -> UpdateOutcome {
        let Some(record_id) = self.pick(object_type, record_id) else {
            return UpdateOutcome::FellBackToInsert(self.generate_insert(object_type));
        };
        let Some(before) = self
            .existing
            .get(&object_type)
            .and_then(|records| records.get(&record_id))
            .cloned()
        else {
            return UpdateOutcome::FellBackToInsert(self.generate_insert(object_type));
        };

        let after = self.modify(object_type, &before);
        let changed_fields = detect_changes(&before, &after, None).changed_fields;
        self.existing
            .entry(object_type)
            .or_default()
            .insert(record_id.clone(), after.clone());

        UpdateOutcome::Updated(self.event(
            EventType::Update,
            object_type,
            record_id,
            changed_fields,
            Some(before),
            Some(after),
        ))
    }

    pub fn generate_delete(
        &mut self,
        object_type: ObjectType,
        record_id: Option<&str>,
    ) -> DeleteOutcome {
        let removed = self.pick(object_type, record_id).and_then(|record_id| {
            self.existing
                .get_mut(&object_type)
                .and_then(|records| records.remove(&record_id))
                .map(|before| (record_id, before))
        });

        match removed {
            Some((record_id, before)) => DeleteOutcome::Deleted(self.event(
                EventType::Delete,
                object_type,
                record_id,
                vec![],
                Some(before),
                None,
            )),
            None => DeleteOutcome::FellBackToInsert(self.generate_insert(object_type)),
        }
    }

    /// A batch of `count` events in random order, split by `distribution`.
    pub fn generate_events(
        &mut self,
        object_type: ObjectType,
        count: usize,
        distribution: &EventDistribution,
    ) -> Result<Vec<CdcEvent>, SimulatorError> {
        distribution.validate()?;
        let (inserts, updates, deletes) = distribution.counts(count);

        let mut event_types = Vec::with_capacity(count);
        event_types.extend(std::iter::repeat(EventType::Insert).take(inserts));
        event_types.extend(std::iter::repeat(EventType::Update).take(updates));
        event_types.extend(std::iter::repeat(EventType::Delete).take(deletes));
        event_types.shuffle(self.generator.rng());

        Ok(event_types
            .into_iter()
            .map(|event_type| match event_type {
                EventType::Insert => self.generate_insert(object_type),
                EventType::Update => self.generate_update(object_type, None).into_event(),
                EventType::Delete => self.generate_delete(object_type, None).into_event(),
            })
            .collect())
    }

    /// Register `count` records so later batches can update and delete them. No events are
    /// returned: the records are assumed to predate the stream.
    pub fn preload(&mut self, object_type: ObjectType, count: usize) {
        for _ in 0..count {
            self.generate_insert(object_type);
        }
    }

    pub fn existing_count(&self, object_type: ObjectType) -> usize {
        self.existing.get(&object_type).map_or(0, BTreeMap::len)
    }

    /// Forget the records of one object type, or of all types.
    pub fn clear(&mut self, object_type: Option<ObjectType>) {
        match object_type {
            Some(object_type) => {
                self.existing.remove(&object_type);
            }
            None => self.existing.clear(),
        }
    }

    /// Apply one to three field edits typical for the entity type.
    fn modify(&mut self, object_type: ObjectType, before: &Snapshot) -> Snapshot {
        let mut after = before.clone();
        let now = format_timestamp(&self.time.current_time());
        after.insert("last_modified_date", now.clone().into());
        after.insert("system_modstamp", now.into());

        let edits: &[&str] = match object_type {
            ObjectType::Account => &["name", "annual_revenue", "phone", "type"],
            ObjectType::Contact => &["email", "phone", "title"],
            ObjectType::Opportunity => &["amount", "stage_name", "probability", "is_won"],
            ObjectType::Case => &["status", "priority", "is_escalated"],
        };
        let count = self.generator.rng().gen_range(1..=edits.len().min(3));
        let chosen: Vec<&str> = edits
            .choose_multiple(self.generator.rng(), count)
            .copied()
            .collect();

        for field in chosen {
            let value = self.edit(field, before.get(field));
            after.insert(field, value);
        }
        after
    }

    fn edit(&mut self, field: &str, current: Option<&Value>) -> Value {
        let number = current.and_then(Value::as_f64).unwrap_or(0.0);
        match field {
            "name" => {
                let name = current.and_then(Value::as_str).unwrap_or_default();
                format!("{name} (Updated)").into()
            }
            "annual_revenue" => {
                let factor = self.generator.rng().gen_range(0.9..1.2);
                ((number * factor) as i64).into()
            }
            "amount" => {
                let factor = self.generator.rng().gen_range(0.8..1.3);
                ((number * factor) as i64).into()
            }
            "phone" => self.generator.phone_number().into(),
            "email" => self.generator.email().into(),
            "type" => self.generator.choose(ACCOUNT_TYPES).into(),
            "title" => self.generator.choose(CONTACT_TITLES).into(),
            "stage_name" => self.generator.choose(OPPORTUNITY_STAGES).into(),
            "probability" => self.generator.rng().gen_range(1..=100_i64).into(),
            "status" => self.generator.choose(CASE_STATUSES).into(),
            "priority" => self.generator.choose(CASE_PRIORITIES).into(),
            _ => self.generator.rng().gen::<bool>().into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdc_common::time::FixedTime;
    use chrono::{DateTime, Utc};

    fn simulator() -> CdcSimulator {
        let now: DateTime<Utc> = "2024-06-01T12:00:00Z".parse().unwrap();
        CdcSimulator::new(EntityGenerator::with_seed(11), Arc::new(FixedTime { time: now }))
    }

    #[test]
    fn distribution_must_sum_to_one() {
        assert!(EventDistribution::default().validate().is_ok());
        let skewed = EventDistribution {
            insert: 0.5,
            update: 0.5,
            delete: 0.5,
        };
        assert_eq!(
            skewed.validate(),
            Err(SimulatorError::InvalidDistribution(1.5))
        );
    }

    #[test]
    fn rounding_remainder_goes_to_inserts() {
        let distribution = EventDistribution::default();
        assert_eq!(distribution.counts(100), (50, 40, 10));
        assert_eq!(distribution.counts(7), (5, 2, 0));
        assert_eq!(distribution.counts(0), (0, 0, 0));
    }

    #[test]
    fn updates_and_deletes_fall_back_to_inserts() {
        let mut simulator = simulator();

        let outcome = simulator.generate_update(ObjectType::Account, None);
        assert!(matches!(outcome, UpdateOutcome::FellBackToInsert(_)));
        assert_eq!(outcome.into_event().event_type, EventType::Insert);
        assert_eq!(simulator.existing_count(ObjectType::Account), 1);

        let outcome = simulator.generate_delete(ObjectType::Contact, None);
        assert!(matches!(outcome, DeleteOutcome::FellBackToInsert(_)));
        assert_eq!(simulator.existing_count(ObjectType::Contact), 1);
    }

    #[test]
    fn updates_track_the_latest_snapshot() {
        let mut simulator = simulator();
        let insert = simulator.generate_insert(ObjectType::Opportunity);

        let UpdateOutcome::Updated(update) =
            simulator.generate_update(ObjectType::Opportunity, Some(&insert.record_id))
        else {
            panic!("expected an update");
        };
        assert_eq!(update.record_id, insert.record_id);
        assert_eq!(update.before, insert.after);
        assert!(update
            .changed_fields
            .contains(&"last_modified_date".to_owned()));
        assert!(!update.changed_fields.contains(&"system_modstamp".to_owned()));

        let UpdateOutcome::Updated(second) =
            simulator.generate_update(ObjectType::Opportunity, Some(&insert.record_id))
        else {
            panic!("expected an update");
        };
        assert_eq!(second.before, update.after);
    }

    #[test]
    fn deletes_forget_the_record() {
        let mut simulator = simulator();
        simulator.preload(ObjectType::Case, 3);
        assert_eq!(simulator.existing_count(ObjectType::Case), 3);

        let DeleteOutcome::Deleted(delete) = simulator.generate_delete(ObjectType::Case, None)
        else {
            panic!("expected a delete");
        };
        assert!(delete.after.is_none());
        assert!(delete.before.is_some());
        assert_eq!(simulator.existing_count(ObjectType::Case), 2);

        simulator.clear(Some(ObjectType::Case));
        assert_eq!(simulator.existing_count(ObjectType::Case), 0);
    }

    #[test]
    fn batches_follow_the_distribution() {
        let mut simulator = simulator();
        simulator.preload(ObjectType::Account, 50);

        let events = simulator
            .generate_events(ObjectType::Account, 100, &EventDistribution::default())
            .unwrap();
        assert_eq!(events.len(), 100);
        let count = |event_type| events.iter().filter(|e| e.event_type == event_type).count();
        assert_eq!(count(EventType::Insert), 50);
        assert_eq!(count(EventType::Update), 40);
        assert_eq!(count(EventType::Delete), 10);
        assert_eq!(simulator.existing_count(ObjectType::Account), 90);

        simulator.clear(None);
        assert_eq!(simulator.existing_count(ObjectType::Account), 0);
    }
}
