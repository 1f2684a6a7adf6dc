use std::collections::BTreeMap;

use cdc_common::event::CdcEvent;
use cdc_common::schema::ObjectType;
use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::offsets::MessagePosition;

/// Events of one object type whose timestamps fall in `[start, start + width)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub object_type: ObjectType,
    pub start: DateTime<Utc>,
    pub events: Vec<CdcEvent>,
    /// Bus positions of `events`, done with once the window is processed.
    pub positions: Vec<MessagePosition>,
}

impl Window {
    fn new(
        object_type: ObjectType,
        start: DateTime<Utc>,
        buffered: Vec<(CdcEvent, MessagePosition)>,
    ) -> Self {
        let (events, positions) = buffered.into_iter().unzip();
        Self {
            object_type,
            start,
            events,
            positions,
        }
    }
}

/// Buffers valid events into tumbling event-time windows per object type.
///
/// Windows are aligned to the epoch and handed out oldest first.
#[derive(Debug)]
pub struct WindowBuffer {
    width: Duration,
    windows: BTreeMap<(DateTime<Utc>, ObjectType), Vec<(CdcEvent, MessagePosition)>>,
}

impl WindowBuffer {
    pub fn new(width_secs: u64) -> Self {
        let width_secs = i64::try_from(width_secs.max(1)).unwrap_or(i64::MAX);
        Self {
            width: Duration::seconds(width_secs),
            windows: BTreeMap::new(),
        }
    }

    pub fn window_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let width = self.width.num_seconds();
        let secs = ts.timestamp();
        Utc.timestamp_opt(secs - secs.rem_euclid(width), 0)
            .single()
            .unwrap_or(ts)
    }

    pub fn push(&mut self, event: CdcEvent, position: MessagePosition) {
        let start = self.window_start(event.event_timestamp);
        self.windows
            .entry((start, event.object_type))
            .or_default()
            .push((event, position));
    }

    /// Remove every window that ended at or before `now`.
    pub fn take_closed(&mut self, now: DateTime<Utc>) -> Vec<Window> {
        let closed: Vec<_> = self
            .windows
            .keys()
            .filter(|(start, _)| *start + self.width <= now)
            .copied()
            .collect();

        closed
            .into_iter()
            .filter_map(|key| {
                self.windows
                    .remove(&key)
                    .map(|buffered| Window::new(key.1, key.0, buffered))
            })
            .collect()
    }

    /// Remove every window, open or not.
    pub fn drain(&mut self) -> Vec<Window> {
        std::mem::take(&mut self.windows)
            .into_iter()
            .map(|((start, object_type), buffered)| Window::new(object_type, start, buffered))
            .collect()
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.windows.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdc_common::event::{EventType, Snapshot};
    use serde_json::Map;

    fn event(object_type: ObjectType, record_id: &str, ts: &str) -> CdcEvent {
        CdcEvent {
            event_id: None,
            event_type: EventType::Insert,
            object_type,
            record_id: record_id.to_owned(),
            event_timestamp: ts.parse().unwrap(),
            changed_fields: vec![],
            before: None,
            after: Some(Snapshot::new()),
            source: None,
            metadata: Map::new(),
        }
    }

    fn at(offset: i64) -> MessagePosition {
        MessagePosition::new(0, offset)
    }

    #[test]
    fn aligns_windows_to_the_epoch() {
        let buffer = WindowBuffer::new(3600);
        let start = buffer.window_start("2024-03-01T10:59:59Z".parse().unwrap());
        assert_eq!(start, "2024-03-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap());
        let start = buffer.window_start("2024-03-01T11:00:00Z".parse().unwrap());
        assert_eq!(start, "2024-03-01T11:00:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn hands_out_only_closed_windows() {
        let mut buffer = WindowBuffer::new(3600);
        buffer.push(event(ObjectType::Account, "001A", "2024-03-01T10:05:00Z"), at(1));
        buffer.push(event(ObjectType::Contact, "003A", "2024-03-01T10:10:00Z"), at(2));
        buffer.push(event(ObjectType::Account, "001A", "2024-03-01T10:50:00Z"), at(3));
        buffer.push(event(ObjectType::Account, "001B", "2024-03-01T11:20:00Z"), at(4));
        assert_eq!(buffer.len(), 4);

        assert!(buffer
            .take_closed("2024-03-01T10:59:59Z".parse().unwrap())
            .is_empty());

        let closed = buffer.take_closed("2024-03-01T11:00:00Z".parse().unwrap());
        assert_eq!(closed.len(), 2);
        assert_eq!(closed[0].object_type, ObjectType::Account);
        assert_eq!(closed[0].events.len(), 2);
        assert_eq!(closed[0].positions, vec![at(1), at(3)]);
        assert_eq!(closed[1].object_type, ObjectType::Contact);
        assert_eq!(buffer.len(), 1);

        let rest = buffer.drain();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].events[0].record_id, "001B");
        assert_eq!(rest[0].positions, vec![at(4)]);
        assert!(buffer.is_empty());
    }
}
