use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::error;

use crate::event::RawEvent;
use crate::time::format_timestamp;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("message {message_id} has no payload")]
    EmptyPayload { message_id: String },
    #[error("failed to decode message {message_id}: {error}")]
    InvalidJson {
        message_id: String,
        error: serde_json::Error,
    },
    #[error("message {message_id} does not hold a JSON object")]
    NotAnObject { message_id: String },
}

/// Transport metadata of the message an event arrived in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub message_id: String,
    pub publish_time: Option<DateTime<Utc>>,
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParserStatistics {
    pub parsed: u64,
    pub errors: u64,
    pub success_rate: f64,
}

/// Decodes bus messages into raw events and counts successes and failures.
#[derive(Debug, Default)]
pub struct MessageParser {
    parsed: u64,
    errors: u64,
}

impl MessageParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a JSON event and attach the envelope under `_message_id`, `_publish_time`
    /// and `_attributes`. Envelope keys never take part in validation.
    pub fn parse(
        &mut self,
        payload: Option<&[u8]>,
        envelope: &Envelope,
    ) -> Result<RawEvent, ParseError> {
        let result = decode(payload, envelope);
        match &result {
            Ok(_) => self.parsed += 1,
            Err(e) => {
                self.errors += 1;
                error!("failed to parse message: {}", e);
            }
        }
        result
    }

    pub fn statistics(&self) -> ParserStatistics {
        let seen = self.parsed + self.errors;
        ParserStatistics {
            parsed: self.parsed,
            errors: self.errors,
            success_rate: if seen == 0 {
                0.0
            } else {
                self.parsed as f64 / seen as f64
            },
        }
    }

    pub fn reset_statistics(&mut self) {
        self.parsed = 0;
        self.errors = 0;
    }
}

fn decode(payload: Option<&[u8]>, envelope: &Envelope) -> Result<RawEvent, ParseError> {
    let payload = payload.ok_or_else(|| ParseError::EmptyPayload {
        message_id: envelope.message_id.clone(),
    })?;

    let value: Value = serde_json::from_slice(payload).map_err(|error| ParseError::InvalidJson {
        message_id: envelope.message_id.clone(),
        error,
    })?;

    let mut event = RawEvent::try_from(value).map_err(|_| ParseError::NotAnObject {
        message_id: envelope.message_id.clone(),
    })?;

    event.insert("_message_id", envelope.message_id.clone().into());
    if let Some(publish_time) = &envelope.publish_time {
        event.insert("_publish_time", format_timestamp(publish_time).into());
    }
    if !envelope.attributes.is_empty() {
        event.insert(
            "_attributes",
            Value::Object(
                envelope
                    .attributes
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
        );
    }

    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn envelope() -> Envelope {
        Envelope {
            message_id: "cdc_events/0/42".to_owned(),
            publish_time: Some(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()),
            attributes: BTreeMap::from([("object_type".to_owned(), "Account".to_owned())]),
        }
    }

    #[test]
    fn attaches_envelope_metadata() {
        let mut parser = MessageParser::new();
        let payload = br#"{"event_type": "INSERT", "record_id": "001ABCDEFGHIJKLMNO"}"#;

        let event = parser.parse(Some(payload), &envelope()).unwrap();
        assert_eq!(event.get_str("_message_id"), Some("cdc_events/0/42"));
        assert_eq!(event.get_str("_publish_time"), Some("2024-06-01T12:00:00Z"));
        assert_eq!(
            event.get("_attributes"),
            Some(&json!({"object_type": "Account"}))
        );
        assert_eq!(event.get_str("event_type"), Some("INSERT"));
    }

    #[test]
    fn counts_failures() {
        let mut parser = MessageParser::new();
        assert_eq!(parser.statistics().success_rate, 0.0);

        parser.parse(Some(b"{}"), &envelope()).unwrap();
        assert!(matches!(
            parser.parse(Some(b"{not json"), &envelope()),
            Err(ParseError::InvalidJson { .. })
        ));
        assert!(matches!(
            parser.parse(Some(b"[1, 2]"), &envelope()),
            Err(ParseError::NotAnObject { .. })
        ));
        assert!(matches!(
            parser.parse(None, &envelope()),
            Err(ParseError::EmptyPayload { .. })
        ));

        let stats = parser.statistics();
        assert_eq!(stats.parsed, 1);
        assert_eq!(stats.errors, 3);
        assert_eq!(stats.success_rate, 0.25);

        parser.reset_statistics();
        assert_eq!(parser.statistics().parsed, 0);
    }
}
