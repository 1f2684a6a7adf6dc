use std::sync::Arc;
use std::time::Duration;

use cdc_common::alert::{mark_invalid, DataQualityAlert};
use cdc_common::event::CdcEvent;
use cdc_common::parser::{Envelope, MessageParser, ParserStatistics};
use cdc_common::raw::{RawRecord, RawSink};
use cdc_common::scd2::{BatchStats, Scd2Processor};
use cdc_common::schema::ObjectType;
use cdc_common::store::HistoryStore;
use cdc_common::time::TimeSource;
use cdc_common::validator::{ValidationSummary, Validator};
use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::alerts::AlertSink;
use crate::config::Config;
use crate::error::WorkerError;
use crate::offsets::{MessagePosition, OffsetTracker};
use crate::window::{Window, WindowBuffer};

/// Where a message ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Unparseable,
    Invalid,
    /// Valid, but its object type is not enabled.
    Skipped(ObjectType),
    Accepted {
        object_type: ObjectType,
        buffered: bool,
    },
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub alert_threshold: f64,
    pub alerts_enabled: bool,
    pub enabled_objects: Vec<ObjectType>,
    pub history_objects: Vec<ObjectType>,
    pub window_secs: u64,
    pub store_timeout: Duration,
    pub max_concurrent_groups: usize,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            alert_threshold: config.alert_threshold,
            alerts_enabled: config.alerts_enabled,
            enabled_objects: config.enabled_objects.0.clone(),
            history_objects: config.history_objects.0.clone(),
            window_secs: config.history_window_secs,
            store_timeout: config.store_timeout_ms.0,
            max_concurrent_groups: config.max_concurrent_groups,
        }
    }
}

/// Outcome of one history window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowReport {
    pub object_type: ObjectType,
    pub start: DateTime<Utc>,
    pub stats: BatchStats,
}

/// Parse, validate and route events: invalid ones to alerts, valid ones to the raw feed and
/// the history windows.
///
/// A message's offset becomes committable once it is done with: after routing, or for events
/// buffered for history, after their window has been processed. A message whose raw write
/// failed is never done, which holds back commits on its partition until a restart
/// redelivers it.
pub struct Pipeline {
    parser: Mutex<MessageParser>,
    validator: Mutex<Validator>,
    windows: Mutex<WindowBuffer>,
    offsets: Mutex<OffsetTracker>,
    raw_sink: Arc<dyn RawSink>,
    alerts: Arc<dyn AlertSink>,
    alerts_enabled: bool,
    enabled_objects: Vec<ObjectType>,
    history_objects: Vec<ObjectType>,
    processor: Scd2Processor,
    time: Arc<dyn TimeSource + Send + Sync>,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        raw_sink: Arc<dyn RawSink>,
        alerts: Arc<dyn AlertSink>,
        store: Arc<dyn HistoryStore>,
        time: Arc<dyn TimeSource + Send + Sync>,
    ) -> Self {
        let processor = Scd2Processor::new(store)
            .with_time_source(time.clone())
            .with_store_timeout(settings.store_timeout)
            .with_max_concurrent_groups(settings.max_concurrent_groups);

        Self {
            parser: Mutex::new(MessageParser::new()),
            validator: Mutex::new(Validator::with_time_source(
                settings.alert_threshold,
                time.clone(),
            )),
            windows: Mutex::new(WindowBuffer::new(settings.window_secs)),
            offsets: Mutex::new(OffsetTracker::new()),
            raw_sink,
            alerts,
            alerts_enabled: settings.alerts_enabled,
            enabled_objects: settings.enabled_objects,
            history_objects: settings.history_objects,
            processor,
            time,
        }
    }

    pub async fn handle_message(
        &self,
        payload: Option<&[u8]>,
        envelope: &Envelope,
        position: MessagePosition,
    ) -> Result<Outcome, WorkerError> {
        self.offsets.lock().await.track(position);
        let outcome = self.route(payload, envelope, position).await?;
        if !matches!(outcome, Outcome::Accepted { buffered: true, .. }) {
            self.offsets.lock().await.complete(position);
        }
        Ok(outcome)
    }

    async fn route(
        &self,
        payload: Option<&[u8]>,
        envelope: &Envelope,
        position: MessagePosition,
    ) -> Result<Outcome, WorkerError> {
        counter!("cdc_events_received_total").increment(1);

        let mut raw = match self.parser.lock().await.parse(payload, envelope) {
            Ok(raw) => raw,
            Err(_) => {
                counter!("cdc_events_unparseable_total").increment(1);
                return Ok(Outcome::Unparseable);
            }
        };

        let (report, should_alert, error_rate) = {
            let mut validator = self.validator.lock().await;
            let report = validator.validate(&raw);
            (report, validator.should_alert(), validator.error_rate())
        };
        gauge!("cdc_validation_error_rate").set(error_rate);
        if should_alert {
            warn!(error_rate, "validation error rate exceeds the alert threshold");
        }

        if !report.is_valid() {
            for error in &report.errors {
                counter!("cdc_events_invalid_total", "check" => error.check().as_str())
                    .increment(1);
            }
            let now = self.time.current_time();
            warn!(
                message_id = %envelope.message_id,
                errors = ?report.messages(),
                "invalid CDC event"
            );

            if self.alerts_enabled {
                let alert = DataQualityAlert::new(&raw, &report, now);
                if let Err(e) = self.alerts.send(alert).await {
                    error!("failed to send data quality alert: {}", e);
                }
            }
            mark_invalid(&mut raw, &report, now);
            debug!(event = ?raw, "dropped invalid event");
            return Ok(Outcome::Invalid);
        }
        counter!("cdc_events_valid_total").increment(1);

        let event = match CdcEvent::try_from(raw) {
            Ok(event) => event,
            Err(e) => {
                // Validation accepted a shape the typed model cannot hold.
                error!(message_id = %envelope.message_id, "failed to convert event: {}", e);
                return Ok(Outcome::Invalid);
            }
        };

        let object_type = event.object_type;
        if !self.enabled_objects.contains(&object_type) {
            warn!(
                message_id = %envelope.message_id,
                "skipping event for disabled object type {}", object_type
            );
            return Ok(Outcome::Skipped(object_type));
        }

        let record = RawRecord::from_event(&event, self.time.current_time());
        self.raw_sink.write(record).await?;

        let buffered = self.history_objects.contains(&object_type);
        if buffered {
            self.windows.lock().await.push(event, position);
        }

        Ok(Outcome::Accepted {
            object_type,
            buffered,
        })
    }

    /// Run the SCD2 processor over every window that has closed by now.
    pub async fn flush(&self) -> Vec<WindowReport> {
        let now = self.time.current_time();
        let windows = self.windows.lock().await.take_closed(now);
        self.process_windows(windows).await
    }

    /// Run the SCD2 processor over every buffered window, for shutdown.
    pub async fn flush_all(&self) -> Vec<WindowReport> {
        let windows = self.windows.lock().await.drain();
        self.process_windows(windows).await
    }

    #[instrument(skip_all, fields(windows = windows.len()))]
    async fn process_windows(&self, windows: Vec<Window>) -> Vec<WindowReport> {
        let mut reports = Vec::with_capacity(windows.len());
        for window in windows {
            info!(
                object_type = %window.object_type,
                start = %window.start,
                events = window.events.len(),
                "processing history window"
            );
            let stats = self
                .processor
                .process_batch(window.events, window.object_type)
                .await;

            let mut offsets = self.offsets.lock().await;
            for position in window.positions {
                offsets.complete(position);
            }
            drop(offsets);
            reports.push(WindowReport {
                object_type: window.object_type,
                start: window.start,
                stats,
            });
        }
        reports
    }

    /// Offsets that became safe to store since the last call, one per partition.
    pub async fn committable_offsets(&self) -> Vec<MessagePosition> {
        self.offsets.lock().await.take_committable()
    }

    /// Messages consumed but not yet done with.
    pub async fn in_flight_messages(&self) -> usize {
        self.offsets.lock().await.in_flight()
    }

    pub async fn buffered_events(&self) -> usize {
        self.windows.lock().await.len()
    }

    pub async fn validation_statistics(&self) -> ValidationSummary {
        self.validator.lock().await.statistics()
    }

    pub async fn parser_statistics(&self) -> ParserStatistics {
        self.parser.lock().await.statistics()
    }
}

/// Flush closed history windows every `interval`, reporting liveness after each pass.
pub async fn flush_periodically(
    pipeline: Arc<Pipeline>,
    interval: Duration,
    liveness: cdc_common::health::HealthHandle,
) {
    let mut interval = tokio::time::interval(interval);
    loop {
        interval.tick().await;
        let reports = pipeline.flush().await;
        if !reports.is_empty() {
            let errors: usize = reports.iter().map(|report| report.stats.errors).sum();
            info!(
                windows = reports.len(),
                errors, "flushed history windows"
            );
        }
        liveness.report_healthy().await;
    }
}
