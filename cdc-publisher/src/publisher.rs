use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cdc_common::event::CdcEvent;
use cdc_common::kafka::KafkaContext;
use governor::{Quota, RateLimiter};
use metrics::counter;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument};

use crate::simulator::SIMULATOR_SOURCE;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to serialize event: {0}")]
    SerializeError(#[from] serde_json::Error),
    #[error("failed to produce event: {0}")]
    ProduceError(KafkaError),
    #[error("timed out after {0:?} waiting for delivery")]
    Timeout(Duration),
}

/// Outcome of one `publish_events` call, with the publisher's running totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublishReport {
    pub total_events: usize,
    pub successful: u64,
    pub failed: u64,
    pub total_published: u64,
    pub total_failed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PublisherStatistics {
    pub published: u64,
    pub failed: u64,
    pub success_rate: f64,
}

/// Publishes CDC events to a topic, keyed by record id so that every entity's events land on
/// one partition in order.
pub struct CdcPublisher {
    producer: FutureProducer<KafkaContext>,
    topic: String,
    timeout: Duration,
    published: AtomicU64,
    failed: AtomicU64,
}

impl CdcPublisher {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: &str, timeout: Duration) -> Self {
        info!("publishing CDC events to {}", topic);
        Self {
            producer,
            topic: topic.to_owned(),
            timeout,
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    fn kafka_send(&self, event: &CdcEvent) -> Result<DeliveryFuture, PublishError> {
        let payload = serde_json::to_string(&event.to_raw())?;

        let event_timestamp = cdc_common::time::format_timestamp(&event.event_timestamp);
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "event_type",
                value: Some(event.event_type.as_str()),
            })
            .insert(Header {
                key: "object_type",
                value: Some(event.object_type.as_str()),
            })
            .insert(Header {
                key: "source",
                value: Some(event.source.as_deref().unwrap_or(SIMULATOR_SOURCE)),
            })
            .insert(Header {
                key: "event_timestamp",
                value: Some(event_timestamp.as_str()),
            });

        match self.producer.send_result(FutureRecord {
            topic: self.topic.as_str(),
            payload: Some(&payload),
            partition: None,
            key: Some(event.record_id.as_str()),
            timestamp: None,
            headers: Some(headers),
        }) {
            Ok(ack) => Ok(ack),
            Err((e, _)) => Err(PublishError::ProduceError(e)),
        }
    }

    async fn process_ack(delivery: DeliveryFuture, timeout: Duration) -> Result<(), PublishError> {
        match tokio::time::timeout(timeout, delivery).await {
            Err(_) => Err(PublishError::Timeout(timeout)),
            // Cancelled due to timeout while retrying
            Ok(Err(_)) => Err(PublishError::ProduceError(KafkaError::Canceled)),
            Ok(Ok(Err((e, _)))) => Err(PublishError::ProduceError(e)),
            Ok(Ok(Ok(_))) => Ok(()),
        }
    }

    fn record(&self, result: &Result<(), PublishError>, event_id: Option<&str>) {
        match result {
            Ok(()) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                counter!("cdc_events_published_total").increment(1);
                debug!(event_id, "published event");
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                counter!("cdc_events_publish_failed_total").increment(1);
                error!(event_id, "failed to publish event: {}", e);
            }
        }
    }

    /// Publish one event and wait for the broker to acknowledge it.
    pub async fn publish_event(&self, event: &CdcEvent) -> Result<(), PublishError> {
        let result = match self.kafka_send(event) {
            Ok(ack) => Self::process_ack(ack, self.timeout).await,
            Err(e) => Err(e),
        };
        self.record(&result, event.event_id.as_deref());
        result
    }

    /// Queue every event, then wait for all acknowledgements concurrently.
    #[instrument(skip_all, fields(events = events.len()))]
    pub async fn publish_events(&self, events: &[CdcEvent]) -> PublishReport {
        let mut successful = 0;
        let mut failed = 0;
        let mut set = JoinSet::new();

        for event in events {
            let event_id = event.event_id.clone();
            match self.kafka_send(event) {
                Ok(ack) => {
                    let timeout = self.timeout;
                    set.spawn(async move { (event_id, Self::process_ack(ack, timeout).await) });
                }
                Err(e) => {
                    let result = Err(e);
                    self.record(&result, event_id.as_deref());
                    failed += 1;
                }
            }
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((event_id, result)) => {
                    self.record(&result, event_id.as_deref());
                    if result.is_ok() {
                        successful += 1;
                    } else {
                        failed += 1;
                    }
                }
                Err(e) => {
                    error!("join error while waiting on Kafka ACK: {:?}", e);
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    failed += 1;
                }
            }
        }

        info!(successful, failed, "publish complete");
        self.report(events.len(), successful, failed)
    }

    /// Publish events one at a time, no faster than `per_second`.
    #[instrument(skip_all, fields(events = events.len(), per_second = per_second.get()))]
    pub async fn publish_events_with_rate_limit(
        &self,
        events: &[CdcEvent],
        per_second: NonZeroU32,
    ) -> PublishReport {
        let limiter = RateLimiter::direct(Quota::per_second(per_second).allow_burst(NonZeroU32::MIN));
        let mut successful = 0;
        let mut failed = 0;

        for event in events {
            limiter.until_ready().await;
            match self.publish_event(event).await {
                Ok(()) => successful += 1,
                Err(_) => failed += 1,
            }
        }

        info!(successful, failed, "rate-limited publish complete");
        self.report(events.len(), successful, failed)
    }

    fn report(&self, total_events: usize, successful: u64, failed: u64) -> PublishReport {
        PublishReport {
            total_events,
            successful,
            failed,
            total_published: self.published.load(Ordering::Relaxed),
            total_failed: self.failed.load(Ordering::Relaxed),
        }
    }

    pub fn statistics(&self) -> PublisherStatistics {
        let published = self.published.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let attempted = published + failed;
        PublisherStatistics {
            published,
            failed,
            success_rate: if attempted == 0 {
                0.0
            } else {
                published as f64 / attempted as f64
            },
        }
    }

    pub fn reset_statistics(&self) {
        self.published.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
    }

    /// Wait for queued messages to be delivered.
    pub fn flush(&self) -> Result<(), KafkaError> {
        self.producer.flush(Duration::from_secs(30))
    }
}
