use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use cdc_common::health::HealthHandle;
use cdc_common::kafka::{create_kafka_consumer, KafkaConfig, KafkaContext};
use cdc_common::parser::Envelope;
use chrono::{TimeZone, Utc};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Headers};
use rdkafka::Message;
use tracing::{debug, error};

use crate::error::WorkerError;
use crate::offsets::MessagePosition;
use crate::pipeline::Pipeline;

const COMMIT_INTERVAL: Duration = Duration::from_secs(5);

/// A bus message: the raw payload and the envelope it arrived in.
pub struct Delivery {
    pub payload: Option<Vec<u8>>,
    pub envelope: Envelope,
    pub position: MessagePosition,
}

#[derive(Clone)]
pub struct CdcConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer<KafkaContext>,
    topic: String,
}

impl CdcConsumer {
    pub fn new(
        config: &KafkaConfig,
        group: &str,
        topic: &str,
        offset_reset: &str,
        liveness: HealthHandle,
    ) -> Result<Self, KafkaError> {
        let consumer = create_kafka_consumer(config, group, offset_reset, liveness.into())?;
        consumer.subscribe(&[topic])?;

        let inner = Inner {
            consumer,
            topic: topic.to_owned(),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub async fn recv(&self) -> Result<Delivery, KafkaError> {
        let message = self.inner.consumer.recv().await?;

        Ok(Delivery {
            payload: message.payload().map(<[u8]>::to_vec),
            envelope: envelope(&message),
            position: MessagePosition::new(message.partition(), message.offset()),
        })
    }

    /// Mark everything up to and including `position` as consumed, for the next commit.
    pub fn store(&self, position: MessagePosition) -> Result<(), KafkaError> {
        self.inner
            .consumer
            .store_offset(&self.inner.topic, position.partition, position.offset)
    }
}

/// Message ids are `topic/partition/offset`, unique within a cluster.
fn envelope(message: &BorrowedMessage<'_>) -> Envelope {
    let publish_time = message
        .timestamp()
        .to_millis()
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single());

    let mut attributes = BTreeMap::new();
    if let Some(headers) = message.headers() {
        for header in headers.iter() {
            let value = header
                .value
                .map(|value| String::from_utf8_lossy(value).into_owned())
                .unwrap_or_default();
            attributes.insert(header.key.to_owned(), value);
        }
    }

    Envelope {
        message_id: format!(
            "{}/{}/{}",
            message.topic(),
            message.partition(),
            message.offset()
        ),
        publish_time,
        attributes,
    }
}

/// Store every offset the pipeline is done with.
pub async fn store_committable(consumer: &CdcConsumer, pipeline: &Pipeline) {
    for position in pipeline.committable_offsets().await {
        match consumer.store(position) {
            Ok(()) => debug!(
                partition = position.partition,
                offset = position.offset,
                "stored offset"
            ),
            Err(e) => error!(
                partition = position.partition,
                offset = position.offset,
                "failed to store offset: {}",
                e
            ),
        }
    }
}

/// Feed every message to the pipeline, storing offsets as the pipeline finishes with them.
///
/// Offsets of events buffered for history are held until their window is processed, so they
/// are checked on a timer as well as after every message.
pub async fn consume(
    consumer: CdcConsumer,
    pipeline: Arc<Pipeline>,
    liveness: HealthHandle,
) -> Result<(), WorkerError> {
    let mut commit_interval = tokio::time::interval(COMMIT_INTERVAL);
    loop {
        tokio::select! {
            delivery = consumer.recv() => {
                let delivery = delivery.map_err(WorkerError::ConsumeError)?;
                liveness.report_healthy().await;

                if let Err(e) = pipeline
                    .handle_message(
                        delivery.payload.as_deref(),
                        &delivery.envelope,
                        delivery.position,
                    )
                    .await
                {
                    error!(
                        "failed to handle message {}: {}",
                        delivery.envelope.message_id, e
                    );
                }
            }
            _ = commit_interval.tick() => {}
        }
        store_committable(&consumer, &pipeline).await;
    }
}
