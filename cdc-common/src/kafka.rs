//! Kafka client configuration shared by the worker and the publisher.
use std::time::Duration;

use envconfig::Envconfig;
use metrics::gauge;
use rdkafka::consumer::{ConsumerContext, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::ClientConfig;
use tracing::{debug, error, info};

use crate::health::HealthHandle;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,
}

impl KafkaConfig {
    fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set("statistics.interval.ms", "10000");

        if self.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };
        client_config
    }
}

/// Reports liveness and queue gauges from librdkafka's statistics callback.
pub struct KafkaContext {
    liveness: Option<HealthHandle>,
}

impl From<HealthHandle> for KafkaContext {
    fn from(value: HealthHandle) -> Self {
        KafkaContext {
            liveness: Some(value),
        }
    }
}

impl KafkaContext {
    pub fn without_liveness() -> Self {
        KafkaContext { liveness: None }
    }
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // The main rdkafka loop is running and calling us
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy_blocking();
        }

        gauge!("cdc_kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("cdc_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("cdc_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
    }
}

impl ConsumerContext for KafkaContext {}

pub async fn create_kafka_producer(
    config: &KafkaConfig,
    context: KafkaContext,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = config.client_config();
    client_config
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        );

    debug!("rdkafka configuration: {:?}", client_config);
    let producer: FutureProducer<KafkaContext> = client_config.create_with_context(context)?;

    // "Ping" the brokers by requesting metadata
    match producer
        .client()
        .fetch_metadata(None, Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "connected to Kafka brokers, found {} topics",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(producer)
}

/// A consumer in `group` that stores offsets only when told to, so a message is acknowledged
/// after it has been handled.
pub fn create_kafka_consumer(
    config: &KafkaConfig,
    group: &str,
    offset_reset: &str,
    context: KafkaContext,
) -> Result<StreamConsumer<KafkaContext>, KafkaError> {
    let mut client_config = config.client_config();
    client_config
        .set("group.id", group)
        .set("auto.offset.reset", offset_reset)
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false");

    debug!("rdkafka configuration: {:?}", client_config);
    client_config.create_with_context(context)
}
