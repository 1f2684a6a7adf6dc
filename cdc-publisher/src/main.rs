//! Generate synthetic CDC events and publish them to Kafka.
use std::time::Duration;

use cdc_common::kafka::{create_kafka_producer, KafkaContext};
use cdc_publisher::config::Config;
use cdc_publisher::publisher::{CdcPublisher, PublishReport};
use cdc_publisher::simulator::CdcSimulator;
use envconfig::Envconfig;
use eyre::Result;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

async fn publish_batch(
    config: &Config,
    simulator: &mut CdcSimulator,
    publisher: &CdcPublisher,
) -> Result<PublishReport> {
    let events = simulator.generate_events(config.object_type, config.count, &config.distribution())?;
    let report = match config.rate_limit {
        Some(per_second) => {
            publisher
                .publish_events_with_rate_limit(&events, per_second)
                .await
        }
        None => publisher.publish_events(&events).await,
    };
    Ok(report)
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_layer = fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();

    let config = Config::init_from_env().expect("Invalid configuration:");
    config.distribution().validate()?;

    let producer = create_kafka_producer(&config.kafka, KafkaContext::without_liveness()).await?;
    let publisher = CdcPublisher::new(
        producer,
        &config.kafka_topic,
        Duration::from_millis(config.publish_timeout_ms),
    );
    let mut simulator = CdcSimulator::default();

    info!(
        "preloading {} {} records",
        config.preload, config.object_type
    );
    simulator.preload(config.object_type, config.preload);

    if !config.continuous {
        let report = publish_batch(&config, &mut simulator, &publisher).await?;
        info!(
            total = report.total_events,
            successful = report.successful,
            failed = report.failed,
            "published {} events",
            config.object_type
        );
        publisher.flush()?;
        return Ok(());
    }

    info!("publishing continuously, Ctrl+C to stop");
    let mut interval = tokio::time::interval(Duration::from_secs(config.interval_secs.max(1)));
    let mut batch = 0u64;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                batch += 1;
                match publish_batch(&config, &mut simulator, &publisher).await {
                    Ok(report) => info!(batch, ?report, "batch published"),
                    Err(e) => error!(batch, "failed to publish batch: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("stopping after {} batches", batch);
                break;
            }
        }
    }

    let stats = publisher.statistics();
    info!(
        published = stats.published,
        failed = stats.failed,
        success_rate = stats.success_rate,
        "publisher closed"
    );
    publisher.flush()?;
    Ok(())
}
