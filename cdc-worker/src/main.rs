//! Consume CDC events from Kafka, validate them, feed the raw tables and maintain history.
use std::sync::Arc;
use std::time::Duration;

use cdc_common::health::HealthRegistry;
use cdc_common::kafka::{create_kafka_producer, KafkaContext};
use cdc_common::metrics::{serve, setup_metrics_router};
use cdc_common::pgstore::{PgHistoryStore, PgRawSink};
use cdc_common::raw::{PrintSink, RawSink};
use cdc_common::schema::TableNames;
use cdc_common::store::{HistoryStore, MemoryHistoryStore};
use cdc_common::time::SystemTime;
use envconfig::Envconfig;
use eyre::{eyre, Result};
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use cdc_worker::alerts::{AlertSink, KafkaAlertSink, PrintAlertSink};
use cdc_worker::config::Config;
use cdc_worker::consumer::{consume, store_committable, CdcConsumer};
use cdc_worker::pipeline::{flush_periodically, Pipeline, PipelineSettings};

#[tokio::main]
async fn main() -> Result<()> {
    let log_layer = fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    tracing_subscriber::registry().with(log_layer).init();

    let config = Config::init_from_env().expect("Invalid configuration:");
    let liveness = HealthRegistry::new("liveness");
    let tables = TableNames::new(&config.raw_table_prefix, &config.history_table_suffix);

    let (raw_sink, store, alerts): (Arc<dyn RawSink>, Arc<dyn HistoryStore>, Arc<dyn AlertSink>) =
        if config.print_sink {
            info!("writing raw records to the log and keeping history in memory");
            (
                Arc::new(PrintSink {}),
                Arc::new(MemoryHistoryStore::new()),
                Arc::new(PrintAlertSink {}),
            )
        } else {
            let database_url = config
                .database_url
                .as_deref()
                .ok_or_else(|| eyre!("DATABASE_URL must be set unless PRINT_SINK is enabled"))?;
            let raw_sink =
                PgRawSink::new(database_url, config.max_pg_connections, tables.clone()).await?;
            let store =
                PgHistoryStore::new(database_url, config.max_pg_connections, tables).await?;

            let producer_liveness = liveness
                .register("alerts_producer", time::Duration::seconds(30))
                .await;
            let producer =
                create_kafka_producer(&config.kafka, KafkaContext::from(producer_liveness)).await?;
            (
                Arc::new(raw_sink),
                Arc::new(store),
                Arc::new(KafkaAlertSink::new(producer, &config.kafka_alerts_topic)),
            )
        };

    let pipeline = Arc::new(Pipeline::new(
        PipelineSettings::from(&config),
        raw_sink,
        alerts,
        store,
        Arc::new(SystemTime {}),
    ));

    let consumer_liveness = liveness
        .register("kafka_consumer", time::Duration::seconds(30))
        .await;
    let consumer = CdcConsumer::new(
        &config.kafka,
        &config.kafka_consumer_group,
        &config.kafka_consumer_topic,
        &config.kafka_consumer_offset_reset,
        consumer_liveness.clone(),
    )?;

    let flush_interval = config.history_flush_interval_secs.max(1);
    let flusher_liveness = liveness
        .register(
            "history_flusher",
            time::Duration::seconds(i64::try_from(flush_interval * 3).unwrap_or(i64::MAX)),
        )
        .await;

    let router = setup_metrics_router(liveness.clone())?;
    let bind = config.bind();
    let http_server = async move { serve(router, &bind).await };

    info!(
        topic = %config.kafka_consumer_topic,
        group = %config.kafka_consumer_group,
        "starting cdc worker"
    );
    tokio::select! {
        result = consume(consumer.clone(), pipeline.clone(), consumer_liveness) => {
            if let Err(e) = result {
                error!("consumer loop exited: {}", e);
            }
        }
        _ = flush_periodically(pipeline.clone(), Duration::from_secs(flush_interval), flusher_liveness) => {
            error!("history flusher exited");
        }
        result = http_server => {
            if let Err(e) = result {
                error!("failed to serve metrics: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    let reports = pipeline.flush_all().await;
    store_committable(&consumer, &pipeline).await;
    info!(
        windows = reports.len(),
        in_flight = pipeline.in_flight_messages().await,
        "flushed remaining history windows"
    );

    Ok(())
}
