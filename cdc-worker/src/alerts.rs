use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cdc_common::alert::DataQualityAlert;
use cdc_common::kafka::KafkaContext;
use metrics::counter;
use rdkafka::error::KafkaError;
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord};
use tracing::{error, info};

use crate::error::WorkerError;

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: DataQualityAlert) -> Result<(), WorkerError>;
}

pub struct PrintAlertSink {}

#[async_trait]
impl AlertSink for PrintAlertSink {
    async fn send(&self, alert: DataQualityAlert) -> Result<(), WorkerError> {
        let payload = serde_json::to_string(&alert)?;
        info!("data quality alert: {}", payload);
        counter!("cdc_alerts_sent_total").increment(1);
        Ok(())
    }
}

/// Produces alerts to a Kafka topic, keyed by record id.
#[derive(Clone)]
pub struct KafkaAlertSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaAlertSink {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: &str) -> Self {
        Self {
            producer,
            topic: topic.to_owned(),
        }
    }

    async fn process_ack(&self, delivery: DeliveryFuture) -> Result<(), WorkerError> {
        match delivery.await {
            Err(_) => {
                // Cancelled due to timeout while retrying
                counter!("cdc_alerts_failed_total").increment(1);
                Err(WorkerError::AlertProduceError {
                    topic: self.topic.clone(),
                    error: KafkaError::Canceled,
                })
            }
            Ok(Err((error, _))) => {
                counter!("cdc_alerts_failed_total").increment(1);
                Err(WorkerError::AlertProduceError {
                    topic: self.topic.clone(),
                    error,
                })
            }
            Ok(Ok(_)) => {
                counter!("cdc_alerts_sent_total").increment(1);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl AlertSink for KafkaAlertSink {
    async fn send(&self, alert: DataQualityAlert) -> Result<(), WorkerError> {
        let payload = serde_json::to_string(&alert)?;

        let delivery = match self.producer.send_result(FutureRecord {
            topic: self.topic.as_str(),
            payload: Some(&payload),
            partition: None,
            key: alert.key(),
            timestamp: None,
            headers: None,
        }) {
            Ok(delivery) => delivery,
            Err((error, _)) => {
                counter!("cdc_alerts_failed_total").increment(1);
                error!("failed to produce alert: {}", error);
                return Err(WorkerError::AlertProduceError {
                    topic: self.topic.clone(),
                    error,
                });
            }
        };

        self.process_ack(delivery).await
    }
}

/// Keeps alerts in memory, for tests.
#[derive(Clone, Default)]
pub struct MemoryAlertSink {
    alerts: Arc<Mutex<Vec<DataQualityAlert>>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<DataQualityAlert> {
        self.alerts
            .lock()
            .map(|alerts| alerts.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn send(&self, alert: DataQualityAlert) -> Result<(), WorkerError> {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(alert);
        }
        Ok(())
    }
}
