use cdc_common::store::StoreError;
use rdkafka::error::KafkaError;
use thiserror::Error;

/// Enumeration of errors raised while moving an event through the worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to write raw record: {0}")]
    RawWriteError(#[from] StoreError),
    #[error("failed to produce alert to {topic}: {error}")]
    AlertProduceError { topic: String, error: KafkaError },
    #[error("failed to serialize alert: {0}")]
    SerializeError(#[from] serde_json::Error),
    #[error("failed to receive from kafka: {0}")]
    ConsumeError(KafkaError),
}
