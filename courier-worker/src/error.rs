use std::time;

use courier_common::message::ValidationError;
use rdkafka::error::KafkaError;
use thiserror::Error;

/// Enumeration of errors raised by a single delivery attempt.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("the delivery backend rejected or failed the send: {0}")]
    Backend(String),
    #[error("the delivery attempt exceeded its deadline of {0:?}")]
    Timeout(time::Duration),
}

/// Enumeration of terminal-per-record errors: these are logged, the record
/// is skipped, and the consumer loop proceeds to the next record. They
/// never halt the pipeline.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("payload is not well-formed JSON: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Enumeration of errors fatal to starting or running the pipeline. These
/// always propagate to the caller.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("delivery backend failed verification: {0}")]
    BackendUnavailable(#[source] DeliveryError),
    #[error("the pipeline has already been started")]
    AlreadyRunning,
}
