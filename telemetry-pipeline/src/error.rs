use common_kafka::{AdminError, ConsumeError, ProduceError};
use thiserror::Error;

/// Why a batch flush did not complete.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("{failed} of {total} items failed: {reason}")]
    Partial {
        failed: usize,
        total: usize,
        reason: String,
    },
    #[error("batch failed: {0}")]
    Failed(String),
    #[error("gave up after {attempts} attempts: {reason}")]
    Exhausted { attempts: u32, reason: String },
}

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("producer is not connected")]
    NotConnected,
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Produce(#[from] ProduceError),
    #[error("flush failed: {0}")]
    Flush(#[from] BatchError),
}

#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("failed to serialize dead-letter record: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("dead-letter channel {channel} unavailable after {attempts} attempts: {source}")]
    Unavailable {
        channel: String,
        attempts: u32,
        source: ProduceError,
    },
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("consumer is not connected")]
    NotConnected,
    #[error("consumer is not subscribed to any channel")]
    NotSubscribed,
    #[error("consumer is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Consume(#[from] ConsumeError),
    #[error("dead-letter path failed, stopping to avoid skipping offsets: {0}")]
    DeadLetter(#[from] DeadLetterError),
    #[error("handler task failed to join: {0}")]
    Join(String),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to provision topics: {0}")]
    Admin(#[from] AdminError),
    #[error(transparent)]
    Consumer(#[from] ConsumerError),
    #[error(transparent)]
    Producer(#[from] ProducerError),
    #[error("pipeline {0} is already registered")]
    DuplicatePipeline(String),
    #[error("admin connection was released at shutdown")]
    AdminReleased,
    #[error("pipeline {pipeline} stopped: {source}")]
    Fatal {
        pipeline: String,
        source: ConsumerError,
    },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),
    #[error("TOPIC_MIN_INSYNC_REPLICAS ({min_insync}) exceeds TOPIC_REPLICATION_FACTOR ({replication})")]
    InsyncAboveReplication { min_insync: i32, replication: i32 },
    #[error("topic {0} is used for more than one purpose")]
    DuplicateTopic(String),
}
