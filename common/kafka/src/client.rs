//! Broker-agnostic client seams.
//!
//! The pipeline only talks to these traits. `kafka_producer`, `kafka_consumer`
//! and `admin` implement them on top of rdkafka; `memory` implements all of
//! them in-process for tests and local runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::types::{ChannelMessage, OutboundRecord, Partition, TopicSpec};

#[derive(Error, Debug)]
pub enum ProduceError {
    #[error("failed to produce to kafka: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to produce to kafka (timeout)")]
    Canceled,
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum ConsumeError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("consumer has no subscription")]
    NotSubscribed,
    #[error("consumer is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum AdminError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to create topic {topic}: {reason}")]
    CreateFailed { topic: String, reason: String },
}

#[async_trait]
pub trait ChannelProducer: Send + Sync {
    /// Checks that brokers are reachable.
    async fn connect(&self) -> Result<(), ProduceError>;

    /// Produces records to one channel. Returns one result per record, in input order,
    /// once every record is either acknowledged or failed.
    async fn send(
        &self,
        channel: &str,
        records: Vec<OutboundRecord>,
    ) -> Vec<Result<(), ProduceError>>;

    /// Waits for the client's internal queue to drain.
    async fn flush(&self, timeout: Duration) -> Result<(), ProduceError>;
}

#[async_trait]
pub trait ChannelConsumer: Send + Sync {
    async fn connect(&self) -> Result<(), ConsumeError>;

    fn subscribe(&self, channels: &[String]) -> Result<(), ConsumeError>;

    /// Pulls up to `max_messages`, returning early once the batch is full or
    /// `timeout` elapses. An empty batch is not an error.
    async fn recv_batch(
        &self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<ChannelMessage>, ConsumeError>;

    /// Synchronously commits the given next-offset-to-consume per partition.
    fn commit(&self, offsets: &HashMap<Partition, i64>) -> Result<(), ConsumeError>;

    /// Signals group membership liveness while a long batch is being processed.
    fn heartbeat(&self);

    /// Stops fetching from assigned partitions without leaving the group.
    fn pause(&self) -> Result<(), ConsumeError>;

    fn resume(&self) -> Result<(), ConsumeError>;

    async fn close(&self);
}

#[async_trait]
pub trait TopicAdmin: Send + Sync {
    /// Creates the topics that do not exist yet and returns their names.
    /// Existing topics are left untouched, whatever their configuration.
    async fn create_topics_if_needed(&self, topics: &[TopicSpec])
        -> Result<Vec<String>, AdminError>;
}

/// Builds one consumer per consumer group, so pipelines never share an offset cursor.
pub trait ConsumerFactory: Send + Sync {
    fn create_consumer(&self, group_id: &str) -> Result<Arc<dyn ChannelConsumer>, ConsumeError>;
}
