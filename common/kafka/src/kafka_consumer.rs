use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Headers as KafkaHeaders, Message};
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::client::{ChannelConsumer, ConsumeError, ConsumerFactory};
use crate::config::{ConsumerConfig, KafkaConfig};
use crate::types::{ChannelMessage, Partition};

const CONSUMER_KAFKA_ERROR: &str = "pipeline_kafka_consumer_errors_total";
const CONSUMER_REBALANCES: &str = "pipeline_kafka_consumer_rebalances_total";

pub struct PipelineConsumerContext {
    group_id: String,
    // shared with the consumer so partitions assigned while paused stay paused
    paused: Arc<AtomicBool>,
}

impl ClientContext for PipelineConsumerContext {}

impl ConsumerContext for PipelineConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                info!(
                    group_id = %self.group_id,
                    "Revoking {} partitions",
                    partitions.count()
                );
                metrics::counter!(CONSUMER_REBALANCES, "event_type" => "revoke").increment(1);
            }
            Rebalance::Assign(partitions) => {
                debug!(
                    group_id = %self.group_id,
                    "Pre-rebalance assign event for {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Error(e) => {
                error!(group_id = %self.group_id, "Rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                info!(
                    group_id = %self.group_id,
                    "Assigned {} partitions",
                    partitions.count()
                );
                metrics::counter!(CONSUMER_REBALANCES, "event_type" => "assign").increment(1);

                if self.paused.load(Ordering::SeqCst) && partitions.count() > 0 {
                    if let Err(e) = base_consumer.pause(partitions) {
                        error!(
                            "Failed to pause {} newly assigned partitions: {}",
                            partitions.count(),
                            e
                        );
                    }
                }
            }
            Rebalance::Revoke(_) => {
                debug!(group_id = %self.group_id, "Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!(group_id = %self.group_id, "Post-rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => {
                debug!(
                    group_id = %self.group_id,
                    "Committed offsets for {} partitions",
                    offsets.count()
                );
            }
            Err(e) => {
                warn!(group_id = %self.group_id, "Failed to commit offsets: {}", e);
            }
        }
    }
}

/// One consumer-group member with manual offset management.
pub struct KafkaConsumer {
    consumer: StreamConsumer<PipelineConsumerContext>,
    group_id: String,
    subscribed: AtomicBool,
    paused: Arc<AtomicBool>,
}

impl KafkaConsumer {
    pub fn new(
        common_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
        group_id: &str,
    ) -> Result<Self, KafkaError> {
        let mut client_config = common_config.client_config();
        client_config
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set(
                "auto.offset.reset",
                &consumer_config.kafka_consumer_offset_reset,
            )
            .set(
                "session.timeout.ms",
                consumer_config.kafka_consumer_session_timeout_ms.to_string(),
            )
            .set(
                "heartbeat.interval.ms",
                consumer_config.kafka_consumer_heartbeat_interval_ms.to_string(),
            )
            .set(
                "max.poll.interval.ms",
                consumer_config.kafka_consumer_max_poll_interval_ms.to_string(),
            );

        let paused = Arc::new(AtomicBool::new(false));
        let context = PipelineConsumerContext {
            group_id: group_id.to_owned(),
            paused: paused.clone(),
        };
        let consumer: StreamConsumer<PipelineConsumerContext> =
            client_config.create_with_context(context)?;

        Ok(Self {
            consumer,
            group_id: group_id.to_owned(),
            subscribed: AtomicBool::new(false),
            paused,
        })
    }

    fn to_channel_message(message: &BorrowedMessage<'_>) -> ChannelMessage {
        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .filter_map(|header| {
                        let value = header.value.and_then(|v| std::str::from_utf8(v).ok())?;
                        Some((header.key.to_string(), value.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        ChannelMessage {
            partition: Partition::new(message.topic().to_owned(), message.partition()),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
            headers,
            timestamp: message.timestamp().to_millis(),
        }
    }

    /// Returns the error back only when it is fatal; transient errors are
    /// counted and backed off so the caller keeps polling.
    async fn handle_kafka_error(e: KafkaError, current_count: u64) -> Option<KafkaError> {
        match &e {
            KafkaError::MessageConsumption(code) => {
                match code {
                    RDKafkaErrorCode::PartitionEOF => {
                        metrics::counter!(CONSUMER_KAFKA_ERROR, "level" => "info", "error" => "partition_eof")
                            .increment(1);
                    }
                    RDKafkaErrorCode::OffsetOutOfRange => {
                        // "auto.offset.reset" will trigger a seek in coordination with the broker
                        warn!("Offset out of range - seeking to configured offset reset policy");
                        metrics::counter!(CONSUMER_KAFKA_ERROR, "level" => "info", "error" => "offset_out_of_range")
                            .increment(1);
                        sleep(Duration::from_millis(500)).await;
                    }
                    _ => {
                        warn!("Kafka consumer error: {code:?}");
                        metrics::counter!(CONSUMER_KAFKA_ERROR, "level" => "warn", "error" => "consumer")
                            .increment(1);
                        sleep(Duration::from_millis(100 * current_count.min(10))).await;
                    }
                }
                None
            }
            KafkaError::MessageConsumptionFatal(code) => {
                error!("Fatal Kafka consumer error: {code:?}");
                metrics::counter!(CONSUMER_KAFKA_ERROR, "level" => "fatal", "error" => "consumer")
                    .increment(1);
                Some(e)
            }
            KafkaError::Global(code) => {
                match code {
                    RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure => {
                        warn!("Broker connection lost: {code:?} - waiting for reconnect");
                        metrics::counter!(CONSUMER_KAFKA_ERROR, "level" => "warn", "error" => "broker_transport")
                            .increment(1);
                        sleep(Duration::from_secs(current_count.min(5))).await;
                    }
                    RDKafkaErrorCode::Authentication => {
                        error!("Authentication failed: {code:?}");
                        metrics::counter!(CONSUMER_KAFKA_ERROR, "level" => "fatal", "error" => "authentication")
                            .increment(1);
                        return Some(e);
                    }
                    _ => {
                        warn!("Global Kafka error: {code:?}");
                        metrics::counter!(CONSUMER_KAFKA_ERROR, "level" => "warn", "error" => "global")
                            .increment(1);
                        sleep(Duration::from_millis(500 * current_count.min(6))).await;
                    }
                }
                None
            }
            KafkaError::Canceled => {
                info!("Consumer canceled - shutting down");
                Some(e)
            }
            _ => {
                error!("Unexpected error: {:?}", e);
                metrics::counter!(CONSUMER_KAFKA_ERROR, "level" => "warn", "error" => "unexpected")
                    .increment(1);
                sleep(Duration::from_millis(100 * current_count.min(10))).await;
                None
            }
        }
    }
}

#[async_trait]
impl ChannelConsumer for KafkaConsumer {
    async fn connect(&self) -> Result<(), ConsumeError> {
        let metadata = self
            .consumer
            .fetch_metadata(None, Duration::from_secs(15))?;
        info!(
            group_id = %self.group_id,
            "Consumer connected to Kafka brokers. Found {} topics.",
            metadata.topics().len()
        );
        Ok(())
    }

    fn subscribe(&self, channels: &[String]) -> Result<(), ConsumeError> {
        let topics: Vec<&str> = channels.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics)?;
        self.subscribed.store(true, Ordering::SeqCst);
        info!(group_id = %self.group_id, ?topics, "subscribed");
        Ok(())
    }

    async fn recv_batch(
        &self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<ChannelMessage>, ConsumeError> {
        if !self.subscribed.load(Ordering::SeqCst) {
            return Err(ConsumeError::NotSubscribed);
        }

        let deadline = Instant::now() + timeout;
        let mut batch = Vec::with_capacity(max_messages);
        let mut kafka_error_count = 0;

        while batch.len() < max_messages {
            let Ok(next) = tokio::time::timeout_at(deadline, self.consumer.recv()).await else {
                break;
            };
            match next {
                Ok(message) => {
                    batch.push(Self::to_channel_message(&message));
                    kafka_error_count = 0;
                }
                Err(e) => {
                    kafka_error_count += 1;
                    if let Some(fatal) = Self::handle_kafka_error(e, kafka_error_count).await {
                        return Err(fatal.into());
                    }
                }
            }
        }

        Ok(batch)
    }

    fn commit(&self, offsets: &HashMap<Partition, i64>) -> Result<(), ConsumeError> {
        if offsets.is_empty() {
            return Ok(());
        }

        let mut list = TopicPartitionList::new();
        for (partition, next_offset) in offsets {
            list.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(*next_offset),
            )?;
        }

        // Synchronous so the caller knows exactly what is durable
        self.consumer.commit(&list, CommitMode::Sync)?;
        Ok(())
    }

    fn heartbeat(&self) {
        // librdkafka heartbeats from its background thread, so a long batch
        // only needs to stay under max.poll.interval.ms
        debug!(group_id = %self.group_id, "batch still in progress");
    }

    fn pause(&self) -> Result<(), ConsumeError> {
        self.paused.store(true, Ordering::SeqCst);
        let assignment = self.consumer.assignment()?;
        self.consumer.pause(&assignment)?;
        info!(group_id = %self.group_id, "Paused {} partitions", assignment.count());
        Ok(())
    }

    fn resume(&self) -> Result<(), ConsumeError> {
        self.paused.store(false, Ordering::SeqCst);
        let assignment = self.consumer.assignment()?;
        self.consumer.resume(&assignment)?;
        info!(group_id = %self.group_id, "Resumed {} partitions", assignment.count());
        Ok(())
    }

    async fn close(&self) {
        self.consumer.unsubscribe();
        self.subscribed.store(false, Ordering::SeqCst);
        info!(group_id = %self.group_id, "consumer closed");
    }
}

#[derive(Clone)]
pub struct KafkaConsumerFactory {
    kafka: KafkaConfig,
    consumer: ConsumerConfig,
}

impl KafkaConsumerFactory {
    pub fn new(kafka: KafkaConfig, consumer: ConsumerConfig) -> Self {
        Self { kafka, consumer }
    }
}

impl ConsumerFactory for KafkaConsumerFactory {
    fn create_consumer(&self, group_id: &str) -> Result<Arc<dyn ChannelConsumer>, ConsumeError> {
        let consumer = KafkaConsumer::new(&self.kafka, &self.consumer, group_id)?;
        Ok(Arc::new(consumer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> KafkaConfig {
        KafkaConfig {
            kafka_producer_linger_ms: 0,
            kafka_producer_queue_mib: 50,
            kafka_producer_queue_messages: 1000,
            kafka_message_timeout_ms: 500,
            kafka_compression_codec: "none".to_string(),
            kafka_enable_idempotence: false,
            kafka_tls: false,
            kafka_hosts: "localhost:9092".to_string(),
        }
    }

    #[tokio::test]
    async fn test_recv_before_subscribe_is_rejected() {
        let consumer = KafkaConsumer::new(&config(), &ConsumerConfig::default(), "group")
            .expect("failed to create consumer");

        let result = consumer.recv_batch(10, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(ConsumeError::NotSubscribed)));
    }

    #[tokio::test]
    async fn test_empty_commit_is_a_no_op() {
        let consumer = KafkaConsumer::new(&config(), &ConsumerConfig::default(), "group")
            .expect("failed to create consumer");

        consumer
            .commit(&HashMap::new())
            .expect("empty commit should not reach the broker");
    }

    #[tokio::test]
    async fn test_transient_errors_are_swallowed() {
        let transient = KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF);
        assert!(KafkaConsumer::handle_kafka_error(transient, 1).await.is_none());

        let fatal = KafkaError::MessageConsumptionFatal(RDKafkaErrorCode::Fatal);
        assert!(KafkaConsumer::handle_kafka_error(fatal, 1).await.is_some());
    }
}
