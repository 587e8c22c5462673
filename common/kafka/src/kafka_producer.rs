use std::time::Duration;

use async_trait::async_trait;
use health::HealthHandle;
use metrics::{counter, gauge};
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::{debug, error, info};

use crate::client::{ChannelProducer, ProduceError};
use crate::config::KafkaConfig;
use crate::types::{Headers, OutboundRecord};

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(value: HealthHandle) -> Self {
        KafkaContext { liveness: value }
    }
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();

        gauge!("pipeline_kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("pipeline_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("pipeline_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("pipeline_kafka_producer_queue_bytes").set(stats.msg_size as f64);
        gauge!("pipeline_kafka_producer_queue_bytes_limit").set(stats.msg_size_max as f64);

        for (topic, stats) in stats.topics {
            gauge!("pipeline_kafka_produce_avg_batch_size_bytes", "topic" => topic.clone())
                .set(stats.batchsize.avg as f64);
            gauge!("pipeline_kafka_produce_avg_batch_size_events", "topic" => topic)
                .set(stats.batchcnt.avg as f64);
        }

        for (_, stats) in stats.brokers {
            let id_string = format!("{}", stats.nodeid);
            gauge!("pipeline_kafka_broker_requests_pending", "broker" => id_string.clone())
                .set(stats.outbuf_cnt as f64);
            counter!("pipeline_kafka_broker_tx_errors_total", "broker" => id_string.clone())
                .absolute(stats.txerrs);
            counter!("pipeline_kafka_broker_rx_errors_total", "broker" => id_string)
                .absolute(stats.rxerrs);
        }
    }
}

/// Idempotent, acks=all producer shared by every pipeline of a process.
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer<KafkaContext>,
}

impl KafkaProducer {
    pub fn new(config: &KafkaConfig, liveness: HealthHandle) -> Result<Self, KafkaError> {
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
            )
            .set(
                "queue.buffering.max.messages",
                config.kafka_producer_queue_messages.to_string(),
            );

        if config.kafka_enable_idempotence {
            client_config
                .set("enable.idempotence", "true")
                .set("acks", "all")
                .set("max.in.flight.requests.per.connection", "5");
        }

        debug!("rdkafka producer configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(liveness.into())?;

        Ok(Self { producer })
    }

    fn owned_headers(headers: &Headers) -> Option<OwnedHeaders> {
        if headers.is_empty() {
            return None;
        }
        let owned = headers.iter().fold(OwnedHeaders::new(), |acc, (key, value)| {
            acc.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            })
        });
        Some(owned)
    }
}

#[async_trait]
impl ChannelProducer for KafkaProducer {
    async fn connect(&self) -> Result<(), ProduceError> {
        // "Ping" the Kafka brokers by requesting metadata
        match self
            .producer
            .client()
            .fetch_metadata(None, Duration::from_secs(15))
        {
            Ok(metadata) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
                Ok(())
            }
            Err(error) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
                Err(error.into())
            }
        }
    }

    async fn send(
        &self,
        channel: &str,
        records: Vec<OutboundRecord>,
    ) -> Vec<Result<(), ProduceError>> {
        let mut results: Vec<(usize, Result<(), ProduceError>)> = Vec::with_capacity(records.len());
        let mut handles: Vec<(usize, DeliveryFuture)> = Vec::with_capacity(records.len());

        // Enqueue everything first so librdkafka can batch, then await acks
        for (index, record) in records.iter().enumerate() {
            let future_record = FutureRecord {
                topic: channel,
                partition: None,
                payload: Some(record.payload.as_slice()),
                key: record.key.as_deref(),
                timestamp: record.timestamp,
                headers: Self::owned_headers(&record.headers),
            };

            match self.producer.send_result(future_record) {
                Ok(future) => handles.push((index, future)),
                Err((e, _)) => results.push((index, Err(ProduceError::Kafka(e)))),
            }
        }

        for (index, future) in handles {
            match future.await {
                Ok(Ok(_)) => results.push((index, Ok(()))),
                Ok(Err((e, _))) => results.push((index, Err(ProduceError::Kafka(e)))),
                Err(_) => results.push((index, Err(ProduceError::Canceled))),
            }
        }

        // Sort to return in passed-in order
        results.sort_by_key(|e| e.0);
        results.into_iter().map(|(_, r)| r).collect()
    }

    async fn flush(&self, timeout: Duration) -> Result<(), ProduceError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| ProduceError::Unavailable(e.to_string()))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use health::HealthRegistry;
    use rdkafka::mocking::MockCluster;
    use rdkafka::producer::DefaultProducerContext;
    use rdkafka::types::{RDKafkaApiKey, RDKafkaRespErr};

    fn start_on_mocked_cluster() -> (MockCluster<'static, DefaultProducerContext>, KafkaProducer) {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("rdkafka".to_string(), Duration::from_secs(30));
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        let config = KafkaConfig {
            kafka_producer_linger_ms: 0,
            kafka_producer_queue_mib: 50,
            kafka_producer_queue_messages: 1000,
            kafka_message_timeout_ms: 500,
            kafka_compression_codec: "none".to_string(),
            kafka_enable_idempotence: false,
            kafka_tls: false,
            kafka_hosts: cluster.bootstrap_servers(),
        };
        let producer = KafkaProducer::new(&config, handle).expect("failed to create producer");
        (cluster, producer)
    }

    fn record(key: &str) -> OutboundRecord {
        OutboundRecord {
            key: Some(key.to_string()),
            payload: br#"{"id":"1"}"#.to_vec(),
            headers: vec![("event-type".to_string(), "login".to_string())],
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn kafka_producer_error_handling() {
        let (cluster, producer) = start_on_mocked_cluster();

        // Wait for producer to be healthy, to keep kafka_message_timeout_ms short and tests faster
        for _ in 0..20 {
            if producer.send("raw", vec![record("a")]).await[0].is_ok() {
                break;
            }
        }

        let results = producer
            .send("raw", vec![record("a"), record("b"), record("c")])
            .await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(Result::is_ok));

        // Unretriable errors surface per record
        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_MSG_SIZE_TOO_LARGE; 1];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);
        let results = producer.send("raw", vec![record("a")]).await;
        assert!(matches!(results[0], Err(ProduceError::Kafka(_))));

        // Transient errors are retried internally
        cluster.clear_request_errors(RDKafkaApiKey::Produce);
        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_BROKER_NOT_AVAILABLE; 2];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);
        let results = producer.send("raw", vec![record("a"), record("b")]).await;
        assert!(results.iter().all(Result::is_ok));

        producer
            .flush(Duration::from_secs(1))
            .await
            .expect("failed to flush");
    }
}
