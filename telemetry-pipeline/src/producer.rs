use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_kafka::{ChannelProducer, ProduceError};
use futures::future::join_all;
use tracing::{error, info, warn};

use crate::batch::{BatchAccumulator, BatchConfig, BatchFailure, BatchProcessor};
use crate::dead_letter::{DeadLetterRecord, DeadLetterSink};
use crate::error::{BatchError, ProducerError};
use crate::event::{Envelope, Event};
use crate::metrics_consts::{
    EVENTS_SENT, EVENTS_SEND_FAILED, PRODUCER_BATCHES, PRODUCER_DEAD_LETTERED,
};
use crate::stats::{ProducerSnapshot, ProducerStats};

#[derive(Clone, Debug)]
pub struct ProducerConfig {
    pub batch: BatchConfig,
    /// Upper bound on waiting for the client queue to drain in `flush`
    pub flush_timeout: Duration,
}

/// Sends each accumulated batch as one request per destination channel.
struct ChannelBatchProcessor {
    client: Arc<dyn ChannelProducer>,
    stats: Arc<ProducerStats>,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
}

/// Splits a batch by channel, keeping each envelope's position in the batch.
fn group_by_channel(items: Vec<Envelope>) -> Vec<(String, Vec<(usize, Envelope)>)> {
    let mut groups: Vec<(String, Vec<(usize, Envelope)>)> = Vec::new();
    for (index, envelope) in items.into_iter().enumerate() {
        match groups.iter_mut().find(|(channel, _)| *channel == envelope.channel) {
            Some((_, group)) => group.push((index, envelope)),
            None => groups.push((envelope.channel.clone(), vec![(index, envelope)])),
        }
    }
    groups
}

impl ChannelBatchProcessor {
    async fn send_group(
        &self,
        channel: String,
        envelopes: Vec<(usize, Envelope)>,
    ) -> Vec<((usize, Envelope), Result<(), ProduceError>)> {
        let records = envelopes.iter().map(|(_, e)| e.to_record()).collect();
        let mut results = self.client.send(&channel, records).await.into_iter();
        envelopes
            .into_iter()
            .map(|envelope| {
                let result = results.next().unwrap_or_else(|| {
                    Err(ProduceError::Unavailable(format!(
                        "no delivery report from {channel}"
                    )))
                });
                (envelope, result)
            })
            .collect()
    }
}

#[async_trait]
impl BatchProcessor<Envelope> for ChannelBatchProcessor {
    async fn process_batch(&self, items: Vec<Envelope>) -> Result<(), BatchFailure<Envelope>> {
        let total = items.len();
        self.stats.record_batch();
        metrics::counter!(PRODUCER_BATCHES).increment(1);

        let groups = group_by_channel(items);
        let sends = groups
            .into_iter()
            .map(|(channel, envelopes)| self.send_group(channel, envelopes));

        let mut failed: Vec<(usize, Envelope)> = Vec::new();
        let mut last_error = None;
        for outcomes in join_all(sends).await {
            for ((index, envelope), result) in outcomes {
                match result {
                    Ok(()) => {
                        self.stats.record_sent(1);
                        metrics::counter!(EVENTS_SENT, "channel" => envelope.channel.clone())
                            .increment(1);
                    }
                    Err(e) => {
                        self.stats.record_failed(1);
                        metrics::counter!(EVENTS_SEND_FAILED, "channel" => envelope.channel.clone())
                            .increment(1);
                        last_error = Some(format!("{}: {}", envelope.channel, e));
                        failed.push((index, envelope));
                    }
                }
            }
        }

        let Some(reason) = last_error else {
            return Ok(());
        };
        failed.sort_by_key(|(index, _)| *index);
        let retry: Vec<Envelope> = failed.into_iter().map(|(_, envelope)| envelope).collect();
        warn!(failed = retry.len(), total, "send failed for part of the batch: {}", reason);
        Err(BatchFailure {
            error: BatchError::Partial {
                failed: retry.len(),
                total,
                reason,
            },
            retry,
        })
    }

    async fn on_exhausted(&self, items: Vec<Envelope>, error: BatchError) {
        let Some(sink) = &self.dead_letter else {
            error!(dropped = items.len(), %error, "no dead-letter channel configured, dropping events");
            return;
        };
        let reason = error.to_string();
        for envelope in items {
            let channel = envelope.channel.clone();
            match sink
                .publish(DeadLetterRecord::from_envelope(&envelope, &reason))
                .await
            {
                Ok(()) => {
                    self.stats.record_dead_lettered(1);
                    metrics::counter!(PRODUCER_DEAD_LETTERED, "channel" => channel).increment(1);
                }
                Err(e) => {
                    error!(channel = %channel, key = %envelope.key, "event lost, dead-letter publish failed: {}", e);
                }
            }
        }
    }
}

/// Batching event producer shared by every pipeline of a process.
pub struct EventProducer {
    client: Arc<dyn ChannelProducer>,
    accumulator: BatchAccumulator<Envelope>,
    connected: AtomicBool,
    stats: Arc<ProducerStats>,
    flush_timeout: Duration,
}

impl EventProducer {
    /// Must be called from within a tokio runtime. Envelopes that exhaust the
    /// retry policy go to `dead_letter` when one is given.
    pub fn new(
        client: Arc<dyn ChannelProducer>,
        config: ProducerConfig,
        dead_letter: Option<Arc<dyn DeadLetterSink>>,
    ) -> Self {
        let stats = Arc::new(ProducerStats::default());
        let processor = Arc::new(ChannelBatchProcessor {
            client: client.clone(),
            stats: stats.clone(),
            dead_letter,
        });
        Self {
            client,
            accumulator: BatchAccumulator::new(config.batch, processor),
            connected: AtomicBool::new(false),
            stats,
            flush_timeout: config.flush_timeout,
        }
    }

    pub async fn connect(&self) -> Result<(), ProducerError> {
        self.client.connect().await?;
        self.connected.store(true, Ordering::SeqCst);
        info!("producer connected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Queues `event` for `channel`. Returns once the event is accepted into the
    /// current batch, not once the broker has acknowledged it; use `flush` for that.
    pub fn send_event(
        &self,
        channel: &str,
        event: &Event,
        key: Option<&str>,
    ) -> Result<(), ProducerError> {
        if !self.is_connected() {
            return Err(ProducerError::NotConnected);
        }
        self.accumulator.add(Envelope::wrap(channel, event, key)?);
        Ok(())
    }

    /// Delivers everything accepted so far and waits for broker acknowledgement.
    pub async fn flush(&self) -> Result<(), ProducerError> {
        self.accumulator.flush().await?;
        self.client.flush(self.flush_timeout).await?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<(), ProducerError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let result = self.flush().await;
        self.accumulator.shutdown().await;
        match &result {
            Ok(()) => info!("producer disconnected"),
            Err(e) => error!(pending = self.accumulator.pending(), "producer disconnected with undelivered events: {}", e),
        }
        result
    }

    pub fn stats(&self) -> ProducerSnapshot {
        self.stats.snapshot(self.accumulator.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::ChannelDeadLetterSink;
    use crate::event::{HEADER_EVENT_SEVERITY, HEADER_EVENT_TYPE};
    use crate::retry::RetryPolicy;
    use common_kafka::memory::MemoryBroker;

    fn config(batch_size: usize, max_attempts: Option<u32>) -> ProducerConfig {
        ProducerConfig {
            batch: BatchConfig {
                name: "producer".to_string(),
                batch_size,
                batch_timeout: Duration::from_secs(3600),
                retry: RetryPolicy::new(2, Duration::from_millis(50), None)
                    .with_max_attempts(max_attempts),
            },
            flush_timeout: Duration::from_secs(1),
        }
    }

    fn event(id: &str) -> Event {
        Event::new(id, "process_start", "medium", "edr")
    }

    #[tokio::test]
    async fn test_send_requires_connect() {
        let broker = MemoryBroker::new(1);
        let producer = EventProducer::new(Arc::new(broker), config(10, None), None);

        assert!(matches!(
            producer.send_event("out", &event("a"), None),
            Err(ProducerError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_batch_is_grouped_by_channel() {
        let broker = MemoryBroker::new(1);
        let producer = EventProducer::new(Arc::new(broker.clone()), config(100, None), None);
        producer.connect().await.unwrap();

        producer.send_event("alerts", &event("a"), None).unwrap();
        producer.send_event("enriched", &event("b"), None).unwrap();
        producer.send_event("alerts", &event("c"), Some("host-1")).unwrap();
        producer.flush().await.unwrap();

        let alerts = broker.messages("alerts");
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].key.as_deref(), Some(b"a".as_slice()));
        assert_eq!(alerts[1].key.as_deref(), Some(b"host-1".as_slice()));
        assert_eq!(alerts[0].header(HEADER_EVENT_TYPE), Some("process_start"));
        assert_eq!(alerts[0].header(HEADER_EVENT_SEVERITY), Some("medium"));
        assert_eq!(broker.message_count("enriched"), 1);

        let stats = producer.stats();
        assert_eq!(stats.sent, 3);
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_failed_channel_is_requeued_alone() {
        let broker = MemoryBroker::new(1);
        let producer = EventProducer::new(Arc::new(broker.clone()), config(100, None), None);
        producer.connect().await.unwrap();

        producer.send_event("first", &event("a"), None).unwrap();
        producer.send_event("second", &event("b"), None).unwrap();
        producer.send_event("first", &event("c"), None).unwrap();

        // the first channel group sent is the one that fails
        broker.fail_next_sends(1);
        assert!(matches!(
            producer.flush().await,
            Err(ProducerError::Flush(BatchError::Partial { failed: 2, total: 3, .. }))
        ));
        assert_eq!(producer.stats().pending, 2);
        assert_eq!(broker.message_count("second"), 1);

        producer.flush().await.unwrap();
        let first: Vec<_> = broker
            .messages("first")
            .into_iter()
            .map(|m| m.key.unwrap_or_default())
            .collect();
        assert_eq!(first, vec![b"a".to_vec(), b"c".to_vec()]);
        assert_eq!(broker.message_count("second"), 1);

        let stats = producer.stats();
        assert_eq!(stats.sent, 3);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.flush_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_events_are_dead_lettered() {
        let broker = MemoryBroker::new(1);
        let client: Arc<dyn ChannelProducer> = Arc::new(broker.clone());
        let sink = ChannelDeadLetterSink::new(
            client.clone(),
            "dead-letter",
            RetryPolicy::new(2, Duration::from_millis(10), None),
        );
        let producer = EventProducer::new(client, config(100, Some(1)), Some(Arc::new(sink)));
        producer.connect().await.unwrap();

        producer.send_event("out", &event("a"), None).unwrap();
        broker.fail_next_sends(1);
        producer.flush().await.unwrap();

        assert_eq!(broker.message_count("out"), 0);
        let dead = broker.messages("dead-letter");
        assert_eq!(dead.len(), 1);
        let record: DeadLetterRecord =
            serde_json::from_slice(dead[0].payload.as_deref().unwrap()).unwrap();
        assert_eq!(record.original_channel, "out");
        assert_eq!(record.original_key.as_deref(), Some("a"));
        assert_eq!(producer.stats().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_disconnect_flushes_pending_events() {
        let broker = MemoryBroker::new(1);
        let producer = EventProducer::new(Arc::new(broker.clone()), config(100, None), None);
        producer.connect().await.unwrap();

        producer.send_event("out", &event("a"), None).unwrap();
        producer.disconnect().await.unwrap();

        assert_eq!(broker.message_count("out"), 1);
        assert!(!producer.is_connected());
        assert!(matches!(
            producer.send_event("out", &event("b"), None),
            Err(ProducerError::NotConnected)
        ));
    }
}
