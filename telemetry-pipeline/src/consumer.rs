use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use common_kafka::{ChannelConsumer, ChannelMessage};
use futures::FutureExt;
use health::HealthHandle;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dead_letter::{DeadLetterRecord, DeadLetterSink};
use crate::dedup::Deduplicator;
use crate::error::{ConsumerError, DeadLetterError};
use crate::event::Event;
use crate::metrics_consts::{
    CONSUMER_BATCH_DURATION_MS, CONSUMER_BATCH_SIZE, CONSUMER_COMMITS, CONSUMER_COMMIT_FAILURES,
    CONSUMER_DEAD_LETTERED, CONSUMER_DUPLICATES, CONSUMER_HANDLER_DURATION_MS,
    CONSUMER_HANDLER_ERRORS, CONSUMER_IN_FLIGHT, CONSUMER_MESSAGES_PROCESSED,
    CONSUMER_MESSAGES_RECEIVED,
};
use crate::offset_tracker::OffsetTracker;
use crate::stats::{ConsumerSnapshot, ConsumerStats};

#[derive(Clone, Debug)]
pub struct EventConsumerConfig {
    /// Pipeline name, used as the metrics label
    pub name: String,
    /// Most messages pulled per poll
    pub batch_size: usize,
    pub poll_timeout: Duration,
    /// Handler invocations allowed in flight at once
    pub max_concurrency: usize,
    /// How often to signal liveness while a batch is still settling
    pub heartbeat_interval: Duration,
    /// A handler running longer than this is treated as failed
    pub handler_timeout: Duration,
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> anyhow::Result<()>;

    /// Runs once a batch has settled, right before its offsets are committed.
    /// An error skips the commit; the offsets are retried on the next poll.
    async fn before_commit(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct HandlerOutcome {
    message: ChannelMessage,
    result: anyhow::Result<()>,
    elapsed: Duration,
}

/// Clears the running flag even when `run` is dropped mid-batch.
struct RunningGuard<'a>(&'a watch::Sender<bool>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

/// Pulls batches from one consumer group and dispatches them to a handler.
///
/// Offsets are only committed once every message before them on the same
/// partition was either handled or written to the dead-letter sink.
pub struct EventConsumer {
    config: EventConsumerConfig,
    client: Arc<dyn ChannelConsumer>,
    dedup: Arc<Deduplicator>,
    dead_letter: Arc<dyn DeadLetterSink>,
    liveness: Option<HealthHandle>,
    stats: Arc<ConsumerStats>,
    connected: AtomicBool,
    subscribed: AtomicBool,
    shutdown: CancellationToken,
    running: watch::Sender<bool>,
}

impl EventConsumer {
    pub fn new(
        config: EventConsumerConfig,
        client: Arc<dyn ChannelConsumer>,
        dedup: Arc<Deduplicator>,
        dead_letter: Arc<dyn DeadLetterSink>,
    ) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            config,
            client,
            dedup,
            dead_letter,
            liveness: None,
            stats: Arc::new(ConsumerStats::default()),
            connected: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            running,
        }
    }

    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub async fn connect(&self) -> Result<(), ConsumerError> {
        self.client.connect().await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn subscribe(&self, channels: &[String]) -> Result<(), ConsumerError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConsumerError::NotConnected);
        }
        self.client.subscribe(channels)?;
        self.subscribed.store(!channels.is_empty(), Ordering::SeqCst);
        info!(pipeline = %self.config.name, ?channels, "subscribed");
        Ok(())
    }

    /// Consumes until `disconnect` is called or a fatal error occurs. A batch
    /// that has started always settles before this returns.
    pub async fn run(&self, handler: Arc<dyn EventHandler>) -> Result<(), ConsumerError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ConsumerError::NotConnected);
        }
        if !self.subscribed.load(Ordering::SeqCst) {
            return Err(ConsumerError::NotSubscribed);
        }
        if self.running.send_replace(true) {
            return Err(ConsumerError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.running);

        let mut tracker = OffsetTracker::new();
        loop {
            self.report_healthy();

            let messages = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                batch = self.client.recv_batch(self.config.batch_size, self.config.poll_timeout) => batch?,
            };
            if messages.is_empty() {
                // picks up offsets a failed settle left uncommitted
                self.commit(&handler, &mut tracker).await;
                continue;
            }
            self.process_batch(&handler, messages, &mut tracker).await?;
        }

        info!(pipeline = %self.config.name, "consumer loop stopped");
        Ok(())
    }

    pub fn pause(&self) -> Result<(), ConsumerError> {
        self.client.pause()?;
        info!(pipeline = %self.config.name, "consumer paused");
        Ok(())
    }

    pub fn resume(&self) -> Result<(), ConsumerError> {
        self.client.resume()?;
        info!(pipeline = %self.config.name, "consumer resumed");
        Ok(())
    }

    /// Stops polling, waits for the batch in flight to settle, then leaves the group.
    pub async fn disconnect(&self) {
        self.shutdown.cancel();
        let mut running = self.running.subscribe();
        if let Err(e) = running.wait_for(|running| !*running).await {
            warn!(pipeline = %self.config.name, "could not wait for the consumer loop: {}", e);
        }
        self.client.close().await;
        self.connected.store(false, Ordering::SeqCst);
        self.subscribed.store(false, Ordering::SeqCst);
        info!(pipeline = %self.config.name, "consumer disconnected");
    }

    pub fn stats(&self) -> ConsumerSnapshot {
        self.stats.snapshot()
    }

    fn report_healthy(&self) {
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy();
        }
    }

    async fn process_batch(
        &self,
        handler: &Arc<dyn EventHandler>,
        messages: Vec<ChannelMessage>,
        tracker: &mut OffsetTracker,
    ) -> Result<(), ConsumerError> {
        let name = self.config.name.clone();
        let started = Instant::now();
        let received = messages.len();
        self.stats.record_consumed(received as u64);
        metrics::counter!(CONSUMER_MESSAGES_RECEIVED, "pipeline" => name.clone())
            .increment(received as u64);
        metrics::histogram!(CONSUMER_BATCH_SIZE, "pipeline" => name.clone()).record(received as f64);

        for message in &messages {
            tracker.track(&message.partition, message.offset);
        }

        let mut heartbeat = interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut tasks: JoinSet<HandlerOutcome> = JoinSet::new();
        let mut fatal: Option<DeadLetterError> = None;

        for message in messages {
            let payload = message.payload.as_deref().unwrap_or_default();
            let event = match Event::from_payload(payload) {
                Ok(event) => event,
                Err(e) => {
                    let error = anyhow::Error::new(e).context("failed to decode event");
                    if let Err(e) = self
                        .settle(message, Err(error), tracker, &mut heartbeat)
                        .await
                    {
                        fatal = Some(e);
                        break;
                    }
                    continue;
                }
            };

            if self.dedup.is_duplicate(&event) {
                self.stats.record_duplicate();
                metrics::counter!(CONSUMER_DUPLICATES, "pipeline" => name.clone()).increment(1);
                debug!(pipeline = %name, id = %event.id, "dropping duplicate event");
                tracker.resolve(&message.partition, message.offset);
                continue;
            }

            // wait for a free slot before starting another handler
            while tasks.len() >= self.config.max_concurrency {
                let Some(outcome) = self.next_settled(&mut tasks, &mut heartbeat).await? else {
                    break;
                };
                if let Err(e) = self.settle_outcome(outcome, tracker, &mut heartbeat).await {
                    fatal = Some(e);
                    break;
                }
            }
            if fatal.is_some() {
                break;
            }

            let handler = handler.clone();
            let timeout = self.config.handler_timeout;
            tasks.spawn(async move {
                let started = Instant::now();
                let result = invoke_handler(handler, event, timeout).await;
                HandlerOutcome {
                    message,
                    result,
                    elapsed: started.elapsed(),
                }
            });
            metrics::gauge!(CONSUMER_IN_FLIGHT, "pipeline" => name.clone()).set(tasks.len() as f64);
        }

        while let Some(outcome) = self.next_settled(&mut tasks, &mut heartbeat).await? {
            if let Err(e) = self.settle_outcome(outcome, tracker, &mut heartbeat).await {
                if fatal.is_none() {
                    fatal = Some(e);
                }
            }
        }
        metrics::gauge!(CONSUMER_IN_FLIGHT, "pipeline" => name.clone()).set(0.0);

        self.commit(handler, tracker).await;
        metrics::histogram!(CONSUMER_BATCH_DURATION_MS, "pipeline" => name.clone())
            .record(started.elapsed().as_millis() as f64);

        match fatal {
            Some(e) => {
                error!(
                    pipeline = %name,
                    unresolved = tracker.outstanding(),
                    "stopping consumer, dead-letter path is down: {}",
                    e
                );
                Err(e.into())
            }
            None => Ok(()),
        }
    }

    /// Waits for the next handler to finish, heartbeating in the meantime.
    /// Returns `None` once nothing is in flight.
    async fn next_settled(
        &self,
        tasks: &mut JoinSet<HandlerOutcome>,
        heartbeat: &mut Interval,
    ) -> Result<Option<HandlerOutcome>, ConsumerError> {
        loop {
            tokio::select! {
                joined = tasks.join_next() => {
                    return match joined {
                        None => Ok(None),
                        Some(Ok(outcome)) => Ok(Some(outcome)),
                        Some(Err(e)) => Err(ConsumerError::Join(e.to_string())),
                    };
                }
                _ = heartbeat.tick() => self.beat(),
            }
        }
    }

    fn beat(&self) {
        self.client.heartbeat();
        self.report_healthy();
    }

    async fn settle_outcome(
        &self,
        outcome: HandlerOutcome,
        tracker: &mut OffsetTracker,
        heartbeat: &mut Interval,
    ) -> Result<(), DeadLetterError> {
        metrics::histogram!(CONSUMER_HANDLER_DURATION_MS, "pipeline" => self.config.name.clone())
            .record(outcome.elapsed.as_millis() as f64);
        self.settle(outcome.message, outcome.result, tracker, heartbeat)
            .await
    }

    /// Resolves the message's offset once it is processed or safely dead-lettered.
    /// A message the dead-letter sink refused stays unresolved. Keeps heartbeating
    /// while the sink retries.
    async fn settle(
        &self,
        message: ChannelMessage,
        result: anyhow::Result<()>,
        tracker: &mut OffsetTracker,
        heartbeat: &mut Interval,
    ) -> Result<(), DeadLetterError> {
        let name = &self.config.name;
        match result {
            Ok(()) => {
                self.stats.record_processed();
                metrics::counter!(CONSUMER_MESSAGES_PROCESSED, "pipeline" => name.clone())
                    .increment(1);
            }
            Err(error) => {
                self.stats.record_error();
                metrics::counter!(CONSUMER_HANDLER_ERRORS, "pipeline" => name.clone()).increment(1);
                let reason = format!("{error:#}");
                warn!(
                    pipeline = %name,
                    topic = message.topic(),
                    partition = message.partition.partition_number(),
                    offset = message.offset,
                    "message failed, sending to dead-letter: {}",
                    reason
                );
                let publish = self
                    .dead_letter
                    .publish(DeadLetterRecord::from_message(&message, &reason));
                tokio::pin!(publish);
                loop {
                    tokio::select! {
                        published = &mut publish => break published?,
                        _ = heartbeat.tick() => self.beat(),
                    }
                }
                self.stats.record_dead_lettered();
                metrics::counter!(CONSUMER_DEAD_LETTERED, "pipeline" => name.clone()).increment(1);
            }
        }
        tracker.resolve(&message.partition, message.offset);
        Ok(())
    }

    async fn commit(&self, handler: &Arc<dyn EventHandler>, tracker: &mut OffsetTracker) {
        let name = &self.config.name;
        let offsets = tracker.committable();
        if offsets.is_empty() {
            return;
        }
        if let Err(e) = handler.before_commit().await {
            warn!(pipeline = %name, "skipping commit, batch did not settle downstream: {:#}", e);
            return;
        }
        match self.client.commit(&offsets) {
            Ok(()) => {
                tracker.mark_committed(&offsets);
                self.stats.record_commit();
                metrics::counter!(CONSUMER_COMMITS, "pipeline" => name.clone()).increment(1);
            }
            Err(e) => {
                // retried with the next batch
                metrics::counter!(CONSUMER_COMMIT_FAILURES, "pipeline" => name.clone())
                    .increment(1);
                warn!(pipeline = %name, "failed to commit offsets: {}", e);
            }
        }
    }
}

async fn invoke_handler(
    handler: Arc<dyn EventHandler>,
    event: Event,
    timeout: Duration,
) -> anyhow::Result<()> {
    let call = AssertUnwindSafe(handler.handle(event)).catch_unwind();
    match tokio::time::timeout(timeout, call).await {
        Err(_) => Err(anyhow!("handler timed out after {}ms", timeout.as_millis())),
        Ok(Err(panic)) => Err(anyhow!("handler panicked: {}", panic_message(panic.as_ref()))),
        Ok(Ok(result)) => result,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::ChannelDeadLetterSink;
    use crate::event::Envelope;
    use crate::retry::RetryPolicy;
    use common_kafka::memory::{MemoryBroker, MemoryConsumer};
    use common_kafka::{ChannelProducer, OutboundRecord, Partition, ProduceError};
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        handled: Mutex<Vec<String>>,
        fail: HashSet<String>,
        panic: HashSet<String>,
        slow: HashSet<String>,
        refuse_commit: bool,
    }

    #[async_trait]
    impl EventHandler for Recording {
        async fn handle(&self, event: Event) -> anyhow::Result<()> {
            if self.slow.contains(&event.id) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if self.panic.contains(&event.id) {
                panic!("bad event {}", event.id);
            }
            if self.fail.contains(&event.id) {
                anyhow::bail!("cannot handle {}", event.id);
            }
            self.handled.lock().unwrap().push(event.id);
            Ok(())
        }

        async fn before_commit(&self) -> anyhow::Result<()> {
            if self.refuse_commit {
                anyhow::bail!("downstream flush failed");
            }
            Ok(())
        }
    }

    struct DownSink;

    #[async_trait]
    impl DeadLetterSink for DownSink {
        async fn publish(&self, _record: DeadLetterRecord) -> Result<(), DeadLetterError> {
            Err(DeadLetterError::Unavailable {
                channel: "dead-letter".to_string(),
                attempts: 1,
                source: ProduceError::Unavailable("down".to_string()),
            })
        }
    }

    fn config() -> EventConsumerConfig {
        EventConsumerConfig {
            name: "test".to_string(),
            batch_size: 50,
            poll_timeout: Duration::from_millis(20),
            max_concurrency: 4,
            heartbeat_interval: Duration::from_millis(20),
            handler_timeout: Duration::from_millis(200),
        }
    }

    fn event(id: &str) -> Event {
        Event::new(id, "login", "low", "edr")
    }

    async fn publish(broker: &MemoryBroker, events: &[Event]) {
        let records: Vec<OutboundRecord> = events
            .iter()
            .map(|e| Envelope::wrap("in", e, Some("same-key")).unwrap().to_record())
            .collect();
        for result in broker.send("in", records).await {
            result.unwrap();
        }
    }

    async fn publish_raw(broker: &MemoryBroker, payload: &[u8]) {
        let record = OutboundRecord {
            key: Some("same-key".to_string()),
            payload: payload.to_vec(),
            headers: Vec::new(),
            timestamp: None,
        };
        broker.send("in", vec![record]).await[0].as_ref().unwrap();
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    async fn start(
        broker: &MemoryBroker,
        sink: Arc<dyn DeadLetterSink>,
        handler: Arc<Recording>,
    ) -> (
        Arc<EventConsumer>,
        Arc<MemoryConsumer>,
        tokio::task::JoinHandle<Result<(), ConsumerError>>,
    ) {
        let client = Arc::new(broker.consumer("group"));
        let consumer = Arc::new(EventConsumer::new(
            config(),
            client.clone(),
            Arc::new(Deduplicator::new("test", Duration::from_secs(300))),
            sink,
        ));
        consumer.connect().await.unwrap();
        consumer.subscribe(&["in".to_string()]).unwrap();
        let runner = consumer.clone();
        let run = tokio::spawn(async move { runner.run(handler).await });
        (consumer, client, run)
    }

    fn channel_sink(broker: &MemoryBroker) -> Arc<dyn DeadLetterSink> {
        Arc::new(ChannelDeadLetterSink::new(
            Arc::new(broker.clone()),
            "dead-letter",
            RetryPolicy::default().with_max_attempts(Some(3)),
        ))
    }

    fn committed(broker: &MemoryBroker) -> Option<i64> {
        broker.committed_offset("group", &Partition::new("in".to_string(), 0))
    }

    #[tokio::test]
    async fn test_run_requires_connect_and_subscribe() {
        let broker = MemoryBroker::new(1);
        let consumer = EventConsumer::new(
            config(),
            Arc::new(broker.consumer("group")),
            Arc::new(Deduplicator::new("test", Duration::from_secs(1))),
            channel_sink(&broker),
        );
        let handler = Arc::new(Recording::default());

        assert!(matches!(
            consumer.run(handler.clone()).await,
            Err(ConsumerError::NotConnected)
        ));
        consumer.connect().await.unwrap();
        assert!(matches!(
            consumer.run(handler).await,
            Err(ConsumerError::NotSubscribed)
        ));
    }

    #[tokio::test]
    async fn test_failures_are_dead_lettered_and_committed_past() {
        let broker = MemoryBroker::new(1);
        let handler = Arc::new(Recording {
            fail: HashSet::from(["b".to_string()]),
            ..Default::default()
        });
        publish(&broker, &[event("a")]).await;
        publish_raw(&broker, b"not json").await;
        publish(&broker, &[event("b"), event("c")]).await;

        let (consumer, _, run) = start(&broker, channel_sink(&broker), handler.clone()).await;
        wait_until(|| committed(&broker) == Some(4)).await;
        consumer.disconnect().await;
        run.await.unwrap().unwrap();

        let mut handled = handler.handled.lock().unwrap().clone();
        handled.sort();
        assert_eq!(handled, vec!["a", "c"]);

        let dead = broker.messages("dead-letter");
        assert_eq!(dead.len(), 2);
        let records: Vec<DeadLetterRecord> = dead
            .iter()
            .map(|m| serde_json::from_slice(m.payload.as_deref().unwrap()).unwrap())
            .collect();
        let mut offsets: Vec<_> = records.iter().map(|r| r.original_offset).collect();
        offsets.sort();
        assert_eq!(offsets, vec![Some(1), Some(2)]);
        assert!(records
            .iter()
            .any(|r| r.error_message.starts_with("failed to decode event")));

        let stats = consumer.stats();
        assert_eq!(stats.consumed, 4);
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.dead_lettered, 2);
    }

    #[tokio::test]
    async fn test_slow_and_panicking_handlers_become_failures() {
        let broker = MemoryBroker::new(1);
        let handler = Arc::new(Recording {
            slow: HashSet::from(["slow".to_string()]),
            panic: HashSet::from(["boom".to_string()]),
            ..Default::default()
        });
        publish(&broker, &[event("slow"), event("boom"), event("fine")]).await;

        let (consumer, _, run) = start(&broker, channel_sink(&broker), handler.clone()).await;
        wait_until(|| committed(&broker) == Some(3)).await;
        consumer.disconnect().await;
        run.await.unwrap().unwrap();

        let mut reasons: Vec<String> = broker
            .messages("dead-letter")
            .iter()
            .map(|m| {
                let record: DeadLetterRecord =
                    serde_json::from_slice(m.payload.as_deref().unwrap()).unwrap();
                record.error_message
            })
            .collect();
        reasons.sort();
        assert_eq!(
            reasons,
            vec![
                "handler panicked: bad event boom".to_string(),
                "handler timed out after 200ms".to_string(),
            ]
        );
        assert_eq!(*handler.handled.lock().unwrap(), vec!["fine"]);
    }

    #[tokio::test]
    async fn test_duplicates_never_reach_the_handler() {
        let broker = MemoryBroker::new(1);
        let handler = Arc::new(Recording::default());
        let original = event("a");
        publish(&broker, &[original.clone(), original.clone(), event("b"), original]).await;

        let (consumer, _, run) = start(&broker, channel_sink(&broker), handler.clone()).await;
        wait_until(|| committed(&broker) == Some(4)).await;
        consumer.disconnect().await;
        run.await.unwrap().unwrap();

        assert_eq!(handler.handled.lock().unwrap().len(), 2);
        let stats = consumer.stats();
        assert_eq!(stats.duplicates, 2);
        assert_eq!(stats.processed, 2);
    }

    #[tokio::test]
    async fn test_refused_settle_skips_commit() {
        let broker = MemoryBroker::new(1);
        let handler = Arc::new(Recording {
            refuse_commit: true,
            ..Default::default()
        });
        publish(&broker, &[event("a"), event("b")]).await;

        let (consumer, _, run) = start(&broker, channel_sink(&broker), handler.clone()).await;
        wait_until(|| consumer.stats().processed == 2).await;
        consumer.disconnect().await;
        run.await.unwrap().unwrap();

        assert_eq!(committed(&broker), None);
        assert_eq!(consumer.stats().commits, 0);
    }

    struct FlakySettle {
        refusals: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for FlakySettle {
        async fn handle(&self, _event: Event) -> anyhow::Result<()> {
            Ok(())
        }

        async fn before_commit(&self) -> anyhow::Result<()> {
            let refused = self
                .refusals
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                anyhow::bail!("downstream flush failed");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_skipped_commit_is_retried_on_idle_poll() {
        let broker = MemoryBroker::new(1);
        publish(&broker, &[event("a"), event("b")]).await;

        let consumer = Arc::new(EventConsumer::new(
            config(),
            Arc::new(broker.consumer("group")),
            Arc::new(Deduplicator::new("test", Duration::from_secs(300))),
            channel_sink(&broker),
        ));
        consumer.connect().await.unwrap();
        consumer.subscribe(&["in".to_string()]).unwrap();
        let handler = Arc::new(FlakySettle {
            refusals: std::sync::atomic::AtomicUsize::new(2),
        });
        let runner = consumer.clone();
        let run = tokio::spawn(async move { runner.run(handler).await });

        wait_until(|| committed(&broker) == Some(2)).await;
        consumer.disconnect().await;
        run.await.unwrap().unwrap();
        assert_eq!(consumer.stats().commits, 1);
    }

    #[tokio::test]
    async fn test_dead_letter_outage_is_fatal_after_committing_prefix() {
        let broker = MemoryBroker::new(1);
        let handler = Arc::new(Recording {
            fail: HashSet::from(["b".to_string()]),
            ..Default::default()
        });
        publish(&broker, &[event("a"), event("b"), event("c")]).await;

        let client = Arc::new(broker.consumer("group"));
        let consumer = EventConsumer::new(
            EventConsumerConfig {
                max_concurrency: 1,
                ..config()
            },
            client,
            Arc::new(Deduplicator::new("test", Duration::from_secs(300))),
            Arc::new(DownSink),
        );
        consumer.connect().await.unwrap();
        consumer.subscribe(&["in".to_string()]).unwrap();

        let result = consumer.run(handler.clone()).await;
        assert!(matches!(result, Err(ConsumerError::DeadLetter(_))));
        assert_eq!(committed(&broker), Some(1));
        assert_eq!(*handler.handled.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_dead_letter_outage_commits_below_first_unsettled_offset() {
        let broker = MemoryBroker::new(1);
        let handler = Arc::new(Recording {
            fail: HashSet::from(["b".to_string()]),
            ..Default::default()
        });
        publish(&broker, &[event("a"), event("b"), event("c")]).await;

        let consumer = EventConsumer::new(
            config(),
            Arc::new(broker.consumer("group")),
            Arc::new(Deduplicator::new("test", Duration::from_secs(300))),
            Arc::new(DownSink),
        );
        consumer.connect().await.unwrap();
        consumer.subscribe(&["in".to_string()]).unwrap();

        let result = consumer.run(handler.clone()).await;
        assert!(matches!(result, Err(ConsumerError::DeadLetter(_))));
        assert_eq!(committed(&broker), Some(1));

        let mut handled = handler.handled.lock().unwrap().clone();
        handled.sort();
        assert_eq!(handled, vec!["a", "c"]);
    }

    /// Takes `delay` to accept each record and records the consumer heartbeats seen meanwhile.
    struct SlowSink {
        client: Arc<MemoryConsumer>,
        delay: Duration,
        heartbeats_during_publish: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl DeadLetterSink for SlowSink {
        async fn publish(&self, _record: DeadLetterRecord) -> Result<(), DeadLetterError> {
            let before = self.client.heartbeats();
            tokio::time::sleep(self.delay).await;
            let during = self.client.heartbeats() - before;
            self.heartbeats_during_publish.lock().unwrap().push(during);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_heartbeats_while_dead_letter_sink_retries() {
        let broker = MemoryBroker::new(1);
        let handler = Arc::new(Recording {
            fail: HashSet::from(["a".to_string()]),
            ..Default::default()
        });
        publish(&broker, &[event("a")]).await;
        publish_raw(&broker, b"not json").await;

        let client = Arc::new(broker.consumer("group"));
        let sink = Arc::new(SlowSink {
            client: client.clone(),
            delay: Duration::from_millis(200),
            heartbeats_during_publish: Mutex::new(Vec::new()),
        });
        let consumer = Arc::new(EventConsumer::new(
            config(),
            client,
            Arc::new(Deduplicator::new("test", Duration::from_secs(300))),
            sink.clone(),
        ));
        consumer.connect().await.unwrap();
        consumer.subscribe(&["in".to_string()]).unwrap();
        let runner = consumer.clone();
        let run = tokio::spawn(async move { runner.run(handler).await });

        wait_until(|| committed(&broker) == Some(2)).await;
        consumer.disconnect().await;
        run.await.unwrap().unwrap();

        // one handler failure and one undecodable payload, 20ms heartbeat interval
        let during = sink.heartbeats_during_publish.lock().unwrap().clone();
        assert_eq!(during.len(), 2);
        for beats in during {
            assert!(beats >= 5, "{beats}");
        }
        assert_eq!(consumer.stats().dead_lettered, 2);
    }

    #[tokio::test]
    async fn test_heartbeats_while_handlers_run() {
        let broker = MemoryBroker::new(1);
        let handler = Arc::new(Recording {
            slow: HashSet::from(["slow".to_string()]),
            ..Default::default()
        });
        publish(&broker, &[event("slow")]).await;

        let (consumer, client, run) = start(&broker, channel_sink(&broker), handler).await;
        wait_until(|| committed(&broker) == Some(1)).await;
        consumer.disconnect().await;
        run.await.unwrap().unwrap();

        // 200ms handler timeout, 20ms heartbeat interval
        assert!(client.heartbeats() >= 5, "{}", client.heartbeats());
    }
}
