#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Once;
use std::time::Duration;

use anyhow::bail;
use common_kafka::memory::MemoryBroker;
use common_kafka::ChannelProducer;
use telemetry_pipeline::batch::BatchConfig;
use telemetry_pipeline::event::{Envelope, Event};
use telemetry_pipeline::orchestrator::{
    BrokerClients, Orchestrator, OrchestratorConfig, PipelineStages, TopicSettings, Topics,
};
use telemetry_pipeline::processor::ProcessorSettings;
use telemetry_pipeline::producer::ProducerConfig;
use telemetry_pipeline::retry::RetryPolicy;

pub const RAW: &str = "security-events-raw";
pub const ENRICHED: &str = "security-events-enriched";
pub const ALERTS: &str = "security-alerts";
pub const METRICS: &str = "security-metrics";
pub const DEAD_LETTER: &str = "security-events-dlq";

static TRACING_INIT: Once = Once::new();
pub fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::TestWriter::new())
            .init()
    });
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(2, Duration::from_millis(10), Some(Duration::from_millis(100)))
}

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        topics: Topics {
            raw_events: RAW.to_string(),
            enriched_events: ENRICHED.to_string(),
            alerts: ALERTS.to_string(),
            metrics: METRICS.to_string(),
            dead_letter: DEAD_LETTER.to_string(),
        },
        topic_settings: TopicSettings {
            partitions: 3,
            replication_factor: 1,
            retention_ms: 86_400_000,
            min_insync_replicas: 1,
        },
        producer: ProducerConfig {
            batch: BatchConfig {
                name: "producer".to_string(),
                batch_size: 50,
                batch_timeout: Duration::from_millis(20),
                retry: fast_retry(),
            },
            flush_timeout: Duration::from_secs(1),
        },
        dead_letter_retry: fast_retry().with_max_attempts(Some(5)),
        processor: ProcessorSettings {
            batch_size: 100,
            poll_timeout: Duration::from_millis(20),
            max_concurrency: 8,
            heartbeat_interval: Duration::from_millis(50),
            handler_timeout: Duration::from_secs(2),
            dedup_window: Duration::from_secs(300),
            dedup_sweep_interval: Duration::from_secs(60),
            liveness_deadline: Duration::from_secs(30),
        },
    }
}

pub async fn start_pipelines(broker: &MemoryBroker, stages: PipelineStages) -> Orchestrator {
    let orchestrator = Orchestrator::new(BrokerClients::memory(broker), test_config(), stages, None);
    orchestrator
        .start()
        .await
        .expect("failed to start pipelines");
    orchestrator
}

/// Writes events straight onto a channel, keyed by event id.
pub async fn publish(broker: &MemoryBroker, channel: &str, events: &[Event]) {
    let records = events
        .iter()
        .map(|event| {
            Envelope::wrap(channel, event, None)
                .expect("failed to wrap event")
                .to_record()
        })
        .collect();
    let results = broker.send(channel, records).await;
    assert!(results.iter().all(Result::is_ok), "failed to publish test events");
}

pub fn events_on(broker: &MemoryBroker, channel: &str) -> Vec<Event> {
    broker
        .messages(channel)
        .iter()
        .map(|message| {
            Event::from_payload(message.payload.as_deref().unwrap_or_default())
                .expect("channel holds an undecodable event")
        })
        .collect()
}

pub fn ids_on(broker: &MemoryBroker, channel: &str) -> HashSet<String> {
    events_on(broker, channel).into_iter().map(|e| e.id).collect()
}

pub fn login(id: &str, severity: &str) -> Event {
    Event::new(id, "login", severity, "edr-sensor").with_field("user", "alice")
}

/// Polls `condition` every 10ms until it holds or `within` elapses.
pub async fn wait_until<F>(within: Duration, mut condition: F) -> anyhow::Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {:?}", within);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}
