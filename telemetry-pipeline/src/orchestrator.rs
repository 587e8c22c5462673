use std::sync::Arc;

use common_kafka::admin::KafkaAdmin;
use common_kafka::config::{ConsumerConfig, KafkaConfig};
use common_kafka::kafka_consumer::KafkaConsumerFactory;
use common_kafka::kafka_producer::KafkaProducer;
use common_kafka::memory::MemoryBroker;
use common_kafka::{ChannelProducer, ConsumerFactory, TopicAdmin, TopicSpec};
use health::{HealthHandle, HealthRegistry};
use rdkafka::error::KafkaError;
use tracing::{info, warn};

use crate::dead_letter::{ChannelDeadLetterSink, DeadLetterSink};
use crate::error::PipelineError;
use crate::event::{Event, Severity};
use crate::processor::{PipelineDefinition, ProcessorSettings, StreamProcessor};
use crate::producer::{EventProducer, ProducerConfig};
use crate::retry::RetryPolicy;
use crate::stage::{
    add_field, filter_min_severity, filter_out_type, stage_sync, stamp_field, Stage, StageOutcome,
};
use crate::stats::PipelineMetrics;

/// The three broker-facing clients. The producer and admin connections are
/// shared; the factory hands every pipeline a consumer of its own.
#[derive(Clone)]
pub struct BrokerClients {
    pub producer: Arc<dyn ChannelProducer>,
    pub admin: Arc<dyn TopicAdmin>,
    pub consumers: Arc<dyn ConsumerFactory>,
}

impl BrokerClients {
    pub fn memory(broker: &MemoryBroker) -> Self {
        Self {
            producer: Arc::new(broker.clone()),
            admin: Arc::new(broker.clone()),
            consumers: Arc::new(broker.clone()),
        }
    }

    pub fn kafka(
        kafka: &KafkaConfig,
        consumer: &ConsumerConfig,
        producer_liveness: HealthHandle,
    ) -> Result<Self, KafkaError> {
        Ok(Self {
            producer: Arc::new(KafkaProducer::new(kafka, producer_liveness)?),
            admin: Arc::new(KafkaAdmin::new(kafka)?),
            consumers: Arc::new(KafkaConsumerFactory::new(kafka.clone(), consumer.clone())),
        })
    }
}

#[derive(Clone, Debug)]
pub struct Topics {
    pub raw_events: String,
    pub enriched_events: String,
    pub alerts: String,
    pub metrics: String,
    pub dead_letter: String,
}

/// Applied to topics this process creates; existing topics are never altered.
#[derive(Clone, Copy, Debug)]
pub struct TopicSettings {
    pub partitions: i32,
    pub replication_factor: i32,
    pub retention_ms: i64,
    pub min_insync_replicas: i32,
}

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub topics: Topics,
    pub topic_settings: TopicSettings,
    pub producer: ProducerConfig,
    pub dead_letter_retry: RetryPolicy,
    pub processor: ProcessorSettings,
}

/// Stage lists for the three pipelines. Collaborators append their own
/// lookups and thresholds to these.
#[derive(Clone)]
pub struct PipelineStages {
    pub enrichment: Vec<Arc<dyn Stage>>,
    pub alerting: Vec<Arc<dyn Stage>>,
    pub metrics: Vec<Arc<dyn Stage>>,
}

impl PipelineStages {
    pub fn with_min_alert_severity(min: Severity) -> Self {
        Self {
            enrichment: vec![
                filter_out_type("TEST"),
                stamp_field("enriched_at"),
                add_field("enriched", true),
            ],
            alerting: vec![filter_min_severity(min), add_field("alert", true)],
            metrics: vec![to_metric_sample()],
        }
    }
}

impl Default for PipelineStages {
    fn default() -> Self {
        Self::with_min_alert_severity(Severity::High)
    }
}

/// Reduces an event to the fields the metrics store aggregates on.
fn to_metric_sample() -> Arc<dyn Stage> {
    stage_sync("to_metric_sample", |event: Event| {
        let sample = Event::new(&event.id, "metric_sample", &event.severity, &event.source)
            .with_timestamp(event.timestamp)
            .with_field("metric", event.event_type.as_str())
            .with_field("value", 1);
        Ok(StageOutcome::Forward(sample))
    })
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    stages: PipelineStages,
    producer: Arc<EventProducer>,
    processor: StreamProcessor,
}

impl Orchestrator {
    /// Must be called from within a tokio runtime.
    pub fn new(
        clients: BrokerClients,
        config: OrchestratorConfig,
        stages: PipelineStages,
        liveness: Option<HealthRegistry>,
    ) -> Self {
        let dead_letter: Arc<dyn DeadLetterSink> = Arc::new(ChannelDeadLetterSink::new(
            clients.producer.clone(),
            &config.topics.dead_letter,
            config.dead_letter_retry.clone(),
        ));
        let producer = Arc::new(EventProducer::new(
            clients.producer.clone(),
            config.producer.clone(),
            Some(dead_letter.clone()),
        ));
        let mut processor = StreamProcessor::new(
            producer.clone(),
            clients.admin,
            clients.consumers,
            dead_letter,
            config.processor.clone(),
        );
        if let Some(registry) = liveness {
            processor = processor.with_liveness(registry);
        }
        Self {
            config,
            stages,
            producer,
            processor,
        }
    }

    pub fn topic_specs(&self) -> Vec<TopicSpec> {
        let topics = &self.config.topics;
        let settings = self.config.topic_settings;
        [
            &topics.raw_events,
            &topics.enriched_events,
            &topics.alerts,
            &topics.metrics,
            &topics.dead_letter,
        ]
        .into_iter()
        .map(|name| {
            TopicSpec::new(name)
                .partitions(settings.partitions)
                .replication_factor(settings.replication_factor)
                .retention_ms(settings.retention_ms)
                .min_insync_replicas(settings.min_insync_replicas)
        })
        .collect()
    }

    pub fn pipeline_definitions(&self) -> Vec<PipelineDefinition> {
        let topics = &self.config.topics;
        vec![
            PipelineDefinition {
                name: "enrichment".to_string(),
                input: topics.raw_events.clone(),
                output: topics.enriched_events.clone(),
                group_id: "telemetry-enrichment".to_string(),
                stages: self.stages.enrichment.clone(),
            },
            PipelineDefinition {
                name: "alerting".to_string(),
                input: topics.enriched_events.clone(),
                output: topics.alerts.clone(),
                group_id: "telemetry-alerting".to_string(),
                stages: self.stages.alerting.clone(),
            },
            PipelineDefinition {
                name: "metrics".to_string(),
                input: topics.enriched_events.clone(),
                output: topics.metrics.clone(),
                group_id: "telemetry-metrics".to_string(),
                stages: self.stages.metrics.clone(),
            },
        ]
    }

    /// Connects the producer, provisions topics and starts every pipeline.
    pub async fn start(&self) -> Result<(), PipelineError> {
        self.producer.connect().await?;
        self.processor
            .create_topics_if_needed(&self.topic_specs())
            .await?;
        for definition in self.pipeline_definitions() {
            self.processor.add_pipeline(definition).await?;
        }
        info!(pipelines = ?self.processor.pipeline_names(), "orchestrator started");
        Ok(())
    }

    pub fn producer(&self) -> &Arc<EventProducer> {
        &self.producer
    }

    pub fn processor(&self) -> &StreamProcessor {
        &self.processor
    }

    pub fn metrics(&self) -> PipelineMetrics {
        PipelineMetrics {
            producer: self.producer.stats(),
            pipelines: self.processor.pipeline_stats(),
        }
    }

    pub async fn wait_for_fatal(&self) -> Option<PipelineError> {
        self.processor.wait_for_fatal().await
    }

    /// Drains the consumers, then the shared producer, then drops the admin client.
    pub async fn shutdown(&self) -> Result<(), PipelineError> {
        info!("draining pipelines");
        self.processor.shutdown().await;

        let result = self.producer.disconnect().await;
        if let Err(e) = &result {
            warn!("producer did not drain cleanly: {}", e);
        }

        if self.processor.release_admin() {
            info!("admin connection released");
        }
        result.map_err(PipelineError::from)
    }
}
