//! Pipeline composition: one consumer group per named pipeline, all of them
//! forwarding through a single shared producer.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use common_kafka::{ConsumerFactory, TopicAdmin, TopicSpec};
use futures::future::join_all;
use health::HealthRegistry;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::consumer::{EventConsumer, EventConsumerConfig, EventHandler};
use crate::dead_letter::DeadLetterSink;
use crate::dedup::Deduplicator;
use crate::error::{ConsumerError, PipelineError};
use crate::event::Event;
use crate::producer::EventProducer;
use crate::stage::{Stage, StageChain, StageOutcome};
use crate::stats::ConsumerSnapshot;

/// A pipeline is identified by its input channel, output channel and consumer group.
#[derive(Clone)]
pub struct PipelineDefinition {
    pub name: String,
    pub input: String,
    pub output: String,
    pub group_id: String,
    pub stages: Vec<Arc<dyn Stage>>,
}

/// Settings shared by every pipeline a processor runs.
#[derive(Clone, Debug)]
pub struct ProcessorSettings {
    pub batch_size: usize,
    pub poll_timeout: Duration,
    pub max_concurrency: usize,
    pub heartbeat_interval: Duration,
    pub handler_timeout: Duration,
    pub dedup_window: Duration,
    pub dedup_sweep_interval: Duration,
    /// Liveness deadline for each consumer loop
    pub liveness_deadline: Duration,
}

impl ProcessorSettings {
    fn consumer_config(&self, name: &str) -> EventConsumerConfig {
        EventConsumerConfig {
            name: name.to_owned(),
            batch_size: self.batch_size,
            poll_timeout: self.poll_timeout,
            max_concurrency: self.max_concurrency,
            heartbeat_interval: self.heartbeat_interval,
            handler_timeout: self.handler_timeout,
        }
    }
}

/// Folds the stages over each event and forwards what survives.
struct PipelineHandler {
    chain: StageChain,
    output: String,
    producer: Arc<EventProducer>,
}

#[async_trait]
impl EventHandler for PipelineHandler {
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        match self.chain.apply(event).await? {
            StageOutcome::Forward(event) => self.producer.send_event(&self.output, &event, None)?,
            StageOutcome::Drop => {}
        }
        Ok(())
    }

    /// Forwarded events must be acknowledged before the input offsets move.
    async fn before_commit(&self) -> anyhow::Result<()> {
        self.producer.flush().await?;
        Ok(())
    }
}

struct RunningPipeline {
    name: String,
    consumer: Arc<EventConsumer>,
    task: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

pub struct StreamProcessor {
    producer: Arc<EventProducer>,
    admin: Mutex<Option<Arc<dyn TopicAdmin>>>,
    consumers: Arc<dyn ConsumerFactory>,
    dead_letter: Arc<dyn DeadLetterSink>,
    settings: ProcessorSettings,
    liveness: Option<HealthRegistry>,
    pipelines: Mutex<Vec<RunningPipeline>>,
    fatal_tx: mpsc::UnboundedSender<PipelineError>,
    fatal_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PipelineError>>,
    sweepers: CancellationToken,
}

impl StreamProcessor {
    pub fn new(
        producer: Arc<EventProducer>,
        admin: Arc<dyn TopicAdmin>,
        consumers: Arc<dyn ConsumerFactory>,
        dead_letter: Arc<dyn DeadLetterSink>,
        settings: ProcessorSettings,
    ) -> Self {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        Self {
            producer,
            admin: Mutex::new(Some(admin)),
            consumers,
            dead_letter,
            settings,
            liveness: None,
            pipelines: Mutex::new(Vec::new()),
            fatal_tx,
            fatal_rx: tokio::sync::Mutex::new(fatal_rx),
            sweepers: CancellationToken::new(),
        }
    }

    /// Each pipeline's consumer loop registers itself as `pipeline_<name>`.
    pub fn with_liveness(mut self, registry: HealthRegistry) -> Self {
        self.liveness = Some(registry);
        self
    }

    fn lock_pipelines(&self) -> MutexGuard<'_, Vec<RunningPipeline>> {
        self.pipelines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates the missing channels. Existing ones are left as they are.
    pub async fn create_topics_if_needed(
        &self,
        topics: &[TopicSpec],
    ) -> Result<Vec<String>, PipelineError> {
        let admin = self
            .admin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(PipelineError::AdminReleased)?;
        let created = admin.create_topics_if_needed(topics).await?;
        if !created.is_empty() {
            info!(?created, "provisioned topics");
        }
        Ok(created)
    }

    /// Starts consuming `definition.input` in its own consumer group.
    pub async fn add_pipeline(&self, definition: PipelineDefinition) -> Result<(), PipelineError> {
        let PipelineDefinition {
            name,
            input,
            output,
            group_id,
            stages,
        } = definition;
        if self.lock_pipelines().iter().any(|p| p.name == name) {
            return Err(PipelineError::DuplicatePipeline(name));
        }

        let client = self
            .consumers
            .create_consumer(&group_id)
            .map_err(ConsumerError::from)?;
        let dedup = Arc::new(Deduplicator::new(&name, self.settings.dedup_window));
        let mut consumer = EventConsumer::new(
            self.settings.consumer_config(&name),
            client,
            dedup.clone(),
            self.dead_letter.clone(),
        );
        if let Some(registry) = &self.liveness {
            consumer = consumer.with_liveness(
                registry.register(format!("pipeline_{name}"), self.settings.liveness_deadline),
            );
        }
        let consumer = Arc::new(consumer);
        consumer.connect().await?;
        consumer.subscribe(&[input.clone()])?;

        let handler = Arc::new(PipelineHandler {
            chain: StageChain::new(&name, stages),
            output: output.clone(),
            producer: self.producer.clone(),
        });

        let sweeper =
            dedup.spawn_sweeper(self.settings.dedup_sweep_interval, self.sweepers.child_token());
        let task = {
            let consumer = consumer.clone();
            let fatal_tx = self.fatal_tx.clone();
            let name = name.clone();
            tokio::spawn(async move {
                if let Err(source) = consumer.run(handler).await {
                    error!(pipeline = %name, "pipeline stopped: {}", source);
                    if fatal_tx
                        .send(PipelineError::Fatal {
                            pipeline: name,
                            source,
                        })
                        .is_err()
                    {
                        warn!("nobody is listening for pipeline failures");
                    }
                }
            })
        };

        info!(pipeline = %name, %input, %output, %group_id, "pipeline started");
        self.lock_pipelines().push(RunningPipeline {
            name,
            consumer,
            task,
            sweeper,
        });
        Ok(())
    }

    /// Resolves with the first pipeline that stopped on its own.
    pub async fn wait_for_fatal(&self) -> Option<PipelineError> {
        self.fatal_rx.lock().await.recv().await
    }

    pub fn pipeline_names(&self) -> Vec<String> {
        self.lock_pipelines().iter().map(|p| p.name.clone()).collect()
    }

    pub fn pipeline_stats(&self) -> BTreeMap<String, ConsumerSnapshot> {
        self.lock_pipelines()
            .iter()
            .map(|p| (p.name.clone(), p.consumer.stats()))
            .collect()
    }

    fn consumer(&self, name: &str) -> Option<Arc<EventConsumer>> {
        self.lock_pipelines()
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.consumer.clone())
    }

    /// Returns false for an unknown pipeline.
    pub fn pause_pipeline(&self, name: &str) -> Result<bool, PipelineError> {
        match self.consumer(name) {
            Some(consumer) => {
                consumer.pause()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn resume_pipeline(&self, name: &str) -> Result<bool, PipelineError> {
        match self.consumer(name) {
            Some(consumer) => {
                consumer.resume()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Lets every pipeline settle its current batch, then stops them all.
    /// The shared producer is left connected.
    pub async fn shutdown(&self) {
        let pipelines: Vec<RunningPipeline> = self.lock_pipelines().drain(..).collect();
        join_all(pipelines.iter().map(|p| p.consumer.disconnect())).await;

        self.sweepers.cancel();
        for pipeline in pipelines {
            if let Err(e) = pipeline.task.await {
                error!(pipeline = %pipeline.name, "pipeline task failed: {}", e);
            }
            if let Err(e) = pipeline.sweeper.await {
                warn!(pipeline = %pipeline.name, "dedup sweeper failed: {}", e);
            }
            if let Some(registry) = &self.liveness {
                registry.deregister(&format!("pipeline_{}", pipeline.name));
            }
        }
        info!("all pipelines stopped");
    }

    /// Drops the shared admin client. Returns false if it was already released.
    pub fn release_admin(&self) -> bool {
        self.admin
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchConfig;
    use crate::dead_letter::ChannelDeadLetterSink;
    use crate::event::Envelope;
    use crate::producer::ProducerConfig;
    use crate::retry::RetryPolicy;
    use crate::stage::{add_field, filter_out_type};
    use common_kafka::memory::MemoryBroker;
    use common_kafka::ChannelProducer;

    fn settings() -> ProcessorSettings {
        ProcessorSettings {
            batch_size: 100,
            poll_timeout: Duration::from_millis(20),
            max_concurrency: 8,
            heartbeat_interval: Duration::from_millis(50),
            handler_timeout: Duration::from_secs(5),
            dedup_window: Duration::from_secs(300),
            dedup_sweep_interval: Duration::from_secs(60),
            liveness_deadline: Duration::from_secs(30),
        }
    }

    async fn processor(broker: &MemoryBroker) -> StreamProcessor {
        let client: Arc<dyn ChannelProducer> = Arc::new(broker.clone());
        let producer = Arc::new(EventProducer::new(
            client.clone(),
            ProducerConfig {
                batch: BatchConfig {
                    name: "producer".to_string(),
                    batch_size: 100,
                    batch_timeout: Duration::from_millis(50),
                    retry: RetryPolicy::default(),
                },
                flush_timeout: Duration::from_secs(1),
            },
            None,
        ));
        producer.connect().await.unwrap();
        StreamProcessor::new(
            producer,
            Arc::new(broker.clone()),
            Arc::new(broker.clone()),
            Arc::new(ChannelDeadLetterSink::new(
                client,
                "dead-letter",
                RetryPolicy::default().with_max_attempts(Some(3)),
            )),
            settings(),
        )
    }

    fn definition(name: &str) -> PipelineDefinition {
        PipelineDefinition {
            name: name.to_string(),
            input: "in".to_string(),
            output: "out".to_string(),
            group_id: format!("{name}-group"),
            stages: vec![filter_out_type("TEST"), add_field("enriched", true)],
        }
    }

    #[tokio::test]
    async fn test_duplicate_pipeline_names_are_rejected() {
        let broker = MemoryBroker::new(1);
        let processor = processor(&broker).await;

        processor.add_pipeline(definition("enrichment")).await.unwrap();
        assert!(matches!(
            processor.add_pipeline(definition("enrichment")).await,
            Err(PipelineError::DuplicatePipeline(name)) if name == "enrichment"
        ));
        processor.shutdown().await;
    }

    #[tokio::test]
    async fn test_pipelines_register_liveness_and_deregister_on_shutdown() {
        let broker = MemoryBroker::new(1);
        let registry = HealthRegistry::new("liveness");
        let processor = processor(&broker).await.with_liveness(registry.clone());

        processor.add_pipeline(definition("enrichment")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = registry.get_status();
        assert!(status.healthy);
        assert!(status.components.contains_key("pipeline_enrichment"));

        processor.shutdown().await;
        assert!(registry.get_status().components.is_empty());
        assert!(processor.pipeline_names().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_commits_forwarded_input() {
        let broker = MemoryBroker::new(1);
        let processor = processor(&broker).await;
        processor.add_pipeline(definition("enrichment")).await.unwrap();

        let event = Event::new("a", "REAL", "low", "edr");
        let record = Envelope::wrap("in", &event, None).unwrap().to_record();
        broker.send("in", vec![record]).await[0].as_ref().unwrap();

        for _ in 0..400 {
            if broker.message_count("out") == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        processor.shutdown().await;

        assert_eq!(broker.message_count("out"), 1);
        assert_eq!(
            broker.committed_offset(
                "enrichment-group",
                &common_kafka::Partition::new("in".to_string(), 0)
            ),
            Some(1)
        );
        assert_eq!(processor.pipeline_stats().len(), 0);
    }

    #[tokio::test]
    async fn test_released_admin_cannot_provision() {
        let broker = MemoryBroker::new(1);
        let processor = processor(&broker).await;
        let spec = [TopicSpec::new("in")];

        assert_eq!(
            processor.create_topics_if_needed(&spec).await.unwrap(),
            vec!["in".to_string()]
        );
        assert!(processor.release_admin());
        assert!(!processor.release_admin());
        assert!(matches!(
            processor.create_topics_if_needed(&spec).await,
            Err(PipelineError::AdminReleased)
        ));
    }
}
