use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use common_kafka::config::{ConsumerConfig, KafkaConfig};
use envconfig::Envconfig;
use thiserror::Error;

use crate::batch::BatchConfig;
use crate::error::ConfigError;
use crate::event::Severity;
use crate::orchestrator::{OrchestratorConfig, TopicSettings, Topics};
use crate::processor::ProcessorSettings;
use crate::producer::ProducerConfig;
use crate::retry::RetryPolicy;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    #[envconfig(default = "kafka")]
    pub broker: BrokerKind,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    // Producer batching
    #[envconfig(default = "100")]
    pub batch_size: usize,

    #[envconfig(default = "1000")]
    pub batch_timeout: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub flush_timeout: EnvMsDuration,

    #[envconfig(nested = true)]
    pub flush_retry: FlushRetryConfig,

    #[envconfig(default = "5")]
    pub dead_letter_max_attempts: u32,

    // Consumers
    #[envconfig(default = "300000")]
    pub dedup_window: EnvMsDuration,

    #[envconfig(default = "60000")]
    pub dedup_cleanup_interval: EnvMsDuration,

    #[envconfig(default = "100")]
    pub consumer_batch_size: usize,

    #[envconfig(default = "1000")]
    pub consumer_poll_timeout: EnvMsDuration,

    #[envconfig(default = "10")]
    pub max_concurrency: usize,

    #[envconfig(default = "3000")]
    pub heartbeat_interval: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub handler_timeout: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub liveness_deadline: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub shutdown_timeout: EnvMsDuration,

    // Topics
    #[envconfig(default = "security-events-raw")]
    pub raw_events_topic: String,

    #[envconfig(default = "security-events-enriched")]
    pub enriched_events_topic: String,

    #[envconfig(default = "security-alerts")]
    pub alerts_topic: String,

    #[envconfig(default = "security-metrics")]
    pub metrics_topic: String,

    #[envconfig(default = "security-events-dlq")]
    pub dead_letter_topic: String,

    #[envconfig(default = "6")]
    pub topic_partitions: i32,

    #[envconfig(default = "3")]
    pub topic_replication_factor: i32,

    #[envconfig(default = "86400000")]
    pub topic_retention_ms: i64,

    #[envconfig(default = "2")]
    pub topic_min_insync_replicas: i32,

    #[envconfig(default = "high")]
    pub alert_min_severity: Severity,

    // Tracing
    pub otel_url: Option<String>,

    #[envconfig(default = "1.0")]
    pub otel_sampling_rate: f64,

    #[envconfig(default = "telemetry-pipeline")]
    pub otel_service_name: String,
}

/// Backoff between producer flush retries. `FLUSH_MAX_ATTEMPTS=0` retries forever.
#[derive(Envconfig, Clone)]
pub struct FlushRetryConfig {
    #[envconfig(default = "0")]
    pub flush_max_attempts: u32,

    #[envconfig(default = "2")]
    pub flush_backoff_coefficient: u32,

    #[envconfig(default = "100")]
    pub flush_backoff_initial_interval: EnvMsDuration,

    #[envconfig(default = "10000")]
    pub flush_backoff_maximum_interval: EnvMsDuration,
}

impl FlushRetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.flush_backoff_coefficient,
            self.flush_backoff_initial_interval.0,
            Some(self.flush_backoff_maximum_interval.0),
        )
        .with_max_attempts(Some(self.flush_max_attempts))
    }
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive_counts = [
            ("BATCH_SIZE", self.batch_size),
            ("CONSUMER_BATCH_SIZE", self.consumer_batch_size),
            ("MAX_CONCURRENCY", self.max_concurrency),
        ];
        for (name, value) in positive_counts {
            if value == 0 {
                return Err(ConfigError::MustBePositive(name));
            }
        }

        let positive_durations = [
            ("BATCH_TIMEOUT", self.batch_timeout),
            ("DEDUP_WINDOW", self.dedup_window),
            ("DEDUP_CLEANUP_INTERVAL", self.dedup_cleanup_interval),
            ("HEARTBEAT_INTERVAL", self.heartbeat_interval),
            ("HANDLER_TIMEOUT", self.handler_timeout),
        ];
        for (name, value) in positive_durations {
            if value.0.is_zero() {
                return Err(ConfigError::MustBePositive(name));
            }
        }

        if self.topic_partitions <= 0 {
            return Err(ConfigError::MustBePositive("TOPIC_PARTITIONS"));
        }
        if self.topic_replication_factor <= 0 {
            return Err(ConfigError::MustBePositive("TOPIC_REPLICATION_FACTOR"));
        }
        if self.topic_min_insync_replicas > self.topic_replication_factor {
            return Err(ConfigError::InsyncAboveReplication {
                min_insync: self.topic_min_insync_replicas,
                replication: self.topic_replication_factor,
            });
        }

        let topics = self.topics();
        let mut seen = HashSet::new();
        for name in [
            &topics.raw_events,
            &topics.enriched_events,
            &topics.alerts,
            &topics.metrics,
            &topics.dead_letter,
        ] {
            if !seen.insert(name) {
                return Err(ConfigError::DuplicateTopic(name.clone()));
            }
        }
        Ok(())
    }

    pub fn topics(&self) -> Topics {
        Topics {
            raw_events: self.raw_events_topic.clone(),
            enriched_events: self.enriched_events_topic.clone(),
            alerts: self.alerts_topic.clone(),
            metrics: self.metrics_topic.clone(),
            dead_letter: self.dead_letter_topic.clone(),
        }
    }

    pub fn producer_config(&self) -> ProducerConfig {
        ProducerConfig {
            batch: BatchConfig {
                name: "producer".to_string(),
                batch_size: self.batch_size,
                batch_timeout: self.batch_timeout.0,
                retry: self.flush_retry.policy(),
            },
            flush_timeout: self.flush_timeout.0,
        }
    }

    pub fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            batch_size: self.consumer_batch_size,
            poll_timeout: self.consumer_poll_timeout.0,
            max_concurrency: self.max_concurrency,
            heartbeat_interval: self.heartbeat_interval.0,
            handler_timeout: self.handler_timeout.0,
            dedup_window: self.dedup_window.0,
            dedup_sweep_interval: self.dedup_cleanup_interval.0,
            liveness_deadline: self.liveness_deadline.0,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            topics: self.topics(),
            topic_settings: TopicSettings {
                partitions: self.topic_partitions,
                replication_factor: self.topic_replication_factor,
                retention_ms: self.topic_retention_ms,
                min_insync_replicas: self.topic_min_insync_replicas,
            },
            producer: self.producer_config(),
            dead_letter_retry: self
                .flush_retry
                .policy()
                .with_max_attempts(Some(self.dead_letter_max_attempts)),
            processor: self.processor_settings(),
        }
    }
}

/// Where events go: a real Kafka cluster, or an in-process broker for local runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    Kafka,
    Memory,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown broker {0:?}, expected kafka or memory")]
pub struct ParseBrokerKindError(String);

impl FromStr for BrokerKind {
    type Err = ParseBrokerKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kafka" => Ok(BrokerKind::Kafka),
            "memory" => Ok(BrokerKind::Memory),
            other => Err(ParseBrokerKindError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(Duration::from_millis(ms)))
    }
}
