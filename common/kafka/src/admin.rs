use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::util::Timeout;
use tracing::{info, warn};

use crate::client::{AdminError, TopicAdmin};
use crate::config::KafkaConfig;
use crate::types::TopicSpec;

pub struct KafkaAdmin {
    admin_client: AdminClient<DefaultClientContext>,
    operation_timeout: Duration,
}

impl KafkaAdmin {
    pub fn new(config: &KafkaConfig) -> Result<Self, KafkaError> {
        let admin_client: AdminClient<_> = config.client_config().create()?;
        Ok(Self {
            admin_client,
            operation_timeout: Duration::from_secs(30),
        })
    }

    fn existing_topics(&self) -> Result<HashSet<String>, KafkaError> {
        let metadata = self
            .admin_client
            .inner()
            .fetch_metadata(None, Timeout::from(Duration::from_secs(10)))?;
        Ok(metadata
            .topics()
            .iter()
            .map(|t| t.name().to_string())
            .collect())
    }
}

#[async_trait]
impl TopicAdmin for KafkaAdmin {
    async fn create_topics_if_needed(
        &self,
        topics: &[TopicSpec],
    ) -> Result<Vec<String>, AdminError> {
        let existing = self.existing_topics()?;
        let missing: Vec<&TopicSpec> = topics
            .iter()
            .filter(|spec| !existing.contains(&spec.name))
            .collect();

        if missing.is_empty() {
            info!("All {} topics already exist", topics.len());
            return Ok(Vec::new());
        }

        // NewTopic borrows its config strings, so own them for the whole request
        let entries: Vec<Vec<(&'static str, String)>> =
            missing.iter().map(|spec| spec.config_entries()).collect();
        let new_topics: Vec<NewTopic<'_>> = missing
            .iter()
            .zip(entries.iter())
            .map(|(spec, entries)| {
                entries.iter().fold(
                    NewTopic::new(
                        &spec.name,
                        spec.partitions,
                        TopicReplication::Fixed(spec.replication_factor),
                    ),
                    |topic, (key, value)| topic.set(key, value.as_str()),
                )
            })
            .collect();

        let options = AdminOptions::new().operation_timeout(Some(self.operation_timeout));
        let results = self
            .admin_client
            .create_topics(new_topics.iter(), &options)
            .await?;

        let mut created = Vec::new();
        for result in results {
            match result {
                Ok(name) => {
                    info!(topic = %name, "created topic");
                    created.push(name);
                }
                // Lost a race with another instance, which is fine
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    warn!(topic = %name, "topic was created concurrently");
                }
                Err((name, code)) => {
                    return Err(AdminError::CreateFailed {
                        topic: name,
                        reason: code.to_string(),
                    });
                }
            }
        }
        Ok(created)
    }
}
