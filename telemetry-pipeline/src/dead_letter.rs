use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use common_kafka::{ChannelMessage, ChannelProducer, OutboundRecord, ProduceError};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::DeadLetterError;
use crate::event::Envelope;
use crate::metrics_consts::DEAD_LETTER_PUBLISH_RETRIES;
use crate::retry::RetryPolicy;

pub const HEADER_DEAD_LETTER_ORIGIN: &str = "dead-letter-origin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    Utf8,
    Base64,
}

/// What lands on the dead-letter channel for a message that could not be processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub original_payload: String,
    pub payload_encoding: PayloadEncoding,
    pub original_headers: BTreeMap<String, String>,
    pub error_message: String,
    pub original_channel: String,
    pub original_partition: Option<i32>,
    pub original_offset: Option<i64>,
    pub original_key: Option<String>,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    fn new(channel: &str, payload: &[u8], error_message: &str) -> Self {
        let (original_payload, payload_encoding) = match std::str::from_utf8(payload) {
            Ok(text) => (text.to_owned(), PayloadEncoding::Utf8),
            Err(_) => (STANDARD.encode(payload), PayloadEncoding::Base64),
        };
        Self {
            id: Uuid::now_v7(),
            original_payload,
            payload_encoding,
            original_headers: BTreeMap::new(),
            error_message: error_message.to_owned(),
            original_channel: channel.to_owned(),
            original_partition: None,
            original_offset: None,
            original_key: None,
            failed_at: Utc::now(),
        }
    }

    /// A consumed message whose decoding or handling failed.
    pub fn from_message(message: &ChannelMessage, error_message: &str) -> Self {
        let payload = message.payload.as_deref().unwrap_or_default();
        Self {
            original_headers: message.headers.iter().cloned().collect(),
            original_partition: Some(message.partition.partition_number()),
            original_offset: Some(message.offset),
            original_key: message
                .key
                .as_deref()
                .map(|key| String::from_utf8_lossy(key).into_owned()),
            ..Self::new(message.topic(), payload, error_message)
        }
    }

    /// An outbound envelope the producer gave up on.
    pub fn from_envelope(envelope: &Envelope, error_message: &str) -> Self {
        Self {
            original_headers: envelope.headers.iter().cloned().collect(),
            original_key: Some(envelope.key.clone()),
            ..Self::new(&envelope.channel, &envelope.payload, error_message)
        }
    }

    /// The original bytes, undoing the transport encoding.
    pub fn payload_bytes(&self) -> Option<Vec<u8>> {
        match self.payload_encoding {
            PayloadEncoding::Utf8 => Some(self.original_payload.as_bytes().to_vec()),
            PayloadEncoding::Base64 => STANDARD.decode(&self.original_payload).ok(),
        }
    }

    pub fn to_record(&self) -> Result<OutboundRecord, serde_json::Error> {
        Ok(OutboundRecord {
            key: self.original_key.clone(),
            payload: serde_json::to_vec(self)?,
            headers: vec![(
                HEADER_DEAD_LETTER_ORIGIN.to_string(),
                self.original_channel.clone(),
            )],
            timestamp: Some(self.failed_at.timestamp_millis()),
        })
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Returns only once the record is durable, or the sink has given up.
    async fn publish(&self, record: DeadLetterRecord) -> Result<(), DeadLetterError>;
}

/// Publishes dead-letter records straight to a channel, bypassing batching.
pub struct ChannelDeadLetterSink {
    producer: Arc<dyn ChannelProducer>,
    channel: String,
    retry: RetryPolicy,
}

impl ChannelDeadLetterSink {
    pub fn new(producer: Arc<dyn ChannelProducer>, channel: &str, retry: RetryPolicy) -> Self {
        Self {
            producer,
            channel: channel.to_owned(),
            retry,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl DeadLetterSink for ChannelDeadLetterSink {
    async fn publish(&self, record: DeadLetterRecord) -> Result<(), DeadLetterError> {
        let outbound = record.to_record()?;
        let mut attempts = 0;

        loop {
            let result = self
                .producer
                .send(&self.channel, vec![outbound.clone()])
                .await
                .into_iter()
                .next()
                .unwrap_or_else(|| {
                    Err(ProduceError::Unavailable(format!(
                        "no delivery result for {}",
                        self.channel
                    )))
                });

            let Err(source) = result else {
                return Ok(());
            };

            attempts += 1;
            if self.retry.is_exhausted(attempts) {
                return Err(DeadLetterError::Unavailable {
                    channel: self.channel.clone(),
                    attempts,
                    source,
                });
            }

            let delay = self.retry.time_until_next_retry(attempts - 1);
            warn!(
                channel = %self.channel,
                attempts,
                retry_in_ms = delay.as_millis() as u64,
                "failed to publish dead-letter record: {}",
                source
            );
            metrics::counter!(DEAD_LETTER_PUBLISH_RETRIES, "channel" => self.channel.clone())
                .increment(1);
            tokio::time::sleep(delay).await;
        }
    }
}
