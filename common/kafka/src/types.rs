use rdkafka::topic_partition_list::TopicPartitionListElem;

/// Message headers as ordered key/value pairs.
pub type Headers = Vec<(String, String)>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: String, partition_number: i32) -> Self {
        Self {
            topic,
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic().to_string(), elem.partition())
    }
}

/// An owned message pulled from a channel, detached from the client that fetched it.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub partition: Partition,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub headers: Headers,
    /// Broker timestamp in milliseconds since epoch, if any
    pub timestamp: Option<i64>,
}

impl ChannelMessage {
    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A record ready to be produced to a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRecord {
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub timestamp: Option<i64>,
}

/// Desired shape of a channel, used when provisioning missing topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i32,
    pub retention_ms: i64,
    pub compression_type: String,
    pub min_insync_replicas: i32,
}

impl TopicSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            partitions: 1,
            replication_factor: 1,
            retention_ms: 86_400_000,
            compression_type: "lz4".to_string(),
            min_insync_replicas: 1,
        }
    }

    pub fn partitions(mut self, partitions: i32) -> Self {
        self.partitions = partitions;
        self
    }

    pub fn replication_factor(mut self, replication_factor: i32) -> Self {
        self.replication_factor = replication_factor;
        self
    }

    pub fn retention_ms(mut self, retention_ms: i64) -> Self {
        self.retention_ms = retention_ms;
        self
    }

    pub fn min_insync_replicas(mut self, min_insync_replicas: i32) -> Self {
        self.min_insync_replicas = min_insync_replicas;
        self
    }

    /// Topic-level configuration entries sent along with a create request.
    pub fn config_entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("retention.ms", self.retention_ms.to_string()),
            ("compression.type", self.compression_type.clone()),
            ("min.insync.replicas", self.min_insync_replicas.to_string()),
        ]
    }
}
