use envconfig::Envconfig;
use rdkafka::ClientConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "10000000")]
    pub kafka_producer_queue_messages: u32, // Maximum number of messages in the in-memory producer queue

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "lz4")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    // Idempotent producer: acks=all, bounded in-flight, no duplicates on internal retries
    #[envconfig(default = "true")]
    pub kafka_enable_idempotence: bool,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,
}

impl KafkaConfig {
    /// Connection settings shared by the producer, consumers and admin client.
    pub fn client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set("statistics.interval.ms", "10000");

        if self.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };
        client_config
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    // We default to "earliest" so a freshly declared pipeline picks up the backlog
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "30000")]
    pub kafka_consumer_session_timeout_ms: u32,

    #[envconfig(default = "3000")]
    pub kafka_consumer_heartbeat_interval_ms: u32,

    // Upper bound on the time a single batch may take before the member is evicted
    #[envconfig(default = "300000")]
    pub kafka_consumer_max_poll_interval_ms: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            kafka_consumer_offset_reset: "earliest".to_string(),
            kafka_consumer_session_timeout_ms: 30000,
            kafka_consumer_heartbeat_interval_ms: 3000,
            kafka_consumer_max_poll_interval_ms: 300000,
        }
    }
}
