pub mod admin;
pub mod client;
pub mod config;
pub mod kafka_consumer;
pub mod kafka_producer;
pub mod memory;
pub mod types;

pub use client::{
    AdminError, ChannelConsumer, ChannelProducer, ConsumeError, ConsumerFactory, ProduceError,
    TopicAdmin,
};
pub use types::{ChannelMessage, Headers, OutboundRecord, Partition, TopicSpec};
