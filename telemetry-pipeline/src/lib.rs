pub mod batch;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod dedup;
pub mod error;
pub mod event;
pub mod metrics_consts;
pub mod offset_tracker;
pub mod orchestrator;
pub mod processor;
pub mod producer;
pub mod retry;
pub mod server;
pub mod stage;
pub mod stats;
