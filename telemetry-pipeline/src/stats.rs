//! Per-instance counters behind the `/stats` endpoint. Each producer and
//! consumer owns its own set; nothing here is process-global.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::batch::BatchStats;

#[derive(Default, Debug)]
pub struct ProducerStats {
    sent: AtomicU64,
    failed: AtomicU64,
    batches: AtomicU64,
    dead_lettered: AtomicU64,
}

impl ProducerStats {
    pub fn record_sent(&self, count: u64) {
        self.sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_failed(&self, count: u64) {
        self.failed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self, count: u64) {
        self.dead_lettered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self, accumulator: BatchStats) -> ProducerSnapshot {
        ProducerSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            pending: accumulator.pending,
            flush_failures: accumulator.failures,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProducerSnapshot {
    pub sent: u64,
    pub failed: u64,
    pub batches: u64,
    pub dead_lettered: u64,
    pub pending: usize,
    pub flush_failures: u64,
}

#[derive(Default, Debug)]
pub struct ConsumerStats {
    consumed: AtomicU64,
    processed: AtomicU64,
    duplicates: AtomicU64,
    errors: AtomicU64,
    dead_lettered: AtomicU64,
    commits: AtomicU64,
}

impl ConsumerStats {
    pub fn record_consumed(&self, count: u64) {
        self.consumed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConsumerSnapshot {
        ConsumerSnapshot {
            consumed: self.consumed.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerSnapshot {
    pub consumed: u64,
    pub processed: u64,
    pub duplicates: u64,
    pub errors: u64,
    pub dead_lettered: u64,
    pub commits: u64,
}

/// Aggregate view served by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineMetrics {
    pub producer: ProducerSnapshot,
    pub pipelines: BTreeMap<String, ConsumerSnapshot>,
}
