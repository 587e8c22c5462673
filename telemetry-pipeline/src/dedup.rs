use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::event::Event;
use crate::metrics_consts::{DEDUP_ENTRIES, DEDUP_PURGED};

/// Sliding-window duplicate suppression keyed by [`Event::dedup_key`].
///
/// Memory is bounded by the number of distinct events seen within one window,
/// as long as the sweeper runs. Nothing is persisted across restarts.
pub struct Deduplicator {
    name: String,
    window: Duration,
    seen: DashMap<String, Instant>,
}

impl Deduplicator {
    pub fn new(name: &str, window: Duration) -> Self {
        Self {
            name: name.to_owned(),
            window,
            seen: DashMap::new(),
        }
    }

    /// Records the event on first sight and reports repeats within the window.
    /// An entry older than the window counts as first sight again, even if the
    /// sweeper has not removed it yet.
    pub fn is_duplicate(&self, event: &Event) -> bool {
        let now = Instant::now();
        match self.seen.entry(event.dedup_key()) {
            Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) < self.window {
                    true
                } else {
                    entry.insert(now);
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                false
            }
        }
    }

    /// Drops every entry older than the window and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.seen.len();
        self.seen
            .retain(|_, first_seen| now.duration_since(*first_seen) < self.window);
        let purged = before.saturating_sub(self.seen.len());

        metrics::counter!(DEDUP_PURGED, "pipeline" => self.name.clone()).increment(purged as u64);
        metrics::gauge!(DEDUP_ENTRIES, "pipeline" => self.name.clone()).set(self.seen.len() as f64);
        purged
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Purges on a fixed interval, independent of traffic, until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let dedup = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = dedup.purge_expired();
                        if purged > 0 {
                            debug!(pipeline = %dedup.name, purged, remaining = dedup.len(), "purged dedup entries");
                        }
                    }
                }
            }
        })
    }
}
