//! Size/time triggered batching with requeue-on-failure.
//!
//! At most one flush runs at a time. Items added while a flush is in flight
//! accumulate into the next batch, and a failed batch goes back to the front
//! of the queue so the original order survives retries.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::BatchError;
use crate::metrics_consts::{
    BATCH_EXHAUSTED_ITEMS, BATCH_FLUSHES, BATCH_FLUSH_DURATION_MS, BATCH_FLUSH_FAILURES,
    BATCH_FLUSH_SIZE, BATCH_PENDING,
};
use crate::retry::RetryPolicy;

/// Items a processor could not deliver, to be requeued in the order given.
#[derive(Debug)]
pub struct BatchFailure<T> {
    pub retry: Vec<T>,
    pub error: BatchError,
}

impl<T> BatchFailure<T> {
    pub fn all(items: Vec<T>, error: BatchError) -> Self {
        Self {
            retry: items,
            error,
        }
    }
}

#[async_trait]
pub trait BatchProcessor<T: Send + 'static>: Send + Sync {
    async fn process_batch(&self, items: Vec<T>) -> Result<(), BatchFailure<T>>;

    /// Receives items that failed more times than the retry policy allows.
    async fn on_exhausted(&self, items: Vec<T>, error: BatchError) {
        error!(dropped = items.len(), %error, "batch exhausted its retries, dropping items");
    }
}

#[derive(Clone, Debug)]
pub struct BatchConfig {
    /// Label for logs and metrics
    pub name: String,
    /// Flush as soon as this many items are pending; `usize::MAX` disables the size trigger
    pub batch_size: usize,
    /// Flush once the oldest pending item has waited this long
    pub batch_timeout: Duration,
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub flushes: u64,
    pub failures: u64,
    pub items_flushed: u64,
    pub exhausted: u64,
    pub pending: usize,
}

#[derive(Default)]
struct Counters {
    flushes: AtomicU64,
    failures: AtomicU64,
    items_flushed: AtomicU64,
    exhausted: AtomicU64,
}

struct State<T> {
    items: VecDeque<T>,
    first_pending_at: Option<Instant>,
    retry_at: Option<Instant>,
    attempts: u32,
}

impl<T> State<T> {
    fn in_backoff(&self, now: Instant) -> bool {
        matches!(self.retry_at, Some(at) if at > now)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Trigger {
    Size,
    Timer,
    Explicit,
}

struct Inner<T: Send + 'static> {
    config: BatchConfig,
    processor: Arc<dyn BatchProcessor<T>>,
    state: Mutex<State<T>>,
    // held for the whole duration of a flush
    processing: tokio::sync::Mutex<()>,
    wakeup: Notify,
    counters: Counters,
    cancel: CancellationToken,
}

pub struct BatchAccumulator<T: Send + 'static> {
    inner: Arc<Inner<T>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> BatchAccumulator<T> {
    /// Must be called from within a tokio runtime: the timer runs as a background task.
    pub fn new(config: BatchConfig, processor: Arc<dyn BatchProcessor<T>>) -> Self {
        let inner = Arc::new(Inner {
            config,
            processor,
            state: Mutex::new(State {
                items: VecDeque::new(),
                first_pending_at: None,
                retry_at: None,
                attempts: 0,
            }),
            processing: tokio::sync::Mutex::new(()),
            wakeup: Notify::new(),
            counters: Counters::default(),
            cancel: CancellationToken::new(),
        });
        let timer = tokio::spawn(inner.clone().run_timer());

        Self {
            inner,
            timer: Mutex::new(Some(timer)),
        }
    }

    pub fn add(&self, item: T) {
        let (size_reached, pending) = {
            let mut state = self.inner.lock_state();
            state.items.push_back(item);
            if state.first_pending_at.is_none() {
                state.first_pending_at = Some(Instant::now());
                self.inner.wakeup.notify_one();
            }
            (self.inner.size_ready(&state), state.items.len())
        };
        metrics::gauge!(BATCH_PENDING, "accumulator" => self.inner.config.name.clone())
            .set(pending as f64);

        if size_reached {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                // failures are logged and requeued inside
                if let Err(error) = inner.drain(Trigger::Size).await {
                    debug!(%error, "size-triggered flush did not complete");
                }
            });
        }
    }

    /// Flushes everything pending, ignoring any retry backoff. Waits for an
    /// in-flight flush first. Stops at the first failed batch, which stays queued.
    pub async fn flush(&self) -> Result<(), BatchError> {
        self.inner.drain(Trigger::Explicit).await
    }

    pub fn pending(&self) -> usize {
        self.inner.lock_state().items.len()
    }

    pub fn stats(&self) -> BatchStats {
        let counters = &self.inner.counters;
        BatchStats {
            flushes: counters.flushes.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            items_flushed: counters.items_flushed.load(Ordering::Relaxed),
            exhausted: counters.exhausted.load(Ordering::Relaxed),
            pending: self.pending(),
        }
    }

    /// Stops the timer. Pending items are left in place; call `flush` first to deliver them.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let timer = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timer) = timer {
            if let Err(e) = timer.await {
                warn!("batch timer task failed: {}", e);
            }
        }
    }
}

impl<T: Send + 'static> Drop for BatchAccumulator<T> {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl<T: Send + 'static> Inner<T> {
    fn lock_state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn size_ready(&self, state: &State<T>) -> bool {
        state.items.len() >= self.config.batch_size && !state.in_backoff(Instant::now())
    }

    fn next_deadline(&self) -> Option<Instant> {
        let state = self.lock_state();
        if state.items.is_empty() {
            return None;
        }
        let now = Instant::now();
        match state.retry_at {
            Some(retry_at) if retry_at > now => Some(retry_at),
            _ => state
                .first_pending_at
                .map(|first| first + self.config.batch_timeout),
        }
    }

    async fn run_timer(self: Arc<Self>) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.wakeup.notified() => continue,
                _ = sleep_until_deadline(deadline) => {
                    if let Err(error) = self.drain(Trigger::Timer).await {
                        debug!(%error, "timed flush did not complete");
                    }
                }
            }
        }
    }

    async fn drain(&self, trigger: Trigger) -> Result<(), BatchError> {
        loop {
            let guard = match trigger {
                Trigger::Size => match self.processing.try_lock() {
                    Ok(guard) => guard,
                    // the in-flight flush picks up whatever is ready after it
                    Err(_) => return Ok(()),
                },
                Trigger::Timer | Trigger::Explicit => self.processing.lock().await,
            };
            let result = self.drain_locked(trigger).await;
            drop(guard);

            // an add may have filled a batch while we still held the lock
            let again = trigger == Trigger::Size
                && result.is_ok()
                && self.size_ready(&self.lock_state());
            if !again {
                return result;
            }
        }
    }

    async fn drain_locked(&self, trigger: Trigger) -> Result<(), BatchError> {
        while let Some(batch) = self.take_batch(trigger) {
            self.run_batch(batch).await?;
        }
        Ok(())
    }

    fn take_batch(&self, trigger: Trigger) -> Option<Vec<T>> {
        let mut state = self.lock_state();
        if state.items.is_empty() {
            return None;
        }
        let now = Instant::now();
        let ready = match trigger {
            Trigger::Size => self.size_ready(&state),
            Trigger::Timer => !state.in_backoff(now),
            Trigger::Explicit => true,
        };
        if !ready {
            return None;
        }

        let count = self.config.batch_size.min(state.items.len());
        let batch: Vec<T> = state.items.drain(..count).collect();
        state.first_pending_at = if state.items.is_empty() {
            None
        } else {
            Some(now)
        };
        Some(batch)
    }

    async fn run_batch(&self, batch: Vec<T>) -> Result<(), BatchError> {
        let name = self.config.name.clone();
        let size = batch.len();
        let started = Instant::now();

        let result = self.processor.process_batch(batch).await;
        metrics::histogram!(BATCH_FLUSH_DURATION_MS, "accumulator" => name.clone())
            .record(started.elapsed().as_millis() as f64);

        let BatchFailure { retry, error } = match result {
            Ok(()) => {
                {
                    let mut state = self.lock_state();
                    state.attempts = 0;
                    state.retry_at = None;
                }
                self.counters.flushes.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .items_flushed
                    .fetch_add(size as u64, Ordering::Relaxed);
                metrics::counter!(BATCH_FLUSHES, "accumulator" => name.clone()).increment(1);
                metrics::histogram!(BATCH_FLUSH_SIZE, "accumulator" => name).record(size as f64);
                return Ok(());
            }
            Err(failure) => failure,
        };

        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(BATCH_FLUSH_FAILURES, "accumulator" => name.clone()).increment(1);

        let delivered = size.saturating_sub(retry.len()) as u64;
        self.counters
            .items_flushed
            .fetch_add(delivered, Ordering::Relaxed);

        if retry.is_empty() {
            warn!(accumulator = %name, %error, "batch reported failure with nothing to retry");
            return Ok(());
        }

        let attempts = {
            let mut state = self.lock_state();
            state.attempts += 1;
            state.attempts
        };

        if self.config.retry.is_exhausted(attempts) {
            {
                let mut state = self.lock_state();
                state.attempts = 0;
                state.retry_at = None;
            }
            let exhausted = retry.len();
            self.counters
                .exhausted
                .fetch_add(exhausted as u64, Ordering::Relaxed);
            metrics::counter!(BATCH_EXHAUSTED_ITEMS, "accumulator" => name.clone())
                .increment(exhausted as u64);
            let error = BatchError::Exhausted {
                attempts,
                reason: error.to_string(),
            };
            error!(accumulator = %name, items = exhausted, %error, "giving up on batch");
            self.processor.on_exhausted(retry, error).await;
            return Ok(());
        }

        let delay = self.config.retry.time_until_next_retry(attempts - 1);
        let requeued = retry.len();
        {
            let mut state = self.lock_state();
            for item in retry.into_iter().rev() {
                state.items.push_front(item);
            }
            let now = Instant::now();
            state.retry_at = now.checked_add(delay);
            state.first_pending_at.get_or_insert(now);
        }
        self.wakeup.notify_one();

        error!(
            accumulator = %name,
            attempts,
            requeued,
            retry_in_ms = delay.as_millis() as u64,
            %error,
            "batch flush failed, requeued at the front"
        );
        Err(error)
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
