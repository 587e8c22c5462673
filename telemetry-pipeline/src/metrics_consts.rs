pub const EVENTS_SENT: &str = "telemetry_producer_events_sent_total";
pub const EVENTS_SEND_FAILED: &str = "telemetry_producer_events_failed_total";
pub const PRODUCER_BATCHES: &str = "telemetry_producer_batches_total";
pub const PRODUCER_DEAD_LETTERED: &str = "telemetry_producer_dead_lettered_total";

pub const BATCH_FLUSHES: &str = "telemetry_batch_flushes_total";
pub const BATCH_FLUSH_FAILURES: &str = "telemetry_batch_flush_failures_total";
pub const BATCH_FLUSH_SIZE: &str = "telemetry_batch_flush_size";
pub const BATCH_FLUSH_DURATION_MS: &str = "telemetry_batch_flush_duration_ms";
pub const BATCH_EXHAUSTED_ITEMS: &str = "telemetry_batch_exhausted_items_total";
pub const BATCH_PENDING: &str = "telemetry_batch_pending_items";

pub const DEDUP_ENTRIES: &str = "telemetry_dedup_entries";
pub const DEDUP_PURGED: &str = "telemetry_dedup_purged_total";

pub const CONSUMER_MESSAGES_RECEIVED: &str = "telemetry_consumer_messages_received_total";
pub const CONSUMER_MESSAGES_PROCESSED: &str = "telemetry_consumer_messages_processed_total";
pub const CONSUMER_DUPLICATES: &str = "telemetry_consumer_duplicates_total";
pub const CONSUMER_HANDLER_ERRORS: &str = "telemetry_consumer_handler_errors_total";
pub const CONSUMER_DEAD_LETTERED: &str = "telemetry_consumer_dead_lettered_total";
pub const CONSUMER_COMMITS: &str = "telemetry_consumer_commits_total";
pub const CONSUMER_COMMIT_FAILURES: &str = "telemetry_consumer_commit_failures_total";
pub const CONSUMER_BATCH_SIZE: &str = "telemetry_consumer_batch_size";
pub const CONSUMER_BATCH_DURATION_MS: &str = "telemetry_consumer_batch_duration_ms";
pub const CONSUMER_HANDLER_DURATION_MS: &str = "telemetry_consumer_handler_duration_ms";
pub const CONSUMER_IN_FLIGHT: &str = "telemetry_consumer_handlers_in_flight";

pub const STAGE_DROPPED: &str = "telemetry_stage_dropped_total";
pub const STAGE_FAILED: &str = "telemetry_stage_failed_total";

pub const DEAD_LETTER_PUBLISH_RETRIES: &str = "telemetry_dead_letter_publish_retries_total";
