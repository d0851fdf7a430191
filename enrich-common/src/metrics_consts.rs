pub const EVENTS_RECEIVED: &str = "enrich_events_received";
pub const BATCHES_RELEASED: &str = "enrich_batches_released";
pub const BATCH_SIZE: &str = "enrich_batch_size";
pub const FORCED_SMALL_BATCH: &str = "enrich_forced_small_batch";
pub const BATCH_DURATION: &str = "enrich_batch_duration_seconds";
pub const BATCHES_FAILED: &str = "enrich_batches_failed";
pub const KEYS_COLLECTED: &str = "enrich_keys_collected";
pub const KEYS_DEDUPLICATED: &str = "enrich_keys_deduplicated";
pub const KEYS_REJECTED: &str = "enrich_keys_rejected";
pub const OPERATIONS_ISSUED: &str = "enrich_operations_issued";
pub const OPERATION_RETRIES: &str = "enrich_operation_retries";
pub const OPERATIONS_FAILED: &str = "enrich_operations_failed";
pub const OPERATION_DURATION: &str = "enrich_operation_duration_seconds";
pub const EXECUTOR_IN_FLIGHT: &str = "enrich_executor_in_flight";
pub const OUTPUTS_EMITTED: &str = "enrich_outputs_emitted";
pub const OUTPUTS_SKIPPED: &str = "enrich_outputs_skipped";
pub const SINK_BACKPRESSURE: &str = "enrich_sink_backpressure";
pub const CHECKPOINT_ADVANCED: &str = "enrich_checkpoint_advanced";
pub const CHECKPOINT_POSITION: &str = "enrich_checkpoint_position";
pub const POISON_PILLS: &str = "enrich_poison_pills";
pub const DELIVERIES_FAILED: &str = "enrich_deliveries_failed";
