// ==== Start position metrics ====
/// Counter for partitions positioned at the start of an epoch, labelled by directive
pub const START_POSITION_SEEKS_COUNTER: &str = "start_position_seeks_total";

/// Counter for custom offsets that fell outside the retained range and were clamped
pub const START_POSITION_CLAMPED_COUNTER: &str = "start_position_clamped_total";

/// Counter for start option resolutions that degraded to the restart default
pub const START_OPTION_FALLBACK_COUNTER: &str = "start_option_fallback_total";

// ==== Poll loop metrics ====
/// Counter for batches by commit decision outcome
/// (committed/declined/recoverable/non_recoverable)
pub const BATCH_OUTCOME_COUNTER: &str = "indexer_batches_total";

/// Counter for records handed to the sink, labelled by result (handled/not_handled/failed)
pub const RECORDS_DELIVERED_COUNTER: &str = "indexer_records_delivered_total";

/// Counter for records discarded because their partition left the assignment
pub const RECORDS_DISCARDED_COUNTER: &str = "indexer_records_discarded_total";

/// Counter for offset commits, labelled by result (success/failure)
pub const COMMITS_COUNTER: &str = "indexer_commits_total";

/// Counter for batch rewinds after a withheld commit
pub const REWINDS_COUNTER: &str = "indexer_rewinds_total";

/// Histogram for end-to-end batch processing duration (deliver + commit decision)
pub const BATCH_PROCESSING_DURATION_HISTOGRAM: &str = "indexer_batch_processing_duration_seconds";

/// Histogram for batch size (records per non-empty poll)
pub const BATCH_SIZE_HISTOGRAM: &str = "indexer_batch_size_records";

/// Counter for consumer instances that halted, labelled by reason
pub const CONSUMER_HALTS_COUNTER: &str = "indexer_consumer_halts_total";

/// Gauge for running consumer instances
pub const CONSUMERS_RUNNING_GAUGE: &str = "indexer_consumers_running";

// ==== Sink metrics ====
/// Counter for records the log sink accepted or rejected
pub const LOG_SINK_RECORDS_COUNTER: &str = "log_sink_records_total";
