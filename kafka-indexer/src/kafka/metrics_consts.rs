// ==== Kafka Consumer metrics ====
/// Counter for rebalance callbacks, labelled by event (assigned/revoked)
pub const KAFKA_REBALANCE_EVENTS: &str = "kafka_rebalance_events_total";

/// Counter for transient client errors that the broker client retried past
pub const KAFKA_CONSUMER_ERRORS: &str = "kafka_consumer_errors_total";

/// Counter for client errors that were surfaced as fatal
pub const KAFKA_CONSUMER_FATAL_ERRORS: &str = "kafka_consumer_fatal_errors_total";

/// Histogram for records returned per poll
pub const KAFKA_POLL_RECORDS: &str = "kafka_poll_records";

/// Histogram for time spent inside a single poll
pub const KAFKA_POLL_DURATION: &str = "kafka_poll_duration_seconds";

/// Counter for offset commit callbacks, labelled by result
pub const KAFKA_COMMIT_CALLBACKS: &str = "kafka_commit_callbacks_total";

/// Gauge for partitions currently owned by a consumer instance
pub const KAFKA_ASSIGNED_PARTITIONS: &str = "kafka_assigned_partitions";
