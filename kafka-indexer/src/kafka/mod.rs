// Kafka module - broker abstraction, rdkafka client and rebalance notifications
pub mod broker;
pub mod config;
pub mod kafka_broker;
pub mod metrics_consts;
pub mod rebalance_context;
pub mod types;

// Used in "mod tests" and tests/ directory (integration tests)
pub mod test_utils;

// Public API
pub use broker::{BrokerClient, BrokerError};
pub use config::ConsumerConfigBuilder;
pub use kafka_broker::KafkaBroker;
pub use rebalance_context::{RebalanceEvent, RebalanceReceiver, RebalanceSender};
pub use types::{KafkaRecord, PartitionId, PollBatch, ALL_PARTITIONS};
