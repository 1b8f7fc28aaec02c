use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::kafka::types::{PartitionId, PollBatch};

/// Errors surfaced by a broker client. The operation tag lets callers and
/// metrics tell a failed seek from a failed commit.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("kafka error during {operation} for partition {partition}: {source}")]
    Partition {
        operation: &'static str,
        partition: PartitionId,
        #[source]
        source: KafkaError,
    },

    #[error("kafka error during {operation}: {source}")]
    Client {
        operation: &'static str,
        #[source]
        source: KafkaError,
    },
}

impl BrokerError {
    pub fn partition(operation: &'static str, partition: PartitionId, source: KafkaError) -> Self {
        BrokerError::Partition {
            operation,
            partition,
            source,
        }
    }

    pub fn client(operation: &'static str, source: KafkaError) -> Self {
        BrokerError::Client { operation, source }
    }
}

/// What the poll loop needs from a log broker, for a single subscribed topic.
///
/// Offsets are absolute. `commit` takes the next offset to consume for each
/// partition, the same convention Kafka uses for committed offsets.
#[async_trait]
pub trait BrokerClient: Send {
    /// Wait up to `timeout` for records. An empty batch is not an error.
    /// Only errors the client cannot recover from internally are returned.
    async fn poll(&mut self, timeout: Duration) -> Result<PollBatch, BrokerError>;

    /// Set the fetch position of an assigned partition.
    fn seek(&mut self, partition: PartitionId, offset: i64) -> Result<(), BrokerError>;

    /// Current fetch position, if the client knows one.
    fn position(&self, partition: PartitionId) -> Result<Option<i64>, BrokerError>;

    /// Oldest retained offset (low watermark).
    fn beginning_offset(&self, partition: PartitionId) -> Result<i64, BrokerError>;

    /// Offset the next produced record will get (high watermark).
    fn end_offset(&self, partition: PartitionId) -> Result<i64, BrokerError>;

    /// Last committed offset for the consumer group, if any.
    fn committed(&self, partition: PartitionId) -> Result<Option<i64>, BrokerError>;

    /// Durably record the next offset to consume for each partition.
    fn commit(&mut self, offsets: &BTreeMap<PartitionId, i64>) -> Result<(), BrokerError>;

    /// Partitions currently owned by this client.
    fn assignment(&self) -> Result<BTreeSet<PartitionId>, BrokerError>;
}
