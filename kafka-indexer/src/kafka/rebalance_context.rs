use std::collections::BTreeSet;

use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::{ClientContext, TopicPartitionList};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::kafka::metrics_consts::{KAFKA_COMMIT_CALLBACKS, KAFKA_REBALANCE_EVENTS};
use crate::kafka::types::PartitionId;

/// Assignment changes pushed to the poll loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    /// Partitions were added to this consumer
    Assigned(BTreeSet<PartitionId>),
    /// Partitions were taken away. Records already fetched for them must not
    /// be delivered or committed.
    Revoked(BTreeSet<PartitionId>),
}

impl RebalanceEvent {
    pub fn partitions(&self) -> &BTreeSet<PartitionId> {
        match self {
            RebalanceEvent::Assigned(p) | RebalanceEvent::Revoked(p) => p,
        }
    }
}

/// Sender half, held by whatever observes rebalances
pub type RebalanceSender = mpsc::UnboundedSender<RebalanceEvent>;
/// Receiver half, drained by the poll loop
pub type RebalanceReceiver = mpsc::UnboundedReceiver<RebalanceEvent>;

pub fn rebalance_channel() -> (RebalanceSender, RebalanceReceiver) {
    mpsc::unbounded_channel()
}

/// Partition ids in `tpl` that belong to `topic`
pub fn partitions_of(tpl: &TopicPartitionList, topic: &str) -> BTreeSet<PartitionId> {
    tpl.elements_for_topic(topic)
        .iter()
        .map(|elem| elem.partition())
        .collect()
}

/// rdkafka context forwarding rebalance callbacks to the poll loop.
///
/// The callbacks run on the librdkafka thread inside `recv()`, so they only
/// push notifications; seeking happens in the loop once the batch in flight
/// has been settled.
pub struct IndexerConsumerContext {
    consumer_id: usize,
    topic: String,
    rebalance_tx: RebalanceSender,
}

impl IndexerConsumerContext {
    pub fn new(consumer_id: usize, topic: String, rebalance_tx: RebalanceSender) -> Self {
        Self {
            consumer_id,
            topic,
            rebalance_tx,
        }
    }

    fn notify(&self, event: RebalanceEvent) {
        let label = match &event {
            RebalanceEvent::Assigned(_) => "assigned",
            RebalanceEvent::Revoked(_) => "revoked",
        };
        metrics::counter!(KAFKA_REBALANCE_EVENTS, "event_type" => label).increment(1);

        if let Err(e) = self.rebalance_tx.send(event) {
            // Receiver is gone once the loop has stopped
            warn!(
                consumer_id = self.consumer_id,
                "Dropping rebalance notification: {}", e
            );
        }
    }
}

impl ClientContext for IndexerConsumerContext {}

impl ConsumerContext for IndexerConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                // cooperative-sticky sends empty revokes on every group change
                if partitions.count() == 0 {
                    debug!(
                        consumer_id = self.consumer_id,
                        "Skipping empty revoke rebalance"
                    );
                    return;
                }

                let revoked = partitions_of(partitions, &self.topic);
                info!(
                    consumer_id = self.consumer_id,
                    partitions = ?revoked,
                    "Revoking {} partitions",
                    revoked.len()
                );
                self.notify(RebalanceEvent::Revoked(revoked));
            }
            Rebalance::Assign(partitions) => {
                debug!(
                    consumer_id = self.consumer_id,
                    "Pre-rebalance assign event for {} partitions",
                    partitions.count()
                );
            }
            Rebalance::Error(e) => {
                error!(consumer_id = self.consumer_id, "Rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                if partitions.count() == 0 {
                    debug!(
                        consumer_id = self.consumer_id,
                        "Skipping empty assign rebalance"
                    );
                    return;
                }

                let assigned = partitions_of(partitions, &self.topic);
                info!(
                    consumer_id = self.consumer_id,
                    partitions = ?assigned,
                    "Assigned {} partitions",
                    assigned.len()
                );
                self.notify(RebalanceEvent::Assigned(assigned));
            }
            Rebalance::Revoke(_) => {
                debug!(consumer_id = self.consumer_id, "Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!(consumer_id = self.consumer_id, "Post-rebalance error: {}", e);
            }
        }
    }

    fn commit_callback(
        &self,
        result: rdkafka::error::KafkaResult<()>,
        offsets: &TopicPartitionList,
    ) {
        match result {
            Ok(_) => {
                metrics::counter!(KAFKA_COMMIT_CALLBACKS, "result" => "success").increment(1);
                debug!(
                    consumer_id = self.consumer_id,
                    "Committed offsets for {} partitions",
                    offsets.count()
                );
            }
            Err(e) => {
                metrics::counter!(KAFKA_COMMIT_CALLBACKS, "result" => "failure").increment(1);
                warn!(
                    consumer_id = self.consumer_id,
                    "Failed to commit offsets: {}", e
                );
            }
        }
    }
}
