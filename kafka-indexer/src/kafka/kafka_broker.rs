use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::{Offset, TopicPartitionList};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::kafka::broker::{BrokerClient, BrokerError};
use crate::kafka::metrics_consts::{
    KAFKA_ASSIGNED_PARTITIONS, KAFKA_CONSUMER_ERRORS, KAFKA_CONSUMER_FATAL_ERRORS,
    KAFKA_POLL_DURATION, KAFKA_POLL_RECORDS,
};
use crate::kafka::rebalance_context::{
    partitions_of, rebalance_channel, IndexerConsumerContext, RebalanceReceiver,
};
use crate::kafka::types::{KafkaRecord, PartitionId, PollBatch};

/// `BrokerClient` over an rdkafka `StreamConsumer` subscribed to one topic.
pub struct KafkaBroker {
    consumer: StreamConsumer<IndexerConsumerContext>,
    consumer_id: usize,
    topic: String,
    max_poll_records: usize,
    metadata_timeout: Duration,
}

impl KafkaBroker {
    /// Create the consumer, subscribe it to `topic`, and return the channel
    /// its rebalance callbacks publish to.
    pub fn new(
        config: &ClientConfig,
        consumer_id: usize,
        topic: &str,
        max_poll_records: usize,
        metadata_timeout: Duration,
    ) -> Result<(Self, RebalanceReceiver)> {
        let (rebalance_tx, rebalance_rx) = rebalance_channel();
        let context = IndexerConsumerContext::new(consumer_id, topic.to_string(), rebalance_tx);

        let consumer: StreamConsumer<IndexerConsumerContext> = config
            .create_with_context(context)
            .context("Failed to create Kafka consumer")?;

        let err_msg = format!("Failed to subscribe to topic: {topic}");
        consumer.subscribe(&[topic]).context(err_msg)?;

        info!(
            consumer_id = consumer_id,
            topic = topic,
            "Subscribed Kafka consumer"
        );

        Ok((
            Self {
                consumer,
                consumer_id,
                topic: topic.to_string(),
                max_poll_records,
                metadata_timeout,
            },
            rebalance_rx,
        ))
    }

    fn single_partition(&self, partition: PartitionId) -> TopicPartitionList {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(&self.topic, partition);
        tpl
    }

    /// Wait out a transient consume error, or hand back a fatal one.
    /// `attempt` counts consecutive errors within the current poll.
    async fn handle_consume_error(&self, e: KafkaError, attempt: u64) -> Option<KafkaError> {
        match classify_consume_error(&e) {
            ConsumeErrorClass::Fatal(label) => {
                error!(consumer_id = self.consumer_id, error = label, "Fatal Kafka consumer error: {e:?}");
                metrics::counter!(KAFKA_CONSUMER_FATAL_ERRORS, "error" => label).increment(1);
                Some(e)
            }
            ConsumeErrorClass::Transient { label, backoff } => {
                warn!(
                    consumer_id = self.consumer_id,
                    error = label,
                    attempt = attempt,
                    "Transient Kafka consumer error, retrying: {e:?}"
                );
                metrics::counter!(KAFKA_CONSUMER_ERRORS, "error" => label).increment(1);
                let delay = backoff.delay(attempt);
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                None
            }
        }
    }
}

/// How long to wait before consuming again after a transient error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backoff {
    None,
    Fixed(Duration),
    /// `step * attempt`, with `attempt` capped
    Linear { step: Duration, max_attempts: u32 },
}

impl Backoff {
    fn delay(self, attempt: u64) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => delay,
            Backoff::Linear { step, max_attempts } => {
                let capped = u32::try_from(attempt).unwrap_or(u32::MAX).min(max_attempts);
                step * capped
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsumeErrorClass {
    Transient { label: &'static str, backoff: Backoff },
    Fatal(&'static str),
}

fn classify_consume_error(e: &KafkaError) -> ConsumeErrorClass {
    use ConsumeErrorClass::{Fatal, Transient};

    match e {
        KafkaError::MessageConsumption(
            RDKafkaErrorCode::PartitionEOF | RDKafkaErrorCode::OperationTimedOut,
        ) => Transient {
            label: "idle",
            backoff: Backoff::None,
        },
        // The reset policy moves the fetch position; give the broker a moment
        KafkaError::MessageConsumption(RDKafkaErrorCode::OffsetOutOfRange) => Transient {
            label: "offset_out_of_range",
            backoff: Backoff::Fixed(Duration::from_millis(500)),
        },
        KafkaError::MessageConsumptionFatal(_) => Fatal("consumer"),
        KafkaError::Global(RDKafkaErrorCode::Authentication) => Fatal("authentication"),
        KafkaError::Global(
            RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure,
        ) => Transient {
            label: "broker_unreachable",
            backoff: Backoff::Linear {
                step: Duration::from_secs(1),
                max_attempts: 5,
            },
        },
        KafkaError::Canceled => Fatal("canceled"),
        _ => Transient {
            label: "consumer",
            backoff: Backoff::Linear {
                step: Duration::from_millis(100),
                max_attempts: 10,
            },
        },
    }
}

fn known_offset(offset: Offset) -> Option<i64> {
    match offset {
        Offset::Offset(o) => Some(o),
        _ => None,
    }
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    /// Collect records until `max_poll_records` is reached or `timeout`
    /// elapses, whichever comes first.
    async fn poll(&mut self, timeout: Duration) -> Result<PollBatch, BrokerError> {
        let start = Instant::now();
        let mut batch = PollBatch::new_with_size_hint(self.max_poll_records);
        let deadline = sleep(timeout);
        tokio::pin!(deadline);
        let mut kafka_error_count = 0;

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    break;
                }

                next_msg = self.consumer.recv() => {
                    match next_msg {
                        Ok(borrowed_message) => {
                            batch.push(KafkaRecord::from_borrowed_message(&borrowed_message));
                            kafka_error_count = 0;
                        }
                        Err(e) => {
                            kafka_error_count += 1;
                            if let Some(fatal) = self.handle_consume_error(e, kafka_error_count).await {
                                return Err(BrokerError::client("poll", fatal));
                            }
                        }
                    }

                    if batch.len() >= self.max_poll_records {
                        break;
                    }
                }
            }
        }

        metrics::histogram!(KAFKA_POLL_DURATION).record(start.elapsed().as_secs_f64());
        metrics::histogram!(KAFKA_POLL_RECORDS).record(batch.len() as f64);
        Ok(batch)
    }

    fn seek(&mut self, partition: PartitionId, offset: i64) -> Result<(), BrokerError> {
        self.consumer
            .seek(
                &self.topic,
                partition,
                Offset::Offset(offset),
                self.metadata_timeout,
            )
            .map_err(|e| BrokerError::partition("seek", partition, e))
    }

    fn position(&self, partition: PartitionId) -> Result<Option<i64>, BrokerError> {
        let positions = self
            .consumer
            .position()
            .map_err(|e| BrokerError::partition("position", partition, e))?;

        Ok(positions
            .find_partition(&self.topic, partition)
            .and_then(|elem| known_offset(elem.offset())))
    }

    fn beginning_offset(&self, partition: PartitionId) -> Result<i64, BrokerError> {
        let (low, _) = self
            .consumer
            .fetch_watermarks(&self.topic, partition, self.metadata_timeout)
            .map_err(|e| BrokerError::partition("fetch_watermarks", partition, e))?;
        Ok(low)
    }

    fn end_offset(&self, partition: PartitionId) -> Result<i64, BrokerError> {
        let (_, high) = self
            .consumer
            .fetch_watermarks(&self.topic, partition, self.metadata_timeout)
            .map_err(|e| BrokerError::partition("fetch_watermarks", partition, e))?;
        Ok(high)
    }

    fn committed(&self, partition: PartitionId) -> Result<Option<i64>, BrokerError> {
        let committed = self
            .consumer
            .committed_offsets(self.single_partition(partition), self.metadata_timeout)
            .map_err(|e| BrokerError::partition("committed", partition, e))?;

        Ok(committed
            .find_partition(&self.topic, partition)
            .and_then(|elem| known_offset(elem.offset())))
    }

    fn commit(&mut self, offsets: &BTreeMap<PartitionId, i64>) -> Result<(), BrokerError> {
        if offsets.is_empty() {
            return Ok(());
        }

        let mut list = TopicPartitionList::new();
        for (partition, next_offset) in offsets {
            list.add_partition_offset(&self.topic, *partition, Offset::Offset(*next_offset))
                .map_err(|e| BrokerError::partition("commit", *partition, e))?;
        }

        self.consumer
            .commit(&list, CommitMode::Sync)
            .map_err(|e| BrokerError::client("commit", e))
    }

    fn assignment(&self) -> Result<BTreeSet<PartitionId>, BrokerError> {
        let tpl = self
            .consumer
            .assignment()
            .map_err(|e| BrokerError::client("assignment", e))?;
        let partitions = partitions_of(&tpl, &self.topic);
        metrics::gauge!(KAFKA_ASSIGNED_PARTITIONS, "consumer_id" => self.consumer_id.to_string())
            .set(partitions.len() as f64);
        Ok(partitions)
    }
}
