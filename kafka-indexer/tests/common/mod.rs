//! Shared test utilities for integration tests.
//!
//! Provides a scripted sink and helpers for driving poll loops against the
//! in-memory broker.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kafka_indexer::kafka::test_utils::InMemoryBroker;
use kafka_indexer::kafka::types::{KafkaRecord, PartitionId};
use kafka_indexer::{BatchSink, PollCommitLoop, ProcessingError, StartOptionMap};
use tokio_util::sync::CancellationToken;

pub const TEST_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// What the sink answers for one call
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Commit,
    Decline,
    Recoverable,
    NonRecoverable,
}

/// Sink recording every call, answering `complete_poll` from a script.
/// Once the script runs out every batch is committed.
#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<(usize, PartitionId, i64)>>,
    completed: Mutex<Vec<BTreeMap<PartitionId, i64>>>,
    verdicts: Mutex<VecDeque<Verdict>>,
    record_failures: Mutex<BTreeMap<(PartitionId, i64), Verdict>>,
    cancel_on_complete: Mutex<Option<CancellationToken>>,
}

#[allow(dead_code)]
impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_verdicts(verdicts: impl IntoIterator<Item = Verdict>) -> Arc<Self> {
        let sink = Self::default();
        sink.verdicts.lock().unwrap().extend(verdicts);
        Arc::new(sink)
    }

    /// Fail `process_message` for one record, once
    pub fn fail_record(&self, partition: PartitionId, offset: i64, verdict: Verdict) {
        self.record_failures
            .lock()
            .unwrap()
            .insert((partition, offset), verdict);
    }

    /// Cancel `token` from inside the next `complete_poll`
    pub fn cancel_on_complete(&self, token: CancellationToken) {
        *self.cancel_on_complete.lock().unwrap() = Some(token);
    }

    pub fn delivered(&self) -> Vec<(usize, PartitionId, i64)> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn delivered_offsets(&self) -> Vec<(PartitionId, i64)> {
        self.delivered()
            .into_iter()
            .map(|(_, partition, offset)| (partition, offset))
            .collect()
    }

    pub fn completed(&self) -> Vec<BTreeMap<PartitionId, i64>> {
        self.completed.lock().unwrap().clone()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.lock().unwrap().len()
    }
}

fn into_result(verdict: Verdict, what: &str) -> Result<bool, ProcessingError> {
    match verdict {
        Verdict::Commit => Ok(true),
        Verdict::Decline => Ok(false),
        Verdict::Recoverable => Err(ProcessingError::recoverable(anyhow::anyhow!(
            "{what}: downstream unavailable"
        ))),
        Verdict::NonRecoverable => Err(ProcessingError::non_recoverable(anyhow::anyhow!(
            "{what}: mapping rejected document"
        ))),
    }
}

#[async_trait]
impl BatchSink for RecordingSink {
    async fn process_message(
        &self,
        record: &KafkaRecord,
        consumer_id: usize,
    ) -> Result<bool, ProcessingError> {
        self.delivered
            .lock()
            .unwrap()
            .push((consumer_id, record.partition(), record.offset()));

        let failure = self
            .record_failures
            .lock()
            .unwrap()
            .remove(&(record.partition(), record.offset()));
        match failure {
            Some(verdict) => into_result(verdict, "process_message"),
            None => Ok(true),
        }
    }

    async fn complete_poll(
        &self,
        _consumer_id: usize,
        end_positions: &BTreeMap<PartitionId, i64>,
    ) -> Result<bool, ProcessingError> {
        self.completed.lock().unwrap().push(end_positions.clone());

        if let Some(token) = self.cancel_on_complete.lock().unwrap().take() {
            token.cancel();
        }

        let verdict = self
            .verdicts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Verdict::Commit);
        into_result(verdict, "complete_poll")
    }
}

/// Broker with `partitions` each holding offsets `0..records`, all assigned
#[allow(dead_code)]
pub fn broker_with(partitions: &[PartitionId], records: i64) -> InMemoryBroker {
    let broker = InMemoryBroker::new("events");
    for partition in partitions {
        broker.add_partition(*partition, 0, records);
    }
    broker.assign(partitions.iter().copied());
    broker
}

#[allow(dead_code)]
pub fn poll_loop<S: BatchSink + ?Sized>(
    consumer_id: usize,
    broker: &InMemoryBroker,
    sink: Arc<S>,
    options: StartOptionMap,
) -> PollCommitLoop<InMemoryBroker, S> {
    let rebalances = broker.subscribe_rebalances();
    PollCommitLoop::new(consumer_id, broker.clone(), rebalances, sink, Arc::new(options))
        .with_poll_timeout(TEST_POLL_TIMEOUT)
}

/// Wait until `condition` holds, failing the test after two seconds
#[allow(dead_code)]
pub async fn wait_for(description: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {description}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
