use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};

use super::broker::{BrokerClient, BrokerError};
use super::rebalance_context::{
    rebalance_channel, RebalanceEvent, RebalanceReceiver, RebalanceSender,
};
use super::types::{KafkaRecord, PartitionId, PollBatch};

/// How long an empty poll idles, so loops driven by the in-memory broker do
/// not spin.
const EMPTY_POLL_IDLE: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
struct PartitionLog {
    /// Retained records, `low..high`
    records: VecDeque<KafkaRecord>,
    low: i64,
    high: i64,
    committed: Option<i64>,
    position: Option<i64>,
}

impl PartitionLog {
    fn record_at(&self, offset: i64) -> Option<&KafkaRecord> {
        if offset < self.low || offset >= self.high {
            return None;
        }
        self.records.get((offset - self.low) as usize)
    }
}

#[derive(Debug)]
struct State {
    topic: String,
    partitions: BTreeMap<PartitionId, PartitionLog>,
    assignment: BTreeSet<PartitionId>,
    max_poll_records: usize,
    rebalance_tx: Option<RebalanceSender>,
    rebalances_on_poll: VecDeque<BTreeSet<PartitionId>>,
    failing_seeks: BTreeSet<PartitionId>,
    poll_failures: VecDeque<KafkaError>,
    commit_failures: usize,
    poll_count: usize,
    seek_history: Vec<(PartitionId, i64)>,
    commit_history: Vec<BTreeMap<PartitionId, i64>>,
}

impl State {
    fn log(
        &self,
        operation: &'static str,
        partition: PartitionId,
    ) -> Result<&PartitionLog, BrokerError> {
        self.partitions.get(&partition).ok_or_else(|| {
            BrokerError::partition(
                operation,
                partition,
                KafkaError::MetadataFetch(RDKafkaErrorCode::UnknownPartition),
            )
        })
    }

    fn fetch_position(&self, partition: PartitionId) -> Option<i64> {
        let log = self.partitions.get(&partition)?;
        Some(log.position.or(log.committed).unwrap_or(log.low))
    }

    fn apply_rebalance(&mut self, next: BTreeSet<PartitionId>) {
        let revoked: BTreeSet<_> = self.assignment.difference(&next).copied().collect();
        let assigned: BTreeSet<_> = next.difference(&self.assignment).copied().collect();

        for partition in &revoked {
            if let Some(log) = self.partitions.get_mut(partition) {
                log.position = None;
            }
        }
        self.assignment = next;

        if let Some(tx) = &self.rebalance_tx {
            if !revoked.is_empty() {
                tx.send(RebalanceEvent::Revoked(revoked)).ok();
            }
            if !assigned.is_empty() {
                tx.send(RebalanceEvent::Assigned(assigned)).ok();
            }
        }
    }

    fn drain(&mut self) -> PollBatch {
        let mut batch = PollBatch::new();
        let assigned: Vec<PartitionId> = self.assignment.iter().copied().collect();

        // Round robin so one busy partition cannot starve the rest
        loop {
            let mut progressed = false;
            for partition in &assigned {
                if batch.len() >= self.max_poll_records {
                    return batch;
                }
                let Some(position) = self.fetch_position(*partition) else {
                    continue;
                };
                let Some(log) = self.partitions.get_mut(partition) else {
                    continue;
                };
                if let Some(record) = log.record_at(position).cloned() {
                    log.position = Some(position + 1);
                    batch.push(record);
                    progressed = true;
                }
            }
            if !progressed {
                return batch;
            }
        }
    }
}

/// In-memory single-topic broker for driving the poll loop in tests.
///
/// Cloning yields another handle to the same state, so a test can keep a
/// handle for setup and inspection while the loop owns another.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new("test-topic")
    }
}

impl InMemoryBroker {
    pub fn new(topic: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                topic: topic.to_string(),
                partitions: BTreeMap::new(),
                assignment: BTreeSet::new(),
                max_poll_records: 500,
                rebalance_tx: None,
                rebalances_on_poll: VecDeque::new(),
                failing_seeks: BTreeSet::new(),
                poll_failures: VecDeque::new(),
                commit_failures: 0,
                poll_count: 0,
                seek_history: Vec::new(),
                commit_history: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn with_max_poll_records(self, max: usize) -> Self {
        self.state().max_poll_records = max;
        self
    }

    /// Create `partition` with retained records at offsets `low..high`.
    pub fn add_partition(&self, partition: PartitionId, low: i64, high: i64) {
        let mut state = self.state();
        let topic = state.topic.clone();
        let records = (low..high)
            .map(|offset| synthetic_record(&topic, partition, offset))
            .collect();
        state.partitions.insert(
            partition,
            PartitionLog {
                records,
                low,
                high,
                committed: None,
                position: None,
            },
        );
    }

    /// Append a record to the end of `partition`, returning its offset.
    pub fn produce(&self, partition: PartitionId, payload: Option<&[u8]>) -> i64 {
        let mut state = self.state();
        let topic = state.topic.clone();
        let log = state.partitions.entry(partition).or_default();
        let offset = log.high;
        log.records.push_back(KafkaRecord::new(
            topic,
            partition,
            offset,
            None,
            payload.map(<[u8]>::to_vec),
            Some(SystemTime::now()),
        ));
        log.high += 1;
        offset
    }

    pub fn set_committed(&self, partition: PartitionId, offset: i64) {
        self.state().partitions.entry(partition).or_default().committed = Some(offset);
    }

    /// Set the initial assignment without emitting rebalance events.
    pub fn assign(&self, partitions: impl IntoIterator<Item = PartitionId>) {
        self.state().assignment = partitions.into_iter().collect();
    }

    /// Change the assignment now, emitting revoke/assign events.
    pub fn rebalance(&self, partitions: impl IntoIterator<Item = PartitionId>) {
        self.state().apply_rebalance(partitions.into_iter().collect());
    }

    /// Change the assignment during the next non-failing poll, after that
    /// poll has fetched its records. Models a rebalance racing with a fetch.
    pub fn rebalance_on_next_poll(&self, partitions: impl IntoIterator<Item = PartitionId>) {
        self.state()
            .rebalances_on_poll
            .push_back(partitions.into_iter().collect());
    }

    /// Channel receiving this broker's rebalance notifications. Replaces any
    /// earlier subscriber.
    pub fn subscribe_rebalances(&self) -> RebalanceReceiver {
        let (tx, rx) = rebalance_channel();
        self.state().rebalance_tx = Some(tx);
        rx
    }

    pub fn fail_seeks_for(&self, partition: PartitionId) {
        self.state().failing_seeks.insert(partition);
    }

    pub fn fail_next_poll(&self, error: KafkaError) {
        self.state().poll_failures.push_back(error);
    }

    pub fn fail_next_commits(&self, count: usize) {
        self.state().commit_failures = count;
    }

    pub fn poll_count(&self) -> usize {
        self.state().poll_count
    }

    pub fn seek_history(&self) -> Vec<(PartitionId, i64)> {
        self.state().seek_history.clone()
    }

    pub fn commit_history(&self) -> Vec<BTreeMap<PartitionId, i64>> {
        self.state().commit_history.clone()
    }

    pub fn committed_offsets(&self) -> BTreeMap<PartitionId, i64> {
        self.state()
            .partitions
            .iter()
            .filter_map(|(p, log)| log.committed.map(|c| (*p, c)))
            .collect()
    }

    pub fn current_position(&self, partition: PartitionId) -> Option<i64> {
        self.state().partitions.get(&partition)?.position
    }
}

fn synthetic_record(topic: &str, partition: PartitionId, offset: i64) -> KafkaRecord {
    KafkaRecord::new(
        topic.to_string(),
        partition,
        offset,
        Some(format!("key-{partition}").into_bytes()),
        Some(format!("p{partition}-o{offset}").into_bytes()),
        None,
    )
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn poll(&mut self, timeout: Duration) -> Result<PollBatch, BrokerError> {
        let batch = {
            let mut state = self.state();
            state.poll_count += 1;

            if let Some(error) = state.poll_failures.pop_front() {
                return Err(BrokerError::client("poll", error));
            }

            let batch = state.drain();
            if let Some(next) = state.rebalances_on_poll.pop_front() {
                state.apply_rebalance(next);
            }
            batch
        };

        if batch.is_empty() {
            tokio::time::sleep(timeout.min(EMPTY_POLL_IDLE)).await;
        }
        Ok(batch)
    }

    fn seek(&mut self, partition: PartitionId, offset: i64) -> Result<(), BrokerError> {
        let mut state = self.state();
        if state.failing_seeks.contains(&partition) {
            return Err(BrokerError::partition(
                "seek",
                partition,
                KafkaError::Seek("injected seek failure".to_string()),
            ));
        }
        if !state.assignment.contains(&partition) {
            return Err(BrokerError::partition(
                "seek",
                partition,
                KafkaError::Seek(format!("partition {partition} is not assigned")),
            ));
        }

        state.partitions.entry(partition).or_default().position = Some(offset);
        state.seek_history.push((partition, offset));
        Ok(())
    }

    fn position(&self, partition: PartitionId) -> Result<Option<i64>, BrokerError> {
        Ok(self.state().log("position", partition)?.position)
    }

    fn beginning_offset(&self, partition: PartitionId) -> Result<i64, BrokerError> {
        Ok(self.state().log("fetch_watermarks", partition)?.low)
    }

    fn end_offset(&self, partition: PartitionId) -> Result<i64, BrokerError> {
        Ok(self.state().log("fetch_watermarks", partition)?.high)
    }

    fn committed(&self, partition: PartitionId) -> Result<Option<i64>, BrokerError> {
        Ok(self.state().log("committed", partition)?.committed)
    }

    fn commit(&mut self, offsets: &BTreeMap<PartitionId, i64>) -> Result<(), BrokerError> {
        let mut state = self.state();
        if state.commit_failures > 0 {
            state.commit_failures -= 1;
            return Err(BrokerError::client(
                "commit",
                KafkaError::ConsumerCommit(RDKafkaErrorCode::RequestTimedOut),
            ));
        }

        for (partition, offset) in offsets {
            state.partitions.entry(*partition).or_default().committed = Some(*offset);
        }
        state.commit_history.push(offsets.clone());
        Ok(())
    }

    fn assignment(&self) -> Result<BTreeSet<PartitionId>, BrokerError> {
        Ok(self.state().assignment.clone())
    }
}
