use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ConsumerError, ProcessingError, SeekError};
use crate::kafka::broker::BrokerClient;
use crate::kafka::rebalance_context::{RebalanceEvent, RebalanceReceiver};
use crate::kafka::types::{PartitionId, PollBatch};
use crate::metrics_const::{
    BATCH_OUTCOME_COUNTER, BATCH_PROCESSING_DURATION_HISTOGRAM, BATCH_SIZE_HISTOGRAM,
    COMMITS_COUNTER, CONSUMERS_RUNNING_GAUGE, CONSUMER_HALTS_COUNTER, RECORDS_DELIVERED_COUNTER,
    RECORDS_DISCARDED_COUNTER, REWINDS_COUNTER,
};
use crate::offset_seeker::apply_start_positions;
use crate::sink::BatchSink;
use crate::start_option::StartOptionMap;

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a consumer instance is in its poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Seeking,
    Polling,
    Delivering,
    CommitDecision,
    /// Stopped on an error; no further broker interaction
    Halted,
    /// Stopped on request after settling the batch in flight
    Stopped,
}

/// Counters for one loop's lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub polls: u64,
    pub batches: u64,
    pub records_delivered: u64,
    pub records_discarded: u64,
    pub commits: u64,
    pub failed_commits: u64,
    pub rewinds: u64,
    pub seek_epochs: u64,
}

/// Poll, deliver, decide, commit: one consumer instance's control loop.
///
/// A batch's end positions are committed only after the sink approves them
/// in `complete_poll`. When the sink declines or fails recoverably, the
/// batch's partitions are sought back to the batch start so the next poll
/// redelivers the same records.
pub struct PollCommitLoop<B, S>
where
    B: BrokerClient,
    S: BatchSink + ?Sized,
{
    consumer_id: usize,
    broker: B,
    sink: Arc<S>,
    start_options: Arc<StartOptionMap>,
    rebalance_rx: RebalanceReceiver,
    poll_timeout: Duration,
    shutdown: CancellationToken,
    state: LoopState,
    /// Partitions positioned in the current epoch; only their records are delivered
    epoch: BTreeSet<PartitionId>,
    stats: LoopStats,
}

impl<B, S> PollCommitLoop<B, S>
where
    B: BrokerClient,
    S: BatchSink + ?Sized,
{
    pub fn new(
        consumer_id: usize,
        broker: B,
        rebalance_rx: RebalanceReceiver,
        sink: Arc<S>,
        start_options: Arc<StartOptionMap>,
    ) -> Self {
        Self {
            consumer_id,
            broker,
            sink,
            start_options,
            rebalance_rx,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            shutdown: CancellationToken::new(),
            state: LoopState::Seeking,
            epoch: BTreeSet::new(),
            stats: LoopStats::default(),
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn consumer_id(&self) -> usize {
        self.consumer_id
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn epoch(&self) -> &BTreeSet<PartitionId> {
        &self.epoch
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until cancelled (`Ok`) or halted (`Err`). A halted loop refuses
    /// to run again.
    pub async fn run(&mut self) -> Result<(), ConsumerError> {
        let consumer_id = self.consumer_id;
        if self.state == LoopState::Halted {
            return Err(ConsumerError::AlreadyHalted { consumer_id });
        }
        info!(
            consumer_id = consumer_id,
            poll_timeout_ms = self.poll_timeout.as_millis() as u64,
            "Starting poll loop"
        );
        metrics::gauge!(CONSUMERS_RUNNING_GAUGE).increment(1.0);

        self.state = LoopState::Seeking;
        let result = self.run_until_stopped().await;
        metrics::gauge!(CONSUMERS_RUNNING_GAUGE).decrement(1.0);

        match &result {
            Ok(()) => {
                self.state = LoopState::Stopped;
                self.log_final_positions();
                info!(
                    consumer_id = consumer_id,
                    stats = ?self.stats,
                    "Poll loop stopped"
                );
            }
            Err(e) => {
                self.state = LoopState::Halted;
                metrics::counter!(CONSUMER_HALTS_COUNTER, "reason" => e.reason()).increment(1);
                error!(
                    consumer_id = consumer_id,
                    stats = ?self.stats,
                    "Poll loop halted: {e:#}"
                );
            }
        }

        result
    }

    async fn run_until_stopped(&mut self) -> Result<(), ConsumerError> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            if self.state == LoopState::Seeking {
                self.seek_assignment()?;
            }

            self.state = LoopState::Polling;
            let polled = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    debug!(consumer_id = self.consumer_id, "Abandoning poll on shutdown");
                    return Ok(());
                }

                polled = self.broker.poll(self.poll_timeout) => polled,
            };
            self.stats.polls += 1;

            let mut batch = polled.map_err(|source| ConsumerError::Broker {
                consumer_id: self.consumer_id,
                source,
            })?;

            // Safe point: rebalance callbacks only fire inside poll
            let rebalanced = self.drain_rebalance_events();
            self.discard_foreign_records(&mut batch);

            if !batch.is_empty() {
                self.process_batch(batch).await?;
            }

            if rebalanced {
                self.state = LoopState::Seeking;
            }
        }
    }

    /// Position partitions new to this epoch. Partitions carried over from
    /// the previous epoch keep their fetch position.
    fn seek_assignment(&mut self) -> Result<(), ConsumerError> {
        self.state = LoopState::Seeking;
        let consumer_id = self.consumer_id;

        let assignment = self
            .broker
            .assignment()
            .map_err(|source| ConsumerError::Broker {
                consumer_id,
                source,
            })?;
        let newly_assigned: BTreeSet<PartitionId> =
            assignment.difference(&self.epoch).copied().collect();

        let outcomes =
            apply_start_positions(&self.start_options, &newly_assigned, &mut self.broker)
                .map_err(|source| ConsumerError::Seek {
                    consumer_id,
                    source,
                })?;

        let clamped = outcomes.iter().filter(|o| o.clamped).count();
        self.epoch = assignment;
        self.stats.seek_epochs += 1;

        info!(
            consumer_id = consumer_id,
            partitions = ?self.epoch,
            positioned = outcomes.len(),
            clamped = clamped,
            "Partition assignment positioned"
        );
        Ok(())
    }

    /// Apply pending rebalance notifications. Revoked partitions leave the
    /// epoch immediately; assigned ones join at the next seek.
    fn drain_rebalance_events(&mut self) -> bool {
        let mut rebalanced = false;
        loop {
            match self.rebalance_rx.try_recv() {
                Ok(RebalanceEvent::Revoked(partitions)) => {
                    info!(
                        consumer_id = self.consumer_id,
                        partitions = ?partitions,
                        "Partitions revoked"
                    );
                    self.epoch.retain(|p| !partitions.contains(p));
                    rebalanced = true;
                }
                Ok(RebalanceEvent::Assigned(partitions)) => {
                    info!(
                        consumer_id = self.consumer_id,
                        partitions = ?partitions,
                        "Partitions assigned"
                    );
                    rebalanced = true;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        rebalanced
    }

    /// Drop records of partitions outside the current epoch. They were either
    /// revoked or have not been positioned yet.
    fn discard_foreign_records(&mut self, batch: &mut PollBatch) {
        if batch.is_empty() {
            return;
        }

        let dropped = batch.retain_partitions(&self.epoch);
        if dropped > 0 {
            warn!(
                consumer_id = self.consumer_id,
                dropped = dropped,
                epoch = ?self.epoch,
                "Discarding records of partitions outside the current assignment"
            );
            metrics::counter!(RECORDS_DISCARDED_COUNTER).increment(dropped as u64);
            self.stats.records_discarded += dropped as u64;
        }
    }

    async fn process_batch(&mut self, batch: PollBatch) -> Result<(), ConsumerError> {
        let consumer_id = self.consumer_id;
        let started = Instant::now();
        self.stats.batches += 1;
        metrics::histogram!(BATCH_SIZE_HISTOGRAM).record(batch.len() as f64);

        self.state = LoopState::Delivering;
        let (mut handled, mut not_handled, mut failed) = (0u64, 0u64, 0u64);
        for record in batch.records() {
            match self.sink.process_message(record, consumer_id).await {
                Ok(true) => handled += 1,
                Ok(false) => not_handled += 1,
                Err(e) if e.is_recoverable() => {
                    failed += 1;
                    warn!(
                        consumer_id = consumer_id,
                        partition = record.partition(),
                        offset = record.offset(),
                        "Sink failed to process record: {e:#}"
                    );
                }
                Err(e) => {
                    metrics::counter!(BATCH_OUTCOME_COUNTER, "outcome" => e.kind()).increment(1);
                    return Err(ConsumerError::Processing {
                        consumer_id,
                        source: e,
                    });
                }
            }
        }
        self.stats.records_delivered += handled + not_handled + failed;
        metrics::counter!(RECORDS_DELIVERED_COUNTER, "result" => "handled").increment(handled);
        metrics::counter!(RECORDS_DELIVERED_COUNTER, "result" => "not_handled")
            .increment(not_handled);
        metrics::counter!(RECORDS_DELIVERED_COUNTER, "result" => "failed").increment(failed);

        self.state = LoopState::CommitDecision;
        let end_positions = batch.end_positions();
        let outcome = match self.sink.complete_poll(consumer_id, &end_positions).await {
            Ok(true) => {
                self.commit(&end_positions);
                "committed"
            }
            Ok(false) => {
                info!(
                    consumer_id = consumer_id,
                    positions = ?end_positions,
                    "Sink declined commit, batch will be redelivered"
                );
                self.rewind(&batch)?;
                "declined"
            }
            Err(e) => match e {
                ProcessingError::Recoverable(_) => {
                    warn!(
                        consumer_id = consumer_id,
                        positions = ?end_positions,
                        "Recoverable sink error, batch will be redelivered: {e:#}"
                    );
                    self.rewind(&batch)?;
                    e.kind()
                }
                ProcessingError::NonRecoverable(_) => {
                    metrics::counter!(BATCH_OUTCOME_COUNTER, "outcome" => e.kind())
                        .increment(1);
                    return Err(ConsumerError::Processing {
                        consumer_id,
                        source: e,
                    });
                }
            },
        };

        metrics::counter!(BATCH_OUTCOME_COUNTER, "outcome" => outcome).increment(1);
        metrics::histogram!(BATCH_PROCESSING_DURATION_HISTOGRAM)
            .record(started.elapsed().as_secs_f64());
        debug!(
            consumer_id = consumer_id,
            records = batch.len(),
            handled = handled,
            not_handled = not_handled,
            failed = failed,
            outcome = outcome,
            "Batch settled"
        );
        Ok(())
    }

    fn commit(&mut self, end_positions: &BTreeMap<PartitionId, i64>) {
        match self.broker.commit(end_positions) {
            Ok(()) => {
                self.stats.commits += 1;
                metrics::counter!(COMMITS_COUNTER, "result" => "success").increment(1);
                debug!(
                    consumer_id = self.consumer_id,
                    positions = ?end_positions,
                    "Committed offsets"
                );
            }
            Err(e) => {
                // Records stay uncommitted and are redelivered after the next rebalance or restart
                self.stats.failed_commits += 1;
                metrics::counter!(COMMITS_COUNTER, "result" => "failure").increment(1);
                warn!(
                    consumer_id = self.consumer_id,
                    positions = ?end_positions,
                    "Failed to commit offsets: {e:#}"
                );
            }
        }
    }

    /// Seek every partition of `batch` back to its first record.
    fn rewind(&mut self, batch: &PollBatch) -> Result<(), ConsumerError> {
        let consumer_id = self.consumer_id;
        for (partition, offset) in batch.start_positions() {
            self.broker
                .seek(partition, offset)
                .map_err(|e| ConsumerError::Seek {
                    consumer_id,
                    source: SeekError::new(partition, "rewind", e),
                })?;
        }
        self.stats.rewinds += 1;
        metrics::counter!(REWINDS_COUNTER).increment(1);
        Ok(())
    }

    fn log_final_positions(&self) {
        for partition in &self.epoch {
            match self.broker.position(*partition) {
                Ok(position) => info!(
                    consumer_id = self.consumer_id,
                    partition = partition,
                    position = ?position,
                    "Final position"
                ),
                Err(e) => debug!(
                    consumer_id = self.consumer_id,
                    partition = partition,
                    "Could not read final position: {e}"
                ),
            }
        }
    }
}
