use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::ProcessingError;
use crate::kafka::types::{KafkaRecord, PartitionId};

pub mod log;

pub use log::LogSink;

/// Downstream destination for polled records.
///
/// The poll loop calls `process_message` once per record in arrival order,
/// then `complete_poll` once per non-empty batch. Offsets advance only when
/// `complete_poll` returns `Ok(true)`, so a sink that buffers in
/// `process_message` must flush durably before approving the commit.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Stage one record. `Ok(false)` means the record was skipped (for
    /// example an empty payload); it does not affect the commit decision.
    async fn process_message(
        &self,
        record: &KafkaRecord,
        consumer_id: usize,
    ) -> Result<bool, ProcessingError>;

    /// Flush the batch and decide whether `end_positions` may be committed.
    async fn complete_poll(
        &self,
        consumer_id: usize,
        end_positions: &BTreeMap<PartitionId, i64>,
    ) -> Result<bool, ProcessingError>;
}
