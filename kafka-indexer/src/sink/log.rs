use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::ProcessingError;
use crate::kafka::types::{KafkaRecord, PartitionId};
use crate::metrics_const::LOG_SINK_RECORDS_COUNTER;
use crate::sink::BatchSink;

/// Sink that writes every record to the log and always approves the commit.
pub struct LogSink {
    log_payloads: bool,
    staged: AtomicUsize,
}

impl LogSink {
    pub fn new(log_payloads: bool) -> Self {
        Self {
            log_payloads,
            staged: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BatchSink for LogSink {
    async fn process_message(
        &self,
        record: &KafkaRecord,
        consumer_id: usize,
    ) -> Result<bool, ProcessingError> {
        let payload = match record.payload.as_deref() {
            Some(p) if !p.is_empty() => p,
            _ => {
                metrics::counter!(LOG_SINK_RECORDS_COUNTER, "result" => "empty").increment(1);
                debug!(
                    consumer_id = consumer_id,
                    partition = record.partition(),
                    offset = record.offset(),
                    "Skipping record with empty payload"
                );
                return Ok(false);
            }
        };

        if self.log_payloads {
            info!(
                consumer_id = consumer_id,
                partition = record.partition(),
                offset = record.offset(),
                "Payload - {}",
                String::from_utf8_lossy(payload)
            );
        } else {
            debug!(
                consumer_id = consumer_id,
                partition = record.partition(),
                offset = record.offset(),
                bytes = payload.len(),
                "Received record"
            );
        }

        self.staged.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(LOG_SINK_RECORDS_COUNTER, "result" => "logged").increment(1);
        Ok(true)
    }

    async fn complete_poll(
        &self,
        consumer_id: usize,
        end_positions: &BTreeMap<PartitionId, i64>,
    ) -> Result<bool, ProcessingError> {
        let staged = self.staged.swap(0, Ordering::Relaxed);
        info!(
            consumer_id = consumer_id,
            records = staged,
            positions = ?end_positions,
            "Batch logged"
        );
        Ok(true)
    }
}
