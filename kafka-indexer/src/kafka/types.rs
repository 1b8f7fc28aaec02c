use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rdkafka::message::{BorrowedMessage, Message};

/// Partition number within the consumed topic.
pub type PartitionId = i32;

/// Sentinel partition id for start options that apply to every partition
/// without an entry of its own.
pub const ALL_PARTITIONS: PartitionId = -1;

/// An owned record pulled from one partition of the consumed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaRecord {
    topic: String,
    partition: PartitionId,
    offset: i64,

    /// Optional message key as raw bytes
    pub key: Option<Vec<u8>>,

    /// Raw payload, untouched
    pub payload: Option<Vec<u8>>,

    /// Broker or producer timestamp, when the message carried one
    pub timestamp: Option<SystemTime>,
}

impl KafkaRecord {
    pub fn new(
        topic: String,
        partition: PartitionId,
        offset: i64,
        key: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
        timestamp: Option<SystemTime>,
    ) -> Self {
        Self {
            topic,
            partition,
            offset,
            key,
            payload,
            timestamp,
        }
    }

    /// Copy a borrowed rdkafka message out of the consumer's buffer
    pub fn from_borrowed_message(msg: &BorrowedMessage<'_>) -> Self {
        let timestamp = msg
            .timestamp()
            .to_millis()
            .filter(|ms| *ms >= 0)
            .map(|ms| UNIX_EPOCH + Duration::from_millis(ms as u64));

        Self {
            topic: msg.topic().to_owned(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            payload: msg.payload().map(|p| p.to_vec()),
            timestamp,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Get the payload as a UTF-8 string if possible
    pub fn payload_as_str(&self) -> Option<Result<&str, std::str::Utf8Error>> {
        self.payload.as_ref().map(|p| std::str::from_utf8(p))
    }

    /// Get the message key as a UTF-8 string if possible
    pub fn key_as_str(&self) -> Option<Result<&str, std::str::Utf8Error>> {
        self.key.as_ref().map(|k| std::str::from_utf8(k))
    }
}

/// Records returned by a single poll, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollBatch {
    records: Vec<KafkaRecord>,
}

impl PollBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_with_size_hint(hint: usize) -> Self {
        Self {
            records: Vec::with_capacity(hint),
        }
    }

    pub fn from_records(records: Vec<KafkaRecord>) -> Self {
        Self { records }
    }

    pub fn push(&mut self, record: KafkaRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[KafkaRecord] {
        &self.records
    }

    /// Partitions touched by this batch
    pub fn partitions(&self) -> BTreeSet<PartitionId> {
        self.records.iter().map(|r| r.partition).collect()
    }

    /// Position immediately following the last record of each partition.
    ///
    /// These are the offsets committed when the sink accepts the batch.
    pub fn end_positions(&self) -> BTreeMap<PartitionId, i64> {
        let mut positions = BTreeMap::new();
        for record in &self.records {
            positions.insert(record.partition, record.offset + 1);
        }
        positions
    }

    /// Offset of the first record of each partition. Seeking here replays the
    /// batch.
    pub fn start_positions(&self) -> BTreeMap<PartitionId, i64> {
        let mut positions = BTreeMap::new();
        for record in &self.records {
            positions.entry(record.partition).or_insert(record.offset);
        }
        positions
    }

    /// Keep only the records whose partition is in `partitions`, returning how
    /// many were dropped.
    pub fn retain_partitions(&mut self, partitions: &BTreeSet<PartitionId>) -> usize {
        let before = self.records.len();
        self.records.retain(|r| partitions.contains(&r.partition));
        before - self.records.len()
    }
}
