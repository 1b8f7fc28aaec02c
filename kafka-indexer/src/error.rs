use std::path::PathBuf;

use thiserror::Error;
use tokio::task::JoinError;

use crate::kafka::broker::BrokerError;
use crate::kafka::types::PartitionId;

/// Errors from resolving the consumer start option and its override file.
#[derive(Error, Debug)]
pub enum StartOptionError {
    /// The directive or the override file content is malformed.
    /// Non-fatal: the resolver degrades to the restart default.
    #[error("invalid consumer start option: {reason}")]
    Parse { reason: String },

    /// The override file exists but could not be read. Fatal at startup.
    #[error("unable to read consumer start options file '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `CUSTOM` was requested but there is no override file to read.
    #[error("custom start option requested but override file {} is unavailable", describe_path(.path))]
    MissingOverrideSource { path: Option<PathBuf> },
}

impl StartOptionError {
    pub(crate) fn parse(reason: impl Into<String>) -> Self {
        StartOptionError::Parse {
            reason: reason.into(),
        }
    }
}

fn describe_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => format!("'{}'", p.display()),
        None => "(not configured)".to_string(),
    }
}

/// Outcome classification a sink attaches to a failed batch or record.
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// Transient downstream condition. The batch is not committed and is
    /// redelivered by the next poll.
    #[error("recoverable processing error: {0:#}")]
    Recoverable(#[source] anyhow::Error),

    /// Retrying cannot help. The consumer instance halts.
    #[error("non-recoverable processing error: {0:#}")]
    NonRecoverable(#[source] anyhow::Error),
}

impl ProcessingError {
    pub fn recoverable(cause: impl Into<anyhow::Error>) -> Self {
        ProcessingError::Recoverable(cause.into())
    }

    pub fn non_recoverable(cause: impl Into<anyhow::Error>) -> Self {
        ProcessingError::NonRecoverable(cause.into())
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProcessingError::Recoverable(_))
    }

    /// Tag used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessingError::Recoverable(_) => "recoverable",
            ProcessingError::NonRecoverable(_) => "non_recoverable",
        }
    }
}

/// The broker could not position a partition.
#[derive(Error, Debug)]
#[error("failed to {step} for partition {partition}: {source}")]
pub struct SeekError {
    pub partition: PartitionId,
    pub step: &'static str,
    #[source]
    pub source: BrokerError,
}

impl SeekError {
    pub fn new(partition: PartitionId, step: &'static str, source: BrokerError) -> Self {
        Self {
            partition,
            step,
            source,
        }
    }
}

/// Why a consumer instance halted. Returned to whoever owns the loop.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("consumer {consumer_id} could not position its partitions: {source}")]
    Seek {
        consumer_id: usize,
        #[source]
        source: SeekError,
    },

    #[error("consumer {consumer_id} hit a fatal broker error: {source}")]
    Broker {
        consumer_id: usize,
        #[source]
        source: BrokerError,
    },

    #[error("consumer {consumer_id} halted by sink: {source}")]
    Processing {
        consumer_id: usize,
        #[source]
        source: ProcessingError,
    },

    #[error("consumer {consumer_id} already halted")]
    AlreadyHalted { consumer_id: usize },

    /// The instance's task panicked or was cancelled by the runtime
    #[error("consumer task failed: {source}")]
    Task {
        #[source]
        source: JoinError,
    },
}

impl ConsumerError {
    /// `None` when the instance's task died before it could report itself
    pub fn consumer_id(&self) -> Option<usize> {
        match self {
            ConsumerError::Seek { consumer_id, .. }
            | ConsumerError::Broker { consumer_id, .. }
            | ConsumerError::Processing { consumer_id, .. }
            | ConsumerError::AlreadyHalted { consumer_id } => Some(*consumer_id),
            ConsumerError::Task { .. } => None,
        }
    }

    /// Tag used for metrics and logs
    pub fn reason(&self) -> &'static str {
        match self {
            ConsumerError::Seek { .. } => "seek",
            ConsumerError::Broker { .. } => "broker",
            ConsumerError::Processing { .. } => "sink",
            ConsumerError::AlreadyHalted { .. } => "halted",
            ConsumerError::Task { source } if source.is_panic() => "panic",
            ConsumerError::Task { .. } => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::error::KafkaError;

    #[test]
    fn test_processing_error_classification() {
        let recoverable = ProcessingError::recoverable(anyhow::anyhow!("sink unavailable"));
        let fatal = ProcessingError::non_recoverable(anyhow::anyhow!("mapping conflict"));

        assert!(recoverable.is_recoverable());
        assert!(!fatal.is_recoverable());
        assert_eq!(recoverable.kind(), "recoverable");
        assert_eq!(fatal.kind(), "non_recoverable");
    }

    #[test]
    fn test_processing_error_keeps_cause_chain() {
        let cause = anyhow::anyhow!("connection refused").context("bulk request failed");
        let err = ProcessingError::recoverable(cause);

        let rendered = err.to_string();
        assert!(rendered.contains("bulk request failed"));
        assert!(rendered.contains("connection refused"));
    }

    #[test]
    fn test_start_option_error_messages_name_the_file() {
        let io = StartOptionError::Io {
            path: PathBuf::from("/etc/start.config"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(io.to_string().contains("/etc/start.config"));

        let missing = StartOptionError::MissingOverrideSource { path: None };
        assert!(missing.to_string().contains("not configured"));
    }

    #[test]
    fn test_consumer_error_reports_instance() {
        let err = ConsumerError::Seek {
            consumer_id: 3,
            source: SeekError::new(
                7,
                "seek",
                BrokerError::partition("seek", 7, KafkaError::Seek("boom".to_string())),
            ),
        };
        assert_eq!(err.consumer_id(), Some(3));
        assert_eq!(err.reason(), "seek");
        assert!(err.to_string().contains("partition 7"));
    }

    #[tokio::test]
    async fn test_panicked_task_has_no_consumer_id() {
        let join_error = tokio::spawn(async { panic!("sink bug") })
            .await
            .unwrap_err();

        let err = ConsumerError::Task { source: join_error };

        assert_eq!(err.consumer_id(), None);
        assert_eq!(err.reason(), "panic");
    }
}
