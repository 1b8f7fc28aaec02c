//! Kafka indexer service.
//!
//! Consumes a topic and hands each poll's records to a [`sink::BatchSink`],
//! committing offsets only once the sink has accepted the batch.
//!
//! ## Logging errors
//!
//! Sink causes and broker errors carry chains. Log them with `{e:#}` inline or
//! `error = ?e` as a field; plain `{e}` prints only the outermost message.
//! Wrap with `.context()` rather than formatting the cause into a new message.

pub mod config;
pub mod error;
pub mod kafka;
pub mod metrics;
pub mod metrics_const;
pub mod offset_seeker;
pub mod poll_loop;
pub mod service;
pub mod sink;
pub mod start_option;

// Re-export commonly used types for convenience
pub use error::{ConsumerError, ProcessingError, SeekError, StartOptionError};
pub use poll_loop::{LoopState, PollCommitLoop};
pub use sink::BatchSink;
pub use start_option::{MissingOverridePolicy, StartFrom, StartOptionMap};
