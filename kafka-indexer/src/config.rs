use std::{path::PathBuf, time::Duration};

use anyhow::{ensure, Result};
use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::kafka::config::ConsumerConfigBuilder;
use crate::start_option::MissingOverridePolicy;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "kafka-indexer")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "events")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "10000")]
    pub kafka_poll_interval_ms: u64,

    #[envconfig(default = "500")]
    pub kafka_max_poll_records: usize,

    // Watermark, committed offset, seek and commit calls
    #[envconfig(default = "5000")]
    pub kafka_metadata_timeout_ms: u64,

    #[envconfig(default = "60000")]
    pub kafka_session_timeout_ms: u32,

    #[envconfig(default = "300000")]
    pub kafka_max_poll_interval_ms: u32,

    // Start position: RESTART | EARLIEST | LATEST | CUSTOM | CUSTOM:<offset>
    #[envconfig(default = "")]
    pub consumer_start_option: String,

    // `partition=offset` lines, read when the start option is bare CUSTOM
    pub consumer_custom_start_options_file: Option<String>,

    // Refuse to start when CUSTOM has no override file
    #[envconfig(default = "false")]
    pub consumer_strict_custom_start: bool,

    #[envconfig(default = "1")]
    pub consumer_pool_count: usize,

    #[envconfig(default = "30")] // 30 seconds
    pub shutdown_timeout_secs: u64,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    // Built-in log sink
    #[envconfig(default = "false")]
    pub sink_log_payloads: bool,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Reject settings the consumer pool cannot run with
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.consumer_pool_count > 0,
            "CONSUMER_POOL_COUNT must be at least 1"
        );
        ensure!(
            self.kafka_poll_interval_ms > 0,
            "KAFKA_POLL_INTERVAL_MS must be greater than 0"
        );
        ensure!(
            self.kafka_max_poll_records > 0,
            "KAFKA_MAX_POLL_RECORDS must be greater than 0"
        );
        ensure!(
            !self.kafka_consumer_topic.trim().is_empty(),
            "KAFKA_CONSUMER_TOPIC must not be empty"
        );
        Ok(())
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get poll timeout as Duration
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_poll_interval_ms)
    }

    /// Get broker metadata call timeout as Duration
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_metadata_timeout_ms)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn start_option(&self) -> Option<&str> {
        let option = self.consumer_start_option.trim();
        (!option.is_empty()).then_some(option)
    }

    pub fn custom_start_options_path(&self) -> Option<PathBuf> {
        self.consumer_custom_start_options_file
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }

    pub fn missing_override_policy(&self) -> MissingOverridePolicy {
        MissingOverridePolicy::from_strict(self.consumer_strict_custom_start)
    }

    /// rdkafka client config for the consumer instance `consumer_id`
    pub fn to_consumer_config(&self, consumer_id: usize) -> ClientConfig {
        ConsumerConfigBuilder::new(&self.kafka_hosts, &self.kafka_consumer_group)
            .with_tls(self.kafka_tls)
            .with_client_id(&format!("{}-{}", self.kafka_consumer_group, consumer_id))
            .with_session_timeout_ms(self.kafka_session_timeout_ms)
            .with_max_poll_interval_ms(self.kafka_max_poll_interval_ms)
            .build()
    }
}
