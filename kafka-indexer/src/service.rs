use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    error::ConsumerError,
    kafka::{broker::BrokerClient, KafkaBroker},
    metrics_const::CONSUMER_HALTS_COUNTER,
    poll_loop::PollCommitLoop,
    sink::{BatchSink, LogSink},
    start_option::StartOptionMap,
};

/// Builds the sink for consumer instance `consumer_id`
pub type SinkFactory = Arc<dyn Fn(usize) -> Arc<dyn BatchSink> + Send + Sync>;

/// Runs a set of poll loops as independent tasks sharing one shutdown token.
///
/// When any instance halts or its task panics, the others are cancelled and
/// the first failure is returned, so the process exits and the supervisor
/// restarts it.
pub struct ConsumerPool<B>
where
    B: BrokerClient + 'static,
{
    loops: Vec<PollCommitLoop<B, dyn BatchSink>>,
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
}

impl<B> ConsumerPool<B>
where
    B: BrokerClient + 'static,
{
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            loops: Vec::new(),
            shutdown: CancellationToken::new(),
            shutdown_timeout,
        }
    }

    /// Add an instance. Its shutdown token is replaced by a child of the pool's.
    pub fn add(&mut self, poll_loop: PollCommitLoop<B, dyn BatchSink>) {
        let poll_loop = poll_loop.with_shutdown(self.shutdown.child_token());
        self.loops.push(poll_loop);
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Run every instance until `shutdown_signal` resolves or one of them halts.
    pub async fn run_until(
        self,
        shutdown_signal: impl Future<Output = ()>,
    ) -> Result<(), ConsumerError> {
        let mut tasks = JoinSet::new();
        for mut poll_loop in self.loops {
            tasks.spawn(async move {
                let consumer_id = poll_loop.consumer_id();
                poll_loop.run().await.map(|_| consumer_id)
            });
        }
        info!(consumers = tasks.len(), "Consumer pool started");

        tokio::pin!(shutdown_signal);
        let mut halted: Option<ConsumerError> = None;
        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Received shutdown signal, stopping consumers gracefully...");
                    break;
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok(Ok(consumer_id))) => {
                        warn!(consumer_id = consumer_id, "Consumer stopped without a shutdown request");
                    }
                    Some(Ok(Err(e))) => {
                        error!(consumer_id = ?e.consumer_id(), "Consumer halted, stopping pool: {e:#}");
                        halted = Some(e);
                        break;
                    }
                    Some(Err(e)) => {
                        let e = task_failed(e);
                        error!("Consumer task died, stopping pool: {e:#}");
                        halted = Some(e);
                        break;
                    }
                    None => {
                        info!("All consumers stopped");
                        break;
                    }
                },
            }
        }

        self.shutdown.cancel();
        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                let e = match joined {
                    Ok(Ok(consumer_id)) => {
                        info!(consumer_id = consumer_id, "Consumer stopped normally");
                        continue;
                    }
                    Ok(Err(e)) => e,
                    Err(e) => task_failed(e),
                };
                error!(consumer_id = ?e.consumer_id(), "Consumer stopped with error: {e:#}");
                halted.get_or_insert(e);
            }
        })
        .await;

        if drained.is_err() {
            error!(
                "Consumer shutdown timed out after {:?}, aborting remaining tasks",
                self.shutdown_timeout
            );
            tasks.abort_all();
        }

        match halted {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// A task that panicked never reached the halt accounting in `PollCommitLoop::run`
fn task_failed(source: JoinError) -> ConsumerError {
    let e = ConsumerError::Task { source };
    metrics::counter!(CONSUMER_HALTS_COUNTER, "reason" => e.reason()).increment(1);
    e
}

/// The indexer service: a pool of Kafka consumers feeding sinks.
pub struct IndexerService {
    config: Config,
    start_options: Arc<StartOptionMap>,
    sink_factory: SinkFactory,
}

impl IndexerService {
    pub fn new(
        config: Config,
        start_options: StartOptionMap,
        sink_factory: SinkFactory,
    ) -> Result<Self> {
        config.validate().with_context(|| {
            format!(
                "Configuration validation failed for service with consumer topic '{}' and group '{}'",
                config.kafka_consumer_topic, config.kafka_consumer_group
            )
        })?;

        Ok(Self {
            config,
            start_options: Arc::new(start_options),
            sink_factory,
        })
    }

    /// Service writing every record to the log
    pub fn with_log_sink(config: Config, start_options: StartOptionMap) -> Result<Self> {
        let log_payloads = config.sink_log_payloads;
        let factory: SinkFactory =
            Arc::new(move |_| Arc::new(LogSink::new(log_payloads)));
        Self::new(config, start_options, factory)
    }

    /// Create one subscribed Kafka consumer and poll loop per pool slot
    pub fn build_pool(&self) -> Result<ConsumerPool<KafkaBroker>> {
        let mut pool = ConsumerPool::new(self.config.shutdown_timeout());

        for consumer_id in 0..self.config.consumer_pool_count {
            let (broker, rebalances) = KafkaBroker::new(
                &self.config.to_consumer_config(consumer_id),
                consumer_id,
                &self.config.kafka_consumer_topic,
                self.config.kafka_max_poll_records,
                self.config.metadata_timeout(),
            )
            .with_context(|| {
                format!(
                    "Failed to create Kafka consumer {consumer_id} for topic '{}' with group '{}'",
                    self.config.kafka_consumer_topic, self.config.kafka_consumer_group
                )
            })?;

            let sink = (self.sink_factory)(consumer_id);
            let poll_loop = PollCommitLoop::new(
                consumer_id,
                broker,
                rebalances,
                sink,
                Arc::clone(&self.start_options),
            )
            .with_poll_timeout(self.config.poll_timeout());
            pool.add(poll_loop);
        }

        info!(
            "Initialized {} consumers for topic '{}' in group '{}'",
            pool.len(),
            self.config.kafka_consumer_topic,
            self.config.kafka_consumer_group
        );
        Ok(pool)
    }

    /// Run the service (blocking until ctrl-c or a consumer halts)
    pub async fn run(self) -> Result<()> {
        self.run_with_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for ctrl+c signal: {e:#}");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run the service with a custom shutdown signal (useful for testing)
    pub async fn run_with_shutdown(self, shutdown_signal: impl Future<Output = ()>) -> Result<()> {
        info!("Starting Kafka indexer service");
        let pool = self.build_pool()?;

        pool.run_until(shutdown_signal)
            .await
            .context("Kafka indexer service halted")?;

        info!("Kafka indexer service stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use envconfig::Envconfig;

    fn config_from(vars: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::init_from_hashmap(&env).unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = config_from(&[("CONSUMER_POOL_COUNT", "0")]);

        let result = IndexerService::with_log_sink(config, StartOptionMap::new());

        let err = result.err().unwrap();
        assert!(format!("{err:#}").contains("CONSUMER_POOL_COUNT"));
    }

    #[tokio::test]
    async fn test_build_pool_creates_one_consumer_per_slot() {
        let config = config_from(&[("CONSUMER_POOL_COUNT", "3")]);
        let service = IndexerService::with_log_sink(config, StartOptionMap::new()).unwrap();

        let pool = service.build_pool().unwrap();

        assert_eq!(pool.len(), 3);
    }
}
