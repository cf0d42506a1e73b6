//! Consumer orchestrator
//!
//! Runs the top-level lease cycle: discover shards, acquire or renew their
//! leases, keep exactly one reader per owned shard, and for the remainder of
//! each lease window drain the shared record channel into the user's
//! [`RecordHandler`], checkpointing after every delivered record.
//!
//! # Examples
//!
//! ```rust,no_run
//! use kinesis_flock::{
//!     ConsumerConfig, KinesisConsumer, ReaderMode, RecordHandler,
//!     store::InMemoryLeaseStore,
//! };
//! use aws_sdk_kinesis::types::Record;
//! use async_trait::async_trait;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl RecordHandler for Printer {
//!     async fn handle_record(&self, shard_id: &str, record: &Record) -> anyhow::Result<()> {
//!         println!("{}: {:?}", shard_id, record.data());
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
//!     let client = aws_sdk_kinesis::Client::new(&aws_config);
//!
//!     let config = ConsumerConfig {
//!         stream_name: "my-stream".to_string(),
//!         mode: ReaderMode::Pull,
//!         ..Default::default()
//!     };
//!
//!     // Stateless single-consumer mode; use DynamoDbLeaseStore to
//!     // coordinate across processes.
//!     let store = InMemoryLeaseStore::new();
//!     let (mut consumer, _errors) = KinesisConsumer::new(config, Printer, client, store);
//!
//!     let shutdown = kinesis_flock::shutdown_signal();
//!     consumer.run(shutdown).await?;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_kinesis::types::Record;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::client::{IteratorSpec, KinesisClientTrait};
use crate::error::{ConsumerError, Result};
use crate::lease::{default_consumer_group, resolve_consumer_id, LeaseManager};
use crate::reader::{
    ErrorReceiver, ErrorSender, PullShardReader, PushShardReader, ReaderHandle, RecordReceiver,
    RecordSender,
};
use crate::store::{CheckpointCondition, LeaseStore};

/// Default lease duration.
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30);
/// Default dispatch tick.
pub const DEFAULT_READ_INTERVAL: Duration = Duration::from_millis(50);
/// Default capacity of the shared record channel.
pub const DEFAULT_PUSH_LIMIT: usize = 1_000;

/// Dispatch stops this long before the lease expires so renewals always
/// happen under a live lease.
const LEASE_SAFETY_MARGIN: Duration = Duration::from_secs(1);

/// How records are read from shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderMode {
    /// Periodic get-records polling
    Pull,
    /// Enhanced fan-out subscriptions (requires a registered consumer name)
    Push,
}

/// Configuration for the consumer orchestrator
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Name of the stream to consume
    pub stream_name: String,
    /// Lease scope; defaults to the working directory's basename
    pub consumer_group: Option<String>,
    /// Pull or push readers
    pub mode: ReaderMode,
    /// Registered stream-consumer name, required for push mode
    pub consumer_name: Option<String>,
    /// How long each acquired lease lasts
    pub lock_duration: Duration,
    /// How long one dispatch tick waits for a record
    pub read_interval: Duration,
    /// Capacity of the shared record channel
    pub channel_capacity: usize,
    /// Records per get-records call (pull mode)
    pub pull_limit: Option<i32>,
    /// Sleep between fetches (pull mode)
    pub reader_sleep_time: Option<Duration>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            stream_name: String::new(),
            consumer_group: None,
            mode: ReaderMode::Pull,
            consumer_name: None,
            lock_duration: DEFAULT_LOCK_DURATION,
            read_interval: DEFAULT_READ_INTERVAL,
            channel_capacity: DEFAULT_PUSH_LIMIT,
            pull_limit: None,
            reader_sleep_time: None,
        }
    }
}

/// Trait for user record-processing callbacks
///
/// Invoked serially, in shard order, for every record any reader delivers.
/// Returning an error is fatal to the whole consumer; the failed record was
/// not checkpointed and will be redelivered after a restart.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle_record(&self, shard_id: &str, record: &Record) -> anyhow::Result<()>;
}

/// Coordinated multi-shard stream consumer
pub struct KinesisConsumer<P, C, S>
where
    P: RecordHandler + 'static,
    C: KinesisClientTrait + 'static,
    S: LeaseStore + 'static,
{
    config: ConsumerConfig,
    handler: Arc<P>,
    client: Arc<C>,
    store: Arc<S>,
    readers: HashMap<String, ReaderHandle>,
    records_tx: RecordSender,
    records_rx: RecordReceiver,
    errors_tx: ErrorSender,
}

impl<P, C, S> KinesisConsumer<P, C, S>
where
    P: RecordHandler + 'static,
    C: KinesisClientTrait + 'static,
    S: LeaseStore + 'static,
{
    /// Create a consumer.
    ///
    /// Returns the consumer and the receiving half of the error channel;
    /// reader failures accumulate there until drained (or dropped).
    pub fn new(config: ConsumerConfig, handler: P, client: C, store: S) -> (Self, ErrorReceiver) {
        let (records_tx, records_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();

        (
            Self {
                config,
                handler: Arc::new(handler),
                client: Arc::new(client),
                store: Arc::new(store),
                readers: HashMap::new(),
                records_tx,
                records_rx,
                errors_tx,
            },
            errors_rx,
        )
    }

    /// Run until the shutdown token flips.
    ///
    /// Errors from `describe_stream` / consumer registration during bootstrap
    /// and from the record handler propagate; everything else is absorbed by
    /// the lease protocol and the readers.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(stream = %self.config.stream_name, mode = ?self.config.mode, "Starting consumer");

        let result = self.run_lease_cycles(&mut shutdown).await;

        self.shutdown_readers().await;
        info!(stream = %self.config.stream_name, "Consumer shutdown complete");

        match result {
            Err(ConsumerError::Shutdown) => Ok(()),
            other => other,
        }
    }

    async fn run_lease_cycles(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let stream_info = self
            .client
            .describe_stream(&self.config.stream_name)
            .await
            .map_err(|e| {
                ConsumerError::DescribeStreamFailed(self.config.stream_name.clone(), e.to_string())
            })?;

        let consumer_group = self
            .config
            .consumer_group
            .clone()
            .unwrap_or_else(default_consumer_group);
        let consumer_id = resolve_consumer_id();
        let checkpoint_condition = match self.config.mode {
            ReaderMode::Pull => CheckpointCondition::Monotonic,
            ReaderMode::Push => CheckpointCondition::EntryExists,
        };

        info!(
            consumer_group = %consumer_group,
            consumer_id = %consumer_id,
            retention_hours = stream_info.retention_period_hours,
            "Consumer bootstrapped"
        );

        let mut lease_manager = LeaseManager::new(
            self.store.clone(),
            consumer_group,
            self.config.stream_name.clone(),
            consumer_id,
            stream_info.retention_period_hours,
            checkpoint_condition,
        );

        let consumer_arn = match self.config.mode {
            ReaderMode::Push => Some(self.ensure_stream_consumer(&stream_info.stream_arn).await?),
            ReaderMode::Pull => None,
        };

        loop {
            if *shutdown.borrow() {
                return Err(ConsumerError::Shutdown);
            }

            self.reap_dead_readers();

            let shards = match self.client.list_shards(&self.config.stream_name).await {
                Ok(shards) => shards,
                Err(err) if err.is_transient() => {
                    warn!(error = %err, "Transient error listing shards, retrying next cycle");
                    if !sleep_or_shutdown(Duration::from_secs(1), shutdown).await {
                        return Err(ConsumerError::Shutdown);
                    }
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            for shard in &shards {
                let shard_id = shard.shard_id().to_string();
                let new_expiry = Utc::now()
                    + chrono::Duration::from_std(self.config.lock_duration)
                        .unwrap_or_else(|_| chrono::Duration::seconds(30));

                match lease_manager.acquire_or_renew(&shard_id, new_expiry).await {
                    Ok(true) => {
                        if !self.readers.contains_key(&shard_id) {
                            let position = lease_manager.initial_iterator(&shard_id);
                            self.spawn_reader(&shard_id, position, consumer_arn.as_deref());
                        }
                    }
                    Ok(false) => {
                        if let Some(handle) = self.readers.remove(&shard_id) {
                            info!(shard_id = %shard_id, "Lease lost, stopping reader");
                            handle.shutdown().await;
                        }
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            self.dispatch_window(&mut lease_manager, shutdown).await?;
        }
    }

    /// Drain records into the handler for the rest of the lease window.
    async fn dispatch_window(
        &mut self,
        lease_manager: &mut LeaseManager<S>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let cycle_start = Instant::now();
        let window = self
            .config
            .lock_duration
            .saturating_sub(LEASE_SAFETY_MARGIN);

        while cycle_start.elapsed() < window {
            if *shutdown.borrow() {
                return Err(ConsumerError::Shutdown);
            }

            // Block for at most one record per tick.
            let received =
                tokio::time::timeout(self.config.read_interval, self.records_rx.recv()).await;

            let Ok(next) = received else {
                continue; // idle tick
            };
            let Some((shard_id, record)) = next else {
                // All senders gone would mean our own clone was dropped.
                debug!("Record channel drained and closed");
                continue;
            };

            let sequence = record.sequence_number().to_string();
            trace!(
                shard_id = %shard_id,
                sequence = %sequence,
                arrived_at = ?crate::client::approximate_arrival_time(&record),
                "Dispatching record"
            );

            self.handler
                .handle_record(&shard_id, &record)
                .await
                .map_err(ConsumerError::handler)?;

            if let Err(err) = lease_manager.checkpoint(&shard_id, &sequence).await {
                // Not fatal: the record reached user code. The reader is
                // recycled and the next cycle resumes from the stored
                // checkpoint.
                warn!(
                    shard_id = %shard_id,
                    sequence = %sequence,
                    error = %err,
                    "Checkpoint failed, stopping this shard's reader"
                );
                if let Some(handle) = self.readers.remove(&shard_id) {
                    handle.shutdown().await;
                }
            }
        }

        Ok(())
    }

    /// Resolve the enhanced fan-out consumer, registering it on first use.
    async fn ensure_stream_consumer(&self, stream_arn: &str) -> Result<String> {
        let consumer_name = self
            .config
            .consumer_name
            .as_deref()
            .ok_or(ConsumerError::MissingConsumerName)?;

        match self
            .client
            .describe_stream_consumer(stream_arn, consumer_name)
            .await
        {
            Ok(Some(arn)) => {
                debug!(consumer_name = %consumer_name, consumer_arn = %arn, "Found registered consumer");
                Ok(arn)
            }
            Ok(None) => {
                info!(consumer_name = %consumer_name, "Registering stream consumer");
                self.client
                    .register_stream_consumer(stream_arn, consumer_name)
                    .await
                    .map_err(|e| {
                        ConsumerError::ConsumerRegistrationFailed(
                            consumer_name.to_string(),
                            e.to_string(),
                        )
                    })
            }
            Err(err) => Err(ConsumerError::ConsumerRegistrationFailed(
                consumer_name.to_string(),
                err.to_string(),
            )),
        }
    }

    fn spawn_reader(&mut self, shard_id: &str, position: IteratorSpec, consumer_arn: Option<&str>) {
        let handle = match self.config.mode {
            ReaderMode::Pull => PullShardReader::spawn(
                self.client.clone(),
                self.config.stream_name.clone(),
                shard_id,
                position,
                self.config.reader_sleep_time,
                self.config.pull_limit,
                self.records_tx.clone(),
                self.errors_tx.clone(),
            ),
            ReaderMode::Push => {
                let Some(arn) = consumer_arn else {
                    error!(shard_id = %shard_id, "No consumer ARN for push reader");
                    return;
                };
                PushShardReader::spawn(
                    self.client.clone(),
                    arn,
                    shard_id,
                    position,
                    self.records_tx.clone(),
                    self.errors_tx.clone(),
                )
            }
        };

        info!(shard_id = %shard_id, mode = ?self.config.mode, "Started reader");
        self.readers.insert(shard_id.to_string(), handle);
    }

    fn reap_dead_readers(&mut self) {
        self.readers.retain(|shard_id, handle| {
            if handle.alive() {
                true
            } else {
                // The lease ages out on its own; the next cycle may respawn.
                info!(shard_id = %shard_id, "Reaping finished reader");
                false
            }
        });
    }

    async fn shutdown_readers(&mut self) {
        for (shard_id, handle) in self.readers.drain() {
            debug!(shard_id = %shard_id, "Stopping reader");
            handle.shutdown().await;
        }
    }

    /// Shard ids with a live reader, mostly useful for tests and diagnostics.
    pub fn active_shards(&self) -> Vec<String> {
        self.readers
            .iter()
            .filter(|(_, handle)| handle.alive())
            .map(|(shard_id, _)| shard_id.clone())
            .collect()
    }
}

async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.changed() => false,
    }
}

/// Cancellation token flipped by SIGINT or SIGTERM.
///
/// Other signals keep their default disposition. Pass the receiver to
/// [`KinesisConsumer::run`]; dropping it does not uninstall the handlers.
pub fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_termination().await;
        info!("Termination signal received, shutting down");
        let _ = tx.send(true);
    });
    rx
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(err) => {
            error!(error = %err, "Failed to install SIGINT handler");
            return std::future::pending().await;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            error!(error = %err, "Failed to install SIGTERM handler");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
